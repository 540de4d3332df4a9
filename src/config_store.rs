//! Fixed-size sector key/value persistence.
//!
//! A [`ConfigStore`] hands out a small number of slots, each mapped onto one
//! flash sector. A slot must be initialized with its record size before it
//! can be read or written. Writes erase the whole sector first.

use anyhow::{Context, Result};
use log::debug;
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Size of one flash sector in bytes.
pub const SECTOR_SIZE: usize = 4096;
/// First sector used for configuration slots.
pub const START_SECTOR: u16 = 0xC;
/// Number of configuration slots.
pub const SLOT_COUNT: u8 = 2;

/// Value of erased flash.
const ERASED: u8 = 0xFF;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unsupported config slot {0}")]
    UnsupportedSlot(u8),
    #[error("config slot {0} not initialized")]
    NotInitialized(u8),
    #[error("record of {size} bytes does not fit slot {slot}")]
    TooLarge { slot: u8, size: usize },
    #[error("flash operation on slot {slot} failed")]
    Io {
        slot: u8,
        #[source]
        source: anyhow::Error,
    },
}

/// Raw flash sector access.
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait SectorStore {
    fn read_sector(&mut self, sector: u16, buf: &mut [u8]) -> Result<()>;
    fn erase_sector(&mut self, sector: u16) -> Result<()>;
    fn write_sector(&mut self, sector: u16, data: &[u8]) -> Result<()>;
}

/// Slot-indexed configuration storage on top of a [`SectorStore`].
#[derive(Debug)]
pub struct ConfigStore<S> {
    sectors: S,
    sizes: [Option<usize>; SLOT_COUNT as usize],
}

impl<S: SectorStore> ConfigStore<S> {
    pub fn new(sectors: S) -> Self {
        Self {
            sectors,
            sizes: [None; SLOT_COUNT as usize],
        }
    }

    /// Bind `slot` to records of `size` bytes. Re-initializing is allowed.
    pub fn init(&mut self, slot: u8, size: usize) -> Result<(), StoreError> {
        let index = Self::index(slot)?;
        if size > SECTOR_SIZE {
            return Err(StoreError::TooLarge { slot, size });
        }
        self.sizes[index] = Some(size);
        Ok(())
    }

    /// Read the bound record of `slot`.
    pub fn read(&mut self, slot: u8) -> Result<Vec<u8>, StoreError> {
        let size = self.size(slot)?;
        let mut buf = vec![0; size];
        self.sectors
            .read_sector(Self::sector(slot), &mut buf)
            .map_err(|source| StoreError::Io { slot, source })?;
        Ok(buf)
    }

    /// Erase the sector of `slot` and write `data` to it.
    pub fn write(&mut self, slot: u8, data: &[u8]) -> Result<(), StoreError> {
        let size = self.size(slot)?;
        if data.len() > size {
            return Err(StoreError::TooLarge {
                slot,
                size: data.len(),
            });
        }

        let sector = Self::sector(slot);
        debug!("write {} bytes to slot {slot} (sector {sector:#x})", data.len());

        self.sectors
            .erase_sector(sector)
            .and_then(|()| self.sectors.write_sector(sector, data))
            .map_err(|source| StoreError::Io { slot, source })
    }

    pub fn sectors(&self) -> &S {
        &self.sectors
    }

    pub fn into_inner(self) -> S {
        self.sectors
    }

    fn index(slot: u8) -> Result<usize, StoreError> {
        if slot >= SLOT_COUNT {
            return Err(StoreError::UnsupportedSlot(slot));
        }
        Ok(usize::from(slot))
    }

    fn size(&self, slot: u8) -> Result<usize, StoreError> {
        self.sizes[Self::index(slot)?].ok_or(StoreError::NotInitialized(slot))
    }

    fn sector(slot: u8) -> u16 {
        START_SECTOR + u16::from(slot)
    }
}

/// Sectors kept in memory. Starts fully erased.
#[derive(Clone, Debug, Default)]
pub struct MemorySectorStore {
    sectors: std::collections::BTreeMap<u16, Vec<u8>>,
}

impl MemorySectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sector(&self, sector: u16) -> Option<&[u8]> {
        self.sectors.get(&sector).map(Vec::as_slice)
    }

    fn buf(&mut self, sector: u16) -> &mut Vec<u8> {
        self.sectors
            .entry(sector)
            .or_insert_with(|| vec![ERASED; SECTOR_SIZE])
    }
}

impl SectorStore for MemorySectorStore {
    fn read_sector(&mut self, sector: u16, buf: &mut [u8]) -> Result<()> {
        anyhow::ensure!(buf.len() <= SECTOR_SIZE, "read beyond sector end");
        let data = self.buf(sector);
        buf.copy_from_slice(&data[..buf.len()]);
        Ok(())
    }

    fn erase_sector(&mut self, sector: u16) -> Result<()> {
        self.buf(sector).fill(ERASED);
        Ok(())
    }

    fn write_sector(&mut self, sector: u16, data: &[u8]) -> Result<()> {
        anyhow::ensure!(data.len() <= SECTOR_SIZE, "write beyond sector end");
        self.buf(sector)[..data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// Sectors emulated by a flash image file, addressed at `sector * SECTOR_SIZE`.
#[derive(Debug)]
pub struct FileSectorStore {
    path: PathBuf,
}

impl FileSectorStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context(format!("failed to create {dir:?}"))?;
        }

        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .context(format!("failed to open flash image {path:?}"))?;

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&self) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .context(format!("failed to open flash image {:?}", self.path))
    }

    fn offset(sector: u16) -> u64 {
        u64::from(sector) * SECTOR_SIZE as u64
    }
}

impl SectorStore for FileSectorStore {
    fn read_sector(&mut self, sector: u16, buf: &mut [u8]) -> Result<()> {
        anyhow::ensure!(buf.len() <= SECTOR_SIZE, "read beyond sector end");

        let mut file = self.file()?;
        let len = file.metadata().context("failed to stat flash image")?.len();

        // never written sectors read back as erased flash
        buf.fill(ERASED);
        let offset = Self::offset(sector);
        if offset >= len {
            return Ok(());
        }

        file.seek(SeekFrom::Start(offset))
            .context("failed to seek flash image")?;
        let available = usize::try_from(len - offset).unwrap_or(usize::MAX).min(buf.len());
        file.read_exact(&mut buf[..available])
            .context(format!("failed to read sector {sector:#x}"))
    }

    fn erase_sector(&mut self, sector: u16) -> Result<()> {
        let mut file = self.file()?;
        file.seek(SeekFrom::Start(Self::offset(sector)))
            .context("failed to seek flash image")?;
        file.write_all(&[ERASED; SECTOR_SIZE])
            .context(format!("failed to erase sector {sector:#x}"))
    }

    fn write_sector(&mut self, sector: u16, data: &[u8]) -> Result<()> {
        anyhow::ensure!(data.len() <= SECTOR_SIZE, "write beyond sector end");

        let mut file = self.file()?;
        file.seek(SeekFrom::Start(Self::offset(sector)))
            .context("failed to seek flash image")?;
        file.write_all(data)
            .context(format!("failed to write sector {sector:#x}"))?;
        file.sync_data().context("failed to sync flash image")
    }
}
