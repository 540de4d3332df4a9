use crate::platform::Platform;
use anyhow::{Result, anyhow};
use log::info;
use tokio::sync::broadcast;

/// Flash size reported by the host platform.
pub const FLASH_SIZE: u32 = 4 * 1024 * 1024;

/// Platform whose restart request is answered by the run loop, which
/// rebuilds the provisioner from the persisted flash image.
pub struct HostPlatform {
    restart: broadcast::Sender<()>,
}

impl HostPlatform {
    pub fn new(restart: broadcast::Sender<()>) -> Self {
        Self { restart }
    }
}

impl Platform for HostPlatform {
    fn restart(&mut self) -> Result<()> {
        info!("device restart requested");
        self.restart
            .send(())
            .map(|_| ())
            .map_err(|_| anyhow!("no restart receiver"))
    }

    fn flash_size(&self) -> u32 {
        FLASH_SIZE
    }
}
