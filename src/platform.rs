use anyhow::Result;
#[cfg(any(test, feature = "mock"))]
use mockall::automock;

/// Device level actions outside the radio.
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait Platform {
    /// Request a full device restart. Returns once the request is queued.
    fn restart(&mut self) -> Result<()>;

    /// Size of the flash chip in bytes.
    fn flash_size(&self) -> u32;
}
