//! Firmware images.
//!
//! A firmware image is a raw binary dump of the top of the address space,
//! ending with the interrupt vector table. It is loaded so that its last
//! byte lands at `0xFFFF`.

use crate::cpu::memory::{Memory, MemoryError, MEMORY_SIZE};
use std::path::Path;
use thiserror::Error;

/// Read a firmware image from disk.
pub fn read_image<P: AsRef<Path>>(path: P) -> Result<Vec<u8>, FirmwareError> {
    let image = std::fs::read(path.as_ref())?;

    if image.is_empty() {
        return Err(FirmwareError::Empty);
    }
    if image.len() > MEMORY_SIZE {
        return Err(MemoryError::ImageTooLarge { size: image.len(), available: MEMORY_SIZE }.into());
    }

    Ok(image)
}

/// Read a firmware image and copy it into the top of `mem`.
///
/// Returns the image size in bytes.
pub fn load<P: AsRef<Path>>(path: P, mem: &mut Memory) -> Result<usize, FirmwareError> {
    let image = read_image(path)?;
    mem.load_image(&image)?;
    Ok(image.len())
}

/// Errors that can occur while loading firmware.
#[derive(Debug, Error)]
pub enum FirmwareError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("firmware image is empty")]
    Empty,

    #[error(transparent)]
    Memory(#[from] MemoryError),
}
