//! MSP430 memory subsystem.
//!
//! The whole 64 KiB address space is a flat array of bytes. Words are
//! stored little-endian, and firmware images are loaded flush against the
//! top of the space so that the reset vector lands at `0xFFFE`.

use crate::cpu::decode::Width;
use serde::{Serialize, Deserialize};
use thiserror::Error;

/// The number of addressable bytes.
pub const MEMORY_SIZE: usize = 0x1_0000;

/// Flat, byte-addressable memory.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memory {
    data: Vec<u8>,
}

impl Memory {
    /// Create a new memory with every byte zeroed.
    pub fn new() -> Self {
        Self {
            data: vec![0; MEMORY_SIZE],
        }
    }

    /// Read a byte.
    #[inline]
    pub fn read_byte(&self, addr: u16) -> u8 {
        self.data[addr as usize]
    }

    /// Read a little-endian word.
    ///
    /// A word read at `0xFFFF` wraps around and takes its high byte from `0x0000`.
    #[inline]
    pub fn read_word(&self, addr: u16) -> u16 {
        let low = self.read_byte(addr);
        let high = self.read_byte(addr.wrapping_add(1));
        u16::from_le_bytes([low, high])
    }

    /// Read a word or a zero-extended byte.
    pub fn read(&self, addr: u16, width: Width) -> u16 {
        match width {
            Width::Word => self.read_word(addr),
            Width::Byte => self.read_byte(addr) as u16,
        }
    }

    /// Write a byte.
    #[inline]
    pub fn write_byte(&mut self, addr: u16, value: u8) {
        self.data[addr as usize] = value;
    }

    /// Write a little-endian word, wrapping at the top of the space like [`Memory::read_word`].
    #[inline]
    pub fn write_word(&mut self, addr: u16, value: u16) {
        let [low, high] = value.to_le_bytes();
        self.write_byte(addr, low);
        self.write_byte(addr.wrapping_add(1), high);
    }

    /// Write a full word, or only the low byte of `value` in byte mode.
    pub fn write(&mut self, value: u16, addr: u16, width: Width) {
        match width {
            Width::Word => self.write_word(addr, value),
            Width::Byte => self.write_byte(addr, value as u8),
        }
    }

    /// Copy a firmware image so that its last byte lands at `0xFFFF`.
    ///
    /// Bytes below the image are left untouched.
    pub fn load_image(&mut self, image: &[u8]) -> Result<(), MemoryError> {
        if image.len() > MEMORY_SIZE {
            return Err(MemoryError::ImageTooLarge {
                size: image.len(),
                available: MEMORY_SIZE,
            });
        }

        let start = MEMORY_SIZE - image.len();
        self.data[start..].copy_from_slice(image);
        Ok(())
    }

    /// Clear all memory to zeros.
    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    /// Dump a range of words (for debugging). Stops at the end of the space.
    pub fn dump(&self, start: u16, count: usize) -> Vec<(u16, u16)> {
        (0..count)
            .map(|i| start as usize + i * 2)
            .take_while(|&addr| addr + 1 < MEMORY_SIZE)
            .map(|addr| (addr as u16, self.read_word(addr as u16)))
            .collect()
    }

    /// Raw view of the whole address space.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Only count non-zero bytes
        let non_zero = self.data.iter().filter(|&&b| b != 0).count();

        f.debug_struct("Memory")
            .field("non_zero_bytes", &non_zero)
            .field("total_bytes", &MEMORY_SIZE)
            .finish()
    }
}

/// Errors that can occur during memory operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// Firmware image does not fit in the address space.
    #[error("image size {size} exceeds available space {available}")]
    ImageTooLarge { size: usize, available: usize },
}
