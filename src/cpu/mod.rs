//! CPU emulation for the MSP430.
//!
//! This module implements the 16-bit MSP430 core:
//! - 64 KiB byte-addressable memory
//! - 16 registers: PC, SP, SR/CG1, CG2, R4-R15
//! - single-operand, jump and two-operand instruction formats
//! - a tick scheduler with breakpoints and observers

pub mod memory;
pub mod registers;
pub mod decode;
pub mod execute;
pub mod scheduler;

pub use memory::{Memory, MemoryError};
pub use registers::{Flag, Register, Registers};
pub use decode::{AddressingMode, DecodeError, Format, Instruction, Operation, Width};
pub use execute::{Cpu, CpuError, Operand};
pub use scheduler::{DebugMode, Scheduler, SchedulerConfig, Tick};
