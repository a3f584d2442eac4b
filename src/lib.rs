//! # MSP430 Simulator
//!
//! An instruction-set simulator for the 16-bit MSP430 microcontroller.
//!
//! The core fetches words from a simulated 64 KiB address space, decodes
//! them into one of three instruction formats and executes them against
//! the register file and status flags, one instruction per tick.

pub mod cpu;
pub mod firmware;

// Re-export commonly used types
pub use cpu::{Cpu, CpuError, Flag, Instruction, Memory, Registers, Scheduler, SchedulerConfig, Tick};
pub use firmware::{load as load_firmware, FirmwareError};
