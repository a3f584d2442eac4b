//! MSP430 CPU registers.
//!
//! The MSP430 has sixteen 16-bit registers:
//! - R0: program counter (PC)
//! - R1: stack pointer (SP)
//! - R2: status register (SR), doubles as constant generator CG1
//! - R3: constant generator CG2
//! - R4-R15: general purpose

use crate::cpu::decode::{AddressingMode, Width};
use serde::{Serialize, Deserialize};

/// Program counter.
pub const PC: u8 = 0;
/// Stack pointer.
pub const SP: u8 = 1;
/// Status register.
pub const SR: u8 = 2;
/// Constant generator 1 (shares R2 with the status register).
pub const CG1: u8 = 2;
/// Constant generator 2.
pub const CG2: u8 = 3;

/// Number of registers in the register file.
pub const REGISTER_COUNT: usize = 16;

/// Constant generator table, indexed by `[register - CG1][addressing mode]`.
pub const CONSTANTS: [[u16; 4]; 2] = [
    [0, 0, 4, 8],
    [0, 1, 2, 0xFFFF],
];

/// A status flag held in the status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Flag {
    /// Carry (bit 0)
    Carry,
    /// Zero (bit 1)
    Zero,
    /// Negative (bit 2)
    Negative,
    /// Overflow (bit 8)
    Overflow,
}

impl Flag {
    /// All flags, in bit order.
    pub const ALL: [Flag; 4] = [Flag::Carry, Flag::Zero, Flag::Negative, Flag::Overflow];

    /// The flag's bit within the status register.
    pub const fn mask(self) -> u16 {
        match self {
            Flag::Carry => 0x0001,
            Flag::Zero => 0x0002,
            Flag::Negative => 0x0004,
            Flag::Overflow => 0x0100,
        }
    }
}

/// A single 16-bit register.
#[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Register(u16);

impl Register {
    /// Create a register holding `value`.
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    /// Current contents.
    #[inline]
    pub fn value(&self) -> u16 {
        self.0
    }

    /// Overwrite the contents.
    #[inline]
    pub fn set(&mut self, value: u16) {
        self.0 = value;
    }

    /// Add a signed offset, wrapping modulo 2^16.
    #[inline]
    pub fn increment_by(&mut self, offset: i16) {
        self.0 = self.0.wrapping_add(offset as u16);
    }

    // Status register accessors. They only ever touch their own bit.

    /// Read a flag bit.
    pub fn flag(&self, flag: Flag) -> bool {
        self.0 & flag.mask() != 0
    }

    /// Set or clear a flag bit, leaving every other bit alone.
    pub fn set_flag(&mut self, flag: Flag, on: bool) {
        if on {
            self.0 |= flag.mask();
        } else {
            self.0 &= !flag.mask();
        }
    }
}

impl std::fmt::Debug for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// The MSP430 register file.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Registers {
    regs: [Register; REGISTER_COUNT],
}

impl Registers {
    /// Create a new register file with all values zeroed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset all registers to zero.
    pub fn reset(&mut self) {
        self.regs = [Register::default(); REGISTER_COUNT];
    }

    /// Raw contents of a register, never substituting a constant.
    #[inline]
    pub fn get(&self, reg: u8) -> u16 {
        self.regs[reg as usize & 0x0F].value()
    }

    /// Read a register as an operand source.
    ///
    /// CG1 with any mode other than register mode, and CG2 with any mode,
    /// yield a constant from [`CONSTANTS`] instead of the stored bits.
    pub fn read(&self, reg: u8, mode: AddressingMode) -> u16 {
        let reg = reg & 0x0F;
        if (reg == CG1 && mode != AddressingMode::Register) || reg == CG2 {
            CONSTANTS[(reg - CG1) as usize][mode as usize]
        } else {
            self.get(reg)
        }
    }

    /// Write a register directly. Constants are never written back.
    #[inline]
    pub fn write(&mut self, reg: u8, value: u16) {
        self.regs[reg as usize & 0x0F].set(value);
    }

    /// Add a signed offset to a register.
    pub fn increment(&mut self, reg: u8, offset: i16) {
        self.regs[reg as usize & 0x0F].increment_by(offset);
    }

    /// Borrow a register.
    pub fn register(&self, reg: u8) -> &Register {
        &self.regs[reg as usize & 0x0F]
    }

    /// Mutably borrow a register.
    pub fn register_mut(&mut self, reg: u8) -> &mut Register {
        &mut self.regs[reg as usize & 0x0F]
    }

    /// Program counter.
    #[inline]
    pub fn pc(&self) -> u16 {
        self.get(PC)
    }

    /// Set the program counter.
    #[inline]
    pub fn set_pc(&mut self, addr: u16) {
        self.write(PC, addr);
    }

    /// Stack pointer.
    #[inline]
    pub fn sp(&self) -> u16 {
        self.get(SP)
    }

    /// Status register value.
    #[inline]
    pub fn sr(&self) -> u16 {
        self.get(SR)
    }

    /// Read a status flag.
    pub fn flag(&self, flag: Flag) -> bool {
        self.register(SR).flag(flag)
    }

    /// Set or clear a status flag.
    pub fn set_flag(&mut self, flag: Flag, on: bool) {
        self.register_mut(SR).set_flag(flag, on);
    }

    /// Set Z and N from a result. V and C are left to the individual opcode.
    pub fn update_zn(&mut self, value: u16, width: Width) {
        self.set_flag(Flag::Zero, value & width.mask() == 0);
        self.set_flag(Flag::Negative, value & width.sign_bit() != 0);
    }
}

impl std::fmt::Display for Registers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PC: {:X} | SP: {:X} | SR: {:016b} |", self.pc(), self.sp(), self.sr())?;
        for reg in 4..REGISTER_COUNT as u8 {
            write!(f, " R{}: 0x{:X} |", reg, self.get(reg))?;
        }
        Ok(())
    }
}
