//! Instruction decoder for the MSP430.
//!
//! Every instruction starts with one 16-bit word in one of three formats:
//!
//! ```text
//! single operand   0001 00oo oBaa rrrr
//! jump             001c ccxx xxxx xxxx
//! two operand      oooo ssss dBaa rrrr
//! ```
//!
//! Indexed operands and immediates live in extension words after the
//! instruction word; those are fetched by the execution engine, not here.

use crate::cpu::registers::{CG1, CG2, CONSTANTS, PC, SP, SR};
use serde::{Serialize, Deserialize};
use std::fmt;
use thiserror::Error;

/// Operand width selected by the B/W bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Width {
    /// 16-bit operation (B/W = 0)
    Word,
    /// 8-bit operation (B/W = 1)
    Byte,
}

impl Width {
    /// Create from the B/W bit.
    pub fn from_bit(bit: u16) -> Self {
        if bit & 1 == 0 { Width::Word } else { Width::Byte }
    }

    /// Convert to the B/W bit.
    pub fn to_bit(self) -> u16 {
        match self {
            Width::Word => 0,
            Width::Byte => 1,
        }
    }

    /// All value bits for this width.
    #[inline]
    pub fn mask(self) -> u16 {
        match self {
            Width::Word => 0xFFFF,
            Width::Byte => 0x00FF,
        }
    }

    /// The sign bit for this width.
    #[inline]
    pub fn sign_bit(self) -> u16 {
        match self {
            Width::Word => 0x8000,
            Width::Byte => 0x0080,
        }
    }
}

/// Addressing mode, selected by a 2-bit field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressingMode {
    /// `Rn`
    Register = 0,
    /// `x(Rn)`: offset word follows the instruction
    Indexed = 1,
    /// `@Rn`
    IndirectRegister = 2,
    /// `@Rn+`: register advances after use
    IndirectAutoincrement = 3,
}

impl AddressingMode {
    /// Create from the low two bits of `bits`.
    pub fn from_bits(bits: u16) -> Self {
        match bits & 0x03 {
            0 => AddressingMode::Register,
            1 => AddressingMode::Indexed,
            2 => AddressingMode::IndirectRegister,
            _ => AddressingMode::IndirectAutoincrement,
        }
    }

    /// Convert to the 2-bit field value.
    pub fn to_bits(self) -> u16 {
        self as u16
    }
}

/// The three instruction shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Format {
    SingleOperand,
    Jump,
    TwoOperand,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::SingleOperand => f.write_str("single-operand"),
            Format::Jump => f.write_str("jump"),
            Format::TwoOperand => f.write_str("two-operand"),
        }
    }
}

/// A fetched instruction word together with its format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    /// The raw instruction word.
    pub code: u16,
    /// Which of the three shapes it encodes.
    pub format: Format,
}

impl Instruction {
    /// Classify a raw word.
    ///
    /// The single-operand pattern has to be tested first: it is a subset
    /// of the words that would otherwise fall through to two-operand.
    pub fn classify(code: u16) -> Self {
        let format = if code >> 10 == 0x04 {
            Format::SingleOperand
        } else if code >> 13 == 0x01 {
            Format::Jump
        } else {
            Format::TwoOperand
        };

        Self { code, format }
    }

    /// Extract the fields and opcode.
    pub fn decode(&self) -> Result<Operation, DecodeError> {
        let code = self.code;
        match self.format {
            Format::SingleOperand => {
                let opcode = (code >> 7) & 0x07;
                let op = SingleOp::from_opcode(opcode)
                    .ok_or(DecodeError::UnknownOpcode { format: self.format, opcode, code })?;
                Ok(Operation::Single {
                    op,
                    mode: AddressingMode::from_bits(code >> 4),
                    reg: (code & 0x0F) as u8,
                    width: Width::from_bit(code >> 6),
                })
            }
            Format::Jump => {
                let opcode = (code >> 10) & 0x07;
                let condition = Condition::from_opcode(opcode)
                    .ok_or(DecodeError::UnknownOpcode { format: self.format, opcode, code })?;
                Ok(Operation::Jump {
                    condition,
                    offset: sign_extend_10(code & 0x03FF),
                })
            }
            Format::TwoOperand => {
                let opcode = (code >> 12) & 0x0F;
                let op = TwoOp::from_opcode(opcode)
                    .ok_or(DecodeError::UnknownOpcode { format: self.format, opcode, code })?;
                Ok(Operation::Two {
                    op,
                    src: ((code >> 8) & 0x0F) as u8,
                    src_mode: AddressingMode::from_bits(code >> 4),
                    dst: (code & 0x0F) as u8,
                    dst_indexed: (code >> 7) & 0x01 == 1,
                    width: Width::from_bit(code >> 6),
                })
            }
        }
    }
}

/// Sign-extend a 10-bit jump displacement.
fn sign_extend_10(bits: u16) -> i16 {
    ((bits << 6) as i16) >> 6
}

/// Single-operand opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SingleOp {
    /// Rotate right through carry
    Rrc = 0,
    /// Swap bytes
    Swpb = 1,
    /// Rotate right arithmetically
    Rra = 2,
    /// Sign-extend byte to word
    Sxt = 3,
    Push = 4,
    Call = 5,
    /// Return from interrupt
    Reti = 6,
}

impl SingleOp {
    fn from_opcode(opcode: u16) -> Option<Self> {
        Some(match opcode {
            0 => SingleOp::Rrc,
            1 => SingleOp::Swpb,
            2 => SingleOp::Rra,
            3 => SingleOp::Sxt,
            4 => SingleOp::Push,
            5 => SingleOp::Call,
            6 => SingleOp::Reti,
            _ => return None,
        })
    }

    /// Assembly mnemonic.
    pub fn mnemonic(self) -> &'static str {
        match self {
            SingleOp::Rrc => "rrc",
            SingleOp::Swpb => "swpb",
            SingleOp::Rra => "rra",
            SingleOp::Sxt => "sxt",
            SingleOp::Push => "push",
            SingleOp::Call => "call",
            SingleOp::Reti => "reti",
        }
    }
}

/// Two-operand opcodes (top four bits of the word).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TwoOp {
    Mov = 0x4,
    Add = 0x5,
    /// Add with carry
    Addc = 0x6,
    /// Subtract with carry
    Subc = 0x7,
    Sub = 0x8,
    Cmp = 0x9,
    /// Decimal add
    Dadd = 0xA,
    /// Bit test
    Bit = 0xB,
    /// Bit clear
    Bic = 0xC,
    /// Bit set
    Bis = 0xD,
    Xor = 0xE,
    And = 0xF,
}

impl TwoOp {
    fn from_opcode(opcode: u16) -> Option<Self> {
        Some(match opcode {
            0x4 => TwoOp::Mov,
            0x5 => TwoOp::Add,
            0x6 => TwoOp::Addc,
            0x7 => TwoOp::Subc,
            0x8 => TwoOp::Sub,
            0x9 => TwoOp::Cmp,
            0xA => TwoOp::Dadd,
            0xB => TwoOp::Bit,
            0xC => TwoOp::Bic,
            0xD => TwoOp::Bis,
            0xE => TwoOp::Xor,
            0xF => TwoOp::And,
            _ => return None,
        })
    }

    /// Assembly mnemonic.
    pub fn mnemonic(self) -> &'static str {
        match self {
            TwoOp::Mov => "mov",
            TwoOp::Add => "add",
            TwoOp::Addc => "addc",
            TwoOp::Subc => "subc",
            TwoOp::Sub => "sub",
            TwoOp::Cmp => "cmp",
            TwoOp::Dadd => "dadd",
            TwoOp::Bit => "bit",
            TwoOp::Bic => "bic",
            TwoOp::Bis => "bis",
            TwoOp::Xor => "xor",
            TwoOp::And => "and",
        }
    }
}

/// Jump conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Condition {
    /// Z = 0
    NotZero = 0,
    /// Z = 1
    Zero = 1,
    /// C = 0
    NoCarry = 2,
    /// C = 1
    Carry = 3,
    /// N = 1
    Negative = 4,
    /// N xor V = 0
    GreaterEqual = 5,
    /// N xor V = 1
    Less = 6,
    Always = 7,
}

impl Condition {
    fn from_opcode(opcode: u16) -> Option<Self> {
        Some(match opcode {
            0 => Condition::NotZero,
            1 => Condition::Zero,
            2 => Condition::NoCarry,
            3 => Condition::Carry,
            4 => Condition::Negative,
            5 => Condition::GreaterEqual,
            6 => Condition::Less,
            7 => Condition::Always,
            _ => return None,
        })
    }

    /// Assembly mnemonic.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Condition::NotZero => "jnz",
            Condition::Zero => "jz",
            Condition::NoCarry => "jnc",
            Condition::Carry => "jc",
            Condition::Negative => "jn",
            Condition::GreaterEqual => "jge",
            Condition::Less => "jl",
            Condition::Always => "jmp",
        }
    }
}

/// A fully decoded instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Single {
        op: SingleOp,
        mode: AddressingMode,
        reg: u8,
        width: Width,
    },
    Jump {
        condition: Condition,
        /// Displacement in words, relative to the word after the jump.
        offset: i16,
    },
    Two {
        op: TwoOp,
        src: u8,
        src_mode: AddressingMode,
        dst: u8,
        /// `true` for `x(Rn)` destinations, `false` for `Rn`.
        dst_indexed: bool,
        width: Width,
    },
}

impl Operation {
    /// Encode back to an instruction word. Extension words are not included.
    pub fn encode(&self) -> u16 {
        match *self {
            Operation::Single { op, mode, reg, width } => {
                0x1000
                    | (op as u16) << 7
                    | width.to_bit() << 6
                    | mode.to_bits() << 4
                    | (reg as u16 & 0x0F)
            }
            Operation::Jump { condition, offset } => {
                0x2000 | (condition as u16) << 10 | (offset as u16 & 0x03FF)
            }
            Operation::Two { op, src, src_mode, dst, dst_indexed, width } => {
                (op as u16) << 12
                    | (src as u16 & 0x0F) << 8
                    | (dst_indexed as u16) << 7
                    | width.to_bit() << 6
                    | src_mode.to_bits() << 4
                    | (dst as u16 & 0x0F)
            }
        }
    }

    /// Number of extension words that follow the instruction word.
    pub fn extension_words(&self) -> u16 {
        match *self {
            Operation::Single { mode, reg, .. } => source_extension(reg, mode),
            Operation::Jump { .. } => 0,
            Operation::Two { src, src_mode, dst_indexed, .. } => {
                source_extension(src, src_mode) + dst_indexed as u16
            }
        }
    }
}

fn source_extension(reg: u8, mode: AddressingMode) -> u16 {
    match mode {
        AddressingMode::Indexed => (reg != CG2) as u16,
        AddressingMode::IndirectAutoincrement => (reg == PC) as u16,
        _ => 0,
    }
}

/// Encode an operation to its instruction word.
pub fn encode(op: &Operation) -> u16 {
    op.encode()
}

fn register_name(reg: u8) -> String {
    match reg {
        PC => "pc".into(),
        SP => "sp".into(),
        SR => "sr".into(),
        r => format!("r{}", r),
    }
}

fn width_suffix(width: Width) -> &'static str {
    match width {
        Width::Word => "",
        Width::Byte => ".b",
    }
}

/// Render a source-style operand. Extension words are shown symbolically.
fn source_operand(reg: u8, mode: AddressingMode) -> String {
    if reg == CG2 || (reg == CG1 && matches!(mode, AddressingMode::IndirectRegister | AddressingMode::IndirectAutoincrement)) {
        let value = CONSTANTS[(reg - CG1) as usize][mode as usize];
        return format!("#{}", value as i16);
    }

    let name = register_name(reg);
    match mode {
        AddressingMode::Register => name,
        AddressingMode::Indexed if reg == SR => "&x".into(),
        AddressingMode::Indexed => format!("x({})", name),
        AddressingMode::IndirectRegister => format!("@{}", name),
        AddressingMode::IndirectAutoincrement if reg == PC => "#imm".into(),
        AddressingMode::IndirectAutoincrement => format!("@{}+", name),
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Operation::Single { op, mode, reg, width } => {
                write!(f, "{}{} {}", op.mnemonic(), width_suffix(width), source_operand(reg, mode))
            }
            Operation::Jump { condition, offset } => {
                let bytes = offset as i32 * 2 + 2;
                if bytes < 0 {
                    write!(f, "{} $-{}", condition.mnemonic(), -bytes)
                } else {
                    write!(f, "{} $+{}", condition.mnemonic(), bytes)
                }
            }
            Operation::Two { op, src, src_mode, dst, dst_indexed, width } => {
                let dst_text = match (dst_indexed, dst) {
                    (false, _) => register_name(dst),
                    (true, SR) => "&x".into(),
                    (true, _) => format!("x({})", register_name(dst)),
                };
                write!(
                    f,
                    "{}{} {}, {}",
                    op.mnemonic(),
                    width_suffix(width),
                    source_operand(src, src_mode),
                    dst_text
                )
            }
        }
    }
}

/// Errors that can occur during instruction decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown {format} opcode 0x{opcode:X} in word 0x{code:04X}")]
    UnknownOpcode { format: Format, opcode: u16, code: u16 },
}
