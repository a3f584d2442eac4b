//! CPU execution engine for the MSP430.
//!
//! Implements the fetch-decode-execute cycle and all instruction behaviors.

use crate::cpu::{Memory, Registers};
use crate::cpu::decode::{
    AddressingMode, Condition, DecodeError, Instruction, Operation, SingleOp, TwoOp, Width,
};
use crate::cpu::registers::{Flag, CG1, CG2, PC, SP, SR};
use crate::firmware;
use serde::{Serialize, Deserialize};
use std::path::Path;
use thiserror::Error;

/// Address of the reset vector.
pub const RESET_VECTOR: u16 = 0xFFFE;

/// Initial stack pointer: 2 KiB of RAM starting at 0x0200.
pub const STACK_TOP: u16 = 0x0200 + 0x0800;

/// Where an operand lives once its addressing mode has been resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// Contents of a register.
    Register(u8),
    /// A constant-generator value. Writes to it are discarded.
    Constant(u16),
    /// A memory location.
    Memory(u16),
}

/// The MSP430 CPU: register file plus address space.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cpu {
    /// CPU registers.
    pub regs: Registers,
    /// Main memory.
    pub mem: Memory,
}

impl Cpu {
    /// Create a new CPU with zeroed state.
    pub fn new() -> Self {
        Self {
            regs: Registers::new(),
            mem: Memory::new(),
        }
    }

    /// Reset the CPU to zeroed state.
    pub fn reset(&mut self) {
        self.regs.reset();
        self.mem.clear();
    }

    /// Load PC from the reset vector and SP with the top of the stack.
    pub fn init(&mut self) {
        let entry = self.mem.read_word(RESET_VECTOR);
        self.regs.set_pc(entry);
        self.regs.write(SP, STACK_TOP);
    }

    /// Load a firmware image from disk into the top of memory.
    ///
    /// Returns `false` if the file could not be read or does not fit.
    pub fn load_flash_from_path<P: AsRef<Path>>(&mut self, path: P) -> bool {
        let path = path.as_ref();
        match firmware::load(path, &mut self.mem) {
            Ok(size) => {
                log::debug!("loaded {} bytes of firmware from {}", size, path.display());
                true
            }
            Err(e) => {
                log::warn!("failed to load firmware {}: {}", path.display(), e);
                false
            }
        }
    }

    /// Fetch and classify the word at PC, then execute it.
    ///
    /// Returns the instruction that was executed, or the fault that stopped it.
    pub fn step(&mut self) -> Result<Instruction, CpuError> {
        let instr = Instruction::classify(self.mem.read_word(self.regs.pc()));
        self.execute(instr)?;
        Ok(instr)
    }

    /// Execute one classified instruction.
    ///
    /// PC is moved past the instruction word before anything else, so a
    /// faulting instruction leaves PC at its start + 2.
    pub fn execute(&mut self, instr: Instruction) -> Result<(), CpuError> {
        self.regs.increment(PC, 2);

        match instr.decode()? {
            Operation::Single { op, mode, reg, width } => {
                self.run_single_operand(instr.code, op, mode, reg, width)
            }
            Operation::Jump { condition, offset } => {
                self.run_jump(condition, offset);
                Ok(())
            }
            Operation::Two { op, src, src_mode, dst, dst_indexed, width } => {
                if matches!(op, TwoOp::Addc | TwoOp::Subc | TwoOp::Dadd | TwoOp::Bit) {
                    return Err(CpuError::NotImplemented { mnemonic: op.mnemonic(), code: instr.code });
                }
                let source = self.resolve(src, src_mode, width);
                let destination = self.resolve_destination(dst, dst_indexed);
                self.run_two_operand(op, source, destination, width);
                Ok(())
            }
        }
    }

    fn run_single_operand(
        &mut self,
        code: u16,
        op: SingleOp,
        mode: AddressingMode,
        reg: u8,
        width: Width,
    ) -> Result<(), CpuError> {
        if op == SingleOp::Reti {
            return Err(CpuError::NotImplemented { mnemonic: op.mnemonic(), code });
        }

        if matches!(op, SingleOp::Push | SingleOp::Call) {
            self.regs.increment(SP, -2);
        }

        let operand = self.resolve(reg, mode, width);
        let raw = self.load(operand, width);
        let value = raw & width.mask();
        let msb = width.sign_bit();

        let result = match op {
            SingleOp::Rrc => {
                let carry_in = if self.regs.flag(Flag::Carry) { msb } else { 0 };
                self.regs.set_flag(Flag::Carry, value & 1 != 0);
                self.regs.set_flag(Flag::Overflow, false);
                (value >> 1) | carry_in
            }
            SingleOp::Swpb => {
                self.store(operand, value.swap_bytes(), width);
                return Ok(());
            }
            SingleOp::Rra => {
                self.regs.set_flag(Flag::Carry, value & 1 != 0);
                self.regs.set_flag(Flag::Overflow, false);
                (value & msb) | (value >> 1)
            }
            SingleOp::Sxt => {
                let result = if value & 0x0080 != 0 { value | 0xFF00 } else { value & 0x00FF };
                self.regs.set_flag(Flag::Overflow, false);
                self.regs.set_flag(Flag::Carry, result != 0);
                result
            }
            SingleOp::Push => {
                self.mem.write(value, self.regs.sp(), width);
                return Ok(());
            }
            SingleOp::Call => {
                // The target is the full operand word, even for call.b
                self.mem.write_word(self.regs.sp(), self.regs.pc());
                self.regs.set_pc(raw);
                return Ok(());
            }
            SingleOp::Reti => unreachable!("rejected above"),
        };

        // Z and N go in after write-back so an SR destination keeps them
        self.store(operand, result, width);
        self.regs.update_zn(result, width);
        Ok(())
    }

    fn resolve_destination(&mut self, dst: u8, indexed: bool) -> Operand {
        if !indexed {
            return Operand::Register(dst);
        }
        let offset = self.mem.read_word(self.regs.pc());
        // SR as a destination base means absolute addressing
        let base = if dst == SR { 0 } else { self.regs.get(dst) };
        self.regs.increment(PC, 2);
        Operand::Memory(offset.wrapping_add(base))
    }

    fn run_two_operand(&mut self, op: TwoOp, source: Operand, destination: Operand, width: Width) {
        let src_value = self.load(source, width) & width.mask();
        // MOV overwrites the destination without looking at it
        let dst_value = if op == TwoOp::Mov {
            0
        } else {
            self.load(destination, width) & width.mask()
        };
        let msb = width.sign_bit();

        let (result, updates_zn) = match op {
            TwoOp::Mov => (src_value, false),
            TwoOp::Bic => (!src_value & dst_value, false),
            TwoOp::Bis => (src_value | dst_value, false),
            TwoOp::Add => (self.add_with_flags(src_value, dst_value, 0, width), true),
            TwoOp::Sub => (self.add_with_flags(!src_value & width.mask(), dst_value, 1, width), true),
            TwoOp::Cmp => {
                let result = self.add_with_flags(!src_value & width.mask(), dst_value, 1, width);
                self.regs.update_zn(result, width);
                return;
            }
            TwoOp::Xor => {
                let result = src_value ^ dst_value;
                if src_value & msb != 0 && dst_value & msb != 0 {
                    self.regs.set_flag(Flag::Overflow, true);
                }
                self.regs.set_flag(Flag::Carry, result != 0);
                (result, true)
            }
            TwoOp::And => {
                let result = src_value & dst_value;
                if result != 0 {
                    self.regs.set_flag(Flag::Carry, true);
                }
                self.regs.set_flag(Flag::Overflow, false);
                (result, true)
            }
            TwoOp::Addc | TwoOp::Subc | TwoOp::Dadd | TwoOp::Bit => unreachable!("rejected before operands are resolved"),
        };

        self.store(destination, result, width);
        if updates_zn {
            self.regs.update_zn(result, width);
        }
    }

    fn run_jump(&mut self, condition: Condition, offset: i16) {
        let n = self.regs.flag(Flag::Negative);
        let v = self.regs.flag(Flag::Overflow);

        let taken = match condition {
            Condition::NotZero => !self.regs.flag(Flag::Zero),
            Condition::Zero => self.regs.flag(Flag::Zero),
            Condition::NoCarry => !self.regs.flag(Flag::Carry),
            Condition::Carry => self.regs.flag(Flag::Carry),
            Condition::Negative => n,
            Condition::GreaterEqual => n == v,
            Condition::Less => n != v,
            Condition::Always => true,
        };

        if taken {
            self.regs.increment(PC, offset.wrapping_mul(2));
        }
    }

    /// `dst + src + carry_in`, setting C and V for the given width.
    ///
    /// C is set when the sum exceeds the width's maximum value. V is set when
    /// both operands have the same sign and the result's sign differs.
    fn add_with_flags(&mut self, src: u16, dst: u16, carry_in: u16, width: Width) -> u16 {
        let msb = width.sign_bit();
        let sum = src as u32 + dst as u32 + carry_in as u32;
        let result = sum as u16 & width.mask();

        let same_sign = (src ^ dst) & msb == 0;
        let sign_changed = (src ^ result) & msb != 0;
        self.regs.set_flag(Flag::Carry, sum > width.mask() as u32);
        self.regs.set_flag(Flag::Overflow, same_sign && sign_changed);
        result
    }

    /// Work out where an operand lives, applying any addressing-mode side effects.
    ///
    /// Constant-generator encodings are recognised before the addressing mode
    /// is looked at.
    fn resolve(&mut self, reg: u8, mode: AddressingMode, width: Width) -> Operand {
        let is_constant = reg == CG2
            || (reg == CG1 && matches!(mode, AddressingMode::IndirectRegister | AddressingMode::IndirectAutoincrement));
        if is_constant {
            return Operand::Constant(self.regs.read(reg, mode));
        }

        match mode {
            AddressingMode::Register => Operand::Register(reg),
            AddressingMode::Indexed => {
                // Read the base first: for PC it is the address of the offset word
                let base = self.regs.read(reg, mode);
                let offset = self.mem.read_word(self.regs.pc());
                self.regs.increment(PC, 2);
                Operand::Memory(offset.wrapping_add(base))
            }
            AddressingMode::IndirectRegister => Operand::Memory(self.regs.get(reg)),
            AddressingMode::IndirectAutoincrement => {
                let addr = self.regs.get(reg);
                let step = if reg == PC || width == Width::Word { 2 } else { 1 };
                self.regs.increment(reg, step);
                Operand::Memory(addr)
            }
        }
    }

    fn load(&self, operand: Operand, width: Width) -> u16 {
        match operand {
            Operand::Register(reg) => self.regs.get(reg),
            Operand::Constant(value) => value,
            Operand::Memory(addr) => self.mem.read(addr, width),
        }
    }

    fn store(&mut self, operand: Operand, value: u16, width: Width) {
        match operand {
            Operand::Register(reg) => self.regs.write(reg, value & width.mask()),
            Operand::Constant(_) => {}
            Operand::Memory(addr) => self.mem.write(value, addr, width),
        }
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Cpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cpu")
            .field("regs", &self.regs)
            .field("mem", &self.mem)
            .finish()
    }
}

/// Fatal conditions raised while executing an instruction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CpuError {
    /// The opcode field matches nothing the decoder knows.
    #[error(transparent)]
    UnknownOpcode(#[from] DecodeError),

    /// A recognised opcode this core does not execute.
    #[error("{mnemonic} (word 0x{code:04X}) is not implemented")]
    NotImplemented { mnemonic: &'static str, code: u16 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::decode::{encode, Format};

    const ORIGIN: u16 = 0x1100;

    /// Place words at ORIGIN and point PC at them.
    fn cpu_with_program(words: &[u16]) -> Cpu {
        let mut cpu = Cpu::new();
        cpu.init();
        for (i, &word) in words.iter().enumerate() {
            cpu.mem.write_word(ORIGIN + 2 * i as u16, word);
        }
        cpu.regs.set_pc(ORIGIN);
        cpu
    }

    fn two(op: TwoOp, src: u8, src_mode: AddressingMode, dst: u8, dst_indexed: bool, width: Width) -> u16 {
        encode(&Operation::Two { op, src, src_mode, dst, dst_indexed, width })
    }

    fn reg_to_reg(op: TwoOp, src: u8, dst: u8) -> u16 {
        two(op, src, AddressingMode::Register, dst, false, Width::Word)
    }

    fn single(op: SingleOp, mode: AddressingMode, reg: u8, width: Width) -> u16 {
        encode(&Operation::Single { op, mode, reg, width })
    }

    #[test]
    fn test_init_from_reset_vector() {
        let mut cpu = Cpu::new();
        cpu.mem.load_image(&[0x00, 0x11]).unwrap();
        cpu.init();

        assert_eq!(cpu.regs.pc(), 0x1100);
        assert_eq!(cpu.regs.sp(), 0x0A00);
    }

    #[test]
    fn test_mov_register() {
        let mut cpu = cpu_with_program(&[0x4A0C]);
        cpu.regs.write(10, 0xBEEF);
        let sr = cpu.regs.sr();

        cpu.step().unwrap();

        assert_eq!(cpu.regs.get(12), 0xBEEF);
        assert_eq!(cpu.regs.sr(), sr);
        assert_eq!(cpu.regs.pc(), ORIGIN + 2);
    }

    #[test]
    fn test_add_register() {
        let mut cpu = cpu_with_program(&[0x5E0F]);
        cpu.regs.write(15, 0x0123);
        cpu.regs.write(14, 0x0456);

        cpu.step().unwrap();

        assert_eq!(cpu.regs.get(15), 0x0579);
        assert!(!cpu.regs.flag(Flag::Carry));
        assert!(!cpu.regs.flag(Flag::Overflow));
        assert!(!cpu.regs.flag(Flag::Zero));
    }

    #[test]
    fn test_add_carry_and_zero() {
        let mut cpu = cpu_with_program(&[reg_to_reg(TwoOp::Add, 4, 5)]);
        cpu.regs.write(4, 0xFFFF);
        cpu.regs.write(5, 0x0001);

        cpu.step().unwrap();

        assert_eq!(cpu.regs.get(5), 0);
        assert!(cpu.regs.flag(Flag::Carry));
        assert!(cpu.regs.flag(Flag::Zero));
        assert!(!cpu.regs.flag(Flag::Overflow));
    }

    #[test]
    fn test_add_signed_overflow() {
        let mut cpu = cpu_with_program(&[reg_to_reg(TwoOp::Add, 4, 5)]);
        cpu.regs.write(4, 0x7FFF);
        cpu.regs.write(5, 0x0001);

        cpu.step().unwrap();

        assert_eq!(cpu.regs.get(5), 0x8000);
        assert!(cpu.regs.flag(Flag::Overflow));
        assert!(cpu.regs.flag(Flag::Negative));
        assert!(!cpu.regs.flag(Flag::Carry));
    }

    #[test]
    fn test_add_byte_mode() {
        let mut cpu = cpu_with_program(&[two(TwoOp::Add, 4, AddressingMode::Register, 5, false, Width::Byte)]);
        cpu.regs.write(4, 0x12F0);
        cpu.regs.write(5, 0x3420);

        cpu.step().unwrap();

        // 0xF0 + 0x20 = 0x110: byte result 0x10 with carry, high byte cleared
        assert_eq!(cpu.regs.get(5), 0x0010);
        assert!(cpu.regs.flag(Flag::Carry));
        assert!(!cpu.regs.flag(Flag::Negative));
    }

    #[test]
    fn test_add_constant_generator() {
        // add #1, r5 / add #8, r5
        let mut cpu = cpu_with_program(&[0x5315, two(TwoOp::Add, SR, AddressingMode::IndirectAutoincrement, 5, false, Width::Word)]);
        cpu.regs.write(5, 10);

        cpu.step().unwrap();
        assert_eq!(cpu.regs.get(5), 11);
        cpu.step().unwrap();
        assert_eq!(cpu.regs.get(5), 19);
        // Constants take no extension word
        assert_eq!(cpu.regs.pc(), ORIGIN + 4);
    }

    #[test]
    fn test_sub_and_cmp() {
        let mut cpu = cpu_with_program(&[reg_to_reg(TwoOp::Sub, 4, 5), reg_to_reg(TwoOp::Cmp, 4, 6)]);
        cpu.regs.write(4, 3);
        cpu.regs.write(5, 10);
        cpu.regs.write(6, 2);

        cpu.step().unwrap();
        assert_eq!(cpu.regs.get(5), 7);
        // No borrow
        assert!(cpu.regs.flag(Flag::Carry));
        assert!(!cpu.regs.flag(Flag::Negative));

        cpu.step().unwrap();
        // CMP leaves the destination alone
        assert_eq!(cpu.regs.get(6), 2);
        // 2 - 3 borrows and goes negative
        assert!(!cpu.regs.flag(Flag::Carry));
        assert!(cpu.regs.flag(Flag::Negative));
        assert!(!cpu.regs.flag(Flag::Zero));
    }

    #[test]
    fn test_cmp_equal_sets_zero() {
        let mut cpu = cpu_with_program(&[reg_to_reg(TwoOp::Cmp, 4, 5)]);
        cpu.regs.write(4, 0x1234);
        cpu.regs.write(5, 0x1234);

        cpu.step().unwrap();

        assert!(cpu.regs.flag(Flag::Zero));
        assert!(cpu.regs.flag(Flag::Carry));
        assert!(!cpu.regs.flag(Flag::Overflow));
    }

    #[test]
    fn test_sub_overflow() {
        // 0x8000 - 1 overflows from negative to positive
        let mut cpu = cpu_with_program(&[reg_to_reg(TwoOp::Sub, 4, 5)]);
        cpu.regs.write(4, 1);
        cpu.regs.write(5, 0x8000);

        cpu.step().unwrap();

        assert_eq!(cpu.regs.get(5), 0x7FFF);
        assert!(cpu.regs.flag(Flag::Overflow));
    }

    #[test]
    fn test_logic_ops() {
        let mut cpu = cpu_with_program(&[
            reg_to_reg(TwoOp::Bic, 4, 5),
            reg_to_reg(TwoOp::Bis, 4, 6),
            reg_to_reg(TwoOp::And, 4, 7),
            reg_to_reg(TwoOp::Xor, 4, 8),
        ]);
        cpu.regs.write(4, 0x00FF);
        cpu.regs.write(5, 0x0F0F);
        cpu.regs.write(6, 0x0F00);
        cpu.regs.write(7, 0x0F0F);
        cpu.regs.write(8, 0x00FF);
        let sr = cpu.regs.sr();

        cpu.step().unwrap();
        assert_eq!(cpu.regs.get(5), 0x0F00);
        cpu.step().unwrap();
        assert_eq!(cpu.regs.get(6), 0x0FFF);
        // BIC and BIS leave flags alone
        assert_eq!(cpu.regs.sr(), sr);

        cpu.step().unwrap();
        assert_eq!(cpu.regs.get(7), 0x000F);
        assert!(cpu.regs.flag(Flag::Carry));
        assert!(!cpu.regs.flag(Flag::Overflow));

        cpu.step().unwrap();
        assert_eq!(cpu.regs.get(8), 0);
        assert!(cpu.regs.flag(Flag::Zero));
        assert!(!cpu.regs.flag(Flag::Carry));
    }

    #[test]
    fn test_xor_both_negative_sets_overflow() {
        let mut cpu = cpu_with_program(&[reg_to_reg(TwoOp::Xor, 4, 5)]);
        cpu.regs.write(4, 0x8001);
        cpu.regs.write(5, 0x8000);

        cpu.step().unwrap();

        assert_eq!(cpu.regs.get(5), 0x0001);
        assert!(cpu.regs.flag(Flag::Overflow));
        assert!(cpu.regs.flag(Flag::Carry));
    }

    #[test]
    fn test_and_zero_result_keeps_carry() {
        let mut cpu = cpu_with_program(&[reg_to_reg(TwoOp::And, 4, 5)]);
        cpu.regs.write(4, 0x00F0);
        cpu.regs.write(5, 0x000F);
        cpu.regs.set_flag(Flag::Carry, true);
        cpu.regs.set_flag(Flag::Overflow, true);

        cpu.step().unwrap();

        assert_eq!(cpu.regs.get(5), 0);
        assert!(cpu.regs.flag(Flag::Carry));
        assert!(!cpu.regs.flag(Flag::Overflow));
        assert!(cpu.regs.flag(Flag::Zero));
    }

    #[test]
    fn test_xor_keeps_overflow_when_signs_differ() {
        let mut cpu = cpu_with_program(&[reg_to_reg(TwoOp::Xor, 4, 5)]);
        cpu.regs.write(4, 0x8000);
        cpu.regs.write(5, 0x0001);
        cpu.regs.set_flag(Flag::Overflow, true);

        cpu.step().unwrap();

        assert_eq!(cpu.regs.get(5), 0x8001);
        assert!(cpu.regs.flag(Flag::Overflow));
        assert!(cpu.regs.flag(Flag::Negative));
    }

    #[test]
    fn test_status_register_destination_keeps_zn() {
        // rra sr with SR = 0: the result is written, then Z is set on top of it
        let mut cpu = cpu_with_program(&[
            single(SingleOp::Rra, AddressingMode::Register, SR, Width::Word),
            // and #-1, sr
            two(TwoOp::And, CG2, AddressingMode::IndirectAutoincrement, SR, false, Width::Word),
        ]);
        cpu.regs.write(SR, 0);

        cpu.step().unwrap();
        assert_eq!(cpu.regs.sr(), Flag::Zero.mask());

        cpu.regs.write(SR, 0x8000);
        cpu.step().unwrap();
        // The stored result replaces C, then N comes from bit 15
        assert_eq!(cpu.regs.sr(), 0x8000 | Flag::Negative.mask());
    }

    #[test]
    fn test_mov_immediate_to_absolute() {
        // mov #0x1234, &0x0200
        let mut cpu = cpu_with_program(&[
            two(TwoOp::Mov, PC, AddressingMode::IndirectAutoincrement, SR, true, Width::Word),
            0x1234,
            0x0200,
        ]);

        cpu.step().unwrap();

        assert_eq!(cpu.mem.read_word(0x0200), 0x1234);
        assert_eq!(cpu.regs.pc(), ORIGIN + 6);
    }

    #[test]
    fn test_indexed_source_and_destination() {
        // mov 4(r5), 6(r6)
        let mut cpu = cpu_with_program(&[
            two(TwoOp::Mov, 5, AddressingMode::Indexed, 6, true, Width::Word),
            4,
            6,
        ]);
        cpu.regs.write(5, 0x0300);
        cpu.regs.write(6, 0x0400);
        cpu.mem.write_word(0x0304, 0xABCD);

        cpu.step().unwrap();

        assert_eq!(cpu.mem.read_word(0x0406), 0xABCD);
        assert_eq!(cpu.regs.pc(), ORIGIN + 6);
    }

    #[test]
    fn test_symbolic_source_and_destination() {
        // mov 0x10(pc), 0x20(pc): each base is the address of its own offset word
        let mut cpu = cpu_with_program(&[
            two(TwoOp::Mov, PC, AddressingMode::Indexed, PC, true, Width::Word),
            0x0010,
            0x0020,
        ]);
        cpu.mem.write_word(ORIGIN + 2 + 0x10, 0x5A5A);

        cpu.step().unwrap();

        assert_eq!(cpu.mem.read_word(ORIGIN + 4 + 0x20), 0x5A5A);
        assert_eq!(cpu.regs.pc(), ORIGIN + 6);
    }

    #[test]
    fn test_negative_index_offset() {
        // mov -2(r5), r7
        let mut cpu = cpu_with_program(&[two(TwoOp::Mov, 5, AddressingMode::Indexed, 7, false, Width::Word), 0xFFFE]);
        cpu.regs.write(5, 0x0302);
        cpu.mem.write_word(0x0300, 0x4242);

        cpu.step().unwrap();

        assert_eq!(cpu.regs.get(7), 0x4242);
    }

    #[test]
    fn test_autoincrement_word_and_byte() {
        let mut cpu = cpu_with_program(&[
            two(TwoOp::Mov, 5, AddressingMode::IndirectAutoincrement, 7, false, Width::Word),
            two(TwoOp::Mov, 5, AddressingMode::IndirectAutoincrement, 8, false, Width::Byte),
        ]);
        cpu.regs.write(5, 0x0300);
        cpu.mem.write_word(0x0300, 0x1122);
        cpu.mem.write_word(0x0302, 0x3344);

        cpu.step().unwrap();
        assert_eq!(cpu.regs.get(7), 0x1122);
        assert_eq!(cpu.regs.get(5), 0x0302);

        cpu.step().unwrap();
        assert_eq!(cpu.regs.get(8), 0x0044);
        assert_eq!(cpu.regs.get(5), 0x0303);
    }

    #[test]
    fn test_ret_through_mov() {
        // mov @sp+, pc
        let mut cpu = cpu_with_program(&[0x4130]);
        cpu.regs.write(SP, 0x09FE);
        cpu.mem.write_word(0x09FE, 0x2000);

        cpu.step().unwrap();

        assert_eq!(cpu.regs.pc(), 0x2000);
        assert_eq!(cpu.regs.sp(), 0x0A00);
    }

    #[test]
    fn test_jumps() {
        let mut cpu = Cpu::new();
        cpu.init();

        // jz $+10
        cpu.mem.write_word(0x1128, 0x2404);
        cpu.regs.set_flag(Flag::Zero, true);
        cpu.regs.set_pc(0x1128);
        cpu.step().unwrap();
        assert_eq!(cpu.regs.pc(), 0x1132);

        cpu.regs.set_flag(Flag::Zero, false);
        cpu.regs.set_pc(0x1128);
        cpu.step().unwrap();
        assert_eq!(cpu.regs.pc(), 0x112A);

        // jnc $+8
        cpu.mem.write_word(0x1340, 0x2803);
        cpu.regs.set_flag(Flag::Carry, false);
        cpu.regs.set_pc(0x1340);
        cpu.step().unwrap();
        assert_eq!(cpu.regs.pc(), 0x1348);

        cpu.regs.set_flag(Flag::Carry, true);
        cpu.regs.set_pc(0x1340);
        cpu.step().unwrap();
        assert_eq!(cpu.regs.pc(), 0x1342);
    }

    #[test]
    fn test_signed_conditions() {
        let mut cpu = cpu_with_program(&[]);
        let jge = encode(&Operation::Jump { condition: Condition::GreaterEqual, offset: -3 });
        let jl = encode(&Operation::Jump { condition: Condition::Less, offset: 5 });
        cpu.mem.write_word(ORIGIN, jge);
        cpu.mem.write_word(ORIGIN + 2, jl);

        // N = V: jge taken backwards
        cpu.regs.set_flag(Flag::Negative, true);
        cpu.regs.set_flag(Flag::Overflow, true);
        cpu.step().unwrap();
        assert_eq!(cpu.regs.pc(), ORIGIN + 2 - 6);

        // N != V: jl taken
        cpu.regs.set_pc(ORIGIN + 2);
        cpu.regs.set_flag(Flag::Overflow, false);
        cpu.step().unwrap();
        assert_eq!(cpu.regs.pc(), ORIGIN + 4 + 10);
    }

    #[test]
    fn test_call_immediate() {
        let mut cpu = Cpu::new();
        cpu.init();
        // call #0x1286
        cpu.mem.write_word(0x11A8, 0x12B0);
        cpu.mem.write_word(0x11AA, 0x1286);
        cpu.regs.set_pc(0x11A8);

        cpu.step().unwrap();

        assert_eq!(cpu.regs.pc(), 0x1286);
        assert_eq!(cpu.regs.sp(), 0x09FE);
        assert_eq!(cpu.mem.read_word(0x09FE), 0x11AC);
    }

    #[test]
    fn test_call_byte_uses_full_target() {
        // call.b r4
        let mut cpu = cpu_with_program(&[single(SingleOp::Call, AddressingMode::Register, 4, Width::Byte)]);
        cpu.regs.write(4, 0x1234);

        cpu.step().unwrap();

        assert_eq!(cpu.regs.pc(), 0x1234);
        assert_eq!(cpu.mem.read_word(cpu.regs.sp()), ORIGIN + 2);
    }

    #[test]
    fn test_push_register() {
        let mut cpu = Cpu::new();
        cpu.init();
        cpu.mem.write_word(0x1264, 0x120D);
        cpu.regs.set_pc(0x1264);
        cpu.regs.write(13, 0x1234);
        let sr = cpu.regs.sr();

        cpu.step().unwrap();

        assert_eq!(cpu.regs.sp(), 0x09FE);
        assert_eq!(cpu.mem.read_word(cpu.regs.sp()), 0x1234);
        assert_eq!(cpu.regs.sr(), sr);
    }

    #[test]
    fn test_push_constant() {
        // push #4
        let mut cpu = cpu_with_program(&[single(SingleOp::Push, AddressingMode::IndirectRegister, SR, Width::Word)]);

        cpu.step().unwrap();

        assert_eq!(cpu.mem.read_word(cpu.regs.sp()), 4);
    }

    #[test]
    fn test_swpb_regression() {
        let mut cpu = cpu_with_program(&[single(SingleOp::Swpb, AddressingMode::Register, 4, Width::Word)]);
        cpu.regs.write(4, 0x1234);
        cpu.regs.set_flag(Flag::Carry, true);
        let sr = cpu.regs.sr();

        cpu.step().unwrap();

        assert_eq!(cpu.regs.get(4), 0x3412);
        assert_eq!(cpu.regs.sr(), sr);
    }

    #[test]
    fn test_rrc() {
        let mut cpu = cpu_with_program(&[single(SingleOp::Rrc, AddressingMode::Register, 4, Width::Word)]);
        cpu.regs.write(4, 0x0003);
        cpu.regs.set_flag(Flag::Carry, false);
        cpu.regs.set_flag(Flag::Overflow, true);

        cpu.step().unwrap();

        assert_eq!(cpu.regs.get(4), 0x0001);
        assert!(cpu.regs.flag(Flag::Carry));
        assert!(!cpu.regs.flag(Flag::Overflow));

        // Carry rotates in at the top
        cpu.regs.set_pc(ORIGIN);
        cpu.step().unwrap();
        assert_eq!(cpu.regs.get(4), 0x8000);
        assert!(cpu.regs.flag(Flag::Carry));
        assert!(cpu.regs.flag(Flag::Negative));
    }

    #[test]
    fn test_rra_keeps_sign() {
        let mut cpu = cpu_with_program(&[single(SingleOp::Rra, AddressingMode::Register, 4, Width::Word)]);
        cpu.regs.write(4, 0x8005);

        cpu.step().unwrap();

        assert_eq!(cpu.regs.get(4), 0xC002);
        assert!(cpu.regs.flag(Flag::Carry));
        assert!(cpu.regs.flag(Flag::Negative));
        assert!(!cpu.regs.flag(Flag::Overflow));
    }

    #[test]
    fn test_rra_byte_in_memory() {
        // rra.b @r5
        let mut cpu = cpu_with_program(&[single(SingleOp::Rra, AddressingMode::IndirectRegister, 5, Width::Byte)]);
        cpu.regs.write(5, 0x0300);
        cpu.mem.write_word(0x0300, 0xAA84);

        cpu.step().unwrap();

        assert_eq!(cpu.mem.read_word(0x0300), 0xAAC2);
        assert!(!cpu.regs.flag(Flag::Carry));
        assert!(cpu.regs.flag(Flag::Negative));
    }

    #[test]
    fn test_sxt() {
        let mut cpu = cpu_with_program(&[single(SingleOp::Sxt, AddressingMode::Register, 4, Width::Word)]);
        cpu.regs.write(4, 0x1280);

        cpu.step().unwrap();
        assert_eq!(cpu.regs.get(4), 0xFF80);
        assert!(cpu.regs.flag(Flag::Carry));
        assert!(cpu.regs.flag(Flag::Negative));

        cpu.regs.write(4, 0x1200);
        cpu.regs.set_pc(ORIGIN);
        cpu.step().unwrap();
        assert_eq!(cpu.regs.get(4), 0x0000);
        assert!(!cpu.regs.flag(Flag::Carry));
        assert!(cpu.regs.flag(Flag::Zero));
    }

    #[test]
    fn test_not_implemented_leaves_state() {
        for op in [TwoOp::Addc, TwoOp::Subc, TwoOp::Dadd, TwoOp::Bit] {
            // Indexed source would otherwise consume an extension word
            let word = two(op, 5, AddressingMode::Indexed, 6, true, Width::Word);
            let mut cpu = cpu_with_program(&[word, 2, 4]);
            let before = cpu.clone();

            let err = cpu.step().unwrap_err();

            assert_eq!(err, CpuError::NotImplemented { mnemonic: op.mnemonic(), code: word });
            assert_eq!(cpu.regs.pc(), ORIGIN + 2);
            cpu.regs.set_pc(ORIGIN);
            assert_eq!(cpu, before);
        }
    }

    #[test]
    fn test_reti_not_implemented() {
        let mut cpu = cpu_with_program(&[0x1300]);

        assert!(matches!(cpu.step(), Err(CpuError::NotImplemented { mnemonic: "reti", .. })));
        assert_eq!(cpu.regs.pc(), ORIGIN + 2);
        assert_eq!(cpu.regs.sp(), STACK_TOP);
    }

    #[test]
    fn test_unknown_opcode() {
        let mut cpu = cpu_with_program(&[0x0000]);

        let err = cpu.step().unwrap_err();

        assert_eq!(
            err,
            CpuError::UnknownOpcode(DecodeError::UnknownOpcode { format: Format::TwoOperand, opcode: 0, code: 0 })
        );
        assert_eq!(cpu.regs.pc(), ORIGIN + 2);
    }

    #[test]
    fn test_load_flash_missing_file() {
        let mut cpu = Cpu::new();
        assert!(!cpu.load_flash_from_path("/nonexistent/firmware.bin"));
    }
}
