//! The IMPS hart: machine state and the fetch-decode-execute loop
//!
//! A [`Hart`] owns the program counter, the register file and guest
//! memory. Each call to [`Hart::step`] executes the instruction at
//! the current PC; a translation request (the JIT meta-instruction)
//! is also handled here, by handing the requested range to
//! [`crate::jit`] and resuming at the continuation PC the translated
//! code returns. Any error terminates the program; the caller decides
//! how to report it.

use std::fmt;
use thiserror::Error;

use crate::instr::{Instr, Opcode};
use crate::jit::{self, TranslateError, TranslationWindow};

pub mod memory;
pub mod registers;

use memory::Memory;
use registers::{RegisterFile, LINK_REGISTER};

#[derive(Debug, Default)]
pub struct Hart {
    pub pc: u32,
    pub registers: RegisterFile,
    pub memory: Memory,
    program_size: u32,
    trace: bool,
}

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("unknown opcode {opcode} at pc={pc}")]
    UnknownOpcode { pc: u32, opcode: u32 },
    #[error("access to address {addr} at pc={pc}: out of allowed range")]
    OutOfBoundsAccess { pc: u32, addr: u32 },
    #[error("bad translation range [{start}, {end}] requested at pc={pc}")]
    BadTranslationRange { pc: u32, start: u32, end: u32 },
    #[error("translation requested at pc={pc} failed: {source}")]
    Translation { pc: u32, source: TranslateError },
}

/// Result of one interpreter step
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Running,
    Halted,
}

impl Hart {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a raw program image at guest address 0 and reset the PC.
    /// The image length becomes the program size that translation
    /// ranges are validated against.
    pub fn load_image(&mut self, image: &[u8]) {
        self.memory.load_image(image);
        self.program_size = image.len() as u32;
        self.pc = 0;
    }

    /// Print each executed instruction to stdout
    pub fn set_trace(&mut self, trace: bool) {
        self.trace = trace;
    }

    pub fn program_size(&self) -> u32 {
        self.program_size
    }

    /// Execute the instruction at the current PC. Returns
    /// [`Outcome::Halted`] on HALT; the PC has then already been
    /// advanced past the HALT (observable in the final state dump).
    pub fn step(&mut self) -> Result<Outcome, ExecutionError> {
        let pc = self.pc;
        let word = self
            .memory
            .read_word(pc)
            .map_err(|_| ExecutionError::OutOfBoundsAccess { pc, addr: pc })?;
        let instr = Instr(word);

        if self.trace {
            println!("PC: {pc}\t- {instr}");
        }

        let Some(op) = instr.opcode() else {
            return Err(ExecutionError::UnknownOpcode {
                pc,
                opcode: instr.opcode_bits(),
            });
        };

        match op {
            Opcode::Halt => {
                self.pc = pc.wrapping_add(4);
                return Ok(Outcome::Halted);
            }
            Opcode::Add => self.reg_reg(instr, i32::wrapping_add),
            Opcode::Sub => self.reg_reg(instr, i32::wrapping_sub),
            Opcode::Mul => self.reg_reg(instr, i32::wrapping_mul),
            Opcode::Addi => self.reg_imm(instr, i32::wrapping_add),
            Opcode::Subi => self.reg_imm(instr, i32::wrapping_sub),
            Opcode::Muli => self.reg_imm(instr, i32::wrapping_mul),
            Opcode::Lw => {
                let addr = self.effective_address(instr);
                let value = self
                    .memory
                    .read_word(addr)
                    .map_err(|_| ExecutionError::OutOfBoundsAccess { pc, addr })?;
                self.registers.set(instr.r1(), value as i32);
                self.increment_pc();
            }
            Opcode::Sw => {
                let addr = self.effective_address(instr);
                let value = self.registers.get(instr.r1()) as u32;
                self.memory
                    .write_word(addr, value)
                    .map_err(|_| ExecutionError::OutOfBoundsAccess { pc, addr })?;
                self.increment_pc();
            }
            Opcode::Beq => self.branch(instr, |a, b| a == b),
            Opcode::Bne => self.branch(instr, |a, b| a != b),
            Opcode::Blt => self.branch(instr, |a, b| a < b),
            Opcode::Bgt => self.branch(instr, |a, b| a > b),
            Opcode::Ble => self.branch(instr, |a, b| a <= b),
            Opcode::Bge => self.branch(instr, |a, b| a >= b),
            Opcode::Jmp => self.pc = instr.addr(),
            Opcode::Jr => self.pc = self.registers.get(instr.r1()) as u32,
            Opcode::Jal => {
                self.registers
                    .set(LINK_REGISTER, pc.wrapping_add(4) as i32);
                self.pc = instr.addr();
            }
            Opcode::Jit => self.translate_and_run(pc)?,
        }

        Ok(Outcome::Running)
    }

    /// Run until HALT or an error
    pub fn run(&mut self) -> Result<(), ExecutionError> {
        loop {
            if let Outcome::Halted = self.step()? {
                return Ok(());
            }
        }
    }

    /// R1 <- R2 op R3
    fn reg_reg(&mut self, instr: Instr, op: fn(i32, i32) -> i32) {
        let value = op(
            self.registers.get(instr.r2()),
            self.registers.get(instr.r3()),
        );
        self.registers.set(instr.r1(), value);
        self.increment_pc();
    }

    /// R1 <- R2 op sext(IMM)
    fn reg_imm(&mut self, instr: Instr, op: fn(i32, i32) -> i32) {
        let value = op(self.registers.get(instr.r2()), instr.simm());
        self.registers.set(instr.r1(), value);
        self.increment_pc();
    }

    /// Load/store address: R2 + sext(IMM), wrapping as a u32
    fn effective_address(&self, instr: Instr) -> u32 {
        (self.registers.get(instr.r2()) as u32).wrapping_add(instr.simm() as u32)
    }

    /// Conditional branch over signed register values. The
    /// displacement is in instructions and is added to the branch's
    /// own PC, not to PC + 4.
    fn branch(&mut self, instr: Instr, predicate: fn(i32, i32) -> bool) {
        let taken = predicate(
            self.registers.get(instr.r1()),
            self.registers.get(instr.r2()),
        );
        if taken {
            self.pc = self
                .pc
                .wrapping_add(instr.simm().wrapping_mul(4) as u32);
        } else {
            self.increment_pc();
        }
    }

    fn increment_pc(&mut self) {
        self.pc = self.pc.wrapping_add(4);
    }

    /// Handle the JIT meta-instruction at `pc`: read the start/end
    /// operand words, validate the range, translate it, enter the
    /// translated buffer, and resume at the continuation PC it
    /// returns. The operand words are data, never translated; the
    /// default continuation (when the translated code falls off its
    /// end) is pc + 12, the instruction following them.
    fn translate_and_run(&mut self, pc: u32) -> Result<(), ExecutionError> {
        let start = self
            .memory
            .read_word(pc.wrapping_add(4))
            .map_err(|_| ExecutionError::OutOfBoundsAccess { pc, addr: pc.wrapping_add(4) })?;
        let end = self
            .memory
            .read_word(pc.wrapping_add(8))
            .map_err(|_| ExecutionError::OutOfBoundsAccess { pc, addr: pc.wrapping_add(8) })?;

        let window = TranslationWindow::new(start, end, self.program_size).ok_or(
            ExecutionError::BadTranslationRange { pc, start, end },
        )?;

        if self.trace {
            println!("translating guest range [{start}, {end}]");
        }

        let translation = jit::translate(&mut self.registers, &mut self.memory, window)
            .map_err(|source| ExecutionError::Translation { pc, source })?;
        let continuation = jit::dispatch::run(translation.code(), pc.wrapping_add(12))
            .map_err(|source| ExecutionError::Translation { pc, source: source.into() })?;

        if self.trace {
            println!("translated code returned, setting PC to {continuation}");
        }

        self.pc = continuation;
        Ok(())
    }
}

impl fmt::Display for Hart {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "Registers:")?;
        writeln!(f, "PC : {:>10} (0x{:08x})", self.pc, self.pc)?;
        write!(f, "{}", self.registers)
    }
}
