//! x86-64 code emitter
//!
//! The only module that knows the host instruction format. It
//! serialises instructions byte by byte; every mnemonic documents its
//! exact emitted length, and no emitted length depends on operand
//! values, which is what lets the translator's sizing pass predict
//! pass-2 offsets exactly.
//!
//! Register conventions inside a translated buffer (System V AMD64):
//!
//! * `edi` carries in the default continuation PC; the prologue
//!   spills it to a frame slot at `[rbp - 0x18]` and the epilogue
//!   returns it in `eax`
//! * `r12` holds the guest register-file base, `r13` the guest memory
//!   base (both callee-saved, loaded by the prologue from absolute
//!   addresses baked in at translate time)
//! * `eax` and `ebx` are the scratch pair A and B used by every
//!   lowering

use thiserror::Error;

/// The two host scratch registers available to lowered code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scratch {
    /// Accumulator (eax)
    A,
    /// Secondary (ebx)
    B,
}

impl Scratch {
    fn encoding(self) -> u8 {
        match self {
            Self::A => 0, // eax
            Self::B => 3, // ebx
        }
    }
}

/// Signed comparison conditions for conditional jumps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl Cond {
    /// Intel condition code, the low nibble of the Jcc opcodes
    fn code(self) -> u8 {
        match self {
            Self::Eq => 0x4,
            Self::Ne => 0x5,
            Self::Lt => 0xc,
            Self::Gt => 0xf,
            Self::Le => 0xe,
            Self::Ge => 0xd,
        }
    }

    /// Negated condition codes directly follow their counterparts
    fn negated_code(self) -> u8 {
        self.code() ^ 1
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EmitError {
    #[error("translation buffer exhausted (capacity {capacity} bytes)")]
    BufferExhausted { capacity: usize },
}

// ModR/M byte: mod(2) | reg(3) | r/m(3)
const fn modrm(md: u8, reg: u8, rm: u8) -> u8 {
    (md << 6) | (reg << 3) | rm
}

// r/m value selecting a SIB byte
const RM_SIB: u8 = 4;
// SIB with no index and base r12 (REX.B set)
const SIB_R12: u8 = 0x24;
// frame slot holding the continuation PC, as a disp8 from rbp
const CONTINUATION_DISP: u8 = 0xe8; // -0x18

/// Exact length of every [`Emitter::prologue`]
pub const PROLOGUE_LEN: usize = 35;
/// Exact length of every [`Emitter::epilogue`]
pub const EPILOGUE_LEN: usize = 13;
/// Exact length of [`Emitter::set_continuation_pc`]
pub const SET_CONTINUATION_LEN: usize = 7;
/// Exact length of [`Emitter::jmp_to`]
pub const JMP_REL32_LEN: usize = 5;
/// Exact length of [`Emitter::jcc_to`]
pub const JCC_NEAR_LEN: usize = 6;
/// Exact length of [`Emitter::jcc_short_negated`]
pub const JCC_SHORT_LEN: usize = 2;

/// Byte serialiser for one translated buffer.
///
/// In sizing mode nothing is written; only the cursor advances, so
/// the translator's first pass can record per-instruction offsets and
/// the total length. In emitting mode bytes are collected up to a
/// fixed capacity (the sizing pass's total); exceeding it means the
/// two passes diverged and is reported as an error rather than
/// silently producing a misassembled buffer.
#[derive(Debug)]
pub struct Emitter {
    buf: Vec<u8>,
    cursor: usize,
    capacity: usize,
    sizing: bool,
}

impl Emitter {
    /// An emitter that only measures
    pub fn sizing() -> Self {
        Self {
            buf: Vec::new(),
            cursor: 0,
            capacity: usize::MAX,
            sizing: true,
        }
    }

    /// An emitter that writes, up to `capacity` bytes
    pub fn emitting(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            cursor: 0,
            capacity,
            sizing: false,
        }
    }

    pub fn is_sizing(&self) -> bool {
        self.sizing
    }

    /// Offset of the next byte to be emitted
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn into_code(self) -> Vec<u8> {
        self.buf
    }

    fn u8(&mut self, byte: u8) -> Result<(), EmitError> {
        if self.cursor >= self.capacity {
            return Err(EmitError::BufferExhausted {
                capacity: self.capacity,
            });
        }
        if !self.sizing {
            self.buf.push(byte);
        }
        self.cursor += 1;
        Ok(())
    }

    fn bytes(&mut self, bytes: &[u8]) -> Result<(), EmitError> {
        for byte in bytes {
            self.u8(*byte)?;
        }
        Ok(())
    }

    fn u32_le(&mut self, value: u32) -> Result<(), EmitError> {
        self.bytes(&value.to_le_bytes())
    }

    fn u64_le(&mut self, value: u64) -> Result<(), EmitError> {
        self.bytes(&value.to_le_bytes())
    }

    /// Function prologue; [`PROLOGUE_LEN`] (35) bytes.
    ///
    /// Saves the frame and the callee-saved base registers, spills the
    /// incoming default continuation PC (edi) to its frame slot, and
    /// pins the guest register-file and memory bases in r12/r13.
    pub fn prologue(&mut self, regs_base: u64, mem_base: u64) -> Result<(), EmitError> {
        self.u8(0x55)?; // push rbp
        self.bytes(&[0x48, 0x89, 0xe5])?; // mov rbp, rsp
        self.bytes(&[0x41, 0x54])?; // push r12
        self.bytes(&[0x41, 0x55])?; // push r13
        self.bytes(&[0x48, 0x83, 0xec, 0x10])?; // sub rsp, 16
        self.bytes(&[0x89, 0x7d, CONTINUATION_DISP])?; // mov [rbp - 0x18], edi
        self.bytes(&[0x49, 0xbc])?; // movabs r12, imm64
        self.u64_le(regs_base)?;
        self.bytes(&[0x49, 0xbd])?; // movabs r13, imm64
        self.u64_le(mem_base)
    }

    /// Function epilogue; [`EPILOGUE_LEN`] (13) bytes.
    ///
    /// Loads the continuation PC from its frame slot into eax (the
    /// return value), restores the saved registers and returns.
    pub fn epilogue(&mut self) -> Result<(), EmitError> {
        self.bytes(&[0x8b, 0x45, CONTINUATION_DISP])?; // mov eax, [rbp - 0x18]
        self.bytes(&[0x48, 0x83, 0xc4, 0x10])?; // add rsp, 16
        self.bytes(&[0x41, 0x5d])?; // pop r13
        self.bytes(&[0x41, 0x5c])?; // pop r12
        self.u8(0x5d)?; // pop rbp
        self.u8(0xc3) // ret
    }

    /// `mov eax/ebx, [r12 + 4*cell]` -- load a guest register cell
    /// into a scratch register; 5 bytes
    pub fn load_reg(&mut self, dst: Scratch, cell: u8) -> Result<(), EmitError> {
        self.u8(0x41)?; // REX.B (base r12)
        self.u8(0x8b)?; // MOV r32, r/m32
        self.u8(modrm(1, dst.encoding(), RM_SIB))?;
        self.u8(SIB_R12)?;
        self.u8(4 * cell) // disp8; 4*31 = 124 always fits
    }

    /// `mov [r12 + 4*cell], eax` -- store scratch A to a guest
    /// register cell; 5 bytes
    pub fn store_reg(&mut self, cell: u8) -> Result<(), EmitError> {
        self.u8(0x41)?; // REX.B
        self.u8(0x89)?; // MOV r/m32, r32
        self.u8(modrm(1, Scratch::A.encoding(), RM_SIB))?;
        self.u8(SIB_R12)?;
        self.u8(4 * cell)
    }

    /// `mov dword [r12 + 4*cell], imm32` -- store a constant to a
    /// guest register cell; 9 bytes
    pub fn store_reg_imm(&mut self, cell: u8, value: u32) -> Result<(), EmitError> {
        self.u8(0x41)?; // REX.B
        self.u8(0xc7)?; // MOV r/m32, imm32
        self.u8(modrm(1, 0, RM_SIB))?;
        self.u8(SIB_R12)?;
        self.u8(4 * cell)?;
        self.u32_le(value)
    }

    /// `add eax, ebx`; 2 bytes
    pub fn add_regs(&mut self) -> Result<(), EmitError> {
        self.bytes(&[0x01, 0xd8])
    }

    /// `sub eax, ebx`; 2 bytes
    pub fn sub_regs(&mut self) -> Result<(), EmitError> {
        self.bytes(&[0x29, 0xd8])
    }

    /// `imul eax, ebx` -- signed multiply, low 32 bits; 3 bytes
    pub fn mul_regs(&mut self) -> Result<(), EmitError> {
        self.bytes(&[0x0f, 0xaf, 0xc3])
    }

    /// `add eax, imm32`; 5 bytes
    pub fn add_imm(&mut self, value: i32) -> Result<(), EmitError> {
        self.u8(0x05)?;
        self.u32_le(value as u32)
    }

    /// `sub eax, imm32`; 5 bytes
    pub fn sub_imm(&mut self, value: i32) -> Result<(), EmitError> {
        self.u8(0x2d)?;
        self.u32_le(value as u32)
    }

    /// `imul eax, eax, imm32` -- signed multiply, low 32 bits; 6 bytes
    pub fn mul_imm(&mut self, value: i32) -> Result<(), EmitError> {
        self.bytes(&[0x69, 0xc0])?;
        self.u32_le(value as u32)
    }

    /// `cmp eax, ebx` -- compare the scratch pair, setting the flags
    /// the conditional jumps test; 2 bytes
    pub fn cmp_regs(&mut self) -> Result<(), EmitError> {
        self.bytes(&[0x39, 0xd8])
    }

    /// `mov eax, [r13 + rax]` -- load the guest memory word at the
    /// address held in A; 5 bytes
    pub fn load_mem(&mut self) -> Result<(), EmitError> {
        self.u8(0x41)?; // REX.B (base r13)
        self.u8(0x8b)?; // MOV r32, r/m32
        self.u8(modrm(1, Scratch::A.encoding(), RM_SIB))?;
        self.u8(0x05)?; // SIB: index rax, base r13
        self.u8(0x00) // disp8 = 0 (r13 base cannot use the no-disp form)
    }

    /// `mov [r13 + rbx + disp32], eax` -- store A to guest memory at
    /// the address in B plus a constant offset; 8 bytes
    pub fn store_mem(&mut self, disp: i32) -> Result<(), EmitError> {
        self.u8(0x41)?; // REX.B (base r13)
        self.u8(0x89)?; // MOV r/m32, r32
        self.u8(modrm(2, Scratch::A.encoding(), RM_SIB))?;
        self.u8(0x1d)?; // SIB: index rbx, base r13
        self.u32_le(disp as u32)
    }

    /// `jcc rel32` to an absolute buffer offset; [`JCC_NEAR_LEN`] (6)
    /// bytes. Jumps when the condition holds for the last
    /// [`Emitter::cmp_regs`].
    pub fn jcc_to(&mut self, cond: Cond, target: usize) -> Result<(), EmitError> {
        let rel = target as i64 - (self.cursor + JCC_NEAR_LEN) as i64;
        self.u8(0x0f)?;
        self.u8(0x80 + cond.code())?;
        self.u32_le(rel as u32)
    }

    /// `jcc rel8` on the negated condition, skipping `skip` bytes;
    /// [`JCC_SHORT_LEN`] (2) bytes
    pub fn jcc_short_negated(&mut self, cond: Cond, skip: u8) -> Result<(), EmitError> {
        self.u8(0x70 + cond.negated_code())?;
        self.u8(skip)
    }

    /// `jmp rel32` to an absolute buffer offset; [`JMP_REL32_LEN`]
    /// (5) bytes
    pub fn jmp_to(&mut self, target: usize) -> Result<(), EmitError> {
        let rel = target as i64 - (self.cursor + JMP_REL32_LEN) as i64;
        self.u8(0xe9)?;
        self.u32_le(rel as u32)
    }

    /// `mov dword [rbp - 0x18], imm32` -- overwrite the continuation
    /// PC the epilogue will return; [`SET_CONTINUATION_LEN`] (7) bytes
    pub fn set_continuation_pc(&mut self, pc: u32) -> Result<(), EmitError> {
        self.u8(0xc7)?;
        self.u8(modrm(1, 0, 5))?; // r/m rbp, disp8
        self.u8(CONTINUATION_DISP)?;
        self.u32_le(pc)
    }
}
