//! IMPS instruction model
//!
//! An instruction is a 32-bit word with the fields (MSB first)
//! OPCODE(6) R1(5) R2(5) R3(5) IMM(16), where the long-immediate
//! jump variant reinterprets the low 26 bits as ADDR(26). The word
//! itself is stored in guest memory little-endian.
//!
//! Field extraction is pure and cannot fail; a word whose opcode
//! field does not name an instruction surfaces as `None` from
//! [`Instr::opcode`] and is reported at execute time.

use std::fmt;

/// Make a bit-mask of n bits using mask!(n)
#[macro_export]
macro_rules! mask {
    ($n:expr) => {
        (1 << $n) - 1
    };
}
pub use mask;

/// Return val[end:start]
#[macro_export]
macro_rules! extract_field {
    ($val:expr, $end:expr, $start:expr) => {{
        mask!($end - $start + 1) & ($val >> $start)
    }};
}
pub use extract_field;

/// The IMPS opcode set. Numeric values are fixed by the instruction
/// encoding and used by test vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Halt = 0,
    Add = 1,
    Addi = 2,
    Sub = 3,
    Subi = 4,
    Mul = 5,
    Muli = 6,
    Lw = 7,
    Sw = 8,
    Beq = 9,
    Bne = 10,
    Blt = 11,
    Bgt = 12,
    Ble = 13,
    Bge = 14,
    Jmp = 15,
    Jr = 16,
    Jal = 17,
    Jit = 18,
}

impl Opcode {
    pub fn from_u32(value: u32) -> Option<Self> {
        let opcode = match value {
            0 => Self::Halt,
            1 => Self::Add,
            2 => Self::Addi,
            3 => Self::Sub,
            4 => Self::Subi,
            5 => Self::Mul,
            6 => Self::Muli,
            7 => Self::Lw,
            8 => Self::Sw,
            9 => Self::Beq,
            10 => Self::Bne,
            11 => Self::Blt,
            12 => Self::Bgt,
            13 => Self::Ble,
            14 => Self::Bge,
            15 => Self::Jmp,
            16 => Self::Jr,
            17 => Self::Jal,
            18 => Self::Jit,
            _ => return None,
        };
        Some(opcode)
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Halt => "HALT",
            Self::Add => "ADD",
            Self::Addi => "ADDI",
            Self::Sub => "SUB",
            Self::Subi => "SUBI",
            Self::Mul => "MUL",
            Self::Muli => "MULI",
            Self::Lw => "LW",
            Self::Sw => "SW",
            Self::Beq => "BEQ",
            Self::Bne => "BNE",
            Self::Blt => "BLT",
            Self::Bgt => "BGT",
            Self::Ble => "BLE",
            Self::Bge => "BGE",
            Self::Jmp => "JMP",
            Self::Jr => "JR",
            Self::Jal => "JAL",
            Self::Jit => "JIT",
        }
    }
}

/// Sign-extend the 16-bit immediate field to 32 bits
pub fn sign_extend_imm16(imm: u16) -> i32 {
    i32::from(imm as i16)
}

/// A fetched 32-bit instruction word, with named accessors for each
/// field at its exact width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instr(pub u32);

impl Instr {
    /// The raw 6-bit opcode field (bits 31:26)
    pub fn opcode_bits(self) -> u32 {
        extract_field!(self.0, 31, 26)
    }

    pub fn opcode(self) -> Option<Opcode> {
        Opcode::from_u32(self.opcode_bits())
    }

    /// First register field (bits 25:21)
    pub fn r1(self) -> u8 {
        extract_field!(self.0, 25, 21) as u8
    }

    /// Second register field (bits 20:16)
    pub fn r2(self) -> u8 {
        extract_field!(self.0, 20, 16) as u8
    }

    /// Third register field (bits 15:11)
    pub fn r3(self) -> u8 {
        extract_field!(self.0, 15, 11) as u8
    }

    /// The 16-bit immediate field (bits 15:0), unextended
    pub fn imm(self) -> u16 {
        extract_field!(self.0, 15, 0) as u16
    }

    /// The immediate field sign-extended to 32 bits
    pub fn simm(self) -> i32 {
        sign_extend_imm16(self.imm())
    }

    /// The 26-bit absolute byte address of the jump instructions
    /// (bits 25:0), zero-extended
    pub fn addr(self) -> u32 {
        extract_field!(self.0, 25, 0)
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let Some(op) = self.opcode() else {
            return write!(f, "UNKNOWN (0x{:08x})", self.0);
        };
        let m = op.mnemonic();
        match op {
            Opcode::Halt | Opcode::Jit => write!(f, "{m}"),
            Opcode::Add | Opcode::Sub | Opcode::Mul => {
                let sym = match op {
                    Opcode::Add => '+',
                    Opcode::Sub => '-',
                    _ => '*',
                };
                write!(f, "{m} R{} = R{} {sym} R{}", self.r1(), self.r2(), self.r3())
            }
            Opcode::Addi | Opcode::Subi | Opcode::Muli => {
                let sym = match op {
                    Opcode::Addi => '+',
                    Opcode::Subi => '-',
                    _ => '*',
                };
                write!(f, "{m} R{} = R{} {sym} {}", self.r1(), self.r2(), self.simm())
            }
            Opcode::Lw => write!(f, "{m} R{} = MEMORY[R{} + {}]", self.r1(), self.r2(), self.simm()),
            Opcode::Sw => write!(f, "{m} MEMORY[R{} + {}] = R{}", self.r2(), self.simm(), self.r1()),
            Opcode::Beq
            | Opcode::Bne
            | Opcode::Blt
            | Opcode::Bgt
            | Opcode::Ble
            | Opcode::Bge => {
                let pred = match op {
                    Opcode::Beq => "==",
                    Opcode::Bne => "!=",
                    Opcode::Blt => "<",
                    Opcode::Bgt => ">",
                    Opcode::Ble => "<=",
                    _ => ">=",
                };
                write!(
                    f,
                    "{m} if R{} {pred} R{} then PC = PC + ({} * 4)",
                    self.r1(),
                    self.r2(),
                    self.simm()
                )
            }
            Opcode::Jmp => write!(f, "{m} PC = {}", self.addr()),
            Opcode::Jr => write!(f, "{m} PC = R{}", self.r1()),
            Opcode::Jal => write!(f, "{m} R31 = PC + 4; PC = {}", self.addr()),
        }
    }
}
