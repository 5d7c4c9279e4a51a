//! IMPS: a 32-bit register machine with a dynamic binary translator
//!
//! Programs run under a fetch-decode-execute interpreter ([`hart`]),
//! and can request at runtime that a contiguous range of their own
//! code be translated to native x86-64 machine code and executed
//! ([`jit`]), with results observable back through the shared
//! register file and memory.

pub mod encode;
pub mod hart;
pub mod instr;
pub mod jit;
pub mod loader;
