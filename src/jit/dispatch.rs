//! Entering translated code
//!
//! A finished translation is copied into freshly allocated executable
//! memory and entered as a host function of one argument, the default
//! continuation PC. Whatever continuation PC the emitted code returns
//! (the default, or one written by an escape stub) is handed back to
//! the interpreter. The buffer is scoped to this one call: it is
//! released on every exit path when the area is dropped.

use super::code_area::{AreaError, CodeArea, MmapArea};

/// Signature of a translated buffer: takes the default continuation
/// PC, returns the continuation PC to resume interpretation at
type TranslatedEntry = extern "C" fn(u32) -> u32;

/// Run one translation and return the guest PC to continue at.
///
/// The emitted code reads and writes the register file and guest
/// memory through the base addresses baked into it at translate time,
/// so the hart those addresses came from must still be live and
/// unmoved; [`crate::hart::Hart`] guarantees that by translating and
/// dispatching within a single borrow of itself.
pub fn run(code: &[u8], default_continuation_pc: u32) -> Result<u32, AreaError> {
    let mut area = MmapArea::allocate(code.len())?;
    area.code_mut()[..code.len()].copy_from_slice(code);
    area.finalize()?;

    // SAFETY: the area holds a complete translation entered at its
    // base; the emitted prologue/epilogue implement exactly the
    // TranslatedEntry calling convention, and the region stays mapped
    // (and executable) until the call returns.
    let entry: TranslatedEntry = unsafe { std::mem::transmute(area.entry()) };
    Ok(entry(default_continuation_pc))
}

#[cfg(test)]
#[cfg(target_arch = "x86_64")]
mod tests {

    use super::*;
    use crate::jit::emitter::Emitter;

    #[test]
    fn check_default_continuation_returned() {
        // A buffer with nothing between prologue and epilogue returns
        // its argument unchanged
        let mut em = Emitter::emitting(1024);
        em.prologue(0, 0).unwrap();
        em.epilogue().unwrap();
        assert_eq!(run(&em.into_code(), 48).unwrap(), 48);
    }

    #[test]
    fn check_escape_stub_overrides_continuation() {
        let mut em = Emitter::emitting(1024);
        em.prologue(0, 0).unwrap();
        em.set_continuation_pc(1234).unwrap();
        em.epilogue().unwrap();
        assert_eq!(run(&em.into_code(), 48).unwrap(), 1234);
    }

    #[test]
    fn check_emitted_code_mutates_register_cells() {
        let mut cells = [0i32; 32];
        let mut em = Emitter::emitting(1024);
        em.prologue(cells.as_mut_ptr() as u64, 0).unwrap();
        em.store_reg_imm(7, 0x2a).unwrap();
        em.epilogue().unwrap();
        let code = em.into_code();
        assert_eq!(run(&code, 0).unwrap(), 0);
        assert_eq!(cells[7], 0x2a);
    }
}
