//! Dynamic binary translation of guest instruction ranges
//!
//! A translation request names an inclusive range `[start, end]` of
//! guest byte addresses. The translator lowers the instructions in
//! that window to native code in two passes over identical dispatch
//! logic: the sizing pass records, for each source instruction index,
//! the native offset its lowering will start at (the instruction
//! map), and the emission pass uses the completed map to resolve
//! in-window branch targets to concrete displacements. Every
//! per-opcode lowering emits a byte-for-byte identical count in both
//! passes -- no emitted sequence's length depends on operand values --
//! which is what keeps the map valid.
//!
//! A branch whose target falls outside the window instead gets a
//! fixed-length escape stub: it writes the target guest PC over the
//! continuation slot and jumps to the single epilogue at the buffer
//! tail, so the interpreter resumes exactly where it would have
//! branched to.

use thiserror::Error;

use crate::hart::memory::Memory;
use crate::hart::registers::{RegisterFile, LINK_REGISTER};
use crate::instr::{Instr, Opcode};

pub mod code_area;
pub mod dispatch;
pub mod emitter;

use emitter::{Cond, EmitError, Emitter, Scratch};

/// Byte length of an escape stub (continuation store + jump to the
/// epilogue); the negated conditional jump in front of an outward
/// branch skips exactly this much
const ESCAPE_STUB_LEN: usize = emitter::SET_CONTINUATION_LEN + emitter::JMP_REL32_LEN;

/// A validated translation request: an inclusive range of guest byte
/// addresses, both ends 4-aligned and within the loaded program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationWindow {
    start: u32,
    end: u32,
}

impl TranslationWindow {
    /// Validate a requested range against the program size. Returns
    /// `None` (the caller reports a bad-range error) unless both
    /// addresses are multiples of 4, `start <= end`, and the last
    /// instruction lies inside the program image.
    pub fn new(start: u32, end: u32, program_size: u32) -> Option<Self> {
        let in_program = end.checked_add(4)? <= program_size;
        (start % 4 == 0 && end % 4 == 0 && start <= end && in_program)
            .then_some(Self { start, end })
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    /// Number of instructions in the window
    pub fn count(&self) -> usize {
        ((self.end - self.start) / 4 + 1) as usize
    }

    /// Guest address of the k-th instruction in the window
    fn guest_pc(&self, index: usize) -> u32 {
        self.start + 4 * index as u32
    }
}

#[derive(Error, Debug)]
pub enum TranslateError {
    #[error("unknown opcode {opcode} at source instruction {index}")]
    UnknownOpcode { index: usize, opcode: u32 },
    #[error("jump target {addr} at source instruction {index} is not a multiple of 4")]
    UnalignedJumpTarget { index: usize, addr: u32 },
    #[error("{mnemonic} at source instruction {index} cannot be translated")]
    UnsupportedInTranslation { index: usize, mnemonic: &'static str },
    #[error("nested translation request at source instruction {index}")]
    NestedJitNotAllowed { index: usize },
    #[error(transparent)]
    Emit(#[from] EmitError),
    #[error(transparent)]
    Area(#[from] code_area::AreaError),
}

/// A finished translation: the native code image for one window,
/// ready for the dispatcher, plus the instruction map that positioned
/// its branches
#[derive(Debug)]
pub struct Translation {
    code: Vec<u8>,
    map: Vec<usize>,
}

impl Translation {
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Native offset at which each source instruction's lowering
    /// begins
    pub fn instruction_offsets(&self) -> &[usize] {
        &self.map
    }
}

/// Translate the instructions in `window` to a native code image.
///
/// The emitted code addresses the given register file and memory
/// directly (their base addresses are baked into the prologue), so it
/// must be executed before either can move; the hart does so
/// immediately, within the same borrow. No partial image is ever
/// returned: any lowering failure fails the whole request.
pub fn translate(
    registers: &mut RegisterFile,
    memory: &mut Memory,
    window: TranslationWindow,
) -> Result<Translation, TranslateError> {
    let regs_base = registers.base_ptr() as u64;
    let mem_base = memory.base_ptr() as u64;
    let mut map = vec![0usize; window.count()];

    // Sizing pass: fills the map and measures the image
    let mut sizer = Emitter::sizing();
    run_pass(&mut sizer, memory, window, regs_base, mem_base, &mut map, 0)?;
    let total = sizer.cursor();
    let epilogue_offset = total - emitter::EPILOGUE_LEN;

    // Emission pass: same dispatch, now writing, with branch targets
    // resolved through the completed map. The capacity is exactly the
    // sizing pass's total, so any divergence between the passes
    // surfaces as a buffer-exhausted error instead of bad code.
    let mut em = Emitter::emitting(total);
    run_pass(
        &mut em,
        memory,
        window,
        regs_base,
        mem_base,
        &mut map,
        epilogue_offset,
    )?;
    debug_assert_eq!(em.cursor(), total);

    Ok(Translation {
        code: em.into_code(),
        map,
    })
}

/// One pass over the window: prologue, each instruction's lowering,
/// epilogue. In the sizing pass the map entries are recorded; in the
/// emission pass they are read.
fn run_pass(
    em: &mut Emitter,
    memory: &Memory,
    window: TranslationWindow,
    regs_base: u64,
    mem_base: u64,
    map: &mut [usize],
    epilogue_offset: usize,
) -> Result<(), TranslateError> {
    em.prologue(regs_base, mem_base)?;

    for index in 0..window.count() {
        let word = memory
            .read_word(window.guest_pc(index))
            .expect("window is validated to lie inside guest memory");
        if em.is_sizing() {
            map[index] = em.cursor();
        } else {
            debug_assert_eq!(map[index], em.cursor(), "pass 2 diverged from the map");
        }
        lower(em, window, map, epilogue_offset, index, Instr(word))?;
    }

    em.epilogue()?;
    Ok(())
}

/// Lower one source instruction to emitter calls
fn lower(
    em: &mut Emitter,
    window: TranslationWindow,
    map: &[usize],
    epilogue_offset: usize,
    index: usize,
    instr: Instr,
) -> Result<(), TranslateError> {
    let Some(op) = instr.opcode() else {
        return Err(TranslateError::UnknownOpcode {
            index,
            opcode: instr.opcode_bits(),
        });
    };

    match op {
        Opcode::Add | Opcode::Sub | Opcode::Mul => {
            em.load_reg(Scratch::A, instr.r2())?;
            em.load_reg(Scratch::B, instr.r3())?;
            match op {
                Opcode::Add => em.add_regs()?,
                Opcode::Sub => em.sub_regs()?,
                _ => em.mul_regs()?,
            }
            em.store_reg(instr.r1())?;
        }
        Opcode::Addi | Opcode::Subi | Opcode::Muli => {
            em.load_reg(Scratch::A, instr.r2())?;
            match op {
                Opcode::Addi => em.add_imm(instr.simm())?,
                Opcode::Subi => em.sub_imm(instr.simm())?,
                _ => em.mul_imm(instr.simm())?,
            }
            em.store_reg(instr.r1())?;
        }
        Opcode::Lw => {
            // A = R2 + sext(IMM); A = memory[A]; R1 = A. No bounds
            // check in the native path.
            em.load_reg(Scratch::A, instr.r2())?;
            em.add_imm(instr.simm())?;
            em.load_mem()?;
            em.store_reg(instr.r1())?;
        }
        Opcode::Sw => {
            // A = R1; B = R2; memory[B + sext(IMM)] = A
            em.load_reg(Scratch::A, instr.r1())?;
            em.load_reg(Scratch::B, instr.r2())?;
            em.store_mem(instr.simm())?;
        }
        Opcode::Beq => cond_branch(em, window, map, epilogue_offset, index, instr, Cond::Eq)?,
        Opcode::Bne => cond_branch(em, window, map, epilogue_offset, index, instr, Cond::Ne)?,
        Opcode::Blt => cond_branch(em, window, map, epilogue_offset, index, instr, Cond::Lt)?,
        Opcode::Bgt => cond_branch(em, window, map, epilogue_offset, index, instr, Cond::Gt)?,
        Opcode::Ble => cond_branch(em, window, map, epilogue_offset, index, instr, Cond::Le)?,
        Opcode::Bge => cond_branch(em, window, map, epilogue_offset, index, instr, Cond::Ge)?,
        Opcode::Jmp => {
            jump_absolute(em, window, map, epilogue_offset, index, instr.addr())?;
        }
        Opcode::Jal => {
            // R31 = guest address of the next instruction, then an
            // ordinary absolute jump on the ADDR field
            em.store_reg_imm(LINK_REGISTER, window.guest_pc(index).wrapping_add(4))?;
            jump_absolute(em, window, map, epilogue_offset, index, instr.addr())?;
        }
        Opcode::Jr => {
            // The target is only known at run time; deciding whether
            // it stays inside the window would need a runtime check
            // against the live range.
            return Err(TranslateError::UnsupportedInTranslation {
                index,
                mnemonic: "JR",
            });
        }
        Opcode::Jit => return Err(TranslateError::NestedJitNotAllowed { index }),
        Opcode::Halt => {
            // Escape to the HALT's own guest address: the interpreter
            // re-executes it there and performs the canonical state
            // dump and successful exit.
            escape(em, epilogue_offset, window.guest_pc(index))?;
        }
    }

    Ok(())
}

/// Lower a conditional branch. The displacement is in instructions,
/// relative to the branch's own index, so the target index is known
/// at translation time: in-window targets become a native conditional
/// jump through the map, out-of-window targets a negated short jump
/// over an escape stub.
fn cond_branch(
    em: &mut Emitter,
    window: TranslationWindow,
    map: &[usize],
    epilogue_offset: usize,
    index: usize,
    instr: Instr,
    cond: Cond,
) -> Result<(), TranslateError> {
    em.load_reg(Scratch::A, instr.r1())?;
    em.load_reg(Scratch::B, instr.r2())?;
    em.cmp_regs()?;

    let target = index as i64 + i64::from(instr.simm());
    if 0 <= target && (target as usize) < window.count() {
        em.jcc_to(cond, map[target as usize])?;
    } else {
        // Taken branch leaves the window: skip the stub unless the
        // condition holds, exactly as the interpreter would have set
        // PC = branch_pc + 4*disp (wrapping)
        em.jcc_short_negated(cond, ESCAPE_STUB_LEN as u8)?;
        let continuation = window
            .start
            .wrapping_add(((index as i32).wrapping_add(instr.simm())).wrapping_mul(4) as u32);
        escape(em, epilogue_offset, continuation)?;
    }
    Ok(())
}

/// Lower JMP/JAL control flow: `addr` is an absolute guest byte
/// address, so the window-relative target index is `(addr - start)/4`
fn jump_absolute(
    em: &mut Emitter,
    window: TranslationWindow,
    map: &[usize],
    epilogue_offset: usize,
    index: usize,
    addr: u32,
) -> Result<(), TranslateError> {
    if addr % 4 != 0 {
        return Err(TranslateError::UnalignedJumpTarget { index, addr });
    }
    let target = (i64::from(addr) - i64::from(window.start)) / 4;
    if 0 <= target && (target as usize) < window.count() {
        em.jmp_to(map[target as usize])?;
    } else {
        escape(em, epilogue_offset, addr)?;
    }
    Ok(())
}

/// Fixed-length escape stub ([`ESCAPE_STUB_LEN`] bytes): record the
/// continuation PC and take the single epilogue at the buffer tail
fn escape(em: &mut Emitter, epilogue_offset: usize, continuation_pc: u32) -> Result<(), EmitError> {
    em.set_continuation_pc(continuation_pc)?;
    em.jmp_to(epilogue_offset)
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::encode;
    use emitter::{EPILOGUE_LEN, PROLOGUE_LEN};

    // Per-opcode lowered lengths, from the emitter's documented
    // mnemonic lengths
    const ADD_LEN: usize = 17;
    const ADDI_LEN: usize = 15;
    const MUL_LEN: usize = 18;
    const MULI_LEN: usize = 16;
    const LW_LEN: usize = 20;
    const SW_LEN: usize = 18;
    const BRANCH_IN_LEN: usize = 18;
    const BRANCH_OUT_LEN: usize = 26;

    fn window_translation(words: &[u32]) -> Result<Translation, TranslateError> {
        let mut registers = RegisterFile::new();
        let mut memory = Memory::new();
        memory.load_image(&encode::image(words));
        let end = 4 * (words.len() as u32 - 1);
        let window = TranslationWindow::new(0, end, 4 * words.len() as u32).unwrap();
        translate(&mut registers, &mut memory, window)
    }

    #[test]
    fn check_window_validation() {
        assert!(TranslationWindow::new(0, 0, 4).is_some());
        assert!(TranslationWindow::new(16, 24, 28).is_some());
        // unaligned ends
        assert!(TranslationWindow::new(2, 8, 100).is_none());
        assert!(TranslationWindow::new(0, 6, 100).is_none());
        // start past end
        assert!(TranslationWindow::new(8, 4, 100).is_none());
        // last instruction does not fit in the program
        assert!(TranslationWindow::new(0, 8, 8).is_none());
        assert!(TranslationWindow::new(0, u32::MAX - 3, u32::MAX).is_none());
    }

    #[test]
    fn check_window_count() {
        let window = TranslationWindow::new(16, 24, 100).unwrap();
        assert_eq!(window.count(), 3);
        assert_eq!(window.guest_pc(0), 16);
        assert_eq!(window.guest_pc(2), 24);
    }

    #[test]
    fn check_straight_line_layout() {
        let t = window_translation(&[
            encode::addi(1, 0, 3),
            encode::add(2, 1, 1),
            encode::mul(3, 1, 2),
        ])
        .unwrap();
        assert_eq!(
            t.instruction_offsets(),
            &[
                PROLOGUE_LEN,
                PROLOGUE_LEN + ADDI_LEN,
                PROLOGUE_LEN + ADDI_LEN + ADD_LEN,
            ]
        );
        assert_eq!(
            t.code().len(),
            PROLOGUE_LEN + ADDI_LEN + ADD_LEN + MUL_LEN + EPILOGUE_LEN
        );
    }

    #[test]
    fn check_memory_op_lengths() {
        let t = window_translation(&[
            encode::lw(1, 2, 8),
            encode::sw(1, 2, -4),
            encode::muli(1, 1, 3),
        ])
        .unwrap();
        assert_eq!(
            t.code().len(),
            PROLOGUE_LEN + LW_LEN + SW_LEN + MULI_LEN + EPILOGUE_LEN
        );
    }

    #[test]
    fn check_in_window_branch_resolves_to_map_offset() {
        // BGE at index 1 branching back to index 0
        let t = window_translation(&[encode::addi(1, 1, 1), encode::bge(1, 0, -1)]).unwrap();
        let branch_off = t.instruction_offsets()[1];
        assert_eq!(branch_off, PROLOGUE_LEN + ADDI_LEN);
        assert_eq!(
            t.code().len(),
            PROLOGUE_LEN + ADDI_LEN + BRANCH_IN_LEN + EPILOGUE_LEN
        );
        // The jcc (last 6 bytes of the branch lowering) targets
        // map[0] = PROLOGUE_LEN
        let jcc = &t.code()[branch_off + 12..branch_off + 18];
        assert_eq!(jcc[0], 0x0f);
        assert_eq!(jcc[1], 0x8d); // jge
        let rel = i32::from_le_bytes(jcc[2..6].try_into().unwrap());
        let after = (branch_off + 18) as i64;
        assert_eq!(after + i64::from(rel), PROLOGUE_LEN as i64);
    }

    #[test]
    fn check_outward_branch_emits_escape_stub() {
        // BEQ at index 0 with displacement 5: far outside a
        // two-instruction window
        let t = window_translation(&[encode::beq(1, 2, 5), encode::addi(1, 0, 1)]).unwrap();
        assert_eq!(
            t.code().len(),
            PROLOGUE_LEN + BRANCH_OUT_LEN + ADDI_LEN + EPILOGUE_LEN
        );
        // After the compare: a short jne over the stub, then the stub
        // writing start + 4*(0 + 5) = 20
        let stub = &t.code()[PROLOGUE_LEN + 12..];
        assert_eq!(stub[0], 0x75); // jne (negated jcc)
        assert_eq!(stub[1], ESCAPE_STUB_LEN as u8);
        assert_eq!(stub[2], 0xc7);
        assert_eq!(&stub[5..9], &20u32.to_le_bytes());
    }

    #[test]
    fn check_single_epilogue_even_with_escapes() {
        // Two outward branches and a fall-through all share the tail
        // epilogue
        let t = window_translation(&[
            encode::beq(1, 2, 100),
            encode::bne(1, 2, 100),
            encode::addi(1, 0, 1),
        ])
        .unwrap();
        let epilogue: &[u8] = &[
            0x8b, 0x45, 0xe8, 0x48, 0x83, 0xc4, 0x10, 0x41, 0x5d, 0x41, 0x5c, 0x5d, 0xc3,
        ];
        let found: Vec<usize> = t
            .code()
            .windows(EPILOGUE_LEN)
            .enumerate()
            .filter(|(_, w)| *w == epilogue)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(found, vec![t.code().len() - EPILOGUE_LEN]);
    }

    #[test]
    fn check_jmp_out_of_window_escapes_to_addr() {
        let t = window_translation(&[encode::jmp(400), encode::addi(1, 0, 1)]).unwrap();
        // The JMP lowering is just the 12-byte stub targeting 400
        let stub = &t.code()[PROLOGUE_LEN..];
        assert_eq!(stub[0], 0xc7);
        assert_eq!(&stub[3..7], &400u32.to_le_bytes());
    }

    #[test]
    fn check_jal_writes_link_register_then_jumps() {
        let t = window_translation(&[encode::jal(0), encode::addi(1, 0, 1)]).unwrap();
        // mov dword [r12 + 4*31], 4 (the guest return address)
        let code = &t.code()[PROLOGUE_LEN..];
        assert_eq!(&code[..5], &[0x41, 0xc7, 0x44, 0x24, 124]);
        assert_eq!(&code[5..9], &4u32.to_le_bytes());
        // then an in-window jump back to index 0
        assert_eq!(code[9], 0xe9);
    }

    #[test]
    fn check_unaligned_jump_target_rejected() {
        let err = window_translation(&[encode::jmp(6), encode::halt()]).unwrap_err();
        assert!(matches!(
            err,
            TranslateError::UnalignedJumpTarget { index: 0, addr: 6 }
        ));
    }

    #[test]
    fn check_jr_unsupported() {
        let err = window_translation(&[encode::jr(5)]).unwrap_err();
        assert!(matches!(
            err,
            TranslateError::UnsupportedInTranslation { index: 0, mnemonic: "JR" }
        ));
    }

    #[test]
    fn check_nested_jit_rejected() {
        let err = window_translation(&[encode::addi(1, 0, 1), encode::jit()]).unwrap_err();
        assert!(matches!(err, TranslateError::NestedJitNotAllowed { index: 1 }));
    }

    #[test]
    fn check_unknown_opcode_reports_index() {
        let err = window_translation(&[encode::halt(), 31 << 26]).unwrap_err();
        assert!(matches!(
            err,
            TranslateError::UnknownOpcode { index: 1, opcode: 31 }
        ));
    }

    #[test]
    fn check_halt_escapes_to_its_own_pc() {
        let t = window_translation(&[encode::addi(1, 0, 1), encode::halt()]).unwrap();
        let stub = &t.code()[PROLOGUE_LEN + ADDI_LEN..];
        assert_eq!(stub[0], 0xc7);
        // continuation = guest address of the HALT itself
        assert_eq!(&stub[3..7], &4u32.to_le_bytes());
    }
}
