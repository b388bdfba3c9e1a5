// This module generates the deoptimization machinery. Every guard produces a
// token that walks a small state machine: pending (the conditional jump is
// emitted, its target unknown) -> stub emitted (a recovery stub exists at the
// unit's tail) -> patched (a bridge overwrote the jump target). A recovery stub
// stores the guard's GC root bitmap and descriptor identifier into the frame
// header and jumps to the unit's shared exit trampoline, which dumps every
// allocatable register into the frame's save area (so fail locations stay
// readable from the returned frame), saves any in-flight exception, pops the
// shadow stack and returns. The module also owns the hot/cold split sequences:
// the write-barrier fast path is a single status-byte test that falls through,
// with the out-of-line part (card-mark fast case or general helper call)
// queued and emitted once at the unit's end, as is the slow reacquisition path
// of lock-releasing calls.

//! Guards, recovery stubs, and cold paths.

use crate::core::error::CompileResult;
use crate::core::regalloc::AsmReg;
use crate::gc::{GcDescriptor, WriteBarrierDescr};
use crate::x64::emitter::{CodeBuffer, Label, Mem};
use crate::x64::location::Location;
use crate::x64::{
    fixed_frame_slots, frame_gc_map_offset, frame_guard_exc_offset, frame_slot_offset,
    register_save_slot, Abi, Cond, TargetDesc, WordWidth, FRAME_REG, RAX, RCX,
};

/// Lifecycle of a guard site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Pending,
    StubEmitted,
    Patched,
}

/// Everything a deoptimization point carries from allocation to patch time.
#[derive(Debug)]
pub struct GuardToken {
    /// Opaque identifier the runtime maps back to interpreter state.
    pub descr_id: u64,
    /// Condition under which the guard fails (the jump to the stub).
    pub condition: Cond,
    /// Where each failure argument lives at the guard site.
    pub fail_locations: Vec<Location>,
    /// Root bitmap over frame slots at the guard site. Heap storage must not
    /// move: the stub embeds its address.
    pub gc_map: Box<[usize]>,
    /// Offset of the rel32 conditional jump; always 6 bytes, its own
    /// patch window.
    pub patch_offset: usize,
    /// Stub label, bound when trailing stubs are emitted.
    pub stub_label: Label,
    /// Offset of the stub once emitted.
    pub stub_offset: Option<usize>,
    pub state: GuardState,
}

/// Out-of-line sequences queued during allocation and emitted once at the
/// unit's end, keeping the hot path small and call-free.
#[derive(Debug)]
pub enum ColdPath {
    Barrier {
        entry: Label,
        resume: Label,
        obj: AsmReg,
        /// Element index for the card-marking form.
        index: Option<Location>,
        /// Live caller-saved registers to preserve around the helper call.
        saved: Vec<AsmReg>,
        descr: WriteBarrierDescr,
    },
    LockSlow {
        slow: Label,
        resume: Label,
        helper: u64,
    },
}

/// Bitmap over frame slots holding references, pushed before every
/// collection-triggering call and carried by every guard.
pub fn build_gc_map(
    width: WordWidth,
    spill_depth: u32,
    live_refs: impl Iterator<Item = Location>,
) -> Vec<usize> {
    let total_slots = fixed_frame_slots(width) + spill_depth;
    let bits = usize::BITS as u32;
    let mut map = vec![0usize; total_slots.div_ceil(bits) as usize];
    for loc in live_refs {
        let slot = match loc {
            Location::Gp(r) => register_save_slot(width, r),
            Location::Stack { slot, .. } => slot,
            // Constants and absolute addresses are pinned; not roots.
            _ => continue,
        };
        map[(slot / bits) as usize] |= 1 << (slot % bits);
    }
    map
}

/// The unit-wide exit trampoline. Dumps every allocatable register into its
/// frame save slot, saves a pending exception into the frame header, pops the
/// shadow stack, and returns the frame pointer through the epilogue.
pub fn emit_exit_trampoline(
    buf: &mut CodeBuffer,
    target: &TargetDesc,
    runtime: &GcDescriptor,
    reserve_bytes: i32,
    label: Label,
) -> CompileResult<Label> {
    let width = buf.width();
    buf.bind(label);

    for reg in target.allocatable.iter() {
        let mem = Mem::base(FRAME_REG, frame_slot_offset(width, register_save_slot(width, reg)));
        if reg.is_gp() {
            buf.store(mem, reg)?;
        } else {
            buf.movsd_store(mem, reg)?;
        }
    }

    // Registers are dumped; everything is free to clobber from here on.
    if runtime.has_exception_slots() {
        save_exception(buf, runtime, RCX)?;
    }
    if runtime.has_shadow_stack() {
        emit_shadow_stack_pop(buf, runtime)?;
    }

    buf.mov_rr(RAX, FRAME_REG)?;
    emit_epilogue_tail(buf, target, reserve_bytes)?;
    Ok(label)
}

/// Copy the host exception into the frame's exception slot and clear the
/// host slots; `tmp` must be dead.
pub fn save_exception(buf: &mut CodeBuffer, runtime: &GcDescriptor, tmp: AsmReg) -> CompileResult<()> {
    let width = buf.width();
    buf.load(tmp, Mem::Abs(runtime.exc_value_addr as u64))?;
    buf.store(Mem::base(FRAME_REG, frame_guard_exc_offset(width)), tmp)?;
    buf.store_imm(Mem::Abs(runtime.exc_type_addr as u64), 0)?;
    buf.store_imm(Mem::Abs(runtime.exc_value_addr as u64), 0)?;
    Ok(())
}

pub fn emit_shadow_stack_push(buf: &mut CodeBuffer, runtime: &GcDescriptor, tmp: AsmReg) -> CompileResult<()> {
    let word = buf.width().bytes();
    let top = Mem::Abs(runtime.root_stack_top_addr as u64);
    buf.load(tmp, top)?;
    buf.store(Mem::base(tmp, 0), FRAME_REG)?;
    buf.add_ri(tmp, word)?;
    buf.store(top, tmp)?;
    Ok(())
}

pub fn emit_shadow_stack_pop(buf: &mut CodeBuffer, runtime: &GcDescriptor) -> CompileResult<()> {
    let word = buf.width().bytes();
    let top = Mem::Abs(runtime.root_stack_top_addr as u64);
    buf.load(RCX, top)?;
    buf.add_ri(RCX, -word)?;
    buf.store(top, RCX)?;
    Ok(())
}

/// The shared tail of every exit: release the reserve area, restore
/// callee-saved registers, return.
pub fn emit_epilogue_tail(buf: &mut CodeBuffer, target: &TargetDesc, reserve_bytes: i32) -> CompileResult<()> {
    buf.add_ri(crate::x64::RSP, reserve_bytes)?;
    for &reg in target.saved_gp.iter().rev() {
        buf.pop_r(reg)?;
    }
    buf.ret()
}

/// Emit the trailing recovery stubs for all pending guards. Each stub stores
/// the root bitmap and descriptor identifier into the frame header, then
/// jumps to the shared trampoline.
pub fn emit_pending_stubs(
    buf: &mut CodeBuffer,
    tokens: &mut [GuardToken],
    exit: Label,
) -> CompileResult<()> {
    let width = buf.width();
    for token in tokens.iter_mut() {
        debug_assert_eq!(token.state, GuardState::Pending);
        buf.bind(token.stub_label);
        let stub_offset = buf.offset();

        let gc_map_addr = token.gc_map.as_ptr() as u64;
        store_wide_imm(buf, Mem::base(FRAME_REG, frame_gc_map_offset(width)), gc_map_addr as i64)?;
        store_wide_imm(
            buf,
            Mem::base(FRAME_REG, crate::x64::frame_descr_offset(width)),
            token.descr_id as i64,
        )?;
        buf.jmp(exit)?;

        token.stub_offset = Some(stub_offset);
        token.state = GuardState::StubEmitted;
    }
    Ok(())
}

/// Word store of an immediate that may exceed imm32, through the scratch
/// register when it must. On the 32-bit variant every word is an imm32.
pub fn store_wide_imm(buf: &mut CodeBuffer, mem: Mem, value: i64) -> CompileResult<()> {
    if buf.width() == WordWidth::W32 {
        return buf.store_imm(mem, value as i32);
    }
    if let Ok(v) = i32::try_from(value) {
        buf.store_imm(mem, v)
    } else {
        let scratch = buf.materialize(value)?;
        buf.store(mem, scratch)
    }
}

/// The write-barrier fast path: one status-byte test, falling straight
/// through on the common outcome. Returns the queued cold path.
pub fn emit_write_barrier(
    buf: &mut CodeBuffer,
    descr: &WriteBarrierDescr,
    obj: AsmReg,
    index: Option<Location>,
    saved: Vec<AsmReg>,
) -> CompileResult<ColdPath> {
    let entry = buf.new_label();
    let resume = buf.new_label();
    buf.test_mi8(Mem::base(obj, descr.flag_offset), descr.flag_mask)?;
    buf.jcc(Cond::Ne, entry)?;
    buf.bind(resume);
    Ok(ColdPath::Barrier { entry, resume, obj, index, saved, descr: *descr })
}

/// Emit all queued cold paths at the unit's end.
pub fn emit_cold_paths(
    buf: &mut CodeBuffer,
    target: &TargetDesc,
    cold_paths: Vec<ColdPath>,
) -> CompileResult<()> {
    for path in cold_paths {
        match path {
            ColdPath::LockSlow { slow, resume, helper } => {
                buf.bind(slow);
                if target.abi == Abi::Win64 {
                    buf.add_ri(crate::x64::RSP, -32)?;
                }
                buf.call_abs(helper)?;
                if target.abi == Abi::Win64 {
                    buf.add_ri(crate::x64::RSP, 32)?;
                }
                buf.jmp(resume)?;
            }
            ColdPath::Barrier { entry, resume, obj, index, saved, descr } => {
                emit_barrier_cold(buf, target, entry, resume, obj, index, &saved, &descr)?;
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn emit_barrier_cold(
    buf: &mut CodeBuffer,
    target: &TargetDesc,
    entry: Label,
    resume: Label,
    obj: AsmReg,
    index: Option<Location>,
    saved: &[AsmReg],
    descr: &WriteBarrierDescr,
) -> CompileResult<()> {
    buf.bind(entry);

    // Card-mark fast case: cards already set, just set one more bit.
    let general = buf.new_label();
    let done = if descr.has_cards() && index.is_some() {
        let done = buf.new_label();
        buf.test_mi8(Mem::base(obj, descr.flag_offset), descr.cards_set_mask)?;
        buf.jcc(Cond::E, general)?;
        let tmp = pick_tmp(target, obj, index.as_ref());
        buf.push_r(tmp)?;
        match index.unwrap() {
            Location::Gp(r) => {
                buf.mov_rr(tmp, r)?;
                buf.shr_ri(tmp, descr.card_page_shift)?;
            }
            Location::Imm(v) => {
                buf.mov_ri(tmp, v >> descr.card_page_shift)?;
            }
            Location::Stack { slot, .. } => {
                buf.load(tmp, Mem::base(FRAME_REG, frame_slot_offset(buf.width(), slot)))?;
                buf.shr_ri(tmp, descr.card_page_shift)?;
            }
            other => {
                return Err(crate::core::error::CompileError::not_implemented(format!(
                    "card index from {other:?}"
                )))
            }
        }
        buf.bts(Mem::base(obj, descr.card_base_offset), tmp)?;
        buf.pop_r(tmp)?;
        buf.jmp(done)?;
        Some(done)
    } else {
        None
    };

    // General case: preserve the live caller-saved registers and call the
    // barrier helper with the object as sole argument.
    buf.bind(general);
    for &reg in saved {
        buf.push_r(reg)?;
    }
    match target.abi {
        Abi::SysV64 | Abi::Win64 => {
            let arg = if target.abi == Abi::SysV64 { crate::x64::RDI } else { RCX };
            if obj != arg {
                buf.mov_rr(arg, obj)?;
            }
            let shadow = if target.abi == Abi::Win64 { 32 } else { 0 };
            let pad = if saved.len() % 2 == 1 { 8 } else { 0 };
            let adjust = shadow + pad;
            if adjust != 0 {
                buf.add_ri(crate::x64::RSP, -adjust)?;
            }
            buf.call_abs(descr.helper as u64)?;
            if adjust != 0 {
                buf.add_ri(crate::x64::RSP, adjust)?;
            }
        }
        Abi::Cdecl32 => {
            // One stack argument, 16-byte aligned at the call.
            let adjust = 16 - ((saved.len() as i32 * 4) % 16);
            buf.add_ri(crate::x64::RSP, -adjust)?;
            buf.store(Mem::base(crate::x64::RSP, 0), obj)?;
            buf.call_abs(descr.helper as u64)?;
            buf.add_ri(crate::x64::RSP, adjust)?;
        }
    }
    for &reg in saved.iter().rev() {
        buf.pop_r(reg)?;
    }
    if let Some(done) = done {
        buf.bind(done);
    }
    buf.jmp(resume)?;
    Ok(())
}

/// A caller-saved temporary distinct from the object and index registers.
fn pick_tmp(target: &TargetDesc, obj: AsmReg, index: Option<&Location>) -> AsmReg {
    let index_reg = index.and_then(|l| l.as_gp());
    for cand in [RAX, RCX, crate::x64::RDX] {
        if cand != obj && Some(cand) != index_reg && target.allocatable.contains(cand) {
            return cand;
        }
    }
    unreachable!("three candidates, at most two taken")
}
