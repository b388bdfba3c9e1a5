// This module adapts abstract-value locations to the target calling convention
// and emits the call. It is the sole place the ABI divergence lives: System V
// x86-64 passes the first six integer arguments in rdi/rsi/rdx/rcx/r8/r9 and
// the first eight floats in xmm0-7 with no shadow space; Windows x86-64 shares
// four positional slots between rcx/rdx/r8/r9 and xmm0-3 and reserves 32 bytes
// of shadow space; the 32-bit convention passes everything on the stack. The
// stack is 16-byte aligned at every call site. Argument-count mismatches against
// the descriptor are assertion failures at allocation time; there is no
// recoverable call-builder error. Besides the plain call this module emits the
// lock-releasing variant (store-zero release, native call, lock cmpxchg
// reacquire with a queued slow path on contention or thread-identity change)
// and the tail-call jump into another compiled unit.

//! Calling-convention adaptation.

use bumpalo::{collections::Vec as BumpVec, Bump};

use crate::core::error::CompileResult;
use crate::core::regalloc::AsmReg;
use crate::gc::GcDescriptor;
use crate::ir::{CallDescr, ValueKind};
use crate::x64::emitter::{CodeBuffer, Label, Mem};
use crate::x64::location::Location;
use crate::x64::remap::{parallel_move, Move};
use crate::x64::{Abi, Cond, TargetDesc, WordWidth, RAX, RCX, RDX, RSP, R8, R9, RDI, RSI};

const SYSV_GP_ARGS: [AsmReg; 6] = [RDI, RSI, RDX, RCX, R8, R9];
const WIN64_GP_ARGS: [AsmReg; 4] = [RCX, RDX, R8, R9];
const WIN64_SHADOW: i32 = 32;

/// Where the ABI wants one argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AbiSlot {
    Gp(AsmReg),
    Fp(AsmReg),
    /// Byte offset from the stack pointer at the call instruction.
    Stack(i32),
}

/// How a call site names its target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CallTarget {
    /// Absolute address known at compile time.
    Abs(u64),
    /// Target already in a register the marshalling will not touch.
    Reg(AsmReg),
    /// Target spilled to a frame slot; loaded into a dead register at the
    /// call instruction.
    FrameOffset(i32),
}

/// Where the result comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultPlace {
    None,
    /// Integer/reference result register (rax/eax).
    Gp,
    /// Float result in xmm0.
    Fp,
    /// Float result on the x87 stack; the 32-bit convention.
    X87,
}

/// Assigns argument slots for one call site, in declaration order.
pub struct AbiAssigner<'a> {
    target: &'a TargetDesc,
    arg_index: usize,
    gp_count: usize,
    fp_count: usize,
    stack: i32,
}

impl<'a> AbiAssigner<'a> {
    pub fn new(target: &'a TargetDesc) -> Self {
        AbiAssigner {
            target,
            arg_index: 0,
            gp_count: 0,
            fp_count: 0,
            stack: match target.abi {
                Abi::Win64 => WIN64_SHADOW,
                _ => 0,
            },
        }
    }

    pub fn assign(&mut self, kind: ValueKind) -> AbiSlot {
        let slot = match self.target.abi {
            Abi::SysV64 => match kind {
                ValueKind::Float => {
                    if self.fp_count < 8 {
                        let r = AsmReg::fp(self.fp_count as u8);
                        self.fp_count += 1;
                        AbiSlot::Fp(r)
                    } else {
                        self.push_stack(8)
                    }
                }
                _ => {
                    if self.gp_count < SYSV_GP_ARGS.len() {
                        let r = SYSV_GP_ARGS[self.gp_count];
                        self.gp_count += 1;
                        AbiSlot::Gp(r)
                    } else {
                        self.push_stack(8)
                    }
                }
            },
            Abi::Win64 => {
                // Positional slots: an argument burns its slot in both banks.
                if self.arg_index < 4 {
                    let i = self.arg_index;
                    match kind {
                        ValueKind::Float => AbiSlot::Fp(AsmReg::fp(i as u8)),
                        _ => AbiSlot::Gp(WIN64_GP_ARGS[i]),
                    }
                } else {
                    self.push_stack(8)
                }
            }
            Abi::Cdecl32 => {
                let size = if kind.is_float() { 8 } else { 4 };
                self.push_stack(size)
            }
        };
        self.arg_index += 1;
        slot
    }

    fn push_stack(&mut self, size: i32) -> AbiSlot {
        let offset = self.stack;
        self.stack += size;
        AbiSlot::Stack(offset)
    }

    /// Bytes of stack-passed arguments, shadow space included.
    pub fn stack_bytes(&self) -> i32 {
        self.stack
    }

    /// Stack adjustment for the call site, padded to the 16-byte pre-call
    /// alignment the ABIs demand.
    pub fn aligned_stack_bytes(&self) -> i32 {
        (self.stack + 15) & !15
    }
}

/// Result place for a declared result kind on this target.
pub fn result_place(target: &TargetDesc, result: Option<ValueKind>) -> ResultPlace {
    match result {
        None => ResultPlace::None,
        Some(ValueKind::Float) => match target.width {
            WordWidth::W64 => ResultPlace::Fp,
            WordWidth::W32 => ResultPlace::X87,
        },
        Some(_) => ResultPlace::Gp,
    }
}

/// Cold continuation of a lock-releasing call, queued for the unit's tail.
#[derive(Debug, Clone, Copy)]
pub struct LockSlowPath {
    pub slow: Label,
    pub resume: Label,
    /// Slow reacquisition helper address.
    pub helper: u64,
}

/// Emits call sites against one code buffer. Scratch vectors live in the
/// unit's arena.
pub struct CallBuilder<'a> {
    pub buf: &'a mut CodeBuffer,
    pub target: &'a TargetDesc,
    arena: &'a Bump,
}

impl<'a> CallBuilder<'a> {
    pub fn new(buf: &'a mut CodeBuffer, target: &'a TargetDesc, arena: &'a Bump) -> Self {
        CallBuilder { buf, target, arena }
    }

    /// Marshal arguments, emit the call, restore the stack pointer. Returns
    /// where the result lives. `args` pairs each argument's current location
    /// with its declared kind.
    pub fn emit_plain(
        &mut self,
        descr: &CallDescr,
        call_target: CallTarget,
        args: &[(Location, ValueKind)],
    ) -> CompileResult<ResultPlace> {
        assert_eq!(
            descr.args.len(),
            args.len(),
            "call argument count does not match descriptor"
        );
        let sub = self.marshal(args)?;
        self.emit_call_insn(call_target)?;
        if sub != 0 {
            self.buf.add_ri(RSP, sub)?;
        }
        Ok(result_place(self.target, descr.result))
    }

    fn emit_call_insn(&mut self, call_target: CallTarget) -> CompileResult<()> {
        match call_target {
            CallTarget::Abs(addr) => self.buf.call_abs(addr),
            CallTarget::Reg(reg) => self.buf.call_reg(reg),
            CallTarget::FrameOffset(off) => {
                // A register that is dead by construction at the call: the
                // scratch on 64-bit, the result register on 32-bit.
                let tmp = match self.target.width {
                    WordWidth::W64 => crate::x64::R11,
                    WordWidth::W32 => RAX,
                };
                self.buf.load(tmp, Mem::base(crate::x64::FRAME_REG, off))?;
                self.buf.call_reg(tmp)
            }
        }
    }

    /// The lock-releasing variant: release the process-wide lock, call, then
    /// reacquire with a compare-and-swap. Contention or a changed thread
    /// identity falls back to the queued slow path. `saved_slots` is the
    /// offset from the post-prologue stack pointer of the three reserved
    /// native slots (TLS pointer, identity save, result save). An x87 float
    /// result is popped into `x87_sink` before the reacquisition sequence,
    /// which may itself call out.
    pub fn emit_release_lock(
        &mut self,
        descr: &CallDescr,
        call_target: CallTarget,
        args: &[(Location, ValueKind)],
        runtime: &GcDescriptor,
        saved_slots: i32,
        x87_sink: Option<Mem>,
    ) -> CompileResult<(ResultPlace, LockSlowPath)> {
        assert_eq!(
            descr.args.len(),
            args.len(),
            "call argument count does not match descriptor"
        );
        assert!(runtime.lock_addr != 0, "lock-releasing call without a lock word");
        let word = self.target.word();
        let lock = Mem::Abs(runtime.lock_addr as u64);
        let sub = self.marshal(args)?;
        // Reserved native slots, addressed from the moved stack pointer.
        let tls_slot = Mem::base(RSP, saved_slots + sub);
        let ident_slot = Mem::base(RSP, saved_slots + sub + word);
        let result_slot = Mem::base(RSP, saved_slots + sub + 2 * word);

        // Capture the thread identity while we still hold the lock. The
        // scratch register is free here: arguments are already in place and
        // no argument register is the scratch.
        let tmp = self.ident_tmp();
        self.buf.load(tmp, tls_slot)?;
        self.buf.load(tmp, Mem::base(tmp, runtime.tls_ident_offset))?;
        self.buf.store(ident_slot, tmp)?;

        self.buf.store_imm(lock, 0)?;
        self.emit_call_insn(call_target)?;

        let place = result_place(self.target, descr.result);
        match place {
            ResultPlace::Gp => self.buf.store(result_slot, RAX)?,
            ResultPlace::Fp => self.buf.movsd_store(result_slot, AsmReg::fp(0))?,
            // The slow path calls out, and nothing preserves the x87 stack
            // across that; park the result in the caller-provided frame slot.
            ResultPlace::X87 => {
                let sink = x87_sink.expect("x87 result needs a sink slot");
                self.buf.fstp(sink)?;
            }
            ResultPlace::None => {}
        }

        // Fast path: one compare-and-swap, then confirm the logical thread
        // did not change while the lock was released.
        let slow = self.buf.new_label();
        let resume = self.buf.new_label();
        self.buf.xor_rr(RAX, RAX)?;
        self.buf.mov_ri(RCX, 1)?;
        self.buf.cmpxchg_lock(lock, RCX)?;
        self.buf.jcc(Cond::Ne, slow)?;
        self.buf.load(RCX, tls_slot)?;
        self.buf.load(RCX, Mem::base(RCX, runtime.tls_ident_offset))?;
        self.buf.cmp_rm(RCX, ident_slot)?;
        self.buf.jcc(Cond::E, resume)?;
        // We won the race but on the wrong thread: hand the lock back and
        // let the helper sort it out.
        self.buf.store_imm(lock, 0)?;
        self.buf.jmp(slow)?;

        self.buf.bind(resume);
        match place {
            ResultPlace::Gp => self.buf.load(RAX, result_slot)?,
            ResultPlace::Fp => self.buf.movsd_load(AsmReg::fp(0), result_slot)?,
            ResultPlace::X87 | ResultPlace::None => {}
        }
        if sub != 0 {
            self.buf.add_ri(RSP, sub)?;
        }
        Ok((
            place,
            LockSlowPath { slow, resume, helper: runtime.lock_reacquire as u64 },
        ))
    }

    /// Tail-call-like jump into another compiled unit, reusing the frame.
    pub fn emit_tail_jump(&mut self, target_addr: u64) -> CompileResult<()> {
        self.buf.jmp_abs(target_addr)
    }

    fn ident_tmp(&self) -> AsmReg {
        // r10 is free at this point on 64-bit (never an argument register);
        // the 32-bit convention has no register arguments so eax serves.
        match self.target.width {
            WordWidth::W64 => crate::x64::R10,
            WordWidth::W32 => RAX,
        }
    }

    /// Place arguments per the ABI. Returns the stack adjustment to undo
    /// after the call.
    fn marshal(&mut self, args: &[(Location, ValueKind)]) -> CompileResult<i32> {
        let mut assigner = AbiAssigner::new(self.target);
        let mut slots = BumpVec::with_capacity_in(args.len(), self.arena);
        slots.extend(args.iter().map(|&(_, kind)| assigner.assign(kind)));
        let sub = assigner.aligned_stack_bytes();

        if sub != 0 {
            self.buf.add_ri(RSP, -sub)?;
        }
        // Stack-passed arguments first; the scratch register is still free.
        for (slot, &(loc, kind)) in slots.iter().zip(args) {
            if let AbiSlot::Stack(off) = slot {
                self.store_stack_arg(*off, loc, kind)?;
            }
        }
        // Register arguments as one parallel move; sources may be argument
        // registers themselves.
        let mut moves = BumpVec::with_capacity_in(args.len(), self.arena);
        moves.extend(slots.iter().zip(args).filter_map(|(slot, &(loc, kind))| {
            match slot {
                AbiSlot::Gp(r) => Some(Move { src: loc, dst: Location::Gp(*r), kind }),
                AbiSlot::Fp(r) => Some(Move { src: loc, dst: Location::Fp(*r), kind }),
                AbiSlot::Stack(_) => None,
            }
        }));
        parallel_move(self.buf, self.target, &moves)?;
        Ok(sub)
    }

    fn store_stack_arg(&mut self, off: i32, loc: Location, kind: ValueKind) -> CompileResult<()> {
        let dst = Mem::base(RSP, off);
        if kind.is_float() {
            match loc {
                Location::Fp(s) => self.buf.movsd_store(dst, s),
                Location::Stack { slot, .. } => {
                    let src = Mem::base(
                        crate::x64::FRAME_REG,
                        crate::x64::frame_slot_offset(self.buf.width(), slot),
                    );
                    self.buf.movsd_load(self.target.fp_scratch, src)?;
                    self.buf.movsd_store(dst, self.target.fp_scratch)
                }
                Location::Imm(bits) => {
                    self.buf
                        .movsd_const(self.target.fp_scratch, f64::from_bits(bits as u64))?;
                    self.buf.movsd_store(dst, self.target.fp_scratch)
                }
                _ => Err(crate::core::error::CompileError::not_implemented(format!(
                    "float stack argument from {loc:?}"
                ))),
            }
        } else {
            match loc {
                Location::Gp(s) => self.buf.store(dst, s),
                Location::Stack { slot, .. } => {
                    let src = Mem::base(
                        crate::x64::FRAME_REG,
                        crate::x64::frame_slot_offset(self.buf.width(), slot),
                    );
                    // Word memory-to-memory through push/pop keeps the
                    // scratch register out of it.
                    self.buf.push_m(src)?;
                    self.buf.pop_m(dst)
                }
                Location::Imm(v) => {
                    if let Ok(v32) = i32::try_from(v) {
                        self.buf.store_imm(dst, v32)
                    } else {
                        let scratch = self.buf.materialize(v)?;
                        self.buf.store(dst, scratch)
                    }
                }
                _ => Err(crate::core::error::CompileError::not_implemented(format!(
                    "stack argument from {loc:?}"
                ))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assign_all(target: &TargetDesc, kinds: &[ValueKind]) -> (Vec<AbiSlot>, i32, i32) {
        let mut a = AbiAssigner::new(target);
        let slots = kinds.iter().map(|&k| a.assign(k)).collect();
        (slots, a.stack_bytes(), a.aligned_stack_bytes())
    }

    #[test]
    fn test_sysv_register_budget() {
        let t = TargetDesc::sysv64();
        let kinds = vec![ValueKind::Int; 6];
        let (slots, stack, _) = assign_all(&t, &kinds);
        assert_eq!(stack, 0);
        assert_eq!(slots[0], AbiSlot::Gp(RDI));
        assert_eq!(slots[5], AbiSlot::Gp(R9));
    }

    #[test]
    fn test_sysv_overflow_to_stack_with_alignment() {
        // 8 ints + 9 floats: 2 ints and 1 float overflow.
        let t = TargetDesc::sysv64();
        let mut kinds = vec![ValueKind::Int; 8];
        kinds.extend(vec![ValueKind::Float; 9]);
        let (slots, stack, aligned) = assign_all(&t, &kinds);
        assert_eq!(stack, 3 * 8);
        assert_eq!(aligned, 32);
        assert_eq!(slots[6], AbiSlot::Stack(0));
        assert_eq!(slots[7], AbiSlot::Stack(8));
        assert_eq!(slots[8], AbiSlot::Fp(AsmReg::fp(0)));
        assert_eq!(slots[16], AbiSlot::Stack(16));
    }

    #[test]
    fn test_win64_positional_slots_and_shadow_space() {
        let t = TargetDesc::win64();
        let kinds = [ValueKind::Int, ValueKind::Float, ValueKind::Int, ValueKind::Float,
                     ValueKind::Int];
        let (slots, stack, aligned) = assign_all(&t, &kinds);
        // Mixed banks burn positional slots.
        assert_eq!(slots[0], AbiSlot::Gp(RCX));
        assert_eq!(slots[1], AbiSlot::Fp(AsmReg::fp(1)));
        assert_eq!(slots[2], AbiSlot::Gp(R8));
        assert_eq!(slots[3], AbiSlot::Fp(AsmReg::fp(3)));
        // Fifth argument lands past the 32-byte shadow space.
        assert_eq!(slots[4], AbiSlot::Stack(32));
        assert_eq!(stack, 40);
        assert_eq!(aligned, 48);
    }

    #[test]
    fn test_cdecl32_everything_on_stack() {
        let t = TargetDesc::cdecl32();
        let kinds = [ValueKind::Int, ValueKind::Float, ValueKind::Int];
        let (slots, stack, aligned) = assign_all(&t, &kinds);
        assert_eq!(slots[0], AbiSlot::Stack(0));
        assert_eq!(slots[1], AbiSlot::Stack(4));
        assert_eq!(slots[2], AbiSlot::Stack(12));
        assert_eq!(stack, 16);
        assert_eq!(aligned, 16);
    }

    #[test]
    fn test_result_places() {
        assert_eq!(result_place(&TargetDesc::sysv64(), None), ResultPlace::None);
        assert_eq!(
            result_place(&TargetDesc::sysv64(), Some(ValueKind::Ref)),
            ResultPlace::Gp
        );
        assert_eq!(
            result_place(&TargetDesc::sysv64(), Some(ValueKind::Float)),
            ResultPlace::Fp
        );
        assert_eq!(
            result_place(&TargetDesc::cdecl32(), Some(ValueKind::Float)),
            ResultPlace::X87
        );
    }

    #[test]
    #[should_panic(expected = "argument count")]
    fn test_descriptor_mismatch_asserts() {
        let t = TargetDesc::sysv64();
        let arena = Bump::new();
        let mut buf = CodeBuffer::new(WordWidth::W64);
        let mut cb = CallBuilder::new(&mut buf, &t, &arena);
        let descr = CallDescr::new(vec![ValueKind::Int, ValueKind::Int], None);
        let args = [(Location::Imm(1), ValueKind::Int)];
        let _ = cb.emit_plain(&descr, CallTarget::Abs(0x1000), &args);
    }
}
