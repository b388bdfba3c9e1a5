// This module resolves parallel moves: a set of (source, destination) location
// pairs that must all appear to happen at once. The closing jump of a loop must
// reconcile current value locations with the layout the loop header recorded,
// and the call builder must place arguments into ABI-mandated locations; both
// reduce to the same problem. Moves whose destination blocks no other pending
// source are emitted first; a two-register cycle becomes an explicit exchange,
// and longer cycles break by parking one value: general-purpose words on the
// native stack with a push/pop pair, floats in the reserved float scratch
// register. Memory-to-memory word moves also go through push/pop so the
// general-purpose scratch register stays free for address materialization.

//! Parallel-move resolution.

use crate::core::error::CompileResult;
use crate::ir::ValueKind;
use crate::x64::emitter::{CodeBuffer, Mem};
use crate::x64::location::Location;
use crate::x64::{frame_slot_offset, TargetDesc, FRAME_REG};

/// One pending assignment.
#[derive(Debug, Clone, Copy)]
pub struct Move {
    pub src: Location,
    pub dst: Location,
    pub kind: ValueKind,
}

fn stack_mem(buf: &CodeBuffer, slot: u32) -> Mem {
    Mem::base(FRAME_REG, frame_slot_offset(buf.width(), slot))
}

/// Emit one move, sources and destinations already known not to conflict.
pub fn emit_move(buf: &mut CodeBuffer, target: &TargetDesc, mv: &Move) -> CompileResult<()> {
    if mv.src == mv.dst {
        return Ok(());
    }
    if mv.kind.is_float() {
        return emit_float_move(buf, target, mv);
    }
    match (mv.src, mv.dst) {
        (Location::Gp(s), Location::Gp(d)) => buf.mov_rr(d, s),
        (Location::Gp(s), Location::Stack { slot, .. }) => {
            let m = stack_mem(buf, slot);
            buf.store(m, s)
        }
        (Location::Stack { slot, .. }, Location::Gp(d)) => {
            let m = stack_mem(buf, slot);
            buf.load(d, m)
        }
        (Location::Stack { slot: s, .. }, Location::Stack { slot: d, .. }) => {
            // Word memory-to-memory without touching any register.
            let sm = stack_mem(buf, s);
            let dm = stack_mem(buf, d);
            buf.push_m(sm)?;
            buf.pop_m(dm)
        }
        (Location::Imm(v), Location::Gp(d)) => buf.mov_ri(d, v),
        (Location::Imm(v), Location::Stack { slot, .. }) => {
            let m = stack_mem(buf, slot);
            if let Ok(v32) = i32::try_from(v) {
                buf.store_imm(m, v32)
            } else {
                let scratch = buf.materialize(v)?;
                buf.store(m, scratch)
            }
        }
        (Location::Mem(addr), Location::Gp(d)) => buf.load(d, Mem::Abs(addr)),
        (Location::Gp(s), Location::Mem(addr)) => buf.store(Mem::Abs(addr), s),
        (src, dst) => Err(crate::core::error::CompileError::not_implemented(format!(
            "move {src:?} -> {dst:?}"
        ))),
    }
}

fn emit_float_move(buf: &mut CodeBuffer, target: &TargetDesc, mv: &Move) -> CompileResult<()> {
    match (mv.src, mv.dst) {
        (Location::Fp(s), Location::Fp(d)) => buf.movsd_rr(d, s),
        (Location::Fp(s), Location::Stack { slot, .. }) => {
            let m = stack_mem(buf, slot);
            buf.movsd_store(m, s)
        }
        (Location::Stack { slot, .. }, Location::Fp(d)) => {
            let m = stack_mem(buf, slot);
            buf.movsd_load(d, m)
        }
        (Location::Stack { slot: s, .. }, Location::Stack { slot: d, .. }) => {
            let sm = stack_mem(buf, s);
            let dm = stack_mem(buf, d);
            buf.movsd_load(target.fp_scratch, sm)?;
            buf.movsd_store(dm, target.fp_scratch)
        }
        (Location::Imm(bits), Location::Fp(d)) => buf.movsd_const(d, f64::from_bits(bits as u64)),
        (Location::Imm(bits), Location::Stack { slot, .. }) => {
            buf.movsd_const(target.fp_scratch, f64::from_bits(bits as u64))?;
            let m = stack_mem(buf, slot);
            buf.movsd_store(m, target.fp_scratch)
        }
        (src, dst) => Err(crate::core::error::CompileError::not_implemented(format!(
            "float move {src:?} -> {dst:?}"
        ))),
    }
}

/// Emit a set of moves that must be observed as simultaneous.
pub fn parallel_move(
    buf: &mut CodeBuffer,
    target: &TargetDesc,
    moves: &[Move],
) -> CompileResult<()> {
    let width = buf.width();
    let word = width.bytes();
    let mut pending: Vec<Move> = moves
        .iter()
        .filter(|m| m.src != m.dst)
        .copied()
        .collect();
    // Values parked on the native stack while their destinations clear, in
    // push order. Unparking happens in reverse once nothing reads anything.
    let mut parked: Vec<(Location, ValueKind)> = Vec::new();

    while !pending.is_empty() {
        let mut progressed = false;
        let mut i = 0;
        while i < pending.len() {
            let dst = pending[i].dst;
            let blocks = pending
                .iter()
                .enumerate()
                .any(|(j, other)| j != i && other.src.overlaps(&dst, width));
            if blocks {
                i += 1;
                continue;
            }
            let mv = pending.swap_remove(i);
            emit_move(buf, target, &mv)?;
            progressed = true;
        }
        if pending.is_empty() {
            break;
        }
        if !progressed {
            // Every pending destination is somebody's source: a cycle.
            if pending.len() == 2
                && pending[0].src == pending[1].dst
                && pending[1].src == pending[0].dst
            {
                if let (Location::Gp(a), Location::Gp(b)) = (pending[0].src, pending[0].dst) {
                    // The explicit swap sequence; the only point where two
                    // live values transiently share an instruction.
                    buf.xchg_rr(a, b)?;
                    pending.clear();
                    break;
                }
            }
            // Park one source on the native stack and retry; its destination
            // stops blocking the rest of the cycle.
            let mv = pending.swap_remove(0);
            if mv.kind.is_float() {
                buf.add_ri(crate::x64::RSP, -(2 * word))?;
                match mv.src {
                    Location::Fp(s) => buf.movsd_store(Mem::base(crate::x64::RSP, 0), s)?,
                    Location::Stack { slot, .. } => {
                        let m = stack_mem(buf, slot);
                        buf.movsd_load(target.fp_scratch, m)?;
                        buf.movsd_store(Mem::base(crate::x64::RSP, 0), target.fp_scratch)?;
                    }
                    _ => unreachable!("cycles only involve registers and slots"),
                }
            } else {
                match mv.src {
                    Location::Gp(s) => buf.push_r(s)?,
                    Location::Stack { slot, .. } => {
                        let m = stack_mem(buf, slot);
                        buf.push_m(m)?;
                    }
                    _ => unreachable!("cycles only involve registers and slots"),
                }
            }
            parked.push((mv.dst, mv.kind));
        }
    }

    for (dst, kind) in parked.into_iter().rev() {
        if kind.is_float() {
            match dst {
                Location::Fp(d) => buf.movsd_load(d, Mem::base(crate::x64::RSP, 0))?,
                Location::Stack { slot, .. } => {
                    buf.movsd_load(target.fp_scratch, Mem::base(crate::x64::RSP, 0))?;
                    let m = stack_mem(buf, slot);
                    buf.movsd_store(m, target.fp_scratch)?;
                }
                _ => unreachable!(),
            }
            buf.add_ri(crate::x64::RSP, 2 * word)?;
        } else {
            match dst {
                Location::Gp(d) => buf.pop_r(d)?,
                Location::Stack { slot, .. } => {
                    let m = stack_mem(buf, slot);
                    buf.pop_m(m)?;
                }
                _ => unreachable!(),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x64::{TargetDesc, WordWidth, RAX, RCX, RDX};
    use iced_x86::{Decoder, DecoderOptions, Mnemonic};

    fn mnemonics(width: WordWidth, bytes: &[u8]) -> Vec<Mnemonic> {
        let mut d = Decoder::with_ip(width.bitness(), bytes, 0, DecoderOptions::NONE);
        let mut out = Vec::new();
        while d.can_decode() {
            out.push(d.decode().mnemonic());
        }
        out
    }

    fn gp(r: crate::core::regalloc::AsmReg) -> Location {
        Location::Gp(r)
    }

    #[test]
    fn test_independent_moves_emit_directly() {
        let target = TargetDesc::sysv64();
        let mut buf = CodeBuffer::new(WordWidth::W64);
        parallel_move(
            &mut buf,
            &target,
            &[
                Move { src: gp(RAX), dst: Location::stack(32, ValueKind::Int), kind: ValueKind::Int },
                Move { src: Location::Imm(3), dst: gp(RCX), kind: ValueKind::Int },
            ],
        )
        .unwrap();
        let art = buf.finish();
        assert_eq!(art.code.is_empty(), false);
        let m = mnemonics(WordWidth::W64, &art.code);
        assert_eq!(m, vec![Mnemonic::Mov, Mnemonic::Mov]);
    }

    #[test]
    fn test_two_register_cycle_becomes_xchg() {
        let target = TargetDesc::sysv64();
        let mut buf = CodeBuffer::new(WordWidth::W64);
        parallel_move(
            &mut buf,
            &target,
            &[
                Move { src: gp(RAX), dst: gp(RCX), kind: ValueKind::Int },
                Move { src: gp(RCX), dst: gp(RAX), kind: ValueKind::Int },
            ],
        )
        .unwrap();
        let art = buf.finish();
        let m = mnemonics(WordWidth::W64, &art.code);
        assert_eq!(m, vec![Mnemonic::Xchg]);
    }

    #[test]
    fn test_three_cycle_parks_one_value() {
        let target = TargetDesc::sysv64();
        let mut buf = CodeBuffer::new(WordWidth::W64);
        parallel_move(
            &mut buf,
            &target,
            &[
                Move { src: gp(RAX), dst: gp(RCX), kind: ValueKind::Int },
                Move { src: gp(RCX), dst: gp(RDX), kind: ValueKind::Int },
                Move { src: gp(RDX), dst: gp(RAX), kind: ValueKind::Int },
            ],
        )
        .unwrap();
        let art = buf.finish();
        let m = mnemonics(WordWidth::W64, &art.code);
        // One parked value: push, the two unblocked moves, pop.
        assert_eq!(m, vec![Mnemonic::Push, Mnemonic::Mov, Mnemonic::Mov, Mnemonic::Pop]);
    }

    #[test]
    fn test_chain_is_ordered_not_parked() {
        let target = TargetDesc::sysv64();
        let mut buf = CodeBuffer::new(WordWidth::W64);
        // rcx <- rax must wait until rdx <- rcx has read rcx.
        parallel_move(
            &mut buf,
            &target,
            &[
                Move { src: gp(RAX), dst: gp(RCX), kind: ValueKind::Int },
                Move { src: gp(RCX), dst: gp(RDX), kind: ValueKind::Int },
            ],
        )
        .unwrap();
        let art = buf.finish();
        let m = mnemonics(WordWidth::W64, &art.code);
        assert_eq!(m, vec![Mnemonic::Mov, Mnemonic::Mov]);
        // First instruction must read rcx, not write it.
        let mut d = Decoder::with_ip(64, &art.code, 0, DecoderOptions::NONE);
        let first = d.decode();
        assert_eq!(first.op1_register(), iced_x86::Register::RCX);
    }

    #[test]
    fn test_stack_to_stack_uses_push_pop() {
        let target = TargetDesc::sysv64();
        let mut buf = CodeBuffer::new(WordWidth::W64);
        parallel_move(
            &mut buf,
            &target,
            &[Move {
                src: Location::stack(32, ValueKind::Int),
                dst: Location::stack(33, ValueKind::Int),
                kind: ValueKind::Int,
            }],
        )
        .unwrap();
        let art = buf.finish();
        let m = mnemonics(WordWidth::W64, &art.code);
        assert_eq!(m, vec![Mnemonic::Push, Mnemonic::Pop]);
    }
}
