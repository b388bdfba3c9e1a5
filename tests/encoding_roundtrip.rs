//! Encode-then-decode checks over the emitter surface: every emitted
//! (mnemonic, operand-shape) pair must decode back to the same mnemonic and
//! operand values, on both ISA width variants.

use hotloop::core::AsmReg;
use hotloop::x64::emitter::{CodeBuffer, Mem};
use hotloop::x64::{Cond, WordWidth, RAX, RBP, RCX, RDX, RSI};
use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic, Register};

fn decode_all(width: WordWidth, bytes: &[u8]) -> Vec<Instruction> {
    let mut decoder = Decoder::with_ip(width.bitness(), bytes, 0, DecoderOptions::NONE);
    let mut out = Vec::new();
    while decoder.can_decode() {
        let insn = decoder.decode();
        assert_ne!(insn.mnemonic(), Mnemonic::INVALID, "undecodable bytes");
        out.push(insn);
    }
    out
}

#[test]
fn test_integer_alu_round_trip_both_widths() {
    for width in [WordWidth::W64, WordWidth::W32] {
        let mut buf = CodeBuffer::new(width);
        buf.mov_rr(RAX, RCX).unwrap();
        buf.add_ri(RAX, 1000).unwrap();
        buf.sub_rr(RDX, RAX).unwrap();
        buf.and_ri(RCX, 0xff).unwrap();
        buf.or_rm(RAX, Mem::base(RBP, 40)).unwrap();
        buf.xor_rr(RDX, RDX).unwrap();
        buf.imul_rri(RAX, RCX, 12).unwrap();
        buf.neg(RAX).unwrap();
        buf.not(RCX).unwrap();
        let art = buf.finish();
        let insns = decode_all(width, &art.code);
        let expect = [
            Mnemonic::Mov,
            Mnemonic::Add,
            Mnemonic::Sub,
            Mnemonic::And,
            Mnemonic::Or,
            Mnemonic::Xor,
            Mnemonic::Imul,
            Mnemonic::Neg,
            Mnemonic::Not,
        ];
        let got: Vec<Mnemonic> = insns.iter().map(|i| i.mnemonic()).collect();
        assert_eq!(got, expect, "width {width:?}");
        assert_eq!(insns[1].immediate32(), 1000);
        assert_eq!(insns[4].memory_displacement64(), 40);
        assert_eq!(insns[6].immediate32(), 12);
        // Register identities survive the round trip.
        match width {
            WordWidth::W64 => {
                assert_eq!(insns[0].op0_register(), Register::RAX);
                assert_eq!(insns[0].op1_register(), Register::RCX);
            }
            WordWidth::W32 => {
                assert_eq!(insns[0].op0_register(), Register::EAX);
                assert_eq!(insns[0].op1_register(), Register::ECX);
            }
        }
    }
}

#[test]
fn test_shift_and_compare_round_trip() {
    for width in [WordWidth::W64, WordWidth::W32] {
        let mut buf = CodeBuffer::new(width);
        buf.shl_ri(RAX, 3).unwrap();
        buf.sar_cl(RDX).unwrap();
        buf.shr_ri(RAX, 1).unwrap();
        buf.cmp_ri(RAX, -5).unwrap();
        buf.cmp_rm(RDX, Mem::base(RBP, 8)).unwrap();
        buf.test_rr(RAX, RAX).unwrap();
        buf.setcc(Cond::L, RCX).unwrap();
        buf.movzx8(RCX).unwrap();
        let art = buf.finish();
        let insns = decode_all(width, &art.code);
        let got: Vec<Mnemonic> = insns.iter().map(|i| i.mnemonic()).collect();
        assert_eq!(
            got,
            [
                Mnemonic::Shl,
                Mnemonic::Sar,
                Mnemonic::Shr,
                Mnemonic::Cmp,
                Mnemonic::Cmp,
                Mnemonic::Test,
                Mnemonic::Setl,
                Mnemonic::Movzx,
            ]
        );
        assert_eq!(insns[0].immediate8(), 3);
        assert_eq!(insns[3].immediate32() as i32, -5);
    }
}

#[test]
fn test_memory_forms_round_trip() {
    for width in [WordWidth::W64, WordWidth::W32] {
        let mut buf = CodeBuffer::new(width);
        buf.load(RAX, Mem::base(RBP, 288)).unwrap();
        buf.store(Mem::base(RBP, 296), RDX).unwrap();
        buf.store_imm(Mem::base(RBP, 32), 99).unwrap();
        buf.load_sized(RCX, Mem::base(RAX, 1), 1, false).unwrap();
        buf.load_sized(RCX, Mem::base(RAX, 2), 2, true).unwrap();
        buf.store_sized(Mem::base(RAX, 4), RDX, 4).unwrap();
        buf.lea(RAX, Mem::base(RBP, -16)).unwrap();
        buf.push_m(Mem::base(RBP, 8)).unwrap();
        buf.pop_m(Mem::base(RBP, 16)).unwrap();
        buf.xchg_rr(RAX, RDX).unwrap();
        let art = buf.finish();
        let insns = decode_all(width, &art.code);
        assert_eq!(insns[0].memory_displacement64(), 288);
        assert_eq!(insns[1].memory_displacement64(), 296);
        assert_eq!(insns[2].immediate32(), 99);
        assert_eq!(insns[3].mnemonic(), Mnemonic::Movzx);
        assert_eq!(insns[4].mnemonic(), Mnemonic::Movsx);
        assert_eq!(insns[6].mnemonic(), Mnemonic::Lea);
        assert_eq!(insns[7].mnemonic(), Mnemonic::Push);
        assert_eq!(insns[8].mnemonic(), Mnemonic::Pop);
        assert_eq!(insns[9].mnemonic(), Mnemonic::Xchg);
    }
}

#[test]
fn test_float_forms_round_trip() {
    for width in [WordWidth::W64, WordWidth::W32] {
        let xmm1 = AsmReg::fp(1);
        let xmm2 = AsmReg::fp(2);
        let mut buf = CodeBuffer::new(width);
        buf.movsd_rr(xmm1, xmm2).unwrap();
        buf.movsd_load(xmm1, Mem::base(RBP, 48)).unwrap();
        buf.movsd_store(Mem::base(RBP, 56), xmm2).unwrap();
        buf.addsd(xmm1, xmm2).unwrap();
        buf.subsd(xmm1, xmm2).unwrap();
        buf.mulsd(xmm1, xmm2).unwrap();
        buf.divsd(xmm1, xmm2).unwrap();
        buf.ucomisd(xmm1, xmm2).unwrap();
        buf.cvttsd2si(RAX, xmm1).unwrap();
        buf.cvtsi2sd(xmm1, RAX).unwrap();
        let art = buf.finish();
        let insns = decode_all(width, &art.code);
        let got: Vec<Mnemonic> = insns.iter().map(|i| i.mnemonic()).collect();
        assert_eq!(
            got,
            [
                Mnemonic::Movsd,
                Mnemonic::Movsd,
                Mnemonic::Movsd,
                Mnemonic::Addsd,
                Mnemonic::Subsd,
                Mnemonic::Mulsd,
                Mnemonic::Divsd,
                Mnemonic::Ucomisd,
                Mnemonic::Cvttsd2si,
                Mnemonic::Cvtsi2sd,
            ]
        );
        assert_eq!(insns[0].op0_register(), Register::XMM1);
        assert_eq!(insns[0].op1_register(), Register::XMM2);
        assert_eq!(insns[1].memory_displacement64(), 48);
    }
}

#[test]
fn test_branches_calls_and_atomics_round_trip() {
    let mut buf = CodeBuffer::new(WordWidth::W64);
    let target = buf.new_label();
    buf.jcc(Cond::Ge, target).unwrap();
    buf.jmp(target).unwrap();
    buf.bind(target);
    buf.call_reg(RAX).unwrap();
    buf.jmp_reg(RDX).unwrap();
    buf.cmpxchg_lock(Mem::base(RSI, 0), RCX).unwrap();
    buf.bts(Mem::base(RAX, -8), RDX).unwrap();
    buf.ret().unwrap();
    let art = buf.finish();
    let insns = decode_all(WordWidth::W64, &art.code);
    let got: Vec<Mnemonic> = insns.iter().map(|i| i.mnemonic()).collect();
    assert_eq!(
        got,
        [
            Mnemonic::Jge,
            Mnemonic::Jmp,
            Mnemonic::Call,
            Mnemonic::Jmp,
            Mnemonic::Cmpxchg,
            Mnemonic::Bts,
            Mnemonic::Ret,
        ]
    );
    // Both branches resolve to the bound label.
    let bound = insns[0].len() + insns[1].len();
    assert_eq!(insns[0].near_branch64(), bound as u64);
    assert_eq!(insns[1].near_branch64(), bound as u64);
    assert!(insns[4].has_lock_prefix());
}

#[test]
fn test_x87_store_on_narrow_variant() {
    let mut buf = CodeBuffer::new(WordWidth::W32);
    buf.fstp(Mem::base(RBP, 120)).unwrap();
    let art = buf.finish();
    let insns = decode_all(WordWidth::W32, &art.code);
    assert_eq!(insns[0].mnemonic(), Mnemonic::Fstp);
    assert_eq!(insns[0].memory_displacement64(), 120);
}
