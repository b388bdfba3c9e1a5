//! Whole-trace allocation properties: units under register pressure stay
//! decodable, spill bookkeeping shows up in the frame depth, compilation is
//! structurally deterministic, and call sites keep the stack aligned.

use hotloop::{
    CallDescr, Const, Descr, GcDescriptor, Opcode, Runner, TargetDesc, TraceOp, Value, ValueKind,
};
use iced_x86::{Decoder, DecoderOptions, Mnemonic, Register};

fn decode_mnemonics(bitness: u32, bytes: &[u8]) -> Vec<iced_x86::Instruction> {
    let mut decoder = Decoder::with_ip(bitness, bytes, 0, DecoderOptions::NONE);
    let mut out = Vec::new();
    while decoder.can_decode() {
        let insn = decoder.decode();
        assert_ne!(
            insn.mnemonic(),
            Mnemonic::INVALID,
            "invalid encoding at offset {}",
            insn.ip()
        );
        out.push(insn);
    }
    out
}

/// Twenty simultaneously live sums: far more values than registers.
fn pressure_trace() -> Vec<TraceOp> {
    let n = 20;
    let mut ops: Vec<TraceOp> = (0..n)
        .map(|i| {
            TraceOp::new(
                Opcode::IntAdd,
                vec![Value::Input(0), Value::Const(Const::Int(i as i64))],
            )
        })
        .collect();
    ops.push(TraceOp::with_descr(
        Opcode::Finish,
        (0..n).map(Value::Op).collect(),
        Descr::Deopt(1),
    ));
    ops
}

#[test]
fn test_pressure_trace_spills_and_stays_decodable() {
    for target in [TargetDesc::sysv64(), TargetDesc::win64(), TargetDesc::cdecl32()] {
        let bitness = target.width.bitness();
        let fixed = hotloop::x64::fixed_frame_slots(target.width);
        let runner = Runner::new(target, GcDescriptor::default());
        let unit = runner
            .compile_loop(&[ValueKind::Int], &pressure_trace())
            .unwrap();
        // Spills happened: the frame grew past the input slot.
        assert!(
            unit.frame_depth > fixed + 1,
            "no spills under pressure (depth {})",
            unit.frame_depth
        );
        decode_mnemonics(bitness, &unit.code_bytes());
        // Every fail location of the Finish names distinct storage.
        let locs = &unit.finishes[0].fail_locations;
        for (i, a) in locs.iter().enumerate() {
            for b in locs.iter().skip(i + 1) {
                assert_ne!(a, b, "two live values share a location");
            }
        }
    }
}

#[test]
fn test_compilation_is_structurally_deterministic() {
    let runner = Runner::new(TargetDesc::sysv64(), GcDescriptor::default());
    let a = runner
        .compile_loop(&[ValueKind::Int], &pressure_trace())
        .unwrap();
    let b = runner
        .compile_loop(&[ValueKind::Int], &pressure_trace())
        .unwrap();
    // Embedded root-map addresses differ between runs; shape may not.
    assert_eq!(a.code_size, b.code_size);
    assert_eq!(a.op_offsets, b.op_offsets);
    assert_eq!(a.frame_depth, b.frame_depth);
    assert_eq!(
        a.finishes[0].fail_locations,
        b.finishes[0].fail_locations
    );
}

#[test]
fn test_call_site_keeps_stack_aligned() {
    // Ten integer arguments: four overflow to the stack, 32 bytes, already
    // 16-aligned; the site must adjust by exactly that.
    let runner = Runner::new(TargetDesc::sysv64(), GcDescriptor::default());
    let descr = CallDescr::new(vec![ValueKind::Int; 10], Some(ValueKind::Int));
    let mut args = vec![Value::Const(Const::Int(0x7000_0000))];
    args.extend((0..10).map(|i| Value::Const(Const::Int(i))));
    let ops = vec![
        TraceOp::with_descr(Opcode::Call, args, Descr::Call(descr)),
        TraceOp::with_descr(Opcode::Finish, vec![Value::Op(0)], Descr::Deopt(2)),
    ];
    let unit = runner.compile_loop(&[], &ops).unwrap();
    let insns = decode_mnemonics(64, &unit.code_bytes());
    let rsp_adjusts: Vec<i32> = insns
        .iter()
        .filter(|i| i.mnemonic() == Mnemonic::Add && i.op0_register() == Register::RSP)
        .map(|i| i.immediate32() as i32)
        .collect();
    // Prologue reserve, the call site's down-and-up, and the epilogues.
    assert!(rsp_adjusts.contains(&-32), "missing 32-byte argument area: {rsp_adjusts:?}");
    assert!(rsp_adjusts.contains(&32), "argument area never released: {rsp_adjusts:?}");
}

#[test]
fn test_exception_plumbing_appears_around_calls() {
    static EXC_TYPE: usize = 0;
    static EXC_VALUE: usize = 0;
    let runtime = GcDescriptor {
        exc_type_addr: &EXC_TYPE as *const usize as usize,
        exc_value_addr: &EXC_VALUE as *const usize as usize,
        ..GcDescriptor::default()
    };
    let runner = Runner::new(TargetDesc::sysv64(), runtime);
    let mut descr = CallDescr::new(vec![], None);
    descr.save_exception = true;
    let ops = vec![
        TraceOp::with_descr(
            Opcode::Call,
            vec![Value::Const(Const::Int(0x7100_0000))],
            Descr::Call(descr),
        ),
        TraceOp::guard(Opcode::GuardNoException, vec![], vec![], 8),
        TraceOp::with_descr(Opcode::Finish, vec![], Descr::Deopt(2)),
    ];
    let unit = runner.compile_loop(&[], &ops).unwrap();
    let insns = decode_mnemonics(64, &unit.code_bytes());
    // The exception value is copied into the frame's exception slot
    // (offset 16 from the frame register) after the call.
    let saves_exc = insns.iter().any(|i| {
        i.mnemonic() == Mnemonic::Mov
            && i.memory_base() == Register::RBP
            && i.memory_displacement64() == 16
    });
    assert!(saves_exc, "no exception save into the frame header");
    assert_eq!(unit.guards.len(), 1);
    assert_eq!(unit.guards[0].descr_id, 8);
}

#[test]
fn test_shadow_stack_push_and_pop_emitted() {
    static ROOT_TOP: usize = 0;
    let runtime = GcDescriptor {
        root_stack_top_addr: &ROOT_TOP as *const usize as usize,
        ..GcDescriptor::default()
    };
    let runner = Runner::new(TargetDesc::sysv64(), runtime);
    let ops = vec![TraceOp::with_descr(Opcode::Finish, vec![], Descr::Deopt(1))];
    let unit = runner.compile_loop(&[], &ops).unwrap();
    let insns = decode_mnemonics(64, &unit.code_bytes());
    // Push in the prologue bumps the top by a word; the exit undoes it.
    let bumps: Vec<i32> = insns
        .iter()
        .filter(|i| {
            i.mnemonic() == Mnemonic::Add
                && i.op0_register() != Register::RSP
                && i.op0_register() != Register::None
        })
        .map(|i| i.immediate32() as i32)
        .collect();
    assert!(bumps.contains(&8), "no shadow-stack push bump: {bumps:?}");
    assert!(bumps.contains(&-8), "no shadow-stack pop: {bumps:?}");
}
