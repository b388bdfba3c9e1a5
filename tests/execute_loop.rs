//! End-to-end execution of compiled traces on the host.

#![cfg(target_arch = "x86_64")]

use hotloop::{
    CompiledUnit, Const, Descr, FieldDescr, GcDescriptor, Opcode, OwnedJitFrame, Runner,
    TargetDesc, TraceOp, Value, ValueKind, WriteBarrierDescr,
};
use std::sync::atomic::{AtomicUsize, Ordering};

fn runner() -> Runner {
    let _ = env_logger::builder().is_test(true).try_init();
    Runner::new(TargetDesc::host(), GcDescriptor::default())
}

fn run(unit: &CompiledUnit, frame: &mut OwnedJitFrame) {
    let entry = unit.entry_fn();
    let out = unsafe { entry(frame.as_mut_ptr(), std::ptr::null_mut()) };
    // No frame reallocation is configured; the same frame comes back.
    assert_eq!(out, frame.as_mut_ptr());
}

fn v_in(i: usize) -> Value {
    Value::Input(i)
}
fn v_op(j: usize) -> Value {
    Value::Op(j)
}
fn c_int(v: i64) -> Value {
    Value::Const(Const::Int(v))
}

/// result = a + b; guard(result < 10); finish(result)
fn add_guard_trace() -> Vec<TraceOp> {
    vec![
        TraceOp::new(Opcode::IntAdd, vec![v_in(0), v_in(1)]),
        TraceOp::new(Opcode::IntLt, vec![v_op(0), c_int(10)]),
        TraceOp::guard(Opcode::GuardTrue, vec![v_op(1)], vec![v_op(0)], 42),
        TraceOp::with_descr(Opcode::Finish, vec![v_op(0)], Descr::Deopt(1)),
    ]
}

#[test]
fn test_add_guard_takes_true_branch() {
    let runner = runner();
    let unit = runner
        .compile_loop(&[ValueKind::Int, ValueKind::Int], &add_guard_trace())
        .unwrap();

    let mut frame = OwnedJitFrame::for_unit(&unit);
    frame.write_location(&unit.input_locations[0], 3);
    frame.write_location(&unit.input_locations[1], 4);
    run(&unit, &mut frame);

    // 3 + 4 = 7 < 10: the guard holds and Finish is reached.
    assert_eq!(frame.descr(), 1);
    assert_eq!(frame.read_location(&unit.finishes[0].fail_locations[0]), 7);
}

#[test]
fn test_add_guard_takes_recovery_path() {
    let runner = runner();
    let unit = runner
        .compile_loop(&[ValueKind::Int, ValueKind::Int], &add_guard_trace())
        .unwrap();

    let mut frame = OwnedJitFrame::for_unit(&unit);
    frame.write_location(&unit.input_locations[0], 7);
    frame.write_location(&unit.input_locations[1], 4);
    run(&unit, &mut frame);

    // 7 + 4 = 11: deoptimize through the stub; the fail location exposes 11.
    assert_eq!(frame.descr(), 42);
    assert_eq!(frame.read_location(&unit.guards[0].fail_locations[0]), 11);
    // The stub pushed its root bitmap.
    assert_ne!(frame.gc_map(), 0);
}

#[test]
fn test_counting_loop_runs_the_back_edge() {
    let runner = runner();
    // label(i); v = i + 1; guard(v < 10); jump(v)
    let ops = vec![
        TraceOp::new(Opcode::Label, vec![v_in(0)]),
        TraceOp::new(Opcode::IntAdd, vec![v_in(0), c_int(1)]),
        TraceOp::new(Opcode::IntLt, vec![v_op(1), c_int(10)]),
        TraceOp::guard(Opcode::GuardTrue, vec![v_op(2)], vec![v_op(1)], 5),
        TraceOp::new(Opcode::Jump, vec![v_op(1)]),
    ];
    let unit = runner.compile_loop(&[ValueKind::Int], &ops).unwrap();
    assert!(unit.loop_start > unit.entry);

    let mut frame = OwnedJitFrame::for_unit(&unit);
    frame.write_location(&unit.input_locations[0], 3);
    run(&unit, &mut frame);

    // Counts 3 -> 10, then the guard fails with the counter at 10.
    assert_eq!(frame.descr(), 5);
    assert_eq!(frame.read_location(&unit.guards[0].fail_locations[0]), 10);
}

#[test]
fn test_bridge_attaches_to_failing_guard() {
    let runner = runner();
    let mut loop_unit = runner
        .compile_loop(&[ValueKind::Int, ValueKind::Int], &add_guard_trace())
        .unwrap();

    // w = v + 100; finish(w)
    let bridge_ops = vec![
        TraceOp::new(Opcode::IntAdd, vec![v_in(0), c_int(100)]),
        TraceOp::with_descr(Opcode::Finish, vec![v_op(0)], Descr::Deopt(55)),
    ];
    let bridge = runner
        .compile_bridge(&mut loop_unit, 0, &[ValueKind::Int], &bridge_ops)
        .unwrap();

    let mut frame = OwnedJitFrame::for_unit(&loop_unit);
    frame.write_location(&loop_unit.input_locations[0], 7);
    frame.write_location(&loop_unit.input_locations[1], 4);
    run(&loop_unit, &mut frame);

    // The guard no longer deoptimizes: it enters the bridge instead.
    assert_eq!(frame.descr(), 55);
    assert_eq!(frame.read_location(&bridge.finishes[0].fail_locations[0]), 111);
}

#[test]
fn test_invalidated_guard_always_deoptimizes() {
    let runner = runner();
    let mut unit = runner
        .compile_loop(&[ValueKind::Int, ValueKind::Int], &add_guard_trace())
        .unwrap();
    unit.invalidate_guard(0).unwrap();

    let mut frame = OwnedJitFrame::for_unit(&unit);
    frame.write_location(&unit.input_locations[0], 3);
    frame.write_location(&unit.input_locations[1], 4);
    run(&unit, &mut frame);

    // 7 < 10 would pass, but the site now jumps straight to the stub.
    assert_eq!(frame.descr(), 42);
    assert_eq!(frame.read_location(&unit.guards[0].fail_locations[0]), 7);
}

#[test]
fn test_float_loop_through_constant_table() {
    let runner = runner();
    let ops = vec![
        TraceOp::new(Opcode::FloatAdd, vec![v_in(0), v_in(1)]),
        TraceOp::new(
            Opcode::FloatLt,
            vec![v_op(0), Value::Const(Const::Float(10.0))],
        ),
        TraceOp::guard(Opcode::GuardTrue, vec![v_op(1)], vec![v_op(0)], 42),
        TraceOp::with_descr(Opcode::Finish, vec![v_op(0)], Descr::Deopt(1)),
    ];
    let unit = runner
        .compile_loop(&[ValueKind::Float, ValueKind::Float], &ops)
        .unwrap();

    let mut frame = OwnedJitFrame::for_unit(&unit);
    frame.write_location(&unit.input_locations[0], 1.5f64.to_bits() as usize);
    frame.write_location(&unit.input_locations[1], 2.25f64.to_bits() as usize);
    run(&unit, &mut frame);
    assert_eq!(frame.descr(), 1);
    let bits = frame.read_location(&unit.finishes[0].fail_locations[0]);
    assert_eq!(f64::from_bits(bits as u64), 3.75);

    let mut frame = OwnedJitFrame::for_unit(&unit);
    frame.write_location(&unit.input_locations[0], 8.0f64.to_bits() as usize);
    frame.write_location(&unit.input_locations[1], 4.0f64.to_bits() as usize);
    run(&unit, &mut frame);
    assert_eq!(frame.descr(), 42);
    let bits = frame.read_location(&unit.guards[0].fail_locations[0]);
    assert_eq!(f64::from_bits(bits as u64), 12.0);
}

extern "C" fn add3(a: i64, b: i64, c: i64) -> i64 {
    a + b + c
}

#[test]
fn test_native_call_round_trip() {
    let runner = runner();
    let descr = hotloop::CallDescr::new(
        vec![ValueKind::Int, ValueKind::Int, ValueKind::Int],
        Some(ValueKind::Int),
    );
    let ops = vec![
        TraceOp::with_descr(
            Opcode::Call,
            vec![c_int(add3 as usize as i64), v_in(0), c_int(2), c_int(3)],
            Descr::Call(descr),
        ),
        TraceOp::with_descr(Opcode::Finish, vec![v_op(0)], Descr::Deopt(3)),
    ];
    let unit = runner.compile_loop(&[ValueKind::Int], &ops).unwrap();

    let mut frame = OwnedJitFrame::for_unit(&unit);
    frame.write_location(&unit.input_locations[0], 40);
    run(&unit, &mut frame);
    assert_eq!(frame.descr(), 3);
    assert_eq!(frame.read_location(&unit.finishes[0].fail_locations[0]), 45);
}

// ---- write barrier scenarios ----

#[repr(C)]
struct FakeObj {
    flags: u8,
    _pad: [u8; 7],
    field: usize,
}

static BARRIER_CALLS: AtomicUsize = AtomicUsize::new(0);

extern "C" fn barrier_helper(_obj: *mut u8) {
    BARRIER_CALLS.fetch_add(1, Ordering::SeqCst);
}

fn barrier_runtime() -> GcDescriptor {
    GcDescriptor {
        write_barrier: Some(WriteBarrierDescr {
            flag_offset: 0,
            flag_mask: 0x01,
            cards_set_mask: 0,
            card_page_shift: 0,
            card_base_offset: 0,
            helper: barrier_helper as usize,
        }),
        ..GcDescriptor::default()
    }
}

fn barrier_trace() -> Vec<TraceOp> {
    vec![
        TraceOp::new(Opcode::CondCallGcWb, vec![v_in(0)]),
        TraceOp::with_descr(
            Opcode::SetField,
            vec![v_in(0), v_in(1)],
            Descr::Field(FieldDescr {
                offset: 8,
                size: 8,
                kind: ValueKind::Ref,
                signed: false,
            }),
        ),
        TraceOp::with_descr(Opcode::Finish, vec![], Descr::Deopt(9)),
    ]
}

#[test]
fn test_write_barrier_helper_called_exactly_once_when_flagged() {
    let runner = Runner::new(TargetDesc::host(), barrier_runtime());
    let unit = runner
        .compile_loop(&[ValueKind::Ref, ValueKind::Ref], &barrier_trace())
        .unwrap();

    let mut obj = FakeObj { flags: 0x01, _pad: [0; 7], field: 0 };
    let value = 0xbeefusize;
    BARRIER_CALLS.store(0, Ordering::SeqCst);

    let mut frame = OwnedJitFrame::for_unit(&unit);
    frame.write_location(&unit.input_locations[0], &mut obj as *mut FakeObj as usize);
    frame.write_location(&unit.input_locations[1], value);
    run(&unit, &mut frame);

    assert_eq!(frame.descr(), 9);
    assert_eq!(BARRIER_CALLS.load(Ordering::SeqCst), 1);
    assert_eq!(obj.field, value);
}

#[test]
fn test_write_barrier_falls_through_when_unflagged() {
    let runner = Runner::new(TargetDesc::host(), barrier_runtime());
    let unit = runner
        .compile_loop(&[ValueKind::Ref, ValueKind::Ref], &barrier_trace())
        .unwrap();

    // The hot path is one operand load, the single status test, and the
    // never-taken jump to the out-of-line sequence; no call.
    let barrier_span = unit.op_offsets[1].1 - unit.op_offsets[0].1;
    assert!(
        barrier_span <= 20,
        "barrier fast path too large: {barrier_span} bytes"
    );

    let mut obj = FakeObj { flags: 0x00, _pad: [0; 7], field: 0 };
    let value = 0x1234usize;
    BARRIER_CALLS.store(0, Ordering::SeqCst);

    let mut frame = OwnedJitFrame::for_unit(&unit);
    frame.write_location(&unit.input_locations[0], &mut obj as *mut FakeObj as usize);
    frame.write_location(&unit.input_locations[1], value);
    run(&unit, &mut frame);

    assert_eq!(frame.descr(), 9);
    assert_eq!(BARRIER_CALLS.load(Ordering::SeqCst), 0);
    assert_eq!(obj.field, value);
}
