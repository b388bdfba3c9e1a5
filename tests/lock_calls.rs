//! The lock-releasing call variant, executed against a real lock word:
//! the fast compare-and-swap reacquisition, the contended fallback, and the
//! thread-identity-change fallback.

#![cfg(target_arch = "x86_64")]

use hotloop::{
    CallDescr, CompiledUnit, Const, Descr, GcDescriptor, Opcode, OwnedJitFrame, Runner,
    TargetDesc, TraceOp, Value, ValueKind,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

static LOCK: AtomicUsize = AtomicUsize::new(0);
static TLS_IDENT: AtomicUsize = AtomicUsize::new(0);
static REACQUIRES: AtomicUsize = AtomicUsize::new(0);
static LOCK_SEEN_DURING_CALL: AtomicUsize = AtomicUsize::new(usize::MAX);

// The statics above are process-wide; run these tests one at a time.
static SERIAL: Mutex<()> = Mutex::new(());

extern "C" fn reacquire_slow() {
    REACQUIRES.fetch_add(1, Ordering::SeqCst);
    LOCK.store(1, Ordering::SeqCst);
}

extern "C" fn callee_plain() -> i64 {
    LOCK_SEEN_DURING_CALL.store(LOCK.load(Ordering::SeqCst), Ordering::SeqCst);
    7
}

extern "C" fn callee_contending() -> i64 {
    // Another thread grabbed the lock while it was released.
    LOCK.store(1, Ordering::SeqCst);
    7
}

extern "C" fn callee_switching_threads() -> i64 {
    TLS_IDENT.fetch_add(1, Ordering::SeqCst);
    7
}

fn compile(target_fn: usize) -> (Runner, CompiledUnit) {
    let runtime = GcDescriptor {
        lock_addr: LOCK.as_ptr() as usize,
        lock_reacquire: reacquire_slow as usize,
        tls_ident_offset: 0,
        ..GcDescriptor::default()
    };
    let runner = Runner::new(TargetDesc::host(), runtime);
    let ops = vec![
        TraceOp::with_descr(
            Opcode::CallReleaseLock,
            vec![Value::Const(Const::Int(target_fn as i64))],
            Descr::Call(CallDescr::new(vec![], Some(ValueKind::Int))),
        ),
        TraceOp::with_descr(Opcode::Finish, vec![Value::Op(0)], Descr::Deopt(3)),
    ];
    let unit = runner.compile_loop(&[], &ops).unwrap();
    (runner, unit)
}

fn run(unit: &CompiledUnit) -> usize {
    let mut frame = OwnedJitFrame::for_unit(unit);
    let entry = unit.entry_fn();
    let tls = TLS_IDENT.as_ptr() as *mut u8;
    let out = unsafe { entry(frame.as_mut_ptr(), tls) };
    assert_eq!(out, frame.as_mut_ptr());
    assert_eq!(frame.descr(), 3);
    frame.read_location(&unit.finishes[0].fail_locations[0])
}

#[test]
fn test_lock_released_and_reacquired_fast() {
    let _guard = SERIAL.lock().unwrap();
    let (_runner, unit) = compile(callee_plain as usize);

    LOCK.store(1, Ordering::SeqCst);
    TLS_IDENT.store(17, Ordering::SeqCst);
    REACQUIRES.store(0, Ordering::SeqCst);
    LOCK_SEEN_DURING_CALL.store(usize::MAX, Ordering::SeqCst);

    assert_eq!(run(&unit), 7);
    // Released around the native call, reacquired by the compare-and-swap.
    assert_eq!(LOCK_SEEN_DURING_CALL.load(Ordering::SeqCst), 0);
    assert_eq!(LOCK.load(Ordering::SeqCst), 1);
    assert_eq!(REACQUIRES.load(Ordering::SeqCst), 0);
}

#[test]
fn test_lock_contention_falls_back_to_helper() {
    let _guard = SERIAL.lock().unwrap();
    let (_runner, unit) = compile(callee_contending as usize);

    LOCK.store(1, Ordering::SeqCst);
    TLS_IDENT.store(17, Ordering::SeqCst);
    REACQUIRES.store(0, Ordering::SeqCst);

    assert_eq!(run(&unit), 7);
    assert_eq!(REACQUIRES.load(Ordering::SeqCst), 1);
    assert_eq!(LOCK.load(Ordering::SeqCst), 1);
}

#[test]
fn test_thread_identity_change_falls_back_to_helper() {
    let _guard = SERIAL.lock().unwrap();
    let (_runner, unit) = compile(callee_switching_threads as usize);

    LOCK.store(1, Ordering::SeqCst);
    TLS_IDENT.store(40, Ordering::SeqCst);
    REACQUIRES.store(0, Ordering::SeqCst);

    assert_eq!(run(&unit), 7);
    // The swap was won on the wrong thread: the code hands the lock back
    // and defers to the helper.
    assert_eq!(REACQUIRES.load(Ordering::SeqCst), 1);
    assert_eq!(LOCK.load(Ordering::SeqCst), 1);
}
