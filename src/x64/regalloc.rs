// This module is the register allocator driver: a single linear scan over the
// operation list that assigns operand and result locations, emits the
// instructions through the code builder, and grows the guard, cold-path, and
// diagnostic tables as it goes. At each index it first frees registers whose
// bound value's lifetime has ended, loads operands not already registered
// (spilling the least useful value when it must), and allocates results,
// reusing an input register when that input dies at the operation and no fixed
// constraint forbids it. Symmetric binary operations may swap their operands
// to avoid a move. Comparisons immediately consumed by a guard fuse into one
// compare-and-branch. The pre-pass biases allocation toward ABI argument
// registers and the shift-count register so call sites and shifts need less
// reshuffling. Running out of spillable registers is a fatal internal error:
// an allocator or trace bug, never a runtime condition.

//! Linear-scan allocation and per-opcode code generation.

use bumpalo::Bump;
use hashbrown::HashMap;
use log::debug;

use crate::core::error::{CompileError, CompileResult};
use crate::core::frame::{FrameManager, SlotWidth};
use crate::core::lifetime::Lifetimes;
use crate::core::regalloc::{AsmReg, RegBitSet, RegisterManager, ValueId, FP_BANK, GP_BANK};
use crate::gc::GcDescriptor;
use crate::ir::{CallDescr, Const, Opcode, TraceOp, Value, ValueKind};
use crate::x64::calls::{CallBuilder, CallTarget, ResultPlace};
use crate::x64::emitter::{CodeBuffer, Label, Mem};
use crate::x64::guards::{
    build_gc_map, emit_cold_paths, emit_exit_trampoline, emit_pending_stubs, emit_shadow_stack_push,
    emit_write_barrier, save_exception, store_wide_imm, ColdPath, GuardState, GuardToken,
};
use crate::x64::location::Location;
use crate::x64::remap::{parallel_move, Move};
use crate::x64::{
    frame_depth_offset, frame_descr_offset, frame_gc_map_offset, frame_slot_offset,
    spill_to_frame_slot, Abi, Cond, TargetDesc, WordWidth, FRAME_REG, R11, RAX, RCX, RDI, RDX,
    RSI, RSP, XMM0,
};

/// A loop entry: the frame layout in effect at the label, used to reconcile
/// incoming locations at a back-jump, from this unit or a later bridge.
#[derive(Debug, Clone)]
pub struct TargetToken {
    /// Offset of the loop header within the unit's code.
    pub code_offset: usize,
    pub locations: Vec<Location>,
    pub kinds: Vec<ValueKind>,
    /// Spill-area depth backing those locations.
    pub frame_depth: u32,
}

/// A Finish exit: descriptor id plus where each result value sits.
#[derive(Debug, Clone)]
pub struct FinishInfo {
    pub descr_id: u64,
    pub fail_locations: Vec<Location>,
}

enum IntOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Mul,
}

enum FloatOp {
    Add,
    Sub,
    Mul,
    Div,
}

const F64_SIGN: u64 = 0x8000_0000_0000_0000;
const F64_ABS: u64 = 0x7fff_ffff_ffff_ffff;

/// One compilation unit's allocator and emission state; the explicit
/// compilation context everything threads through.
pub struct RegAlloc<'a> {
    target: &'a TargetDesc,
    runtime: &'a GcDescriptor,
    /// Arena for per-unit scratch allocations.
    arena: Bump,
    pub buf: CodeBuffer,
    frame: FrameManager,
    regs: RegisterManager,
    lifetimes: Lifetimes,
    n_inputs: usize,
    kinds: Vec<ValueKind>,
    /// Spill-area slot of each value that has one (spill-relative index).
    slots: HashMap<ValueId, u32>,
    pub guards: Vec<GuardToken>,
    pub finishes: Vec<FinishInfo>,
    cold: Vec<ColdPath>,
    /// (operation index, code offset) pairs for diagnostics.
    pub op_offsets: Vec<(usize, usize)>,
    /// Heap-pinned root bitmaps embedded in the code by address.
    pub retained_gc_maps: Vec<Box<[usize]>>,
    pending_cc: Option<(ValueId, Cond)>,
    exit_label: Label,
    loop_header: Option<(Label, Vec<Location>, Vec<ValueKind>)>,
    depth_patches: Vec<usize>,
    /// Cross-unit jump target for bridges.
    bridge_target: Option<(TargetToken, u64)>,
    /// Spill depth floor inherited from a parent unit or jump target.
    min_depth: u32,
    /// Dead value id that per-operation constant temporaries bind to.
    sentinel: ValueId,
    /// Where the caller must place each input before entering the unit;
    /// captured at construction, before any input can die.
    input_locs: Vec<Location>,
}

/// Everything the front door needs from a finished allocation.
pub struct UnitParts {
    pub artifact: crate::x64::emitter::CodeArtifact,
    pub guards: Vec<GuardToken>,
    pub finishes: Vec<FinishInfo>,
    pub op_offsets: Vec<(usize, usize)>,
    pub gc_maps: Vec<Box<[usize]>>,
    pub spill_depth: u32,
    pub target_token: Option<TargetToken>,
    pub input_locations: Vec<Location>,
}

impl<'a> RegAlloc<'a> {
    pub fn new_loop(
        target: &'a TargetDesc,
        runtime: &'a GcDescriptor,
        inputs: &[ValueKind],
        ops: &[TraceOp],
    ) -> Self {
        let mut this = Self::new_common(target, runtime, inputs, ops);
        for (i, &kind) in inputs.iter().enumerate() {
            let slot = this.frame.allocate(this.slot_width(kind));
            this.slots.insert(i, slot);
        }
        this.input_locs = (0..inputs.len()).map(|i| this.loc_of(i)).collect();
        this
    }

    /// A bridge starts from the failing guard's state: inputs live exactly
    /// where the fail locations say, and the parent's frame depth is the
    /// floor this unit may never shrink below.
    pub fn new_bridge(
        target: &'a TargetDesc,
        runtime: &'a GcDescriptor,
        inputs: &[ValueKind],
        ops: &[TraceOp],
        fail_locations: &[Location],
        parent_depth: u32,
        jump_target: Option<(TargetToken, u64)>,
    ) -> Self {
        assert_eq!(inputs.len(), fail_locations.len(), "fail location per bridge input");
        let fixed = crate::x64::fixed_frame_slots(target.width);
        let occupied: Vec<(u32, SlotWidth)> = fail_locations
            .iter()
            .zip(inputs)
            .filter_map(|(loc, &kind)| match loc {
                Location::Stack { slot, .. } => {
                    debug_assert!(*slot >= fixed, "bridge input in the register save area");
                    Some((
                        slot - fixed,
                        if kind.is_float() && target.width == WordWidth::W32 {
                            SlotWidth::Two
                        } else {
                            SlotWidth::One
                        },
                    ))
                }
                _ => None,
            })
            .collect();

        let mut this = Self::new_common(target, runtime, inputs, ops);
        this.frame = FrameManager::with_live_slots(parent_depth, &occupied);
        this.min_depth = parent_depth;
        this.bridge_target = jump_target;
        for (i, loc) in fail_locations.iter().enumerate() {
            match loc {
                Location::Gp(r) | Location::Fp(r) => this.regs.bind(*r, i),
                Location::Stack { slot, .. } => {
                    this.slots.insert(i, slot - fixed);
                }
                other => panic!("bridge input has no storage: {other:?}"),
            }
        }
        this.input_locs = fail_locations.to_vec();
        this
    }

    fn new_common(
        target: &'a TargetDesc,
        runtime: &'a GcDescriptor,
        inputs: &[ValueKind],
        ops: &[TraceOp],
    ) -> Self {
        let mut lifetimes = Lifetimes::compute(inputs.len(), ops);
        hint_pass(&mut lifetimes, inputs.len(), ops);
        let sentinel = lifetimes.add_sentinel();
        let mut kinds: Vec<ValueKind> = inputs.to_vec();
        kinds.extend(ops.iter().map(|op| op.result_kind().unwrap_or(ValueKind::Int)));
        kinds.push(ValueKind::Int);
        let mut buf = CodeBuffer::new(target.width);
        let exit_label = buf.new_label();
        RegAlloc {
            target,
            runtime,
            arena: Bump::new(),
            buf,
            frame: FrameManager::new(),
            regs: RegisterManager::new(target.allocatable),
            lifetimes,
            n_inputs: inputs.len(),
            kinds,
            slots: HashMap::new(),
            guards: Vec::new(),
            finishes: Vec::new(),
            cold: Vec::new(),
            op_offsets: Vec::new(),
            retained_gc_maps: Vec::new(),
            pending_cc: None,
            exit_label,
            loop_header: None,
            depth_patches: Vec::new(),
            bridge_target: None,
            min_depth: 0,
            sentinel,
            input_locs: Vec::new(),
        }
    }

    // ---- small helpers ----

    fn width(&self) -> WordWidth {
        self.target.width
    }

    fn slot_width(&self, kind: ValueKind) -> SlotWidth {
        if kind.is_float() && self.width() == WordWidth::W32 {
            SlotWidth::Two
        } else {
            SlotWidth::One
        }
    }

    fn value_id(&self, value: Value) -> Option<ValueId> {
        Lifetimes::value_id(self.n_inputs, value)
    }

    fn kind_of(&self, id: ValueId) -> ValueKind {
        self.kinds[id]
    }

    fn slot_loc(&self, id: ValueId) -> Option<Location> {
        self.slots.get(&id).map(|&s| Location::Stack {
            slot: spill_to_frame_slot(self.width(), s),
            kind: self.kind_of(id),
        })
    }

    fn frame_mem(&self, abs_slot: u32) -> Mem {
        Mem::base(FRAME_REG, frame_slot_offset(self.width(), abs_slot))
    }

    /// Current location of a value: register first, spill slot otherwise.
    fn loc_of(&self, id: ValueId) -> Location {
        if let Some(reg) = self.regs.reg_of(id) {
            if reg.is_gp() {
                Location::Gp(reg)
            } else {
                Location::Fp(reg)
            }
        } else {
            self.slot_loc(id).expect("live value has neither register nor slot")
        }
    }

    fn arg_loc(&self, value: Value) -> Location {
        match value {
            Value::Const(c) => Location::Imm(c.bits()),
            other => self.loc_of(self.value_id(other).unwrap()),
        }
    }

    // ---- allocation core ----

    /// Free registers and slots whose value's lifetime ended before `pos`.
    fn free_dead(&mut self, pos: usize) {
        for (reg, value) in self.regs.take_dead(pos, &self.lifetimes) {
            debug!("free {reg:?} (value {value} dead at {pos})");
        }
        let dead: Vec<(ValueId, u32)> = self
            .slots
            .iter()
            .filter(|(v, _)| self.lifetimes.get(**v).last_use < pos)
            .map(|(v, s)| (*v, *s))
            .collect();
        for (value, slot) in dead {
            self.slots.remove(&value);
            let w = self.slot_width(self.kinds[value]);
            self.frame.release(slot, w);
        }
    }

    /// Spill a bound register's value to its slot (allocating one on first
    /// spill; SSA values never go stale, so a re-spill is free) and unbind.
    fn spill(&mut self, reg: AsmReg, value: ValueId) -> CompileResult<()> {
        if !self.slots.contains_key(&value) {
            let kind = self.kind_of(value);
            let slot = self.frame.allocate(self.slot_width(kind));
            self.slots.insert(value, slot);
            let mem = self.frame_mem(spill_to_frame_slot(self.width(), slot));
            if reg.is_gp() {
                self.buf.store(mem, reg)?;
            } else {
                self.buf.movsd_store(mem, reg)?;
            }
            debug!("spill value {value} from {reg:?} to slot {slot}");
        } else {
            debug!("drop value {value} from {reg:?} (already spilled)");
        }
        self.regs.unbind(reg);
        Ok(())
    }

    /// A register in `bank` for `value`, spilling the least useful other
    /// value if none is free. Fatal if nothing is spillable.
    fn alloc_reg(
        &mut self,
        pos: usize,
        value: ValueId,
        bank: u8,
        exclude: &RegBitSet,
    ) -> CompileResult<AsmReg> {
        let hint = self.lifetimes.get(value).hint_after(pos);
        if let Some(reg) = self.regs.find_free(bank, exclude, hint) {
            self.regs.bind(reg, value);
            return Ok(reg);
        }
        let (reg, victim) = self
            .regs
            .pick_spill(bank, pos, &self.lifetimes, exclude)
            .ok_or(CompileError::RegisterExhausted { bank, position: pos })?;
        self.spill(reg, victim)?;
        self.regs.bind(reg, value);
        Ok(reg)
    }

    /// Bring a value into a general-purpose register, loading or
    /// materializing as needed; pins the register for this operation.
    fn ensure_gp(&mut self, pos: usize, value: Value, exclude: &RegBitSet) -> CompileResult<AsmReg> {
        match value {
            Value::Const(c) => {
                // Pseudo-binding: the constant gets a dead register of its
                // own for the duration of this operation.
                let id = self.scratch_const_id(pos);
                let reg = self.alloc_reg(pos, id, GP_BANK, exclude)?;
                self.buf.mov_ri(reg, c.bits())?;
                self.regs.pin(reg);
                Ok(reg)
            }
            other => {
                let id = self.value_id(other).unwrap();
                if let Some(reg) = self.regs.reg_of(id) {
                    self.regs.pin(reg);
                    return Ok(reg);
                }
                let reg = self.alloc_reg(pos, id, GP_BANK, exclude)?;
                let src = self.slot_loc(id).expect("unspilled value without register");
                if let Location::Stack { slot, .. } = src {
                    let mem = self.frame_mem(slot);
                    self.buf.load(reg, mem)?;
                }
                self.regs.pin(reg);
                Ok(reg)
            }
        }
    }

    fn ensure_fp(&mut self, pos: usize, value: Value, exclude: &RegBitSet) -> CompileResult<AsmReg> {
        match value {
            Value::Const(c) => {
                let id = self.scratch_const_id(pos);
                let reg = self.alloc_reg(pos, id, FP_BANK, exclude)?;
                let value = match c {
                    Const::Float(f) => f,
                    other => f64::from_bits(other.bits() as u64),
                };
                self.buf.movsd_const(reg, value)?;
                self.regs.pin(reg);
                Ok(reg)
            }
            other => {
                let id = self.value_id(other).unwrap();
                if let Some(reg) = self.regs.reg_of(id) {
                    self.regs.pin(reg);
                    return Ok(reg);
                }
                let reg = self.alloc_reg(pos, id, FP_BANK, exclude)?;
                if let Some(Location::Stack { slot, .. }) = self.slot_loc(id) {
                    let mem = self.frame_mem(slot);
                    self.buf.movsd_load(reg, mem)?;
                }
                self.regs.pin(reg);
                Ok(reg)
            }
        }
    }

    /// A value id that is dead immediately; constants loaded for one
    /// operation bind to it and fall to the next operation's sweep.
    fn scratch_const_id(&self, _pos: usize) -> ValueId {
        self.sentinel
    }

    /// Result register seeded with `seed`'s value: reuses the seed's
    /// register when the seed dies here, otherwise copies.
    fn setup_result_from(
        &mut self,
        pos: usize,
        seed: Value,
        bank: u8,
        exclude: &RegBitSet,
    ) -> CompileResult<AsmReg> {
        let result = self.lifetimes.result_id(pos);
        if let Some(seed_id) = self.value_id(seed) {
            if let Some(reg) = self.regs.reg_of(seed_id) {
                if reg.bank == bank
                    && self.lifetimes.get(seed_id).last_use <= pos
                    && !exclude.contains(reg)
                {
                    self.regs.rebind(reg, result);
                    self.regs.pin(reg);
                    return Ok(reg);
                }
                self.regs.pin(reg);
            }
        }
        let rd = self.alloc_reg(pos, result, bank, exclude)?;
        self.regs.pin(rd);
        match self.arg_loc_for_seed(seed) {
            Location::Gp(src) => self.buf.mov_rr(rd, src)?,
            Location::Fp(src) => self.buf.movsd_rr(rd, src)?,
            Location::Stack { slot, .. } => {
                let mem = self.frame_mem(slot);
                if bank == GP_BANK {
                    self.buf.load(rd, mem)?;
                } else {
                    self.buf.movsd_load(rd, mem)?;
                }
            }
            Location::Imm(v) => {
                if bank == GP_BANK {
                    self.buf.mov_ri(rd, v)?;
                } else {
                    self.buf.movsd_const(rd, f64::from_bits(v as u64))?;
                }
            }
            Location::Mem(_) => unreachable!("seed values never live at raw addresses"),
        }
        Ok(rd)
    }

    fn arg_loc_for_seed(&self, seed: Value) -> Location {
        match seed {
            Value::Const(Const::Float(f)) => Location::Imm(f.to_bits() as i64),
            other => self.arg_loc(other),
        }
    }

    // ---- unit assembly ----

    /// Compile the whole unit: entry code, every operation, then the queued
    /// cold paths, the exit trampoline, and the pending guard stubs.
    pub fn compile(&mut self, ops: &[TraceOp], with_prologue: bool) -> CompileResult<()> {
        if with_prologue {
            self.emit_prologue()?;
        } else {
            self.emit_stack_check()?;
        }
        for (pos, op) in ops.iter().enumerate() {
            self.op_offsets.push((pos, self.buf.offset()));
            self.free_dead(pos);
            self.compile_op(pos, op, ops)?;
            self.regs.unpin_all();
        }
        self.finish_unit()
    }

    fn compile_op(&mut self, pos: usize, op: &TraceOp, ops: &[TraceOp]) -> CompileResult<()> {
        use Opcode::*;
        match op.opcode {
            IntAdd => self.int_binop(pos, op, IntOp::Add),
            IntSub => self.int_binop(pos, op, IntOp::Sub),
            IntMul => self.int_binop(pos, op, IntOp::Mul),
            IntAnd => self.int_binop(pos, op, IntOp::And),
            IntOr => self.int_binop(pos, op, IntOp::Or),
            IntXor => self.int_binop(pos, op, IntOp::Xor),
            IntLshift | IntRshift | UintRshift => self.shift(pos, op),
            IntNeg | IntInvert => self.int_unop(pos, op),
            IntLt => self.int_cmp(pos, op, ops, Cond::L),
            IntLe => self.int_cmp(pos, op, ops, Cond::Le),
            IntEq | PtrEq => self.int_cmp(pos, op, ops, Cond::E),
            IntNe | PtrNe => self.int_cmp(pos, op, ops, Cond::Ne),
            IntGt => self.int_cmp(pos, op, ops, Cond::G),
            IntGe => self.int_cmp(pos, op, ops, Cond::Ge),
            UintLt => self.int_cmp(pos, op, ops, Cond::B),
            UintLe => self.int_cmp(pos, op, ops, Cond::Be),
            UintGt => self.int_cmp(pos, op, ops, Cond::A),
            UintGe => self.int_cmp(pos, op, ops, Cond::Ae),
            IntIsZero => self.int_test(pos, op, ops, Cond::E),
            IntIsTrue => self.int_test(pos, op, ops, Cond::Ne),
            FloatAdd => self.float_binop(pos, op, FloatOp::Add),
            FloatSub => self.float_binop(pos, op, FloatOp::Sub),
            FloatMul => self.float_binop(pos, op, FloatOp::Mul),
            FloatDiv => self.float_binop(pos, op, FloatOp::Div),
            FloatNeg | FloatAbs => self.float_unop(pos, op),
            FloatLt => self.float_cmp_ordered(pos, op, ops, true, Cond::A),
            FloatLe => self.float_cmp_ordered(pos, op, ops, true, Cond::Ae),
            FloatGt => self.float_cmp_ordered(pos, op, ops, false, Cond::A),
            FloatGe => self.float_cmp_ordered(pos, op, ops, false, Cond::Ae),
            FloatEq => self.float_cmp_unordered(pos, op, Cond::E),
            FloatNe => self.float_cmp_unordered(pos, op, Cond::Ne),
            CastIntToFloat => {
                let rs = self.ensure_gp(pos, op.args[0], &RegBitSet::empty())?;
                let result = self.lifetimes.result_id(pos);
                let rd = self.alloc_reg(pos, result, FP_BANK, &RegBitSet::empty())?;
                self.buf.cvtsi2sd(rd, rs)
            }
            CastFloatToInt => {
                let rs = self.ensure_fp(pos, op.args[0], &RegBitSet::empty())?;
                let result = self.lifetimes.result_id(pos);
                let rd = self.alloc_reg(pos, result, GP_BANK, &RegBitSet::empty())?;
                self.buf.cvttsd2si(rd, rs)
            }
            GetField => self.get_field(pos, op),
            SetField => self.set_field(pos, op),
            CondCallGcWb | CondCallGcWbArray => self.cond_call_gc_wb(pos, op),
            Call => self.call(pos, op, false),
            CallReleaseLock => self.call(pos, op, true),
            Label => self.label(pos, op),
            GuardTrue | GuardFalse | GuardValue | GuardNoException => self.guard(pos, op),
            Jump => self.jump(pos, op),
            Finish => self.finish(pos, op),
        }
    }

    // ---- integer operations ----

    fn int_binop(&mut self, pos: usize, op: &TraceOp, kind: IntOp) -> CompileResult<()> {
        let (mut a, mut b) = (op.args[0], op.args[1]);
        if op.opcode.is_symmetric() && self.should_swap(a, b) {
            std::mem::swap(&mut a, &mut b);
        }
        let rd = self.setup_result_from(pos, a, GP_BANK, &RegBitSet::empty())?;
        let rhs = self.arg_loc_unless_same(b, a, rd);
        match rhs {
            Location::Gp(rb) => match kind {
                IntOp::Add => self.buf.add_rr(rd, rb),
                IntOp::Sub => self.buf.sub_rr(rd, rb),
                IntOp::And => self.buf.and_rr(rd, rb),
                IntOp::Or => self.buf.or_rr(rd, rb),
                IntOp::Xor => self.buf.xor_rr(rd, rb),
                IntOp::Mul => self.buf.imul_rr(rd, rb),
            },
            Location::Stack { slot, .. } => {
                let mem = self.frame_mem(slot);
                match kind {
                    IntOp::Add => self.buf.add_rm(rd, mem),
                    IntOp::Sub => self.buf.sub_rm(rd, mem),
                    IntOp::And => self.buf.and_rm(rd, mem),
                    IntOp::Or => self.buf.or_rm(rd, mem),
                    IntOp::Xor => self.buf.xor_rm(rd, mem),
                    IntOp::Mul => self.buf.imul_rm(rd, mem),
                }
            }
            Location::Imm(v) => {
                if let Ok(v32) = i32::try_from(v) {
                    match kind {
                        IntOp::Add => self.buf.add_ri(rd, v32),
                        IntOp::Sub => self.buf.sub_ri(rd, v32),
                        IntOp::And => self.buf.and_ri(rd, v32),
                        IntOp::Or => self.buf.or_ri(rd, v32),
                        IntOp::Xor => self.buf.xor_ri(rd, v32),
                        IntOp::Mul => self.buf.imul_rri(rd, rd, v32),
                    }
                } else {
                    let scratch = self.buf.materialize(v)?;
                    match kind {
                        IntOp::Add => self.buf.add_rr(rd, scratch),
                        IntOp::Sub => self.buf.sub_rr(rd, scratch),
                        IntOp::And => self.buf.and_rr(rd, scratch),
                        IntOp::Or => self.buf.or_rr(rd, scratch),
                        IntOp::Xor => self.buf.xor_rr(rd, scratch),
                        IntOp::Mul => self.buf.imul_rr(rd, scratch),
                    }
                }
            }
            other => Err(CompileError::not_implemented(format!(
                "integer rhs at {other:?}"
            ))),
        }
    }

    /// Swapping helps when the left operand would need a load the right
    /// already has, or when only the left is a constant.
    fn should_swap(&self, a: Value, b: Value) -> bool {
        let in_reg = |v: Value| {
            self.value_id(v)
                .map(|id| self.regs.reg_of(id).is_some())
                .unwrap_or(false)
        };
        if matches!(a, Value::Const(_)) && !matches!(b, Value::Const(_)) {
            return true;
        }
        !in_reg(a) && in_reg(b)
    }

    /// Location of `b`, accounting for the seed having been rebound: if `b`
    /// names the same value as `a`, its content now lives in `rd`.
    fn arg_loc_unless_same(&self, b: Value, a: Value, rd: AsmReg) -> Location {
        if b == a && !matches!(b, Value::Const(_)) {
            return if rd.is_gp() { Location::Gp(rd) } else { Location::Fp(rd) };
        }
        self.arg_loc(b)
    }

    fn int_unop(&mut self, pos: usize, op: &TraceOp) -> CompileResult<()> {
        let rd = self.setup_result_from(pos, op.args[0], GP_BANK, &RegBitSet::empty())?;
        match op.opcode {
            Opcode::IntNeg => self.buf.neg(rd),
            Opcode::IntInvert => self.buf.not(rd),
            _ => unreachable!(),
        }
    }

    // ---- float operations ----

    fn float_binop(&mut self, pos: usize, op: &TraceOp, kind: FloatOp) -> CompileResult<()> {
        let (mut a, mut b) = (op.args[0], op.args[1]);
        if op.opcode.is_symmetric() && self.should_swap(a, b) {
            std::mem::swap(&mut a, &mut b);
        }
        let rd = self.setup_result_from(pos, a, FP_BANK, &RegBitSet::empty())?;
        let rhs = self.arg_loc_unless_same(b, a, rd);
        match rhs {
            Location::Fp(rb) => match kind {
                FloatOp::Add => self.buf.addsd(rd, rb),
                FloatOp::Sub => self.buf.subsd(rd, rb),
                FloatOp::Mul => self.buf.mulsd(rd, rb),
                FloatOp::Div => self.buf.divsd(rd, rb),
            },
            Location::Stack { slot, .. } => {
                let mem = self.frame_mem(slot);
                match kind {
                    FloatOp::Add => self.buf.addsd_m(rd, mem),
                    FloatOp::Sub => self.buf.subsd_m(rd, mem),
                    FloatOp::Mul => self.buf.mulsd_m(rd, mem),
                    FloatOp::Div => self.buf.divsd_m(rd, mem),
                }
            }
            Location::Imm(bits) => {
                let scratch = self.target.fp_scratch;
                self.buf.movsd_const(scratch, f64::from_bits(bits as u64))?;
                match kind {
                    FloatOp::Add => self.buf.addsd(rd, scratch),
                    FloatOp::Sub => self.buf.subsd(rd, scratch),
                    FloatOp::Mul => self.buf.mulsd(rd, scratch),
                    FloatOp::Div => self.buf.divsd(rd, scratch),
                }
            }
            other => Err(CompileError::not_implemented(format!("float rhs at {other:?}"))),
        }
    }

    /// Negation and absolute value go through 16-byte masks in the unit's
    /// constant table.
    fn float_unop(&mut self, pos: usize, op: &TraceOp) -> CompileResult<()> {
        let rd = self.setup_result_from(pos, op.args[0], FP_BANK, &RegBitSet::empty())?;
        match op.opcode {
            Opcode::FloatNeg => self.buf.xorpd_mask(rd, F64_SIGN, F64_SIGN),
            Opcode::FloatAbs => self.buf.andpd_mask(rd, F64_ABS, F64_ABS),
            _ => unreachable!(),
        }
    }

    fn shift(&mut self, pos: usize, op: &TraceOp) -> CompileResult<()> {
        let (a, b) = (op.args[0], op.args[1]);
        let mask = if self.width() == WordWidth::W64 { 63 } else { 31 };
        let mut exclude = RegBitSet::empty();
        exclude.insert(RCX);
        if let Value::Const(c) = b {
            let rd = self.setup_result_from(pos, a, GP_BANK, &RegBitSet::empty())?;
            let count = (c.bits() & mask) as u8;
            return match op.opcode {
                Opcode::IntLshift => self.buf.shl_ri(rd, count),
                Opcode::IntRshift => self.buf.sar_ri(rd, count),
                Opcode::UintRshift => self.buf.shr_ri(rd, count),
                _ => unreachable!(),
            };
        }
        // Variable count: the ISA wants it in cl, the fixed-register
        // constraint the hint pass anticipated. The count goes in first so
        // the seed copy below cannot disturb it, even when both operands
        // name the same value.
        let b_id = self.value_id(b).unwrap();
        match self.regs.owner(RCX) {
            Some(owner) if owner == b_id => {}
            Some(other) => {
                self.spill(RCX, other)?;
                self.copy_into(RCX, b_id)?;
            }
            None => self.copy_into(RCX, b_id)?,
        }
        self.regs.pin(RCX);
        let rd = self.setup_result_from(pos, a, GP_BANK, &exclude)?;
        match op.opcode {
            Opcode::IntLshift => self.buf.shl_cl(rd),
            Opcode::IntRshift => self.buf.sar_cl(rd),
            Opcode::UintRshift => self.buf.shr_cl(rd),
            _ => unreachable!(),
        }
    }

    /// Copy a value's current content into a specific free register without
    /// rebinding it there.
    fn copy_into(&mut self, dst: AsmReg, id: ValueId) -> CompileResult<()> {
        match self.loc_of(id) {
            Location::Gp(src) => self.buf.mov_rr(dst, src),
            Location::Stack { slot, .. } => {
                let mem = self.frame_mem(slot);
                self.buf.load(dst, mem)
            }
            other => Err(CompileError::not_implemented(format!("copy from {other:?}"))),
        }
    }

    // ---- comparisons and guards ----

    fn int_cmp(&mut self, pos: usize, op: &TraceOp, ops: &[TraceOp], cond: Cond) -> CompileResult<()> {
        let (mut a, mut b) = (op.args[0], op.args[1]);
        let mut cond = cond;
        if matches!(a, Value::Const(_)) && !matches!(b, Value::Const(_)) {
            std::mem::swap(&mut a, &mut b);
            cond = cond.swap_operands();
        }
        let ra = self.ensure_gp(pos, a, &RegBitSet::empty())?;
        match self.arg_loc(b) {
            Location::Gp(rb) => self.buf.cmp_rr(ra, rb)?,
            Location::Stack { slot, .. } => {
                let mem = self.frame_mem(slot);
                self.buf.cmp_rm(ra, mem)?;
            }
            Location::Imm(v) => {
                if let Ok(v32) = i32::try_from(v) {
                    self.buf.cmp_ri(ra, v32)?;
                } else {
                    let scratch = self.buf.materialize(v)?;
                    self.buf.cmp_rr(ra, scratch)?;
                }
            }
            other => {
                return Err(CompileError::not_implemented(format!("compare with {other:?}")))
            }
        }
        self.finish_cmp(pos, ops, cond)
    }

    fn int_test(&mut self, pos: usize, op: &TraceOp, ops: &[TraceOp], cond: Cond) -> CompileResult<()> {
        let ra = self.ensure_gp(pos, op.args[0], &RegBitSet::empty())?;
        self.buf.test_rr(ra, ra)?;
        self.finish_cmp(pos, ops, cond)
    }

    fn float_cmp_ordered(
        &mut self,
        pos: usize,
        op: &TraceOp,
        ops: &[TraceOp],
        swapped: bool,
        cond: Cond,
    ) -> CompileResult<()> {
        // lt/le compare reversed so unordered falls on the failing side of
        // the unsigned condition.
        let (x, y) = if swapped {
            (op.args[1], op.args[0])
        } else {
            (op.args[0], op.args[1])
        };
        let rx = self.ensure_fp(pos, x, &RegBitSet::empty())?;
        let ry = self.ensure_fp(pos, y, &RegBitSet::empty())?;
        self.buf.ucomisd(rx, ry)?;
        self.finish_cmp(pos, ops, cond)
    }

    fn float_cmp_unordered(&mut self, pos: usize, op: &TraceOp, cond: Cond) -> CompileResult<()> {
        let ra = self.ensure_fp(pos, op.args[0], &RegBitSet::empty())?;
        let rb = self.ensure_fp(pos, op.args[1], &RegBitSet::empty())?;
        let result = self.lifetimes.result_id(pos);
        let exclude = self.non_byte_regs();
        let rd = self.alloc_reg(pos, result, GP_BANK, &exclude)?;
        self.regs.pin(rd);
        // NaN makes eq false and ne true; the parity jump picks the preset.
        self.buf.mov_ri(rd, if cond == Cond::E { 0 } else { 1 })?;
        self.buf.ucomisd(ra, rb)?;
        let skip = self.buf.new_label();
        self.buf.jcc(Cond::P, skip)?;
        self.buf.setcc(cond, rd)?;
        self.buf.bind(skip);
        Ok(())
    }

    fn non_byte_regs(&self) -> RegBitSet {
        let mut exclude = self.target.allocatable;
        exclude.subtract(&self.target.byte_regs);
        exclude
    }

    /// Either hand the condition to an immediately following guard or
    /// materialize the 0/1 result.
    fn finish_cmp(&mut self, pos: usize, ops: &[TraceOp], cond: Cond) -> CompileResult<()> {
        let result = self.lifetimes.result_id(pos);
        if self.cmp_feeds_guard(pos, ops) {
            self.pending_cc = Some((result, cond));
            return Ok(());
        }
        let exclude = self.non_byte_regs();
        let rd = self.alloc_reg(pos, result, GP_BANK, &exclude)?;
        self.buf.setcc(cond, rd)?;
        self.buf.movzx8(rd)
    }

    fn cmp_feeds_guard(&self, pos: usize, ops: &[TraceOp]) -> bool {
        let Some(next) = ops.get(pos + 1) else { return false };
        if !matches!(next.opcode, Opcode::GuardTrue | Opcode::GuardFalse) {
            return false;
        }
        if next.args[0] != Value::Op(pos) {
            return false;
        }
        let life = self.lifetimes.get(self.lifetimes.result_id(pos));
        // The flags substitute for the value only if nothing else ever
        // reads it, the guard's failure list included.
        life.real_uses == [pos + 1]
            && life.last_use == pos + 1
            && !next
                .fail_args
                .as_ref()
                .is_some_and(|fa| fa.contains(&Value::Op(pos)))
    }

    fn guard(&mut self, pos: usize, op: &TraceOp) -> CompileResult<()> {
        let fail_cond = match op.opcode {
            Opcode::GuardTrue | Opcode::GuardFalse => {
                let fused = self
                    .pending_cc
                    .take()
                    .filter(|(id, _)| Some(*id) == self.value_id(op.args[0]));
                match fused {
                    Some((_, cond)) => {
                        if op.opcode == Opcode::GuardTrue {
                            cond.negate()
                        } else {
                            cond
                        }
                    }
                    None => {
                        let ra = self.ensure_gp(pos, op.args[0], &RegBitSet::empty())?;
                        self.buf.test_rr(ra, ra)?;
                        if op.opcode == Opcode::GuardTrue {
                            Cond::E
                        } else {
                            Cond::Ne
                        }
                    }
                }
            }
            Opcode::GuardValue => {
                let ra = self.ensure_gp(pos, op.args[0], &RegBitSet::empty())?;
                match self.arg_loc(op.args[1]) {
                    Location::Gp(rb) => self.buf.cmp_rr(ra, rb)?,
                    Location::Imm(v) => {
                        if let Ok(v32) = i32::try_from(v) {
                            self.buf.cmp_ri(ra, v32)?;
                        } else {
                            let scratch = self.buf.materialize(v)?;
                            self.buf.cmp_rr(ra, scratch)?;
                        }
                    }
                    Location::Stack { slot, .. } => {
                        let mem = self.frame_mem(slot);
                        self.buf.cmp_rm(ra, mem)?;
                    }
                    other => {
                        return Err(CompileError::not_implemented(format!(
                            "guard_value against {other:?}"
                        )))
                    }
                }
                Cond::Ne
            }
            Opcode::GuardNoException => {
                assert!(self.runtime.has_exception_slots(), "guard_no_exception without slots");
                self.buf
                    .cmp_mi(Mem::Abs(self.runtime.exc_type_addr as u64), 0)?;
                Cond::Ne
            }
            _ => unreachable!(),
        };

        let descr_id = op
            .descr
            .as_ref()
            .and_then(|d| d.deopt_id())
            .expect("guard without deopt descriptor");
        let fail_args = op.fail_args.as_deref().unwrap_or(&[]);
        let fail_locations: Vec<Location> = fail_args.iter().map(|&a| self.arg_loc(a)).collect();
        let gc_map = self.live_ref_map(pos);
        let stub_label = self.buf.new_label();
        let patch_offset = self.buf.jcc(fail_cond, stub_label)?;
        self.guards.push(GuardToken {
            descr_id,
            condition: fail_cond,
            fail_locations,
            gc_map,
            patch_offset,
            stub_label,
            stub_offset: None,
            state: GuardState::Pending,
        });
        Ok(())
    }

    /// Root bitmap over every live reference at `pos`.
    fn live_ref_map(&self, pos: usize) -> Box<[usize]> {
        let width = self.width();
        let regs = self
            .regs
            .iter_bound()
            .filter(|&(_, v)| self.kind_of(v) == ValueKind::Ref)
            .map(|(r, _)| Location::Gp(r));
        let slots = self
            .slots
            .iter()
            .filter(|(v, _)| {
                self.kind_of(**v) == ValueKind::Ref && self.lifetimes.get(**v).last_use >= pos
            })
            .map(|(v, s)| Location::Stack {
                slot: spill_to_frame_slot(width, *s),
                kind: self.kind_of(*v),
            });
        build_gc_map(width, self.frame.depth(), regs.chain(slots)).into_boxed_slice()
    }

    // ---- fields and barriers ----

    fn field_mem(&mut self, pos: usize, ptr: Value, offset: i32) -> CompileResult<Mem> {
        if let Value::Const(c) = ptr {
            let addr = c.bits() as u64;
            return Ok(Mem::Abs(addr.wrapping_add(offset as u64)));
        }
        let rp = self.ensure_gp(pos, ptr, &RegBitSet::empty())?;
        Ok(Mem::base(rp, offset))
    }

    fn get_field(&mut self, pos: usize, op: &TraceOp) -> CompileResult<()> {
        let field = *op
            .descr
            .as_ref()
            .and_then(|d| d.as_field())
            .expect("get_field without field descriptor");
        let mem = self.field_mem(pos, op.args[0], field.offset)?;
        let result = self.lifetimes.result_id(pos);
        if field.kind.is_float() {
            let rd = self.alloc_reg(pos, result, FP_BANK, &RegBitSet::empty())?;
            self.buf.movsd_load(rd, mem)
        } else {
            let rd = self.alloc_reg(pos, result, GP_BANK, &RegBitSet::empty())?;
            self.buf.load_sized(rd, mem, field.size, field.signed)
        }
    }

    fn set_field(&mut self, pos: usize, op: &TraceOp) -> CompileResult<()> {
        let field = *op
            .descr
            .as_ref()
            .and_then(|d| d.as_field())
            .expect("set_field without field descriptor");
        let mem = self.field_mem(pos, op.args[0], field.offset)?;
        let value = op.args[1];
        if field.kind.is_float() {
            let rv = self.ensure_fp(pos, value, &RegBitSet::empty())?;
            return self.buf.movsd_store(mem, rv);
        }
        if let (Value::Const(c), true) = (value, field.size as i32 == self.target.word()) {
            if let Ok(v32) = i32::try_from(c.bits()) {
                return self.buf.store_imm(mem, v32);
            }
        }
        // Byte stores need a byte-addressable register on the 32-bit ISA.
        let exclude = if field.size == 1 && self.width() == WordWidth::W32 {
            self.non_byte_regs()
        } else {
            RegBitSet::empty()
        };
        let rv = self.ensure_gp(pos, value, &exclude)?;
        self.buf.store_sized(mem, rv, field.size)
    }

    fn cond_call_gc_wb(&mut self, pos: usize, op: &TraceOp) -> CompileResult<()> {
        let descr = self
            .runtime
            .write_barrier
            .expect("write-barrier op without barrier descriptor");
        let obj = self.ensure_gp(pos, op.args[0], &RegBitSet::empty())?;
        let index = if op.opcode == Opcode::CondCallGcWbArray {
            Some(self.arg_loc(op.args[1]))
        } else {
            None
        };
        let saved: Vec<AsmReg> = self
            .regs
            .bound_in(&self.target.caller_saved)
            .into_iter()
            .map(|(r, _)| r)
            .collect();
        let cold = emit_write_barrier(&mut self.buf, &descr, obj, index, saved)?;
        self.cold.push(cold);
        Ok(())
    }

    // ---- calls ----

    fn call(&mut self, pos: usize, op: &TraceOp, releases_lock: bool) -> CompileResult<()> {
        let descr: CallDescr = op
            .descr
            .as_ref()
            .and_then(|d| d.as_call())
            .expect("call without call descriptor")
            .clone();
        assert_eq!(
            op.args.len() - 1,
            descr.args.len(),
            "call argument count does not match descriptor"
        );

        // Call-clobbered registers are freed across the call unless the
        // value is preserved elsewhere; values dying here stay put and feed
        // the argument marshalling below.
        for (reg, value) in self.regs.bound_in(&self.target.caller_saved) {
            if self.lifetimes.get(value).last_use > pos {
                self.spill(reg, value)?;
            }
        }

        let call_target = self.resolve_call_target(op.args[0])?;
        let args: Vec<(Location, ValueKind)> = op.args[1..]
            .iter()
            .zip(&descr.args)
            .map(|(&a, &k)| (self.arg_loc(a), k))
            .collect();

        if descr.can_collect {
            let map = self.live_ref_map(pos);
            let addr = map.as_ptr() as i64;
            self.retained_gc_maps.push(map);
            let mem = Mem::base(FRAME_REG, frame_gc_map_offset(self.width()));
            store_wide_imm(&mut self.buf, mem, addr)?;
        }

        // An x87 result must come off the coprocessor stack before the
        // reacquisition sequence can call anywhere.
        let result = self.lifetimes.result_id(pos);
        let x87_slot = if releases_lock
            && matches!(descr.result, Some(ValueKind::Float))
            && self.width() == WordWidth::W32
        {
            Some(self.frame.allocate(self.slot_width(ValueKind::Float)))
        } else {
            None
        };
        let x87_sink = x87_slot
            .map(|s| self.frame_mem(spill_to_frame_slot(self.width(), s)));

        let place = {
            let mut cb = CallBuilder::new(&mut self.buf, self.target, &self.arena);
            if releases_lock {
                let (place, slow) =
                    cb.emit_release_lock(&descr, call_target, &args, self.runtime, 0, x87_sink)?;
                self.cold.push(ColdPath::LockSlow {
                    slow: slow.slow,
                    resume: slow.resume,
                    helper: slow.helper,
                });
                place
            } else {
                cb.emit_plain(&descr, call_target, &args)?
            }
        };

        // Whatever survived in call-clobbered registers is garbage now.
        for (reg, _) in self.regs.bound_in(&self.target.caller_saved) {
            self.regs.unbind(reg);
        }

        match place {
            ResultPlace::Gp => self.regs.bind(RAX, result),
            ResultPlace::Fp => self.regs.bind(XMM0, result),
            ResultPlace::X87 => {
                let slot = match x87_slot {
                    Some(s) => s,
                    None => {
                        let s = self.frame.allocate(self.slot_width(ValueKind::Float));
                        let mem = self.frame_mem(spill_to_frame_slot(self.width(), s));
                        self.buf.fstp(mem)?;
                        s
                    }
                };
                self.slots.insert(result, slot);
            }
            ResultPlace::None => {}
        }

        if descr.can_collect {
            let mem = Mem::base(FRAME_REG, frame_gc_map_offset(self.width()));
            self.buf.store_imm(mem, 0)?;
        }
        if descr.save_exception {
            assert!(self.runtime.has_exception_slots(), "save_exception without slots");
            let tmp = if self.width() == WordWidth::W64 { R11 } else { RCX };
            save_exception(&mut self.buf, self.runtime, tmp)?;
        }
        Ok(())
    }

    fn resolve_call_target(&mut self, target: Value) -> CompileResult<CallTarget> {
        match target {
            Value::Const(c) => Ok(CallTarget::Abs(c.bits() as u64)),
            other => {
                let id = self.value_id(other).unwrap();
                if let Some(reg) = self.regs.reg_of(id) {
                    if !self.target.caller_saved.contains(reg) {
                        // Callee-saved home survives the marshalling.
                        return Ok(CallTarget::Reg(reg));
                    }
                    if !self.slots.contains_key(&id) {
                        self.spill(reg, id)?;
                    }
                }
                let slot = *self.slots.get(&id).expect("call target has no storage");
                Ok(CallTarget::FrameOffset(frame_slot_offset(
                    self.width(),
                    spill_to_frame_slot(self.width(), slot),
                )))
            }
        }
    }

    // ---- control flow ----

    fn label(&mut self, _pos: usize, op: &TraceOp) -> CompileResult<()> {
        let locations: Vec<Location> = op.args.iter().map(|&a| self.arg_loc(a)).collect();
        let kinds: Vec<ValueKind> = op
            .args
            .iter()
            .map(|&a| match a {
                Value::Const(c) => c.kind(),
                other => self.kind_of(self.value_id(other).unwrap()),
            })
            .collect();
        let label = self.buf.new_label();
        self.buf.bind(label);
        self.loop_header = Some((label, locations, kinds));
        Ok(())
    }

    fn jump(&mut self, _pos: usize, op: &TraceOp) -> CompileResult<()> {
        if let Some((token, addr)) = self.bridge_target.clone() {
            let moves = self.jump_moves(op, &token.locations, &token.kinds);
            parallel_move(&mut self.buf, self.target, &moves)?;
            self.min_depth = self.min_depth.max(token.frame_depth);
            let mut cb = CallBuilder::new(&mut self.buf, self.target, &self.arena);
            return cb.emit_tail_jump(addr);
        }
        let (label, locations, kinds) = self
            .loop_header
            .clone()
            .expect("jump without a loop header in scope");
        let moves = self.jump_moves(op, &locations, &kinds);
        parallel_move(&mut self.buf, self.target, &moves)?;
        self.buf.jmp(label)?;
        Ok(())
    }

    fn jump_moves(&self, op: &TraceOp, locations: &[Location], kinds: &[ValueKind]) -> Vec<Move> {
        assert_eq!(op.args.len(), locations.len(), "jump arity mismatch");
        op.args
            .iter()
            .zip(locations.iter().zip(kinds))
            .map(|(&a, (&dst, &kind))| Move { src: self.arg_loc(a), dst, kind })
            .collect()
    }

    fn finish(&mut self, pos: usize, op: &TraceOp) -> CompileResult<()> {
        let descr_id = op
            .descr
            .as_ref()
            .and_then(|d| d.deopt_id())
            .expect("finish without deopt descriptor");
        let fail_locations: Vec<Location> = op.args.iter().map(|&a| self.arg_loc(a)).collect();
        let gc_map = self.live_ref_map(pos);
        let addr = gc_map.as_ptr() as i64;
        self.retained_gc_maps.push(gc_map);

        let width = self.width();
        store_wide_imm(&mut self.buf, Mem::base(FRAME_REG, frame_gc_map_offset(width)), addr)?;
        store_wide_imm(
            &mut self.buf,
            Mem::base(FRAME_REG, frame_descr_offset(width)),
            descr_id as i64,
        )?;
        self.buf.jmp(self.exit_label)?;
        self.finishes.push(FinishInfo { descr_id, fail_locations });
        Ok(())
    }

    // ---- entry and exit code ----

    fn emit_prologue(&mut self) -> CompileResult<()> {
        let reserve = self.target.reserve_bytes();
        let saved = self.target.saved_gp.clone();
        for &reg in &saved {
            self.buf.push_r(reg)?;
        }
        self.buf.add_ri(RSP, -reserve)?;
        match self.target.abi {
            Abi::SysV64 => {
                self.buf.mov_rr(FRAME_REG, RDI)?;
                self.buf.store(Mem::base(RSP, 0), RSI)?;
            }
            Abi::Win64 => {
                self.buf.mov_rr(FRAME_REG, RCX)?;
                self.buf.store(Mem::base(RSP, 0), RDX)?;
            }
            Abi::Cdecl32 => {
                // Arguments sit above the return address and saved registers.
                let above = reserve + saved.len() as i32 * 4 + 4;
                self.buf.load(FRAME_REG, Mem::base(RSP, above))?;
                self.buf.load(RAX, Mem::base(RSP, above + 4))?;
                self.buf.store(Mem::base(RSP, 0), RAX)?;
            }
        }
        if self.runtime.has_shadow_stack() {
            emit_shadow_stack_push(&mut self.buf, self.runtime, RAX)?;
        }
        self.emit_stack_check()
    }

    /// Compare the frame's allocated depth against what this unit needs and
    /// reallocate through the runtime when an incoming jump brought too
    /// small a frame. The needed depth is patched in at finish time.
    fn emit_stack_check(&mut self) -> CompileResult<()> {
        if self.runtime.realloc_frame == 0 {
            return Ok(());
        }
        let width = self.width();
        let at = self
            .buf
            .cmp_mi(Mem::base(FRAME_REG, frame_depth_offset(width)), 0)?;
        self.depth_patches.push(at);
        let ok = self.buf.new_label();
        self.buf.jcc(Cond::Ge, ok)?;
        let helper = self.runtime.realloc_frame as u64;
        match self.target.abi {
            Abi::SysV64 => {
                self.buf.mov_rr(RDI, FRAME_REG)?;
                self.buf.mov_ri(RSI, 0)?;
                self.depth_patches.push(self.buf.offset() - 4);
                self.buf.call_abs(helper)?;
            }
            Abi::Win64 => {
                self.buf.mov_rr(RCX, FRAME_REG)?;
                self.buf.mov_ri(RDX, 0)?;
                self.depth_patches.push(self.buf.offset() - 4);
                self.buf.add_ri(RSP, -32)?;
                self.buf.call_abs(helper)?;
                self.buf.add_ri(RSP, 32)?;
            }
            Abi::Cdecl32 => {
                self.buf.add_ri(RSP, -16)?;
                self.buf.store(Mem::base(RSP, 0), FRAME_REG)?;
                self.buf.store_imm(Mem::base(RSP, 4), 0)?;
                self.depth_patches.push(self.buf.offset() - 4);
                self.buf.call_abs(helper)?;
                self.buf.add_ri(RSP, 16)?;
            }
        }
        self.buf.mov_rr(FRAME_REG, RAX)?;
        self.buf.bind(ok);
        Ok(())
    }

    fn finish_unit(&mut self) -> CompileResult<()> {
        let cold = std::mem::take(&mut self.cold);
        emit_cold_paths(&mut self.buf, self.target, cold)?;
        emit_exit_trampoline(
            &mut self.buf,
            self.target,
            self.runtime,
            self.target.reserve_bytes(),
            self.exit_label,
        )?;
        emit_pending_stubs(&mut self.buf, &mut self.guards, self.exit_label)?;
        let needed = crate::x64::fixed_frame_slots(self.width()) + self.spill_depth();
        for at in std::mem::take(&mut self.depth_patches) {
            self.buf.patch_imm32(at, needed as i32);
        }
        self.regs.check_consistency();
        Ok(())
    }

    /// Spill-area depth of this unit, floored by inherited requirements.
    pub fn spill_depth(&self) -> u32 {
        self.frame.depth().max(self.min_depth)
    }

    /// Loop-header token, available once the Label operation was compiled.
    pub fn target_token(&self) -> Option<TargetToken> {
        self.loop_header.as_ref().map(|(label, locations, kinds)| TargetToken {
            code_offset: self.buf.label_offset(*label).expect("header label unbound"),
            locations: locations.clone(),
            kinds: kinds.clone(),
            frame_depth: self.spill_depth(),
        })
    }

    /// Tear the context apart for the front door.
    pub fn into_parts(self) -> UnitParts {
        let target_token = self.target_token();
        let spill_depth = self.spill_depth();
        UnitParts {
            target_token,
            spill_depth,
            input_locations: self.input_locs,
            artifact: self.buf.finish(),
            guards: self.guards,
            finishes: self.finishes,
            op_offsets: self.op_offsets,
            gc_maps: self.retained_gc_maps,
        }
    }
}

/// Pre-pass biasing allocation toward ABI call-argument registers and the
/// shift-count register, reducing reshuffling at the constrained sites.
pub fn hint_pass(lifetimes: &mut Lifetimes, n_inputs: usize, ops: &[TraceOp]) {
    // The target description is not known here; hints use the System V
    // assignment, which the Windows variant simply ignores where it differs.
    for (pos, op) in ops.iter().enumerate() {
        match op.opcode {
            Opcode::Call | Opcode::CallReleaseLock => {
                let Some(descr) = op.descr.as_ref().and_then(|d| d.as_call()) else { continue };
                let mut gp = 0usize;
                let mut fp = 0usize;
                for (&arg, &kind) in op.args[1..].iter().zip(&descr.args) {
                    let slot = if kind.is_float() {
                        fp += 1;
                        (fp <= 8).then(|| AsmReg::fp((fp - 1) as u8))
                    } else {
                        gp += 1;
                        const GP_ARGS: [AsmReg; 6] = [RDI, RSI, RDX, RCX, crate::x64::R8, crate::x64::R9];
                        (gp <= 6).then(|| GP_ARGS[gp - 1])
                    };
                    if let (Some(reg), Some(id)) = (slot, Lifetimes::value_id(n_inputs, arg)) {
                        lifetimes.add_hint(id, pos, reg);
                    }
                }
            }
            Opcode::IntLshift | Opcode::IntRshift | Opcode::UintRshift => {
                if let Some(id) = Lifetimes::value_id(n_inputs, op.args[1]) {
                    lifetimes.add_hint(id, pos, RCX);
                }
            }
            _ => {}
        }
    }
}
