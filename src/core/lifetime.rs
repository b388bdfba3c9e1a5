// This module computes value lifetimes for one compilation unit in a single
// backward-free forward walk over the operation list. A lifetime records the
// definition index, the last-usage index (which counts failure-exit lists and
// the closing jump), and the ordered list of real usage indices (which does
// not); the distinction drives the spill policy. The hint pass later attaches
// fixed-register preferences at specific indices, biasing allocation toward
// ABI argument registers so call sites need less reshuffling. The trace
// optimizer guarantees every post-use operand appears in the correct lifetime
// set; this pass only asserts the obvious structural facts in debug builds.

//! Per-value lifetime computation.

use crate::core::regalloc::{AsmReg, ValueId};
use crate::ir::{Opcode, TraceOp, Value};

/// Lifetime of a single value.
#[derive(Debug, Clone, Default)]
pub struct Lifetime {
    /// Operation index defining the value; inputs are defined at 0.
    pub def: usize,
    /// Last index naming the value anywhere, failure exits included.
    pub last_use: usize,
    /// Ascending indices of uses that actually read the value at run time.
    /// Failure-exit-only and closing-jump uses are excluded.
    pub real_uses: Vec<usize>,
    /// Fixed-register preferences attached by the hint pass, ascending by index.
    pub hints: Vec<(usize, AsmReg)>,
}

impl Lifetime {
    /// First real use at or after `position`.
    pub fn next_real_use(&self, position: usize) -> Option<usize> {
        let i = self.real_uses.partition_point(|&u| u < position);
        self.real_uses.get(i).copied()
    }

    /// Whether the value is dead for the hot path from `position` on: any
    /// remaining appearances are failure-exit lists or the closing jump.
    pub fn only_exit_uses_after(&self, position: usize) -> bool {
        self.next_real_use(position).is_none()
    }

    /// Register preferred at the first hinted index at or after `position`.
    pub fn hint_after(&self, position: usize) -> Option<AsmReg> {
        let i = self.hints.partition_point(|&(p, _)| p < position);
        self.hints.get(i).map(|&(_, r)| r)
    }

    fn note_use(&mut self, position: usize, real: bool) {
        if position > self.last_use {
            self.last_use = position;
        }
        if real {
            match self.real_uses.last() {
                Some(&last) if last == position => {}
                _ => self.real_uses.push(position),
            }
        }
    }
}

/// Lifetimes of all values of a unit, indexed by [`ValueId`].
#[derive(Debug, Default)]
pub struct Lifetimes {
    lives: Vec<Lifetime>,
    n_inputs: usize,
}

impl Lifetimes {
    /// Value id of an operand, if it names a non-constant value.
    pub fn value_id(n_inputs: usize, value: Value) -> Option<ValueId> {
        match value {
            Value::Input(i) => {
                debug_assert!(i < n_inputs, "input operand out of range");
                Some(i)
            }
            Value::Op(j) => Some(n_inputs + j),
            Value::Const(_) => None,
        }
    }

    /// Value id defined by the operation at `position`.
    pub fn result_id(&self, position: usize) -> ValueId {
        self.n_inputs + position
    }

    pub fn n_inputs(&self) -> usize {
        self.n_inputs
    }

    pub fn get(&self, id: ValueId) -> &Lifetime {
        &self.lives[id]
    }

    pub fn add_hint(&mut self, id: ValueId, position: usize, reg: AsmReg) {
        let hints = &mut self.lives[id].hints;
        let i = hints.partition_point(|&(p, _)| p < position);
        hints.insert(i, (position, reg));
    }

    /// Build lifetimes directly from raw entries; test scaffolding.
    pub fn from_raw(lives: Vec<Lifetime>) -> Self {
        Lifetimes { lives, n_inputs: 0 }
    }

    /// An extra id that is dead from the start; per-operation constant
    /// temporaries bind to it so the next operation's sweep frees them.
    pub fn add_sentinel(&mut self) -> ValueId {
        self.lives.push(Lifetime::default());
        self.lives.len() - 1
    }

    /// One forward walk over the trace.
    pub fn compute(n_inputs: usize, ops: &[TraceOp]) -> Self {
        let mut lives: Vec<Lifetime> = (0..n_inputs + ops.len())
            .map(|id| Lifetime {
                def: id.saturating_sub(n_inputs),
                ..Lifetime::default()
            })
            .collect();

        for (pos, op) in ops.iter().enumerate() {
            // Closing-jump operands keep values alive but are not real uses;
            // spilling such a value costs nothing on the hot path.
            let real = op.opcode != Opcode::Jump;
            for &arg in &op.args {
                if let Some(id) = Self::value_id(n_inputs, arg) {
                    debug_assert!(
                        id < n_inputs || id - n_inputs < pos || op.opcode == Opcode::Label,
                        "operand defined at or after its use"
                    );
                    lives[id].note_use(pos, real);
                }
            }
            if let Some(fail_args) = &op.fail_args {
                for &arg in fail_args {
                    if let Some(id) = Self::value_id(n_inputs, arg) {
                        lives[id].note_use(pos, false);
                    }
                }
            }
        }

        let out = Lifetimes { lives, n_inputs };
        if cfg!(debug_assertions) {
            out.assert_valid();
        }
        out
    }

    /// definition <= every real use <= last usage.
    pub fn assert_valid(&self) {
        for (id, life) in self.lives.iter().enumerate() {
            for &u in &life.real_uses {
                assert!(life.def <= u, "value {id}: real use before definition");
                assert!(u <= life.last_use, "value {id}: real use after last use");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Const, Descr, TraceOp};

    fn v_in(i: usize) -> Value {
        Value::Input(i)
    }
    fn v_op(j: usize) -> Value {
        Value::Op(j)
    }

    #[test]
    fn test_simple_trace_lifetimes() {
        // v0 = in0 + in1 ; guard_true(v0 < 10) fail=[v0] ; finish(v0)
        let ops = vec![
            TraceOp::new(Opcode::IntAdd, vec![v_in(0), v_in(1)]),
            TraceOp::new(Opcode::IntLt, vec![v_op(0), Value::Const(Const::Int(10))]),
            TraceOp::guard(Opcode::GuardTrue, vec![v_op(1)], vec![v_op(0)], 1),
            TraceOp::with_descr(Opcode::Finish, vec![v_op(0)], Descr::Deopt(2)),
        ];
        let lives = Lifetimes::compute(2, &ops);

        // Inputs used once, at op 0.
        assert_eq!(lives.get(0).real_uses, vec![0]);
        assert_eq!(lives.get(0).last_use, 0);

        // v0 (id 2): defined at 0, really used at 1 and 3, kept alive by the
        // guard's failure exit at 2.
        let v0 = lives.get(2);
        assert_eq!(v0.def, 0);
        assert_eq!(v0.real_uses, vec![1, 3]);
        assert_eq!(v0.last_use, 3);

        // v1 (id 3): the guard condition, really used at 2.
        assert_eq!(lives.get(3).real_uses, vec![2]);
        lives.assert_valid();
    }

    #[test]
    fn test_fail_arg_extends_but_is_not_real() {
        let ops = vec![
            TraceOp::new(Opcode::IntAdd, vec![v_in(0), v_in(1)]),
            TraceOp::new(Opcode::IntIsTrue, vec![v_in(0)]),
            TraceOp::guard(Opcode::GuardTrue, vec![v_op(1)], vec![v_op(0)], 9),
        ];
        let lives = Lifetimes::compute(2, &ops);
        let v0 = lives.get(2);
        assert_eq!(v0.real_uses, vec![]);
        assert_eq!(v0.last_use, 2);
        assert!(v0.only_exit_uses_after(1));
    }

    #[test]
    fn test_jump_use_is_not_real() {
        // label(in0) ; v0 = in0 + 1 ; jump(v0)
        let ops = vec![
            TraceOp::new(Opcode::Label, vec![v_in(0)]),
            TraceOp::new(Opcode::IntAdd, vec![v_in(0), Value::Const(Const::Int(1))]),
            TraceOp::new(Opcode::Jump, vec![v_op(1)]),
        ];
        let lives = Lifetimes::compute(1, &ops);
        let v0 = lives.get(2);
        assert_eq!(v0.real_uses, vec![]);
        assert_eq!(v0.last_use, 2);
        assert!(v0.only_exit_uses_after(2));
    }

    #[test]
    fn test_next_real_use_and_hints() {
        let mut lives = Lifetimes::from_raw(vec![Lifetime {
            def: 0,
            last_use: 9,
            real_uses: vec![2, 5, 9],
            hints: vec![],
        }]);
        assert_eq!(lives.get(0).next_real_use(0), Some(2));
        assert_eq!(lives.get(0).next_real_use(3), Some(5));
        assert_eq!(lives.get(0).next_real_use(6), Some(9));
        assert_eq!(lives.get(0).next_real_use(10), None);

        lives.add_hint(0, 5, AsmReg::gp(7));
        lives.add_hint(0, 2, AsmReg::gp(6));
        assert_eq!(lives.get(0).hint_after(0), Some(AsmReg::gp(6)));
        assert_eq!(lives.get(0).hint_after(3), Some(AsmReg::gp(7)));
        assert_eq!(lives.get(0).hint_after(6), None);
    }
}
