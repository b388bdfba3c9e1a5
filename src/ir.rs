// This module defines the inbound trace representation consumed by the backend: a
// closed Opcode enumeration (the redesign of the original's name-resolved dispatch
// tables), TraceOp nodes with typed operands, and the descriptor structs that
// accompany memory and call operations. A trace is an ordered operation list plus
// an ordered input-value list; operands reference either an input, the result of
// an earlier operation, or a constant. The trace is owned by the caller and
// read-only to the backend. Guards additionally carry a failure-argument list
// naming the values the interpreter needs to reconstruct its state, and an opaque
// descriptor identifier the runtime maps back to interpreter state.

//! Trace operations and descriptors.

/// Index of an operation within a trace.
pub type OpIndex = usize;

/// Type tag of a trace value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// Machine-word integer.
    Int,
    /// GC-managed reference (word-sized, tracked in root maps).
    Ref,
    /// Double-precision float (two words on the 32-bit ABI).
    Float,
}

impl ValueKind {
    /// Whether values of this kind live in the floating-point bank.
    pub fn is_float(self) -> bool {
        matches!(self, ValueKind::Float)
    }
}

/// A compile-time constant operand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Const {
    Int(i64),
    Float(f64),
    /// Raw pointer constant; the tracer only emits these for pinned objects.
    Ref(u64),
}

impl Const {
    pub fn kind(self) -> ValueKind {
        match self {
            Const::Int(_) => ValueKind::Int,
            Const::Float(_) => ValueKind::Float,
            Const::Ref(_) => ValueKind::Ref,
        }
    }

    /// Integer bit pattern of the constant.
    pub fn bits(self) -> i64 {
        match self {
            Const::Int(v) => v,
            Const::Float(v) => v.to_bits() as i64,
            Const::Ref(v) => v as i64,
        }
    }
}

/// An operand of a trace operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// The i-th entry of the unit's input-value list.
    Input(usize),
    /// The result of the operation at the given index.
    Op(OpIndex),
    /// A constant.
    Const(Const),
}

impl Value {
    pub fn as_const(self) -> Option<Const> {
        match self {
            Value::Const(c) => Some(c),
            _ => None,
        }
    }
}

/// Closed operation set. One backend handler exists per variant; an opcode the
/// backend cannot encode for the requested operand shape is a fatal
/// `NotImplemented` error, never a silent fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // Integer arithmetic and bit operations.
    IntAdd,
    IntSub,
    IntMul,
    IntAnd,
    IntOr,
    IntXor,
    IntLshift,
    IntRshift,
    UintRshift,
    IntNeg,
    IntInvert,

    // Integer comparisons; result is 0 or 1.
    IntLt,
    IntLe,
    IntEq,
    IntNe,
    IntGt,
    IntGe,
    UintLt,
    UintLe,
    UintGt,
    UintGe,
    IntIsZero,
    IntIsTrue,

    // Reference comparisons.
    PtrEq,
    PtrNe,

    // Float arithmetic.
    FloatAdd,
    FloatSub,
    FloatMul,
    FloatDiv,
    FloatNeg,
    FloatAbs,

    // Float comparisons; result is 0 or 1.
    FloatLt,
    FloatLe,
    FloatEq,
    FloatNe,
    FloatGt,
    FloatGe,

    // Conversions.
    CastFloatToInt,
    CastIntToFloat,

    // Field access; descr is a FieldDescr.
    GetField,
    SetField,

    // Write-barrier fast paths. The plain form tests the object's status byte
    // and calls the barrier helper out of line; the array form additionally
    // supports card marking with the element index as second argument.
    CondCallGcWb,
    CondCallGcWbArray,

    // Calls; first argument is the target, descr is a CallDescr.
    Call,
    CallReleaseLock,

    // Control.
    Label,
    GuardTrue,
    GuardFalse,
    GuardValue,
    GuardNoException,
    Jump,
    Finish,
}

impl Opcode {
    pub fn is_guard(self) -> bool {
        matches!(
            self,
            Opcode::GuardTrue | Opcode::GuardFalse | Opcode::GuardValue | Opcode::GuardNoException
        )
    }

    /// Symmetric binary operations may swap operand order to avoid a move.
    pub fn is_symmetric(self) -> bool {
        matches!(
            self,
            Opcode::IntAdd
                | Opcode::IntMul
                | Opcode::IntAnd
                | Opcode::IntOr
                | Opcode::IntXor
                | Opcode::IntEq
                | Opcode::IntNe
                | Opcode::PtrEq
                | Opcode::PtrNe
                | Opcode::FloatAdd
                | Opcode::FloatMul
                | Opcode::FloatEq
                | Opcode::FloatNe
        )
    }

    /// Whether this opcode produces a result value.
    pub fn has_result(self) -> bool {
        !matches!(
            self,
            Opcode::SetField
                | Opcode::CondCallGcWb
                | Opcode::CondCallGcWbArray
                | Opcode::Label
                | Opcode::GuardTrue
                | Opcode::GuardFalse
                | Opcode::GuardValue
                | Opcode::GuardNoException
                | Opcode::Jump
                | Opcode::Finish
        )
    }
}

/// Field layout descriptor for GetField/SetField.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldDescr {
    /// Byte offset of the field from the object start.
    pub offset: i32,
    /// Field width in bytes (1, 2, 4, or the word size; 8 for floats).
    pub size: u8,
    pub kind: ValueKind,
    /// Sign-extend narrow integer loads.
    pub signed: bool,
}

/// Call-site descriptor: the ABI-declared signature of the target.
#[derive(Debug, Clone, PartialEq)]
pub struct CallDescr {
    pub args: Vec<ValueKind>,
    pub result: Option<ValueKind>,
    /// Whether the callee may trigger a collection; controls root-map
    /// bookkeeping around the call.
    pub can_collect: bool,
    /// Save and clear a raised exception into the frame after the call
    /// instead of letting it leak into the next native call.
    pub save_exception: bool,
}

impl CallDescr {
    pub fn new(args: Vec<ValueKind>, result: Option<ValueKind>) -> Self {
        CallDescr {
            args,
            result,
            can_collect: true,
            save_exception: false,
        }
    }
}

/// Descriptor payload attached to an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Descr {
    Field(FieldDescr),
    Call(CallDescr),
    /// Opaque identifier the runtime maps back to interpreter state; carried
    /// by guards and by Finish.
    Deopt(u64),
}

impl Descr {
    pub fn as_field(&self) -> Option<&FieldDescr> {
        match self {
            Descr::Field(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_call(&self) -> Option<&CallDescr> {
        match self {
            Descr::Call(c) => Some(c),
            _ => None,
        }
    }

    pub fn deopt_id(&self) -> Option<u64> {
        match self {
            Descr::Deopt(id) => Some(*id),
            _ => None,
        }
    }
}

/// One operation of a trace.
#[derive(Debug, Clone)]
pub struct TraceOp {
    pub opcode: Opcode,
    pub args: Vec<Value>,
    pub descr: Option<Descr>,
    /// Values the interpreter needs if this guard fails. Present on guards only.
    pub fail_args: Option<Vec<Value>>,
}

impl TraceOp {
    pub fn new(opcode: Opcode, args: Vec<Value>) -> Self {
        TraceOp {
            opcode,
            args,
            descr: None,
            fail_args: None,
        }
    }

    pub fn with_descr(opcode: Opcode, args: Vec<Value>, descr: Descr) -> Self {
        TraceOp {
            opcode,
            args,
            descr: Some(descr),
            fail_args: None,
        }
    }

    pub fn guard(opcode: Opcode, args: Vec<Value>, fail_args: Vec<Value>, descr_id: u64) -> Self {
        debug_assert!(opcode.is_guard());
        TraceOp {
            opcode,
            args,
            descr: Some(Descr::Deopt(descr_id)),
            fail_args: Some(fail_args),
        }
    }

    /// Kind of the result value, if the operation produces one. Field loads
    /// and calls take theirs from the descriptor.
    pub fn result_kind(&self) -> Option<ValueKind> {
        use Opcode::*;
        match self.opcode {
            IntAdd | IntSub | IntMul | IntAnd | IntOr | IntXor | IntLshift | IntRshift
            | UintRshift | IntNeg | IntInvert => Some(ValueKind::Int),
            IntLt | IntLe | IntEq | IntNe | IntGt | IntGe | UintLt | UintLe | UintGt | UintGe
            | IntIsZero | IntIsTrue | PtrEq | PtrNe => Some(ValueKind::Int),
            FloatAdd | FloatSub | FloatMul | FloatDiv | FloatNeg | FloatAbs => {
                Some(ValueKind::Float)
            }
            FloatLt | FloatLe | FloatEq | FloatNe | FloatGt | FloatGe => Some(ValueKind::Int),
            CastFloatToInt => Some(ValueKind::Int),
            CastIntToFloat => Some(ValueKind::Float),
            GetField => self.descr.as_ref().and_then(|d| d.as_field()).map(|f| f.kind),
            Call | CallReleaseLock => self
                .descr
                .as_ref()
                .and_then(|d| d.as_call())
                .and_then(|c| c.result),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_kinds() {
        let add = TraceOp::new(Opcode::IntAdd, vec![Value::Input(0), Value::Input(1)]);
        assert_eq!(add.result_kind(), Some(ValueKind::Int));

        let cmp = TraceOp::new(Opcode::FloatLt, vec![Value::Input(0), Value::Input(1)]);
        assert_eq!(cmp.result_kind(), Some(ValueKind::Int));

        let load = TraceOp::with_descr(
            Opcode::GetField,
            vec![Value::Input(0)],
            Descr::Field(FieldDescr {
                offset: 8,
                size: 8,
                kind: ValueKind::Ref,
                signed: false,
            }),
        );
        assert_eq!(load.result_kind(), Some(ValueKind::Ref));

        let store = TraceOp::with_descr(
            Opcode::SetField,
            vec![Value::Input(0), Value::Input(1)],
            Descr::Field(FieldDescr {
                offset: 8,
                size: 8,
                kind: ValueKind::Ref,
                signed: false,
            }),
        );
        assert_eq!(store.result_kind(), None);
    }

    #[test]
    fn test_guard_construction() {
        let g = TraceOp::guard(Opcode::GuardTrue, vec![Value::Op(2)], vec![Value::Op(1)], 42);
        assert!(g.opcode.is_guard());
        assert_eq!(g.descr.as_ref().unwrap().deopt_id(), Some(42));
        assert_eq!(g.fail_args.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn test_symmetric_ops() {
        assert!(Opcode::IntAdd.is_symmetric());
        assert!(Opcode::IntMul.is_symmetric());
        assert!(!Opcode::IntSub.is_symmetric());
        assert!(!Opcode::IntLshift.is_symmetric());
        assert!(!Opcode::FloatDiv.is_symmetric());
    }

    #[test]
    fn test_const_bits() {
        assert_eq!(Const::Int(-1).bits(), -1);
        assert_eq!(Const::Float(1.0).bits(), 1.0f64.to_bits() as i64);
    }
}
