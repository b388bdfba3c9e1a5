//! hotloop: a trace JIT backend for x86/x86-64.
//!
//! The backend translates linear traces recorded by a meta-tracing execution
//! engine into native code at run time. It covers register allocation, an
//! operand-location abstraction, machine-code emission with self-relocation,
//! calling-convention adaptation, and guard/deoptimization code generation.
//! The front end producing traces, the trace optimizer, and the collector's
//! object layout are external collaborators reached through narrow
//! descriptor types.
//!
//! # Primary usage
//!
//! ```ignore
//! use hotloop::{Runner, TargetDesc, GcDescriptor};
//!
//! let runner = Runner::new(TargetDesc::host(), GcDescriptor::default());
//! let unit = runner.compile_loop(&inputs, &ops)?;
//! // unit.entry, unit.loop_start, unit.code_size, unit.frame_depth,
//! // unit.guards, unit.op_offsets ...
//! let bridge = runner.compile_bridge(&mut unit, guard_index, &kinds, &ops)?;
//! ```
//!
//! # Architecture
//!
//! - [`ir`]: inbound trace operations and descriptors
//! - [`core`]: lifetimes, frame slots, the generic register manager
//! - [`x64`]: location model, emitter, allocator driver, call builder,
//!   guards, executable memory, and the front door
//! - [`gc`]: the collector/runtime contract generated code cooperates with

pub mod core;
pub mod gc;
pub mod ir;
pub mod x64;

pub use crate::core::{CompileError, CompileResult};
pub use gc::{GcDescriptor, WriteBarrierDescr};
pub use ir::{CallDescr, Const, Descr, FieldDescr, Opcode, TraceOp, Value, ValueKind};
pub use x64::location::Location;
pub use x64::regalloc::TargetToken;
pub use x64::runner::{CompiledUnit, EntryFn, OwnedJitFrame, Runner};
pub use x64::{Abi, TargetDesc, WordWidth};
