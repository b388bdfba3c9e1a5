// This module is the target-independent half of the backend: error types,
// per-value lifetime computation, frame-slot bookkeeping, and the generic
// register manager the x86 specialization drives. Nothing here knows about
// instruction encodings or calling conventions; registers are opaque
// (bank, id) pairs and frame slots are word indices. The x64 module supplies
// the concrete register model, the emitter, and the allocator driver on top.

//! Target-independent allocation infrastructure.

pub mod error;
pub mod frame;
pub mod lifetime;
pub mod regalloc;

pub use error::{CompileError, CompileResult};
pub use frame::{FrameManager, SlotWidth};
pub use lifetime::{Lifetime, Lifetimes};
pub use regalloc::{AsmReg, RegBitSet, RegisterManager, ValueId, FP_BANK, GP_BANK};
