// This module captures the narrow contract the backend consumes from the garbage
// collector and the surrounding runtime. The backend never inspects object layout;
// it only needs a handful of addresses and a write-barrier descriptor: where the
// object status byte lives and which bit requests a barrier, the card-marking
// parameters for array stores, the barrier helper entry point, the nursery
// free/top words, the shadow-stack top word for root scanning, the process-wide
// lock word with its slow reacquisition helper, the thread-identity word inside
// thread-local storage, the exception slots saved/cleared around native calls,
// and the frame-reallocation helper invoked by the stack-check prologue.

//! Collector and runtime contract consumed by generated code.

/// Write-barrier descriptor: one status byte test decides the fast path.
#[derive(Debug, Clone, Copy)]
pub struct WriteBarrierDescr {
    /// Byte offset of the GC status byte from the object start.
    pub flag_offset: i32,
    /// Bit that means "barrier needed" in the status byte.
    pub flag_mask: u8,
    /// Bit that means "cards already set" in the status byte; enables the
    /// set-one-card-bit fast case of the out-of-line sequence.
    pub cards_set_mask: u8,
    /// log2 of array elements per card.
    pub card_page_shift: u8,
    /// Byte offset of the card bit array from the object start.
    pub card_base_offset: i32,
    /// `extern "C" fn(obj: *mut u8)` general barrier helper.
    pub helper: usize,
}

impl WriteBarrierDescr {
    /// Whether array stores may use card marking at all.
    pub fn has_cards(&self) -> bool {
        self.cards_set_mask != 0
    }
}

/// Everything generated code needs from the collector and runtime, by address.
/// All addresses must stay valid for the lifetime of the compiled units.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcDescriptor {
    pub write_barrier: Option<WriteBarrierDescr>,

    /// Nursery allocation words; consumed by future allocation fast paths and
    /// published here so units compiled today stay compatible.
    pub nursery_free_addr: usize,
    pub nursery_top_addr: usize,

    /// Address of the shadow-stack top pointer. When nonzero, every unit
    /// pushes its frame on entry and pops it on exit so concurrent collection
    /// can walk live frames.
    pub root_stack_top_addr: usize,

    /// Process-wide lock word (0 = released, 1 = held) and the slow
    /// reacquisition helper, `extern "C" fn()`.
    pub lock_addr: usize,
    pub lock_reacquire: usize,
    /// Byte offset of the thread-identity word inside the thread-local block.
    pub tls_ident_offset: i32,

    /// Host exception slots, saved into the frame and cleared around calls.
    pub exc_type_addr: usize,
    pub exc_value_addr: usize,

    /// `extern "C" fn(frame: *mut JitFrame, depth: usize) -> *mut JitFrame`,
    /// called by the stack-check prologue when an incoming jump needs more
    /// frame than reserved.
    pub realloc_frame: usize,
}

impl GcDescriptor {
    pub fn has_shadow_stack(&self) -> bool {
        self.root_stack_top_addr != 0
    }

    pub fn has_exception_slots(&self) -> bool {
        self.exc_type_addr != 0
    }
}
