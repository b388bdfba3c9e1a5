// This module is the x86/x86-64 specialization of the backend. It pins down the
// physical register model (hardware encoding order for both banks), the target
// description covering both ISA widths and both 64-bit host calling conventions,
// the layout of the interpreter-visible frame object generated code runs against,
// and the condition-code vocabulary shared by comparisons, guards, and the
// emitter. Submodules: location (operand-location abstraction), emitter (machine
// code emission with self-relocation), regalloc (the allocator driver and hint
// pass), calls (calling-convention adaptation), guards (deoptimization and
// write-barrier paths), remap (parallel-move resolution), memory (executable
// mapping), and runner (the runtime front door).

//! x86/x86-64 backend.

pub mod calls;
pub mod emitter;
pub mod guards;
pub mod location;
pub mod memory;
pub mod regalloc;
pub mod remap;
pub mod runner;

use crate::core::regalloc::{AsmReg, RegBitSet, FP_BANK, GP_BANK};

// General-purpose registers, hardware encoding order.
pub const RAX: AsmReg = AsmReg::gp(0);
pub const RCX: AsmReg = AsmReg::gp(1);
pub const RDX: AsmReg = AsmReg::gp(2);
pub const RBX: AsmReg = AsmReg::gp(3);
pub const RSP: AsmReg = AsmReg::gp(4);
pub const RBP: AsmReg = AsmReg::gp(5);
pub const RSI: AsmReg = AsmReg::gp(6);
pub const RDI: AsmReg = AsmReg::gp(7);
pub const R8: AsmReg = AsmReg::gp(8);
pub const R9: AsmReg = AsmReg::gp(9);
pub const R10: AsmReg = AsmReg::gp(10);
pub const R11: AsmReg = AsmReg::gp(11);
pub const R12: AsmReg = AsmReg::gp(12);
pub const R13: AsmReg = AsmReg::gp(13);
pub const R14: AsmReg = AsmReg::gp(14);
pub const R15: AsmReg = AsmReg::gp(15);

pub const XMM0: AsmReg = AsmReg::fp(0);
pub const XMM5: AsmReg = AsmReg::fp(5);
pub const XMM7: AsmReg = AsmReg::fp(7);
pub const XMM15: AsmReg = AsmReg::fp(15);

/// The register holding the frame-object pointer for the unit's whole run.
pub const FRAME_REG: AsmReg = RBP;

/// ISA width variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordWidth {
    W32,
    W64,
}

impl WordWidth {
    pub fn bytes(self) -> i32 {
        match self {
            WordWidth::W32 => 4,
            WordWidth::W64 => 8,
        }
    }

    pub fn bitness(self) -> u32 {
        match self {
            WordWidth::W32 => 32,
            WordWidth::W64 => 64,
        }
    }
}

/// Calling convention of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abi {
    /// x86-64 System V: register passing, no shadow space.
    SysV64,
    /// x86-64 Windows: register passing, 32-byte shadow space, xmm6+ preserved.
    Win64,
    /// 32-bit stack-passing convention.
    Cdecl32,
}

/// Everything width- or ABI-dependent the backend consults, in one place.
#[derive(Debug, Clone)]
pub struct TargetDesc {
    pub width: WordWidth,
    pub abi: Abi,
    /// Registers the allocator may bind values to.
    pub allocatable: RegBitSet,
    /// Registers a native call clobbers.
    pub caller_saved: RegBitSet,
    /// Callee-saved GP registers the prologue preserves, in push order.
    pub saved_gp: Vec<AsmReg>,
    /// Scratch register for constants that fit no narrower encoding.
    /// The 32-bit variant has none; imm32 covers its word.
    pub gp_scratch: Option<AsmReg>,
    /// Scratch register for float moves through memory.
    pub fp_scratch: AsmReg,
    /// Registers usable as byte operands (setcc, byte stores). All of them
    /// on 64-bit; only a/c/d/b on the 32-bit variant.
    pub byte_regs: RegBitSet,
}

impl TargetDesc {
    pub fn sysv64() -> Self {
        let mut allocatable = RegBitSet::first_n(GP_BANK, 16);
        allocatable.remove(RSP);
        allocatable.remove(FRAME_REG);
        allocatable.remove(R11); // scratch
        let mut fp = RegBitSet::first_n(FP_BANK, 15); // xmm15 is scratch
        allocatable.union(&fp);

        let mut caller_saved = RegBitSet::empty();
        for r in [RAX, RCX, RDX, RSI, RDI, R8, R9, R10, R11] {
            caller_saved.insert(r);
        }
        fp = RegBitSet::first_n(FP_BANK, 16);
        caller_saved.union(&fp);

        TargetDesc {
            width: WordWidth::W64,
            abi: Abi::SysV64,
            allocatable,
            caller_saved,
            saved_gp: vec![RBP, RBX, R12, R13, R14, R15],
            gp_scratch: Some(R11),
            fp_scratch: XMM15,
            byte_regs: RegBitSet::first_n(GP_BANK, 16),
        }
    }

    pub fn win64() -> Self {
        let mut allocatable = RegBitSet::first_n(GP_BANK, 16);
        allocatable.remove(RSP);
        allocatable.remove(FRAME_REG);
        allocatable.remove(R11);
        // xmm6-15 are callee-saved on Windows; excluding them beats
        // saving and restoring them in every prologue.
        allocatable.union(&RegBitSet::first_n(FP_BANK, 5));

        let mut caller_saved = RegBitSet::empty();
        for r in [RAX, RCX, RDX, R8, R9, R10, R11] {
            caller_saved.insert(r);
        }
        caller_saved.union(&RegBitSet::first_n(FP_BANK, 6));

        TargetDesc {
            width: WordWidth::W64,
            abi: Abi::Win64,
            allocatable,
            caller_saved,
            saved_gp: vec![RBP, RBX, RSI, RDI, R12, R13, R14, R15],
            gp_scratch: Some(R11),
            fp_scratch: XMM5,
            byte_regs: RegBitSet::first_n(GP_BANK, 16),
        }
    }

    pub fn cdecl32() -> Self {
        let mut allocatable = RegBitSet::empty();
        for r in [RAX, RCX, RDX, RBX, RSI, RDI] {
            allocatable.insert(r);
        }
        allocatable.union(&RegBitSet::first_n(FP_BANK, 7)); // xmm7 is scratch

        let mut caller_saved = RegBitSet::empty();
        for r in [RAX, RCX, RDX] {
            caller_saved.insert(r);
        }
        caller_saved.union(&RegBitSet::first_n(FP_BANK, 8));

        TargetDesc {
            width: WordWidth::W32,
            abi: Abi::Cdecl32,
            allocatable,
            caller_saved,
            saved_gp: vec![RBP, RBX, RSI, RDI],
            gp_scratch: None,
            fp_scratch: XMM7,
            byte_regs: RegBitSet::first_n(GP_BANK, 4),
        }
    }

    /// Target of the machine compiling this crate.
    #[cfg(target_arch = "x86_64")]
    pub fn host() -> Self {
        if cfg!(windows) {
            Self::win64()
        } else {
            Self::sysv64()
        }
    }

    pub fn word(&self) -> i32 {
        self.width.bytes()
    }

    /// Native-stack bytes the prologue reserves below the saved registers:
    /// the TLS pointer, the lock identity save, the call-result save, and
    /// whatever padding keeps the stack pointer 16-aligned afterwards.
    pub fn reserve_bytes(&self) -> i32 {
        match self.width {
            WordWidth::W64 => 40,
            WordWidth::W32 => 28,
        }
    }
}

// Frame object layout. The interpreter hands generated code a heap-allocated
// frame; header words first, then the slot array. The first slots form a
// register save area (GP bank then FP bank) dumped by the exit trampoline;
// allocator-managed spill slots follow.

/// Header words: descriptor id, GC-map pointer, saved exception, depth.
pub const FRAME_HEADER_WORDS: i32 = 4;

pub fn frame_descr_offset(_width: WordWidth) -> i32 {
    0
}

pub fn frame_gc_map_offset(width: WordWidth) -> i32 {
    width.bytes()
}

pub fn frame_guard_exc_offset(width: WordWidth) -> i32 {
    2 * width.bytes()
}

pub fn frame_depth_offset(width: WordWidth) -> i32 {
    3 * width.bytes()
}

/// Number of save-area slots preceding the spill area.
pub fn fixed_frame_slots(width: WordWidth) -> u32 {
    match width {
        // 16 GP words + 16 double-sized FP entries at one word each.
        WordWidth::W64 => 32,
        // 8 GP words + 8 double-sized FP entries at two words each.
        WordWidth::W32 => 8 + 16,
    }
}

/// Save-area slot of a register; absolute frame-slot index.
pub fn register_save_slot(width: WordWidth, reg: AsmReg) -> u32 {
    match width {
        WordWidth::W64 => {
            if reg.is_gp() {
                reg.id as u32
            } else {
                16 + reg.id as u32
            }
        }
        WordWidth::W32 => {
            if reg.is_gp() {
                reg.id as u32
            } else {
                8 + 2 * reg.id as u32
            }
        }
    }
}

/// Spill slot (frame-manager relative) to absolute frame-slot index.
pub fn spill_to_frame_slot(width: WordWidth, spill_index: u32) -> u32 {
    fixed_frame_slots(width) + spill_index
}

/// Byte offset of an absolute frame slot from the frame pointer.
pub fn frame_slot_offset(width: WordWidth, abs_slot: u32) -> i32 {
    (FRAME_HEADER_WORDS + abs_slot as i32) * width.bytes()
}

/// Condition codes, in the vocabulary the emitter and guards share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    E,
    Ne,
    L,
    Le,
    G,
    Ge,
    B,
    Be,
    A,
    Ae,
    P,
    Np,
}

impl Cond {
    pub fn negate(self) -> Cond {
        match self {
            Cond::E => Cond::Ne,
            Cond::Ne => Cond::E,
            Cond::L => Cond::Ge,
            Cond::Le => Cond::G,
            Cond::G => Cond::Le,
            Cond::Ge => Cond::L,
            Cond::B => Cond::Ae,
            Cond::Be => Cond::A,
            Cond::A => Cond::Be,
            Cond::Ae => Cond::B,
            Cond::P => Cond::Np,
            Cond::Np => Cond::P,
        }
    }

    /// Condition with the comparison operands exchanged.
    pub fn swap_operands(self) -> Cond {
        match self {
            Cond::L => Cond::G,
            Cond::Le => Cond::Ge,
            Cond::G => Cond::L,
            Cond::Ge => Cond::Le,
            Cond::B => Cond::A,
            Cond::Be => Cond::Ae,
            Cond::A => Cond::B,
            Cond::Ae => Cond::Be,
            other => other,
        }
    }
}
