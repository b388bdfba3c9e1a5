// This module defines the operand-location abstraction: where a value lives at a
// given point of the generated code. A location is a register of either bank, a
// frame slot (carried as an absolute slot index, not a byte offset; the byte
// offset derives from the fixed per-frame base), an immediate, or a raw absolute
// address. Locations flow from the register allocator into the emitter, the call
// builder, guard fail-location lists, and the parallel-move resolver; the
// conversion into concrete iced-x86 operand forms happens in the emitter.

//! Operand locations.

use crate::core::regalloc::AsmReg;
use crate::ir::ValueKind;
use crate::x64::{frame_slot_offset, WordWidth};

/// Where a value lives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Location {
    /// General-purpose register.
    Gp(AsmReg),
    /// Floating-point register.
    Fp(AsmReg),
    /// Absolute frame slot (save area + spill area share the index space).
    Stack { slot: u32, kind: ValueKind },
    /// Immediate operand.
    Imm(i64),
    /// Word at an absolute address.
    Mem(u64),
}

impl Location {
    pub fn stack(slot: u32, kind: ValueKind) -> Self {
        Location::Stack { slot, kind }
    }

    pub fn is_register(&self) -> bool {
        matches!(self, Location::Gp(_) | Location::Fp(_))
    }

    pub fn is_stack(&self) -> bool {
        matches!(self, Location::Stack { .. })
    }

    pub fn as_gp(&self) -> Option<AsmReg> {
        match self {
            Location::Gp(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_fp(&self) -> Option<AsmReg> {
        match self {
            Location::Fp(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_reg(&self) -> Option<AsmReg> {
        match self {
            Location::Gp(r) | Location::Fp(r) => Some(*r),
            _ => None,
        }
    }

    /// Byte offset from the frame pointer for stack locations.
    pub fn frame_offset(&self, width: WordWidth) -> Option<i32> {
        match self {
            Location::Stack { slot, .. } => Some(frame_slot_offset(width, *slot)),
            _ => None,
        }
    }

    /// Two stack locations overlap if their word ranges intersect; doubles on
    /// the 32-bit ABI cover two words.
    pub fn overlaps(&self, other: &Location, width: WordWidth) -> bool {
        let span = |loc: &Location| match loc {
            Location::Stack { slot, kind } => {
                let words = if kind.is_float() && width == WordWidth::W32 { 2 } else { 1 };
                Some((*slot, *slot + words))
            }
            _ => None,
        };
        match (span(self), span(other)) {
            (Some((a0, a1)), Some((b0, b1))) => a0 < b1 && b0 < a1,
            _ => self == other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x64::RAX;

    #[test]
    fn test_accessors() {
        assert_eq!(Location::Gp(RAX).as_gp(), Some(RAX));
        assert_eq!(Location::Imm(5).as_gp(), None);
        assert!(Location::stack(3, ValueKind::Int).is_stack());
        assert!(!Location::Mem(0x1000).is_register());
    }

    #[test]
    fn test_frame_offsets_follow_width() {
        let loc = Location::stack(32, ValueKind::Int);
        // Header (4 words) + 32 slots.
        assert_eq!(loc.frame_offset(WordWidth::W64), Some((4 + 32) * 8));
        assert_eq!(loc.frame_offset(WordWidth::W32), Some((4 + 32) * 4));
        assert_eq!(Location::Gp(RAX).frame_offset(WordWidth::W64), None);
    }

    #[test]
    fn test_overlap_of_wide_slots() {
        let a = Location::stack(24, ValueKind::Float);
        let b = Location::stack(25, ValueKind::Int);
        // On the 32-bit ABI the double spans slots 24-25.
        assert!(a.overlaps(&b, WordWidth::W32));
        assert!(!a.overlaps(&b, WordWidth::W64));
        assert!(!a.overlaps(&Location::stack(26, ValueKind::Int), WordWidth::W32));
    }
}
