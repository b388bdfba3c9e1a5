// This module is the runtime front door. It owns one assembler per compiled
// unit: compile_loop and compile_bridge each run the allocator driver over a
// fresh code buffer, lay the finished artifact out in executable memory
// ([constant table | code]), apply the relocations that needed the final base
// address, protect the region, and hand back a CompiledUnit carrying the entry
// address, the loop-start address, the total code size, the frame depth for
// the stack-check prologue, the guard table with patchable jump offsets and
// descriptor identifiers, and operation-to-code-offset pairs for diagnostics.
// Attaching a bridge patches the originating guard's conditional jump to the
// bridge entry; invalidation overwrites a guard site with an unconditional
// jump to its own recovery stub. The frame object the generated code runs
// against is defined here as well.

//! Compile-loop / compile-bridge entry points and unit patching.

use log::info;

use crate::core::error::{CompileError, CompileResult};
use crate::gc::GcDescriptor;
use crate::ir::{TraceOp, ValueKind};
use crate::x64::emitter::Reloc;
use crate::x64::guards::{GuardState, GuardToken};
use crate::x64::location::Location;
use crate::x64::memory::ExecutableMemory;
use crate::x64::regalloc::{FinishInfo, RegAlloc, TargetToken, UnitParts};
use crate::x64::{
    fixed_frame_slots, register_save_slot, TargetDesc, WordWidth, FRAME_HEADER_WORDS,
};

/// Signature of a compiled unit's entry: interpreter frame pointer and
/// thread-local-storage pointer in, frame pointer out.
pub type EntryFn = unsafe extern "C" fn(*mut usize, *mut u8) -> *mut usize;

/// One compiled unit: a loop or a bridge.
pub struct CompiledUnit {
    mem: ExecutableMemory,
    /// Start of the code (after the constant table); the unit's entry.
    pub entry: u64,
    /// Address of the loop header, target of back jumps and bridges.
    pub loop_start: u64,
    /// Total bytes of table plus code.
    pub code_size: usize,
    /// Frame slots (header excluded) this unit needs; consumed by the
    /// stack-check prologue of whoever jumps here.
    pub frame_depth: u32,
    pub spill_depth: u32,
    pub guards: Vec<GuardToken>,
    pub finishes: Vec<FinishInfo>,
    /// (operation index, code offset) pairs.
    pub op_offsets: Vec<(usize, usize)>,
    pub target_token: Option<TargetToken>,
    /// Where the caller writes each input value before entering.
    pub input_locations: Vec<Location>,
    width: WordWidth,
    /// Root bitmaps referenced by address from the code.
    _gc_maps: Vec<Box<[usize]>>,
}

impl CompiledUnit {
    pub fn entry_fn(&self) -> EntryFn {
        unsafe { std::mem::transmute::<u64, EntryFn>(self.entry) }
    }

    /// Copy of the unit's code bytes (constant table excluded); diagnostics
    /// and disassembly.
    pub fn code_bytes(&self) -> Vec<u8> {
        let table_bytes = (self.entry - self.mem.base()) as usize;
        let mut out = vec![0u8; self.code_size - table_bytes];
        self.mem.read(table_bytes, &mut out);
        out
    }

    fn code_offset_to_addr(&self, offset: usize) -> u64 {
        self.entry + offset as u64
    }

    /// Retarget a guard's conditional jump to `target`; the rel32 site was
    /// reserved for exactly this.
    pub fn patch_guard(&mut self, guard_index: usize, target: u64) -> CompileResult<()> {
        let patch_offset = self.guards[guard_index].patch_offset;
        let site = self.code_offset_to_addr(patch_offset);
        let rel = target.wrapping_sub(site + 6) as i64;
        let rel = i32::try_from(rel).map_err(|_| CompileError::Memory {
            reason: "bridge out of rel32 range".into(),
        })?;
        let table_bytes = (self.entry - self.mem.base()) as usize;
        self.mem
            .patch(table_bytes + patch_offset + 2, &rel.to_le_bytes())?;
        self.guards[guard_index].state = GuardState::Patched;
        Ok(())
    }

    /// Force a guard to always deoptimize: overwrite the conditional jump
    /// with an unconditional jump to its own recovery stub.
    pub fn invalidate_guard(&mut self, guard_index: usize) -> CompileResult<()> {
        let (patch_offset, stub_offset) = {
            let g = &self.guards[guard_index];
            (g.patch_offset, g.stub_offset.expect("stub not yet emitted"))
        };
        let site = self.code_offset_to_addr(patch_offset);
        let stub = self.code_offset_to_addr(stub_offset);
        let rel = i32::try_from(stub.wrapping_sub(site + 5) as i64)
            .expect("stub within the same unit");
        let mut bytes = [0u8; 6];
        bytes[0] = 0xe9;
        bytes[1..5].copy_from_slice(&rel.to_le_bytes());
        bytes[5] = 0x90;
        let table_bytes = (self.entry - self.mem.base()) as usize;
        self.mem.patch(table_bytes + patch_offset, &bytes)
    }
}

/// The front door: one assembler per unit, shared target and runtime
/// descriptors across them.
pub struct Runner {
    pub target: TargetDesc,
    pub runtime: GcDescriptor,
}

impl Runner {
    pub fn new(target: TargetDesc, runtime: GcDescriptor) -> Self {
        Runner { target, runtime }
    }

    /// Compile a trace into a fresh unit.
    pub fn compile_loop(&self, inputs: &[ValueKind], ops: &[TraceOp]) -> CompileResult<CompiledUnit> {
        let mut ra = RegAlloc::new_loop(&self.target, &self.runtime, inputs, ops);
        ra.compile(ops, true)?;
        let unit = self.finalize(ra.into_parts())?;
        info!(
            "compiled loop: {} ops, {} bytes, frame depth {}",
            ops.len(),
            unit.code_size,
            unit.frame_depth
        );
        Ok(unit)
    }

    /// Compile a continuation for a failing guard and patch the originating
    /// jump to enter it. Inputs are the guard's failure arguments, in order;
    /// a closing Jump targets the parent's loop header.
    pub fn compile_bridge(
        &self,
        parent: &mut CompiledUnit,
        guard_index: usize,
        input_kinds: &[ValueKind],
        ops: &[TraceOp],
    ) -> CompileResult<CompiledUnit> {
        let fail_locations = parent.guards[guard_index].fail_locations.clone();
        let jump_target = parent
            .target_token
            .clone()
            .map(|t| (t.clone(), parent.code_offset_to_addr(t.code_offset)));
        let mut ra = RegAlloc::new_bridge(
            &self.target,
            &self.runtime,
            input_kinds,
            ops,
            &fail_locations,
            parent.spill_depth,
            jump_target,
        );
        ra.compile(ops, false)?;
        let unit = self.finalize(ra.into_parts())?;
        parent.patch_guard(guard_index, unit.entry)?;
        info!(
            "compiled bridge for guard {}: {} ops, {} bytes",
            guard_index,
            ops.len(),
            unit.code_size
        );
        Ok(unit)
    }

    /// Lay the artifact out at its final address, resolve relocations, and
    /// protect the region.
    fn finalize(&self, parts: UnitParts) -> CompileResult<CompiledUnit> {
        let artifact = parts.artifact;
        let total = artifact.total_size();
        let mut mem = ExecutableMemory::new(total)?;
        let base = mem.base();
        let code_base = base + artifact.table_bytes as u64;

        let mut table = vec![0u8; artifact.table_bytes];
        for (i, c) in artifact.consts.iter().enumerate() {
            table[i * 8..i * 8 + 8].copy_from_slice(&c.to_le_bytes());
        }
        mem.write(0, &table)?;

        let mut code = artifact.code;
        for reloc in &artifact.relocs {
            match *reloc {
                Reloc::Rel32 { at, target } => {
                    let next = code_base + at as u64 + 4;
                    let rel = i32::try_from(target.wrapping_sub(next) as i64).map_err(|_| {
                        CompileError::Memory { reason: "relocation out of rel32 range".into() }
                    })?;
                    code[at..at + 4].copy_from_slice(&rel.to_le_bytes());
                }
                Reloc::ConstAbs32 { at, index } => {
                    let addr = u32::try_from(base + index as u64 * 8).map_err(|_| {
                        CompileError::Memory { reason: "constant table above 4GiB".into() }
                    })?;
                    code[at..at + 4].copy_from_slice(&addr.to_le_bytes());
                }
            }
        }
        mem.write(artifact.table_bytes, &code)?;
        mem.make_executable()?;

        let loop_start = parts
            .target_token
            .as_ref()
            .map(|t| code_base + t.code_offset as u64)
            .unwrap_or(code_base);
        Ok(CompiledUnit {
            mem,
            entry: code_base,
            loop_start,
            code_size: total,
            frame_depth: fixed_frame_slots(artifact.width) + parts.spill_depth,
            spill_depth: parts.spill_depth,
            guards: parts.guards,
            finishes: parts.finishes,
            op_offsets: parts.op_offsets,
            target_token: parts.target_token,
            input_locations: parts.input_locations,
            width: artifact.width,
            _gc_maps: parts.gc_maps,
        })
    }
}

/// A heap frame a test or embedding interpreter hands to generated code.
/// Header words first (descriptor, root map, saved exception, depth), then
/// the slot array: register save area followed by spill slots.
pub struct OwnedJitFrame {
    words: Vec<usize>,
    width: WordWidth,
}

impl OwnedJitFrame {
    pub fn with_depth(depth: u32, width: WordWidth) -> Self {
        let mut words = vec![0usize; FRAME_HEADER_WORDS as usize + depth as usize];
        words[3] = depth as usize;
        OwnedJitFrame { words, width }
    }

    pub fn for_unit(unit: &CompiledUnit) -> Self {
        Self::with_depth(unit.frame_depth, unit.width)
    }

    pub fn as_mut_ptr(&mut self) -> *mut usize {
        self.words.as_mut_ptr()
    }

    pub fn descr(&self) -> usize {
        self.words[0]
    }

    pub fn gc_map(&self) -> usize {
        self.words[1]
    }

    pub fn guard_exc(&self) -> usize {
        self.words[2]
    }

    pub fn slot(&self, abs_slot: u32) -> usize {
        self.words[FRAME_HEADER_WORDS as usize + abs_slot as usize]
    }

    pub fn set_slot(&mut self, abs_slot: u32, value: usize) {
        self.words[FRAME_HEADER_WORDS as usize + abs_slot as usize] = value;
    }

    /// Read a value out of the frame through a fail location. Register
    /// locations read the save area the exit trampoline dumped.
    pub fn read_location(&self, loc: &Location) -> usize {
        match loc {
            Location::Gp(r) | Location::Fp(r) => self.slot(register_save_slot(self.width, *r)),
            Location::Stack { slot, .. } => self.slot(*slot),
            Location::Imm(v) => *v as usize,
            Location::Mem(addr) => unsafe { *(*addr as *const usize) },
        }
    }

    /// Place an input value per the unit's input locations; loop inputs
    /// always live in frame slots.
    pub fn write_location(&mut self, loc: &Location, value: usize) {
        match loc {
            Location::Stack { slot, .. } => self.set_slot(*slot, value),
            Location::Gp(r) | Location::Fp(r) => {
                self.set_slot(register_save_slot(self.width, *r), value)
            }
            other => panic!("cannot seed input at {other:?}"),
        }
    }
}
