// This module is the code builder: it appends machine code to a growable staging
// buffer, one emission routine per (mnemonic, operand-shape), so callers never
// hand-encode bytes. Encoding is table-driven through iced-x86; REX/operand-size
// prefixes fall out of which registers an instruction references. Both ISA
// widths share the same surface, selected by the buffer's word width. 64-bit
// immediates and addresses that fit no narrower encoding are materialized into
// the single scratch register (r11); a "scratch currently holds K" cache
// collapses nearby constant loads into short register arithmetic and is
// invalidated by anything that does not provably preserve the scratch value.
// Unresolved absolute targets are recorded as (offset, kind) relocation pairs
// and patched once the buffer has been copied to its final address-stable
// location; on the 64-bit variant a read-only constant table is laid out
// immediately before the code and addressed rip-relative, so embedded constants
// need no post-copy patching at all. Requesting a combination this module does
// not implement is a fatal NotImplemented error.

//! Machine-code emission.

use iced_x86::{Code, Encoder, Instruction, MemoryOperand, Register};

use crate::core::error::{CompileError, CompileResult};
use crate::core::regalloc::AsmReg;
use crate::x64::{Cond, WordWidth};

const GP64: [Register; 16] = [
    Register::RAX,
    Register::RCX,
    Register::RDX,
    Register::RBX,
    Register::RSP,
    Register::RBP,
    Register::RSI,
    Register::RDI,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
];

const GP32: [Register; 16] = [
    Register::EAX,
    Register::ECX,
    Register::EDX,
    Register::EBX,
    Register::ESP,
    Register::EBP,
    Register::ESI,
    Register::EDI,
    Register::R8D,
    Register::R9D,
    Register::R10D,
    Register::R11D,
    Register::R12D,
    Register::R13D,
    Register::R14D,
    Register::R15D,
];

const GP8: [Register; 16] = [
    Register::AL,
    Register::CL,
    Register::DL,
    Register::BL,
    Register::SPL,
    Register::BPL,
    Register::SIL,
    Register::DIL,
    Register::R8L,
    Register::R9L,
    Register::R10L,
    Register::R11L,
    Register::R12L,
    Register::R13L,
    Register::R14L,
    Register::R15L,
];

const GP16: [Register; 16] = [
    Register::AX,
    Register::CX,
    Register::DX,
    Register::BX,
    Register::SP,
    Register::BP,
    Register::SI,
    Register::DI,
    Register::R8W,
    Register::R9W,
    Register::R10W,
    Register::R11W,
    Register::R12W,
    Register::R13W,
    Register::R14W,
    Register::R15W,
];

const XMM: [Register; 16] = [
    Register::XMM0,
    Register::XMM1,
    Register::XMM2,
    Register::XMM3,
    Register::XMM4,
    Register::XMM5,
    Register::XMM6,
    Register::XMM7,
    Register::XMM8,
    Register::XMM9,
    Register::XMM10,
    Register::XMM11,
    Register::XMM12,
    Register::XMM13,
    Register::XMM14,
    Register::XMM15,
];

/// The scratch register of the 64-bit variant.
const SCRATCH: AsmReg = AsmReg::gp(11);

/// Memory operand, before conversion to a concrete addressing form.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Mem {
    /// `[base + disp]`.
    Base { base: AsmReg, disp: i32 },
    /// Word at an absolute address. Materializes through the scratch register
    /// on the 64-bit variant when out of disp32 range.
    Abs(u64),
}

impl Mem {
    pub fn base(base: AsmReg, disp: i32) -> Self {
        Mem::Base { base, disp }
    }
}

/// A not-yet-placed code position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Relocation record: an absolute target unresolved until the buffer reaches
/// its final location.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reloc {
    /// rel32 field at `at` targeting absolute address `target`.
    Rel32 { at: usize, target: u64 },
    /// 32-bit absolute reference at `at` to constant-table entry `index`.
    ConstAbs32 { at: usize, index: u32 },
}

/// The finished staging output: constant table, code bytes (label fixups and
/// rip-relative constant references already applied), and the relocations the
/// front door patches once the final base address is known.
#[derive(Debug)]
pub struct CodeArtifact {
    pub width: WordWidth,
    pub consts: Vec<u64>,
    pub code: Vec<u8>,
    /// Bytes occupied by the constant table before the code, 16-aligned.
    pub table_bytes: usize,
    pub relocs: Vec<Reloc>,
}

impl CodeArtifact {
    pub fn total_size(&self) -> usize {
        self.table_bytes + self.code.len()
    }
}

/// Append-only machine code buffer for one compilation unit.
pub struct CodeBuffer {
    width: WordWidth,
    bytes: Vec<u8>,
    encoder: Encoder,
    labels: Vec<Option<usize>>,
    /// (rel32 field offset, label) patched when the label binds.
    fixups: Vec<(usize, usize)>,
    relocs: Vec<Reloc>,
    consts: Vec<u64>,
    /// (rel32/disp field offset, constant index): rip-relative on the 64-bit
    /// variant, resolved at finish time.
    const_fixups: Vec<(usize, u32)>,
    /// Value currently held by the scratch register, when known.
    scratch_value: Option<i64>,
}

impl CodeBuffer {
    pub fn new(width: WordWidth) -> Self {
        CodeBuffer {
            width,
            bytes: Vec::with_capacity(4096),
            encoder: Encoder::new(width.bitness()),
            labels: Vec::new(),
            fixups: Vec::new(),
            relocs: Vec::new(),
            consts: Vec::new(),
            const_fixups: Vec::new(),
            scratch_value: None,
        }
    }

    pub fn width(&self) -> WordWidth {
        self.width
    }

    /// Current end of the buffer; the offset the next instruction lands at.
    pub fn offset(&self) -> usize {
        self.bytes.len()
    }

    // ---- plumbing ----

    fn gpw(&self, reg: AsmReg) -> Register {
        debug_assert!(reg.is_gp());
        match self.width {
            WordWidth::W64 => GP64[reg.id as usize],
            WordWidth::W32 => GP32[reg.id as usize],
        }
    }

    fn gp8(&self, reg: AsmReg) -> Register {
        debug_assert!(
            self.width == WordWidth::W64 || reg.id < 4,
            "byte operand needs a byte-addressable register on x86"
        );
        GP8[reg.id as usize]
    }

    fn xmm(&self, reg: AsmReg) -> Register {
        debug_assert!(!reg.is_gp());
        XMM[reg.id as usize]
    }

    /// Select by width; the instruction-table dimension the caller does not
    /// spell out.
    fn w(&self, w64: Code, w32: Code) -> Code {
        match self.width {
            WordWidth::W64 => w64,
            WordWidth::W32 => w32,
        }
    }

    fn emit(&mut self, insn: Instruction) -> CompileResult<usize> {
        let start = self.bytes.len();
        self.encoder
            .encode(&insn, start as u64)
            .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        let encoded = self.encoder.take_buffer();
        self.bytes.extend_from_slice(&encoded);
        Ok(start)
    }

    fn build2r(&self, code: Code, a: Register, b: Register) -> CompileResult<Instruction> {
        Instruction::with2(code, a, b).map_err(|e| CompileError::Encoding { reason: e.to_string() })
    }

    /// Anything that may change the scratch register without going through
    /// `materialize` kills the cache.
    fn wrote(&mut self, reg: AsmReg) {
        if reg == SCRATCH {
            self.scratch_value = None;
        }
    }

    fn invalidate_scratch(&mut self) {
        self.scratch_value = None;
    }

    /// Value the cache believes the scratch register holds.
    pub fn scratch_cached(&self) -> Option<i64> {
        self.scratch_value
    }

    /// Bring a constant that fits no narrower encoding into the scratch
    /// register. Consecutive nearby constants collapse into one load plus
    /// short adds while the cache remains valid.
    pub fn materialize(&mut self, value: i64) -> CompileResult<AsmReg> {
        debug_assert_eq!(self.width, WordWidth::W64, "the 32-bit variant has no scratch");
        if let Some(current) = self.scratch_value {
            if current == value {
                return Ok(SCRATCH);
            }
            let delta = value.wrapping_sub(current);
            if let Ok(delta32) = i32::try_from(delta) {
                let insn = Instruction::with2(
                    Code::Add_rm64_imm32,
                    GP64[SCRATCH.id as usize],
                    delta32,
                )
                .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
                self.emit(insn)?;
                self.scratch_value = Some(value);
                return Ok(SCRATCH);
            }
        }
        let insn = Instruction::with2(Code::Mov_r64_imm64, GP64[SCRATCH.id as usize], value)
            .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        self.emit(insn)?;
        self.scratch_value = Some(value);
        Ok(SCRATCH)
    }

    /// Concrete addressing form for a memory operand; may materialize an
    /// absolute address through the scratch register.
    fn mem_op(&mut self, mem: Mem) -> CompileResult<MemoryOperand> {
        match mem {
            Mem::Base { base, disp } => Ok(MemoryOperand::with_base_displ(self.gpw(base), disp as i64)),
            Mem::Abs(addr) => match self.width {
                WordWidth::W32 => Ok(MemoryOperand::with_displ(addr, 4)),
                WordWidth::W64 => {
                    // No direct 64-bit address form for most instructions:
                    // address through the scratch register instead.
                    let reg = self.materialize(addr as i64)?;
                    Ok(MemoryOperand::with_base_displ(self.gpw(reg), 0))
                }
            },
        }
    }

    // ---- labels ----

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: Label) {
        debug_assert!(self.labels[label.0].is_none(), "label bound twice");
        let target = self.bytes.len();
        self.labels[label.0] = Some(target);
        // A bound label is a join point; whatever jumped here made no
        // promises about the scratch register.
        self.invalidate_scratch();
        let mut i = 0;
        while i < self.fixups.len() {
            if self.fixups[i].1 == label.0 {
                let (at, _) = self.fixups.swap_remove(i);
                let rel = target as i64 - (at as i64 + 4);
                self.patch_i32(at, rel as i32);
            } else {
                i += 1;
            }
        }
    }

    pub fn label_offset(&self, label: Label) -> Option<usize> {
        self.labels[label.0]
    }

    fn patch_i32(&mut self, at: usize, value: i32) {
        self.bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Patch a previously emitted 32-bit immediate field in the staging
    /// buffer; used by the stack-check prologue once the final frame depth is
    /// known.
    pub fn patch_imm32(&mut self, at: usize, value: i32) {
        self.patch_i32(at, value);
    }

    fn branch(&mut self, code: Code, label: Label) -> CompileResult<usize> {
        let target = self.labels[label.0];
        let placeholder = self.bytes.len() as u64;
        let insn = Instruction::with_branch(code, target.map_or(placeholder, |t| t as u64))
            .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        let start = self.emit(insn)?;
        if target.is_none() {
            self.fixups.push((self.bytes.len() - 4, label.0));
        }
        Ok(start)
    }

    // ---- constant table ----

    /// Intern a word in the unit's read-only constant table.
    pub fn const_slot(&mut self, value: u64) -> u32 {
        if let Some(i) = self.consts.iter().position(|&c| c == value) {
            return i as u32;
        }
        self.consts.push(value);
        (self.consts.len() - 1) as u32
    }

    /// Intern an even-aligned pair; 16-byte operands (sign masks) need it.
    pub fn const_pair(&mut self, lo: u64, hi: u64) -> u32 {
        for i in (0..self.consts.len().saturating_sub(1)).step_by(2) {
            if self.consts[i] == lo && self.consts[i + 1] == hi {
                return i as u32;
            }
        }
        if self.consts.len() % 2 != 0 {
            self.consts.push(0);
        }
        let index = self.consts.len() as u32;
        self.consts.push(lo);
        self.consts.push(hi);
        index
    }

    /// Memory operand addressing a constant-table entry: rip-relative on the
    /// 64-bit variant, an absolute disp32 relocation on the 32-bit one. The
    /// displacement field is patched after the fact either way.
    fn const_mem(&self) -> MemoryOperand {
        match self.width {
            WordWidth::W64 => MemoryOperand::with_base_displ(Register::RIP, 0),
            WordWidth::W32 => MemoryOperand::with_displ(0, 4),
        }
    }

    fn note_const_use(&mut self, index: u32) {
        let at = self.bytes.len() - 4;
        match self.width {
            WordWidth::W64 => self.const_fixups.push((at, index)),
            WordWidth::W32 => self.relocs.push(Reloc::ConstAbs32 { at, index }),
        }
    }

    // ---- word moves ----

    pub fn mov_rr(&mut self, dst: AsmReg, src: AsmReg) -> CompileResult<()> {
        let insn = self.build2r(self.w(Code::Mov_r64_rm64, Code::Mov_r32_rm32), self.gpw(dst), self.gpw(src))?;
        self.emit(insn)?;
        self.wrote(dst);
        Ok(())
    }

    pub fn mov_ri(&mut self, dst: AsmReg, imm: i64) -> CompileResult<()> {
        let insn = match self.width {
            WordWidth::W32 => Instruction::with2(Code::Mov_r32_imm32, self.gpw(dst), imm as i32),
            WordWidth::W64 => {
                if let Ok(v) = i32::try_from(imm) {
                    Instruction::with2(Code::Mov_rm64_imm32, self.gpw(dst), v)
                } else if let Ok(v) = u32::try_from(imm as u64) {
                    // Writing the low half zero-extends; four bytes shorter.
                    Instruction::with2(Code::Mov_r32_imm32, GP32[dst.id as usize], v as i32)
                } else {
                    Instruction::with2(Code::Mov_r64_imm64, self.gpw(dst), imm)
                }
            }
        }
        .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        self.emit(insn)?;
        self.wrote(dst);
        Ok(())
    }

    pub fn load(&mut self, dst: AsmReg, mem: Mem) -> CompileResult<()> {
        let m = self.mem_op(mem)?;
        let insn = Instruction::with2(self.w(Code::Mov_r64_rm64, Code::Mov_r32_rm32), self.gpw(dst), m)
            .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        self.emit(insn)?;
        self.wrote(dst);
        Ok(())
    }

    pub fn store(&mut self, mem: Mem, src: AsmReg) -> CompileResult<()> {
        let m = self.mem_op(mem)?;
        let insn = Instruction::with2(self.w(Code::Mov_rm64_r64, Code::Mov_rm32_r32), m, self.gpw(src))
            .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        self.emit(insn)?;
        Ok(())
    }

    /// Word-sized store of a sign-extended 32-bit immediate.
    pub fn store_imm(&mut self, mem: Mem, imm: i32) -> CompileResult<()> {
        let m = self.mem_op(mem)?;
        let insn = Instruction::with2(self.w(Code::Mov_rm64_imm32, Code::Mov_rm32_imm32), m, imm)
            .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        self.emit(insn)?;
        Ok(())
    }

    pub fn lea(&mut self, dst: AsmReg, mem: Mem) -> CompileResult<()> {
        let m = self.mem_op(mem)?;
        let insn = Instruction::with2(self.w(Code::Lea_r64_m, Code::Lea_r32_m), self.gpw(dst), m)
            .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        self.emit(insn)?;
        self.wrote(dst);
        Ok(())
    }

    // ---- sized field access ----

    pub fn load_sized(&mut self, dst: AsmReg, mem: Mem, size: u8, signed: bool) -> CompileResult<()> {
        let m = self.mem_op(mem)?;
        let code = match (self.width, size, signed) {
            (_, 1, false) => self.w(Code::Movzx_r64_rm8, Code::Movzx_r32_rm8),
            (_, 1, true) => self.w(Code::Movsx_r64_rm8, Code::Movsx_r32_rm8),
            (_, 2, false) => self.w(Code::Movzx_r64_rm16, Code::Movzx_r32_rm16),
            (_, 2, true) => self.w(Code::Movsx_r64_rm16, Code::Movsx_r32_rm16),
            (WordWidth::W64, 4, false) => Code::Mov_r32_rm32,
            (WordWidth::W64, 4, true) => Code::Movsxd_r64_rm32,
            (WordWidth::W64, 8, _) => Code::Mov_r64_rm64,
            (WordWidth::W32, 4, _) => Code::Mov_r32_rm32,
            _ => {
                return Err(CompileError::not_implemented(format!(
                    "{}-byte load on {:?}",
                    size, self.width
                )))
            }
        };
        let dst_reg = if code == Code::Mov_r32_rm32 {
            GP32[dst.id as usize]
        } else {
            self.gpw(dst)
        };
        let insn = Instruction::with2(code, dst_reg, m)
            .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        self.emit(insn)?;
        self.wrote(dst);
        Ok(())
    }

    pub fn store_sized(&mut self, mem: Mem, src: AsmReg, size: u8) -> CompileResult<()> {
        let m = self.mem_op(mem)?;
        let insn = match (self.width, size) {
            (_, 1) => Instruction::with2(Code::Mov_rm8_r8, m, self.gp8(src)),
            (_, 2) => Instruction::with2(Code::Mov_rm16_r16, m, GP16[src.id as usize]),
            (_, 4) => Instruction::with2(Code::Mov_rm32_r32, m, GP32[src.id as usize]),
            (WordWidth::W64, 8) => Instruction::with2(Code::Mov_rm64_r64, m, GP64[src.id as usize]),
            _ => {
                return Err(CompileError::not_implemented(format!(
                    "{}-byte store on {:?}",
                    size, self.width
                )))
            }
        }
        .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        self.emit(insn)?;
        Ok(())
    }

    // ---- integer arithmetic ----

    fn alu_rr(&mut self, w64: Code, w32: Code, dst: AsmReg, src: AsmReg) -> CompileResult<()> {
        let insn = self.build2r(self.w(w64, w32), self.gpw(dst), self.gpw(src))?;
        self.emit(insn)?;
        self.wrote(dst);
        Ok(())
    }

    fn alu_ri(&mut self, w64: Code, w32: Code, dst: AsmReg, imm: i32) -> CompileResult<()> {
        let insn = Instruction::with2(self.w(w64, w32), self.gpw(dst), imm)
            .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        self.emit(insn)?;
        self.wrote(dst);
        Ok(())
    }

    fn alu_rm(&mut self, w64: Code, w32: Code, dst: AsmReg, mem: Mem) -> CompileResult<()> {
        let m = self.mem_op(mem)?;
        let insn = Instruction::with2(self.w(w64, w32), self.gpw(dst), m)
            .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        self.emit(insn)?;
        self.wrote(dst);
        Ok(())
    }

    pub fn add_rr(&mut self, dst: AsmReg, src: AsmReg) -> CompileResult<()> {
        self.alu_rr(Code::Add_r64_rm64, Code::Add_r32_rm32, dst, src)
    }
    pub fn add_ri(&mut self, dst: AsmReg, imm: i32) -> CompileResult<()> {
        self.alu_ri(Code::Add_rm64_imm32, Code::Add_rm32_imm32, dst, imm)
    }
    pub fn add_rm(&mut self, dst: AsmReg, mem: Mem) -> CompileResult<()> {
        self.alu_rm(Code::Add_r64_rm64, Code::Add_r32_rm32, dst, mem)
    }

    pub fn sub_rr(&mut self, dst: AsmReg, src: AsmReg) -> CompileResult<()> {
        self.alu_rr(Code::Sub_r64_rm64, Code::Sub_r32_rm32, dst, src)
    }
    pub fn sub_ri(&mut self, dst: AsmReg, imm: i32) -> CompileResult<()> {
        self.alu_ri(Code::Sub_rm64_imm32, Code::Sub_rm32_imm32, dst, imm)
    }
    pub fn sub_rm(&mut self, dst: AsmReg, mem: Mem) -> CompileResult<()> {
        self.alu_rm(Code::Sub_r64_rm64, Code::Sub_r32_rm32, dst, mem)
    }

    pub fn and_rr(&mut self, dst: AsmReg, src: AsmReg) -> CompileResult<()> {
        self.alu_rr(Code::And_r64_rm64, Code::And_r32_rm32, dst, src)
    }
    pub fn and_ri(&mut self, dst: AsmReg, imm: i32) -> CompileResult<()> {
        self.alu_ri(Code::And_rm64_imm32, Code::And_rm32_imm32, dst, imm)
    }
    pub fn and_rm(&mut self, dst: AsmReg, mem: Mem) -> CompileResult<()> {
        self.alu_rm(Code::And_r64_rm64, Code::And_r32_rm32, dst, mem)
    }

    pub fn or_rr(&mut self, dst: AsmReg, src: AsmReg) -> CompileResult<()> {
        self.alu_rr(Code::Or_r64_rm64, Code::Or_r32_rm32, dst, src)
    }
    pub fn or_ri(&mut self, dst: AsmReg, imm: i32) -> CompileResult<()> {
        self.alu_ri(Code::Or_rm64_imm32, Code::Or_rm32_imm32, dst, imm)
    }
    pub fn or_rm(&mut self, dst: AsmReg, mem: Mem) -> CompileResult<()> {
        self.alu_rm(Code::Or_r64_rm64, Code::Or_r32_rm32, dst, mem)
    }

    pub fn xor_rr(&mut self, dst: AsmReg, src: AsmReg) -> CompileResult<()> {
        self.alu_rr(Code::Xor_r64_rm64, Code::Xor_r32_rm32, dst, src)
    }
    pub fn xor_ri(&mut self, dst: AsmReg, imm: i32) -> CompileResult<()> {
        self.alu_ri(Code::Xor_rm64_imm32, Code::Xor_rm32_imm32, dst, imm)
    }
    pub fn xor_rm(&mut self, dst: AsmReg, mem: Mem) -> CompileResult<()> {
        self.alu_rm(Code::Xor_r64_rm64, Code::Xor_r32_rm32, dst, mem)
    }

    pub fn imul_rr(&mut self, dst: AsmReg, src: AsmReg) -> CompileResult<()> {
        self.alu_rr(Code::Imul_r64_rm64, Code::Imul_r32_rm32, dst, src)
    }
    pub fn imul_rm(&mut self, dst: AsmReg, mem: Mem) -> CompileResult<()> {
        self.alu_rm(Code::Imul_r64_rm64, Code::Imul_r32_rm32, dst, mem)
    }
    /// Three-operand form: `dst = src * imm`.
    pub fn imul_rri(&mut self, dst: AsmReg, src: AsmReg, imm: i32) -> CompileResult<()> {
        let insn = Instruction::with3(
            self.w(Code::Imul_r64_rm64_imm32, Code::Imul_r32_rm32_imm32),
            self.gpw(dst),
            self.gpw(src),
            imm,
        )
        .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        self.emit(insn)?;
        self.wrote(dst);
        Ok(())
    }

    pub fn neg(&mut self, dst: AsmReg) -> CompileResult<()> {
        let insn = Instruction::with1(self.w(Code::Neg_rm64, Code::Neg_rm32), self.gpw(dst))
            .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        self.emit(insn)?;
        self.wrote(dst);
        Ok(())
    }

    pub fn not(&mut self, dst: AsmReg) -> CompileResult<()> {
        let insn = Instruction::with1(self.w(Code::Not_rm64, Code::Not_rm32), self.gpw(dst))
            .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        self.emit(insn)?;
        self.wrote(dst);
        Ok(())
    }

    // ---- shifts ----

    fn shift_ri(&mut self, w64: Code, w32: Code, dst: AsmReg, count: u8) -> CompileResult<()> {
        let insn = Instruction::with2(self.w(w64, w32), self.gpw(dst), count as i32)
            .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        self.emit(insn)?;
        self.wrote(dst);
        Ok(())
    }

    fn shift_cl(&mut self, w64: Code, w32: Code, dst: AsmReg) -> CompileResult<()> {
        let insn = Instruction::with2(self.w(w64, w32), self.gpw(dst), Register::CL)
            .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        self.emit(insn)?;
        self.wrote(dst);
        Ok(())
    }

    pub fn shl_ri(&mut self, dst: AsmReg, count: u8) -> CompileResult<()> {
        self.shift_ri(Code::Shl_rm64_imm8, Code::Shl_rm32_imm8, dst, count)
    }
    pub fn shl_cl(&mut self, dst: AsmReg) -> CompileResult<()> {
        self.shift_cl(Code::Shl_rm64_CL, Code::Shl_rm32_CL, dst)
    }
    pub fn sar_ri(&mut self, dst: AsmReg, count: u8) -> CompileResult<()> {
        self.shift_ri(Code::Sar_rm64_imm8, Code::Sar_rm32_imm8, dst, count)
    }
    pub fn sar_cl(&mut self, dst: AsmReg) -> CompileResult<()> {
        self.shift_cl(Code::Sar_rm64_CL, Code::Sar_rm32_CL, dst)
    }
    pub fn shr_ri(&mut self, dst: AsmReg, count: u8) -> CompileResult<()> {
        self.shift_ri(Code::Shr_rm64_imm8, Code::Shr_rm32_imm8, dst, count)
    }
    pub fn shr_cl(&mut self, dst: AsmReg) -> CompileResult<()> {
        self.shift_cl(Code::Shr_rm64_CL, Code::Shr_rm32_CL, dst)
    }

    // ---- compare/test ----

    pub fn cmp_rr(&mut self, a: AsmReg, b: AsmReg) -> CompileResult<()> {
        let insn = self.build2r(self.w(Code::Cmp_r64_rm64, Code::Cmp_r32_rm32), self.gpw(a), self.gpw(b))?;
        self.emit(insn)?;
        Ok(())
    }

    pub fn cmp_ri(&mut self, a: AsmReg, imm: i32) -> CompileResult<()> {
        let insn = Instruction::with2(self.w(Code::Cmp_rm64_imm32, Code::Cmp_rm32_imm32), self.gpw(a), imm)
            .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        self.emit(insn)?;
        Ok(())
    }

    pub fn cmp_rm(&mut self, a: AsmReg, mem: Mem) -> CompileResult<()> {
        let m = self.mem_op(mem)?;
        let insn = Instruction::with2(self.w(Code::Cmp_r64_rm64, Code::Cmp_r32_rm32), self.gpw(a), m)
            .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        self.emit(insn)?;
        Ok(())
    }

    /// Compare a memory word with an immediate; returns the offset of the
    /// imm32 field for later patching.
    pub fn cmp_mi(&mut self, mem: Mem, imm: i32) -> CompileResult<usize> {
        let m = self.mem_op(mem)?;
        let insn = Instruction::with2(self.w(Code::Cmp_rm64_imm32, Code::Cmp_rm32_imm32), m, imm)
            .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        self.emit(insn)?;
        Ok(self.bytes.len() - 4)
    }

    pub fn test_rr(&mut self, a: AsmReg, b: AsmReg) -> CompileResult<()> {
        let insn = self.build2r(self.w(Code::Test_rm64_r64, Code::Test_rm32_r32), self.gpw(a), self.gpw(b))?;
        self.emit(insn)?;
        Ok(())
    }

    /// `test byte [mem], imm8`: the write-barrier status check.
    pub fn test_mi8(&mut self, mem: Mem, imm: u8) -> CompileResult<()> {
        let m = self.mem_op(mem)?;
        let insn = Instruction::with2(Code::Test_rm8_imm8, m, imm as i32)
            .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        self.emit(insn)?;
        Ok(())
    }

    pub fn setcc(&mut self, cond: Cond, dst: AsmReg) -> CompileResult<()> {
        let code = match cond {
            Cond::E => Code::Sete_rm8,
            Cond::Ne => Code::Setne_rm8,
            Cond::L => Code::Setl_rm8,
            Cond::Le => Code::Setle_rm8,
            Cond::G => Code::Setg_rm8,
            Cond::Ge => Code::Setge_rm8,
            Cond::B => Code::Setb_rm8,
            Cond::Be => Code::Setbe_rm8,
            Cond::A => Code::Seta_rm8,
            Cond::Ae => Code::Setae_rm8,
            Cond::P => Code::Setp_rm8,
            Cond::Np => Code::Setnp_rm8,
        };
        let insn = Instruction::with1(code, self.gp8(dst))
            .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        self.emit(insn)?;
        self.wrote(dst);
        Ok(())
    }

    /// Zero-extend the low byte in place; pairs with `setcc`.
    pub fn movzx8(&mut self, dst: AsmReg) -> CompileResult<()> {
        let insn = Instruction::with2(
            self.w(Code::Movzx_r64_rm8, Code::Movzx_r32_rm8),
            self.gpw(dst),
            self.gp8(dst),
        )
        .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        self.emit(insn)?;
        self.wrote(dst);
        Ok(())
    }

    // ---- stack ----

    pub fn push_r(&mut self, reg: AsmReg) -> CompileResult<()> {
        let insn = Instruction::with1(self.w(Code::Push_r64, Code::Push_r32), self.gpw(reg))
            .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        self.emit(insn)?;
        Ok(())
    }

    pub fn pop_r(&mut self, reg: AsmReg) -> CompileResult<()> {
        let insn = Instruction::with1(self.w(Code::Pop_r64, Code::Pop_r32), self.gpw(reg))
            .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        self.emit(insn)?;
        self.wrote(reg);
        Ok(())
    }

    pub fn push_m(&mut self, mem: Mem) -> CompileResult<()> {
        let m = self.mem_op(mem)?;
        let insn = Instruction::with1(self.w(Code::Push_rm64, Code::Push_rm32), m)
            .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        self.emit(insn)?;
        Ok(())
    }

    pub fn pop_m(&mut self, mem: Mem) -> CompileResult<()> {
        let m = self.mem_op(mem)?;
        let insn = Instruction::with1(self.w(Code::Pop_rm64, Code::Pop_rm32), m)
            .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        self.emit(insn)?;
        Ok(())
    }

    pub fn xchg_rr(&mut self, a: AsmReg, b: AsmReg) -> CompileResult<()> {
        let insn = self.build2r(self.w(Code::Xchg_rm64_r64, Code::Xchg_rm32_r32), self.gpw(a), self.gpw(b))?;
        self.emit(insn)?;
        self.wrote(a);
        self.wrote(b);
        Ok(())
    }

    // ---- control flow ----

    /// Unconditional jump, always rel32. Returns the instruction offset.
    pub fn jmp(&mut self, label: Label) -> CompileResult<usize> {
        self.branch(self.w(Code::Jmp_rel32_64, Code::Jmp_rel32_32), label)
    }

    /// Conditional jump, always rel32 so the site doubles as its own patch
    /// window. Returns the instruction offset.
    pub fn jcc(&mut self, cond: Cond, label: Label) -> CompileResult<usize> {
        let code = match (self.width, cond) {
            (WordWidth::W64, Cond::E) => Code::Je_rel32_64,
            (WordWidth::W64, Cond::Ne) => Code::Jne_rel32_64,
            (WordWidth::W64, Cond::L) => Code::Jl_rel32_64,
            (WordWidth::W64, Cond::Le) => Code::Jle_rel32_64,
            (WordWidth::W64, Cond::G) => Code::Jg_rel32_64,
            (WordWidth::W64, Cond::Ge) => Code::Jge_rel32_64,
            (WordWidth::W64, Cond::B) => Code::Jb_rel32_64,
            (WordWidth::W64, Cond::Be) => Code::Jbe_rel32_64,
            (WordWidth::W64, Cond::A) => Code::Ja_rel32_64,
            (WordWidth::W64, Cond::Ae) => Code::Jae_rel32_64,
            (WordWidth::W64, Cond::P) => Code::Jp_rel32_64,
            (WordWidth::W64, Cond::Np) => Code::Jnp_rel32_64,
            (WordWidth::W32, Cond::E) => Code::Je_rel32_32,
            (WordWidth::W32, Cond::Ne) => Code::Jne_rel32_32,
            (WordWidth::W32, Cond::L) => Code::Jl_rel32_32,
            (WordWidth::W32, Cond::Le) => Code::Jle_rel32_32,
            (WordWidth::W32, Cond::G) => Code::Jg_rel32_32,
            (WordWidth::W32, Cond::Ge) => Code::Jge_rel32_32,
            (WordWidth::W32, Cond::B) => Code::Jb_rel32_32,
            (WordWidth::W32, Cond::Be) => Code::Jbe_rel32_32,
            (WordWidth::W32, Cond::A) => Code::Ja_rel32_32,
            (WordWidth::W32, Cond::Ae) => Code::Jae_rel32_32,
            (WordWidth::W32, Cond::P) => Code::Jp_rel32_32,
            (WordWidth::W32, Cond::Np) => Code::Jnp_rel32_32,
        };
        self.branch(code, label)
    }

    pub fn jmp_reg(&mut self, reg: AsmReg) -> CompileResult<()> {
        let insn = Instruction::with1(self.w(Code::Jmp_rm64, Code::Jmp_rm32), self.gpw(reg))
            .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        self.emit(insn)?;
        Ok(())
    }

    pub fn call_reg(&mut self, reg: AsmReg) -> CompileResult<()> {
        let insn = Instruction::with1(self.w(Code::Call_rm64, Code::Call_rm32), self.gpw(reg))
            .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        self.emit(insn)?;
        // The callee owes us nothing about the scratch register.
        self.invalidate_scratch();
        Ok(())
    }

    /// Call an absolute target: through the scratch register on the 64-bit
    /// variant, through a rel32 relocation on the 32-bit one.
    pub fn call_abs(&mut self, target: u64) -> CompileResult<()> {
        match self.width {
            WordWidth::W64 => {
                let reg = self.materialize(target as i64)?;
                self.call_reg(reg)
            }
            WordWidth::W32 => {
                let insn = Instruction::with_branch(Code::Call_rel32_32, self.bytes.len() as u64)
                    .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
                self.emit(insn)?;
                self.relocs.push(Reloc::Rel32 { at: self.bytes.len() - 4, target });
                self.invalidate_scratch();
                Ok(())
            }
        }
    }

    /// Jump to an absolute target in another unit, reusing the current frame.
    pub fn jmp_abs(&mut self, target: u64) -> CompileResult<()> {
        match self.width {
            WordWidth::W64 => {
                let reg = self.materialize(target as i64)?;
                self.jmp_reg(reg)
            }
            WordWidth::W32 => {
                let insn = Instruction::with_branch(Code::Jmp_rel32_32, self.bytes.len() as u64)
                    .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
                self.emit(insn)?;
                self.relocs.push(Reloc::Rel32 { at: self.bytes.len() - 4, target });
                Ok(())
            }
        }
    }

    pub fn ret(&mut self) -> CompileResult<()> {
        let insn = Instruction::with(self.w(Code::Retnq, Code::Retnd));
        self.emit(insn)?;
        Ok(())
    }

    pub fn int3(&mut self) -> CompileResult<()> {
        self.emit(Instruction::with(Code::Int3))?;
        Ok(())
    }

    pub fn nops(&mut self, count: usize) {
        self.bytes.extend(std::iter::repeat(0x90).take(count));
    }

    // ---- atomics ----

    /// `lock cmpxchg [mem], src` on the word width: the lock-word
    /// reacquisition step. The expected value travels in rax/eax per the ISA.
    pub fn cmpxchg_lock(&mut self, mem: Mem, src: AsmReg) -> CompileResult<()> {
        let m = self.mem_op(mem)?;
        let mut insn = Instruction::with2(
            self.w(Code::Cmpxchg_rm64_r64, Code::Cmpxchg_rm32_r32),
            m,
            self.gpw(src),
        )
        .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        insn.set_has_lock_prefix(true);
        self.emit(insn)?;
        Ok(())
    }

    /// `bts [mem], reg`: set one card bit.
    pub fn bts(&mut self, mem: Mem, bit: AsmReg) -> CompileResult<()> {
        let m = self.mem_op(mem)?;
        let insn = Instruction::with2(self.w(Code::Bts_rm64_r64, Code::Bts_rm32_r32), m, self.gpw(bit))
            .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        self.emit(insn)?;
        Ok(())
    }

    // ---- floating point ----

    fn sse_rr(&mut self, code: Code, dst: AsmReg, src: AsmReg) -> CompileResult<()> {
        let insn = self.build2r(code, self.xmm(dst), self.xmm(src))?;
        self.emit(insn)?;
        Ok(())
    }

    fn sse_rm(&mut self, code: Code, dst: AsmReg, mem: Mem) -> CompileResult<()> {
        let m = self.mem_op(mem)?;
        let insn = Instruction::with2(code, self.xmm(dst), m)
            .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        self.emit(insn)?;
        Ok(())
    }

    pub fn movsd_rr(&mut self, dst: AsmReg, src: AsmReg) -> CompileResult<()> {
        self.sse_rr(Code::Movsd_xmm_xmmm64, dst, src)
    }

    pub fn movsd_load(&mut self, dst: AsmReg, mem: Mem) -> CompileResult<()> {
        self.sse_rm(Code::Movsd_xmm_xmmm64, dst, mem)
    }

    pub fn movsd_store(&mut self, mem: Mem, src: AsmReg) -> CompileResult<()> {
        let m = self.mem_op(mem)?;
        let insn = Instruction::with2(Code::Movsd_xmmm64_xmm, m, self.xmm(src))
            .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        self.emit(insn)?;
        Ok(())
    }

    /// Load a float constant from the unit's constant table.
    pub fn movsd_const(&mut self, dst: AsmReg, value: f64) -> CompileResult<()> {
        let index = self.const_slot(value.to_bits());
        let m = self.const_mem();
        let insn = Instruction::with2(Code::Movsd_xmm_xmmm64, self.xmm(dst), m)
            .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        self.emit(insn)?;
        self.note_const_use(index);
        Ok(())
    }

    pub fn addsd(&mut self, dst: AsmReg, src: AsmReg) -> CompileResult<()> {
        self.sse_rr(Code::Addsd_xmm_xmmm64, dst, src)
    }
    pub fn addsd_m(&mut self, dst: AsmReg, mem: Mem) -> CompileResult<()> {
        self.sse_rm(Code::Addsd_xmm_xmmm64, dst, mem)
    }
    pub fn subsd(&mut self, dst: AsmReg, src: AsmReg) -> CompileResult<()> {
        self.sse_rr(Code::Subsd_xmm_xmmm64, dst, src)
    }
    pub fn subsd_m(&mut self, dst: AsmReg, mem: Mem) -> CompileResult<()> {
        self.sse_rm(Code::Subsd_xmm_xmmm64, dst, mem)
    }
    pub fn mulsd(&mut self, dst: AsmReg, src: AsmReg) -> CompileResult<()> {
        self.sse_rr(Code::Mulsd_xmm_xmmm64, dst, src)
    }
    pub fn mulsd_m(&mut self, dst: AsmReg, mem: Mem) -> CompileResult<()> {
        self.sse_rm(Code::Mulsd_xmm_xmmm64, dst, mem)
    }
    pub fn divsd(&mut self, dst: AsmReg, src: AsmReg) -> CompileResult<()> {
        self.sse_rr(Code::Divsd_xmm_xmmm64, dst, src)
    }
    pub fn divsd_m(&mut self, dst: AsmReg, mem: Mem) -> CompileResult<()> {
        self.sse_rm(Code::Divsd_xmm_xmmm64, dst, mem)
    }

    pub fn ucomisd(&mut self, a: AsmReg, b: AsmReg) -> CompileResult<()> {
        self.sse_rr(Code::Ucomisd_xmm_xmmm64, a, b)
    }

    /// xor with a 16-byte mask from the constant table; float negation.
    pub fn xorpd_mask(&mut self, dst: AsmReg, lo: u64, hi: u64) -> CompileResult<()> {
        let index = self.const_pair(lo, hi);
        let m = self.const_mem();
        let insn = Instruction::with2(Code::Xorpd_xmm_xmmm128, self.xmm(dst), m)
            .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        self.emit(insn)?;
        self.note_const_use(index);
        Ok(())
    }

    /// and with a 16-byte mask from the constant table; float absolute value.
    pub fn andpd_mask(&mut self, dst: AsmReg, lo: u64, hi: u64) -> CompileResult<()> {
        let index = self.const_pair(lo, hi);
        let m = self.const_mem();
        let insn = Instruction::with2(Code::Andpd_xmm_xmmm128, self.xmm(dst), m)
            .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        self.emit(insn)?;
        self.note_const_use(index);
        Ok(())
    }

    pub fn cvttsd2si(&mut self, dst: AsmReg, src: AsmReg) -> CompileResult<()> {
        let insn = self.build2r(
            self.w(Code::Cvttsd2si_r64_xmmm64, Code::Cvttsd2si_r32_xmmm64),
            self.gpw(dst),
            self.xmm(src),
        )?;
        self.emit(insn)?;
        self.wrote(dst);
        Ok(())
    }

    pub fn cvtsi2sd(&mut self, dst: AsmReg, src: AsmReg) -> CompileResult<()> {
        let insn = self.build2r(
            self.w(Code::Cvtsi2sd_xmm_rm64, Code::Cvtsi2sd_xmm_rm32),
            self.xmm(dst),
            self.gpw(src),
        )?;
        self.emit(insn)?;
        Ok(())
    }

    /// Pop the x87 top-of-stack into memory; how float results of native
    /// calls come back on the 32-bit convention.
    pub fn fstp(&mut self, mem: Mem) -> CompileResult<()> {
        let m = self.mem_op(mem)?;
        let insn = Instruction::with1(Code::Fstp_m64fp, m)
            .map_err(|e| CompileError::Encoding { reason: e.to_string() })?;
        self.emit(insn)?;
        Ok(())
    }

    // ---- finish ----

    /// Close the buffer: resolve rip-relative constant references against the
    /// final [table | code] layout and hand everything to the front door.
    /// All labels must be bound by now.
    pub fn finish(mut self) -> CodeArtifact {
        assert!(self.fixups.is_empty(), "unbound label at finish");
        let table_bytes = (self.consts.len() * 8 + 15) & !15;
        for &(at, index) in &self.const_fixups {
            // rip-relative: target and rip move together when the buffer is
            // copied, so this patch is final.
            let disp = index as i64 * 8 - (table_bytes as i64 + at as i64 + 4);
            let bytes = (disp as i32).to_le_bytes();
            self.bytes[at..at + 4].copy_from_slice(&bytes);
        }
        CodeArtifact {
            width: self.width,
            consts: self.consts,
            code: self.bytes,
            table_bytes,
            relocs: self.relocs,
        }
    }
}
