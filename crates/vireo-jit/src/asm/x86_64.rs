//! x86-64 assembler facade
//!
//! Typed emit operations over a `CodeBlock`. Only the subset of the
//! instruction set the code generators use is implemented: 64-bit moves,
//! ALU group-1 operations, test/not, pushes and pops, calls, conditional
//! and unconditional jumps (label, pointer and register forms), cmov, and
//! the locked add used for ractor-safe counters.
//!
//! Everything is 64-bit operand size; immediate forms pick the imm8
//! encoding when the value fits.

use super::{CodeBlock, CodePtr, Label};

/// General-purpose registers, numbered per the hardware encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    fn num(self) -> u8 {
        self as u8
    }

    fn low(self) -> u8 {
        self.num() & 7
    }

    fn msb(self) -> u8 {
        self.num() >> 3
    }
}

/// A base+displacement memory operand (64-bit access).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mem {
    pub base: Reg,
    pub disp: i32,
}

/// Build a memory operand.
pub const fn mem(base: Reg, disp: i32) -> Mem {
    Mem { base, disp }
}

/// Instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opnd {
    Reg(Reg),
    Mem(Mem),
    Imm(i64),
}

impl From<Reg> for Opnd {
    fn from(r: Reg) -> Opnd {
        Opnd::Reg(r)
    }
}

impl From<Mem> for Opnd {
    fn from(m: Mem) -> Opnd {
        Opnd::Mem(m)
    }
}

/// Condition codes for `jcc`/`cmovcc`, numbered per the hardware encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    L = 0xc,
    Ge = 0xd,
    Le = 0xe,
    G = 0xf,
}

impl Cond {
    /// The negated condition: flips the low bit of the encoding.
    pub fn invert(self) -> Cond {
        match self {
            Cond::O => Cond::No,
            Cond::No => Cond::O,
            Cond::B => Cond::Ae,
            Cond::Ae => Cond::B,
            Cond::E => Cond::Ne,
            Cond::Ne => Cond::E,
            Cond::Be => Cond::A,
            Cond::A => Cond::Be,
            Cond::S => Cond::Ns,
            Cond::Ns => Cond::S,
            Cond::L => Cond::Ge,
            Cond::Ge => Cond::L,
            Cond::Le => Cond::G,
            Cond::G => Cond::Le,
        }
    }
}

fn fits_i8(val: i64) -> bool {
    val >= i8::MIN as i64 && val <= i8::MAX as i64
}

fn fits_i32(val: i64) -> bool {
    val >= i32::MIN as i64 && val <= i32::MAX as i64
}

impl CodeBlock {
    fn rex(&mut self, w: bool, reg: u8, base: u8) {
        let byte = 0x40 | (w as u8) << 3 | (reg >> 3) << 2 | (base >> 3);
        if byte != 0x40 {
            self.write_byte(byte);
        }
    }

    fn rex_w(&mut self, reg: Reg, base: Reg) {
        self.rex(true, reg.num(), base.num());
    }

    /// ModRM (+SIB, +disp) for a register-direct rm field.
    fn modrm_reg(&mut self, reg_field: u8, rm: Reg) {
        self.write_byte(0xc0 | (reg_field & 7) << 3 | rm.low());
    }

    /// ModRM (+SIB, +disp) for a memory rm field.
    fn modrm_mem(&mut self, reg_field: u8, m: Mem) {
        let base_low = m.base.low();
        let need_sib = base_low == 4; // rsp/r12 addressing goes through SIB
        let rm = if need_sib { 4 } else { base_low };

        // rbp/r13 have no disp-less form
        let (md, disp_bytes) = if m.disp == 0 && base_low != 5 {
            (0u8, 0)
        } else if fits_i8(m.disp as i64) {
            (1u8, 1)
        } else {
            (2u8, 4)
        };

        self.write_byte(md << 6 | (reg_field & 7) << 3 | rm);
        if need_sib {
            self.write_byte(0x20 | base_low);
        }
        match disp_bytes {
            0 => {}
            1 => self.write_byte(m.disp as u8),
            _ => self.write_i32(m.disp),
        }
    }

    /// `mov` between registers, memory and immediates. Immediate sources use
    /// the sign-extended imm32 form; use [`CodeBlock::mov_u64`] for values
    /// that need all 64 bits.
    pub fn mov(&mut self, dst: Opnd, src: Opnd) {
        match (dst, src) {
            (Opnd::Reg(d), Opnd::Reg(s)) => {
                self.rex_w(s, d);
                self.write_byte(0x89);
                self.modrm_reg(s.num(), d);
            }
            (Opnd::Reg(d), Opnd::Mem(m)) => {
                self.rex_w(d, m.base);
                self.write_byte(0x8b);
                self.modrm_mem(d.num(), m);
            }
            (Opnd::Mem(m), Opnd::Reg(s)) => {
                self.rex_w(s, m.base);
                self.write_byte(0x89);
                self.modrm_mem(s.num(), m);
            }
            (Opnd::Reg(d), Opnd::Imm(val)) => {
                if fits_i32(val) {
                    self.rex_w(Reg::Rax, d);
                    self.write_byte(0xc7);
                    self.modrm_reg(0, d);
                    self.write_i32(val as i32);
                } else {
                    self.mov_u64(d, val as u64);
                }
            }
            (Opnd::Mem(m), Opnd::Imm(val)) => {
                assert!(fits_i32(val), "64-bit store immediate");
                self.rex_w(Reg::Rax, m.base);
                self.write_byte(0xc7);
                self.modrm_mem(0, m);
                self.write_i32(val as i32);
            }
            _ => panic!("unsupported mov operands: {:?} <- {:?}", dst, src),
        }
    }

    /// `mov r64, imm64` in the full 10-byte form, returning the offset of
    /// the immediate so embedded pointers can be recorded for the GC.
    pub fn mov_u64(&mut self, dst: Reg, val: u64) -> usize {
        self.rex_w(Reg::Rax, dst);
        self.write_byte(0xb8 | dst.low());
        let imm_pos = self.write_pos();
        self.write_u64(val);
        imm_pos
    }

    pub fn lea(&mut self, dst: Reg, m: Mem) {
        self.rex_w(dst, m.base);
        self.write_byte(0x8d);
        self.modrm_mem(dst.num(), m);
    }

    /// Group-1 ALU operation: opcode pair for the mr/rm forms plus the
    /// opcode-extension for immediate forms.
    fn alu(&mut self, op_mr: u8, op_rm: u8, ext: u8, dst: Opnd, src: Opnd) {
        match (dst, src) {
            (Opnd::Reg(d), Opnd::Reg(s)) => {
                self.rex_w(s, d);
                self.write_byte(op_mr);
                self.modrm_reg(s.num(), d);
            }
            (Opnd::Reg(d), Opnd::Mem(m)) => {
                self.rex_w(d, m.base);
                self.write_byte(op_rm);
                self.modrm_mem(d.num(), m);
            }
            (Opnd::Mem(m), Opnd::Reg(s)) => {
                self.rex_w(s, m.base);
                self.write_byte(op_mr);
                self.modrm_mem(s.num(), m);
            }
            (Opnd::Reg(d), Opnd::Imm(val)) => {
                self.rex_w(Reg::Rax, d);
                if fits_i8(val) {
                    self.write_byte(0x83);
                    self.modrm_reg(ext, d);
                    self.write_byte(val as u8);
                } else {
                    assert!(fits_i32(val));
                    self.write_byte(0x81);
                    self.modrm_reg(ext, d);
                    self.write_i32(val as i32);
                }
            }
            (Opnd::Mem(m), Opnd::Imm(val)) => {
                self.rex_w(Reg::Rax, m.base);
                if fits_i8(val) {
                    self.write_byte(0x83);
                    self.modrm_mem(ext, m);
                    self.write_byte(val as u8);
                } else {
                    assert!(fits_i32(val));
                    self.write_byte(0x81);
                    self.modrm_mem(ext, m);
                    self.write_i32(val as i32);
                }
            }
            _ => panic!("unsupported alu operands: {:?}, {:?}", dst, src),
        }
    }

    pub fn add(&mut self, dst: Opnd, src: Opnd) {
        self.alu(0x01, 0x03, 0, dst, src);
    }

    pub fn or_(&mut self, dst: Opnd, src: Opnd) {
        self.alu(0x09, 0x0b, 1, dst, src);
    }

    pub fn and_(&mut self, dst: Opnd, src: Opnd) {
        self.alu(0x21, 0x23, 4, dst, src);
    }

    pub fn sub(&mut self, dst: Opnd, src: Opnd) {
        self.alu(0x29, 0x2b, 5, dst, src);
    }

    pub fn xor(&mut self, dst: Opnd, src: Opnd) {
        self.alu(0x31, 0x33, 6, dst, src);
    }

    pub fn cmp(&mut self, dst: Opnd, src: Opnd) {
        self.alu(0x39, 0x3b, 7, dst, src);
    }

    /// `test rm, reg` or `test rm, imm32`.
    pub fn test(&mut self, rm: Opnd, src: Opnd) {
        match (rm, src) {
            (Opnd::Reg(d), Opnd::Reg(s)) => {
                self.rex_w(s, d);
                self.write_byte(0x85);
                self.modrm_reg(s.num(), d);
            }
            (Opnd::Mem(m), Opnd::Reg(s)) => {
                self.rex_w(s, m.base);
                self.write_byte(0x85);
                self.modrm_mem(s.num(), m);
            }
            (Opnd::Reg(d), Opnd::Imm(val)) => {
                assert!(fits_i32(val));
                self.rex_w(Reg::Rax, d);
                self.write_byte(0xf7);
                self.modrm_reg(0, d);
                self.write_i32(val as i32);
            }
            (Opnd::Mem(m), Opnd::Imm(val)) => {
                assert!(fits_i32(val));
                self.rex_w(Reg::Rax, m.base);
                self.write_byte(0xf7);
                self.modrm_mem(0, m);
                self.write_i32(val as i32);
            }
            _ => panic!("unsupported test operands: {:?}, {:?}", rm, src),
        }
    }

    pub fn not_(&mut self, rm: Reg) {
        self.rex_w(Reg::Rax, rm);
        self.write_byte(0xf7);
        self.modrm_reg(2, rm);
    }

    pub fn push(&mut self, reg: Reg) {
        if reg.msb() != 0 {
            self.write_byte(0x41);
        }
        self.write_byte(0x50 | reg.low());
    }

    pub fn pop(&mut self, reg: Reg) {
        if reg.msb() != 0 {
            self.write_byte(0x41);
        }
        self.write_byte(0x58 | reg.low());
    }

    pub fn ret(&mut self) {
        self.write_byte(0xc3);
    }

    pub fn int3(&mut self) {
        self.write_byte(0xcc);
    }

    pub fn call_reg(&mut self, reg: Reg) {
        if reg.msb() != 0 {
            self.write_byte(0x41);
        }
        self.write_byte(0xff);
        self.modrm_reg(2, reg);
    }

    /// Call an absolute address through a scratch register. The target is a
    /// Rust/C function, so rel32 reachability cannot be assumed.
    pub fn call_ptr(&mut self, scratch: Reg, ptr: *const u8) {
        self.mov_u64(scratch, ptr as u64);
        self.call_reg(scratch);
    }

    pub fn jmp_reg(&mut self, reg: Reg) {
        if reg.msb() != 0 {
            self.write_byte(0x41);
        }
        self.write_byte(0xff);
        self.modrm_reg(4, reg);
    }

    pub fn jmp_mem(&mut self, m: Mem) {
        if m.base.msb() != 0 {
            self.write_byte(0x41);
        }
        self.write_byte(0xff);
        self.modrm_mem(4, m);
    }

    pub fn jmp_label(&mut self, label: Label) {
        self.write_byte(0xe9);
        self.label_ref(label);
    }

    pub fn jcc_label(&mut self, cond: Cond, label: Label) {
        self.write_byte(0x0f);
        self.write_byte(0x80 | cond as u8);
        self.label_ref(label);
    }

    /// rel32 jump to an address inside the code arenas.
    pub fn jmp_ptr(&mut self, target: CodePtr) {
        self.write_byte(0xe9);
        let end = self.get_write_ptr().as_usize() + 4;
        let disp = target.as_usize() as i64 - end as i64;
        self.write_i32(i32::try_from(disp).expect("jmp target out of rel32 range"));
    }

    pub fn jcc_ptr(&mut self, cond: Cond, target: CodePtr) {
        self.write_byte(0x0f);
        self.write_byte(0x80 | cond as u8);
        let end = self.get_write_ptr().as_usize() + 4;
        let disp = target.as_usize() as i64 - end as i64;
        self.write_i32(i32::try_from(disp).expect("jcc target out of rel32 range"));
    }

    pub fn cmov(&mut self, cond: Cond, dst: Reg, src: Opnd) {
        match src {
            Opnd::Reg(s) => {
                self.rex_w(dst, s);
                self.write_byte(0x0f);
                self.write_byte(0x40 | cond as u8);
                self.modrm_reg(dst.num(), s);
            }
            Opnd::Mem(m) => {
                self.rex_w(dst, m.base);
                self.write_byte(0x0f);
                self.write_byte(0x40 | cond as u8);
                self.modrm_mem(dst.num(), m);
            }
            _ => panic!("cmov needs a register or memory source"),
        }
    }

    /// Arithmetic shift right by an immediate.
    pub fn sar(&mut self, reg: Reg, imm: u8) {
        self.rex_w(Reg::Rax, reg);
        self.write_byte(0xc1);
        self.modrm_reg(7, reg);
        self.write_byte(imm);
    }

    /// `lock add qword [m], imm8`: the ractor-safe counter increment.
    pub fn lock_add(&mut self, m: Mem, imm: i8) {
        self.write_byte(0xf0);
        self.rex_w(Reg::Rax, m.base);
        self.write_byte(0x83);
        self.modrm_mem(0, m);
        self.write_byte(imm as u8);
    }
}
