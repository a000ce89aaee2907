//! x86-64 emission primitives.
//!
//! Thin wrappers over dynasmrt for the handful of instructions the lowering
//! unit needs: flag-setting arithmetic, conditional branches to dynamic
//! labels, and the carry/shift/or sequence used to reconstruct a value after
//! a self-aliased overflowing add.
//!
//! All helpers take dynamic register numbers, because operand locations are
//! only known after register allocation.

use dynasmrt::{dynasm, DynamicLabel, DynasmApi, DynasmLabelApi};

use crate::inst::{ResCond, Width};

pub type Assembler = dynasmrt::x64::Assembler;

/// Whether the target has 64-bit GPRs. The self-aliased overflow
/// reconstruction is only correct on such targets.
pub const IS_64_BIT: bool = true;

// ─── Registers ───────────────────────────────────────────────────────────────

/// An x86-64 general-purpose register, identified by its encoding number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Gpr(u8);

impl Gpr {
    pub const RAX: Gpr = Gpr(0);
    pub const RCX: Gpr = Gpr(1);
    pub const RDX: Gpr = Gpr(2);
    pub const RBX: Gpr = Gpr(3);
    pub const RSP: Gpr = Gpr(4);
    pub const RBP: Gpr = Gpr(5);
    pub const RSI: Gpr = Gpr(6);
    pub const RDI: Gpr = Gpr(7);
    pub const R8: Gpr = Gpr(8);
    pub const R9: Gpr = Gpr(9);
    pub const R10: Gpr = Gpr(10);
    pub const R11: Gpr = Gpr(11);
    pub const R12: Gpr = Gpr(12);
    pub const R13: Gpr = Gpr(13);
    pub const R14: Gpr = Gpr(14);
    pub const R15: Gpr = Gpr(15);

    /// The hardware encoding number.
    pub fn code(self) -> u8 {
        self.0
    }
}

const GPR_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];

impl std::fmt::Display for Gpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(GPR_NAMES[self.0 as usize])
    }
}

/// Caller-saved registers, in scratch-selection order.
const SCRATCH_ORDER: [Gpr; 9] = [
    Gpr::RAX,
    Gpr::RCX,
    Gpr::RDX,
    Gpr::RSI,
    Gpr::RDI,
    Gpr::R8,
    Gpr::R9,
    Gpr::R10,
    Gpr::R11,
];

/// Pick a caller-saved register not in `exclude`, for short save/restore
/// sequences on the late path.
pub fn select_scratch_gpr(exclude: &[Gpr]) -> Gpr {
    SCRATCH_ORDER
        .into_iter()
        .find(|g| !exclude.contains(g))
        .expect("ran out of scratch registers")
}

// ─── Jumps ───────────────────────────────────────────────────────────────────

/// A forward branch that may not have been emitted.
///
/// A set jump holds the dynamic label its branch targets; linking binds that
/// label at the current emission position. An unset jump holds nothing and
/// must never be linked.
#[derive(Debug, Clone, Copy)]
pub struct Jump(Option<DynamicLabel>);

impl Jump {
    pub fn unset() -> Self {
        Jump(None)
    }

    pub fn set(target: DynamicLabel) -> Self {
        Jump(Some(target))
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }

    /// Bind the branch target at the current position.
    pub fn link(&self, asm: &mut Assembler) {
        let target = self.0.expect("linked an unset jump");
        bind(asm, target);
    }
}

// ─── Labels and branches ─────────────────────────────────────────────────────

/// Bind a dynamic label at the current position.
pub fn bind(asm: &mut Assembler, label: DynamicLabel) {
    dynasm!(asm
        ; .arch x64
        ; =>label
    );
}

/// Emit a conditional branch on the given hardware flag.
pub fn branch(asm: &mut Assembler, cond: ResCond, target: DynamicLabel) {
    match cond {
        ResCond::Overflow => dynasm!(asm ; .arch x64 ; jo =>target),
        ResCond::Zero => dynasm!(asm ; .arch x64 ; jz =>target),
        ResCond::NonZero => dynasm!(asm ; .arch x64 ; jnz =>target),
    }
}

pub fn ret(asm: &mut Assembler) {
    dynasm!(asm
        ; .arch x64
        ; ret
    );
}

// ─── Arithmetic ──────────────────────────────────────────────────────────────

/// `dst += src`, setting flags.
pub fn add(asm: &mut Assembler, w: Width, src: Gpr, dst: Gpr) {
    match w {
        Width::W32 => dynasm!(asm ; .arch x64 ; add Rd(dst.code()), Rd(src.code())),
        Width::W64 => dynasm!(asm ; .arch x64 ; add Rq(dst.code()), Rq(src.code())),
    }
}

/// `dst += imm`, setting flags.
pub fn add_imm(asm: &mut Assembler, w: Width, imm: i32, dst: Gpr) {
    match w {
        Width::W32 => dynasm!(asm ; .arch x64 ; add Rd(dst.code()), imm),
        Width::W64 => dynasm!(asm ; .arch x64 ; add Rq(dst.code()), imm),
    }
}

/// `dst += [base + offset]`, setting flags.
pub fn add_mem(asm: &mut Assembler, w: Width, base: Gpr, offset: i32, dst: Gpr) {
    match w {
        Width::W32 => dynasm!(asm ; .arch x64 ; add Rd(dst.code()), [Rq(base.code()) + offset]),
        Width::W64 => dynasm!(asm ; .arch x64 ; add Rq(dst.code()), [Rq(base.code()) + offset]),
    }
}

/// `dst -= src`, setting flags.
pub fn sub(asm: &mut Assembler, w: Width, src: Gpr, dst: Gpr) {
    match w {
        Width::W32 => dynasm!(asm ; .arch x64 ; sub Rd(dst.code()), Rd(src.code())),
        Width::W64 => dynasm!(asm ; .arch x64 ; sub Rq(dst.code()), Rq(src.code())),
    }
}

/// `dst -= imm`, setting flags.
pub fn sub_imm(asm: &mut Assembler, w: Width, imm: i32, dst: Gpr) {
    match w {
        Width::W32 => dynasm!(asm ; .arch x64 ; sub Rd(dst.code()), imm),
        Width::W64 => dynasm!(asm ; .arch x64 ; sub Rq(dst.code()), imm),
    }
}

/// `dst -= [base + offset]`, setting flags.
pub fn sub_mem(asm: &mut Assembler, w: Width, base: Gpr, offset: i32, dst: Gpr) {
    match w {
        Width::W32 => dynasm!(asm ; .arch x64 ; sub Rd(dst.code()), [Rq(base.code()) + offset]),
        Width::W64 => dynasm!(asm ; .arch x64 ; sub Rq(dst.code()), [Rq(base.code()) + offset]),
    }
}

/// `dst = -dst`, setting flags.
pub fn neg(asm: &mut Assembler, w: Width, dst: Gpr) {
    match w {
        Width::W32 => dynasm!(asm ; .arch x64 ; neg Rd(dst.code())),
        Width::W64 => dynasm!(asm ; .arch x64 ; neg Rq(dst.code())),
    }
}

/// `flags = a & b`.
pub fn test(asm: &mut Assembler, w: Width, a: Gpr, b: Gpr) {
    match w {
        Width::W32 => dynasm!(asm ; .arch x64 ; test Rd(a.code()), Rd(b.code())),
        Width::W64 => dynasm!(asm ; .arch x64 ; test Rq(a.code()), Rq(b.code())),
    }
}

/// `flags = a & imm`.
pub fn test_imm(asm: &mut Assembler, w: Width, imm: i32, a: Gpr) {
    match w {
        Width::W32 => dynasm!(asm ; .arch x64 ; test Rd(a.code()), imm),
        Width::W64 => dynasm!(asm ; .arch x64 ; test Rq(a.code()), imm),
    }
}

/// `dst = src`.
pub fn mov(asm: &mut Assembler, w: Width, src: Gpr, dst: Gpr) {
    match w {
        Width::W32 => dynasm!(asm ; .arch x64 ; mov Rd(dst.code()), Rd(src.code())),
        Width::W64 => dynasm!(asm ; .arch x64 ; mov Rq(dst.code()), Rq(src.code())),
    }
}

/// `dst |= src`.
pub fn or(asm: &mut Assembler, w: Width, src: Gpr, dst: Gpr) {
    match w {
        Width::W32 => dynasm!(asm ; .arch x64 ; or Rd(dst.code()), Rd(src.code())),
        Width::W64 => dynasm!(asm ; .arch x64 ; or Rq(dst.code()), Rq(src.code())),
    }
}

/// `dst <<= amount`.
pub fn shl(asm: &mut Assembler, w: Width, amount: u8, dst: Gpr) {
    match w {
        Width::W32 => dynasm!(asm ; .arch x64 ; shl Rd(dst.code()), amount as i8),
        Width::W64 => dynasm!(asm ; .arch x64 ; shl Rq(dst.code()), amount as i8),
    }
}

/// `dst >>= amount`, unsigned.
pub fn shr(asm: &mut Assembler, w: Width, amount: u8, dst: Gpr) {
    match w {
        Width::W32 => dynasm!(asm ; .arch x64 ; shr Rd(dst.code()), amount as i8),
        Width::W64 => dynasm!(asm ; .arch x64 ; shr Rq(dst.code()), amount as i8),
    }
}

/// `dst = carry flag` (low byte; higher bits are left as-is).
pub fn set_carry(asm: &mut Assembler, dst: Gpr) {
    dynasm!(asm
        ; .arch x64
        ; setc Rb(dst.code())
    );
}

pub fn push(asm: &mut Assembler, reg: Gpr) {
    dynasm!(asm
        ; .arch x64
        ; push Rq(reg.code())
    );
}

pub fn pop(asm: &mut Assembler, reg: Gpr) {
    dynasm!(asm
        ; .arch x64
        ; pop Rq(reg.code())
    );
}
