//! Low-level instruction representation.
//!
//! Instructions are an opcode plus an ordered argument list. Checked
//! instructions are scheduled as `Patch` with a special reference in slot 0;
//! the branch opcodes here are the hidden forms those specials reconstruct,
//! and the plain arithmetic opcodes exist so compensation code can be emitted
//! through the same path as everything else.
//!
//! Per-opcode argument classification (role, bank, width) is what the
//! register allocator consumes; code generation assumes allocation has
//! already replaced virtual registers with concrete ones.

use std::fmt;

use crate::arch::{self, Assembler, Gpr, Jump};
use crate::context::GenerationContext;
use crate::stackmap::ValueId;

// ─── Widths, banks, roles ────────────────────────────────────────────────────

/// Operand width of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    W32,
    W64,
}

impl Width {
    /// The width in bits.
    pub fn bits(self) -> u32 {
        match self {
            Width::W32 => 32,
            Width::W64 => 64,
        }
    }
}

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "W{}", self.bits())
    }
}

/// Register bank an operand lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bank {
    Gp,
    Fp,
}

impl fmt::Display for Bank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bank::Gp => write!(f, "Gp"),
            Bank::Fp => write!(f, "Fp"),
        }
    }
}

/// How an instruction treats one of its operands. Reported to the register
/// allocator per slot; never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgRole {
    /// Read on the primary path.
    Use,
    /// Read only on a rarely-taken path, and recoverable from the stack map.
    ColdUse,
    /// Read only on a rarely-taken path, after all defs of the instruction.
    LateColdUse,
    /// Read and written.
    UseDef,
    /// Written.
    Def,
    /// A register the instruction clobbers internally.
    Scratch,
}

impl ArgRole {
    pub fn is_any_def(self) -> bool {
        matches!(self, ArgRole::UseDef | ArgRole::Def | ArgRole::Scratch)
    }

    pub fn is_any_use(self) -> bool {
        matches!(
            self,
            ArgRole::Use | ArgRole::ColdUse | ArgRole::LateColdUse | ArgRole::UseDef
        )
    }
}

impl fmt::Display for ArgRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ─── Conditions ──────────────────────────────────────────────────────────────

/// Hardware flag condition a checked branch tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResCond {
    Overflow,
    Zero,
    NonZero,
}

impl fmt::Display for ResCond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ─── Operands ────────────────────────────────────────────────────────────────

/// A register operand: concrete after allocation, virtual before.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tmp {
    Reg(Gpr),
    VReg(u32),
}

impl fmt::Display for Tmp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tmp::Reg(g) => write!(f, "{g}"),
            Tmp::VReg(n) => write!(f, "v{n}"),
        }
    }
}

/// Index of a special attached to a `Patch` instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpecialId(pub u32);

impl fmt::Display for SpecialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "&{}", self.0)
    }
}

/// One argument slot of an instruction. Compared structurally: two slots
/// holding the same register are the same operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arg {
    Tmp(Tmp),
    Imm(i64),
    Addr { base: Gpr, offset: i32 },
    ResCond(ResCond),
    Special(SpecialId),
}

impl Arg {
    pub fn reg(g: Gpr) -> Arg {
        Arg::Tmp(Tmp::Reg(g))
    }

    pub fn vreg(n: u32) -> Arg {
        Arg::Tmp(Tmp::VReg(n))
    }

    /// The concrete register this slot was allocated to.
    pub fn gpr(&self) -> Gpr {
        match self {
            Arg::Tmp(Tmp::Reg(g)) => *g,
            other => panic!("expected a concrete register, got {other}"),
        }
    }

    pub fn res_cond(&self) -> ResCond {
        match self {
            Arg::ResCond(c) => *c,
            other => panic!("expected a condition, got {other}"),
        }
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Tmp(t) => write!(f, "{t}"),
            Arg::Imm(v) => write!(f, "${v}"),
            Arg::Addr { base, offset } => write!(f, "[{base}{offset:+}]"),
            Arg::ResCond(c) => write!(f, "{c}"),
            Arg::Special(s) => write!(f, "{s}"),
        }
    }
}

// ─── Opcodes ─────────────────────────────────────────────────────────────────

/// Instruction opcode. The `Branch*` kinds perform a flag-setting operation
/// and branch on the result; the plain kinds are ordinary arithmetic; `Patch`
/// defers everything to an attached special.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    BranchAdd32,
    BranchAdd64,
    BranchSub32,
    BranchSub64,
    BranchNeg32,
    BranchNeg64,
    BranchTest32,
    BranchTest64,
    Add32,
    Add64,
    Sub32,
    Sub64,
    Neg32,
    Neg64,
    Patch,
}

impl Opcode {
    /// Whether this opcode ends its block with a conditional branch.
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Opcode::BranchAdd32
                | Opcode::BranchAdd64
                | Opcode::BranchSub32
                | Opcode::BranchSub64
                | Opcode::BranchNeg32
                | Opcode::BranchNeg64
                | Opcode::BranchTest32
                | Opcode::BranchTest64
        )
    }

    /// Operand width of an arithmetic or branch opcode.
    pub fn width(self) -> Width {
        match self {
            Opcode::BranchAdd32
            | Opcode::BranchSub32
            | Opcode::BranchNeg32
            | Opcode::BranchTest32
            | Opcode::Add32
            | Opcode::Sub32
            | Opcode::Neg32 => Width::W32,
            Opcode::BranchAdd64
            | Opcode::BranchSub64
            | Opcode::BranchNeg64
            | Opcode::BranchTest64
            | Opcode::Add64
            | Opcode::Sub64
            | Opcode::Neg64 => Width::W64,
            Opcode::Patch => panic!("Patch has no intrinsic width"),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ─── Inst ────────────────────────────────────────────────────────────────────

/// A single instruction: opcode, optional origin value, ordered args.
///
/// `origin` points back at the high-level operation this instruction was
/// selected from; compensation instructions synthesized on the late path
/// have no origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inst {
    pub opcode: Opcode,
    pub origin: Option<ValueId>,
    pub args: Vec<Arg>,
}

impl Inst {
    pub fn new(opcode: Opcode, origin: Option<ValueId>, args: Vec<Arg>) -> Inst {
        Inst {
            opcode,
            origin,
            args,
        }
    }

    /// Report each operand's role, bank, and width to `callback`, in slot
    /// order. Only defined for non-`Patch` opcodes; a `Patch` is classified
    /// by its special.
    pub fn for_each_arg(&mut self, mut callback: impl FnMut(usize, &mut Arg, ArgRole, Bank, Width)) {
        use ArgRole::*;
        match self.opcode {
            Opcode::BranchAdd32 | Opcode::BranchAdd64 => match self.args.len() {
                3 => self.visit(&[Use, Use, UseDef], &mut callback),
                4 => self.visit(&[Use, Use, Use, Def], &mut callback),
                n => panic!("{} with {n} args", self.opcode),
            },
            Opcode::BranchSub32 | Opcode::BranchSub64 => {
                self.visit(&[Use, Use, UseDef], &mut callback)
            }
            Opcode::BranchNeg32 | Opcode::BranchNeg64 => self.visit(&[Use, UseDef], &mut callback),
            Opcode::BranchTest32 | Opcode::BranchTest64 => {
                self.visit(&[Use, Use, Use], &mut callback)
            }
            Opcode::Add32 | Opcode::Add64 | Opcode::Sub32 | Opcode::Sub64 => {
                self.visit(&[Use, UseDef], &mut callback)
            }
            Opcode::Neg32 | Opcode::Neg64 => self.visit(&[UseDef], &mut callback),
            Opcode::Patch => panic!("Patch args are classified by the attached special"),
        }
    }

    fn visit(
        &mut self,
        roles: &[ArgRole],
        callback: &mut impl FnMut(usize, &mut Arg, ArgRole, Bank, Width),
    ) {
        assert_eq!(
            self.args.len(),
            roles.len(),
            "{} expects {} args, got {}",
            self.opcode,
            roles.len(),
            self.args.len()
        );
        let width = self.opcode.width();
        for (i, (arg, role)) in self.args.iter_mut().zip(roles).enumerate() {
            callback(i, arg, *role, Bank::Gp, width);
        }
    }

    /// Whether the argument list is a shape this target can emit.
    pub fn is_valid_form(&self) -> bool {
        fn reg(a: &Arg) -> bool {
            matches!(a, Arg::Tmp(_))
        }
        fn src(a: &Arg) -> bool {
            matches!(a, Arg::Tmp(_) | Arg::Imm(_) | Arg::Addr { .. })
        }
        fn cond(a: &Arg) -> bool {
            matches!(a, Arg::ResCond(_))
        }

        match self.opcode {
            Opcode::BranchAdd32 | Opcode::BranchAdd64 => match self.args.as_slice() {
                [c, a, d] => cond(c) && src(a) && reg(d),
                [c, a, b, d] => cond(c) && reg(a) && reg(b) && reg(d),
                _ => false,
            },
            Opcode::BranchSub32 | Opcode::BranchSub64 => match self.args.as_slice() {
                [c, a, d] => cond(c) && src(a) && reg(d),
                _ => false,
            },
            Opcode::BranchNeg32 | Opcode::BranchNeg64 => match self.args.as_slice() {
                [c, d] => cond(c) && reg(d),
                _ => false,
            },
            Opcode::BranchTest32 | Opcode::BranchTest64 => match self.args.as_slice() {
                [c, a, b] => cond(c) && reg(a) && (reg(b) || matches!(b, Arg::Imm(_))),
                _ => false,
            },
            Opcode::Add32 | Opcode::Add64 | Opcode::Sub32 | Opcode::Sub64 => {
                match self.args.as_slice() {
                    [a, d] => src(a) && reg(d),
                    _ => false,
                }
            }
            Opcode::Neg32 | Opcode::Neg64 => matches!(self.args.as_slice(), [d] if reg(d)),
            Opcode::Patch => matches!(self.args.first(), Some(Arg::Special(_))),
        }
    }

    /// Whether the operand at `index` may be a stack address instead of a
    /// register.
    pub fn admits_stack(&self, index: usize) -> bool {
        match self.opcode {
            Opcode::BranchAdd32 | Opcode::BranchAdd64 => self.args.len() == 3 && index == 1,
            Opcode::BranchSub32 | Opcode::BranchSub64 => index == 1,
            Opcode::BranchTest32 | Opcode::BranchTest64 => index == 1,
            Opcode::BranchNeg32 | Opcode::BranchNeg64 => false,
            Opcode::Add32 | Opcode::Add64 | Opcode::Sub32 | Opcode::Sub64 => index == 0,
            Opcode::Neg32 | Opcode::Neg64 => false,
            Opcode::Patch => panic!("Patch admissibility is decided by the attached special"),
        }
    }

    /// Hint to the allocator: the def slot that profits from aliasing a use.
    pub fn should_try_aliasing_def(&self) -> Option<usize> {
        match self.opcode {
            Opcode::BranchAdd32 | Opcode::BranchAdd64 if self.args.len() == 4 => Some(3),
            _ => None,
        }
    }

    /// Emit native code. Branch opcodes return a set jump whose target is
    /// taken when the condition holds; everything else returns an unset jump.
    pub fn generate(&self, asm: &mut Assembler, _ctx: &mut GenerationContext<'_>) -> Jump {
        match self.opcode {
            Opcode::BranchAdd32 | Opcode::BranchAdd64 => {
                let w = self.opcode.width();
                match self.args.as_slice() {
                    [c, a, d] => {
                        emit_add_src(asm, w, a, d.gpr());
                        take_branch(asm, c.res_cond())
                    }
                    [c, a, b, d] => {
                        let (a, b, d) = (a.gpr(), b.gpr(), d.gpr());
                        if d == b {
                            arch::add(asm, w, a, d);
                        } else if d == a {
                            arch::add(asm, w, b, d);
                        } else {
                            arch::mov(asm, w, a, d);
                            arch::add(asm, w, b, d);
                        }
                        take_branch(asm, c.res_cond())
                    }
                    _ => panic!("invalid {} form: {self}", self.opcode),
                }
            }
            Opcode::BranchSub32 | Opcode::BranchSub64 => {
                let w = self.opcode.width();
                match self.args.as_slice() {
                    [c, a, d] => {
                        emit_sub_src(asm, w, a, d.gpr());
                        take_branch(asm, c.res_cond())
                    }
                    _ => panic!("invalid {} form: {self}", self.opcode),
                }
            }
            Opcode::BranchNeg32 | Opcode::BranchNeg64 => {
                let w = self.opcode.width();
                match self.args.as_slice() {
                    [c, d] => {
                        arch::neg(asm, w, d.gpr());
                        take_branch(asm, c.res_cond())
                    }
                    _ => panic!("invalid {} form: {self}", self.opcode),
                }
            }
            Opcode::BranchTest32 | Opcode::BranchTest64 => {
                let w = self.opcode.width();
                match self.args.as_slice() {
                    [c, a, b] => {
                        match b {
                            Arg::Imm(v) => {
                                let imm = i32::try_from(*v).expect("test immediate out of range");
                                arch::test_imm(asm, w, imm, a.gpr());
                            }
                            _ => arch::test(asm, w, a.gpr(), b.gpr()),
                        }
                        take_branch(asm, c.res_cond())
                    }
                    _ => panic!("invalid {} form: {self}", self.opcode),
                }
            }
            Opcode::Add32 | Opcode::Add64 => {
                let w = self.opcode.width();
                match self.args.as_slice() {
                    [a, d] => emit_add_src(asm, w, a, d.gpr()),
                    _ => panic!("invalid {} form: {self}", self.opcode),
                }
                Jump::unset()
            }
            Opcode::Sub32 | Opcode::Sub64 => {
                let w = self.opcode.width();
                match self.args.as_slice() {
                    [a, d] => emit_sub_src(asm, w, a, d.gpr()),
                    _ => panic!("invalid {} form: {self}", self.opcode),
                }
                Jump::unset()
            }
            Opcode::Neg32 | Opcode::Neg64 => {
                let w = self.opcode.width();
                match self.args.as_slice() {
                    [d] => arch::neg(asm, w, d.gpr()),
                    _ => panic!("invalid {} form: {self}", self.opcode),
                }
                Jump::unset()
            }
            Opcode::Patch => panic!("Patch is generated through its special"),
        }
    }
}

fn take_branch(asm: &mut Assembler, cond: ResCond) -> Jump {
    let target = asm.new_dynamic_label();
    arch::branch(asm, cond, target);
    Jump::set(target)
}

fn emit_add_src(asm: &mut Assembler, w: Width, src: &Arg, dst: Gpr) {
    match *src {
        Arg::Tmp(_) => arch::add(asm, w, src.gpr(), dst),
        Arg::Imm(v) => arch::add_imm(asm, w, i32::try_from(v).expect("add immediate out of range"), dst),
        Arg::Addr { base, offset } => arch::add_mem(asm, w, base, offset, dst),
        ref other => panic!("invalid add source {other}"),
    }
}

fn emit_sub_src(asm: &mut Assembler, w: Width, src: &Arg, dst: Gpr) {
    match *src {
        Arg::Tmp(_) => arch::sub(asm, w, src.gpr(), dst),
        Arg::Imm(v) => arch::sub_imm(asm, w, i32::try_from(v).expect("sub immediate out of range"), dst),
        Arg::Addr { base, offset } => arch::sub_mem(asm, w, base, offset, dst),
        ref other => panic!("invalid sub source {other}"),
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i == 0 {
                write!(f, " {arg}")?;
            } else {
                write!(f, ", {arg}")?;
            }
        }
        Ok(())
    }
}
