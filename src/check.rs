//! Lowering support for checked operations.
//!
//! A checked operation computes a value, branches to a failure path when a
//! hardware flag fires, and may have clobbered one of its own operands by
//! the time the branch is taken. `CheckSpecial` packages that pattern: it
//! reconstructs the plain branch instruction hiding inside the patched
//! record so generic branch logic can be reused, classifies the stack-map
//! tail, and emits the failure path late — first undoing the partial side
//! effect, then handing off to the origin value's result-materialization
//! callback.
//!
//! Instruction layout: slot 0 is the special reference, slots
//! `1..=num_check_args` are the hidden branch's own arguments (condition
//! first), and the rest is the stack-map tail.

use std::fmt;

use smallvec::SmallVec;

use crate::arch::{self, Assembler, Jump};
use crate::context::GenerationContext;
use crate::inst::{Arg, ArgRole, Bank, Inst, Opcode, Width};
use crate::special::Special;
use crate::stackmap::{self, num_origin_args, Procedure, RoleMode, StackmapGenerationParams};

// ─── Descriptor ──────────────────────────────────────────────────────────────

/// Identifies a class of checked instructions: which hidden branch underlies
/// it, how many arguments that branch takes, and how the stack-map tail is
/// classified. Two keys are equal iff all three fields match, so the
/// instruction selector can intern one special per distinct shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CheckKey {
    kind: Opcode,
    num_args: usize,
    stackmap_role: RoleMode,
}

impl CheckKey {
    pub fn new(kind: Opcode, num_args: usize, stackmap_role: RoleMode) -> CheckKey {
        CheckKey {
            kind,
            num_args,
            stackmap_role,
        }
    }

    /// Key for a not-yet-patched branch instruction.
    pub fn from_inst(inst: &Inst) -> CheckKey {
        CheckKey {
            kind: inst.opcode,
            num_args: inst.args.len(),
            stackmap_role: RoleMode::SameAsRep,
        }
    }

    pub fn kind(&self) -> Opcode {
        self.kind
    }

    pub fn num_args(&self) -> usize {
        self.num_args
    }

    pub fn stackmap_role(&self) -> RoleMode {
        self.stackmap_role
    }
}

impl fmt::Display for CheckKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({},{})", self.kind, self.num_args, self.stackmap_role)
    }
}

// ─── The special ─────────────────────────────────────────────────────────────

/// The checked-operation lowering unit. See the module docs for the
/// instruction layout it expects.
pub struct CheckSpecial {
    check_kind: Opcode,
    stackmap_role: RoleMode,
    num_check_args: usize,
}

impl CheckSpecial {
    pub fn new(check_kind: Opcode, num_check_args: usize, stackmap_role: RoleMode) -> CheckSpecial {
        assert!(
            check_kind.is_branch(),
            "checked operations lower to branch kinds, got {check_kind}"
        );
        CheckSpecial {
            check_kind,
            stackmap_role,
            num_check_args,
        }
    }

    pub fn from_key(key: &CheckKey) -> CheckSpecial {
        CheckSpecial::new(key.kind(), key.num_args(), key.stackmap_role())
    }

    pub fn key(&self) -> CheckKey {
        CheckKey::new(self.check_kind, self.num_check_args, self.stackmap_role)
    }

    pub fn num_check_args(&self) -> usize {
        self.num_check_args
    }

    /// Reconstruct the plain conditional branch hiding inside `inst`. The
    /// transient's slot `i` is `inst`'s slot `i + 1`; it is never scheduled,
    /// only consulted so generic branch logic can be reused.
    pub fn hidden_branch(&self, inst: &Inst) -> Inst {
        let args = inst.args[1..=self.num_check_args].to_vec();
        let hidden = Inst::new(self.check_kind, inst.origin, args);
        debug_assert!(hidden.opcode.is_branch());
        hidden
    }

    fn first_recoverable_index(&self) -> Option<usize> {
        // The add family can rematerialize its second operand onward from
        // the stack map; everything else pins its operands.
        match self.check_kind {
            Opcode::BranchAdd32 | Opcode::BranchAdd64 => Some(1),
            _ => None,
        }
    }
}

impl fmt::Display for CheckSpecial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({},{})",
            self.check_kind, self.num_check_args, self.stackmap_role
        )
    }
}

impl Special for CheckSpecial {
    fn for_each_arg(
        &self,
        inst: &mut Inst,
        proc: &Procedure,
        callback: &mut dyn FnMut(usize, &mut Arg, ArgRole, Bank, Width),
    ) {
        let mut def_width: Option<Width> = None;
        let mut hidden = self.hidden_branch(inst);
        hidden.for_each_arg(|i, _arg, role, bank, width| {
            if role.is_any_def() && role != ArgRole::Scratch {
                // There can only be one def'ed arg.
                assert!(def_width.is_none(), "second def in {inst}");
                def_width = Some(width);
            }
            callback(i + 1, &mut inst.args[i + 1], role, bank, width);
        });

        let origin = inst.origin.expect("checked instruction needs an origin value");
        let nb = num_origin_args(proc[origin].op);
        stackmap::for_each_arg_impl(
            nb,
            self.num_check_args + 1,
            inst,
            proc,
            self.stackmap_role,
            self.first_recoverable_index(),
            |i, arg, role, bank, width| callback(i, arg, role, bank, width),
        );
    }

    fn is_valid(&self, inst: &Inst, proc: &Procedure) -> bool {
        let origin = inst.origin.expect("checked instruction needs an origin value");
        let nb = num_origin_args(proc[origin].op);
        self.hidden_branch(inst).is_valid_form()
            && stackmap::is_valid_impl(nb, self.num_check_args + 1, inst, proc)
            && inst.args.len() - self.num_check_args - 1 == proc[origin].children.len() - nb
    }

    fn admits_stack(&self, inst: &Inst, proc: &Procedure, arg_index: usize) -> bool {
        if arg_index >= 1 && arg_index < 1 + self.num_check_args {
            return self.hidden_branch(inst).admits_stack(arg_index - 1);
        }
        let origin = inst.origin.expect("checked instruction needs an origin value");
        let nb = num_origin_args(proc[origin].op);
        stackmap::admits_stack_impl(nb, self.num_check_args + 1, inst, proc, arg_index)
    }

    fn admits_extended_offset_addr(
        &self,
        inst: &Inst,
        proc: &Procedure,
        arg_index: usize,
    ) -> bool {
        if arg_index >= 1 && arg_index < 1 + self.num_check_args {
            return false;
        }
        self.admits_stack(inst, proc, arg_index)
    }

    fn should_try_aliasing_def(&self, inst: &Inst) -> Option<usize> {
        self.hidden_branch(inst)
            .should_try_aliasing_def()
            .map(|def| def + 1)
    }

    fn generate(&self, inst: &Inst, asm: &mut Assembler, ctx: &mut GenerationContext<'_>) -> Jump {
        let fail = self.hidden_branch(inst).generate(asm, ctx);
        assert!(fail.is_set());

        let origin = inst.origin.expect("checked instruction needs an origin value");
        let value = &ctx.proc[origin];
        assert!(
            value.generator.is_some(),
            "origin of a checked instruction must carry a result-materialization generator"
        );

        let nb = num_origin_args(value.op);
        let reps = stackmap::reps_impl(nb, self.num_check_args + 1, inst);

        // Set aside the args relevant to undoing the operation, so the late
        // path does not capture the whole instruction.
        let args: SmallVec<[Arg; 4]> = inst.args[1..=self.num_check_args].iter().copied().collect();
        let kind = self.check_kind;
        let num_check_args = self.num_check_args;

        ctx.add_late_path(move |asm, ctx| {
            fail.link(asm);
            emit_undo(kind, num_check_args, &args, asm, ctx);

            let params = StackmapGenerationParams {
                value: origin,
                reps,
            };
            let generator = ctx.proc[origin]
                .generator
                .take()
                .expect("result-materialization generator runs exactly once");
            generator(asm, &params, ctx);
        });

        // As far as the scheduler is concerned, we are not a terminal: both
        // the fallthrough and the failure edge are handled out of band.
        Jump::unset()
    }
}

// ─── Compensation ────────────────────────────────────────────────────────────

/// Undo the partial effect of a checked operation whose failure branch was
/// taken. `args` are the hidden branch's operands as captured at generation
/// time, condition first.
fn emit_undo(
    kind: Opcode,
    num_check_args: usize,
    args: &[Arg],
    asm: &mut Assembler,
    ctx: &mut GenerationContext<'_>,
) {
    match kind {
        Opcode::BranchAdd32 | Opcode::BranchAdd64 => {
            // Not selectable on 32-bit targets, which lets the reconstruction
            // below assume 64-bit shift encodings exist.
            assert!(arch::IS_64_BIT, "checked add undo reached on a 32-bit target");
            let (sub_op, width, top_bit) = match kind {
                Opcode::BranchAdd32 => (Opcode::Sub32, Width::W32, 31u8),
                _ => (Opcode::Sub64, Width::W64, 63u8),
            };
            if (num_check_args == 4 && args[1] == args[2] && args[2] == args[3])
                || (num_check_args == 3 && args[1] == args[2])
            {
                // A self-add has shifted the value left by one, losing the
                // top bit into the carry flag. A subtract cannot bring it
                // back; rebuild the value as carry:sum >> 1 instead.
                let value_gpr = args[1].gpr();
                let scratch = arch::select_scratch_gpr(&[value_gpr]);
                arch::push(asm, scratch);
                arch::set_carry(asm, scratch);
                arch::shl(asm, width, top_bit, scratch);
                arch::shr(asm, width, 1, value_gpr);
                arch::or(asm, width, scratch, value_gpr);
                arch::pop(asm, scratch);
            } else if num_check_args == 4 {
                // Dest aliased one source; subtracting the untouched source
                // recovers it. An independent dest clobbered nothing.
                if args[1] == args[3] {
                    Inst::new(sub_op, None, vec![args[2], args[3]]).generate(asm, ctx);
                } else if args[2] == args[3] {
                    Inst::new(sub_op, None, vec![args[1], args[3]]).generate(asm, ctx);
                }
            } else if num_check_args == 3 {
                Inst::new(sub_op, None, vec![args[1], args[2]]).generate(asm, ctx);
            }
        }
        Opcode::BranchSub32 => {
            Inst::new(Opcode::Add32, None, vec![args[1], args[2]]).generate(asm, ctx);
        }
        Opcode::BranchSub64 => {
            assert!(arch::IS_64_BIT, "checked sub64 undo reached on a 32-bit target");
            Inst::new(Opcode::Add64, None, vec![args[1], args[2]]).generate(asm, ctx);
        }
        Opcode::BranchNeg32 => {
            Inst::new(Opcode::Neg32, None, vec![args[1]]).generate(asm, ctx);
        }
        Opcode::BranchNeg64 => {
            assert!(arch::IS_64_BIT, "checked neg64 undo reached on a 32-bit target");
            Inst::new(Opcode::Neg64, None, vec![args[1]]).generate(asm, ctx);
        }
        // Plain checks have no side effect to undo.
        _ => {}
    }
}
