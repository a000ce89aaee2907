//! Checked-arithmetic lowering for a JIT backend.
//!
//! A checked operation computes a value and branches to a failure path when
//! a hardware flag fires — and by then it may already have clobbered one of
//! its own operands. This crate implements the lowering unit for that
//! pattern: a `Patch` instruction carries a [`CheckSpecial`] which
//! reconstructs the plain branch hiding inside it, classifies operands for
//! the register allocator, validates the record, and emits the failure path
//! late — compensation code to undo the partial side effect, then the origin
//! value's own result-materialization callback.
//!
//! The pipeline pieces this composes with (instruction stream, stack-map
//! values, late-path queue, x86-64 emission) live in their own modules.

pub mod arch;
pub mod check;
pub mod context;
pub mod inst;
pub mod special;
pub mod stackmap;


pub use arch::{Assembler, Gpr, Jump};
pub use check::{CheckKey, CheckSpecial};
pub use context::{GenerationContext, LatePath};
pub use inst::{Arg, ArgRole, Bank, Inst, Opcode, ResCond, SpecialId, Tmp, Width};
pub use special::Special;
pub use stackmap::{
    Procedure, RoleMode, StackmapGenerationParams, Value, ValueId, ValueOp, ValueRep,
};

#[cfg(test)]
mod tests {
    use super::*;
    use dynasmrt::{dynasm, DynasmApi};
    use std::cell::Cell;
    use std::rc::Rc;

    /// Marker or'ed into the return value by the failure-path generator, so
    /// callers can tell a bailout from an ordinary result.
    const FAILED: u64 = 1 << 32;

    fn new_value(op: ValueOp, width: Width, num_live: usize) -> Value {
        let mut value = Value::new(op);
        for _ in 0..stackmap::num_origin_args(op) {
            value.push_child(ValueRep::WarmAny, Bank::Gp, width);
        }
        for _ in 0..num_live {
            value.push_child(ValueRep::WarmAny, Bank::Gp, width);
        }
        value
    }

    /// Emit one checked instruction as a whole function: the checked op,
    /// a success epilogue, then the drained late path. The generator moves
    /// the (compensated) first operand to the return register and marks the
    /// result as failed.
    fn jit_compile(
        proc: &mut Procedure,
        special: &CheckSpecial,
        inst: &Inst,
        result_reg: Gpr,
        width: Width,
    ) -> dynasmrt::ExecutableBuffer {
        let mut asm = Assembler::new().expect("failed to create assembler");
        let mut ctx = GenerationContext::new(proc);

        let jump = special.generate(inst, &mut asm, &mut ctx);
        assert!(!jump.is_set());

        // Success: result (the op's dest) to rax, return. Moved at the op's
        // width because a 32-bit write is what zero-extends the register.
        arch::mov(&mut asm, width, result_reg, Gpr::RAX);
        arch::ret(&mut asm);

        ctx.drain_late_paths(&mut asm);

        asm.commit().expect("failed to commit assembly");
        asm.finalize().expect("failed to finalize assembly")
    }

    /// Generator used by the 32-bit tests: return the recovered operand in
    /// eax with the FAILED marker set.
    fn bailout_returning(
        reg: Gpr,
    ) -> impl FnOnce(&mut Assembler, &StackmapGenerationParams, &mut GenerationContext<'_>) {
        move |asm, _params, _ctx| {
            dynasm!(asm
                ; .arch x64
                ; mov Rd(Gpr::RAX.code()), Rd(reg.code())
                ; bts rax, 32
                ; ret
            );
        }
    }

    #[test]
    fn checked_add_recovers_aliased_source_on_overflow() {
        // edi = edi + esi, dest aliasing src1.
        let mut proc = Procedure::new();
        let mut value = new_value(ValueOp::CheckedAdd, Width::W32, 0);
        value.set_generator(bailout_returning(Gpr::RDI));
        let origin = proc.push_value(value);

        let special = CheckSpecial::new(Opcode::BranchAdd32, 4, RoleMode::SameAsRep);
        let inst = Inst::new(
            Opcode::Patch,
            Some(origin),
            vec![
                Arg::Special(SpecialId(0)),
                Arg::ResCond(ResCond::Overflow),
                Arg::reg(Gpr::RDI),
                Arg::reg(Gpr::RSI),
                Arg::reg(Gpr::RDI),
            ],
        );
        assert!(special.is_valid(&inst, &proc));

        let buf = jit_compile(&mut proc, &special, &inst, Gpr::RDI, Width::W32);
        let f: extern "C" fn(i32, i32) -> u64 =
            unsafe { core::mem::transmute(buf.ptr(dynasmrt::AssemblyOffset(0))) };

        assert_eq!(f(2, 3), 5);
        assert_eq!(f(-7, 3), (-4i32 as u32) as u64);
        // Overflow: compensation must give back the original edi.
        assert_eq!(f(i32::MAX, 1), FAILED | i32::MAX as u64);
        assert_eq!(f(i32::MIN, -1), FAILED | (i32::MIN as u32) as u64);
    }

    #[test]
    fn checked_add_doubling_recovers_via_carry_reconstruction() {
        // edi = edi + edi: dest aliases both sources, so the lost top bit
        // has to come back from the carry flag.
        let mut proc = Procedure::new();
        let mut value = new_value(ValueOp::CheckedAdd, Width::W32, 0);
        value.set_generator(bailout_returning(Gpr::RDI));
        let origin = proc.push_value(value);

        let special = CheckSpecial::new(Opcode::BranchAdd32, 4, RoleMode::SameAsRep);
        let inst = Inst::new(
            Opcode::Patch,
            Some(origin),
            vec![
                Arg::Special(SpecialId(0)),
                Arg::ResCond(ResCond::Overflow),
                Arg::reg(Gpr::RDI),
                Arg::reg(Gpr::RDI),
                Arg::reg(Gpr::RDI),
            ],
        );
        assert!(special.is_valid(&inst, &proc));

        let buf = jit_compile(&mut proc, &special, &inst, Gpr::RDI, Width::W32);
        let f: extern "C" fn(i32) -> u64 =
            unsafe { core::mem::transmute(buf.ptr(dynasmrt::AssemblyOffset(0))) };

        assert_eq!(f(21), 42);
        // 2^30 doubles to 2^31: signed overflow with carry clear.
        assert_eq!(f(0x4000_0000), FAILED | 0x4000_0000);
        // i32::MIN doubles to zero: carry holds the lost sign bit.
        assert_eq!(f(i32::MIN), FAILED | (i32::MIN as u32) as u64);
    }

    #[test]
    fn checked_add_three_arg_self_form_recovers_via_carry() {
        // The three-arg form with src aliasing dest is the same doubling.
        let mut proc = Procedure::new();
        let mut value = new_value(ValueOp::CheckedAdd, Width::W32, 0);
        value.set_generator(bailout_returning(Gpr::RDI));
        let origin = proc.push_value(value);

        let special = CheckSpecial::new(Opcode::BranchAdd32, 3, RoleMode::SameAsRep);
        let inst = Inst::new(
            Opcode::Patch,
            Some(origin),
            vec![
                Arg::Special(SpecialId(0)),
                Arg::ResCond(ResCond::Overflow),
                Arg::reg(Gpr::RDI),
                Arg::reg(Gpr::RDI),
            ],
        );
        assert!(special.is_valid(&inst, &proc));

        let buf = jit_compile(&mut proc, &special, &inst, Gpr::RDI, Width::W32);
        let f: extern "C" fn(i32) -> u64 =
            unsafe { core::mem::transmute(buf.ptr(dynasmrt::AssemblyOffset(0))) };

        assert_eq!(f(100), 200);
        assert_eq!(f(0x4000_0000), FAILED | 0x4000_0000);
    }

    #[test]
    fn checked_add64_doubling_recovers_via_carry() {
        let mut proc = Procedure::new();
        let mut value = new_value(ValueOp::CheckedAdd, Width::W64, 0);
        // On failure, return the recovered operand as-is.
        value.set_generator(|asm, _params, _ctx| {
            arch::mov(asm, Width::W64, Gpr::RDI, Gpr::RAX);
            arch::ret(asm);
        });
        let origin = proc.push_value(value);

        let special = CheckSpecial::new(Opcode::BranchAdd64, 4, RoleMode::SameAsRep);
        let inst = Inst::new(
            Opcode::Patch,
            Some(origin),
            vec![
                Arg::Special(SpecialId(0)),
                Arg::ResCond(ResCond::Overflow),
                Arg::reg(Gpr::RDI),
                Arg::reg(Gpr::RDI),
                Arg::reg(Gpr::RDI),
            ],
        );
        assert!(special.is_valid(&inst, &proc));

        let buf = jit_compile(&mut proc, &special, &inst, Gpr::RDI, Width::W64);
        let f: extern "C" fn(i64) -> i64 =
            unsafe { core::mem::transmute(buf.ptr(dynasmrt::AssemblyOffset(0))) };

        assert_eq!(f(1 << 40), 1 << 41);
        // 2^62 doubles to 2^63: overflow, recovered value equals the input.
        assert_eq!(f(1 << 62), 1 << 62);
        assert_eq!(f(i64::MIN), i64::MIN);
    }

    #[test]
    fn checked_sub_adds_the_subtrahend_back() {
        // edi = edi - esi.
        let mut proc = Procedure::new();
        let mut value = new_value(ValueOp::CheckedSub, Width::W32, 0);
        value.set_generator(bailout_returning(Gpr::RDI));
        let origin = proc.push_value(value);

        let special = CheckSpecial::new(Opcode::BranchSub32, 3, RoleMode::SameAsRep);
        let inst = Inst::new(
            Opcode::Patch,
            Some(origin),
            vec![
                Arg::Special(SpecialId(0)),
                Arg::ResCond(ResCond::Overflow),
                Arg::reg(Gpr::RSI),
                Arg::reg(Gpr::RDI),
            ],
        );
        assert!(special.is_valid(&inst, &proc));

        let buf = jit_compile(&mut proc, &special, &inst, Gpr::RDI, Width::W32);
        let f: extern "C" fn(i32, i32) -> u64 =
            unsafe { core::mem::transmute(buf.ptr(dynasmrt::AssemblyOffset(0))) };

        assert_eq!(f(10, 4), 6);
        assert_eq!(f(i32::MIN, 1), FAILED | (i32::MIN as u32) as u64);
        assert_eq!(f(i32::MAX, -1), FAILED | i32::MAX as u64);
    }

    #[test]
    fn checked_neg_negates_again() {
        let mut proc = Procedure::new();
        let mut value = new_value(ValueOp::CheckedNeg, Width::W32, 0);
        value.set_generator(bailout_returning(Gpr::RDI));
        let origin = proc.push_value(value);

        let special = CheckSpecial::new(Opcode::BranchNeg32, 2, RoleMode::SameAsRep);
        let inst = Inst::new(
            Opcode::Patch,
            Some(origin),
            vec![
                Arg::Special(SpecialId(0)),
                Arg::ResCond(ResCond::Overflow),
                Arg::reg(Gpr::RDI),
            ],
        );
        assert!(special.is_valid(&inst, &proc));

        let buf = jit_compile(&mut proc, &special, &inst, Gpr::RDI, Width::W32);
        let f: extern "C" fn(i32) -> u64 =
            unsafe { core::mem::transmute(buf.ptr(dynasmrt::AssemblyOffset(0))) };

        assert_eq!(f(5), (-5i32 as u32) as u64);
        // Negating i32::MIN overflows; re-negation restores it.
        assert_eq!(f(i32::MIN), FAILED | (i32::MIN as u32) as u64);
    }

    #[test]
    fn plain_check_branches_without_compensation() {
        // Bail out when edi is zero; no side effect to undo.
        let mut proc = Procedure::new();
        let mut value = new_value(ValueOp::Check, Width::W32, 0);
        value.set_generator(bailout_returning(Gpr::RDI));
        let origin = proc.push_value(value);

        let special = CheckSpecial::new(Opcode::BranchTest32, 3, RoleMode::SameAsRep);
        let inst = Inst::new(
            Opcode::Patch,
            Some(origin),
            vec![
                Arg::Special(SpecialId(0)),
                Arg::ResCond(ResCond::Zero),
                Arg::reg(Gpr::RDI),
                Arg::reg(Gpr::RDI),
            ],
        );
        assert!(special.is_valid(&inst, &proc));

        let buf = jit_compile(&mut proc, &special, &inst, Gpr::RDI, Width::W32);
        let f: extern "C" fn(i32) -> u64 =
            unsafe { core::mem::transmute(buf.ptr(dynasmrt::AssemblyOffset(0))) };

        assert_eq!(f(7), 7);
        assert_eq!(f(0), FAILED);
    }

    #[test]
    fn generator_sees_the_stackmap_reps() {
        let mut proc = Procedure::new();
        let mut value = new_value(ValueOp::CheckedAdd, Width::W32, 2);
        let ran = Rc::new(Cell::new(false));
        {
            let ran = ran.clone();
            value.set_generator(move |asm, params, _ctx| {
                assert_eq!(
                    params.reps,
                    vec![
                        ValueRep::WarmAny,
                        ValueRep::WarmAny,
                        ValueRep::Register(Gpr::R8),
                        ValueRep::Stack(24),
                    ]
                );
                ran.set(true);
                arch::ret(asm);
            });
        }
        let origin = proc.push_value(value);

        let special = CheckSpecial::new(Opcode::BranchAdd32, 3, RoleMode::SameAsRep);
        let inst = Inst::new(
            Opcode::Patch,
            Some(origin),
            vec![
                Arg::Special(SpecialId(0)),
                Arg::ResCond(ResCond::Overflow),
                Arg::reg(Gpr::RSI),
                Arg::reg(Gpr::RDI),
                Arg::reg(Gpr::R8),
                Arg::Addr {
                    base: Gpr::RSP,
                    offset: 24,
                },
            ],
        );
        assert!(special.is_valid(&inst, &proc));

        // The generator runs during late-path draining, not at runtime.
        let _buf = jit_compile(&mut proc, &special, &inst, Gpr::RDI, Width::W32);
        assert!(ran.get());
    }
}
