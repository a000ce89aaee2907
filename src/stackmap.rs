//! Stack-map values and the generic classification helpers shared by any
//! special whose instruction carries a stack-map tail.
//!
//! A stack-map value is the high-level operation a checked instruction was
//! selected from. Its first children are the operands the hardware operation
//! consumes directly; the rest are live values the failure path needs to
//! reconstruct program state, and they ride along as trailing instruction
//! arguments. The helpers here classify, validate, and materialize that tail
//! so each special only has to handle its own prefix.

use std::fmt;
use std::ops::{Index, IndexMut};

use crate::arch::{Assembler, Gpr};
use crate::context::GenerationContext;
use crate::inst::{Arg, ArgRole, Bank, Inst, Tmp, Width};

// ─── Values and the procedure arena ──────────────────────────────────────────

/// Index of a [`Value`] in a [`Procedure`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueId(u32);

impl ValueId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Operation kind of a stack-map value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueOp {
    CheckedAdd,
    CheckedSub,
    CheckedMul,
    CheckedNeg,
    Check,
}

impl fmt::Display for ValueOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How many children the checked operation consumes directly. The remaining
/// children are stack-map auxiliaries.
pub fn num_origin_args(op: ValueOp) -> usize {
    match op {
        ValueOp::CheckedAdd | ValueOp::CheckedSub | ValueOp::CheckedMul => 2,
        ValueOp::CheckedNeg | ValueOp::Check => 1,
    }
}

/// Where a value lives, or is allowed to live.
///
/// Before allocation a rep is a constraint (`WarmAny`, `SomeRegister`);
/// after allocation it names a concrete location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueRep {
    WarmAny,
    SomeRegister,
    Register(Gpr),
    Stack(i32),
    Constant(i64),
}

impl fmt::Display for ValueRep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueRep::WarmAny => write!(f, "WarmAny"),
            ValueRep::SomeRegister => write!(f, "SomeRegister"),
            ValueRep::Register(g) => write!(f, "Register({g})"),
            ValueRep::Stack(off) => write!(f, "Stack({off})"),
            ValueRep::Constant(v) => write!(f, "Constant({v})"),
        }
    }
}

/// One child of a stack-map value: its rep constraint plus the bank and
/// width the classifier reports for the corresponding argument slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Child {
    pub rep: ValueRep,
    pub bank: Bank,
    pub width: Width,
}

/// Everything the result-materialization callback gets to see: the origin
/// value and the post-allocation rep of every child.
pub struct StackmapGenerationParams {
    pub value: ValueId,
    pub reps: Vec<ValueRep>,
}

pub type Generator =
    Box<dyn FnOnce(&mut Assembler, &StackmapGenerationParams, &mut GenerationContext<'_>)>;

/// A stack-map-bearing operation node.
pub struct Value {
    pub op: ValueOp,
    pub children: Vec<Child>,
    pub generator: Option<Generator>,
}

impl Value {
    pub fn new(op: ValueOp) -> Value {
        Value {
            op,
            children: Vec::new(),
            generator: None,
        }
    }

    pub fn push_child(&mut self, rep: ValueRep, bank: Bank, width: Width) {
        self.children.push(Child { rep, bank, width });
    }

    /// Attach the failure-path callback. It runs exactly once, during late
    /// path generation, after compensation code has restored the operands.
    pub fn set_generator(
        &mut self,
        generator: impl FnOnce(&mut Assembler, &StackmapGenerationParams, &mut GenerationContext<'_>)
            + 'static,
    ) {
        self.generator = Some(Box::new(generator));
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Value")
            .field("op", &self.op)
            .field("children", &self.children)
            .field("has_generator", &self.generator.is_some())
            .finish()
    }
}

/// Arena of values for one compilation.
#[derive(Debug, Default)]
pub struct Procedure {
    values: Vec<Value>,
}

impl Procedure {
    pub fn new() -> Procedure {
        Procedure::default()
    }

    pub fn push_value(&mut self, value: Value) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(value);
        id
    }
}

impl Index<ValueId> for Procedure {
    type Output = Value;
    fn index(&self, id: ValueId) -> &Value {
        &self.values[id.index()]
    }
}

impl IndexMut<ValueId> for Procedure {
    fn index_mut(&mut self, id: ValueId) -> &mut Value {
        &mut self.values[id.index()]
    }
}

// ─── Generic stack-map tail helpers ──────────────────────────────────────────

/// How stack-map argument roles are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleMode {
    /// Roles follow the rep constraints, downgraded to cold uses.
    SameAsRep,
    /// Every stack-map argument is a late cold use.
    ForceLateUse,
}

impl fmt::Display for RoleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Classify the stack-map tail of `inst`, reporting each slot to `callback`.
///
/// Arguments from `first_arg_index` on correspond one-to-one to the origin
/// value's children from `num_origin_args` on. A child at or past
/// `first_recoverable_index` can be rematerialized from the stack map, so
/// its use is merely cold; anything else must stay live until the late use.
pub fn for_each_arg_impl(
    num_origin_args: usize,
    first_arg_index: usize,
    inst: &mut Inst,
    proc: &Procedure,
    role_mode: RoleMode,
    first_recoverable_index: Option<usize>,
    mut callback: impl FnMut(usize, &mut Arg, ArgRole, Bank, Width),
) {
    let origin = inst.origin.expect("stack-map classification needs an origin value");
    let value = &proc[origin];
    let num_tail = inst.args.len() - first_arg_index;
    assert_eq!(
        num_tail,
        value.children.len() - num_origin_args,
        "stack-map tail of {inst} does not match the children of {origin}",
    );

    for i in 0..num_tail {
        let child_index = num_origin_args + i;
        let child = value.children[child_index];
        let role = match role_mode {
            RoleMode::ForceLateUse => ArgRole::LateColdUse,
            RoleMode::SameAsRep => match first_recoverable_index {
                Some(first) if child_index >= first => ArgRole::ColdUse,
                _ => ArgRole::LateColdUse,
            },
        };
        let slot = first_arg_index + i;
        callback(slot, &mut inst.args[slot], role, child.bank, child.width);
    }
}

/// Whether the stack-map tail is well-formed: right length, and every
/// argument satisfies its child's rep constraint.
pub fn is_valid_impl(
    num_origin_args: usize,
    first_arg_index: usize,
    inst: &Inst,
    proc: &Procedure,
) -> bool {
    let origin = inst.origin.expect("stack-map validation needs an origin value");
    let value = &proc[origin];
    if value.children.len() < num_origin_args {
        return false;
    }
    let num_tail = inst.args.len() - first_arg_index;
    if num_tail != value.children.len() - num_origin_args {
        return false;
    }
    (0..num_tail).all(|i| {
        arg_satisfies(
            &inst.args[first_arg_index + i],
            value.children[num_origin_args + i].rep,
        )
    })
}

/// Whether the stack-map argument at `arg_index` may live on the stack.
pub fn admits_stack_impl(
    num_origin_args: usize,
    first_arg_index: usize,
    inst: &Inst,
    proc: &Procedure,
    arg_index: usize,
) -> bool {
    if arg_index < first_arg_index {
        return false;
    }
    let origin = inst.origin.expect("stack-map admissibility needs an origin value");
    let value = &proc[origin];
    let child_index = num_origin_args + (arg_index - first_arg_index);
    match value.children.get(child_index) {
        Some(child) => matches!(child.rep, ValueRep::WarmAny | ValueRep::Stack(_)),
        None => false,
    }
}

/// Post-allocation reps for every child of the origin value. Children the
/// hardware operation consumed directly have no stack-map location of their
/// own and report `WarmAny`.
pub fn reps_impl(num_origin_args: usize, first_arg_index: usize, inst: &Inst) -> Vec<ValueRep> {
    let mut reps = vec![ValueRep::WarmAny; num_origin_args];
    for arg in &inst.args[first_arg_index..] {
        reps.push(match *arg {
            Arg::Tmp(Tmp::Reg(g)) => ValueRep::Register(g),
            Arg::Imm(v) => ValueRep::Constant(v),
            Arg::Addr { offset, .. } => ValueRep::Stack(offset),
            ref other => panic!("cannot build a rep for {other} after allocation"),
        });
    }
    reps
}

fn arg_satisfies(arg: &Arg, rep: ValueRep) -> bool {
    match rep {
        ValueRep::WarmAny => matches!(arg, Arg::Tmp(_) | Arg::Imm(_) | Arg::Addr { .. }),
        ValueRep::SomeRegister => matches!(arg, Arg::Tmp(_)),
        ValueRep::Register(want) => matches!(arg, Arg::Tmp(Tmp::Reg(g)) if *g == want),
        ValueRep::Stack(want) => matches!(arg, Arg::Addr { offset, .. } if *offset == want),
        ValueRep::Constant(want) => matches!(arg, Arg::Imm(v) if *v == want),
    }
}
