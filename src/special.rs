//! The contract between a patched instruction and the surrounding pipeline.
//!
//! A special owns everything the scheduler and allocator cannot know about a
//! `Patch` instruction: how its arguments are classified, whether a given
//! record is well-formed, and how code is emitted for it. The pipeline holds
//! specials behind this trait and never looks inside.

use crate::arch::{Assembler, Jump};
use crate::context::GenerationContext;
use crate::inst::{Arg, ArgRole, Bank, Inst, Width};
use crate::stackmap::Procedure;

pub trait Special {
    /// Report the role, bank, and width of every argument slot to `callback`.
    fn for_each_arg(
        &self,
        inst: &mut Inst,
        proc: &Procedure,
        callback: &mut dyn FnMut(usize, &mut Arg, ArgRole, Bank, Width),
    );

    /// Whether `inst` is a well-formed instance of this special. A false
    /// return means the instruction selector produced garbage; callers abort.
    fn is_valid(&self, inst: &Inst, proc: &Procedure) -> bool;

    /// Whether the argument at `arg_index` may be a stack address.
    fn admits_stack(&self, inst: &Inst, proc: &Procedure, arg_index: usize) -> bool;

    /// Whether the argument at `arg_index` may be an extended-offset address.
    fn admits_extended_offset_addr(
        &self,
        inst: &Inst,
        proc: &Procedure,
        arg_index: usize,
    ) -> bool;

    /// Hint to the allocator: the def slot that profits from aliasing a use.
    fn should_try_aliasing_def(&self, inst: &Inst) -> Option<usize>;

    /// Emit code for `inst`. The returned jump is unset when the
    /// instruction's control flow is handled out of band.
    fn generate(
        &self,
        inst: &Inst,
        asm: &mut Assembler,
        ctx: &mut GenerationContext<'_>,
    ) -> Jump;
}
