//! Code-generation context: the procedure being compiled plus the queue of
//! deferred failure-path emitters.

use crate::arch::Assembler;
use crate::stackmap::Procedure;

/// A deferred code emitter for a slow or failure path. Queued during primary
/// code generation, run after the whole primary body has been emitted.
pub type LatePath = Box<dyn FnOnce(&mut Assembler, &mut GenerationContext<'_>)>;

/// State threaded through code generation.
pub struct GenerationContext<'p> {
    pub proc: &'p mut Procedure,
    pub late_paths: Vec<LatePath>,
}

impl<'p> GenerationContext<'p> {
    pub fn new(proc: &'p mut Procedure) -> Self {
        GenerationContext {
            proc,
            late_paths: Vec::new(),
        }
    }

    pub fn add_late_path(
        &mut self,
        path: impl FnOnce(&mut Assembler, &mut GenerationContext<'_>) + 'static,
    ) {
        self.late_paths.push(Box::new(path));
    }

    /// Run all queued late paths in registration order. Paths registered by
    /// a running path are picked up too.
    pub fn drain_late_paths(&mut self, asm: &mut Assembler) {
        while !self.late_paths.is_empty() {
            let paths = std::mem::take(&mut self.late_paths);
            for path in paths {
                path(asm, self);
            }
        }
    }
}
