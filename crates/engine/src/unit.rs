use std::sync::Arc;

use riptide_core::{Code, CompileError, CompileMode, ExecutionTier, FunctionBody};

use crate::state::CompilationState;

/// One function's compilation work at one target tier.
///
/// A unit is owned by exactly one location at any time: a pending queue, a
/// worker, or a finished queue.
#[derive(Debug)]
pub(crate) struct CompilationUnit {
    pub(crate) func_index: u32,
    pub(crate) tier: ExecutionTier,
    pub(crate) body: FunctionBody,
    pub(crate) result: Option<Result<Code, CompileError>>,
}

impl CompilationUnit {
    pub(crate) fn new(func_index: u32, tier: ExecutionTier, body: FunctionBody) -> Self {
        Self {
            func_index,
            tier,
            body,
            result: None,
        }
    }
}

/// Batches newly discovered functions into units and publishes them to the
/// compile-state atomically.
///
/// Must be empty (committed or cleared) before it is dropped.
pub(crate) struct UnitBuilder {
    mode: CompileMode,
    baseline: Vec<CompilationUnit>,
    tiering: Vec<CompilationUnit>,
}

impl UnitBuilder {
    pub(crate) fn new(mode: CompileMode) -> Self {
        Self {
            mode,
            baseline: Vec::new(),
            tiering: Vec::new(),
        }
    }

    /// Buffer the unit(s) for one function: one baseline-queue unit in
    /// regular mode, a baseline and an optimized unit in tiering mode.
    pub(crate) fn add(&mut self, func_index: u32, body: FunctionBody) {
        match self.mode {
            CompileMode::Regular => {
                self.baseline
                    .push(CompilationUnit::new(func_index, ExecutionTier::Baseline, body));
            }
            CompileMode::Tiering => {
                self.baseline.push(CompilationUnit::new(
                    func_index,
                    ExecutionTier::Baseline,
                    body.clone(),
                ));
                self.tiering.push(CompilationUnit::new(
                    func_index,
                    ExecutionTier::Optimized,
                    body,
                ));
            }
        }
    }

    /// Publish the buffered units. Returns `false` (and changes nothing)
    /// when the builder is empty.
    pub(crate) fn commit(&mut self, state: &Arc<CompilationState>) -> bool {
        if self.is_empty() {
            return false;
        }
        let baseline = std::mem::take(&mut self.baseline);
        let tiering = std::mem::take(&mut self.tiering);
        state.add_units(baseline, tiering);
        true
    }

    /// Discard the buffered units without publishing.
    pub(crate) fn clear(&mut self) {
        self.baseline.clear();
        self.tiering.clear();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.baseline.is_empty() && self.tiering.is_empty()
    }
}

impl Drop for UnitBuilder {
    fn drop(&mut self) {
        debug_assert!(self.is_empty(), "unit builder dropped with buffered units");
    }
}
