use std::sync::Arc;

use riptide_core::{CompileError, FeatureSet, FunctionToCompile, Module, PipelineError, WireBytes};

use crate::state::CompilationState;

/// Body of one background compilation worker.
///
/// Pulls units until the queues run dry, the error latch is set, or the
/// state is cancelled, then releases its pool slot. Workers hold no locks
/// while the generator runs and never touch host-heap objects.
pub(crate) fn run_worker(state: &Arc<CompilationState>) {
    let mut detected = FeatureSet::empty();
    let module = state.module().clone();
    while !state.failed() && !state.background_cancelled() {
        if !fetch_and_run(state, &module, &mut detected) {
            break;
        }
    }
    state.on_worker_stopped(detected);
}

/// Compile one pending unit. Returns `false` when no unit was available.
pub(crate) fn fetch_and_run(
    state: &Arc<CompilationState>,
    module: &Arc<Module>,
    detected: &mut FeatureSet,
) -> bool {
    let Some(mut unit) = state.next_unit() else {
        return false;
    };
    let tier = unit.tier;

    // The handle is re-read per unit: streaming replaces it with the
    // finalized bytes while compilation is already under way.
    let wire: WireBytes = state.wire_bytes();
    let result = match unit.body.resolve(&wire) {
        Some(body) => state.generator().compile(
            FunctionToCompile {
                module,
                func_index: unit.func_index,
                tier,
                body,
                body_offset: unit.body.offset,
            },
            detected,
            state.metrics(),
        ),
        None => Err(CompileError::new(
            unit.func_index,
            unit.body.offset,
            "function body out of bounds",
        )),
    };

    match &result {
        Ok(code) => {
            if state.trace_compiler() {
                tracing::trace!(
                    target: "riptide::compile",
                    func_index = unit.func_index,
                    ?tier,
                    code_bytes = code.bytes().len(),
                    "generated code"
                );
            }
        }
        Err(err) => {
            // The unit keeps the error as its result; the first worker to
            // get here wins the latch race.
            state.set_error(PipelineError::from_compile(module, err));
        }
    }

    unit.result = Some(result);
    state.schedule_for_finishing(unit, tier);
    true
}
