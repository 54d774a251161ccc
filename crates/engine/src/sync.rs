use std::sync::Arc;

use riptide_core::{
    CompileMode, ExecutionTier, FeatureSet, FunctionBody, FunctionToCompile, PipelineError,
};

use crate::native::NativeModule;
use crate::unit::UnitBuilder;
use crate::worker;

// Modules at or below this function count compile sequentially; driving the
// queues costs more than the work saves.
const SEQUENTIAL_FUNCTION_LIMIT: u32 = 2;

/// Blocking driver: compiles every declared function on (and around) the
/// caller thread, returning once baseline compilation is complete.
pub(crate) fn run_sync_driver(native: &Arc<NativeModule>) -> Result<(), PipelineError> {
    let n = native.module().num_declared_functions();
    if n == 0 {
        return Ok(());
    }
    if n <= SEQUENTIAL_FUNCTION_LIMIT {
        compile_sequential(native)
    } else {
        compile_parallel(native)
    }
}

fn required_body(native: &Arc<NativeModule>, declared_index: u32) -> FunctionBody {
    native.module().functions[declared_index as usize]
        .body
        .clone()
        .expect("decoded module is missing a function body")
}

// Iterate functions in module order; first failure latches and stops.
fn compile_sequential(native: &Arc<NativeModule>) -> Result<(), PipelineError> {
    let state = native.state();
    let module = state.module().clone();
    let wire = state.wire_bytes();
    let mut detected = FeatureSet::empty();

    for index in 0..module.num_declared_functions() {
        let body = required_body(native, index);
        let bytes = body.resolve(&wire).ok_or_else(|| {
            PipelineError::Resource(format!("function {index} body out of bounds"))
        })?;
        let result = state.generator().compile(
            FunctionToCompile {
                module: &module,
                func_index: index,
                tier: ExecutionTier::Baseline,
                body: bytes,
                body_offset: body.offset,
            },
            &mut detected,
            state.metrics(),
        );
        match result {
            Ok(code) => native.install_code(code),
            Err(err) => {
                let error = PipelineError::from_compile(&module, &err);
                state.set_error(error.clone());
                return Err(error);
            }
        }
    }
    state.publish_features(detected);
    Ok(())
}

// Publish all units, then alternate between the worker and finisher roles
// on the caller thread until baseline compilation is done.
fn compile_parallel(native: &Arc<NativeModule>) -> Result<(), PipelineError> {
    let state = native.state();
    let module = state.module().clone();
    let n = module.num_declared_functions();

    state.set_total(n);
    // Claim the finisher role before any unit exists so workers do not
    // post finisher tasks while the caller is draining.
    let claimed = state.set_finisher_running(true);
    debug_assert!(claimed);

    let mut builder = UnitBuilder::new(state.mode());
    for index in 0..n {
        builder.add(index, required_body(native, index));
    }
    builder.commit(state);

    let mut detected = FeatureSet::empty();
    while !state.failed() && !state.baseline_finished() {
        let mut progressed = false;

        // Finisher role.
        while let Some(unit) = state.next_finished() {
            progressed = true;
            if state.failed() {
                break;
            }
            crate::finisher::finish_unit(native, unit);
            if state.baseline_finished() {
                break;
            }
        }
        if state.failed() || state.baseline_finished() {
            break;
        }

        // Worker role.
        if worker::fetch_and_run(state, &module, &mut detected) {
            progressed = true;
        }

        if !progressed {
            // Units are in flight elsewhere. Run queued host tasks if the
            // runner is pump-driven, otherwise park until workers report.
            if !state.runner().pump() {
                state.wait_for_progress();
            }
        }
    }
    state.publish_features(detected);

    if let Some(error) = state.get_error() {
        return Err(error);
    }

    if state.mode() == CompileMode::Tiering {
        // Hand the finisher role back so background activity can keep
        // finishing top-tier units after this call returns.
        state.set_finisher_running(false);
        state.restart_workers(usize::MAX);
        if state.has_finished_units() && !state.failed() && state.set_finisher_running(true) {
            state.post_finisher_task();
        }
    }
    Ok(())
}
