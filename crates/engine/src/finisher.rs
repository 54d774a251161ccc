use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::native::NativeModule;
use crate::state::CompilationState;
use crate::unit::CompilationUnit;

// Foreground budget before the finisher yields to the host event loop.
const FINISHER_DEADLINE: Duration = Duration::from_millis(1);

/// Foreground finisher: drains completed units, installs their code, and
/// counts them down. At most one finisher body runs at a time, enforced by
/// the compile-state's finisher flag.
pub(crate) fn run_finish_loop(native: &Arc<NativeModule>) {
    let state = native.state();
    let started = Instant::now();
    loop {
        // Keep the worker pool saturated while the foreground drains.
        state.restart_workers(usize::MAX);

        let Some(unit) = next_unit_or_exit(state) else {
            return;
        };
        if state.failed() {
            // The latch is set; nothing further gets installed. Remaining
            // units are drained when the state goes away.
            return;
        }
        finish_unit(native, unit);

        if started.elapsed() >= FINISHER_DEADLINE {
            // Yield cooperatively. The flag stays claimed, so no competing
            // finisher can start before the continuation runs.
            state.post_finisher_task();
            return;
        }
    }
}

// Exit protocol: clear the flag, re-check for late schedulers, re-claim if
// work appeared.
fn next_unit_or_exit(state: &Arc<CompilationState>) -> Option<CompilationUnit> {
    if let Some(unit) = state.next_finished() {
        return Some(unit);
    }
    state.set_finisher_running(false);
    let unit = state.next_finished()?;
    if state.set_finisher_running(true) {
        Some(unit)
    } else {
        // A late scheduler won the flag and posted its own task.
        state.requeue_finished(unit);
        None
    }
}

pub(crate) fn finish_unit(native: &Arc<NativeModule>, unit: CompilationUnit) {
    let state = native.state();
    let tier = unit.tier;
    match unit.result {
        Some(Ok(code)) => {
            if state.trace_compiler() {
                tracing::trace!(
                    target: "riptide::compile",
                    func_index = code.func_index(),
                    ?tier,
                    "installing code"
                );
            }
            native.install_code(code);
            state.on_finished_unit(tier);
        }
        // The worker latched the error; an errored unit is never counted
        // as finalized.
        Some(Err(_)) | None => {}
    }
}
