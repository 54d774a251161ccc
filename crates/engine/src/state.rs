use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, RwLock, Weak};
use std::time::Duration;

use riptide_core::{
    CodeGenerator, CompileMetrics, CompileMode, ExecutionTier, FeatureSet, Module, PipelineError,
    WireBytes,
};

use crate::api::EventHook;
use crate::events::{CompilationEvent, EventSink};
use crate::finisher;
use crate::native::NativeModule;
use crate::task::{TaskGroup, TaskRunner};
use crate::unit::CompilationUnit;
use crate::worker;

/// Everything needed to build a [`CompilationState`].
pub(crate) struct StateOptions {
    pub(crate) module: Arc<Module>,
    pub(crate) mode: CompileMode,
    pub(crate) wire: WireBytes,
    pub(crate) runner: Arc<TaskRunner>,
    pub(crate) generator: Arc<dyn CodeGenerator>,
    pub(crate) max_workers: usize,
    pub(crate) foreground_only: bool,
    pub(crate) trace_compiler: bool,
    pub(crate) event_hook: Option<EventHook>,
}

// Queue, counter, and accounting fields guarded by the state mutex.
#[derive(Default)]
struct StateInner {
    pending_baseline: Vec<CompilationUnit>,
    pending_tiering: Vec<CompilationUnit>,
    finished_baseline: Vec<CompilationUnit>,
    finished_tiering: Vec<CompilationUnit>,
    outstanding_baseline: u32,
    outstanding_tiering: u32,
    total_set: bool,
    detected: FeatureSet,
    workers_running: usize,
}

/// Per-module coordinator of the compilation pipeline.
///
/// Holds the unit queues, completion counters, the at-most-once error
/// latch, event callbacks, and worker accounting. Shared between the
/// driver, background workers, and foreground finisher tasks.
pub(crate) struct CompilationState {
    module: Arc<Module>,
    mode: CompileMode,
    max_workers: usize,
    foreground_only: bool,
    trace_compiler: bool,

    inner: Mutex<StateInner>,
    progress: Condvar,

    failed: AtomicBool,
    error: OnceLock<PipelineError>,
    finisher_running: AtomicBool,

    callbacks: Mutex<Vec<EventSink>>,
    wire: RwLock<WireBytes>,

    runner: Arc<TaskRunner>,
    generator: Arc<dyn CodeGenerator>,
    metrics: CompileMetrics,

    background: Arc<TaskGroup>,
    foreground: Arc<TaskGroup>,

    native: OnceLock<Weak<NativeModule>>,
}

impl CompilationState {
    pub(crate) fn new(options: StateOptions) -> Arc<Self> {
        let state = Arc::new(Self {
            module: options.module,
            mode: options.mode,
            max_workers: options.max_workers.max(1),
            foreground_only: options.foreground_only,
            trace_compiler: options.trace_compiler,
            inner: Mutex::new(StateInner::default()),
            progress: Condvar::new(),
            failed: AtomicBool::new(false),
            error: OnceLock::new(),
            finisher_running: AtomicBool::new(false),
            callbacks: Mutex::new(Vec::new()),
            wire: RwLock::new(options.wire),
            runner: options.runner,
            generator: options.generator,
            metrics: CompileMetrics::default(),
            background: TaskGroup::new(),
            foreground: TaskGroup::new(),
            native: OnceLock::new(),
        });
        if let Some(hook) = options.event_hook {
            state.add_callback(Box::new(move |event| hook(event)));
        }
        state
    }

    /// Connect the native module the finisher installs into. Called once,
    /// right after construction.
    pub(crate) fn attach_native(&self, native: &Arc<NativeModule>) {
        let _ = self.native.set(Arc::downgrade(native));
    }

    pub(crate) fn module(&self) -> &Arc<Module> {
        &self.module
    }

    pub(crate) fn mode(&self) -> CompileMode {
        self.mode
    }

    pub(crate) fn generator(&self) -> &Arc<dyn CodeGenerator> {
        &self.generator
    }

    pub(crate) fn metrics(&self) -> &CompileMetrics {
        &self.metrics
    }

    pub(crate) fn runner(&self) -> &Arc<TaskRunner> {
        &self.runner
    }

    pub(crate) fn trace_compiler(&self) -> bool {
        self.trace_compiler
    }

    pub(crate) fn wire_bytes(&self) -> WireBytes {
        self.wire.read().expect("wire bytes poisoned").clone()
    }

    /// Install the shared wire-bytes handle (streaming finalization).
    pub(crate) fn set_wire_bytes(&self, wire: WireBytes) {
        *self.wire.write().expect("wire bytes poisoned") = wire;
    }

    /// Register an event sink. Foreground only.
    pub(crate) fn add_callback(&self, sink: EventSink) {
        self.callbacks.lock().expect("callbacks poisoned").push(sink);
    }

    fn fire_event(&self, event: CompilationEvent) {
        if self.trace_compiler {
            tracing::debug!(target: "riptide::compile", ?event, "compilation event");
        }
        let mut callbacks = self.callbacks.lock().expect("callbacks poisoned");
        for callback in callbacks.iter() {
            callback(event);
        }
        if event.is_final() {
            callbacks.clear();
        }
    }

    /// Initialize the outstanding counters. Must be called exactly once,
    /// before the first `add_units`. Returns `false` if the state already
    /// has units, totals, or an error.
    pub(crate) fn set_total(&self, n: u32) -> bool {
        if self.failed() {
            return false;
        }
        let mut inner = self.lock();
        if inner.total_set
            || !inner.pending_baseline.is_empty()
            || !inner.pending_tiering.is_empty()
        {
            return false;
        }
        inner.total_set = true;
        inner.outstanding_baseline = n;
        if self.mode == CompileMode::Tiering {
            inner.outstanding_tiering = n;
        }
        true
    }

    /// Append published units and wake as many workers as the pool allows.
    pub(crate) fn add_units(
        self: &Arc<Self>,
        baseline: Vec<CompilationUnit>,
        tiering: Vec<CompilationUnit>,
    ) {
        if self.failed() {
            return;
        }
        {
            let mut inner = self.lock();
            debug_assert!(inner.total_set, "add_units before set_total");
            inner.pending_baseline.extend(baseline);
            inner.pending_tiering.extend(tiering);
        }
        self.progress.notify_all();
        self.restart_workers(usize::MAX);
    }

    /// Pop the next unit to compile, baseline first.
    pub(crate) fn next_unit(&self) -> Option<CompilationUnit> {
        let mut inner = self.lock();
        inner
            .pending_baseline
            .pop()
            .or_else(|| inner.pending_tiering.pop())
    }

    /// Number of units still pending (both queues).
    #[cfg(test)]
    pub(crate) fn num_pending_units(&self) -> usize {
        let inner = self.lock();
        inner.pending_baseline.len() + inner.pending_tiering.len()
    }

    // The currently active finished stack: baseline until the baseline
    // units are fully drained and counted down, then tiering.
    fn active_finished(inner: &mut StateInner) -> &mut Vec<CompilationUnit> {
        if inner.outstanding_baseline > 0 {
            &mut inner.finished_baseline
        } else if !inner.finished_baseline.is_empty() {
            &mut inner.finished_baseline
        } else {
            &mut inner.finished_tiering
        }
    }

    /// Pop the next finished unit awaiting finalization.
    pub(crate) fn next_finished(&self) -> Option<CompilationUnit> {
        let mut inner = self.lock();
        Self::active_finished(&mut inner).pop()
    }

    /// Whether the active finished stack has units ready.
    pub(crate) fn has_finished_units(&self) -> bool {
        let mut inner = self.lock();
        !Self::active_finished(&mut inner).is_empty()
    }

    /// Put a popped finished unit back (finisher exit-protocol race).
    pub(crate) fn requeue_finished(&self, unit: CompilationUnit) {
        let mut inner = self.lock();
        match unit.tier {
            ExecutionTier::Baseline => inner.finished_baseline.push(unit),
            ExecutionTier::Optimized => inner.finished_tiering.push(unit),
        }
        drop(inner);
        self.progress.notify_all();
    }

    /// Queue a compiled unit for foreground finalization and make sure a
    /// finisher task is running.
    pub(crate) fn schedule_for_finishing(&self, unit: CompilationUnit, tier: ExecutionTier) {
        {
            let mut inner = self.lock();
            match tier {
                ExecutionTier::Baseline => inner.finished_baseline.push(unit),
                ExecutionTier::Optimized => inner.finished_tiering.push(unit),
            }
        }
        self.progress.notify_all();
        if !self.failed() && self.set_finisher_running(true) {
            self.post_finisher_task();
        }
    }

    /// Post a foreground finisher task (the flag is already claimed).
    pub(crate) fn post_finisher_task(&self) {
        let Some(native) = self.native.get().and_then(Weak::upgrade) else {
            // The module is gone; nothing left to install into.
            self.background.cancel();
            return;
        };
        let task = self
            .foreground
            .wrap(move || finisher::run_finish_loop(&native));
        self.runner.post_foreground(task);
    }

    /// Count one finalized unit and fire completion events.
    pub(crate) fn on_finished_unit(&self, tier: ExecutionTier) {
        let mut events: [Option<CompilationEvent>; 2] = [None, None];
        {
            let mut inner = self.lock();
            match tier {
                ExecutionTier::Baseline => {
                    debug_assert!(inner.outstanding_baseline > 0);
                    inner.outstanding_baseline -= 1;
                    if inner.outstanding_baseline == 0 {
                        events[0] = Some(CompilationEvent::FinishedBaselineCompilation);
                        if inner.outstanding_tiering == 0 {
                            events[1] = Some(CompilationEvent::FinishedTopTierCompilation);
                        }
                    }
                }
                ExecutionTier::Optimized => {
                    debug_assert!(inner.outstanding_tiering > 0);
                    inner.outstanding_tiering -= 1;
                    if inner.outstanding_tiering == 0 && inner.outstanding_baseline == 0 {
                        events[1] = Some(CompilationEvent::FinishedTopTierCompilation);
                    }
                }
            }
        }
        self.progress.notify_all();
        if self.failed() {
            return;
        }
        for event in events.into_iter().flatten() {
            self.fire_event(event);
        }
    }

    /// Whether the error latch is set. Cheap; safe to poll from worker
    /// loops.
    pub(crate) fn failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    /// The latched error, if any.
    pub(crate) fn get_error(&self) -> Option<PipelineError> {
        self.error.get().cloned()
    }

    /// Latch an error. The first call wins and posts a foreground task
    /// firing `FailedCompilation`; later calls are ignored.
    pub(crate) fn set_error(self: &Arc<Self>, error: PipelineError) {
        if self.error.set(error).is_err() {
            return;
        }
        self.failed.store(true, Ordering::Release);
        self.progress.notify_all();
        let state = self.clone();
        let task = self
            .foreground
            .wrap(move || state.fire_event(CompilationEvent::FailedCompilation));
        self.runner.post_foreground(task);
    }

    /// Latch a generic abort error, cancel background tasks and wait for
    /// them, then release callback resources on the foreground. Idempotent.
    pub(crate) fn abort(self: &Arc<Self>) {
        if self.error.set(PipelineError::Aborted).is_ok() {
            self.failed.store(true, Ordering::Release);
        }
        self.progress.notify_all();
        self.background.cancel_and_wait();
        let state = self.clone();
        let task = self.foreground.wrap(move || {
            state.callbacks.lock().expect("callbacks poisoned").clear();
        });
        self.runner.post_foreground(task);
    }

    /// Block until every background and foreground task of this state has
    /// completed or been cancelled. Idempotent.
    pub(crate) fn cancel_and_wait(&self) {
        self.background.cancel_and_wait();
        self.foreground.cancel_and_wait();
    }

    pub(crate) fn background_cancelled(&self) -> bool {
        self.background.cancelled()
    }

    /// Flag background tasks to stop without waiting for them.
    pub(crate) fn cancel_background(&self) {
        self.background.cancel();
    }

    /// Spawn up to `max` workers, bounded by pending units and the pool
    /// limit.
    pub(crate) fn restart_workers(self: &Arc<Self>, max: usize) {
        if self.failed() || self.background.cancelled() {
            return;
        }
        let spawn = {
            let mut inner = self.lock();
            let pending = inner.pending_baseline.len() + inner.pending_tiering.len();
            let headroom = self.max_workers.saturating_sub(inner.workers_running);
            let spawn = max.min(pending).min(headroom);
            inner.workers_running += spawn;
            spawn
        };
        for _ in 0..spawn {
            let state = self.clone();
            let slot = self.clone();
            let task = self.background.wrap_with_cancel(
                move || worker::run_worker(&state),
                move || slot.on_worker_cancelled(),
            );
            if self.foreground_only {
                self.runner.post_foreground(task);
            } else {
                self.runner.post_worker(task);
            }
        }
    }

    /// A worker exited: release its slot and merge its detected features.
    pub(crate) fn on_worker_stopped(&self, detected: FeatureSet) {
        let mut inner = self.lock();
        debug_assert!(inner.workers_running > 0);
        inner.workers_running = inner.workers_running.saturating_sub(1);
        inner.detected = inner.detected.union(detected);
        drop(inner);
        self.progress.notify_all();
    }

    /// A cancelled worker task released its slot without running.
    pub(crate) fn on_worker_cancelled(&self) {
        self.on_worker_stopped(FeatureSet::empty());
    }

    pub(crate) fn num_workers_running(&self) -> usize {
        self.lock().workers_running
    }

    /// Compare-and-set the finisher flag; returns whether the value
    /// changed.
    pub(crate) fn set_finisher_running(&self, value: bool) -> bool {
        self.finisher_running
            .compare_exchange(!value, value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Union detected features and report usage to the host.
    pub(crate) fn publish_features(&self, detected: FeatureSet) {
        let merged = {
            let mut inner = self.lock();
            inner.detected = inner.detected.union(detected);
            inner.detected
        };
        if self.trace_compiler && !merged.is_empty() {
            tracing::debug!(target: "riptide::compile", features = ?merged, "detected features");
        }
    }

    pub(crate) fn detected_features(&self) -> FeatureSet {
        self.lock().detected
    }

    /// Whether every baseline-queue unit has been finalized.
    pub(crate) fn baseline_finished(&self) -> bool {
        let inner = self.lock();
        inner.total_set && inner.outstanding_baseline == 0
    }

    /// Whether units were published and some are still unfinalized.
    pub(crate) fn has_outstanding_units(&self) -> bool {
        let inner = self.lock();
        inner.total_set && (inner.outstanding_baseline > 0 || inner.outstanding_tiering > 0)
    }

    /// Whether every unit of every tier has been finalized.
    #[cfg(test)]
    pub(crate) fn top_tier_finished(&self) -> bool {
        let inner = self.lock();
        inner.total_set && inner.outstanding_baseline == 0 && inner.outstanding_tiering == 0
    }

    /// Outstanding (baseline, tiering) counters, for assertions.
    #[cfg(test)]
    pub(crate) fn outstanding(&self) -> (u32, u32) {
        let inner = self.lock();
        (inner.outstanding_baseline, inner.outstanding_tiering)
    }

    /// Park the calling thread until queue or counter state changes. The
    /// caller re-checks its condition; a periodic wake bounds the wait.
    pub(crate) fn wait_for_progress(&self) {
        let inner = self.lock();
        let _unused = self
            .progress
            .wait_timeout(inner, Duration::from_millis(50))
            .expect("compile state poisoned");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StateInner> {
        self.inner.lock().expect("compile state poisoned")
    }
}
