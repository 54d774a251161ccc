use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use riptide_core::{
    CompileMode, Decoder, Module, ModuleOrigin, PipelineError, WireBytes,
};

use crate::api::{CompileResolver, PipelineEngine};
use crate::events::CompilationEvent;
use crate::lazy;
use crate::native::{ModuleObject, NativeModule};
use crate::state::CompilationState;
use crate::task::TaskGroup;
use crate::unit::UnitBuilder;

/// Live async/streaming jobs of one engine, keyed by job id. The registry
/// holds the only strong reference to a job; everything else points back
/// weakly, so removal is release.
#[derive(Default)]
pub(crate) struct JobRegistry {
    next: AtomicU64,
    jobs: Mutex<HashMap<u64, Arc<AsyncCompileJob>>>,
}

impl JobRegistry {
    pub(crate) fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register(&self, job: Arc<AsyncCompileJob>) {
        self.jobs
            .lock()
            .expect("job registry poisoned")
            .insert(job.id, job);
    }

    pub(crate) fn remove(&self, id: u64) {
        self.jobs.lock().expect("job registry poisoned").remove(&id);
    }

    pub(crate) fn get(&self, id: u64) -> Option<Arc<AsyncCompileJob>> {
        self.jobs.lock().expect("job registry poisoned").get(&id).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.jobs.lock().expect("job registry poisoned").len()
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        self.jobs.lock().expect("job registry poisoned").contains_key(&id)
    }
}

// Validity token of the single pending foreground step task. Cancellation
// invalidates the token; the queued task then runs as a no-op.
pub(crate) struct ForegroundToken {
    valid: AtomicBool,
}

impl ForegroundToken {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            valid: AtomicBool::new(true),
        })
    }

    fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    fn valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }
}

// One sequenced step of the async pipeline. A closed enum: transitions are
// tagged-value constructions, each scheduled as exactly one foreground or
// background task.
enum CompileStep {
    Decode { bytes: WireBytes },
    PrepareAndStartCompile { module: Arc<Module>, wire: WireBytes },
    CompileWrappers,
    FinishModule,
    Fail { error: PipelineError },
}

impl CompileStep {
    fn name(&self) -> &'static str {
        match self {
            CompileStep::Decode { .. } => "Decode",
            CompileStep::PrepareAndStartCompile { .. } => "PrepareAndStartCompile",
            CompileStep::CompileWrappers => "CompileWrappers",
            CompileStep::FinishModule => "FinishModule",
            CompileStep::Fail { .. } => "Fail",
        }
    }
}

struct JobInner {
    pending_foreground: Option<Arc<ForegroundToken>>,
    outstanding_finishers: u32,
    native: Option<Arc<NativeModule>>,
    module_object: Option<Arc<ModuleObject>>,
}

/// A non-blocking compilation job: an ordered step machine driven by
/// foreground and background tasks plus the compile-state event callback.
pub(crate) struct AsyncCompileJob {
    id: u64,
    engine: Weak<PipelineEngine>,
    origin: ModuleOrigin,
    resolver: Mutex<Option<Box<dyn CompileResolver>>>,
    // Background decode tasks; cancelled when decoding is superseded or
    // the job is aborted.
    decode_tasks: Arc<TaskGroup>,
    aborted: AtomicBool,
    inner: Mutex<JobInner>,
}

impl AsyncCompileJob {
    fn new(
        engine: &Arc<PipelineEngine>,
        origin: ModuleOrigin,
        resolver: Box<dyn CompileResolver>,
    ) -> Arc<Self> {
        let job = Arc::new(Self {
            id: engine.jobs().next_id(),
            engine: Arc::downgrade(engine),
            origin,
            resolver: Mutex::new(Some(resolver)),
            decode_tasks: TaskGroup::new(),
            aborted: AtomicBool::new(false),
            inner: Mutex::new(JobInner {
                pending_foreground: None,
                outstanding_finishers: 0,
                native: None,
                module_object: None,
            }),
        });
        engine.jobs().register(job.clone());
        job
    }

    /// Register and start a bulk async job.
    pub(crate) fn start(
        engine: &Arc<PipelineEngine>,
        bytes: WireBytes,
        origin: ModuleOrigin,
        resolver: Box<dyn CompileResolver>,
    ) -> u64 {
        let job = Self::new(engine, origin, resolver);
        job.schedule_background(CompileStep::Decode { bytes });
        job.id
    }

    /// Register a streaming job; the streaming processor drives it.
    pub(crate) fn start_streaming(
        engine: &Arc<PipelineEngine>,
        origin: ModuleOrigin,
        resolver: Box<dyn CompileResolver>,
    ) -> Arc<Self> {
        Self::new(engine, origin, resolver)
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn origin(&self) -> ModuleOrigin {
        self.origin
    }

    pub(crate) fn state(&self) -> Option<Arc<CompilationState>> {
        self.lock().native.as_ref().map(|n| n.state().clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JobInner> {
        self.inner.lock().expect("job poisoned")
    }

    fn schedule_foreground(self: &Arc<Self>, step: CompileStep) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let token = ForegroundToken::new();
        {
            let mut inner = self.lock();
            // At most one step task is pending; a newly scheduled step
            // supersedes it (failure overtakes in-flight success steps).
            if let Some(prev) = inner.pending_foreground.take() {
                prev.invalidate();
            }
            inner.pending_foreground = Some(token.clone());
        }
        let job = self.clone();
        engine.runner().post_foreground(Box::new(move || {
            {
                let mut inner = job.lock();
                if inner
                    .pending_foreground
                    .as_ref()
                    .is_some_and(|t| Arc::ptr_eq(t, &token))
                {
                    inner.pending_foreground = None;
                }
            }
            if token.valid() {
                job.run_step(step);
            }
        }));
    }

    fn schedule_background(self: &Arc<Self>, step: CompileStep) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let job = self.clone();
        let task = self.decode_tasks.wrap(move || job.run_step(step));
        if engine.config().num_compilation_tasks == 0 {
            engine.runner().post_foreground(task);
        } else {
            engine.runner().post_worker(task);
        }
    }

    fn run_step(self: &Arc<Self>, step: CompileStep) {
        if self.aborted.load(Ordering::Acquire) {
            return;
        }
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        tracing::trace!(target: "riptide::compile", job = self.id, step = step.name(), "job step");
        match step {
            CompileStep::Decode { bytes } => {
                let decoder = Decoder::new(self.origin, engine.enabled());
                match decoder.decode_module(bytes.as_slice()) {
                    Ok(module) => self.schedule_foreground(CompileStep::PrepareAndStartCompile {
                        module: Arc::new(module),
                        wire: bytes,
                    }),
                    Err(err) => self.schedule_foreground(CompileStep::Fail { error: err.into() }),
                }
            }
            CompileStep::PrepareAndStartCompile { module, wire } => {
                self.prepare_and_start_compile(&engine, module, wire, 1, true);
            }
            CompileStep::CompileWrappers => self.compile_wrappers(&engine),
            CompileStep::FinishModule => self.finish_module(&engine),
            CompileStep::Fail { error } => self.fail(&engine, error),
        }
    }

    /// Create the native-module and module-object skeletons, register the
    /// event callback, and initialize compilation. `outstanding_finishers`
    /// is the number of producers that must report before the module can
    /// finish (one for bulk; two for streaming, where the byte stream and
    /// the compilation callback race). With `publish_units`, every function
    /// is published at once; the streaming processor passes `false` and
    /// publishes bodies as they arrive.
    pub(crate) fn prepare_and_start_compile(
        self: &Arc<Self>,
        engine: &Arc<PipelineEngine>,
        module: Arc<Module>,
        wire: WireBytes,
        outstanding_finishers: u32,
        publish_units: bool,
    ) {
        // Straggler decode tasks are superseded from here on.
        self.decode_tasks.cancel();

        let state = engine.new_state(module.clone(), wire);
        let native = NativeModule::new(module.clone(), state.clone(), engine.config().trap_handler_mode);
        let module_object = ModuleObject::new(native.clone());
        {
            let mut inner = self.lock();
            inner.outstanding_finishers = outstanding_finishers;
            inner.native = Some(native.clone());
            inner.module_object = Some(module_object);
        }

        let weak = Arc::downgrade(self);
        state.add_callback(Box::new(move |event| {
            if let Some(job) = weak.upgrade() {
                job.on_compilation_event(event);
            }
        }));

        if engine.config().lazy_compilation && publish_units {
            match lazy::prepare_lazy_module(&native) {
                Ok(()) => self.finisher_done(),
                Err(error) => self.schedule_foreground(CompileStep::Fail { error }),
            }
            return;
        }

        let n = module.num_declared_functions();
        if n == 0 {
            // Nothing to compile: this producer is done immediately; the
            // final notification comes from the driver, not an event.
            self.finisher_done();
            return;
        }

        state.set_total(n);
        if !publish_units {
            return;
        }
        let mut builder = UnitBuilder::new(state.mode());
        for index in 0..n {
            let body = module.functions[index as usize]
                .body
                .clone()
                .expect("decoded module is missing a function body");
            builder.add(index, body);
        }
        builder.commit(&state);
    }

    // Compile-state event callback; runs on the foreground.
    fn on_compilation_event(self: &Arc<Self>, event: CompilationEvent) {
        match event {
            CompilationEvent::FinishedBaselineCompilation => self.finisher_done(),
            CompilationEvent::FinishedTopTierCompilation => {
                let Some(engine) = self.engine.upgrade() else {
                    return;
                };
                let idle = {
                    let inner = self.lock();
                    inner.pending_foreground.is_none() && inner.outstanding_finishers == 0
                };
                if idle {
                    engine.jobs().remove(self.id);
                }
            }
            CompilationEvent::FailedCompilation => {
                let error = self
                    .state()
                    .and_then(|state| state.get_error())
                    .unwrap_or(PipelineError::Aborted);
                self.schedule_foreground(CompileStep::Fail { error });
            }
        }
    }

    /// One of the producers gating module completion reported done. When
    /// the latch reaches zero, wrapper compilation is scheduled.
    pub(crate) fn finisher_done(self: &Arc<Self>) {
        let ready = {
            let mut inner = self.lock();
            debug_assert!(inner.outstanding_finishers > 0, "finisher latch underflow");
            inner.outstanding_finishers = inner.outstanding_finishers.saturating_sub(1);
            inner.outstanding_finishers == 0
        };
        if ready {
            self.schedule_foreground(CompileStep::CompileWrappers);
        }
    }

    fn compile_wrappers(self: &Arc<Self>, engine: &Arc<PipelineEngine>) {
        let (native, module_object) = {
            let inner = self.lock();
            (inner.native.clone(), inner.module_object.clone())
        };
        if let (Some(native), Some(module_object)) = (native, module_object) {
            let module = native.module();
            let wrappers = module
                .exported_function_signatures()
                .into_iter()
                .map(|sig| engine.wrappers().compile_js_to_wasm(module, sig, false))
                .collect();
            module_object.set_export_wrappers(wrappers);
        }
        self.schedule_foreground(CompileStep::FinishModule);
    }

    fn finish_module(self: &Arc<Self>, engine: &Arc<PipelineEngine>) {
        let module_object = self.lock().module_object.clone();
        let Some(module_object) = module_object else {
            engine.jobs().remove(self.id);
            return;
        };
        if let Some(resolver) = self.take_resolver() {
            resolver.on_success(module_object);
        }
        let done = match self.state() {
            None => true,
            Some(state) => {
                state.mode() == CompileMode::Regular || !state.has_outstanding_units()
            }
        };
        if done {
            engine.jobs().remove(self.id);
        }
        // Otherwise top-tier work is still running; the
        // FinishedTopTierCompilation callback removes the job.
    }

    fn fail(self: &Arc<Self>, engine: &Arc<PipelineEngine>, error: PipelineError) {
        if let Some(state) = self.state() {
            state.cancel_background();
        }
        if let Some(resolver) = self.take_resolver() {
            resolver.on_failure(error);
        }
        engine.jobs().remove(self.id);
    }

    fn take_resolver(&self) -> Option<Box<dyn CompileResolver>> {
        self.resolver.lock().expect("resolver poisoned").take()
    }

    /// Abort the job: invalidate the pending step, join background tasks,
    /// reject the resolver, and deregister. Idempotent.
    pub(crate) fn abort(self: &Arc<Self>) {
        self.aborted.store(true, Ordering::Release);
        {
            let mut inner = self.lock();
            if let Some(token) = inner.pending_foreground.take() {
                token.invalidate();
            }
        }
        self.decode_tasks.cancel_and_wait();
        if let Some(state) = self.state() {
            state.abort();
        }
        if let Some(resolver) = self.take_resolver() {
            resolver.on_failure(PipelineError::Aborted);
        }
        if let Some(engine) = self.engine.upgrade() {
            engine.jobs().remove(self.id);
        }
    }

    /// Install the finalized stream bytes in the compile-state.
    pub(crate) fn set_wire_bytes(&self, wire: WireBytes) {
        if let Some(state) = self.state() {
            state.set_wire_bytes(wire);
        }
    }

    /// Route a streaming decode failure through the step machine.
    pub(crate) fn fail_with(self: &Arc<Self>, error: PipelineError) {
        self.schedule_foreground(CompileStep::Fail { error });
    }
}
