use std::sync::{Arc, Mutex};

use riptide_core::{
    CodeGenerator, CompileConfig, Decoder, FeatureSet, Module, ModuleOrigin, PipelineError,
    WireBytes, WrapperGenerator,
};
use tokio::sync::oneshot;

use crate::events::CompilationEvent;
use crate::job::{AsyncCompileJob, JobRegistry};
use crate::native::{ModuleObject, NativeModule};
use crate::state::{CompilationState, StateOptions};
use crate::streaming::StreamingHandle;
use crate::task::TaskRunner;
use crate::{lazy, streaming, sync};

/// Observer invoked for every compilation event of every module compiled by
/// an engine. Runs on the foreground.
pub type EventHook = Arc<dyn Fn(CompilationEvent) + Send + Sync + 'static>;

/// External continuation for an async or streaming compilation.
pub trait CompileResolver: Send + Sync + 'static {
    /// The module compiled; deliver it.
    fn on_success(&self, module: Arc<ModuleObject>);
    /// The compilation failed; deliver the error.
    fn on_failure(&self, error: PipelineError);
}

/// Configuration for [`PipelineEngine::new`].
pub struct EngineOptions {
    /// The host task runner.
    pub runner: Arc<TaskRunner>,
    /// Function-level code generator.
    pub generator: Arc<dyn CodeGenerator>,
    /// JS↔Wasm adapter generator.
    pub wrappers: Arc<dyn WrapperGenerator>,
    /// Features accepted by the decoder and generator.
    pub enabled_features: FeatureSet,
    /// Runtime configuration.
    pub config: CompileConfig,
    /// Optional event observer.
    pub event_hook: Option<EventHook>,
}

/// The compilation pipeline of the engine: owns the job registry and the
/// shared collaborators, and exposes the three ingestion modes.
pub struct PipelineEngine {
    runner: Arc<TaskRunner>,
    generator: Arc<dyn CodeGenerator>,
    wrappers: Arc<dyn WrapperGenerator>,
    enabled: FeatureSet,
    config: CompileConfig,
    event_hook: Option<EventHook>,
    jobs: JobRegistry,
}

impl PipelineEngine {
    /// Build an engine.
    pub fn new(options: EngineOptions) -> Arc<Self> {
        Arc::new(Self {
            runner: options.runner,
            generator: options.generator,
            wrappers: options.wrappers,
            enabled: options.enabled_features,
            config: options.config,
            event_hook: options.event_hook,
            jobs: JobRegistry::default(),
        })
    }

    /// The engine configuration.
    pub fn config(&self) -> &CompileConfig {
        &self.config
    }

    /// The host task runner.
    pub fn runner(&self) -> &Arc<TaskRunner> {
        &self.runner
    }

    /// Number of async/streaming jobs currently registered.
    pub fn num_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Whether the job is still registered (not yet finished or aborted).
    pub fn has_job(&self, id: u64) -> bool {
        self.jobs.contains(id)
    }

    pub(crate) fn generator(&self) -> &Arc<dyn CodeGenerator> {
        &self.generator
    }

    pub(crate) fn wrappers(&self) -> &Arc<dyn WrapperGenerator> {
        &self.wrappers
    }

    pub(crate) fn enabled(&self) -> FeatureSet {
        self.enabled
    }

    pub(crate) fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    pub(crate) fn new_state(
        &self,
        module: Arc<Module>,
        wire: WireBytes,
    ) -> Arc<CompilationState> {
        let mode = self.config.mode_for(module.origin);
        CompilationState::new(StateOptions {
            module,
            mode,
            wire,
            runner: self.runner.clone(),
            generator: self.generator.clone(),
            max_workers: self.config.max_workers(self.runner.worker_slots()),
            foreground_only: self.config.num_compilation_tasks == 0,
            trace_compiler: self.config.trace.compiler,
            event_hook: self.event_hook.clone(),
        })
    }

    /// Compile a module, blocking the caller until baseline compilation is
    /// complete (in tiering mode, top-tier work continues in the
    /// background).
    pub fn compile_sync(
        &self,
        bytes: &[u8],
        origin: ModuleOrigin,
    ) -> Result<Arc<NativeModule>, PipelineError> {
        let decoder = Decoder::new(origin, self.enabled);
        let module = Arc::new(decoder.decode_module(bytes)?);
        let state = self.new_state(module.clone(), WireBytes::from(bytes));
        let native = NativeModule::new(module, state, self.config.trap_handler_mode);

        let result = if self.config.lazy_compilation {
            lazy::prepare_lazy_module(&native)
        } else {
            sync::run_sync_driver(&native)
        };

        // A pump-driven runner delivers its pending foreground work (event
        // tasks, remaining tier-up) before the caller observes the result.
        if self.runner.is_deterministic() {
            self.runner.pump_all();
        }
        result.map(|()| native)
    }

    /// Start an asynchronous compilation job. The resolver is invoked on
    /// the foreground once the module object is ready (or compilation
    /// failed). Returns the job id, usable with [`abort_job`].
    ///
    /// [`abort_job`]: Self::abort_job
    pub fn compile_async(
        self: &Arc<Self>,
        bytes: Vec<u8>,
        origin: ModuleOrigin,
        resolver: Box<dyn CompileResolver>,
    ) -> u64 {
        AsyncCompileJob::start(self, WireBytes::from(bytes), origin, resolver)
    }

    /// Start a streaming compilation. Wire bytes are pushed chunk by chunk
    /// through the returned handle.
    pub fn compile_streaming(
        self: &Arc<Self>,
        origin: ModuleOrigin,
        resolver: Box<dyn CompileResolver>,
    ) -> StreamingHandle {
        streaming::start(self, origin, resolver)
    }

    /// Abort a registered job: joins its background tasks and rejects its
    /// resolver with [`PipelineError::Aborted`]. Returns `false` if the
    /// job already finished.
    pub fn abort_job(&self, id: u64) -> bool {
        match self.jobs.get(id) {
            Some(job) => {
                job.abort();
                true
            }
            None => false,
        }
    }

    /// Compile one function of a lazy module on demand and return its
    /// entry address. Must not fail for a validated module.
    pub fn lazy_compile(&self, native: &Arc<NativeModule>, func_index: u32) -> usize {
        lazy::lazy_compile(native, func_index, self.config.trace.lazy)
    }
}

type PromiseResult = Result<Arc<ModuleObject>, PipelineError>;

struct PromiseResolver {
    tx: Mutex<Option<oneshot::Sender<PromiseResult>>>,
}

impl PromiseResolver {
    fn resolve(&self, result: PromiseResult) {
        if let Some(tx) = self.tx.lock().expect("promise poisoned").take() {
            let _ = tx.send(result);
        }
    }
}

impl CompileResolver for PromiseResolver {
    fn on_success(&self, module: Arc<ModuleObject>) {
        self.resolve(Ok(module));
    }

    fn on_failure(&self, error: PipelineError) {
        self.resolve(Err(error));
    }
}

/// Awaitable side of [`promise_pair`].
pub struct CompilePromise {
    rx: oneshot::Receiver<PromiseResult>,
}

impl CompilePromise {
    /// Wait for the compilation outcome.
    pub async fn wait(self) -> PromiseResult {
        self.rx.await.unwrap_or(Err(PipelineError::Aborted))
    }

    /// Non-blocking poll, for pump-driven runners.
    pub fn try_wait(&mut self) -> Option<PromiseResult> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(PipelineError::Aborted)),
        }
    }
}

/// A resolver/promise pair bridging the pipeline to async callers.
pub fn promise_pair() -> (Box<dyn CompileResolver>, CompilePromise) {
    let (tx, rx) = oneshot::channel();
    (
        Box::new(PromiseResolver {
            tx: Mutex::new(Some(tx)),
        }),
        CompilePromise { rx },
    )
}
