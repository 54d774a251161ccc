//! Shared fixtures for the pipeline integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use riptide_codegen::{TemplateCodegen, WrapperCache};
use riptide_core::{
    Code, CodeGenerator, CompileConfig, CompileError, CompileMetrics, FeatureSet,
    FunctionToCompile,
};
use riptide_engine::{
    CompilationEvent, CompilePromise, EngineOptions, PipelineEngine, TaskRunner,
};

/// Records every compilation event an engine fires.
#[derive(Clone, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<CompilationEvent>>>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hook(&self) -> riptide_engine::EventHook {
        let events = self.events.clone();
        Arc::new(move |event| {
            events.lock().unwrap().push(event);
        })
    }

    pub fn snapshot(&self) -> Vec<CompilationEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: CompilationEvent) -> usize {
        self.events.lock().unwrap().iter().filter(|&&e| e == event).count()
    }
}

/// A generator that sleeps before delegating, to keep workers busy while a
/// test aborts or observes intermediate state.
pub struct SlowGen {
    inner: TemplateCodegen,
    delay: Duration,
}

impl SlowGen {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: TemplateCodegen::new(FeatureSet::all()),
            delay,
        }
    }
}

impl CodeGenerator for SlowGen {
    fn compile(
        &self,
        function: FunctionToCompile<'_>,
        detected: &mut FeatureSet,
        metrics: &CompileMetrics,
    ) -> Result<Code, CompileError> {
        std::thread::sleep(self.delay);
        self.inner.compile(function, detected, metrics)
    }
}

pub fn default_config() -> CompileConfig {
    CompileConfig::default()
}

pub fn regular_config() -> CompileConfig {
    CompileConfig {
        tier_up: false,
        ..CompileConfig::default()
    }
}

pub fn engine_with(
    runner: Arc<TaskRunner>,
    config: CompileConfig,
    events: &EventRecorder,
) -> Arc<PipelineEngine> {
    PipelineEngine::new(EngineOptions {
        runner,
        generator: Arc::new(TemplateCodegen::new(FeatureSet::all())),
        wrappers: Arc::new(WrapperCache::new()),
        enabled_features: FeatureSet::all(),
        config,
        event_hook: Some(events.hook()),
    })
}

pub fn engine_with_generator(
    runner: Arc<TaskRunner>,
    config: CompileConfig,
    events: &EventRecorder,
    generator: Arc<dyn CodeGenerator>,
) -> Arc<PipelineEngine> {
    PipelineEngine::new(EngineOptions {
        runner,
        generator,
        wrappers: Arc::new(WrapperCache::new()),
        enabled_features: FeatureSet::all(),
        config,
        event_hook: Some(events.hook()),
    })
}

/// Pump a deterministic runner until the promise settles. Panics if the
/// queue drains without the promise resolving.
pub fn drive(
    runner: &TaskRunner,
    promise: &mut CompilePromise,
) -> Result<Arc<riptide_engine::ModuleObject>, riptide_core::PipelineError> {
    loop {
        if let Some(result) = promise.try_wait() {
            return result;
        }
        if runner.pump_all() == 0 {
            panic!("task queue drained before the compilation settled");
        }
    }
}
