mod support;

use std::sync::Arc;
use std::time::{Duration, Instant};

use riptide_core::testing::ModuleBuilder;
use riptide_core::{
    CompileConfig, ExecutionTier, FeatureSet, ModuleOrigin, PipelineError, TrapHandlerMode,
};
use riptide_engine::{CompilationEvent, TaskRunner, promise_pair};
use support::{
    EventRecorder, SlowGen, default_config, drive, engine_with, engine_with_generator,
    regular_config,
};

fn n_function_module(n: usize) -> Vec<u8> {
    let mut builder = ModuleBuilder::new();
    for i in 0..n {
        builder = builder.add_function(ModuleBuilder::const_body((i % 0x40) as u8));
    }
    builder.build()
}

#[test]
fn scenario_empty_module_resolves_without_events() {
    let runner = TaskRunner::deterministic();
    let events = EventRecorder::new();
    let engine = engine_with(runner.clone(), default_config(), &events);

    let bytes = ModuleBuilder::new().build();
    let (resolver, mut promise) = promise_pair();
    let id = engine.compile_async(bytes, ModuleOrigin::Wasm, resolver);

    let module = drive(&runner, &mut promise).unwrap();
    assert_eq!(module.native().num_functions(), 0);
    assert!(module.export_wrappers().is_empty());
    assert!(events.snapshot().is_empty());
    assert!(!engine.has_job(id));
}

#[test]
fn scenario_regular_mode_two_functions() {
    let runner = TaskRunner::deterministic();
    let events = EventRecorder::new();
    let engine = engine_with(runner.clone(), regular_config(), &events);

    let bytes = ModuleBuilder::new()
        .add_function(ModuleBuilder::const_body(1))
        .add_function(ModuleBuilder::const_body(2))
        .export_function("main", 0)
        .build();
    let (resolver, mut promise) = promise_pair();
    let id = engine.compile_async(bytes, ModuleOrigin::Wasm, resolver);

    let module = drive(&runner, &mut promise).unwrap();
    runner.pump_all();

    let native = module.native();
    for index in 0..2 {
        assert_eq!(native.installed_tier(index), Some(ExecutionTier::Baseline));
    }
    // One wrapper for the exported function.
    assert_eq!(module.export_wrappers().len(), 1);
    // Both events, top-tier immediately after baseline.
    assert_eq!(
        events.snapshot(),
        vec![
            CompilationEvent::FinishedBaselineCompilation,
            CompilationEvent::FinishedTopTierCompilation,
        ]
    );
    assert!(!engine.has_job(id));
}

#[test]
fn scenario_tiering_mode_upgrades_both_functions() {
    let runner = TaskRunner::deterministic();
    let events = EventRecorder::new();
    let engine = engine_with(runner.clone(), default_config(), &events);

    let bytes = ModuleBuilder::new()
        .add_function(ModuleBuilder::add_body(1, 2))
        .add_function(ModuleBuilder::add_body(3, 4))
        .build();
    let (resolver, mut promise) = promise_pair();
    let id = engine.compile_async(bytes, ModuleOrigin::Wasm, resolver);

    let module = drive(&runner, &mut promise).unwrap();
    // Drain the remaining top-tier units.
    runner.pump_all();

    let native = module.native();
    for index in 0..2 {
        assert_eq!(native.installed_tier(index), Some(ExecutionTier::Optimized));
    }
    assert_eq!(
        events.snapshot(),
        vec![
            CompilationEvent::FinishedBaselineCompilation,
            CompilationEvent::FinishedTopTierCompilation,
        ]
    );
    assert!(!engine.has_job(id));
}

#[test]
fn scenario_failing_function_rejects_with_formatted_error() {
    let runner = TaskRunner::deterministic();
    let events = EventRecorder::new();
    let engine = engine_with(runner.clone(), regular_config(), &events);

    let bytes = ModuleBuilder::new()
        .add_function(ModuleBuilder::const_body(1))
        .add_function(ModuleBuilder::const_body(2))
        .add_function(ModuleBuilder::invalid_body())
        .build();
    let (resolver, mut promise) = promise_pair();
    let id = engine.compile_async(bytes, ModuleOrigin::Wasm, resolver);

    let error = drive(&runner, &mut promise).unwrap_err();
    runner.pump_all();

    let message = error.to_string();
    assert!(
        message.starts_with("Compiling wasm function \"wasm-function[2]\" failed:"),
        "unexpected message: {message}"
    );
    assert_eq!(events.count(CompilationEvent::FailedCompilation), 1);
    assert_eq!(events.count(CompilationEvent::FinishedTopTierCompilation), 0);
    assert!(!engine.has_job(id));
}

#[test]
fn decode_failure_rejects_the_resolver() {
    let runner = TaskRunner::deterministic();
    let events = EventRecorder::new();
    let engine = engine_with(runner.clone(), default_config(), &events);

    let (resolver, mut promise) = promise_pair();
    let id = engine.compile_async(vec![0x00, 0x61], ModuleOrigin::Wasm, resolver);

    let error = drive(&runner, &mut promise).unwrap_err();
    assert!(matches!(error, PipelineError::Decode(_)));
    assert!(events.snapshot().is_empty());
    assert!(!engine.has_job(id));
}

#[test]
fn foreground_only_mode_completes_deterministically() {
    let runner = TaskRunner::deterministic();
    let events = EventRecorder::new();
    let config = CompileConfig {
        num_compilation_tasks: 0,
        ..default_config()
    };
    let engine = engine_with(runner.clone(), config, &events);

    let (resolver, mut promise) = promise_pair();
    engine.compile_async(n_function_module(5), ModuleOrigin::Wasm, resolver);

    let module = drive(&runner, &mut promise).unwrap();
    runner.pump_all();
    for index in 0..5 {
        assert_eq!(
            module.native().installed_tier(index),
            Some(ExecutionTier::Optimized)
        );
    }
}

#[test]
fn sync_sequential_small_module() {
    let runner = TaskRunner::deterministic();
    let events = EventRecorder::new();
    let engine = engine_with(runner.clone(), regular_config(), &events);

    let native = engine
        .compile_sync(&n_function_module(2), ModuleOrigin::Wasm)
        .unwrap();
    assert_eq!(native.installed_tier(0), Some(ExecutionTier::Baseline));
    assert_eq!(native.installed_tier(1), Some(ExecutionTier::Baseline));
}

#[test]
fn sync_sequential_surfaces_the_first_error() {
    let runner = TaskRunner::deterministic();
    let events = EventRecorder::new();
    let engine = engine_with(runner.clone(), regular_config(), &events);

    let bytes = ModuleBuilder::new()
        .add_function(ModuleBuilder::invalid_body())
        .export_function("broken", 0)
        .build();
    let error = engine.compile_sync(&bytes, ModuleOrigin::Wasm).unwrap_err();
    assert!(
        error
            .to_string()
            .starts_with("Compiling wasm function \"broken\" failed:")
    );
    assert_eq!(events.count(CompilationEvent::FailedCompilation), 1);
}

#[test]
fn sync_parallel_with_pumped_runner() {
    let runner = TaskRunner::deterministic();
    let events = EventRecorder::new();
    let engine = engine_with(runner.clone(), default_config(), &events);

    let native = engine
        .compile_sync(&n_function_module(6), ModuleOrigin::Wasm)
        .unwrap();
    // compile_sync pumps the queued runner dry, so tier-up has finished.
    for index in 0..6 {
        assert_eq!(native.installed_tier(index), Some(ExecutionTier::Optimized));
    }
    assert_eq!(
        events.count(CompilationEvent::FinishedBaselineCompilation),
        1
    );
    assert_eq!(events.count(CompilationEvent::FinishedTopTierCompilation), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sync_parallel_with_threaded_runner() {
    let runner = TaskRunner::threaded(4);
    let events = EventRecorder::new();
    let engine = engine_with(runner, default_config(), &events);

    let native = tokio::task::spawn_blocking({
        let engine = engine.clone();
        move || engine.compile_sync(&n_function_module(8), ModuleOrigin::Wasm)
    })
    .await
    .unwrap()
    .unwrap();

    // Baseline is done when the call returns.
    for index in 0..8 {
        assert!(native.installed_tier(index).is_some());
    }
    // Tier-up continues in the background.
    let deadline = Instant::now() + Duration::from_secs(10);
    'outer: loop {
        let mut done = true;
        for index in 0..8 {
            if native.installed_tier(index) != Some(ExecutionTier::Optimized) {
                done = false;
                break;
            }
        }
        if done {
            break 'outer;
        }
        assert!(Instant::now() < deadline, "tier-up never finished");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(events.count(CompilationEvent::FinishedTopTierCompilation), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_abort_joins_workers_and_rejects() {
    let runner = TaskRunner::threaded(4);
    let events = EventRecorder::new();
    let engine = engine_with_generator(
        runner,
        default_config(),
        &events,
        Arc::new(SlowGen::new(Duration::from_millis(2))),
    );

    let (resolver, promise) = promise_pair();
    let id = engine.compile_async(n_function_module(100), ModuleOrigin::Wasm, resolver);

    tokio::time::sleep(Duration::from_millis(10)).await;
    let aborted = tokio::task::spawn_blocking({
        let engine = engine.clone();
        move || engine.abort_job(id)
    })
    .await
    .unwrap();
    assert!(aborted);

    let error = tokio::time::timeout(Duration::from_secs(10), promise.wait())
        .await
        .expect("abort deadlocked")
        .unwrap_err();
    assert_eq!(error.to_string(), "Compilation aborted");
    assert!(!engine.has_job(id));
    assert_eq!(engine.num_jobs(), 0);

    // Idempotent: the job is gone now.
    assert!(!engine.abort_job(id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_worker_pool_still_completes() {
    let runner = TaskRunner::threaded(1);
    let events = EventRecorder::new();
    let config = CompileConfig {
        num_compilation_tasks: 1,
        ..default_config()
    };
    let engine = engine_with(runner, config, &events);

    let (resolver, promise) = promise_pair();
    engine.compile_async(n_function_module(12), ModuleOrigin::Wasm, resolver);

    let module = tokio::time::timeout(Duration::from_secs(10), promise.wait())
        .await
        .expect("compilation stalled")
        .unwrap();
    for index in 0..12 {
        assert!(module.native().installed_tier(index).is_some());
    }
}

#[test]
fn lazy_module_installs_stubs_then_compiles_on_demand() {
    let runner = TaskRunner::deterministic();
    let events = EventRecorder::new();
    let config = CompileConfig {
        lazy_compilation: true,
        ..regular_config()
    };
    let engine = engine_with(runner.clone(), config, &events);

    let native = engine
        .compile_sync(&n_function_module(3), ModuleOrigin::Wasm)
        .unwrap();
    for index in 0..3 {
        assert!(native.has_lazy_stub(index));
        assert!(native.code(index).is_none());
    }

    let address = engine.lazy_compile(&native, 1);
    assert_ne!(address, 0);
    assert!(!native.has_lazy_stub(1));
    assert_eq!(native.installed_tier(1), Some(ExecutionTier::Baseline));
    assert!(native.has_lazy_stub(0));
}

#[test]
fn lazy_wasm_module_is_validated_at_creation() {
    let runner = TaskRunner::deterministic();
    let events = EventRecorder::new();
    let config = CompileConfig {
        lazy_compilation: true,
        ..regular_config()
    };
    let engine = engine_with(runner.clone(), config, &events);

    let bytes = ModuleBuilder::new()
        .add_function(ModuleBuilder::invalid_body())
        .build();
    assert!(engine.compile_sync(&bytes, ModuleOrigin::Wasm).is_err());
}

#[test]
fn lazy_asm_js_module_skips_validation() {
    let runner = TaskRunner::deterministic();
    let events = EventRecorder::new();
    let config = CompileConfig {
        lazy_compilation: true,
        ..regular_config()
    };
    let engine = engine_with(runner.clone(), config, &events);

    let bytes = ModuleBuilder::new()
        .add_function(ModuleBuilder::invalid_body())
        .build();
    let native = engine.compile_sync(&bytes, ModuleOrigin::AsmJs).unwrap();
    assert!(native.has_lazy_stub(0));
}

#[test]
fn trap_handler_disabled_forces_bounds_checks() {
    let runner = TaskRunner::deterministic();
    let events = EventRecorder::new();
    let config = CompileConfig {
        trap_handler_mode: TrapHandlerMode::Disabled,
        ..regular_config()
    };
    let engine = engine_with(runner.clone(), config, &events);

    let native = engine
        .compile_sync(&n_function_module(1), ModuleOrigin::Wasm)
        .unwrap();
    assert!(!native.uses_guard_regions());
}

#[test]
fn detected_features_are_reported() {
    let runner = TaskRunner::deterministic();
    let events = EventRecorder::new();
    let engine = engine_with(runner.clone(), regular_config(), &events);

    let bytes = ModuleBuilder::new()
        .add_function(ModuleBuilder::sign_extension_body())
        .add_function(ModuleBuilder::const_body(1))
        .add_function(ModuleBuilder::const_body(2))
        .build();
    let (resolver, mut promise) = promise_pair();
    engine.compile_async(bytes, ModuleOrigin::Wasm, resolver);
    let module = drive(&runner, &mut promise).unwrap();
    runner.pump_all();
    assert!(
        module
            .native()
            .detected_features()
            .contains(FeatureSet::SIGN_EXTENSION)
    );
}
