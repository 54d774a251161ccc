mod support;

use riptide_core::decode::section;
use riptide_core::testing::ModuleBuilder;
use riptide_core::{ExecutionTier, ModuleOrigin, PipelineError};
use riptide_engine::{CompilationEvent, TaskRunner, promise_pair};
use support::{EventRecorder, default_config, drive, engine_with, regular_config};

#[test]
fn scenario_streamed_function_compiles_after_stream_end() {
    let runner = TaskRunner::deterministic();
    let events = EventRecorder::new();
    let engine = engine_with(runner.clone(), regular_config(), &events);

    let body = ModuleBuilder::const_body(7);
    let bytes = ModuleBuilder::new()
        .add_function(body.clone())
        .export_function("f", 0)
        .build();

    // Split: everything before the code-section payload, then the code
    // header, then the function body in two chunks.
    let code_payload_len = {
        let builder = ModuleBuilder::new().add_function(body.clone());
        builder.code_payload().len()
    };
    let code_start = bytes.len() - code_payload_len;
    let body_split = bytes.len() - body.len() / 2;

    let (resolver, mut promise) = promise_pair();
    let handle = engine.compile_streaming(ModuleOrigin::Wasm, resolver);
    handle.process_bytes(&bytes[..code_start]);
    handle.process_bytes(&bytes[code_start..body_split]);
    handle.process_bytes(&bytes[body_split..]);
    assert!(events.snapshot().is_empty());
    handle.finish();

    let module = drive(&runner, &mut promise).unwrap();
    runner.pump_all();

    let native = module.native();
    assert_eq!(native.num_functions(), 1);
    assert_eq!(native.installed_tier(0), Some(ExecutionTier::Baseline));
    assert_eq!(module.export_wrappers().len(), 1);
    // Both events fire after the stream finished.
    assert_eq!(
        events.snapshot(),
        vec![
            CompilationEvent::FinishedBaselineCompilation,
            CompilationEvent::FinishedTopTierCompilation,
        ]
    );
    assert!(!engine.has_job(handle.job_id()));
}

#[test]
fn streaming_accepts_every_chunk_boundary() {
    let bytes = ModuleBuilder::new()
        .add_function(ModuleBuilder::const_body(1))
        .add_function(ModuleBuilder::add_body(2, 3))
        .export_function("g", 1)
        .build();

    for split in 1..bytes.len() {
        let runner = TaskRunner::deterministic();
        let events = EventRecorder::new();
        let engine = engine_with(runner.clone(), regular_config(), &events);

        let (resolver, mut promise) = promise_pair();
        let handle = engine.compile_streaming(ModuleOrigin::Wasm, resolver);
        handle.process_bytes(&bytes[..split]);
        handle.process_bytes(&bytes[split..]);
        handle.finish();

        let module = drive(&runner, &mut promise)
            .unwrap_or_else(|err| panic!("split at {split} failed: {err}"));
        runner.pump_all();
        assert_eq!(module.native().num_functions(), 2);
        assert!(module.native().code(0).is_some());
        assert!(module.native().code(1).is_some());
    }
}

#[test]
fn streaming_empty_module_succeeds_without_events() {
    let runner = TaskRunner::deterministic();
    let events = EventRecorder::new();
    let engine = engine_with(runner.clone(), default_config(), &events);

    let (resolver, mut promise) = promise_pair();
    let handle = engine.compile_streaming(ModuleOrigin::Wasm, resolver);
    handle.process_bytes(&ModuleBuilder::new().build());
    handle.finish();

    let module = drive(&runner, &mut promise).unwrap();
    assert_eq!(module.native().num_functions(), 0);
    assert!(events.snapshot().is_empty());
    assert_eq!(engine.num_jobs(), 0);
}

#[test]
fn streaming_processes_sections_after_the_code_section() {
    let runner = TaskRunner::deterministic();
    let events = EventRecorder::new();
    let engine = engine_with(runner.clone(), regular_config(), &events);

    let mut bytes = ModuleBuilder::new()
        .add_function(ModuleBuilder::const_body(4))
        .build();
    // A custom section and a data section after the code section.
    bytes.extend_from_slice(&[section::CUSTOM, 0x01, 0x00]);
    bytes.extend_from_slice(&[section::DATA, 0x01, 0x00]);

    let (resolver, mut promise) = promise_pair();
    let handle = engine.compile_streaming(ModuleOrigin::Wasm, resolver);
    for chunk in bytes.chunks(3) {
        handle.process_bytes(chunk);
    }
    handle.finish();

    let module = drive(&runner, &mut promise).unwrap();
    runner.pump_all();
    assert!(module.native().code(0).is_some());
}

#[test]
fn streaming_decode_error_rejects() {
    let runner = TaskRunner::deterministic();
    let events = EventRecorder::new();
    let engine = engine_with(runner.clone(), default_config(), &events);

    let (resolver, mut promise) = promise_pair();
    let handle = engine.compile_streaming(ModuleOrigin::Wasm, resolver);
    handle.process_bytes(&[0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x00, 0x00, 0x00]);

    let error = drive(&runner, &mut promise).unwrap_err();
    assert!(matches!(error, PipelineError::Decode(_)));
    assert_eq!(engine.num_jobs(), 0);

    // Later pushes are ignored.
    handle.process_bytes(&[0x01, 0x02]);
    handle.finish();
}

#[test]
fn streaming_truncated_stream_rejects_at_finish() {
    let runner = TaskRunner::deterministic();
    let events = EventRecorder::new();
    let engine = engine_with(runner.clone(), regular_config(), &events);

    let bytes = ModuleBuilder::new()
        .add_function(ModuleBuilder::const_body(1))
        .build();

    let (resolver, mut promise) = promise_pair();
    let handle = engine.compile_streaming(ModuleOrigin::Wasm, resolver);
    handle.process_bytes(&bytes[..bytes.len() - 2]);
    handle.finish();

    let error = drive(&runner, &mut promise).unwrap_err();
    assert!(matches!(error, PipelineError::Decode(_)));
    assert_eq!(engine.num_jobs(), 0);
}

#[test]
fn streaming_abort_rejects_with_aborted() {
    let runner = TaskRunner::deterministic();
    let events = EventRecorder::new();
    let engine = engine_with(runner.clone(), default_config(), &events);

    let bytes = ModuleBuilder::new()
        .add_function(ModuleBuilder::const_body(1))
        .build();

    let (resolver, mut promise) = promise_pair();
    let handle = engine.compile_streaming(ModuleOrigin::Wasm, resolver);
    handle.process_bytes(&bytes[..10]);
    handle.abort();

    runner.pump_all();
    let error = promise.try_wait().expect("abort must settle").unwrap_err();
    assert_eq!(error, PipelineError::Aborted);
    assert_eq!(engine.num_jobs(), 0);

    // Idempotent.
    handle.abort();
    handle.finish();
}

#[test]
fn streaming_tiering_module_tier_up_completes() {
    let runner = TaskRunner::deterministic();
    let events = EventRecorder::new();
    let engine = engine_with(runner.clone(), default_config(), &events);

    let bytes = ModuleBuilder::new()
        .add_function(ModuleBuilder::add_body(5, 6))
        .add_function(ModuleBuilder::add_body(7, 8))
        .build();

    let (resolver, mut promise) = promise_pair();
    let handle = engine.compile_streaming(ModuleOrigin::Wasm, resolver);
    handle.process_bytes(&bytes);
    handle.finish();

    let module = drive(&runner, &mut promise).unwrap();
    runner.pump_all();
    for index in 0..2 {
        assert_eq!(
            module.native().installed_tier(index),
            Some(ExecutionTier::Optimized)
        );
    }
    assert_eq!(
        events.snapshot(),
        vec![
            CompilationEvent::FinishedBaselineCompilation,
            CompilationEvent::FinishedTopTierCompilation,
        ]
    );
    assert!(!engine.has_job(handle.job_id()));
}
