mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use riptide_codegen::{TemplateCodegen, WrapperCache};
use riptide_core::FeatureSet;
use riptide_engine::{
    CompilationEvent, EngineOptions, ModuleObject, NativeModule, PipelineEngine, TaskRunner,
    promise_pair,
};

use crate::cli::{Cli, IngestMode, default_tasks};

fn print_event(event: CompilationEvent, json: bool) {
    if json {
        match serde_json::to_string(&event) {
            Ok(line) => println!("{line}"),
            Err(err) => eprintln!("warning: failed to encode event: {err:#}"),
        }
    } else {
        println!("event: {event:?}");
    }
}

fn print_summary(native: &Arc<NativeModule>, json: bool) {
    let functions = native.num_functions();
    let compiled = (0..functions).filter(|&i| native.code(i).is_some()).count();
    let stubs = (0..functions).filter(|&i| native.has_lazy_stub(i)).count();
    let features = native.detected_features().names();
    if json {
        let summary = serde_json::json!({
            "functions": functions,
            "compiled": compiled,
            "lazy_stubs": stubs,
            "guard_regions": native.uses_guard_regions(),
            "detected_features": features,
        });
        println!("{summary}");
    } else {
        println!(
            "compiled {compiled}/{functions} functions ({stubs} lazy stubs, guard regions: {})",
            native.uses_guard_regions()
        );
        if !features.is_empty() {
            println!("detected features: {}", features.join(", "));
        }
    }
}

fn print_wrappers(module: &Arc<ModuleObject>, json: bool) {
    let count = module.export_wrappers().len();
    if !json && count > 0 {
        println!("generated {count} export wrapper(s)");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let bytes = std::fs::read(&cli.module)
        .with_context(|| format!("read module {}", cli.module.display()))?;

    let json = cli.json;
    let engine = PipelineEngine::new(EngineOptions {
        runner: TaskRunner::threaded(default_tasks()),
        generator: Arc::new(TemplateCodegen::new(FeatureSet::all())),
        wrappers: Arc::new(WrapperCache::new()),
        enabled_features: FeatureSet::all(),
        config: cli.compile_config(),
        event_hook: Some(Arc::new(move |event| print_event(event, json))),
    });

    match cli.mode {
        IngestMode::Sync => {
            let engine_for_call = engine.clone();
            let origin = cli.origin.into();
            let native = tokio::task::spawn_blocking(move || {
                engine_for_call.compile_sync(&bytes, origin)
            })
            .await
            .context("sync compilation task failed")?
            .map_err(|err| anyhow::anyhow!("{err}"))?;

            if cli.lazy && native.num_functions() > 0 {
                let address = engine.lazy_compile(&native, 0);
                println!("lazily compiled function 0 at {address:#x}");
            }
            print_summary(&native, cli.json);
        }
        IngestMode::Async => {
            let (resolver, promise) = promise_pair();
            engine.compile_async(bytes, cli.origin.into(), resolver);
            let module = promise
                .wait()
                .await
                .map_err(|err| anyhow::anyhow!("{err}"))?;
            print_wrappers(&module, cli.json);
            print_summary(module.native(), cli.json);
        }
        IngestMode::Streaming => {
            let (resolver, promise) = promise_pair();
            let handle = engine.compile_streaming(cli.origin.into(), resolver);
            for chunk in bytes.chunks(cli.chunk_size) {
                handle.process_bytes(chunk);
            }
            handle.finish();
            let module = promise
                .wait()
                .await
                .map_err(|err| anyhow::anyhow!("{err}"))?;
            print_wrappers(&module, cli.json);
            print_summary(module.native(), cli.json);
        }
    }
    Ok(())
}
