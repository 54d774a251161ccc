use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use riptide_core::{CompileConfig, ModuleOrigin, TraceFlags, TrapHandlerMode};

pub fn default_tasks() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(CompileConfig::MAX_COMPILATION_TASKS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum IngestMode {
    /// Block until baseline compilation is done.
    Sync,
    /// Compile on background workers, resolve a promise.
    Async,
    /// Feed the file in chunks through the streaming decoder.
    Streaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OriginArg {
    /// Regular WebAssembly (validated; tiering eligible).
    Wasm,
    /// asm.js-translated module (trusted bodies, regular mode).
    AsmJs,
}

impl From<OriginArg> for ModuleOrigin {
    fn from(origin: OriginArg) -> Self {
        match origin {
            OriginArg::Wasm => ModuleOrigin::Wasm,
            OriginArg::AsmJs => ModuleOrigin::AsmJs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TrapMode {
    Preferred,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TraceArea {
    Compiler,
    Streaming,
    Lazy,
    Instances,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "riptide", version, about = "Riptide wasm compilation pipeline driver")]
pub struct Cli {
    /// Path to the module binary.
    pub module: PathBuf,

    /// Ingestion mode.
    #[arg(long, value_enum, default_value_t = IngestMode::Async)]
    pub mode: IngestMode,

    /// Module origin.
    #[arg(long, value_enum, default_value_t = OriginArg::Wasm)]
    pub origin: OriginArg,

    /// Disable tier-up (compile in regular single-tier mode).
    #[arg(long)]
    pub no_tier_up: bool,

    /// Skip bulk compilation; install lazy trampolines instead.
    #[arg(long)]
    pub lazy: bool,

    /// Number of background compilation tasks (0 = foreground only).
    #[arg(
        short = 'j',
        long,
        env = "RIPTIDE_TASKS",
        default_value_t = default_tasks(),
        value_parser = clap::value_parser!(usize)
    )]
    pub tasks: usize,

    /// Chunk size for streaming mode, in bytes.
    #[arg(long, default_value_t = 4096, value_parser = parse_chunk_size)]
    pub chunk_size: usize,

    /// Out-of-bounds trap strategy.
    #[arg(long, value_enum, default_value_t = TrapMode::Preferred)]
    pub trap_handler: TrapMode,

    /// Subsystems to trace (repeatable, comma-separated).
    #[arg(long, value_enum, value_delimiter = ',')]
    pub trace: Vec<TraceArea>,

    /// Print events and the summary as JSON lines.
    #[arg(long)]
    pub json: bool,
}

fn parse_chunk_size(input: &str) -> Result<usize, String> {
    let value: usize = input
        .trim()
        .parse()
        .map_err(|_| format!("invalid chunk size: {input:?}"))?;
    if value == 0 {
        return Err("chunk size must be >= 1".to_string());
    }
    Ok(value)
}

impl Cli {
    pub fn compile_config(&self) -> CompileConfig {
        let mut trace = TraceFlags::default();
        for area in &self.trace {
            match area {
                TraceArea::Compiler => trace.compiler = true,
                TraceArea::Streaming => trace.streaming = true,
                TraceArea::Lazy => trace.lazy = true,
                TraceArea::Instances => trace.instances = true,
            }
        }
        CompileConfig {
            tier_up: !self.no_tier_up,
            lazy_compilation: self.lazy,
            num_compilation_tasks: self.tasks,
            trap_handler_mode: match self.trap_handler {
                TrapMode::Preferred => TrapHandlerMode::Preferred,
                TrapMode::Disabled => TrapHandlerMode::Disabled,
            },
            trace,
        }
    }
}
