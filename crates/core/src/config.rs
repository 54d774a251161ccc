use crate::module::ModuleOrigin;
use crate::tier::CompileMode;

/// How out-of-bounds memory accesses are caught.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapHandlerMode {
    /// Use guard regions when the platform can reserve them; fall back to
    /// bounds-checked code otherwise.
    Preferred,
    /// Always emit bounds checks.
    Disabled,
}

/// Independent trace toggles, one per subsystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceFlags {
    /// Trace unit compilation and finalization.
    pub compiler: bool,
    /// Trace streaming decode progress.
    pub streaming: bool,
    /// Trace lazy compilation.
    pub lazy: bool,
    /// Trace instance-facing operations.
    pub instances: bool,
}

/// Runtime configuration for a compilation pipeline.
///
/// This is an explicit record passed to compile-state construction; nothing
/// in the pipeline reads process-wide flags, and workers never consult it.
#[derive(Debug, Clone)]
pub struct CompileConfig {
    /// Whether tier-up is enabled (selects [`CompileMode::Tiering`] for
    /// wasm-origin modules).
    pub tier_up: bool,
    /// Skip bulk compilation and install lazy trampolines instead.
    pub lazy_compilation: bool,
    /// Requested number of background compilation tasks. Zero means
    /// "foreground only": every background task is posted to the foreground
    /// runner, making compilation deterministic.
    pub num_compilation_tasks: usize,
    /// Out-of-bounds trap strategy.
    pub trap_handler_mode: TrapHandlerMode,
    /// Trace toggles.
    pub trace: TraceFlags,
}

impl CompileConfig {
    /// Default requested background task count.
    pub const DEFAULT_COMPILATION_TASKS: usize = 8;

    /// Hard cap on concurrent compilation tasks.
    pub const MAX_COMPILATION_TASKS: usize = 128;

    /// The compile mode for a module of the given origin.
    ///
    /// Tiering applies only to wasm-origin modules with tier-up enabled;
    /// asm.js modules always compile in regular mode.
    pub fn mode_for(&self, origin: ModuleOrigin) -> CompileMode {
        match origin {
            ModuleOrigin::Wasm if self.tier_up => CompileMode::Tiering,
            _ => CompileMode::Regular,
        }
    }

    /// Clamp the configured task count against the host's worker slots.
    ///
    /// Returns the worker bound; zero configured tasks yield a bound of one
    /// with all posts routed to the foreground.
    pub fn max_workers(&self, host_worker_slots: usize) -> usize {
        if self.num_compilation_tasks == 0 {
            return 1;
        }
        self.num_compilation_tasks
            .min(Self::MAX_COMPILATION_TASKS)
            .clamp(1, host_worker_slots.max(1))
    }
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            tier_up: true,
            lazy_compilation: false,
            num_compilation_tasks: Self::DEFAULT_COMPILATION_TASKS,
            trap_handler_mode: TrapHandlerMode::Preferred,
            trace: TraceFlags::default(),
        }
    }
}
