use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::CompileError;
use crate::features::FeatureSet;
use crate::module::{FuncType, Module};
use crate::tier::ExecutionTier;

/// One function's generated native code.
#[derive(Debug, Clone)]
pub struct Code {
    func_index: u32,
    tier: ExecutionTier,
    bytes: Arc<[u8]>,
}

impl Code {
    /// Wrap a generated buffer.
    pub fn new(func_index: u32, tier: ExecutionTier, bytes: Vec<u8>) -> Self {
        Self {
            func_index,
            tier,
            bytes: bytes.into(),
        }
    }

    /// Declared index of the function this code implements.
    pub fn func_index(&self) -> u32 {
        self.func_index
    }

    /// Tier that produced this code.
    pub fn tier(&self) -> ExecutionTier {
        self.tier
    }

    /// The generated bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Entry address of the generated code.
    pub fn entry_address(&self) -> usize {
        self.bytes.as_ptr() as usize
    }
}

/// Counters shared with the code generator across all units of one module.
#[derive(Debug, Default)]
pub struct CompileMetrics {
    baseline_units: AtomicU64,
    optimized_units: AtomicU64,
    codegen_micros: AtomicU64,
}

impl CompileMetrics {
    /// Record one generated unit and the time it took.
    pub fn record_unit(&self, tier: ExecutionTier, micros: u64) {
        match tier {
            ExecutionTier::Baseline => self.baseline_units.fetch_add(1, Ordering::Relaxed),
            ExecutionTier::Optimized => self.optimized_units.fetch_add(1, Ordering::Relaxed),
        };
        self.codegen_micros.fetch_add(micros, Ordering::Relaxed);
    }

    /// Units generated at the given tier so far.
    pub fn units(&self, tier: ExecutionTier) -> u64 {
        match tier {
            ExecutionTier::Baseline => self.baseline_units.load(Ordering::Relaxed),
            ExecutionTier::Optimized => self.optimized_units.load(Ordering::Relaxed),
        }
    }

    /// Total time spent in the generator, in microseconds.
    pub fn codegen_micros(&self) -> u64 {
        self.codegen_micros.load(Ordering::Relaxed)
    }
}

/// Everything the generator needs to translate one function at one tier.
#[derive(Debug, Clone, Copy)]
pub struct FunctionToCompile<'a> {
    /// The immutable decoded module.
    pub module: &'a Module,
    /// Declared index of the function.
    pub func_index: u32,
    /// Target tier.
    pub tier: ExecutionTier,
    /// The function body bytes (locals + expression).
    pub body: &'a [u8],
    /// Offset of the body in the wire bytes, for error reporting.
    pub body_offset: u32,
}

/// The function-level code generator the pipeline drives.
///
/// Implementations are called from parallel worker threads; they must not
/// block on pipeline state and must not touch host-heap objects.
pub trait CodeGenerator: Send + Sync {
    /// Translate one function body into native code.
    ///
    /// Optional-feature constructs encountered while scanning are added to
    /// `detected`; timing and unit counts go to `metrics`.
    fn compile(
        &self,
        function: FunctionToCompile<'_>,
        detected: &mut FeatureSet,
        metrics: &CompileMetrics,
    ) -> Result<Code, CompileError>;

    /// Check a function body without keeping the result.
    fn validate(&self, function: FunctionToCompile<'_>) -> Result<(), CompileError> {
        let mut scratch = FeatureSet::empty();
        let metrics = CompileMetrics::default();
        self.compile(
            FunctionToCompile {
                tier: ExecutionTier::Baseline,
                ..function
            },
            &mut scratch,
            &metrics,
        )
        .map(|_| ())
    }
}

/// Generator for JS↔Wasm call adapters.
///
/// Implementations memoize on `(is_import, signature)`.
pub trait WrapperGenerator: Send + Sync {
    /// Compile (or fetch the memoized) adapter for one signature.
    fn compile_js_to_wasm(&self, module: &Module, sig: &FuncType, is_import: bool) -> Arc<Code>;
}
