/// Tier at which a function's native code is produced.
///
/// Tiers are ordered: installed code may only be replaced by code of the
/// same or a higher tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExecutionTier {
    /// Fast-to-generate code, slower to execute.
    Baseline,
    /// Slow-to-generate code, faster to execute.
    Optimized,
}

/// Per-module compilation policy, fixed when the compile-state is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileMode {
    /// One unit per function at the baseline tier.
    Regular,
    /// Two units per function (baseline + optimized), consumed independently.
    Tiering,
}

impl CompileMode {
    /// Number of units a single function contributes under this mode.
    pub fn units_per_function(self) -> u32 {
        match self {
            CompileMode::Regular => 1,
            CompileMode::Tiering => 2,
        }
    }
}
