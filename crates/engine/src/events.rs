use serde::{Deserialize, Serialize};

/// Lifecycle events of one compile-state.
///
/// At most one final event (`FinishedTopTierCompilation` or
/// `FailedCompilation`) fires per compile-state; no event follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CompilationEvent {
    /// Every function has baseline code installed.
    FinishedBaselineCompilation,
    /// Every function has top-tier code installed (in regular mode this
    /// fires together with the baseline event).
    FinishedTopTierCompilation,
    /// The compile error latched; no success event will follow.
    FailedCompilation,
}

impl CompilationEvent {
    /// Whether no further events may fire after this one.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            CompilationEvent::FinishedTopTierCompilation | CompilationEvent::FailedCompilation
        )
    }
}

/// An event sink registered on a compile-state. Invoked only from
/// foreground tasks, hence serialized.
pub type EventSink = Box<dyn Fn(CompilationEvent) + Send + Sync + 'static>;
