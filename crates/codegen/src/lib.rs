#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Default code-generation backend for the `riptide` pipeline: single-pass
//! template lowering of one function body per tier, plus memoized JS↔Wasm
//! call-adapter generation.

/// The per-function template code generator.
pub mod backend;
mod body;
/// Memoized JS↔Wasm adapter generation.
pub mod wrappers;

pub use backend::TemplateCodegen;
pub use wrappers::WrapperCache;
