#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Shared data model for the `riptide` WebAssembly compilation pipeline:
//! the decoded module, wire-bytes storage, tier/mode enums, the error
//! taxonomy, runtime configuration, and the contracts the pipeline consumes
//! from its code-generation collaborators.

/// Collaborator contracts: code artifact, generator traits, metrics sink.
pub mod codegen;
/// Runtime configuration record.
pub mod config;
/// Module binary decoding (bulk and incremental).
pub mod decode;
/// Error taxonomy.
pub mod error;
/// Optional-feature flags.
pub mod features;
/// Decoded module shapes.
pub mod module;
/// Test-support module builders.
pub mod testing;
/// Execution tiers and compile modes.
pub mod tier;
/// Shared wire-bytes storage.
pub mod wire;

pub use codegen::{Code, CodeGenerator, CompileMetrics, FunctionToCompile, WrapperGenerator};
pub use config::{CompileConfig, TraceFlags, TrapHandlerMode};
pub use decode::{Decoder, IncrementalDecoder};
pub use error::{CompileError, DecodeError, PipelineError};
pub use features::FeatureSet;
pub use module::{Export, ExportKind, FuncType, FunctionBody, FunctionDecl, Module, ModuleOrigin, ValType};
pub use tier::{CompileMode, ExecutionTier};
pub use wire::WireBytes;
