use thiserror::Error;

use crate::module::Module;

/// The module binary is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The first four bytes are not the wasm magic.
    #[error("expected wasm magic at offset {offset}")]
    BadMagic {
        /// Byte offset of the failure.
        offset: u32,
    },
    /// The version word is not supported.
    #[error("unsupported wasm version {version}")]
    BadVersion {
        /// The version read from the header.
        version: u32,
    },
    /// The input ended inside a structure.
    #[error("unexpected end of module bytes at offset {offset}")]
    UnexpectedEof {
        /// Byte offset of the failure.
        offset: u32,
    },
    /// An over-long or overflowing LEB128 integer.
    #[error("malformed varint at offset {offset}")]
    BadVarint {
        /// Byte offset of the failure.
        offset: u32,
    },
    /// A section's declared length exceeds the remaining input.
    #[error("section {id} overflows the module at offset {offset}")]
    SectionOverflow {
        /// Section id.
        id: u8,
        /// Byte offset of the section header.
        offset: u32,
    },
    /// A known section appeared after a later section.
    #[error("section {id} out of order at offset {offset}")]
    SectionOutOfOrder {
        /// Section id.
        id: u8,
        /// Byte offset of the section header.
        offset: u32,
    },
    /// A section id outside the known range.
    #[error("unknown section id {id} at offset {offset}")]
    UnknownSection {
        /// Section id.
        id: u8,
        /// Byte offset of the section header.
        offset: u32,
    },
    /// A value-type byte that is not a supported type.
    #[error("invalid value type 0x{byte:02x} at offset {offset}")]
    BadValueType {
        /// The offending byte.
        byte: u8,
        /// Byte offset of the failure.
        offset: u32,
    },
    /// A type index beyond the type table.
    #[error("type index {index} out of bounds at offset {offset}")]
    TypeIndexOutOfBounds {
        /// The offending index.
        index: u32,
        /// Byte offset of the failure.
        offset: u32,
    },
    /// A malformed import entry.
    #[error("invalid import entry at offset {offset}")]
    BadImport {
        /// Byte offset of the failure.
        offset: u32,
    },
    /// A malformed export entry.
    #[error("invalid export entry at offset {offset}")]
    BadExport {
        /// Byte offset of the failure.
        offset: u32,
    },
    /// The code-section count disagrees with the function section.
    #[error("function count mismatch: {declared} declared, {bodies} bodies")]
    FunctionCountMismatch {
        /// Entries in the function section.
        declared: u32,
        /// Bodies seen in the code section.
        bodies: u32,
    },
    /// A construct requiring a feature that is not enabled.
    #[error("{feature} support is not enabled (offset {offset})")]
    FeatureDisabled {
        /// Human-readable feature name.
        feature: &'static str,
        /// Byte offset of the construct.
        offset: u32,
    },
    /// Bytes after the last section.
    #[error("trailing bytes after final section at offset {offset}")]
    TrailingBytes {
        /// Byte offset of the first stray byte.
        offset: u32,
    },
}

/// One function failed to translate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} @+{offset}")]
pub struct CompileError {
    /// Declared index of the offending function.
    pub func_index: u32,
    /// Byte offset of the failure within the wire bytes.
    pub offset: u32,
    /// What went wrong.
    pub message: String,
}

impl CompileError {
    /// Build a function-level compile error.
    pub fn new(func_index: u32, offset: u32, message: impl Into<String>) -> Self {
        Self {
            func_index,
            offset,
            message: message.into(),
        }
    }
}

/// Pipeline-level failure, as surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// The module binary did not decode.
    #[error("{0}")]
    Decode(#[from] DecodeError),
    /// A function failed to compile.
    #[error("Compiling wasm function \"{name}\" failed: {message}")]
    Compile {
        /// Display name of the function (export name or `wasm-function[i]`).
        name: String,
        /// Declared index of the function.
        func_index: u32,
        /// Formatted generator message.
        message: String,
    },
    /// Allocation or guard-region failure.
    #[error("{0}")]
    Resource(String),
    /// The compilation was aborted before completion.
    #[error("Compilation aborted")]
    Aborted,
}

impl PipelineError {
    /// Wrap a function-level error with its display name from the module.
    pub fn from_compile(module: &Module, err: &CompileError) -> Self {
        PipelineError::Compile {
            name: module.function_name(err.func_index),
            func_index: err.func_index,
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Export, ExportKind, FunctionDecl, Module, ModuleOrigin};

    fn two_function_module() -> Module {
        Module {
            origin: ModuleOrigin::Wasm,
            types: vec![],
            num_imported_functions: 1,
            functions: vec![
                FunctionDecl {
                    type_index: 0,
                    body: None,
                },
                FunctionDecl {
                    type_index: 0,
                    body: None,
                },
            ],
            exports: vec![Export {
                name: "run".to_string(),
                kind: ExportKind::Function,
                index: 1,
            }],
        }
    }

    #[test]
    fn compile_error_surface_format_uses_export_name() {
        let module = two_function_module();
        let err = CompileError::new(0, 17, "unsupported opcode 0xf9");
        let surfaced = PipelineError::from_compile(&module, &err);
        assert_eq!(
            surfaced.to_string(),
            "Compiling wasm function \"run\" failed: unsupported opcode 0xf9 @+17"
        );
    }

    #[test]
    fn compile_error_surface_format_falls_back_to_index() {
        let module = two_function_module();
        let err = CompileError::new(1, 4, "truncated body");
        let surfaced = PipelineError::from_compile(&module, &err);
        assert_eq!(
            surfaced.to_string(),
            "Compiling wasm function \"wasm-function[2]\" failed: truncated body @+4"
        );
    }
}
