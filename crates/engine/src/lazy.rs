use std::sync::Arc;

use riptide_core::{
    ExecutionTier, FeatureSet, FunctionToCompile, ModuleOrigin, PipelineError,
};

use crate::native::NativeModule;

/// Skip bulk compilation: validate the module (wasm origin only) and fill
/// every code slot with the universal lazy trampoline.
pub(crate) fn prepare_lazy_module(native: &Arc<NativeModule>) -> Result<(), PipelineError> {
    let state = native.state();
    let module = state.module().clone();
    let wire = state.wire_bytes();

    // asm.js-translated bodies are trusted; wasm-origin modules are
    // validated up front so lazy compilation cannot fail later.
    if module.origin == ModuleOrigin::Wasm {
        for (index, decl) in module.functions.iter().enumerate() {
            let Some(body) = &decl.body else { continue };
            let bytes = body.resolve(&wire).ok_or_else(|| {
                PipelineError::Resource(format!("function {index} body out of bounds"))
            })?;
            state
                .generator()
                .validate(FunctionToCompile {
                    module: &module,
                    func_index: index as u32,
                    tier: ExecutionTier::Baseline,
                    body: bytes,
                    body_offset: body.offset,
                })
                .map_err(|err| PipelineError::from_compile(&module, &err))?;
        }
    }

    native.install_lazy_stubs();
    Ok(())
}

/// Compile one function on first call and return its entry address.
///
/// The module was validated at creation, so generation cannot fail; a
/// failure here is a broken contract and aborts.
pub(crate) fn lazy_compile(native: &Arc<NativeModule>, func_index: u32, trace: bool) -> usize {
    let state = native.state();
    let module = state.module().clone();
    let wire = state.wire_bytes();

    let decl = module
        .functions
        .get(func_index as usize)
        .expect("lazy compile of an unknown function");
    let body = decl
        .body
        .as_ref()
        .expect("lazy compile of a bodyless function");
    let bytes = body
        .resolve(&wire)
        .expect("lazy function body out of bounds");

    let mut detected = FeatureSet::empty();
    let code = state
        .generator()
        .compile(
            FunctionToCompile {
                module: &module,
                func_index,
                tier: ExecutionTier::Baseline,
                body: bytes,
                body_offset: body.offset,
            },
            &mut detected,
            state.metrics(),
        )
        .expect("lazy compilation failed on a validated function");
    state.publish_features(detected);

    let address = code.entry_address();
    native.install_code(code);
    if trace {
        tracing::debug!(target: "riptide::lazy", func_index, address, "lazily compiled");
    }
    address
}
