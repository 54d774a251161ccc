use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use riptide_core::{Code, ExecutionTier, FuncType, Module, ValType, WrapperGenerator};

/// Index used for adapter code, which belongs to no wasm function.
const WRAPPER_INDEX: u32 = u32::MAX;

/// JS↔Wasm call-adapter generator memoized on `(is_import, signature)`.
///
/// Adapter generation is foreground-only, so a plain mutex around the memo
/// map is sufficient.
#[derive(Debug, Default)]
pub struct WrapperCache {
    memo: Mutex<HashMap<(bool, FuncType), Arc<Code>>>,
}

impl WrapperCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct adapters generated so far.
    pub fn len(&self) -> usize {
        self.memo.lock().expect("wrapper cache poisoned").len()
    }

    /// Whether no adapter has been generated yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn marshal_template(ty: ValType, slot: u8) -> [u8; 3] {
    let tag = match ty {
        ValType::I32 => 0x01,
        ValType::I64 => 0x02,
        ValType::F32 => 0x03,
        ValType::F64 => 0x04,
    };
    [0x8B, tag, slot]
}

fn generate(sig: &FuncType, is_import: bool) -> Code {
    let mut out = Vec::with_capacity(8 + sig.params.len() * 3 + sig.results.len() * 3);
    out.extend_from_slice(&[0x55, 0x48, 0x89, 0xE5]);
    out.push(if is_import { 0x01 } else { 0x00 });
    for (slot, &ty) in sig.params.iter().enumerate() {
        out.extend_from_slice(&marshal_template(ty, slot as u8));
    }
    // Indirect call through the target slot.
    out.extend_from_slice(&[0xFF, 0xD0]);
    for (slot, &ty) in sig.results.iter().enumerate() {
        out.extend_from_slice(&marshal_template(ty, slot as u8));
    }
    out.extend_from_slice(&[0x5D, 0xC3]);
    Code::new(WRAPPER_INDEX, ExecutionTier::Baseline, out)
}

impl WrapperGenerator for WrapperCache {
    fn compile_js_to_wasm(&self, _module: &Module, sig: &FuncType, is_import: bool) -> Arc<Code> {
        let mut memo = self.memo.lock().expect("wrapper cache poisoned");
        memo.entry((is_import, sig.clone()))
            .or_insert_with(|| Arc::new(generate(sig, is_import)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use riptide_core::testing::ModuleBuilder;
    use riptide_core::{Decoder, FeatureSet, ModuleOrigin};

    fn empty_module() -> riptide_core::Module {
        Decoder::new(ModuleOrigin::Wasm, FeatureSet::all())
            .decode_module(&ModuleBuilder::new().build())
            .unwrap()
    }

    #[test]
    fn adapters_are_memoized_per_signature_and_direction() {
        let cache = WrapperCache::new();
        let module = empty_module();
        let sig = FuncType {
            params: vec![ValType::I32, ValType::F64],
            results: vec![ValType::I32],
        };

        let a = cache.compile_js_to_wasm(&module, &sig, false);
        let b = cache.compile_js_to_wasm(&module, &sig, false);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);

        let import = cache.compile_js_to_wasm(&module, &sig, true);
        assert!(!Arc::ptr_eq(&a, &import));
        assert_eq!(cache.len(), 2);

        let other = FuncType {
            params: vec![],
            results: vec![],
        };
        cache.compile_js_to_wasm(&module, &other, false);
        assert_eq!(cache.len(), 3);
    }
}
