use std::time::Instant;

use riptide_core::{Code, CodeGenerator, CompileError, CompileMetrics, FeatureSet, FunctionToCompile};

use crate::body::{emit, scan_body};

/// Template-based code generator.
///
/// Both tiers lower the body in a single pass; the optimized tier folds
/// constant arithmetic before emission. The generator is stateless across
/// functions and safe to call from parallel worker threads.
#[derive(Debug, Clone, Copy)]
pub struct TemplateCodegen {
    enabled: FeatureSet,
}

impl TemplateCodegen {
    /// Build a generator with the given enabled feature set.
    pub fn new(enabled: FeatureSet) -> Self {
        Self { enabled }
    }
}

impl CodeGenerator for TemplateCodegen {
    fn compile(
        &self,
        function: FunctionToCompile<'_>,
        detected: &mut FeatureSet,
        metrics: &CompileMetrics,
    ) -> Result<Code, CompileError> {
        let started = Instant::now();
        let total_functions =
            function.module.num_imported_functions + function.module.num_declared_functions();
        let ops = scan_body(
            function.func_index,
            function.body,
            function.body_offset,
            total_functions,
            self.enabled,
            detected,
        )?;
        let bytes = emit(ops, function.tier);
        metrics.record_unit(function.tier, started.elapsed().as_micros() as u64);
        Ok(Code::new(function.func_index, function.tier, bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use riptide_core::testing::ModuleBuilder;
    use riptide_core::{Decoder, ExecutionTier, Module, ModuleOrigin};

    fn compile_one(
        module: &Module,
        body: &[u8],
        tier: ExecutionTier,
        enabled: FeatureSet,
    ) -> Result<Code, CompileError> {
        let generator = TemplateCodegen::new(enabled);
        let mut detected = FeatureSet::empty();
        let metrics = CompileMetrics::default();
        generator.compile(
            FunctionToCompile {
                module,
                func_index: 0,
                tier,
                body,
                body_offset: 0,
            },
            &mut detected,
            &metrics,
        )
    }

    fn one_function_module(body: Vec<u8>) -> Module {
        let bytes = ModuleBuilder::new().add_function(body).build();
        Decoder::new(ModuleOrigin::Wasm, FeatureSet::all())
            .decode_module(&bytes)
            .unwrap()
    }

    #[test]
    fn valid_body_compiles_at_both_tiers() {
        let body = ModuleBuilder::const_body(42);
        let module = one_function_module(body.clone());
        for tier in [ExecutionTier::Baseline, ExecutionTier::Optimized] {
            let code = compile_one(&module, &body, tier, FeatureSet::all()).unwrap();
            assert_eq!(code.tier(), tier);
            assert!(!code.bytes().is_empty());
        }
    }

    #[test]
    fn optimized_tier_folds_constant_arithmetic() {
        let body = ModuleBuilder::add_body(3, 4);
        let module = one_function_module(body.clone());
        let baseline =
            compile_one(&module, &body, ExecutionTier::Baseline, FeatureSet::all()).unwrap();
        let optimized =
            compile_one(&module, &body, ExecutionTier::Optimized, FeatureSet::all()).unwrap();
        assert!(optimized.bytes().len() < baseline.bytes().len());
        // Folded constant 7 appears as a mov-immediate.
        assert!(
            optimized
                .bytes()
                .windows(5)
                .any(|w| w == [0xB8, 0x07, 0x00, 0x00, 0x00])
        );
    }

    #[test]
    fn unknown_opcode_reports_offset() {
        let body = ModuleBuilder::invalid_body();
        let module = one_function_module(ModuleBuilder::const_body(0));
        let err =
            compile_one(&module, &body, ExecutionTier::Baseline, FeatureSet::all()).unwrap_err();
        assert_eq!(err.func_index, 0);
        // The bad opcode is the second body byte; the cursor has consumed it.
        assert_eq!(err.offset, 2);
        assert!(err.message.contains("0xf9"));
    }

    #[test]
    fn truncated_body_is_an_error() {
        let body = vec![0x00, 0x41];
        let module = one_function_module(ModuleBuilder::const_body(0));
        let err =
            compile_one(&module, &body, ExecutionTier::Baseline, FeatureSet::all()).unwrap_err();
        assert!(err.message.contains("truncated"));
    }

    #[test]
    fn sign_extension_is_detected_and_gated() {
        let body = ModuleBuilder::sign_extension_body();
        let module = one_function_module(body.clone());

        let err = compile_one(&module, &body, ExecutionTier::Baseline, FeatureSet::empty())
            .unwrap_err();
        assert!(err.message.contains("sign-extension"));

        let generator = TemplateCodegen::new(FeatureSet::all());
        let mut detected = FeatureSet::empty();
        let metrics = CompileMetrics::default();
        generator
            .compile(
                FunctionToCompile {
                    module: &module,
                    func_index: 0,
                    tier: ExecutionTier::Baseline,
                    body: &body,
                    body_offset: 0,
                },
                &mut detected,
                &metrics,
            )
            .unwrap();
        assert!(detected.contains(FeatureSet::SIGN_EXTENSION));
        assert_eq!(metrics.units(ExecutionTier::Baseline), 1);
    }

    #[test]
    fn call_targets_are_bounds_checked() {
        // call 5 in a single-function module
        let body = vec![0x00, 0x10, 0x05, 0x1A, 0x0B];
        let module = one_function_module(ModuleBuilder::const_body(0));
        let err =
            compile_one(&module, &body, ExecutionTier::Baseline, FeatureSet::all()).unwrap_err();
        assert!(err.message.contains("out of bounds"));
    }

    #[test]
    fn validate_discards_the_result() {
        let body = ModuleBuilder::const_body(9);
        let module = one_function_module(body.clone());
        let generator = TemplateCodegen::new(FeatureSet::all());
        let function = FunctionToCompile {
            module: &module,
            func_index: 0,
            tier: ExecutionTier::Optimized,
            body: &body,
            body_offset: 0,
        };
        assert!(generator.validate(function).is_ok());

        let bad = ModuleBuilder::invalid_body();
        let function = FunctionToCompile {
            body: &bad,
            ..function
        };
        assert!(generator.validate(function).is_err());
    }
}
