use std::sync::{Arc, Mutex};

use riptide_core::{Code, ExecutionTier, Module, TrapHandlerMode};

use crate::state::CompilationState;

// Universal trampoline body shared by every lazily compiled function.
static LAZY_TRAMPOLINE: [u8; 6] = [0x55, 0xE8, 0x00, 0x00, 0x00, 0xC3];

fn platform_supports_guard_regions() -> bool {
    // Guard regions need large address-space reservations.
    cfg!(target_pointer_width = "64")
}

#[derive(Default)]
struct CodeSlot {
    code: Option<Code>,
    lazy_stub: bool,
}

/// Per-module container for installed native code.
///
/// Code slots are written only by the foreground finisher (or the lazy
/// compiler); replacement is monotone in tier, so an optimized result may
/// replace a baseline one but never the other way around.
pub struct NativeModule {
    module: Arc<Module>,
    state: Arc<CompilationState>,
    guard_regions: bool,
    code: Mutex<Vec<CodeSlot>>,
}

impl std::fmt::Debug for NativeModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeModule")
            .field("module", &self.module)
            .field("guard_regions", &self.guard_regions)
            .finish_non_exhaustive()
    }
}

impl NativeModule {
    pub(crate) fn new(
        module: Arc<Module>,
        state: Arc<CompilationState>,
        trap_handler: TrapHandlerMode,
    ) -> Arc<Self> {
        let guard_regions = match trap_handler {
            TrapHandlerMode::Preferred => platform_supports_guard_regions(),
            TrapHandlerMode::Disabled => false,
        };
        let slots = (0..module.num_declared_functions())
            .map(|_| CodeSlot::default())
            .collect();
        let native = Arc::new(Self {
            module,
            state,
            guard_regions,
            code: Mutex::new(slots),
        });
        native.state.attach_native(&native);
        native
    }

    /// The decoded module this code belongs to.
    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }

    /// Whether out-of-bounds accesses are caught by guard regions rather
    /// than explicit bounds checks.
    pub fn uses_guard_regions(&self) -> bool {
        self.guard_regions
    }

    /// Number of declared functions (and code slots).
    pub fn num_functions(&self) -> u32 {
        self.module.num_declared_functions()
    }

    /// Installed code for a declared function, if any.
    pub fn code(&self, declared_index: u32) -> Option<Code> {
        let slots = self.code.lock().expect("code table poisoned");
        slots.get(declared_index as usize)?.code.clone()
    }

    /// Tier of the installed code for a declared function.
    pub fn installed_tier(&self, declared_index: u32) -> Option<ExecutionTier> {
        let slots = self.code.lock().expect("code table poisoned");
        slots.get(declared_index as usize)?.code.as_ref().map(Code::tier)
    }

    /// Whether the slot still holds the universal lazy trampoline.
    pub fn has_lazy_stub(&self, declared_index: u32) -> bool {
        let slots = self.code.lock().expect("code table poisoned");
        slots
            .get(declared_index as usize)
            .is_some_and(|slot| slot.lazy_stub && slot.code.is_none())
    }

    /// Entry address of the universal lazy trampoline.
    pub fn lazy_trampoline_address() -> usize {
        LAZY_TRAMPOLINE.as_ptr() as usize
    }

    /// Optional features the compiled functions were observed using.
    pub fn detected_features(&self) -> riptide_core::FeatureSet {
        self.state.detected_features()
    }

    /// Cancel this module's outstanding compilation tasks and block until
    /// every background and foreground task has completed or been
    /// cancelled. Idempotent.
    pub fn cancel_and_wait(&self) {
        self.state.cancel_and_wait();
    }

    /// Install generated code, replacing existing code of the same or a
    /// lower tier.
    pub(crate) fn install_code(&self, code: Code) {
        let mut slots = self.code.lock().expect("code table poisoned");
        let Some(slot) = slots.get_mut(code.func_index() as usize) else {
            debug_assert!(false, "install for unknown function {}", code.func_index());
            return;
        };
        match &slot.code {
            Some(existing) if existing.tier() > code.tier() => {}
            _ => slot.code = Some(code),
        }
    }

    /// Fill every slot with the universal lazy trampoline.
    pub(crate) fn install_lazy_stubs(&self) {
        let mut slots = self.code.lock().expect("code table poisoned");
        for slot in slots.iter_mut() {
            slot.lazy_stub = true;
        }
    }

    pub(crate) fn state(&self) -> &Arc<CompilationState> {
        &self.state
    }
}

impl Drop for NativeModule {
    fn drop(&mut self) {
        // Stragglers still compiling for this module have nowhere to
        // install; let them drain.
        self.state.cancel_background();
    }
}

/// The host-facing module object: the native module plus its export call
/// adapters. Touched only on the foreground.
pub struct ModuleObject {
    native: Arc<NativeModule>,
    export_wrappers: Mutex<Vec<Arc<Code>>>,
}

impl std::fmt::Debug for ModuleObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleObject")
            .field("native", &self.native)
            .finish_non_exhaustive()
    }
}

impl ModuleObject {
    pub(crate) fn new(native: Arc<NativeModule>) -> Arc<Self> {
        Arc::new(Self {
            native,
            export_wrappers: Mutex::new(Vec::new()),
        })
    }

    /// The underlying native module.
    pub fn native(&self) -> &Arc<NativeModule> {
        &self.native
    }

    /// JS↔Wasm adapters for the exported functions, in export order.
    pub fn export_wrappers(&self) -> Vec<Arc<Code>> {
        self.export_wrappers
            .lock()
            .expect("wrappers poisoned")
            .clone()
    }

    pub(crate) fn set_export_wrappers(&self, wrappers: Vec<Arc<Code>>) {
        *self.export_wrappers.lock().expect("wrappers poisoned") = wrappers;
    }
}
