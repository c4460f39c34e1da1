// Copyright 2026 the Dispatch VM Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Execution contexts.
//!
//! A [`Context`] composes an ordered list of modules into a unit of
//! isolation. Registration allocates per-context state for each module,
//! resolves its imports by qualified name against previously registered
//! modules, and runs its `__init` export; teardown runs `__deinit` exports
//! in reverse registration order before freeing state.
//!
//! Import resolution scans the module list in reverse, so a later-registered
//! module shadows an earlier one with the same name. This is a stability
//! guarantee: embedders may rely on it to override modules.
//!
//! A context is mutable during registration only; afterwards it is
//! effectively read-only until teardown, and the host must serialize
//! registrations, invocations, and teardown on a single context.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::module::{Function, Linkage, Module, ModuleState, lookup_function_by_name};
use crate::stack::{Stack, StateResolver};
use crate::status::Status;

/// Name of the export run once after a module's imports resolve.
pub const INIT_EXPORT_NAME: &str = "__init";
/// Name of the export run once at context teardown, before state free.
pub const DEINIT_EXPORT_NAME: &str = "__deinit";

/// Receives diagnostics emitted during module registration.
pub trait DiagSink {
    /// An import of `module_name` failed to resolve; `full_name` is the
    /// unresolved qualified name.
    fn unresolved_import(&mut self, module_name: &str, full_name: &str);
}

/// Splits a qualified `module.function` name at the first `.`.
///
/// Names are ASCII; a missing dot or empty module name fails with
/// [`Status::InvalidArgument`].
pub fn split_qualified_name(full_name: &str) -> Result<(&str, &str), Status> {
    let (module_name, function_name) = full_name
        .split_once('.')
        .ok_or(Status::InvalidArgument)?;
    if module_name.is_empty() {
        return Err(Status::InvalidArgument);
    }
    Ok((module_name, function_name))
}

fn next_context_id() -> u64 {
    // Monotonic across the process; the value has no meaning beyond
    // uniqueness.
    static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);
    NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// An isolated execution context over an ordered list of modules.
///
/// The module list and the per-module state list stay index-aligned at all
/// times; a state slot is non-null only once its module has been fully
/// initialized.
pub struct Context {
    context_id: u64,
    static_capacity: Option<usize>,
    modules: Vec<Arc<dyn Module>>,
    states: Vec<Option<Arc<dyn ModuleState>>>,
}

impl Context {
    /// Creates an empty context whose module list grows as modules are
    /// registered.
    #[must_use]
    pub fn new() -> Self {
        Self {
            context_id: next_context_id(),
            static_capacity: None,
            modules: Vec::new(),
            states: Vec::new(),
        }
    }

    /// Creates a context over a fixed module list.
    ///
    /// The context is *static*: its capacity is the initial module count and
    /// further registrations fail with [`Status::FailedPrecondition`].
    pub fn with_modules(
        modules: &[Arc<dyn Module>],
        diag: Option<&mut dyn DiagSink>,
    ) -> Result<Self, Status> {
        let mut context = Self {
            context_id: next_context_id(),
            static_capacity: if modules.is_empty() {
                None
            } else {
                Some(modules.len())
            },
            modules: Vec::with_capacity(modules.len()),
            states: Vec::with_capacity(modules.len()),
        };
        context.register_modules(modules, diag)?;
        Ok(context)
    }

    /// Returns this context's process-unique id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.context_id
    }

    /// Returns the number of registered modules.
    #[must_use]
    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Returns the module registered at `index`.
    #[must_use]
    pub fn module(&self, index: usize) -> Option<&Arc<dyn Module>> {
        self.modules.get(index)
    }

    /// Registers `modules` in order.
    ///
    /// For each module: it is retained and appended, its state is allocated,
    /// its imports are resolved against the modules registered before it
    /// (its own exports are not visible to itself), and its `__init` export
    /// runs on a scratch stack. Any failure rolls the whole batch back and
    /// returns the error; `__deinit` runs only for batch members whose
    /// `__init` completed.
    ///
    /// Unresolved import names are additionally reported to `diag`.
    pub fn register_modules(
        &mut self,
        modules: &[Arc<dyn Module>],
        mut diag: Option<&mut dyn DiagSink>,
    ) -> Result<(), Status> {
        if let Some(capacity) = self.static_capacity
            && self.modules.len() + modules.len() > capacity
        {
            return Err(Status::FailedPrecondition);
        }

        let original_count = self.modules.len();
        for module in modules {
            self.modules.push(Arc::clone(module));
            self.states.push(None);

            let state = match module.alloc_state() {
                Ok(state) => state,
                Err(status) => {
                    let last = self.modules.len() - 1;
                    self.release_modules(original_count, last);
                    return Err(status);
                }
            };
            let slot = self.states.len() - 1;
            self.states[slot] = Some(Arc::clone(&state));

            // Imports see only the modules registered before this one.
            let visible = self.modules.len() - 1;
            let diag_reborrow: Option<&mut dyn DiagSink> = match diag {
                Some(ref mut d) => Some(&mut **d),
                None => None,
            };
            if let Err(status) =
                self.resolve_module_imports(visible, module, &state, diag_reborrow)
            {
                let last = self.modules.len() - 1;
                self.release_modules(original_count, last);
                return Err(status);
            }

            // __init may reference imports, so it runs only after they
            // resolve.
            if let Ok(init) = lookup_function_by_name(module, Linkage::Export, INIT_EXPORT_NAME) {
                let init_result = {
                    let mut stack = Stack::new(&*self);
                    init.module.call(&mut stack, &init, None).map(|_| ())
                };
                if let Err(status) = init_result {
                    let last = self.modules.len() - 1;
                    self.release_modules(original_count, last);
                    return Err(status);
                }
            }
        }
        Ok(())
    }

    /// Resolves a function by qualified `module.function` name.
    ///
    /// The module list is scanned in reverse registration order, so a
    /// later-registered module shadows an earlier one with the same name.
    pub fn resolve_function(&self, full_name: &str) -> Result<Function, Status> {
        self.resolve_function_in(self.modules.len(), full_name)
    }

    fn resolve_function_in(&self, visible: usize, full_name: &str) -> Result<Function, Status> {
        let (module_name, function_name) = split_qualified_name(full_name)?;
        for module in self.modules[..visible].iter().rev() {
            if module.name() == module_name {
                return lookup_function_by_name(module, Linkage::Export, function_name);
            }
        }
        Err(Status::NotFound)
    }

    fn resolve_module_imports(
        &self,
        visible: usize,
        module: &Arc<dyn Module>,
        state: &Arc<dyn ModuleState>,
        mut diag: Option<&mut dyn DiagSink>,
    ) -> Result<(), Status> {
        let signature = module.signature();
        for raw_ordinal in 0..signature.import_function_count {
            let ordinal = u16::try_from(raw_ordinal).map_err(|_| Status::InvalidArgument)?;
            let decl = module.function(Linkage::Import, ordinal)?;
            match self.resolve_function_in(visible, decl.name) {
                Ok(target) => module.resolve_import(state.as_ref(), ordinal, target)?,
                Err(status) => {
                    if let Some(sink) = diag.as_mut() {
                        sink.unresolved_import(module.name(), decl.name);
                    }
                    return Err(status);
                }
            }
        }
        Ok(())
    }

    // Tears down modules [start..) in reverse registration order: __deinit
    // for fully initialized members (index < deinit_end), then state free,
    // then module release.
    fn release_modules(&mut self, start: usize, deinit_end: usize) {
        for index in (start..deinit_end).rev() {
            if self.states[index].is_none() {
                // Partially initialized; skip.
                continue;
            }
            let module = Arc::clone(&self.modules[index]);
            if let Ok(deinit) =
                lookup_function_by_name(&module, Linkage::Export, DEINIT_EXPORT_NAME)
            {
                let mut stack = Stack::new(&*self);
                let _ = deinit.module.call(&mut stack, &deinit, None);
            }
        }

        for index in (start..self.modules.len()).rev() {
            self.states[index] = None;
        }
        self.modules.truncate(start);
        self.states.truncate(start);
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.context_id)
            .field("modules", &self.modules.len())
            .field("is_static", &self.static_capacity.is_some())
            .finish()
    }
}

impl StateResolver for Context {
    fn query_module_state(&self, module: &Arc<dyn Module>) -> Result<Arc<dyn ModuleState>, Status> {
        // Linear scan; module lists stay small (N < 4 in practice).
        for (candidate, state) in self.modules.iter().zip(&self.states) {
            if Arc::ptr_eq(candidate, module) {
                return state.clone().ok_or(Status::NotFound);
            }
        }
        Err(Status::NotFound)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let count = self.modules.len();
        self.release_modules(0, count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{ExportSignature, ExportSpec, NativeModule};
    use crate::value::ValueKind;
    use alloc::string::String;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicUsize, Ordering};

    fn identity_module(name: &str) -> Arc<dyn Module> {
        let module = NativeModule::builder(name)
            .export(
                ExportSpec::new("id", ExportSignature::new(&[ValueKind::I32], &[ValueKind::I32])),
                |call| {
                    let v = call.arg_i32(0)?;
                    call.set_result_i32(0, v)
                },
            )
            .build()
            .unwrap();
        Arc::new(module)
    }

    #[derive(Default)]
    struct RecordingSink {
        unresolved: Vec<(String, String)>,
    }

    impl DiagSink for RecordingSink {
        fn unresolved_import(&mut self, module_name: &str, full_name: &str) {
            self.unresolved.push((module_name.into(), full_name.into()));
        }
    }

    #[test]
    fn qualified_names_split_on_first_dot() {
        assert_eq!(split_qualified_name("a.b"), Ok(("a", "b")));
        assert_eq!(split_qualified_name("a.b.c"), Ok(("a", "b.c")));
        assert_eq!(split_qualified_name("ab"), Err(Status::InvalidArgument));
        assert_eq!(split_qualified_name(".b"), Err(Status::InvalidArgument));
    }

    #[test]
    fn context_ids_are_unique() {
        let a = Context::new();
        let b = Context::new();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn registration_and_resolution() {
        let mut context = Context::new();
        context
            .register_modules(&[identity_module("m")], None)
            .unwrap();
        assert_eq!(context.module_count(), 1);

        let function = context.resolve_function("m.id").unwrap();
        assert_eq!(function.linkage, Linkage::Export);
        assert_eq!(
            context.resolve_function("m.missing").err(),
            Some(Status::NotFound)
        );
        assert_eq!(
            context.resolve_function("other.id").err(),
            Some(Status::NotFound)
        );
    }

    #[test]
    fn later_modules_shadow_earlier_names() {
        let mut context = Context::new();
        let first = identity_module("m");
        let second = identity_module("m");
        context
            .register_modules(&[Arc::clone(&first), Arc::clone(&second)], None)
            .unwrap();

        let resolved = context.resolve_function("m.id").unwrap();
        assert!(Arc::ptr_eq(&resolved.module, &second));
    }

    #[test]
    fn static_contexts_reject_further_registration() {
        let mut context =
            Context::with_modules(&[identity_module("a")], None).unwrap();
        assert_eq!(
            context.register_modules(&[identity_module("b")], None),
            Err(Status::FailedPrecondition)
        );
        assert_eq!(context.module_count(), 1);
    }

    #[test]
    fn unresolved_imports_roll_back_and_report() {
        let importer = NativeModule::builder("b").import("a.missing").build().unwrap();
        let mut context = Context::new();
        let mut sink = RecordingSink::default();
        let status = context.register_modules(
            &[identity_module("a"), Arc::new(importer)],
            Some(&mut sink),
        );
        assert_eq!(status, Err(Status::NotFound));
        // The whole batch rolls back.
        assert_eq!(context.module_count(), 0);
        assert_eq!(sink.unresolved, [("b".into(), "a.missing".into())]);
    }

    #[test]
    fn own_exports_are_not_visible_to_own_imports() {
        let module = NativeModule::builder("m")
            .import("m.id")
            .export(
                ExportSpec::new("id", ExportSignature::new(&[ValueKind::I32], &[ValueKind::I32])),
                |call| {
                    let v = call.arg_i32(0)?;
                    call.set_result_i32(0, v)
                },
            )
            .build()
            .unwrap();
        let mut context = Context::new();
        assert_eq!(
            context.register_modules(&[Arc::new(module)], None),
            Err(Status::NotFound)
        );
        assert_eq!(context.module_count(), 0);
    }

    #[test]
    fn failed_init_rolls_back_batch() {
        static INITS: AtomicUsize = AtomicUsize::new(0);
        INITS.store(0, Ordering::SeqCst);

        let good = NativeModule::builder("good")
            .export(ExportSpec::new(INIT_EXPORT_NAME, ExportSignature::default()), |_| {
                INITS.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .build()
            .unwrap();
        let bad = NativeModule::builder("bad")
            .export(ExportSpec::new(INIT_EXPORT_NAME, ExportSignature::default()), |_| {
                Err(Status::Internal)
            })
            .build()
            .unwrap();

        let mut context = Context::new();
        let status =
            context.register_modules(&[Arc::new(good), Arc::new(bad)], None);
        assert_eq!(status, Err(Status::Internal));
        assert_eq!(context.module_count(), 0);
        assert_eq!(INITS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn state_query_matches_by_module_identity() {
        let module = identity_module("m");
        let stranger = identity_module("s");
        let mut context = Context::new();
        context
            .register_modules(&[Arc::clone(&module)], None)
            .unwrap();

        assert!(context.query_module_state(&module).is_ok());
        assert_eq!(
            context.query_module_state(&stranger).err(),
            Some(Status::NotFound)
        );
    }
}
