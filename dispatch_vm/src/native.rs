// Copyright 2026 the Dispatch VM Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Host-implemented modules.
//!
//! A [`NativeModule`] exposes host closures as module exports so embedders
//! can provide functionality to compiled modules (and tests can exercise the
//! runtime) without going through a bytecode loader. Exports are declared
//! with typed signatures; imports are declared as qualified names and
//! resolved by the context at registration time.
//!
//! Handlers run with a [`CallContext`] that exposes the frame's registers in
//! ABI layout and can call resolved imports, which pushes further frames on
//! the same stack.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::any::Any;
use core::cell::RefCell;
use core::fmt;

use hashbrown::HashMap;

use crate::module::{
    ExecutionResult, Function, FunctionDecl, FunctionInfo, FunctionSignature, Linkage, Module,
    ModuleSignature, ModuleState,
};
use crate::reference::Ref;
use crate::registers::{self, I32_ORDINAL_MASK, REF_ORDINAL_MASK, RegisterList};
use crate::stack::{RegisterView, Stack};
use crate::status::Status;
use crate::value::ValueKind;

/// Typed argument/result layout of a native export.
///
/// Arguments and results are marshaled in ABI order: values of each kind
/// pack left-to-right from ordinal 0 in their bank.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExportSignature {
    /// Argument kinds, in declaration order.
    pub arguments: Vec<ValueKind>,
    /// Result kinds, in declaration order.
    pub results: Vec<ValueKind>,
}

impl ExportSignature {
    /// Builds a signature from argument and result kinds.
    #[must_use]
    pub fn new(arguments: &[ValueKind], results: &[ValueKind]) -> Self {
        Self {
            arguments: arguments.to_vec(),
            results: results.to_vec(),
        }
    }

    fn count_of(kinds: &[ValueKind], kind: ValueKind) -> u16 {
        kinds.iter().filter(|k| **k == kind).count() as u16
    }

    fn i32_argument_count(&self) -> u16 {
        Self::count_of(&self.arguments, ValueKind::I32)
    }

    fn ref_argument_count(&self) -> u16 {
        Self::count_of(&self.arguments, ValueKind::Ref)
    }

    fn i32_result_count(&self) -> u16 {
        Self::count_of(&self.results, ValueKind::I32)
    }

    fn ref_result_count(&self) -> u16 {
        Self::count_of(&self.results, ValueKind::Ref)
    }

    fn function_signature(&self) -> FunctionSignature {
        FunctionSignature {
            argument_count: self.arguments.len() as u32,
            result_count: self.results.len() as u32,
        }
    }
}

/// Declaration of one native export.
#[derive(Clone, Debug)]
pub struct ExportSpec {
    name: String,
    signature: ExportSignature,
    i32_registers: Option<u16>,
    ref_registers: Option<u16>,
    attrs: Vec<(String, String)>,
}

impl ExportSpec {
    /// Declares an export named `name` with `signature`.
    #[must_use]
    pub fn new(name: impl Into<String>, signature: ExportSignature) -> Self {
        Self {
            name: name.into(),
            signature,
            i32_registers: None,
            ref_registers: None,
            attrs: Vec::new(),
        }
    }

    /// Requests explicit per-bank register counts.
    ///
    /// The effective counts are never below what the signature's arguments
    /// and results require.
    #[must_use]
    pub fn with_registers(mut self, i32_registers: u16, ref_registers: u16) -> Self {
        self.i32_registers = Some(i32_registers);
        self.ref_registers = Some(ref_registers);
        self
    }

    /// Attaches a reflection attribute.
    #[must_use]
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.push((key.into(), value.into()));
        self
    }
}

/// Handler signature for native exports.
pub type ExportHandler =
    Box<dyn Fn(&mut CallContext<'_, '_>) -> Result<(), Status> + Send + Sync>;

type StateFactory = Box<dyn Fn() -> Arc<dyn Any + Send + Sync> + Send + Sync>;

struct NativeExport {
    name: String,
    signature: ExportSignature,
    i32_registers: u16,
    ref_registers: u16,
    attrs: Vec<(String, String)>,
    handler: ExportHandler,
}

/// A native module build failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildError {
    /// Two exports share a name.
    DuplicateExport {
        /// The colliding export name.
        name: String,
    },
    /// An export requested more registers than an ordinal can address.
    RegisterLimitExceeded {
        /// The offending export name.
        name: String,
    },
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateExport { name } => write!(f, "duplicate export '{name}'"),
            Self::RegisterLimitExceeded { name } => {
                write!(f, "export '{name}' exceeds the register ordinal limit")
            }
        }
    }
}

impl core::error::Error for BuildError {}

/// Builder for [`NativeModule`].
pub struct NativeModuleBuilder {
    name: String,
    imports: Vec<String>,
    exports: Vec<(ExportSpec, ExportHandler)>,
    state_factory: Option<StateFactory>,
}

impl NativeModuleBuilder {
    /// Starts a module named `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            imports: Vec::new(),
            exports: Vec::new(),
            state_factory: None,
        }
    }

    /// Declares an import by qualified `module.function` name.
    ///
    /// Import ordinals follow declaration order.
    #[must_use]
    pub fn import(mut self, full_name: impl Into<String>) -> Self {
        self.imports.push(full_name.into());
        self
    }

    /// Declares an export backed by `handler`.
    ///
    /// Export ordinals follow declaration order.
    #[must_use]
    pub fn export<F>(mut self, spec: ExportSpec, handler: F) -> Self
    where
        F: Fn(&mut CallContext<'_, '_>) -> Result<(), Status> + Send + Sync + 'static,
    {
        self.exports.push((spec, Box::new(handler)));
        self
    }

    /// Attaches a per-context user state factory.
    ///
    /// The factory runs once per context registration; handlers reach the
    /// produced value through [`CallContext::user_state`].
    #[must_use]
    pub fn state<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Any + Send + Sync> + Send + Sync + 'static,
    {
        self.state_factory = Some(Box::new(factory));
        self
    }

    /// Finalizes the module.
    pub fn build(self) -> Result<NativeModule, BuildError> {
        let mut exports = Vec::with_capacity(self.exports.len());
        let mut export_index = HashMap::with_capacity(self.exports.len());
        for (ordinal, (spec, handler)) in self.exports.into_iter().enumerate() {
            let i32_registers = spec
                .i32_registers
                .unwrap_or(0)
                .max(spec.signature.i32_argument_count())
                .max(spec.signature.i32_result_count());
            let ref_registers = spec
                .ref_registers
                .unwrap_or(0)
                .max(spec.signature.ref_argument_count())
                .max(spec.signature.ref_result_count());
            if i32_registers > I32_ORDINAL_MASK || ref_registers > REF_ORDINAL_MASK {
                return Err(BuildError::RegisterLimitExceeded { name: spec.name });
            }
            if export_index
                .insert(spec.name.clone(), ordinal as u16)
                .is_some()
            {
                return Err(BuildError::DuplicateExport { name: spec.name });
            }
            exports.push(NativeExport {
                name: spec.name,
                signature: spec.signature,
                i32_registers,
                ref_registers,
                attrs: spec.attrs,
                handler,
            });
        }
        Ok(NativeModule {
            name: self.name,
            imports: self.imports,
            exports,
            export_index,
            state_factory: self.state_factory,
        })
    }
}

struct NativeState {
    imports: RefCell<Vec<Option<Function>>>,
    user: Option<Arc<dyn Any + Send + Sync>>,
}

impl ModuleState for NativeState {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A module implemented by host closures.
pub struct NativeModule {
    name: String,
    imports: Vec<String>,
    exports: Vec<NativeExport>,
    export_index: HashMap<String, u16>,
    state_factory: Option<StateFactory>,
}

impl fmt::Debug for NativeModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeModule")
            .field("name", &self.name)
            .field("imports", &self.imports.len())
            .field("exports", &self.exports.len())
            .finish()
    }
}

impl NativeModule {
    /// Starts building a module named `name`.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> NativeModuleBuilder {
        NativeModuleBuilder::new(name)
    }

    fn call_with_segments(
        &self,
        stack: &mut Stack<'_>,
        function: &Function,
        argument_registers: Option<&RegisterList>,
        segment_sizes: Option<&RegisterList>,
    ) -> Result<ExecutionResult, Status> {
        if function.linkage != Linkage::Export {
            return Err(Status::InvalidArgument);
        }
        let export = self
            .exports
            .get(usize::from(function.ordinal))
            .ok_or(Status::InvalidArgument)?;

        // A caller that recorded no result destinations receives them
        // left-aligned, which is also how the external marshaling frame
        // collects invocation outputs.
        if let Some(caller) = stack.current_frame_mut()
            && caller.return_registers().is_none()
        {
            caller.set_return_registers(Some(packed_result_registers(&export.signature)));
        }

        stack.enter(function.clone(), argument_registers)?;

        let state = stack
            .current_frame()
            .and_then(|frame| frame.module_state().cloned())
            .ok_or(Status::Internal)?;

        let handler_result = {
            let mut call = CallContext {
                stack: &mut *stack,
                state,
                function: function.clone(),
                signature: &export.signature,
                segment_sizes,
            };
            (export.handler)(&mut call)
        };
        if let Err(status) = handler_result {
            // Unwind the frame pushed above before surfacing the error.
            let _ = stack.leave(None);
            return Err(status);
        }

        let results = packed_result_registers(&export.signature);
        stack.leave(Some(&results))?;
        Ok(ExecutionResult::Complete)
    }
}

impl Module for NativeModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn signature(&self) -> ModuleSignature {
        ModuleSignature {
            import_function_count: self.imports.len() as u32,
            export_function_count: self.exports.len() as u32,
            internal_function_count: 0,
        }
    }

    fn function(&self, linkage: Linkage, ordinal: u16) -> Result<FunctionDecl<'_>, Status> {
        match linkage {
            Linkage::Export => {
                let export = self
                    .exports
                    .get(usize::from(ordinal))
                    .ok_or(Status::NotFound)?;
                Ok(FunctionDecl {
                    info: FunctionInfo {
                        linkage,
                        ordinal,
                        i32_register_count: export.i32_registers,
                        ref_register_count: export.ref_registers,
                    },
                    name: &export.name,
                    signature: export.signature.function_signature(),
                })
            }
            Linkage::Import => {
                let name = self
                    .imports
                    .get(usize::from(ordinal))
                    .ok_or(Status::NotFound)?;
                Ok(FunctionDecl {
                    info: FunctionInfo {
                        linkage,
                        ordinal,
                        i32_register_count: 0,
                        ref_register_count: 0,
                    },
                    name,
                    signature: FunctionSignature::default(),
                })
            }
            Linkage::Internal => Err(Status::NotFound),
        }
    }

    fn lookup_function(&self, linkage: Linkage, name: &str) -> Result<FunctionInfo, Status> {
        match linkage {
            Linkage::Export => {
                let ordinal = *self.export_index.get(name).ok_or(Status::NotFound)?;
                Ok(self.function(linkage, ordinal)?.info)
            }
            Linkage::Import => {
                let ordinal = self
                    .imports
                    .iter()
                    .position(|import| import == name)
                    .ok_or(Status::NotFound)?;
                Ok(self.function(linkage, ordinal as u16)?.info)
            }
            Linkage::Internal => Err(Status::NotFound),
        }
    }

    fn alloc_state(&self) -> Result<Arc<dyn ModuleState>, Status> {
        Ok(Arc::new(NativeState {
            imports: RefCell::new(vec![None; self.imports.len()]),
            user: self.state_factory.as_ref().map(|factory| factory()),
        }))
    }

    fn resolve_import(
        &self,
        state: &dyn ModuleState,
        ordinal: u16,
        function: Function,
    ) -> Result<(), Status> {
        let state = state
            .as_any()
            .downcast_ref::<NativeState>()
            .ok_or(Status::InvalidArgument)?;
        let mut imports = state.imports.borrow_mut();
        let slot = imports
            .get_mut(usize::from(ordinal))
            .ok_or(Status::InvalidArgument)?;
        *slot = Some(function);
        Ok(())
    }

    fn call(
        &self,
        stack: &mut Stack<'_>,
        function: &Function,
        argument_registers: Option<&RegisterList>,
    ) -> Result<ExecutionResult, Status> {
        self.call_with_segments(stack, function, argument_registers, None)
    }

    fn call_variadic(
        &self,
        stack: &mut Stack<'_>,
        function: &Function,
        argument_registers: Option<&RegisterList>,
        segment_sizes: &RegisterList,
    ) -> Result<ExecutionResult, Status> {
        // Segment sizes are resolved strictly before any argument remapping.
        let total: usize = segment_sizes.iter().map(usize::from).sum();
        let provided = argument_registers.map_or(0, RegisterList::len);
        if total != provided {
            return Err(Status::InvalidArgument);
        }
        self.call_with_segments(stack, function, argument_registers, Some(segment_sizes))
    }

    fn function_attr(
        &self,
        linkage: Linkage,
        ordinal: u16,
        index: usize,
    ) -> Result<(&str, &str), Status> {
        if linkage != Linkage::Export {
            return Err(Status::NotFound);
        }
        let export = self
            .exports
            .get(usize::from(ordinal))
            .ok_or(Status::NotFound)?;
        let (key, value) = export.attrs.get(index).ok_or(Status::NotFound)?;
        Ok((key, value))
    }
}

// Results pack left-to-right from ordinal 0 per bank; references leave the
// callee by move.
fn packed_result_registers(signature: &ExportSignature) -> RegisterList {
    let mut list = RegisterList::with_capacity(signature.results.len());
    let mut i32_off: u16 = 0;
    let mut ref_off: u16 = 0;
    for kind in &signature.results {
        match kind {
            ValueKind::I32 => {
                list.push(registers::i32_reg(i32_off));
                i32_off += 1;
            }
            ValueKind::Ref => {
                list.push(registers::ref_reg(ref_off, true));
                ref_off += 1;
            }
        }
    }
    list
}

/// Execution context handed to a native export handler.
///
/// Arguments arrive in ABI layout (each kind packed from ordinal 0 in its
/// bank); results are written back the same way. The raw register view is
/// available for handlers that manage their own layout.
pub struct CallContext<'c, 's> {
    stack: &'c mut Stack<'s>,
    state: Arc<dyn ModuleState>,
    function: Function,
    signature: &'c ExportSignature,
    segment_sizes: Option<&'c RegisterList>,
}

impl CallContext<'_, '_> {
    /// Returns a register view of the executing frame.
    ///
    /// The view is invalidated by [`CallContext::call_import`] and
    /// [`CallContext::call_function`] and must be re-derived afterwards.
    pub fn registers(&mut self) -> Result<RegisterView<'_>, Status> {
        self.stack.current_registers().ok_or(Status::Internal)
    }

    /// Returns the function reference currently executing.
    #[must_use]
    pub fn current_function(&self) -> Function {
        self.function.clone()
    }

    /// Returns the variadic segment sizes, when called through
    /// [`Module::call_variadic`].
    #[must_use]
    pub fn segment_sizes(&self) -> Option<&RegisterList> {
        self.segment_sizes
    }

    /// Returns the module's per-context user state, if a factory was
    /// attached.
    #[must_use]
    pub fn user_state(&self) -> Option<&(dyn Any + Send + Sync)> {
        let state = self.state.as_any().downcast_ref::<NativeState>()?;
        state.user.as_ref().map(|user| &**user)
    }

    /// Reads the i32 argument at declaration `index`.
    pub fn arg_i32(&mut self, index: usize) -> Result<i32, Status> {
        let ordinal = self.argument_ordinal(index, ValueKind::I32)?;
        Ok(self.registers()?.read_i32(ordinal))
    }

    /// Retains the reference argument at declaration `index`.
    pub fn arg_ref(&mut self, index: usize) -> Result<Ref, Status> {
        let ordinal = self.argument_ordinal(index, ValueKind::Ref)?;
        Ok(self.registers()?.read_ref(ordinal).retain())
    }

    /// Moves the reference argument at declaration `index` out of its
    /// register.
    pub fn take_arg_ref(&mut self, index: usize) -> Result<Ref, Status> {
        let ordinal = self.argument_ordinal(index, ValueKind::Ref)?;
        Ok(self.registers()?.take_ref(ordinal))
    }

    /// Writes the i32 result at declaration `index`.
    ///
    /// Results share bank ordinals with same-kind arguments; read arguments
    /// before writing results.
    pub fn set_result_i32(&mut self, index: usize, value: i32) -> Result<(), Status> {
        let ordinal = self.result_ordinal(index, ValueKind::I32)?;
        self.registers()?.write_i32(ordinal, value);
        Ok(())
    }

    /// Moves `value` into the reference result at declaration `index`.
    pub fn set_result_ref(&mut self, index: usize, value: Ref) -> Result<(), Status> {
        let ordinal = self.result_ordinal(index, ValueKind::Ref)?;
        self.registers()?.put_ref(ordinal, value);
        Ok(())
    }

    /// Returns the import resolved at `ordinal`.
    pub fn import(&self, ordinal: u16) -> Result<Function, Status> {
        let state = self
            .state
            .as_any()
            .downcast_ref::<NativeState>()
            .ok_or(Status::Internal)?;
        let imports = state.imports.borrow();
        imports
            .get(usize::from(ordinal))
            .and_then(Clone::clone)
            .ok_or(Status::NotFound)
    }

    /// Calls the import at `ordinal`.
    ///
    /// `arguments` and `results` name registers of the executing frame;
    /// results arrive in them when the callee returns.
    pub fn call_import(
        &mut self,
        ordinal: u16,
        arguments: &RegisterList,
        results: RegisterList,
    ) -> Result<(), Status> {
        let target = self.import(ordinal)?;
        self.call_function(&target, arguments, results)
    }

    /// Calls `function`, which may live in this module (self-recursion) or
    /// another.
    pub fn call_function(
        &mut self,
        function: &Function,
        arguments: &RegisterList,
        results: RegisterList,
    ) -> Result<(), Status> {
        self.stack
            .current_frame_mut()
            .ok_or(Status::Internal)?
            .set_return_registers(Some(results));
        let module = Arc::clone(&function.module);
        module
            .call(self.stack, function, Some(arguments))
            .map(|_| ())
    }

    fn argument_ordinal(&self, index: usize, kind: ValueKind) -> Result<u16, Status> {
        Self::kind_ordinal(&self.signature.arguments, index, kind)
    }

    fn result_ordinal(&self, index: usize, kind: ValueKind) -> Result<u16, Status> {
        Self::kind_ordinal(&self.signature.results, index, kind)
    }

    fn kind_ordinal(kinds: &[ValueKind], index: usize, kind: ValueKind) -> Result<u16, Status> {
        if kinds.get(index) != Some(&kind) {
            return Err(Status::InvalidArgument);
        }
        let position = kinds[..index].iter().filter(|k| **k == kind).count();
        Ok(position as u16)
    }
}
