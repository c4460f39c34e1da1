// Copyright 2026 the Dispatch VM Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The loadable-module contract.
//!
//! A module is a unit of compiled or host-implemented code plus its
//! reflection metadata. Modules are composed into a
//! [`Context`](crate::context::Context), which allocates per-context state
//! for each of them and links their imports by qualified name.
//!
//! Module implementations must be thread-safe at the interface level:
//! lookups and calls may arrive in any order from any thread. Module
//! *states* are thread-compatible only and are never shared between stacks
//! executing in parallel without external synchronization.

use alloc::sync::Arc;
use core::any::Any;
use core::fmt;

use crate::format::read_module_header;
use crate::registers::RegisterList;
use crate::stack::Stack;
use crate::status::Status;

/// Function visibility within a module.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Linkage {
    /// Internal to the module; may not be reflectable.
    Internal,
    /// An import from another module.
    Import,
    /// An export visible to other modules and the host.
    Export,
}

/// Counts of the functions a module declares, by linkage.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ModuleSignature {
    /// Number of imported functions.
    pub import_function_count: u32,
    /// Number of exported functions.
    pub export_function_count: u32,
    /// Number of internal functions, when reflection data is present.
    pub internal_function_count: u32,
}

/// Argument/result arity of a function.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FunctionSignature {
    /// Number of arguments.
    pub argument_count: u32,
    /// Number of results.
    pub result_count: u32,
}

/// An unbound function reference returned by module reflection.
///
/// The register counts size the storage reserved for the function's stack
/// frame; they must at least cover the function's entry arguments.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FunctionInfo {
    /// Function linkage.
    pub linkage: Linkage,
    /// Ordinal within the module, scoped to the linkage.
    pub ordinal: u16,
    /// i32 registers used by the function.
    pub i32_register_count: u16,
    /// Reference registers used by the function.
    pub ref_register_count: u16,
}

/// One reflected function: its reference, name, and arity.
#[derive(Clone, Debug)]
pub struct FunctionDecl<'m> {
    /// The unbound function reference.
    pub info: FunctionInfo,
    /// The function name (qualified for imports).
    pub name: &'m str,
    /// Argument/result arity.
    pub signature: FunctionSignature,
}

/// A function reference bound to its owning module.
#[derive(Clone)]
pub struct Function {
    /// The module the function lives in.
    pub module: Arc<dyn Module>,
    /// Function linkage.
    pub linkage: Linkage,
    /// Ordinal within the module, scoped to the linkage.
    pub ordinal: u16,
    /// i32 registers used by the function.
    pub i32_register_count: u16,
    /// Reference registers used by the function.
    pub ref_register_count: u16,
}

impl Function {
    /// Binds `info` to its owning `module`.
    #[must_use]
    pub fn bind(module: &Arc<dyn Module>, info: FunctionInfo) -> Self {
        Self {
            module: Arc::clone(module),
            linkage: info.linkage,
            ordinal: info.ordinal,
            i32_register_count: info.i32_register_count,
            ref_register_count: info.ref_register_count,
        }
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("module", &self.module.name())
            .field("linkage", &self.linkage)
            .field("ordinal", &self.ordinal)
            .field("i32_register_count", &self.i32_register_count)
            .field("ref_register_count", &self.ref_register_count)
            .finish()
    }
}

/// Outcome of a module call.
///
/// Anything other than [`ExecutionResult::Yield`] is treated as completion by
/// the synchronous invocation path. Yield delivery to the host is a deferred
/// feature; the stack is left intact across a yield so the module's
/// [`Module::resume`] can continue it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExecutionResult {
    /// The call ran to completion and its frame has been popped.
    Complete,
    /// The call suspended at an explicit yield point.
    Yield,
}

/// Opaque per-context module state.
///
/// The layout is private to the owning module; the context owns the
/// lifetime. States are thread-compatible only.
pub trait ModuleState: Any {
    /// Returns the state as [`Any`] for downcasting by its owning module.
    fn as_any(&self) -> &dyn Any;
}

/// The capability set every loadable module implements.
///
/// The contract is flat: there is no inheritance between module kinds, and
/// the runtime composes modules purely through this interface.
pub trait Module {
    /// Returns the module name used during import resolution.
    fn name(&self) -> &str;

    /// Returns the reflected module signature.
    fn signature(&self) -> ModuleSignature;

    /// Reflects one function by linkage and ordinal.
    fn function(&self, linkage: Linkage, ordinal: u16) -> Result<FunctionDecl<'_>, Status>;

    /// Looks up a function by name within a linkage scope.
    ///
    /// This may perform a linear scan; callers should cache the result.
    fn lookup_function(&self, linkage: Linkage, name: &str) -> Result<FunctionInfo, Status>;

    /// Allocates this module's per-context state.
    ///
    /// Dropping the returned handle frees the state; the context does so
    /// during teardown, after the module's `__deinit` has run.
    fn alloc_state(&self) -> Result<Arc<dyn ModuleState>, Status>;

    /// Resolves the import at `ordinal` to `function`.
    ///
    /// Called once per import ordinal at context registration time, strictly
    /// before the module's `__init` runs. The resolved function remains
    /// valid for the lifetime of `state`.
    fn resolve_import(
        &self,
        state: &dyn ModuleState,
        ordinal: u16,
        function: Function,
    ) -> Result<(), Status>;

    /// Calls `function` with arguments sourced from the caller stack frame.
    ///
    /// `argument_registers` names registers in the caller frame; they are
    /// consumed during the initial call. Results are stored into the caller
    /// frame's return-register list on completion. The call is synchronous
    /// from the caller's standpoint.
    fn call(
        &self,
        stack: &mut Stack<'_>,
        function: &Function,
        argument_registers: Option<&RegisterList>,
    ) -> Result<ExecutionResult, Status>;

    /// Calls `function` with variadic arguments.
    ///
    /// `segment_sizes` carries one entry per logical operand group: `1` for
    /// a fixed argument, `N` for a variadic group of length `N`. Segment
    /// sizes are resolved strictly before argument remapping.
    fn call_variadic(
        &self,
        stack: &mut Stack<'_>,
        function: &Function,
        argument_registers: Option<&RegisterList>,
        segment_sizes: &RegisterList,
    ) -> Result<ExecutionResult, Status> {
        let _ = segment_sizes;
        self.call(stack, function, argument_registers)
    }

    /// Resumes execution of a previously yielded call.
    fn resume(&self, stack: &mut Stack<'_>) -> Result<ExecutionResult, Status> {
        let _ = stack;
        Err(Status::FailedPrecondition)
    }

    /// Returns the reflection attribute at `index` for a function.
    ///
    /// Fails with [`Status::NotFound`] once `index` passes the attribute
    /// count. Not all modules or functions carry attributes.
    fn function_attr(
        &self,
        linkage: Linkage,
        ordinal: u16,
        index: usize,
    ) -> Result<(&str, &str), Status> {
        let _ = (linkage, ordinal, index);
        Err(Status::NotFound)
    }
}

/// Looks up a function by name and binds it to `module`.
pub fn lookup_function_by_name(
    module: &Arc<dyn Module>,
    linkage: Linkage,
    name: &str,
) -> Result<Function, Status> {
    let info = module.lookup_function(linkage, name)?;
    Ok(Function::bind(module, info))
}

/// Reflects a function by ordinal and binds it to `module`.
pub fn function_by_ordinal(
    module: &Arc<dyn Module>,
    linkage: Linkage,
    ordinal: u16,
) -> Result<Function, Status> {
    let decl = module.function(linkage, ordinal)?;
    Ok(Function::bind(module, decl.info))
}

/// Validates the fixed header of a compiled module blob.
///
/// The runtime performs this check before handing `bytes` to a module
/// loader; malformed blobs fail with [`Status::InvalidArgument`].
pub fn validate_module_blob(bytes: &[u8]) -> Result<(), Status> {
    read_module_header(bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Writer, write_module_header};

    #[test]
    fn blob_validation_accepts_current_header() {
        let mut w = Writer::new();
        write_module_header(&mut w);
        assert_eq!(validate_module_blob(w.as_slice()), Ok(()));
    }

    #[test]
    fn blob_validation_rejects_malformed_input() {
        assert_eq!(validate_module_blob(&[]), Err(Status::InvalidArgument));
        assert_eq!(
            validate_module_blob(&[0xFF; 32]),
            Err(Status::InvalidArgument)
        );
    }
}
