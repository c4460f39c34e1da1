// Copyright 2026 the Dispatch VM Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Synchronous invocation of exported functions.

use crate::context::Context;
use crate::module::Function;
use crate::stack::Stack;
use crate::status::Status;
use crate::value::VariantList;

/// Synchronously invokes `function` within `context`.
///
/// A fresh stack is assembled over the context's state resolver; `inputs`
/// marshal into an external frame (the invocation consumes the list) and the
/// target module's call executes to completion, after which result registers
/// drain into `outputs`. References in `outputs` transfer by move and are
/// owned by the list.
///
/// Invocation is blocking and uncancellable. On failure `outputs` is left
/// exactly as provided. Reachability of `function` within `context` is the
/// caller's contract; enforcement is delegated to the target module.
pub fn invoke(
    context: &Context,
    function: &Function,
    inputs: VariantList,
    outputs: &mut VariantList,
) -> Result<(), Status> {
    let mut stack = Stack::new(context);

    let argument_registers = stack.enter_external(&inputs)?;

    // Synchronous execution is expected to complete without yielding; any
    // non-yield result is completion.
    let call_result = function
        .module
        .call(&mut stack, function, Some(&argument_registers));
    drop(inputs);
    call_result?;

    stack.leave_external(outputs)?;
    Ok(())
}
