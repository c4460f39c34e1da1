// Copyright 2026 the Dispatch VM Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! `dispatch_vm`: an embeddable register VM runtime for compiled module
//! dispatch.
//!
//! A host program composes loadable [`Module`](module::Module)s into a
//! [`Context`](context::Context), which links imports by qualified name and
//! owns per-module state. Exported functions are invoked synchronously with
//! argument/result marshaling between host [`Value`](value::Value)s and the
//! stack's typed register banks.
//!
//! ## Example
//!
//! ```
//! extern crate alloc;
//!
//! use alloc::sync::Arc;
//!
//! use dispatch_vm::context::Context;
//! use dispatch_vm::invocation::invoke;
//! use dispatch_vm::native::{ExportSignature, ExportSpec, NativeModule};
//! use dispatch_vm::value::{Value, ValueKind, VariantList};
//!
//! let module = NativeModule::builder("math")
//!     .export(
//!         ExportSpec::new(
//!             "square",
//!             ExportSignature::new(&[ValueKind::I32], &[ValueKind::I32]),
//!         ),
//!         |call| {
//!             let v = call.arg_i32(0)?;
//!             call.set_result_i32(0, v * v)
//!         },
//!     )
//!     .build()?;
//!
//! let mut context = Context::new();
//! context.register_modules(&[Arc::new(module)], None)?;
//!
//! let function = context.resolve_function("math.square")?;
//! let mut inputs = VariantList::with_capacity(1);
//! inputs.push_i32(7)?;
//! let mut outputs = VariantList::with_capacity(1);
//! invoke(&context, &function, inputs, &mut outputs)?;
//! assert_eq!(outputs.get(0).and_then(Value::as_i32), Some(49));
//! # Ok::<(), alloc::boxed::Box<dyn core::error::Error>>(())
//! ```

#![no_std]

extern crate alloc;

pub mod context;
pub mod format;
pub mod invocation;
pub mod module;
pub mod native;
pub mod reference;
pub mod registers;
pub mod stack;
pub mod status;
pub mod value;
