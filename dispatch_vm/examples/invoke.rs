// Copyright 2026 the Dispatch VM Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Minimal embedding example.
//!
//! Run with:
//! `cargo run -p dispatch_vm --example invoke`

use std::sync::Arc;

use anyhow::Result;

use dispatch_vm::context::Context;
use dispatch_vm::invocation::invoke;
use dispatch_vm::native::{ExportSignature, ExportSpec, NativeModule};
use dispatch_vm::registers::{RegisterList, i32_reg};
use dispatch_vm::value::{Value, ValueKind, VariantList};

fn main() -> Result<()> {
    // `math` exports an increment; `calc` imports it and exports add2.
    let math = NativeModule::builder("math")
        .export(
            ExportSpec::new(
                "inc",
                ExportSignature::new(&[ValueKind::I32], &[ValueKind::I32]),
            ),
            |call| {
                let v = call.arg_i32(0)?;
                call.set_result_i32(0, v + 1)
            },
        )
        .build()?;

    let calc = NativeModule::builder("calc")
        .import("math.inc")
        .export(
            ExportSpec::new(
                "add2",
                ExportSignature::new(&[ValueKind::I32], &[ValueKind::I32]),
            )
            .with_registers(3, 0),
            |call| {
                let args = RegisterList::from_slice(&[i32_reg(0)]);
                call.call_import(0, &args, RegisterList::from_slice(&[i32_reg(1)]))?;
                let once = RegisterList::from_slice(&[i32_reg(1)]);
                call.call_import(0, &once, RegisterList::from_slice(&[i32_reg(2)]))?;
                let v = call.registers()?.read_i32(2);
                call.set_result_i32(0, v)
            },
        )
        .build()?;

    let mut context = Context::new();
    context.register_modules(&[Arc::new(math), Arc::new(calc)], None)?;

    let function = context.resolve_function("calc.add2")?;
    let mut inputs = VariantList::with_capacity(1);
    inputs.push_i32(40)?;
    let mut outputs = VariantList::with_capacity(1);
    invoke(&context, &function, inputs, &mut outputs)?;

    println!(
        "calc.add2(40) = {:?}",
        outputs.get(0).and_then(Value::as_i32)
    );
    Ok(())
}
