// Copyright 2026 the Dispatch VM Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The fiber execution stack.
//!
//! A [`Stack`] holds up to [`MAX_STACK_DEPTH`] call frames over two growable
//! register banks, one for i32 primitives and one for reference handles.
//! Frames address their register windows by *base offsets* into the banks,
//! never by host pointers, so bank growth during a deep call cannot
//! invalidate a live frame. Register access goes through a short-lived
//! [`RegisterView`] re-derived from the base offsets at each use site.
//!
//! All required state lives inside the stack itself; no thread-local storage
//! is used, so multiple stacks may execute on one host thread. A single
//! stack must only ever be mutated by one thread at a time.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::module::{Function, Module, ModuleState};
use crate::reference::{Ref, retain_or_move};
use crate::registers::{self, RegisterList, window_for_count};
use crate::status::Status;
use crate::value::{Value, VariantList};

/// Maximum stack depth, in frames.
pub const MAX_STACK_DEPTH: usize = 32;

// Default bank capacities. Conservative estimates chosen to avoid growth for
// simple call trees without overallocating for trivial ones.
const DEFAULT_I32_BANK_CAPACITY: usize = 2048;
const DEFAULT_REF_BANK_CAPACITY: usize = 256;

/// Minimum per-bank window of an external marshaling frame.
///
/// The external frame also receives callee results, whose counts are unknown
/// at entry, so it reserves at least this many registers per bank beyond the
/// measured arguments.
pub const EXTERNAL_REGISTER_FLOOR: u16 = 16;

/// Resolves a module to its per-context state.
///
/// Implemented by [`Context`](crate::context::Context); invoked by the stack
/// on function entry whenever execution transitions between modules.
pub trait StateResolver {
    /// Returns the state paired with `module`.
    fn query_module_state(&self, module: &Arc<dyn Module>) -> Result<Arc<dyn ModuleState>, Status>;
}

/// One call activation on the stack.
#[derive(Clone)]
pub struct Frame {
    pc: i64,
    function: Option<Function>,
    module_state: Option<Arc<dyn ModuleState>>,
    i32_base: usize,
    i32_window: usize,
    i32_mask: u16,
    ref_base: usize,
    ref_window: usize,
    ref_mask: u16,
    return_registers: Option<RegisterList>,
}

impl Frame {
    /// Returns the current program counter.
    ///
    /// The offset is opaque to the stack; implementations may treat it as a
    /// byte offset, a block id, or anything else.
    #[must_use]
    pub fn pc(&self) -> i64 {
        self.pc
    }

    /// Sets the program counter.
    pub fn set_pc(&mut self, pc: i64) {
        self.pc = pc;
    }

    /// Returns the function this frame activates (`None` for external
    /// marshaling frames).
    #[must_use]
    pub fn function(&self) -> Option<&Function> {
        self.function.as_ref()
    }

    /// Returns the cached state of the module owning this frame's function.
    #[must_use]
    pub fn module_state(&self) -> Option<&Arc<dyn ModuleState>> {
        self.module_state.as_ref()
    }

    /// Returns the register list describing where this frame wants callee
    /// results written.
    #[must_use]
    pub fn return_registers(&self) -> Option<&RegisterList> {
        self.return_registers.as_ref()
    }

    /// Records where callee results should be written when a call made from
    /// this frame returns.
    pub fn set_return_registers(&mut self, registers: Option<RegisterList>) {
        self.return_registers = registers;
    }
}

#[derive(Copy, Clone)]
struct Window {
    i32_base: usize,
    i32_mask: u16,
    ref_base: usize,
    ref_mask: u16,
}

/// A short-lived view of one frame's register windows.
///
/// Ordinals are ANDed with the window mask on every access, so out-of-range
/// ordinals wrap into the window rather than faulting. The compiler emits
/// ordinals in range; the runtime validates nothing further.
pub struct RegisterView<'a> {
    i32: &'a mut [i32],
    i32_mask: u16,
    refs: &'a mut [Ref],
    ref_mask: u16,
}

impl RegisterView<'_> {
    /// Reads an i32 register.
    #[must_use]
    pub fn read_i32(&self, ordinal: u16) -> i32 {
        self.i32[usize::from(ordinal & self.i32_mask)]
    }

    /// Writes an i32 register.
    pub fn write_i32(&mut self, ordinal: u16, value: i32) {
        self.i32[usize::from(ordinal & self.i32_mask)] = value;
    }

    /// Reads a reference register.
    #[must_use]
    pub fn read_ref(&self, ordinal: u16) -> &Ref {
        &self.refs[usize::from(ordinal & self.ref_mask)]
    }

    /// Transfers `source` into a reference register, releasing the previous
    /// occupant first.
    pub fn write_ref(&mut self, ordinal: u16, is_move: bool, source: &mut Ref) {
        let slot = &mut self.refs[usize::from(ordinal & self.ref_mask)];
        retain_or_move(is_move, source, slot);
    }

    /// Moves the value of a reference register out, leaving it null.
    #[must_use]
    pub fn take_ref(&mut self, ordinal: u16) -> Ref {
        core::mem::take(&mut self.refs[usize::from(ordinal & self.ref_mask)])
    }

    /// Moves `value` into a reference register, releasing the previous
    /// occupant.
    pub fn put_ref(&mut self, ordinal: u16, value: Ref) {
        self.refs[usize::from(ordinal & self.ref_mask)] = value;
    }

    /// Returns the i32 ordinal mask of this window.
    #[must_use]
    pub fn i32_mask(&self) -> u16 {
        self.i32_mask
    }

    /// Returns the reference ordinal mask of this window.
    #[must_use]
    pub fn ref_mask(&self) -> u16 {
        self.ref_mask
    }
}

/// A fiber stack of call frames over growable register banks.
pub struct Stack<'a> {
    resolver: &'a dyn StateResolver,
    frames: Vec<Frame>,
    i32_bank: Vec<i32>,
    ref_bank: Vec<Ref>,
}

impl<'a> Stack<'a> {
    /// Creates an empty stack that resolves module state through `resolver`.
    #[must_use]
    pub fn new(resolver: &'a dyn StateResolver) -> Self {
        Self {
            resolver,
            frames: Vec::with_capacity(MAX_STACK_DEPTH),
            i32_bank: Vec::with_capacity(DEFAULT_I32_BANK_CAPACITY),
            ref_bank: Vec::with_capacity(DEFAULT_REF_BANK_CAPACITY),
        }
    }

    /// Returns the current depth, in frames.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Returns the current frame, if the stack is non-empty.
    #[must_use]
    pub fn current_frame(&self) -> Option<&Frame> {
        self.frames.last()
    }

    /// Returns the current frame mutably, if the stack is non-empty.
    pub fn current_frame_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    /// Returns the caller of the current frame, if any.
    #[must_use]
    pub fn parent_frame(&self) -> Option<&Frame> {
        let depth = self.frames.len();
        if depth > 1 { self.frames.get(depth - 2) } else { None }
    }

    /// Returns the caller of the current frame mutably, if any.
    pub fn parent_frame_mut(&mut self) -> Option<&mut Frame> {
        let depth = self.frames.len();
        if depth > 1 {
            self.frames.get_mut(depth - 2)
        } else {
            None
        }
    }

    /// Returns a register view for the frame at `index`.
    ///
    /// Views are invalidated by any enter/leave and must be re-derived
    /// afterwards.
    pub fn registers(&mut self, index: usize) -> Option<RegisterView<'_>> {
        let frame = self.frames.get(index)?;
        let (i32_base, i32_window, i32_mask) = (frame.i32_base, frame.i32_window, frame.i32_mask);
        let (ref_base, ref_window, ref_mask) = (frame.ref_base, frame.ref_window, frame.ref_mask);
        Some(RegisterView {
            i32: &mut self.i32_bank[i32_base..i32_base + i32_window],
            i32_mask,
            refs: &mut self.ref_bank[ref_base..ref_base + ref_window],
            ref_mask,
        })
    }

    /// Returns a register view for the current frame.
    pub fn current_registers(&mut self) -> Option<RegisterView<'_>> {
        let index = self.frames.len().checked_sub(1)?;
        self.registers(index)
    }

    /// Current number of live i32 register cells across all frames.
    #[must_use]
    pub fn i32_bank_size(&self) -> usize {
        self.i32_bank.len()
    }

    /// Current number of live reference register cells across all frames.
    #[must_use]
    pub fn ref_bank_size(&self) -> usize {
        self.ref_bank.len()
    }

    /// Allocated capacity of the i32 bank, in cells.
    #[must_use]
    pub fn i32_bank_capacity(&self) -> usize {
        self.i32_bank.capacity()
    }

    /// Allocated capacity of the reference bank, in cells.
    #[must_use]
    pub fn ref_bank_capacity(&self) -> usize {
        self.ref_bank.capacity()
    }

    /// Enters `function`, pushing a callee frame.
    ///
    /// `argument_registers` names registers in the *caller* frame; they are
    /// remapped into the callee's banks in ABI order (each bank packs
    /// left-to-right from ordinal 0), honoring the per-entry move bit.
    ///
    /// Fails with [`Status::ResourceExhausted`] at [`MAX_STACK_DEPTH`]. May
    /// grow the register banks; live views must be re-derived afterwards.
    pub fn enter(
        &mut self,
        function: Function,
        argument_registers: Option<&RegisterList>,
    ) -> Result<(), Status> {
        if self.frames.len() == MAX_STACK_DEPTH {
            return Err(Status::ResourceExhausted);
        }

        // Reuse the caller's state when staying within one module; otherwise
        // ask the resolver. Resolution happens before the push so a failure
        // leaves the stack untouched.
        let same_module = self.frames.last().is_some_and(|caller| {
            caller
                .function
                .as_ref()
                .is_some_and(|f| Arc::ptr_eq(&f.module, &function.module))
        });
        let module_state = if same_module {
            self.frames
                .last()
                .and_then(|caller| caller.module_state.clone())
        } else {
            Some(self.resolver.query_module_state(&function.module)?)
        };

        let (i32_window, i32_mask) = window_for_count(function.i32_register_count);
        let (ref_window, ref_mask) = window_for_count(function.ref_register_count);
        let i32_base = self.i32_bank.len();
        let ref_base = self.ref_bank.len();
        self.grow_banks(i32_window, ref_window);

        let caller_index = self.frames.len().checked_sub(1);
        self.frames.push(Frame {
            pc: 0,
            function: Some(function),
            module_state,
            i32_base,
            i32_window,
            i32_mask,
            ref_base,
            ref_window,
            ref_mask,
            return_registers: None,
        });

        if let Some(caller_index) = caller_index
            && let Some(args) = argument_registers
        {
            self.remap_abi_registers(caller_index, self.frames.len() - 1, args);
        }
        Ok(())
    }

    /// Leaves the current frame.
    ///
    /// `result_registers` names registers in the *callee* frame. When a
    /// caller exists, results remap into the register list the caller
    /// recorded via [`Frame::set_return_registers`]; a caller that recorded
    /// none receives them left-aligned in its banks, ABI style. Reference
    /// cells still live in the callee's window are released.
    pub fn leave(&mut self, result_registers: Option<&RegisterList>) -> Result<(), Status> {
        let Some(callee_index) = self.frames.len().checked_sub(1) else {
            return Err(Status::FailedPrecondition);
        };

        if callee_index > 0
            && let Some(results) = result_registers
        {
            let caller_index = callee_index - 1;
            match self.frames[caller_index].return_registers.clone() {
                Some(destinations) => {
                    self.remap_paired_registers(callee_index, results, caller_index, &destinations);
                }
                None => self.remap_abi_registers(callee_index, caller_index, results),
            }
        }

        // Popping truncates the banks back to the frame's bases; dropping the
        // reference cells releases any unconsumed temporaries.
        let Some(frame) = self.frames.pop() else {
            return Err(Status::FailedPrecondition);
        };
        self.ref_bank.truncate(frame.ref_base);
        self.i32_bank.truncate(frame.i32_base);
        Ok(())
    }

    /// Enters the external marshaling frame that carries host-provided
    /// arguments.
    ///
    /// The frame has no function; its registers hold `arguments` in ABI
    /// order, references transferred in by retain. The returned register
    /// list names the populated registers (references marked move) and is
    /// what the invocation layer passes to the target module's call.
    ///
    /// Each bank reserves at least [`EXTERNAL_REGISTER_FLOOR`] registers so
    /// the frame can also receive callee results.
    pub fn enter_external(&mut self, arguments: &VariantList) -> Result<RegisterList, Status> {
        if self.frames.len() == MAX_STACK_DEPTH {
            return Err(Status::ResourceExhausted);
        }
        if arguments.len() > usize::from(registers::REF_ORDINAL_MASK) {
            return Err(Status::InvalidArgument);
        }

        let mut i32_count: u16 = 0;
        let mut ref_count: u16 = 0;
        for value in arguments {
            match value {
                Value::I32(_) => i32_count += 1,
                Value::Ref(_) => ref_count += 1,
            }
        }

        let (i32_window, i32_mask) = window_for_count(i32_count.max(EXTERNAL_REGISTER_FLOOR));
        let (ref_window, ref_mask) = window_for_count(ref_count.max(EXTERNAL_REGISTER_FLOOR));
        let i32_base = self.i32_bank.len();
        let ref_base = self.ref_bank.len();
        self.grow_banks(i32_window, ref_window);

        self.frames.push(Frame {
            pc: 0,
            function: None,
            module_state: None,
            i32_base,
            i32_window,
            i32_mask,
            ref_base,
            ref_window,
            ref_mask,
            return_registers: None,
        });

        let mut argument_registers = RegisterList::with_capacity(arguments.len());
        let mut i32_off: u16 = 0;
        let mut ref_off: u16 = 0;
        for value in arguments {
            match value {
                Value::I32(v) => {
                    self.i32_bank[i32_base + usize::from(i32_off & i32_mask)] = *v;
                    argument_registers.push(registers::i32_reg(i32_off));
                    i32_off += 1;
                }
                Value::Ref(r) => {
                    self.ref_bank[ref_base + usize::from(ref_off & ref_mask)] = r.retain();
                    argument_registers.push(registers::ref_reg(ref_off, true));
                    ref_off += 1;
                }
            }
        }
        Ok(argument_registers)
    }

    /// Leaves the external marshaling frame, draining its return registers
    /// into `outputs`.
    ///
    /// References transfer into the list by move. Nothing is written to
    /// `outputs` unless it has room for every result.
    pub fn leave_external(&mut self, outputs: &mut VariantList) -> Result<(), Status> {
        let Some(callee_index) = self.frames.len().checked_sub(1) else {
            return Err(Status::FailedPrecondition);
        };

        if let Some(results) = self.frames[callee_index].return_registers.take() {
            if results.len() > outputs.capacity() - outputs.len() {
                self.frames[callee_index].return_registers = Some(results);
                return Err(Status::ResourceExhausted);
            }
            let window = self.window(callee_index);
            for reg in results.iter() {
                if registers::is_ref(reg) {
                    let index = window.ref_base + usize::from(reg & window.ref_mask);
                    let value = core::mem::take(&mut self.ref_bank[index]);
                    outputs
                        .push(Value::Ref(value))
                        .map_err(|_| Status::Internal)?;
                } else {
                    let index = window.i32_base + usize::from(reg & window.i32_mask);
                    outputs
                        .push_i32(self.i32_bank[index])
                        .map_err(|_| Status::Internal)?;
                }
            }
        }

        let Some(frame) = self.frames.pop() else {
            return Err(Status::FailedPrecondition);
        };
        self.ref_bank.truncate(frame.ref_base);
        self.i32_bank.truncate(frame.i32_base);
        Ok(())
    }

    fn window(&self, index: usize) -> Window {
        let frame = &self.frames[index];
        Window {
            i32_base: frame.i32_base,
            i32_mask: frame.i32_mask,
            ref_base: frame.ref_base,
            ref_mask: frame.ref_mask,
        }
    }

    // Grows the banks to hold one more frame's windows. Geometric (at least
    // 2x) so deep call trees amortize; frame base offsets stay valid across
    // the reallocation.
    fn grow_banks(&mut self, i32_window: usize, ref_window: usize) {
        let new_i32_len = self.i32_bank.len() + i32_window;
        reserve_geometric(&mut self.i32_bank, new_i32_len);
        // Debug builds poison fresh primitive registers; their content is
        // undefined until written.
        let fill = if cfg!(debug_assertions) {
            0xCDCD_CDCD_u32 as i32
        } else {
            0
        };
        self.i32_bank.resize(new_i32_len, fill);

        let new_ref_len = self.ref_bank.len() + ref_window;
        reserve_geometric(&mut self.ref_bank, new_ref_len);
        self.ref_bank.resize_with(new_ref_len, Ref::null);
    }

    // Remaps registers named by `list` in the source frame to the 0..N ABI
    // registers of the destination frame: each bank packs left-to-right from
    // ordinal 0. Destination registers are assumed unused.
    fn remap_abi_registers(&mut self, src_index: usize, dst_index: usize, list: &RegisterList) {
        let src = self.window(src_index);
        let dst = self.window(dst_index);
        let mut i32_off: u16 = 0;
        let mut ref_off: u16 = 0;
        for reg in list.iter() {
            if registers::is_ref(reg) {
                let src_cell = src.ref_base + usize::from(reg & src.ref_mask);
                let dst_cell = dst.ref_base + usize::from(ref_off & dst.ref_mask);
                ref_off += 1;
                let value = if registers::is_move(reg) {
                    core::mem::take(&mut self.ref_bank[src_cell])
                } else {
                    self.ref_bank[src_cell].retain()
                };
                self.ref_bank[dst_cell] = value;
            } else {
                let src_cell = src.i32_base + usize::from(reg & src.i32_mask);
                let dst_cell = dst.i32_base + usize::from(i32_off & dst.i32_mask);
                i32_off += 1;
                self.i32_bank[dst_cell] = self.i32_bank[src_cell];
            }
        }
    }

    // Remaps registers pairwise: `src_list` names callee registers,
    // `dst_list` caller registers. The lists must match in length and
    // per-pair type bits; mismatches are debug-asserted and follow the
    // source bit in release.
    fn remap_paired_registers(
        &mut self,
        src_index: usize,
        src_list: &RegisterList,
        dst_index: usize,
        dst_list: &RegisterList,
    ) {
        debug_assert_eq!(src_list.len(), dst_list.len());
        let src = self.window(src_index);
        let dst = self.window(dst_index);
        for (src_reg, dst_reg) in src_list.iter().zip(dst_list.iter()) {
            debug_assert_eq!(registers::is_ref(src_reg), registers::is_ref(dst_reg));
            if registers::is_ref(src_reg) {
                let src_cell = src.ref_base + usize::from(src_reg & src.ref_mask);
                let dst_cell = dst.ref_base + usize::from(dst_reg & dst.ref_mask);
                let value = if registers::is_move(src_reg) {
                    core::mem::take(&mut self.ref_bank[src_cell])
                } else {
                    self.ref_bank[src_cell].retain()
                };
                self.ref_bank[dst_cell] = value;
            } else {
                let src_cell = src.i32_base + usize::from(src_reg & src.i32_mask);
                let dst_cell = dst.i32_base + usize::from(dst_reg & dst.i32_mask);
                self.i32_bank[dst_cell] = self.i32_bank[src_cell];
            }
        }
    }
}

impl Drop for Stack<'_> {
    fn drop(&mut self) {
        // Pop everything so held references are released.
        while !self.frames.is_empty() {
            let _ = self.leave(None);
        }
    }
}

fn reserve_geometric<T>(bank: &mut Vec<T>, required_len: usize) {
    if required_len <= bank.capacity() {
        return;
    }
    let target = core::cmp::max(bank.capacity() * 2, required_len);
    bank.reserve(target - bank.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{FunctionDecl, FunctionInfo, Linkage, ModuleSignature};
    use crate::reference::RefType;
    use core::any::Any;
    use core::sync::atomic::{AtomicUsize, Ordering};

    struct TestState;

    impl ModuleState for TestState {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct TestModule;

    impl Module for TestModule {
        fn name(&self) -> &str {
            "test"
        }

        fn signature(&self) -> ModuleSignature {
            ModuleSignature::default()
        }

        fn function(&self, _: Linkage, _: u16) -> Result<FunctionDecl<'_>, Status> {
            Err(Status::NotFound)
        }

        fn lookup_function(&self, _: Linkage, _: &str) -> Result<FunctionInfo, Status> {
            Err(Status::NotFound)
        }

        fn alloc_state(&self) -> Result<Arc<dyn ModuleState>, Status> {
            Ok(Arc::new(TestState))
        }

        fn resolve_import(&self, _: &dyn ModuleState, _: u16, _: Function) -> Result<(), Status> {
            Ok(())
        }

        fn call(
            &self,
            _: &mut Stack<'_>,
            _: &Function,
            _: Option<&RegisterList>,
        ) -> Result<crate::module::ExecutionResult, Status> {
            Err(Status::FailedPrecondition)
        }
    }

    struct TestResolver {
        state: Arc<dyn ModuleState>,
    }

    impl TestResolver {
        fn new() -> Self {
            Self {
                state: Arc::new(TestState),
            }
        }
    }

    impl StateResolver for TestResolver {
        fn query_module_state(
            &self,
            _: &Arc<dyn Module>,
        ) -> Result<Arc<dyn ModuleState>, Status> {
            Ok(Arc::clone(&self.state))
        }
    }

    fn test_function(module: &Arc<dyn Module>, i32s: u16, refs: u16) -> Function {
        Function {
            module: Arc::clone(module),
            linkage: Linkage::Internal,
            ordinal: 0,
            i32_register_count: i32s,
            ref_register_count: refs,
        }
    }

    struct Counted(&'static AtomicUsize);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn balanced_enter_leave_restores_depth_and_sizes() {
        let resolver = TestResolver::new();
        let mut stack = Stack::new(&resolver);
        let module: Arc<dyn Module> = Arc::new(TestModule);

        for round in 1..=4_usize {
            for _ in 0..round {
                stack.enter(test_function(&module, 8, 2), None).unwrap();
            }
            assert_eq!(stack.depth(), round);
            for _ in 0..round {
                stack.leave(None).unwrap();
            }
            assert_eq!(stack.depth(), 0);
            assert_eq!(stack.i32_bank_size(), 0);
            assert_eq!(stack.ref_bank_size(), 0);
        }
    }

    #[test]
    fn enter_fails_at_depth_limit() {
        let resolver = TestResolver::new();
        let mut stack = Stack::new(&resolver);
        let module: Arc<dyn Module> = Arc::new(TestModule);

        for _ in 0..MAX_STACK_DEPTH {
            stack.enter(test_function(&module, 1, 0), None).unwrap();
        }
        assert_eq!(
            stack.enter(test_function(&module, 1, 0), None),
            Err(Status::ResourceExhausted)
        );
        assert_eq!(stack.depth(), MAX_STACK_DEPTH);
    }

    #[test]
    fn leave_on_empty_stack_fails() {
        let resolver = TestResolver::new();
        let mut stack = Stack::new(&resolver);
        assert_eq!(stack.leave(None), Err(Status::FailedPrecondition));
    }

    #[test]
    fn abi_remap_packs_banks_independently() {
        let resolver = TestResolver::new();
        let mut stack = Stack::new(&resolver);
        let module: Arc<dyn Module> = Arc::new(TestModule);

        stack.enter(test_function(&module, 4, 2), None).unwrap();
        {
            let mut regs = stack.current_registers().unwrap();
            regs.write_i32(0, 10);
            regs.write_i32(2, 30);
            let mut r = Ref::new(RefType(1), 7_u8);
            regs.write_ref(1, true, &mut r);
        }

        // args: i32 r2, ref r1 (retain), i32 r0
        let args = RegisterList::from_slice(&[
            registers::i32_reg(2),
            registers::ref_reg(1, false),
            registers::i32_reg(0),
        ]);
        stack.enter(test_function(&module, 2, 1), Some(&args)).unwrap();

        let mut regs = stack.current_registers().unwrap();
        assert_eq!(regs.read_i32(0), 30);
        assert_eq!(regs.read_i32(1), 10);
        assert_eq!(regs.read_ref(0).strong_count(), 2);
        let taken = regs.take_ref(0);
        assert_eq!(taken.downcast_ref::<u8>(), Some(&7));
    }

    #[test]
    fn move_bit_nulls_caller_register() {
        let resolver = TestResolver::new();
        let mut stack = Stack::new(&resolver);
        let module: Arc<dyn Module> = Arc::new(TestModule);

        stack.enter(test_function(&module, 0, 1), None).unwrap();
        {
            let mut regs = stack.current_registers().unwrap();
            let mut r = Ref::new(RefType(1), 3_u32);
            regs.write_ref(0, true, &mut r);
        }
        let args = RegisterList::from_slice(&[registers::ref_reg(0, true)]);
        stack.enter(test_function(&module, 0, 1), Some(&args)).unwrap();
        {
            let regs = stack.current_registers().unwrap();
            assert_eq!(regs.read_ref(0).strong_count(), 1);
        }
        stack.leave(None).unwrap();
        let regs = stack.current_registers().unwrap();
        assert!(regs.read_ref(0).is_null());
    }

    #[test]
    fn leave_releases_unconsumed_references() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);
        DROPS.store(0, Ordering::SeqCst);

        let resolver = TestResolver::new();
        let mut stack = Stack::new(&resolver);
        let module: Arc<dyn Module> = Arc::new(TestModule);

        stack.enter(test_function(&module, 0, 4), None).unwrap();
        {
            let mut regs = stack.current_registers().unwrap();
            for ordinal in 0..3 {
                let mut r = Ref::new(RefType(1), Counted(&DROPS));
                regs.write_ref(ordinal, true, &mut r);
            }
        }
        stack.leave(None).unwrap();
        assert_eq!(DROPS.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn paired_remap_writes_caller_return_registers() {
        let resolver = TestResolver::new();
        let mut stack = Stack::new(&resolver);
        let module: Arc<dyn Module> = Arc::new(TestModule);

        stack.enter(test_function(&module, 4, 1), None).unwrap();
        stack
            .current_frame_mut()
            .unwrap()
            .set_return_registers(Some(RegisterList::from_slice(&[
                registers::i32_reg(3),
                registers::ref_reg(0, true),
            ])));

        stack.enter(test_function(&module, 1, 1), None).unwrap();
        {
            let mut regs = stack.current_registers().unwrap();
            regs.write_i32(0, 55);
            let mut r = Ref::new(RefType(9), 1_u8);
            regs.write_ref(0, true, &mut r);
        }
        let results =
            RegisterList::from_slice(&[registers::i32_reg(0), registers::ref_reg(0, true)]);
        stack.leave(Some(&results)).unwrap();

        let regs = stack.current_registers().unwrap();
        assert_eq!(regs.read_i32(3), 55);
        assert_eq!(regs.read_ref(0).type_id(), RefType(9));
        assert_eq!(regs.read_ref(0).strong_count(), 1);
    }

    #[test]
    fn external_round_trip_preserves_values() {
        let resolver = TestResolver::new();
        let mut stack = Stack::new(&resolver);

        let marker = Ref::new(RefType(4), 99_u64);
        let mut inputs = VariantList::with_capacity(3);
        inputs.push_i32(7).unwrap();
        inputs.push_ref(&marker).unwrap();
        inputs.push_i32(-1).unwrap();

        let argument_registers = stack.enter_external(&inputs).unwrap();
        assert_eq!(argument_registers.len(), 3);

        // Route the marshaled arguments straight back out.
        stack
            .current_frame_mut()
            .unwrap()
            .set_return_registers(Some(argument_registers));

        let mut outputs = VariantList::with_capacity(3);
        stack.leave_external(&mut outputs).unwrap();

        assert_eq!(stack.depth(), 0);
        assert_eq!(stack.i32_bank_size(), 0);
        assert_eq!(stack.ref_bank_size(), 0);
        assert_eq!(outputs.get(0).and_then(Value::as_i32), Some(7));
        assert_eq!(outputs.get(2).and_then(Value::as_i32), Some(-1));
        let out_ref = outputs.get(1).and_then(Value::as_ref_handle).unwrap();
        assert!(out_ref.ptr_eq(&marker));
    }

    #[test]
    fn banks_grow_geometrically_and_preserve_frames() {
        let resolver = TestResolver::new();
        let mut stack = Stack::new(&resolver);
        let module: Arc<dyn Module> = Arc::new(TestModule);

        let initial_capacity = stack.i32_bank_capacity();

        stack.enter(test_function(&module, 16, 0), None).unwrap();
        stack.current_registers().unwrap().write_i32(5, 42);

        // Force at least one reallocation past the default capacity.
        let big = u16::try_from(initial_capacity).unwrap();
        stack.enter(test_function(&module, big, 0), None).unwrap();
        stack.enter(test_function(&module, big, 0), None).unwrap();
        assert!(stack.i32_bank_capacity() > initial_capacity);

        stack.leave(None).unwrap();
        stack.leave(None).unwrap();

        // The first frame's base offsets still address its values.
        assert_eq!(stack.current_registers().unwrap().read_i32(5), 42);
        stack.leave(None).unwrap();
        assert_eq!(stack.i32_bank_size(), 0);
    }

    #[test]
    fn drop_unwinds_remaining_frames() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);
        DROPS.store(0, Ordering::SeqCst);

        let resolver = TestResolver::new();
        let module: Arc<dyn Module> = Arc::new(TestModule);
        {
            let mut stack = Stack::new(&resolver);
            for _ in 0..3 {
                stack.enter(test_function(&module, 0, 1), None).unwrap();
                let mut regs = stack.current_registers().unwrap();
                let mut r = Ref::new(RefType(1), Counted(&DROPS));
                regs.write_ref(0, true, &mut r);
            }
        }
        assert_eq!(DROPS.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn masked_ordinals_wrap_into_window() {
        let resolver = TestResolver::new();
        let mut stack = Stack::new(&resolver);
        let module: Arc<dyn Module> = Arc::new(TestModule);

        stack.enter(test_function(&module, 4, 0), None).unwrap();
        let mut regs = stack.current_registers().unwrap();
        regs.write_i32(1, 11);
        // Ordinal 5 wraps to 1 under the window mask.
        assert_eq!(regs.read_i32(5), 11);
    }

    #[test]
    fn external_enter_rejects_oversized_argument_lists() {
        let resolver = TestResolver::new();
        let mut stack = Stack::new(&resolver);
        let count = usize::from(registers::REF_ORDINAL_MASK) + 1;
        let mut inputs = VariantList::with_capacity(count);
        for _ in 0..count {
            inputs.push_i32(0).unwrap();
        }
        assert_eq!(stack.enter_external(&inputs), Err(Status::InvalidArgument));
        assert_eq!(stack.depth(), 0);
    }
}
