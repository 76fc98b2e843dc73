/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * This file is part of the TaintLua Runtime.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 *
 * 1. OPEN SOURCE: You may use this file under the terms of the GNU Affero
 * General Public License v3.0. If you link to this code, your ENTIRE
 * application must be open-sourced under AGPLv3.
 *
 * 2. COMMERCIAL: For proprietary use, you must obtain a Commercial License
 * from Sovereign Systems.
 *
 * PATENT NOTICE: Protected by US Patent App #63/935,467.
 * NO IMPLIED LICENSE to rights of Mohamad Al-Zawahreh or Sovereign Systems.
 */

//! The embedder-facing taint API.
//!
//! Everything here is a host-side counterpart to `query.rs`/`secure.rs`:
//! where those modules are reached from *inside* a running script, this
//! module is reached by the Rust code that embeds the runtime -- it
//! inspects and mutates taint directly on a `Vm`'s stack by index rather
//! than through a script-level function call. `TaintMode` governs whether
//! the embedder is allowed to do so at all; it is a thin, ergonomic view
//! onto the same `readmask`/`writemask` pair `thread.rs` already carries.

use crate::label::Taint;
use crate::query;
use crate::thread::TaintSnapshot;
use crate::value::Value;
use crate::vm::Vm;

/// The four combinations of `readmask`/`writemask` an embedder can
/// observe or select as a unit, rather than twiddling each bit
/// separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaintMode {
    Disabled,
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl TaintMode {
    fn from_masks(readmask: bool, writemask: bool) -> Self {
        match (readmask, writemask) {
            (false, false) => TaintMode::Disabled,
            (true, false) => TaintMode::ReadOnly,
            (false, true) => TaintMode::WriteOnly,
            (true, true) => TaintMode::ReadWrite,
        }
    }

    fn masks(self) -> (bool, bool) {
        match self {
            TaintMode::Disabled => (false, false),
            TaintMode::ReadOnly => (true, false),
            TaintMode::WriteOnly => (false, true),
            TaintMode::ReadWrite => (true, true),
        }
    }
}

pub fn get_taint_mode(vm: &Vm) -> TaintMode {
    TaintMode::from_masks(vm.thread.readmask, vm.thread.writemask)
}

pub fn set_taint_mode(vm: &mut Vm, mode: TaintMode) {
    let (readmask, writemask) = mode.masks();
    vm.thread.readmask = readmask;
    vm.thread.writemask = writemask;
}

/// The calling thread's ambient `stacktaint`.
pub fn get_stack_taint(vm: &Vm) -> Taint {
    vm.thread.stacktaint.clone()
}

pub fn set_stack_taint(vm: &mut Vm, taint: Taint) {
    vm.thread.stacktaint = taint;
}

/// The taint carried by the value at absolute stack index `index`.
/// Reading an index past the top of the stack reports absent taint, the
/// same as reading the "none" type there would.
pub fn get_value_taint(vm: &Vm, index: usize) -> Taint {
    vm.thread.stack.get(index).and_then(|v| v.taint.clone())
}

/// Sets the taint carried by the value at `index`. A no-op, observably,
/// if the slot holds nil -- there is nothing there to carry it. Setting
/// taint on a number or boolean slot affects only that stack slot, never
/// any heap object (numbers and booleans have no object header).
pub fn set_value_taint(vm: &mut Vm, index: usize, taint: Taint) {
    if let Some(slot) = vm.thread.stack.get_mut(index) {
        if !matches!(slot.value, Value::Nil) {
            slot.taint = taint;
        }
    }
}

/// The object-taint header of the heap object at `index`, or absent for
/// a scalar (which has no header at all).
pub fn get_object_taint(vm: &Vm, index: usize) -> Taint {
    vm.thread.stack.get(index).map(|v| query::object_taint(&v.value)).unwrap_or(None)
}

/// Sets the object-taint header of the heap object at `index`. Has no
/// effect if the slot holds a scalar, which has no header to set.
pub fn set_object_taint(vm: &mut Vm, index: usize, taint: Taint) {
    let Some(slot) = vm.thread.stack.get(index) else { return };
    match &slot.value {
        Value::Str(s) => s.borrow_mut().header.taint = taint,
        Value::Table(t) => t.borrow_mut().header.taint = taint,
        Value::Function(f) => f.borrow_mut().header.taint = taint,
        Value::UserData(u) => u.borrow_mut().header.taint = taint,
        Value::Thread(t) => t.borrow_mut().header.taint = taint,
        Value::Proto(p) => p.borrow_mut().header.taint = taint,
        Value::Upvalue(u) => u.borrow_mut().header.taint = taint,
        Value::Nil | Value::Boolean(_) | Value::Number(_) | Value::LightUserData(_) => {}
    }
}

/// The taint saved at entry of call frame `level` (0 = the currently
/// executing frame).
pub fn get_call_taint(vm: &Vm, level: usize) -> Taint {
    query::call_taint(vm, level)
}

pub fn set_call_taint(vm: &mut Vm, level: usize, taint: Taint) {
    let len = vm.thread.frames.len();
    if level < len {
        vm.thread.frames[len - 1 - level].savedtaint = taint;
    }
}

pub fn snapshot(vm: &Vm) -> TaintSnapshot {
    vm.thread.snapshot()
}

pub fn restore(vm: &mut Vm, snap: &TaintSnapshot) {
    vm.thread.restore(snap)
}

pub fn exchange(vm: &mut Vm, other: TaintSnapshot) -> TaintSnapshot {
    vm.thread.exchange(other)
}

/// Runs `body(vm)` under an automatic snapshot; on error, restores the
/// snapshot before the error propagates to the caller. Thin wrapper over
/// `protected::protect_taint` exposed at the embedder surface under the
/// name the base language's C API uses.
pub fn protecttaint<F>(vm: &mut Vm, body: F) -> Result<Vec<crate::value::TaggedValue>, crate::error::Thrown>
where
    F: FnOnce(&mut Vm) -> Result<Vec<crate::value::TaggedValue>, crate::error::Thrown>,
{
    crate::protected::protect_taint(vm, body)
}

/// Clears the calling thread's active (ambient) taint only -- the
/// debugger-level analogue of running in a context with no current
/// stacktaint, without touching any value already on the stack.
pub fn cleartaint(vm: &mut Vm) {
    vm.thread.stacktaint = None;
    vm.thread.writetaint = None;
}

/// Wipes all stack, frame, and value taint to absent. A much blunter
/// instrument than `cleartaint`, intended only for a debugger resetting
/// a thread to a known-clean state.
pub fn resettaint(vm: &mut Vm) {
    vm.thread.reset_taint();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::LabelTable;
    use crate::value::TaggedValue;
    use std::rc::Rc;

    fn fresh_vm() -> Vm {
        Vm::new(Rc::new(LabelTable::new()))
    }

    #[test]
    fn taint_mode_round_trips_through_masks() {
        let mut vm = fresh_vm();
        for mode in [TaintMode::Disabled, TaintMode::ReadOnly, TaintMode::WriteOnly, TaintMode::ReadWrite] {
            set_taint_mode(&mut vm, mode);
            assert_eq!(get_taint_mode(&vm), mode);
        }
    }

    #[test]
    fn value_taint_is_absent_past_the_top_of_stack() {
        let vm = fresh_vm();
        assert_eq!(get_value_taint(&vm, 999), None);
    }

    #[test]
    fn setting_taint_on_nil_slot_is_a_noop() {
        let mut vm = fresh_vm();
        vm.thread.stack.push(TaggedValue::nil());
        let label = Some(vm.thread.labels.clone().intern("X"));
        set_value_taint(&mut vm, 0, label);
        assert_eq!(vm.thread.stack[0].taint, None);
    }

    #[test]
    fn setting_taint_on_a_number_slot_never_touches_a_heap_object() {
        let mut vm = fresh_vm();
        vm.thread.stack.push(TaggedValue::clean(Value::Number(1.0)));
        let label = Some(vm.thread.labels.clone().intern("X"));
        set_value_taint(&mut vm, 0, label.clone());
        assert_eq!(vm.thread.stack[0].taint, label);
    }

    #[test]
    fn exchange_twice_is_identity() {
        let mut vm = fresh_vm();
        vm.thread.stacktaint = Some(vm.thread.labels.clone().intern("A"));
        let a = snapshot(&vm);
        vm.thread.stacktaint = Some(vm.thread.labels.clone().intern("B"));
        let b = snapshot(&vm);
        let prev = exchange(&mut vm, a.clone());
        let _ = exchange(&mut vm, prev);
        let after = snapshot(&vm);
        assert_eq!(after.stacktaint.map(|l| l.name().to_string()), b.stacktaint.map(|l| l.name().to_string()));
    }

    #[test]
    fn resettaint_wipes_stack_slots() {
        let mut vm = fresh_vm();
        vm.thread.stack.push(TaggedValue::new(Value::Number(1.0), Some(vm.thread.labels.clone().intern("X"))));
        resettaint(&mut vm);
        assert!(vm.thread.stack[0].taint.is_none());
    }
}
