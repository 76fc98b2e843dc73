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

//! Secure call primitives and secure/insecure delegates.
//!
//! A *secure delegate* is a native closure wrapping a host function that
//! must run with full ambient access no matter how tainted its caller's
//! stack is: it snapshots and clears the calling thread's taint
//! substate for the duration of its own body, then on return re-stamps
//! every result with the caller's ambient taint so nothing "secure"
//! leaks out as a side effect of having been produced inside the
//! delegate. Any closure argument handed to a secure delegate is itself
//! wrapped in a delegate of the same kind, so passing a callback into
//! secure host code does not hand that callback an unprotected hole back
//! into the caller's taint state.
//!
//! An *insecure delegate* is the opposite: a thin pass-through with no
//! taint manipulation at all, used where a host wants the real,
//! unprotected call semantics (the debug library's stack walking, for
//! instance).
//!
//! A *secure post-hook* lets the embedder observe every call to a
//! function without being able to affect its result or taint its
//! caller: the original runs first with ordinary semantics, then the
//! hook runs under a snapshot that is discarded afterwards.

use crate::gc::Gc;
use crate::object::{Closure, ClosureKind, NativeFn};
use crate::value::{TaggedValue, Value};
use crate::vm::Vm;
use std::rc::Rc;

fn alloc_native(vm: &mut Vm, f: NativeFn, name: String) -> Gc<Closure> {
    crate::gc::alloc(&mut vm.thread, Closure { kind: ClosureKind::Native(f), name }, true, 0)
}

fn closure_name(closure: &Gc<Closure>) -> String {
    closure.borrow().data.name.clone()
}

/// `forceinsecure()`: if the calling thread is currently secure, sets its
/// `stacktaint` to the well-known ForceInsecure label. A thread that is
/// already tainted is left alone -- this can only make a thread less
/// secure, never change which label it carries.
pub fn forceinsecure(vm: &mut Vm) {
    if vm.thread.is_secure() {
        vm.thread.stacktaint = Some(vm.thread.labels.force_insecure());
    }
}

/// Runs `closure(args)` under a fresh taint checkpoint, swallowing any
/// error entirely (secure calls never propagate a thrown value to their
/// caller -- a failed secure call simply produces no results). On
/// success, the taint substate is restored and every returned value is
/// re-stamped with the post-restore ambient taint, so a secure function's
/// internals can never hand the caller a result that looks more trusted
/// than the caller itself is.
pub fn securecall(vm: &mut Vm, closure: Gc<Closure>, args: Vec<TaggedValue>) -> Vec<TaggedValue> {
    let snapshot = vm.thread.snapshot();
    let result = vm.call(closure, args);
    vm.thread.restore(&snapshot);
    match result {
        Ok(mut values) => {
            let ambient = vm.thread.mask_write();
            for v in values.iter_mut() {
                v.taint = ambient.clone();
            }
            values
        }
        Err(_) => Vec::new(),
    }
}

/// Wraps a function argument passed into a secure delegate in a delegate
/// of the same kind, so a callback handed to secure host code inherits
/// the same protection the delegate itself has. Non-function values pass
/// through unchanged.
fn wrap_callback(vm: &mut Vm, arg: TaggedValue) -> TaggedValue {
    match arg.value {
        Value::Function(f) => {
            let wrapped = make_secure_delegate(vm, f);
            TaggedValue::new(Value::Function(wrapped), arg.taint)
        }
        other => TaggedValue::new(other, arg.taint),
    }
}

/// Builds a secure delegate around `original`: a native closure that
/// clears the read mask and ambient taint for the duration of its own
/// body, wraps any function arguments in delegates of the same kind, and
/// on return re-stamps every result with the caller's ambient taint.
pub fn make_secure_delegate(vm: &mut Vm, original: Gc<Closure>) -> Gc<Closure> {
    let name = closure_name(&original);
    let f: NativeFn = Rc::new(move |vm, args| {
        let snapshot = vm.thread.snapshot();
        vm.thread.readmask = true;
        vm.thread.writemask = true;
        vm.thread.stacktaint = None;
        let wrapped_args: Vec<TaggedValue> = args.into_iter().map(|a| wrap_callback(vm, a)).collect();
        let result = vm.call(original.clone(), wrapped_args);
        let ambient = vm.thread.mask_write();
        vm.thread.restore(&snapshot);
        match result {
            Ok(mut values) => {
                for v in values.iter_mut() {
                    v.taint = ambient.clone();
                }
                Ok(values)
            }
            Err(mut thrown) => {
                thrown.value.taint = ambient;
                Err(thrown)
            }
        }
    });
    alloc_native(vm, f, name)
}

/// Builds an insecure delegate around `original`: a native closure that
/// forwards its arguments and results through unchanged, performing no
/// taint manipulation whatsoever.
pub fn make_insecure_delegate(vm: &mut Vm, original: Gc<Closure>) -> Gc<Closure> {
    let name = closure_name(&original);
    let f: NativeFn = Rc::new(move |vm, args| vm.call(original.clone(), args));
    alloc_native(vm, f, name)
}

/// Builds a secure post-hook around `original`: calling the result calls
/// `original` with ordinary call semantics first, then runs `hook` with
/// the same arguments under a taint snapshot that is discarded
/// afterwards, so the hook can observe every call but can neither change
/// `original`'s results nor taint the caller's stack. `hook`'s own
/// results are discarded.
pub fn make_secure_post_hook(vm: &mut Vm, original: Gc<Closure>, hook: Gc<Closure>) -> Gc<Closure> {
    let name = closure_name(&original);
    let f: NativeFn = Rc::new(move |vm, args| {
        let result = vm.call(original.clone(), args.clone())?;
        let snapshot = vm.thread.snapshot();
        let _ = vm.call(hook.clone(), args);
        vm.thread.restore(&snapshot);
        Ok(result)
    });
    alloc_native(vm, f, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Status, Thrown};
    use crate::label::LabelTable;
    use std::rc::Rc as StdRc;

    fn native(vm: &mut Vm, f: NativeFn, name: &str) -> Gc<Closure> {
        alloc_native(vm, f, name.to_string())
    }

    #[test]
    fn forceinsecure_is_noop_when_already_tainted() {
        let mut vm = Vm::new(StdRc::new(LabelTable::new()));
        vm.thread.stacktaint = Some(vm.thread.labels.clone().intern("Net"));
        forceinsecure(&mut vm);
        assert_eq!(vm.thread.stacktaint.as_ref().unwrap().name(), "Net");
    }

    #[test]
    fn forceinsecure_taints_a_secure_thread() {
        let mut vm = Vm::new(StdRc::new(LabelTable::new()));
        assert!(vm.thread.is_secure());
        forceinsecure(&mut vm);
        assert!(vm.thread.stacktaint.unwrap().is_force_insecure());
    }

    #[test]
    fn securecall_swallows_errors() {
        let mut vm = Vm::new(StdRc::new(LabelTable::new()));
        let f: NativeFn = StdRc::new(|_vm, _args| {
            Err(Thrown::new(Status::RuntimeError, TaggedValue::nil()))
        });
        let closure = native(&mut vm, f, "boom");
        let results = securecall(&mut vm, closure, Vec::new());
        assert!(results.is_empty());
        assert!(vm.thread.stacktaint.is_none());
    }

    #[test]
    fn securecall_restamps_results_with_ambient_taint() {
        let mut vm = Vm::new(StdRc::new(LabelTable::new()));
        let f: NativeFn = StdRc::new(|_vm, _args| {
            Ok(vec![TaggedValue::new(Value::Number(1.0), None)])
        });
        let closure = native(&mut vm, f, "one");
        vm.thread.stacktaint = Some(vm.thread.labels.clone().intern("Net"));
        let results = securecall(&mut vm, closure, Vec::new());
        assert_eq!(results[0].taint.as_ref().unwrap().name(), "Net");
        assert_eq!(vm.thread.stacktaint.as_ref().unwrap().name(), "Net");
    }

    #[test]
    fn secure_delegate_stamps_output_with_caller_taint_not_internal() {
        let mut vm = Vm::new(StdRc::new(LabelTable::new()));
        let f: NativeFn = StdRc::new(|vm, _args| {
            assert!(vm.thread.stacktaint.is_none());
            Ok(vec![TaggedValue::new(Value::Number(42.0), None)])
        });
        let inner = native(&mut vm, f, "inner");
        let delegate = make_secure_delegate(&mut vm, inner);
        vm.thread.stacktaint = Some(vm.thread.labels.clone().intern("Secret"));
        let results = vm.call(delegate, Vec::new()).unwrap();
        assert_eq!(results[0].taint.as_ref().unwrap().name(), "Secret");
        assert_eq!(vm.thread.stacktaint.as_ref().unwrap().name(), "Secret");
    }

    #[test]
    fn insecure_delegate_forwards_without_touching_taint() {
        let mut vm = Vm::new(StdRc::new(LabelTable::new()));
        let f: NativeFn = StdRc::new(|vm, _args| {
            Ok(vec![TaggedValue::new(Value::Nil, vm.thread.stacktaint.clone())])
        });
        let inner = native(&mut vm, f, "inner");
        let delegate = make_insecure_delegate(&mut vm, inner);
        vm.thread.stacktaint = Some(vm.thread.labels.clone().intern("Secret"));
        let results = vm.call(delegate, Vec::new()).unwrap();
        assert_eq!(results[0].taint.as_ref().unwrap().name(), "Secret");
    }

    #[test]
    fn secure_post_hook_cannot_taint_caller() {
        let mut vm = Vm::new(StdRc::new(LabelTable::new()));
        let orig: NativeFn = StdRc::new(|_vm, _args| Ok(vec![TaggedValue::clean(Value::Number(1.0))]));
        let hook: NativeFn = StdRc::new(|vm, _args| {
            vm.thread.stacktaint = Some(vm.thread.labels.clone().intern("HookTaint"));
            Ok(Vec::new())
        });
        let orig_closure = native(&mut vm, orig, "orig");
        let hook_closure = native(&mut vm, hook, "hook");
        let hooked = make_secure_post_hook(&mut vm, orig_closure, hook_closure);
        let results = vm.call(hooked, Vec::new()).unwrap();
        assert_eq!(results[0].value.as_number(), Some(1.0));
        assert!(vm.thread.stacktaint.is_none());
    }
}
