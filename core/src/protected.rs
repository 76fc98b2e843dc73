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

//! Protected-call machinery.
//!
//! A protected call snapshots the thread's taint substate, runs the
//! protected body, and on non-local exit (an error thrown anywhere
//! beneath it) restores that snapshot and re-stamps the error value with
//! the post-restore ambient taint. Nested protected calls nest
//! snapshots naturally because each one only ever restores the snapshot
//! it itself took.

use crate::error::{Status, Thrown};
use crate::object::Closure;
use crate::thread::TaintSnapshot;
use crate::value::TaggedValue;
use crate::vm::Vm;

/// Runs `closure(args)` under a taint checkpoint. On success, returns the
/// callee's results untouched. On error, the thread's taint substate is
/// restored to what it was at entry and the error value is re-stamped
/// with the ambient taint as observed immediately after that restore.
pub fn pcall(vm: &mut Vm, closure: crate::gc::Gc<Closure>, args: Vec<TaggedValue>) -> Result<Vec<TaggedValue>, TaggedValue> {
    let snapshot = vm.thread.snapshot();
    match vm.call(closure, args) {
        Ok(results) => Ok(results),
        Err(thrown) => Err(restore_and_stamp(vm, snapshot, thrown)),
    }
}

/// The two ways an `xpcall` that did not error-in-error can finish:
/// either `closure` itself returned normally, or it threw and `handler`
/// ran to completion over the resulting error value.
pub enum XpcallOutcome {
    Success(Vec<TaggedValue>),
    Handled(Vec<TaggedValue>),
}

/// Like `pcall`, but on error additionally invokes `handler` with the
/// error value (under the restored taint) -- the base language's
/// `xpcall`. If `handler` itself throws, that is "error-while-handling-
/// error": the original error is discarded and a `Thrown` carrying
/// `Status::ErrorInError` propagates out of this call entirely, rather
/// than being swallowed into a `(false, ...)` result the way an ordinary
/// `closure` failure is.
pub fn xpcall(
    vm: &mut Vm,
    closure: crate::gc::Gc<Closure>,
    handler: crate::gc::Gc<Closure>,
    args: Vec<TaggedValue>,
) -> Result<XpcallOutcome, Thrown> {
    let snapshot = vm.thread.snapshot();
    match vm.call(closure, args) {
        Ok(results) => Ok(XpcallOutcome::Success(results)),
        Err(thrown) => {
            let err_value = restore_and_stamp(vm, snapshot.clone(), thrown);
            match vm.call(handler, vec![err_value]) {
                Ok(handled) => Ok(XpcallOutcome::Handled(handled)),
                Err(handler_thrown) => {
                    let handler_value = restore_and_stamp(vm, snapshot, handler_thrown);
                    Err(Thrown::new(Status::ErrorInError, handler_value))
                }
            }
        }
    }
}

fn restore_and_stamp(vm: &mut Vm, snapshot: TaintSnapshot, thrown: Thrown) -> TaggedValue {
    vm.thread.restore(&snapshot);
    let taint = vm.thread.mask_write();
    let mut value = thrown.value;
    value.taint = taint;
    value
}

/// `protecttaint(fn, ud)`: runs `body` under an automatic snapshot
/// without altering call semantics. On error, restores the snapshot and
/// clears the error value's taint slot so the eventual outer catcher
/// re-stamps it rather than inheriting whatever taint the failure point
/// happened to leave behind.
pub fn protect_taint<F>(vm: &mut Vm, body: F) -> Result<Vec<TaggedValue>, Thrown>
where
    F: FnOnce(&mut Vm) -> Result<Vec<TaggedValue>, Thrown>,
{
    let snapshot = vm.thread.snapshot();
    match body(vm) {
        Ok(values) => Ok(values),
        Err(mut thrown) => {
            vm.thread.restore(&snapshot);
            thrown.value.taint = None;
            Err(thrown)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Status, VmError};
    use crate::label::LabelTable;
    use crate::object::ClosureKind;
    use crate::value::Value;
    use std::rc::Rc;

    #[test]
    fn pcall_restores_taint_on_error() {
        let mut vm = Vm::new(Rc::new(LabelTable::new()));
        let f: crate::object::NativeFn = Rc::new(|vm: &mut Vm, _args| {
            vm.thread.stacktaint = Some(vm.thread.labels.clone().intern("Boom"));
            Err(Thrown::new(Status::RuntimeError, TaggedValue::new(Value::Nil, None)))
        });
        let closure = crate::gc::alloc(
            &mut vm.thread,
            Closure { kind: ClosureKind::Native(f), name: "boom".to_string() },
            true,
            0,
        );
        assert!(vm.thread.stacktaint.is_none());
        let result = pcall(&mut vm, closure, Vec::new());
        assert!(result.is_err());
        assert!(vm.thread.stacktaint.is_none());
    }

    #[test]
    fn protect_taint_clears_error_value_taint() {
        let mut vm = Vm::new(Rc::new(LabelTable::new()));
        let result = protect_taint(&mut vm, |vm| {
            vm.thread.stacktaint = Some(vm.thread.labels.clone().intern("Boom"));
            let tainted = TaggedValue::new(Value::Nil, vm.thread.stacktaint.clone());
            Err(Thrown::new(Status::RuntimeError, tainted))
        });
        match result {
            Err(thrown) => assert!(thrown.value.taint.is_none()),
            Ok(_) => panic!("expected error"),
        }
        assert!(vm.thread.stacktaint.is_none());
    }

    #[test]
    fn compile_error_status_is_syntax_error() {
        assert_eq!(VmError::Parse("x".into()).status(), Status::SyntaxError);
    }

    fn native_closure(vm: &mut Vm, f: crate::object::NativeFn, name: &str) -> crate::gc::Gc<Closure> {
        crate::gc::alloc(&mut vm.thread, Closure { kind: ClosureKind::Native(f), name: name.to_string() }, true, 0)
    }

    #[test]
    fn xpcall_reports_success_without_invoking_handler() {
        let mut vm = Vm::new(Rc::new(LabelTable::new()));
        let body: crate::object::NativeFn = Rc::new(|_vm, _args| Ok(vec![TaggedValue::clean(Value::Number(1.0))]));
        let handler: crate::object::NativeFn = Rc::new(|_vm, _args| panic!("handler must not run on success"));
        let body = native_closure(&mut vm, body, "body");
        let handler = native_closure(&mut vm, handler, "handler");
        match xpcall(&mut vm, body, handler, Vec::new()).unwrap() {
            XpcallOutcome::Success(values) => assert_eq!(values[0].value.as_number(), Some(1.0)),
            XpcallOutcome::Handled(_) => panic!("expected Success"),
        }
    }

    #[test]
    fn xpcall_invokes_handler_on_error_and_restores_taint() {
        let mut vm = Vm::new(Rc::new(LabelTable::new()));
        let body: crate::object::NativeFn = Rc::new(|vm, _args| {
            vm.thread.stacktaint = Some(vm.thread.labels.clone().intern("Boom"));
            Err(Thrown::new(Status::RuntimeError, TaggedValue::new(Value::Nil, None)))
        });
        let handler: crate::object::NativeFn = Rc::new(|_vm, _args| Ok(vec![TaggedValue::clean(Value::Str(Rc::new(std::cell::RefCell::new(crate::gc::GcBox {
            header: Default::default(),
            data: crate::object::LStr("handled".to_string()),
        }))))]));
        let body = native_closure(&mut vm, body, "body");
        let handler = native_closure(&mut vm, handler, "handler");
        assert!(vm.thread.stacktaint.is_none());
        match xpcall(&mut vm, body, handler, Vec::new()).unwrap() {
            XpcallOutcome::Handled(values) => assert_eq!(values[0].value.as_str().as_deref(), Some("handled")),
            XpcallOutcome::Success(_) => panic!("expected Handled"),
        }
        assert!(vm.thread.stacktaint.is_none());
    }

    #[test]
    fn xpcall_surfaces_error_in_error_when_handler_throws() {
        let mut vm = Vm::new(Rc::new(LabelTable::new()));
        let body: crate::object::NativeFn =
            Rc::new(|_vm, _args| Err(Thrown::new(Status::RuntimeError, TaggedValue::new(Value::Nil, None))));
        let handler: crate::object::NativeFn =
            Rc::new(|_vm, _args| Err(Thrown::new(Status::RuntimeError, TaggedValue::new(Value::Nil, None))));
        let body = native_closure(&mut vm, body, "body");
        let handler = native_closure(&mut vm, handler, "handler");
        let result = xpcall(&mut vm, body, handler, Vec::new());
        match result {
            Err(thrown) => assert_eq!(thrown.status, Status::ErrorInError),
            Ok(_) => panic!("expected error-in-error"),
        }
    }
}
