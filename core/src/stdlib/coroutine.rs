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

//! The script-visible `coroutine` library: `create`/`resume`/`yield`/
//! `status`/`wrap`/`isyieldable`, built on top of the taint bookkeeping in
//! `coroutine.rs` and the frame-resume driver in `vm.rs`.
//!
//! Scheduling is cooperative and single-threaded -- `resume` temporarily
//! swaps the coroutine's own `ThreadState` into the `Vm` in place of the
//! resuming thread's, runs it to its next yield/return/error, then swaps
//! the resuming thread's state back in. No OS thread is ever involved.

use crate::coroutine::{CoroutineStatus, LuaThread};
use crate::error::{Status, Thrown, VmError};
use crate::gc::Gc;
use crate::object::{Closure, ClosureKind, NativeFn};
use crate::state::State;
use crate::thread::ThreadState;
use crate::value::{TaggedValue, Value};
use crate::vm::Vm;
use std::rc::Rc;

fn str_value(vm: &mut Vm, s: &str) -> Value {
    Value::Str(crate::interner::intern_adhoc(&mut vm.thread, s))
}

fn key(s: &str) -> Value {
    Value::Str(Rc::new(std::cell::RefCell::new(crate::gc::GcBox {
        header: Default::default(),
        data: crate::object::LStr(s.to_string()),
    })))
}

fn arg(args: &[TaggedValue], i: usize) -> TaggedValue {
    args.get(i).cloned().unwrap_or_else(TaggedValue::nil)
}

fn error(vm: &mut Vm, msg: &str) -> Thrown {
    let value = str_value(vm, msg);
    Thrown::new(Status::RuntimeError, TaggedValue::new(value, vm.thread.stacktaint.clone()))
}

fn as_function(value: &Value) -> Option<Gc<Closure>> {
    match value {
        Value::Function(f) => Some(f.clone()),
        _ => None,
    }
}

fn as_thread(value: &Value) -> Option<Gc<LuaThread>> {
    match value {
        Value::Thread(t) => Some(t.clone()),
        _ => None,
    }
}

fn native(vm: &mut Vm, f: NativeFn, name: &str) -> Gc<Closure> {
    crate::gc::alloc(&mut vm.thread, Closure { kind: ClosureKind::Native(f), name: name.to_string() }, true, 0)
}

/// `coroutine.create(f)`: allocates a new, suspended coroutine whose body
/// is `f`. The new thread's own taint substate starts fully open
/// regardless of the creating thread's own ambient taint -- see
/// `coroutine::LuaThread::new`.
pub fn create(vm: &mut Vm, args: Vec<TaggedValue>) -> Result<Vec<TaggedValue>, Thrown> {
    let body = as_function(&arg(&args, 0).value).ok_or_else(|| error(vm, "coroutine.create: expected function"))?;
    let mut thread = LuaThread::new(vm.thread.labels.clone());
    thread.body = Some(body);
    let handle = crate::gc::alloc(&mut vm.thread, thread, false, 0);
    Ok(vec![TaggedValue::clean(Value::Thread(handle))])
}

/// Runs one resume step: either the coroutine's first invocation (its
/// `ThreadState` has no frames yet) or a continuation of a previous yield.
/// Returns the coroutine's eventual `(status, values-or-message)` pair.
fn do_resume(vm: &mut Vm, co: Gc<LuaThread>, resume_args: Vec<TaggedValue>) -> Vec<TaggedValue> {
    let is_first_resume = co.borrow().data.state.frames.is_empty();
    let body = co.borrow().data.body.clone().expect("a coroutine always has a body once created");

    co.borrow_mut().data.status = CoroutineStatus::Running;
    let pre_resume_taint = vm.thread.stacktaint.clone();

    // Pull the coroutine's own thread state out of the object and swap it
    // into the running `Vm` in place of the resuming thread's, stashing
    // the latter here for the duration of this step.
    let mut coroutine_state = std::mem::replace(&mut co.borrow_mut().data.state, ThreadState::new(vm.thread.labels.clone()));
    crate::coroutine::copy_stacktaint_on_resume(&vm.thread, &mut coroutine_state);
    std::mem::swap(&mut vm.thread, &mut coroutine_state);

    vm.coroutine_stack.push(co.clone());
    let outcome = if is_first_resume {
        vm.call(body, resume_args)
    } else {
        vm.resume_coroutine(resume_args)
    };
    vm.coroutine_stack.pop();

    // Swap the resuming thread's state back in; `coroutine_state` now
    // holds whatever the coroutine's own state became.
    std::mem::swap(&mut vm.thread, &mut coroutine_state);
    let coroutine_taint_after = coroutine_state.stacktaint.clone();
    co.borrow_mut().data.state = coroutine_state;

    // A coroutine can only ever add taint to its resumer, never remove it
    // -- the same rule applied whether it returns, yields, or errors.
    vm.thread.stacktaint = crate::coroutine::merge_stacktaint_on_return(&pre_resume_taint, &coroutine_taint_after);

    match outcome {
        Ok(results) => {
            co.borrow_mut().data.status = CoroutineStatus::Dead;
            let mut out = vec![TaggedValue::clean(Value::Boolean(true))];
            out.extend(results);
            out
        }
        Err(thrown) if thrown.status == Status::Yield => {
            co.borrow_mut().data.status = CoroutineStatus::Suspended;
            let mut out = vec![TaggedValue::clean(Value::Boolean(true))];
            out.extend(thrown.yielded);
            out
        }
        Err(thrown) => {
            co.borrow_mut().data.status = CoroutineStatus::Dead;
            vec![TaggedValue::clean(Value::Boolean(false)), thrown.value]
        }
    }
}

/// `coroutine.resume(co, ...)`: never throws on a failure inside the
/// coroutine -- a runtime error there comes back as `false, message`,
/// matching the base language's own `resume`. Resuming a coroutine that
/// is not suspended (already running, normal, or dead) likewise reports
/// `false, message` rather than raising an error in the resumer.
pub fn resume(vm: &mut Vm, mut args: Vec<TaggedValue>) -> Result<Vec<TaggedValue>, Thrown> {
    if args.is_empty() {
        return Err(error(vm, "resume: missing coroutine argument"));
    }
    let co = as_thread(&args.remove(0).value).ok_or_else(|| error(vm, "resume: expected coroutine"))?;

    let status = co.borrow().data.status;
    if status != CoroutineStatus::Suspended {
        let msg = match status {
            CoroutineStatus::Dead => VmError::CoroutineDead.to_string(),
            _ => VmError::CoroutineNotSuspended.to_string(),
        };
        let value = str_value(vm, &msg);
        return Ok(vec![TaggedValue::clean(Value::Boolean(false)), TaggedValue::clean(value)]);
    }

    Ok(do_resume(vm, co, args))
}

/// `coroutine.yield(...)`: unwinds as a `Status::Yield` non-local exit,
/// caught only by `resume`/`resume_coroutine` in `vm.rs` -- never by
/// `pcall`-style handlers, matching the base language's own restriction
/// against yielding across a C-call boundary.
pub fn co_yield(_vm: &mut Vm, args: Vec<TaggedValue>) -> Result<Vec<TaggedValue>, Thrown> {
    Err(Thrown::yield_with(args))
}

/// `coroutine.status(co)`: `"running"` for the coroutine currently
/// executing, `"normal"` for one waiting on a nested resume it itself
/// issued, and otherwise its own stored status.
pub fn status(vm: &mut Vm, args: Vec<TaggedValue>) -> Result<Vec<TaggedValue>, Thrown> {
    let co = as_thread(&arg(&args, 0).value).ok_or_else(|| error(vm, "status: expected coroutine"))?;
    let is_innermost = vm.coroutine_stack.last().map_or(false, |r| Rc::ptr_eq(r, &co));
    let is_on_chain = vm.coroutine_stack.iter().any(|r| Rc::ptr_eq(r, &co));
    let name = if is_innermost {
        "running"
    } else if is_on_chain {
        "normal"
    } else {
        match co.borrow().data.status {
            CoroutineStatus::Suspended => "suspended",
            CoroutineStatus::Running => "running",
            CoroutineStatus::Normal => "normal",
            CoroutineStatus::Dead => "dead",
        }
    };
    Ok(vec![TaggedValue::clean(str_value(vm, name))])
}

/// `coroutine.isyieldable()`: true iff the calling thread is itself a
/// coroutine (as opposed to a state's main thread).
pub fn isyieldable(vm: &mut Vm, _args: Vec<TaggedValue>) -> Result<Vec<TaggedValue>, Thrown> {
    Ok(vec![TaggedValue::clean(Value::Boolean(vm.thread.is_coroutine))])
}

/// `coroutine.wrap(f)`: like `create`, but returns a plain function that
/// resumes the coroutine directly, re-raising any in-coroutine error in
/// the caller instead of reporting it as a `false, message` pair.
pub fn wrap(vm: &mut Vm, args: Vec<TaggedValue>) -> Result<Vec<TaggedValue>, Thrown> {
    let created = create(vm, args)?;
    let co = as_thread(&created[0].value).expect("create always returns a thread value");
    let wrapped: NativeFn = Rc::new(move |vm, call_args| {
        let status = co.borrow().data.status;
        if status != CoroutineStatus::Suspended {
            return Err(error(vm, &VmError::CoroutineNotSuspended.to_string()));
        }
        let mut result = do_resume(vm, co.clone(), call_args);
        let ok = matches!(result.remove(0).value, Value::Boolean(true));
        if ok {
            Ok(result)
        } else {
            let message = result.into_iter().next().unwrap_or_else(TaggedValue::nil);
            Err(Thrown::new(Status::RuntimeError, message))
        }
    });
    Ok(vec![TaggedValue::clean(Value::Function(native(vm, wrapped, "wrapped coroutine")))])
}

/// Registers every function in this module into `state`'s globals table
/// under the `coroutine` table.
pub fn install(state: &mut State) {
    let table = crate::object::TableObj::new();
    let table = crate::gc::alloc(&mut state.vm.thread, table, false, 16);
    let entries: Vec<(&str, NativeFn)> = vec![
        ("create", Rc::new(create)),
        ("resume", Rc::new(resume)),
        ("yield", Rc::new(co_yield)),
        ("status", Rc::new(status)),
        ("wrap", Rc::new(wrap)),
        ("isyieldable", Rc::new(isyieldable)),
    ];
    for (name, f) in entries {
        let closure = native(&mut state.vm, f, name);
        let stored = crate::barriers::rawset_store(Value::Function(closure));
        table.borrow_mut().data.raw_set(key(name), stored);
    }
    state
        .vm
        .globals
        .borrow_mut()
        .data
        .raw_set(key("coroutine"), crate::barriers::rawset_store(Value::Table(table)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn create_and_resume_runs_the_body_to_completion() {
        let mut state = State::new(&Config::default());
        install(&mut state);
        let body = state.load("return 1 + 1", "body").unwrap();
        let co = create(&mut state.vm, vec![TaggedValue::clean(Value::Function(body))]).unwrap();
        let result = resume(&mut state.vm, vec![co[0].clone()]).unwrap();
        assert_eq!(result[0].value, Value::Boolean(true));
        assert_eq!(result[1].value.as_number(), Some(2.0));
    }

    #[test]
    fn yield_suspends_and_resume_continues_with_new_args() {
        let mut state = State::new(&Config::default());
        install(&mut state);
        let body = state.load("local a = coroutine.yield(1) return a + 10", "body").unwrap();
        let co_val = create(&mut state.vm, vec![TaggedValue::clean(Value::Function(body))]).unwrap().remove(0);

        let first = resume(&mut state.vm, vec![co_val.clone()]).unwrap();
        assert_eq!(first[0].value, Value::Boolean(true));
        assert_eq!(first[1].value.as_number(), Some(1.0));

        let co = as_thread(&co_val.value).unwrap();
        assert_eq!(co.borrow().data.status, CoroutineStatus::Suspended);

        let second = resume(&mut state.vm, vec![co_val.clone(), TaggedValue::clean(Value::Number(5.0))]).unwrap();
        assert_eq!(second[0].value, Value::Boolean(true));
        assert_eq!(second[1].value.as_number(), Some(15.0));
        assert_eq!(co.borrow().data.status, CoroutineStatus::Dead);
    }

    #[test]
    fn resuming_a_dead_coroutine_reports_failure_without_throwing() {
        let mut state = State::new(&Config::default());
        install(&mut state);
        let body = state.load("return 1", "body").unwrap();
        let co_val = create(&mut state.vm, vec![TaggedValue::clean(Value::Function(body))]).unwrap().remove(0);
        resume(&mut state.vm, vec![co_val.clone()]).unwrap();
        let second = resume(&mut state.vm, vec![co_val]).unwrap();
        assert_eq!(second[0].value, Value::Boolean(false));
    }

    #[test]
    fn coroutine_taint_cannot_clean_an_already_tainted_resumer() {
        let mut state = State::new(&Config::default());
        install(&mut state);
        state.vm.thread.stacktaint = Some(state.vm.thread.labels.clone().intern("Net"));
        let body = state.load("return 1", "body").unwrap();
        let co_val = create(&mut state.vm, vec![TaggedValue::clean(Value::Function(body))]).unwrap().remove(0);
        resume(&mut state.vm, vec![co_val]).unwrap();
        assert!(state.vm.thread.stacktaint.is_some());
    }

    #[test]
    fn isyieldable_is_true_only_inside_a_coroutine_body() {
        let mut state = State::new(&Config::default());
        install(&mut state);
        assert!(!state.vm.thread.is_coroutine);
        let flag: Rc<std::cell::RefCell<Option<bool>>> = Rc::new(std::cell::RefCell::new(None));
        let flag_clone = flag.clone();
        let probe: NativeFn = Rc::new(move |vm, _args| {
            *flag_clone.borrow_mut() = Some(vm.thread.is_coroutine);
            Ok(Vec::new())
        });
        let probe_closure = native(&mut state.vm, probe, "probe");
        state
            .vm
            .globals
            .borrow_mut()
            .data
            .raw_set(key("probe"), crate::barriers::rawset_store(Value::Function(probe_closure)));
        let body = state.load("probe() return 1", "body").unwrap();
        let co_val = create(&mut state.vm, vec![TaggedValue::clean(Value::Function(body))]).unwrap().remove(0);
        resume(&mut state.vm, vec![co_val]).unwrap();
        assert_eq!(*flag.borrow(), Some(true));
    }

    #[test]
    fn status_reports_running_for_the_active_coroutine() {
        let mut state = State::new(&Config::default());
        install(&mut state);
        let seen: Rc<std::cell::RefCell<Option<String>>> = Rc::new(std::cell::RefCell::new(None));
        let seen_clone = seen.clone();
        let self_handle: Rc<std::cell::RefCell<Option<Gc<LuaThread>>>> = Rc::new(std::cell::RefCell::new(None));
        let self_handle_clone = self_handle.clone();
        let probe: NativeFn = Rc::new(move |vm, _args| {
            if let Some(co) = self_handle_clone.borrow().clone() {
                let result = status(vm, vec![TaggedValue::clean(Value::Thread(co))]).unwrap();
                *seen_clone.borrow_mut() = result[0].value.as_str();
            }
            Ok(Vec::new())
        });
        let probe_closure = native(&mut state.vm, probe, "probe");
        state
            .vm
            .globals
            .borrow_mut()
            .data
            .raw_set(key("probe"), crate::barriers::rawset_store(Value::Function(probe_closure)));
        let body = state.load("probe() return 1", "body").unwrap();
        let co_val = create(&mut state.vm, vec![TaggedValue::clean(Value::Function(body))]).unwrap().remove(0);
        *self_handle.borrow_mut() = as_thread(&co_val.value);
        resume(&mut state.vm, vec![co_val]).unwrap();
        assert_eq!(seen.borrow().as_deref(), Some("running"));
    }
}
