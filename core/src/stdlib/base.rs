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

//! The base security library: the functions a script calls to introspect
//! and manage its own taint state. Every entry point here is a thin
//! argument-juggling shim over `query.rs`/`secure.rs`/`protected.rs`; the
//! actual rules live in those modules.

use crate::barriers;
use crate::error::{Status, Thrown};
use crate::gc::Gc;
use crate::object::{Closure, ClosureKind, NativeFn, TableObj};
use crate::query;
use crate::secure;
use crate::state::State;
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

fn as_table(value: &Value) -> Option<Gc<TableObj>> {
    match value {
        Value::Table(t) => Some(t.clone()),
        _ => None,
    }
}

fn native(vm: &mut Vm, f: NativeFn, name: &str) -> Gc<Closure> {
    crate::gc::alloc(&mut vm.thread, Closure { kind: ClosureKind::Native(f), name: name.to_string() }, true, 0)
}

/// Resolves the `[table,] name` calling convention shared by
/// `issecurevariable` and `hooksecurefunc`: if the first argument is a
/// table, the name is the second argument and that table is the lookup
/// scope; otherwise the lookup scope is the global table and the name is
/// the first argument.
fn table_and_name(vm: &Vm, args: &[TaggedValue]) -> Option<(Gc<TableObj>, String)> {
    if let Some(table) = as_table(&arg(args, 0).value) {
        arg(args, 1).value.as_str().map(|name| (table, name))
    } else {
        arg(args, 0).value.as_str().map(|name| (vm.globals.clone(), name))
    }
}

/// `issecure()`: true iff the calling thread's stack is currently secure.
pub fn issecure(vm: &mut Vm, _args: Vec<TaggedValue>) -> Result<Vec<TaggedValue>, Thrown> {
    Ok(vec![TaggedValue::clean(Value::Boolean(query::is_secure(vm)))])
}

/// `issecurevariable([tbl,] name)`: reports whether `tbl[name]`
/// (defaulting `tbl` to the globals table) is secure, and if not, the
/// name of the label responsible.
pub fn issecurevariable(vm: &mut Vm, args: Vec<TaggedValue>) -> Result<Vec<TaggedValue>, Thrown> {
    let (table, name) = table_and_name(vm, &args).ok_or_else(|| error(vm, "issecurevariable: bad arguments"))?;
    let (secure, label) = query::is_secure_variable(&table.borrow().data, &name);
    let label_value = match label {
        Some(l) => str_value(vm, &l),
        None => Value::Nil,
    };
    Ok(vec![TaggedValue::clean(Value::Boolean(secure)), TaggedValue::clean(label_value)])
}

/// `forceinsecure()`: taints the calling thread's stack with the
/// well-known ForceInsecure label, unless it is already tainted.
pub fn forceinsecure(vm: &mut Vm, _args: Vec<TaggedValue>) -> Result<Vec<TaggedValue>, Thrown> {
    secure::forceinsecure(vm);
    Ok(Vec::new())
}

/// `securecall(funcOrName, ...)`: resolves `funcOrName` (a function value,
/// or a string looked up in the globals table) and calls it securely.
pub fn securecall(vm: &mut Vm, mut args: Vec<TaggedValue>) -> Result<Vec<TaggedValue>, Thrown> {
    if args.is_empty() {
        return Err(error(vm, "securecall: missing function argument"));
    }
    let target = args.remove(0);
    let closure = match &target.value {
        Value::Function(f) => f.clone(),
        Value::Str(s) => {
            let name = s.borrow().data.as_str().to_string();
            let looked_up = vm.globals.borrow().data.get(&key(&name));
            as_function(&looked_up.value).ok_or_else(|| error(vm, &format!("securecall: no such function '{}'", name)))?
        }
        _ => return Err(error(vm, "securecall: expected function or name")),
    };
    Ok(secure::securecall(vm, closure, args))
}

/// `securecallfunction(func, ...)`: like `securecall`, but `func` must
/// already be a function value -- no name resolution.
pub fn securecallfunction(vm: &mut Vm, mut args: Vec<TaggedValue>) -> Result<Vec<TaggedValue>, Thrown> {
    if args.is_empty() {
        return Err(error(vm, "securecallfunction: missing function argument"));
    }
    let target = args.remove(0);
    let closure = as_function(&target.value).ok_or_else(|| error(vm, "securecallfunction: expected function"))?;
    Ok(secure::securecall(vm, closure, args))
}

/// `pcall(f, ...)`: calls `f(...)` under a taint checkpoint, returning
/// `(true, ...results)` on success or `(false, err)` on failure -- the
/// base language's basic protected call. Never throws itself; any error
/// raised by `f` is caught and reported as the second return value.
pub fn pcall(vm: &mut Vm, mut args: Vec<TaggedValue>) -> Result<Vec<TaggedValue>, Thrown> {
    if args.is_empty() {
        return Err(error(vm, "pcall: missing function argument"));
    }
    let target = args.remove(0);
    let closure = as_function(&target.value).ok_or_else(|| error(vm, "pcall: expected function"))?;
    match crate::protected::pcall(vm, closure, args) {
        Ok(mut results) => {
            let mut out = vec![TaggedValue::clean(Value::Boolean(true))];
            out.append(&mut results);
            Ok(out)
        }
        Err(err_value) => Ok(vec![TaggedValue::clean(Value::Boolean(false)), err_value]),
    }
}

/// `xpcall(f, handler, ...)`: like `pcall`, but routes a failure of `f`
/// through `handler` first and reports `(false, ...handler-results)`.
/// If `handler` itself throws, that "error-while-handling-error" is not
/// swallowed -- it propagates out of this call as an ordinary thrown
/// error, same as any other native function failure.
pub fn xpcall(vm: &mut Vm, mut args: Vec<TaggedValue>) -> Result<Vec<TaggedValue>, Thrown> {
    if args.len() < 2 {
        return Err(error(vm, "xpcall: expected (f, handler, ...)"));
    }
    let target = args.remove(0);
    let handler_val = args.remove(0);
    let closure = as_function(&target.value).ok_or_else(|| error(vm, "xpcall: expected function"))?;
    let handler = as_function(&handler_val.value).ok_or_else(|| error(vm, "xpcall: expected handler function"))?;
    match crate::protected::xpcall(vm, closure, handler, args)? {
        crate::protected::XpcallOutcome::Success(mut results) => {
            let mut out = vec![TaggedValue::clean(Value::Boolean(true))];
            out.append(&mut results);
            Ok(out)
        }
        crate::protected::XpcallOutcome::Handled(mut results) => {
            let mut out = vec![TaggedValue::clean(Value::Boolean(false))];
            out.append(&mut results);
            Ok(out)
        }
    }
}

/// `secureexecuterange(tbl, func, ...)`: iterates every `(key, value)`
/// pair of `tbl` and calls `func(key, value, ...)` securely, once per
/// pair, each call getting its own restored taint snapshot. Results are
/// discarded -- this primitive is for side effects over a table, not for
/// collecting per-call return values.
pub fn secureexecuterange(vm: &mut Vm, mut args: Vec<TaggedValue>) -> Result<Vec<TaggedValue>, Thrown> {
    if args.len() < 2 {
        return Err(error(vm, "secureexecuterange: expected (table, func, ...)"));
    }
    let table = as_table(&arg(&args, 0).value).ok_or_else(|| error(vm, "secureexecuterange: expected table"))?;
    let closure = as_function(&arg(&args, 1).value).ok_or_else(|| error(vm, "secureexecuterange: expected function"))?;
    let extra: Vec<TaggedValue> = args.drain(2..).collect();
    let pairs: Vec<(Value, TaggedValue)> = {
        let t = table.borrow();
        let array_pairs = t.data.array.iter().enumerate().map(|(i, v)| (Value::Number((i + 1) as f64), v.clone()));
        let hash_pairs = t.data.hash.iter().map(|(k, v)| (k.clone(), v.clone()));
        array_pairs.chain(hash_pairs).collect()
    };
    for (k, v) in pairs {
        let mut call_args = vec![TaggedValue::clean(k), v];
        call_args.extend(extra.iter().cloned());
        secure::securecall(vm, closure.clone(), call_args);
    }
    Ok(Vec::new())
}

/// `hooksecurefunc([tbl,] name, hook)`: replaces `tbl[name]` (defaulting
/// `tbl` to the globals table) with a secure post-hook wrapping the
/// existing function, so `hook` runs after every future call without
/// being able to change the call's result or taint its caller.
pub fn hooksecurefunc(vm: &mut Vm, args: Vec<TaggedValue>) -> Result<Vec<TaggedValue>, Thrown> {
    let (table, name, hook) = if as_table(&arg(&args, 0).value).is_some() {
        let table = as_table(&arg(&args, 0).value).unwrap();
        let name = arg(&args, 1).value.as_str().ok_or_else(|| error(vm, "hooksecurefunc: expected name"))?;
        let hook = as_function(&arg(&args, 2).value).ok_or_else(|| error(vm, "hooksecurefunc: expected hook function"))?;
        (table, name, hook)
    } else {
        let name = arg(&args, 0).value.as_str().ok_or_else(|| error(vm, "hooksecurefunc: expected name"))?;
        let hook = as_function(&arg(&args, 1).value).ok_or_else(|| error(vm, "hooksecurefunc: expected hook function"))?;
        (vm.globals.clone(), name, hook)
    };
    let lookup_key = key(&name);
    let original_tagged = table.borrow().data.get(&lookup_key);
    let original = as_function(&original_tagged.value).ok_or_else(|| error(vm, &format!("hooksecurefunc: no such function '{}'", name)))?;
    let hooked = secure::make_secure_post_hook(vm, original, hook);
    let stored = barriers::settable_store(&TaggedValue::clean(Value::Function(hooked)));
    table.borrow_mut().data.raw_set(lookup_key, stored);
    Ok(Vec::new())
}

/// `scrub(...)`: replaces every argument that is not a number, string, or
/// boolean with nil. Each surviving argument keeps its own taint.
pub fn scrub(_vm: &mut Vm, args: Vec<TaggedValue>) -> Result<Vec<TaggedValue>, Thrown> {
    Ok(args
        .into_iter()
        .map(|v| match v.value {
            Value::Number(_) | Value::Str(_) | Value::Boolean(_) => v,
            _ => TaggedValue::new(Value::Nil, v.taint),
        })
        .collect())
}

/// `geterrorhandler()`: returns the currently installed error handler, or
/// nil if none has been set.
pub fn geterrorhandler(vm: &mut Vm, _args: Vec<TaggedValue>) -> Result<Vec<TaggedValue>, Thrown> {
    let value = match &vm.error_handler {
        Some(f) => Value::Function(f.clone()),
        None => Value::Nil,
    };
    Ok(vec![TaggedValue::clean(value)])
}

/// `seterrorhandler(handler)`: installs `handler` (or clears it, if nil)
/// and returns the previous handler.
pub fn seterrorhandler(vm: &mut Vm, args: Vec<TaggedValue>) -> Result<Vec<TaggedValue>, Thrown> {
    let previous = match vm.error_handler.take() {
        Some(f) => Value::Function(f),
        None => Value::Nil,
    };
    vm.error_handler = as_function(&arg(&args, 0).value);
    Ok(vec![TaggedValue::clean(previous)])
}

fn compile_chunk(vm: &mut Vm, source: &str, name: &str) -> Result<Gc<Closure>, Thrown> {
    let ast = crate::parser::Parser::parse(source).map_err(|e| {
        Thrown::new(Status::SyntaxError, TaggedValue::new(str_value(vm, &e.to_string()), vm.thread.stacktaint.clone()))
    })?;
    let proto = crate::compiler::compile(&ast, name).map_err(|e| {
        Thrown::new(Status::SyntaxError, TaggedValue::new(str_value(vm, &e.to_string()), vm.thread.stacktaint.clone()))
    })?;
    let proto = crate::gc::alloc(&mut vm.thread, proto, false, 0);
    Ok(crate::gc::alloc(
        &mut vm.thread,
        Closure { kind: ClosureKind::Lua { proto, upvalues: Vec::new() }, name: name.to_string() },
        true,
        0,
    ))
}

/// `loadstring(s, name)`: compiles `s` and stamps the resulting chunk
/// with the well-known ForceInsecure label regardless of the loading
/// thread's own ambient taint, so code loaded this way runs insecure by
/// default -- the base language's safer default for dynamically loaded
/// strings.
pub fn loadstring(vm: &mut Vm, args: Vec<TaggedValue>) -> Result<Vec<TaggedValue>, Thrown> {
    let source = arg(&args, 0).value.as_str().ok_or_else(|| error(vm, "loadstring: expected string"))?;
    let name = arg(&args, 1).value.as_str().unwrap_or_else(|| "=(load)".to_string());
    let snapshot = vm.thread.snapshot();
    vm.thread.newcltaint = Some(vm.thread.labels.force_insecure());
    let result = compile_chunk(vm, &source, &name);
    vm.thread.restore(&snapshot);
    let closure = result?;
    Ok(vec![TaggedValue::clean(Value::Function(closure))])
}

/// `loadstring_untainted(s, name)`: like `loadstring`, but the resulting
/// chunk's taint is whatever the loading thread's own ambient state would
/// assign -- no forced ForceInsecure stamp.
pub fn loadstring_untainted(vm: &mut Vm, args: Vec<TaggedValue>) -> Result<Vec<TaggedValue>, Thrown> {
    let source = arg(&args, 0).value.as_str().ok_or_else(|| error(vm, "loadstring_untainted: expected string"))?;
    let name = arg(&args, 1).value.as_str().unwrap_or_else(|| "=(load)".to_string());
    let closure = compile_chunk(vm, &source, &name)?;
    Ok(vec![TaggedValue::clean(Value::Function(closure))])
}

/// Registers every function in this module into `state`'s globals table
/// under its script-visible name.
pub fn install(state: &mut State) {
    let entries: Vec<(&str, NativeFn)> = vec![
        ("issecure", Rc::new(issecure)),
        ("issecurevariable", Rc::new(issecurevariable)),
        ("forceinsecure", Rc::new(forceinsecure)),
        ("pcall", Rc::new(pcall)),
        ("xpcall", Rc::new(xpcall)),
        ("securecall", Rc::new(securecall)),
        ("securecallfunction", Rc::new(securecallfunction)),
        ("secureexecuterange", Rc::new(secureexecuterange)),
        ("hooksecurefunc", Rc::new(hooksecurefunc)),
        ("scrub", Rc::new(scrub)),
        ("geterrorhandler", Rc::new(geterrorhandler)),
        ("seterrorhandler", Rc::new(seterrorhandler)),
        ("loadstring", Rc::new(loadstring)),
        ("loadstring_untainted", Rc::new(loadstring_untainted)),
    ];
    for (name, f) in entries {
        let closure = native(&mut state.vm, f, name);
        let stored = barriers::rawset_store(Value::Function(closure));
        state.vm.globals.borrow_mut().data.raw_set(key(name), stored);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn installed_functions_are_reachable_as_globals() {
        let mut state = State::new(&Config::default());
        install(&mut state);
        let issecure = state.global("issecure");
        assert!(matches!(issecure.value, Value::Function(_)));
    }

    #[test]
    fn issecure_reflects_thread_state() {
        let mut state = State::new(&Config::default());
        install(&mut state);
        let result = issecure(&mut state.vm, Vec::new()).unwrap();
        assert_eq!(result[0].value, Value::Boolean(true));
        state.vm.thread.stacktaint = Some(state.vm.thread.labels.clone().intern("Net"));
        let result = issecure(&mut state.vm, Vec::new()).unwrap();
        assert_eq!(result[0].value, Value::Boolean(false));
    }

    #[test]
    fn scrub_nils_out_tables_and_functions() {
        let mut state = State::new(&Config::default());
        let table_val = TaggedValue::clean(Value::Table(crate::gc::alloc(&mut state.vm.thread, TableObj::new(), false, 0)));
        let number_val = TaggedValue::clean(Value::Number(5.0));
        let result = scrub(&mut state.vm, vec![table_val, number_val]).unwrap();
        assert_eq!(result[0].value, Value::Nil);
        assert_eq!(result[1].value.as_number(), Some(5.0));
    }

    #[test]
    fn hooksecurefunc_wraps_existing_global() {
        let mut state = State::new(&Config::default());
        install(&mut state);
        let orig: NativeFn = Rc::new(|_vm, _args| Ok(vec![TaggedValue::clean(Value::Number(1.0))]));
        let orig_closure = native(&mut state.vm, orig, "target");
        state
            .vm
            .globals
            .borrow_mut()
            .data
            .raw_set(key("target"), barriers::rawset_store(Value::Function(orig_closure)));
        let hook: NativeFn = Rc::new(|_vm, _args| Ok(Vec::new()));
        let hook_closure = native(&mut state.vm, hook, "hook");
        hooksecurefunc(
            &mut state.vm,
            vec![TaggedValue::clean(str_value(&mut state.vm, "target")), TaggedValue::clean(Value::Function(hook_closure))],
        )
        .unwrap();
        let replaced = state.global("target");
        let wrapped = as_function(&replaced.value).unwrap();
        let result = state.vm.call(wrapped, Vec::new()).unwrap();
        assert_eq!(result[0].value.as_number(), Some(1.0));
    }

    #[test]
    fn loadstring_forces_insecure_chunk() {
        let mut state = State::new(&Config::default());
        assert!(state.vm.thread.is_secure());
        let args = vec![TaggedValue::clean(str_value(&mut state.vm, "return 1"))];
        let result = loadstring(&mut state.vm, args).unwrap();
        let closure = as_function(&result[0].value).unwrap();
        assert!(state.vm.thread.is_secure(), "loadstring must not taint its caller");
        assert_eq!(closure.borrow().header.taint.as_ref().unwrap().name(), crate::label::FORCE_INSECURE_NAME);
    }

    #[test]
    fn loadstring_untainted_picks_up_ambient_ready_state() {
        let mut state = State::new(&Config::default());
        let args = vec![TaggedValue::clean(str_value(&mut state.vm, "return 1"))];
        let result = loadstring_untainted(&mut state.vm, args).unwrap();
        let closure = as_function(&result[0].value).unwrap();
        assert!(closure.borrow().header.taint.is_none());
    }

    #[test]
    fn installed_pcall_and_xpcall_are_reachable_as_globals() {
        let mut state = State::new(&Config::default());
        install(&mut state);
        assert!(matches!(state.global("pcall").value, Value::Function(_)));
        assert!(matches!(state.global("xpcall").value, Value::Function(_)));
    }

    #[test]
    fn pcall_reports_success_as_true_plus_results() {
        let mut state = State::new(&Config::default());
        let f: NativeFn = Rc::new(|_vm, _args| Ok(vec![TaggedValue::clean(Value::Number(7.0))]));
        let closure = native(&mut state.vm, f, "f");
        let result = pcall(&mut state.vm, vec![TaggedValue::clean(Value::Function(closure))]).unwrap();
        assert_eq!(result[0].value, Value::Boolean(true));
        assert_eq!(result[1].value.as_number(), Some(7.0));
    }

    #[test]
    fn pcall_reports_failure_as_false_plus_error_without_propagating() {
        let mut state = State::new(&Config::default());
        let f: NativeFn = Rc::new(|vm, _args| Err(error(vm, "boom")));
        let closure = native(&mut state.vm, f, "f");
        let result = pcall(&mut state.vm, vec![TaggedValue::clean(Value::Function(closure))]).unwrap();
        assert_eq!(result[0].value, Value::Boolean(false));
        assert_eq!(result[1].value.as_str().as_deref(), Some("boom"));
    }

    #[test]
    fn xpcall_routes_failure_through_handler() {
        let mut state = State::new(&Config::default());
        let f: NativeFn = Rc::new(|vm, _args| Err(error(vm, "boom")));
        let handler: NativeFn = Rc::new(|_vm, args| Ok(vec![arg(&args, 0)]));
        let f_closure = native(&mut state.vm, f, "f");
        let handler_closure = native(&mut state.vm, handler, "handler");
        let result = xpcall(
            &mut state.vm,
            vec![TaggedValue::clean(Value::Function(f_closure)), TaggedValue::clean(Value::Function(handler_closure))],
        )
        .unwrap();
        assert_eq!(result[0].value, Value::Boolean(false));
        assert_eq!(result[1].value.as_str().as_deref(), Some("boom"));
    }

    #[test]
    fn xpcall_propagates_error_in_error_when_handler_throws() {
        let mut state = State::new(&Config::default());
        let f: NativeFn = Rc::new(|vm, _args| Err(error(vm, "boom")));
        let handler: NativeFn = Rc::new(|vm, _args| Err(error(vm, "handler also boom")));
        let f_closure = native(&mut state.vm, f, "f");
        let handler_closure = native(&mut state.vm, handler, "handler");
        let result = xpcall(
            &mut state.vm,
            vec![TaggedValue::clean(Value::Function(f_closure)), TaggedValue::clean(Value::Function(handler_closure))],
        );
        match result {
            Err(thrown) => assert_eq!(thrown.status, Status::ErrorInError),
            Ok(_) => panic!("expected error-in-error to propagate"),
        }
    }

    #[test]
    fn secureexecuterange_visits_every_table_pair() {
        let mut state = State::new(&Config::default());
        let table = crate::gc::alloc(&mut state.vm.thread, TableObj::new(), false, 0);
        table.borrow_mut().data.raw_set(Value::Number(1.0), TaggedValue::clean(Value::Number(10.0)));
        table.borrow_mut().data.raw_set(Value::Number(2.0), TaggedValue::clean(Value::Number(20.0)));
        let seen: Rc<std::cell::RefCell<Vec<f64>>> = Rc::new(std::cell::RefCell::new(Vec::new()));
        let seen_clone = seen.clone();
        let visitor: NativeFn = Rc::new(move |_vm, args| {
            seen_clone.borrow_mut().push(arg(&args, 1).value.as_number().unwrap());
            Ok(Vec::new())
        });
        let visitor_closure = native(&mut state.vm, visitor, "visitor");
        let args = vec![TaggedValue::clean(Value::Table(table)), TaggedValue::clean(Value::Function(visitor_closure))];
        secureexecuterange(&mut state.vm, args).unwrap();
        let mut values = seen.borrow().clone();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(values, vec![10.0, 20.0]);
    }
}
