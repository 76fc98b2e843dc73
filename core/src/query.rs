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

//! Security-query surface.
//!
//! Every predicate here reports either the absent marker or the name of
//! the offending label; none of them consult `readmask`, because asking
//! "what taint does this carry" must never itself taint the asker. The
//! one query that looks like a normal table read -- taint of a table
//! field -- is answered straight from `TableObj::field_taint`, which
//! never touches `mask_read`, so the lookup is idempotent with respect
//! to the querying thread's own state.

use crate::label::Taint;
use crate::object::{ClosureKind, TableObj};
use crate::value::Value;
use crate::vm::Vm;

pub fn is_secure(vm: &Vm) -> bool {
    vm.thread.is_secure()
}

pub fn is_value_secure(value: &crate::value::TaggedValue) -> bool {
    value.is_secure()
}

pub fn is_object_secure(value: &Value) -> bool {
    object_taint(value).is_none()
}

/// The taint on a heap object's header, independent of whatever value
/// taint a particular reference to it carries. Scalar values (nil,
/// boolean, number) have no header and are always object-secure.
pub fn object_taint(value: &Value) -> Taint {
    match value {
        Value::Str(s) => s.borrow().header.taint.clone(),
        Value::Table(t) => t.borrow().header.taint.clone(),
        Value::Function(f) => f.borrow().header.taint.clone(),
        Value::UserData(u) => u.borrow().header.taint.clone(),
        Value::Thread(th) => th.borrow().header.taint.clone(),
        Value::Proto(p) => p.borrow().header.taint.clone(),
        Value::Upvalue(u) => u.borrow().header.taint.clone(),
        Value::Nil | Value::Boolean(_) | Value::Number(_) | Value::LightUserData(_) => None,
    }
}

/// Taint of `table[key]`, with reads disabled for the duration of the
/// lookup so that merely asking does not taint the caller's stack.
pub fn table_field_taint(table: &TableObj, key: &Value) -> Taint {
    table.field_taint(key)
}

/// `issecurevariable([tbl,] name)`: looks `name` up in `tbl` (defaulting
/// to the globals table) and reports whether that field is secure.
/// Table keys compare by string content, not by object identity, so the
/// lookup key needs no interner or thread allocation.
pub fn is_secure_variable(table: &TableObj, name: &str) -> (bool, Option<String>) {
    let key = Value::Str(std::rc::Rc::new(std::cell::RefCell::new(crate::gc::GcBox {
        header: Default::default(),
        data: crate::object::LStr(name.to_string()),
    })));
    let taint = table_field_taint(table, &key);
    match label_name(&taint) {
        Some(name) => (false, Some(name)),
        None => (true, None),
    }
}

/// Taint of upvalue `index` of a Lua closure. Native closures have no
/// upvalue cells in the script-visible sense and always report secure.
pub fn upvalue_taint(closure: &crate::object::Closure, index: usize) -> Taint {
    match &closure.kind {
        ClosureKind::Lua { upvalues, .. } => upvalues.get(index).and_then(|u| u.borrow().value.taint.clone()),
        ClosureKind::Native(_) => None,
    }
}

/// Taint of call frame `level` counting from the top (0 = the currently
/// executing frame), as recorded in that frame's `savedtaint` at entry.
pub fn call_taint(vm: &Vm, level: usize) -> Taint {
    let frames = &vm.thread.frames;
    if level >= frames.len() {
        return None;
    }
    frames[frames.len() - 1 - level].savedtaint.clone()
}

/// Taint of local register `index` in frame `level` (0 = current frame).
pub fn local_taint(vm: &Vm, level: usize, index: usize) -> Taint {
    let frames = &vm.thread.frames;
    if level >= frames.len() {
        return None;
    }
    let frame = &frames[frames.len() - 1 - level];
    vm.thread.stack.get(frame.base + index).and_then(|v| v.taint.clone())
}

pub fn label_name(taint: &Taint) -> Option<String> {
    taint.as_ref().map(|l| l.name().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::LabelTable;
    use std::rc::Rc;

    #[test]
    fn table_field_query_does_not_taint_caller() {
        let labels = Rc::new(LabelTable::new());
        let mut vm = Vm::new(labels.clone());
        vm.thread.stacktaint = None;
        let mut table = TableObj::new();
        let key = Value::Str(crate::interner::intern_adhoc(&mut vm.thread, "k"));
        let tainted_val = crate::value::TaggedValue::new(Value::Number(1.0), Some(labels.intern("Net")));
        table.raw_set(key.clone(), tainted_val);

        let taint = table_field_taint(&table, &key);
        assert_eq!(label_name(&taint).as_deref(), Some("Net"));
        assert!(vm.thread.stacktaint.is_none());
    }

    #[test]
    fn call_taint_reads_saved_frame_taint() {
        let labels = Rc::new(LabelTable::new());
        let vm = Vm::new(labels);
        assert_eq!(call_taint(&vm, 0), None);
    }
}
