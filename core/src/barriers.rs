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

//! The write-barrier family.
//!
//! Every kind of destination has exactly one write-barrier function here.
//! They differ in exactly one dimension -- what gets stamped on the
//! destination's taint slot -- which is why each is a few lines long; the
//! point of keeping them as separate named functions rather than one
//! parameterised helper is that each destination's rule stays easy to
//! audit in isolation -- a reviewer can match each row to a function
//! one-to-one.

use crate::thread::ThreadState;
use crate::value::{TaggedValue, Value};

/// "Fresh object being initialized (interior slot)": source's taint
/// exactly, preserving provenance. Used when building a table literal's
/// initial fields, a closure's initial upvalue contents, etc.
pub fn init_interior_slot(source: &TaggedValue) -> TaggedValue {
    TaggedValue::new(source.value.clone(), source.taint.clone())
}

/// "Move into a stack slot": source's taint if present; otherwise
/// `mask_write()` of the current thread. If the source had taint, this
/// additionally taints the stack (reading a tainted value taints the
/// stack) -- the `MOVE`/`GETGLOBAL`/`GETUPVAL`/`GETTABLE`/`SELF` opcodes
/// all funnel through this one function.
pub fn move_to_stack(thread: &mut ThreadState, source: &TaggedValue) -> TaggedValue {
    let taint = match &source.taint {
        Some(label) => Some(label.clone()),
        None => thread.mask_write(),
    };
    if source.taint.is_some() {
        thread.taint_stack_from(&source.taint);
    }
    TaggedValue::new(source.value.clone(), taint)
}

/// "Store into a table field via the VM's `SETTABLE` opcode": the
/// source's taint, no ambient contribution. This is the "secure
/// constant" rule -- a securely-loaded function can
/// assign its own compile-time constants into an object's fields without
/// the caller's ambient taint leaking in, because `SETTABLE` never
/// consults `stacktaint` at all.
pub fn settable_store(source: &TaggedValue) -> TaggedValue {
    TaggedValue::new(source.value.clone(), source.taint.clone())
}

/// "Store into a table field via the C API's 'raw set'": no taint added,
/// regardless of the source's own taint. Used by embedder-side `rawset`
/// bindings that intentionally strip provenance (e.g. populating a
/// lookup table from trusted native data).
pub fn rawset_store(value: Value) -> TaggedValue {
    TaggedValue::clean(value)
}

/// "Store into an upvalue": source's taint; thread is not consulted.
pub fn setupval_store(source: &TaggedValue) -> TaggedValue {
    TaggedValue::new(source.value.clone(), source.taint.clone())
}

/// "Store into a local via explicit debug API": source's taint only.
pub fn setlocal_debug_store(source: &TaggedValue) -> TaggedValue {
    TaggedValue::new(source.value.clone(), source.taint.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::LabelTable;
    use std::rc::Rc;

    fn fresh() -> ThreadState {
        ThreadState::new(Rc::new(LabelTable::new()))
    }

    #[test]
    fn move_to_stack_prefers_source_taint() {
        let mut t = fresh();
        t.stacktaint = Some(t.labels.clone().intern("Ambient"));
        let source = TaggedValue::new(Value::Number(1.0), Some(t.labels.clone().intern("Source")));
        let result = move_to_stack(&mut t, &source);
        assert_eq!(result.taint.unwrap().name(), "Source");
    }

    #[test]
    fn move_to_stack_falls_back_to_ambient() {
        let mut t = fresh();
        t.stacktaint = Some(t.labels.clone().intern("Ambient"));
        let source = TaggedValue::clean(Value::Number(1.0));
        let result = move_to_stack(&mut t, &source);
        assert_eq!(result.taint.unwrap().name(), "Ambient");
    }

    #[test]
    fn reading_tainted_source_taints_the_stack() {
        let mut t = fresh();
        assert!(t.stacktaint.is_none());
        let source = TaggedValue::new(Value::Number(1.0), Some(t.labels.clone().intern("X")));
        let _ = move_to_stack(&mut t, &source);
        assert_eq!(t.stacktaint.unwrap().name(), "X");
    }

    #[test]
    fn settable_ignores_ambient_entirely() {
        let mut t = fresh();
        t.stacktaint = Some(t.labels.clone().intern("Ambient"));
        let clean_source = TaggedValue::clean(Value::Number(0.0));
        let result = settable_store(&clean_source);
        assert!(result.taint.is_none(), "settable must not pick up ambient taint");
    }

    #[test]
    fn rawset_always_clean() {
        let tainted = TaggedValue::new(Value::Number(1.0), {
            let table = LabelTable::new();
            Some(table.intern("X"))
        });
        let result = rawset_store(tainted.value);
        assert!(result.taint.is_none());
    }
}
