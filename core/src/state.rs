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

//! Top-level state: one "thread group".
//!
//! A `State` owns exactly the resources a thread group is allowed to
//! share: the taint label intern table, the string interner, the main
//! thread's `Vm`, and a registry table for embedder bookkeeping. Nothing
//! here is shared across `State`s -- each embedding call creates its own
//! and every coroutine spawned from it stays inside that one group for
//! its lifetime.

use crate::error::VmError;
use crate::gc::Gc;
use crate::interner::StringInterner;
use crate::label::LabelTable;
use crate::object::{Closure, ClosureKind, TableObj};
use crate::profiling::TimeoutPolicy;
use crate::value::{TaggedValue, Value};
use crate::vm::Vm;
use std::rc::Rc;

pub struct State {
    pub labels: Rc<LabelTable>,
    pub strings: StringInterner,
    pub vm: Vm,
    /// Embedder-visible registry, analogous to the base language's
    /// registry pseudo-index -- a place to stash values reachable only
    /// from host code, never from a script's globals.
    pub registry: Gc<TableObj>,
}

impl State {
    pub fn new(config: &crate::config::Config) -> Self {
        let labels = Rc::new(LabelTable::new());
        let mut vm = Vm::new(labels.clone());
        vm.profiler = crate::profiling::Profiler::new(config.profiling_enabled);
        vm.timeout = TimeoutPolicy {
            max_ticks_since_entry: config.max_ticks_since_entry,
            max_instructions: config.max_instructions,
        };
        let registry = crate::gc::alloc(&mut vm.thread, TableObj::new(), false, 16);
        Self {
            labels,
            strings: StringInterner::new(),
            vm,
            registry,
        }
    }

    /// Interns a Lua string constant through this state's shared string
    /// table, so that two identical source-level literals compiled in
    /// the same state share one heap object.
    pub fn intern(&mut self, s: &str) -> Gc<crate::object::LStr> {
        self.strings.intern(&mut self.vm.thread, s)
    }

    /// Compiles and loads `source` as a new top-level closure, stamping
    /// its object taint from the loading thread's ambient state exactly
    /// as `chunk::load` would for a serialized chunk.
    pub fn load(&mut self, source: &str, chunk_name: &str) -> Result<Gc<Closure>, VmError> {
        let ast = crate::parser::Parser::parse(source)?;
        let proto = crate::compiler::compile(&ast, chunk_name)?;
        let proto = crate::gc::alloc(&mut self.vm.thread, proto, false, 0);
        Ok(crate::gc::alloc(
            &mut self.vm.thread,
            Closure {
                kind: ClosureKind::Lua {
                    proto,
                    upvalues: Vec::new(),
                },
                name: chunk_name.to_string(),
            },
            true,
            0,
        ))
    }

    pub fn global(&self, name: &str) -> TaggedValue {
        let key = Value::Str(Rc::new(std::cell::RefCell::new(crate::gc::GcBox {
            header: Default::default(),
            data: crate::object::LStr(name.to_string()),
        })));
        self.vm.globals.borrow().data.get(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn load_and_call_a_chunk() {
        let mut state = State::new(&Config::default());
        let closure = state.load("x = 1 + 1", "chunk").unwrap();
        state.vm.call(closure, Vec::new()).unwrap();
        let x = state.global("x");
        assert_eq!(x.value.as_number(), Some(2.0));
    }

    #[test]
    fn each_state_owns_independent_labels() {
        let a = State::new(&Config::default());
        let b = State::new(&Config::default());
        assert!(!Rc::ptr_eq(&a.labels, &b.labels));
    }
}
