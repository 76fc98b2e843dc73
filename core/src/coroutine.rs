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

//! Coroutine integration.
//!
//! A coroutine is cooperatively scheduled -- there is no preemption, only
//! `yield`/`resume` handoffs, and all activity in a thread-group is
//! serialised. This module owns the coroutine object itself and
//! the taint bookkeeping at the resume/yield boundary; the opcode-level
//! handoff of control lives in `vm.rs`.

use crate::label::Taint;
use crate::thread::ThreadState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineStatus {
    Suspended,
    Running,
    Normal,
    Dead,
}

/// The heap object behind `Value::Thread`. Owns an independent
/// `ThreadState` -- its own stack, frames, and taint substate -- created
/// with an absent `stacktaint` and fully open masks regardless of the
/// creating thread's own state ("the new thread starts with an
/// absent stacktaint and empty masks inherited from default").
pub struct LuaThread {
    pub state: ThreadState,
    pub status: CoroutineStatus,
    /// The function this coroutine's body runs, captured at creation.
    pub body: Option<crate::gc::Gc<crate::object::Closure>>,
}

impl LuaThread {
    pub fn new(labels: std::rc::Rc<crate::label::LabelTable>) -> Self {
        let mut state = ThreadState::new(labels);
        state.stacktaint = None;
        state.readmask = true;
        state.writemask = true;
        state.is_coroutine = true;
        Self {
            state,
            status: CoroutineStatus::Suspended,
            body: None,
        }
    }
}

/// Applied at the resume boundary: the source thread's `stacktaint` is
/// copied into the destination's `stacktaint` snapshot, and per-value
/// taint on the transferred arguments/results carries across intact.
pub fn copy_stacktaint_on_resume(caller: &ThreadState, callee: &mut ThreadState) -> Taint {
    let previous_callee_taint = callee.stacktaint.clone();
    callee.stacktaint = caller.stacktaint.clone();
    previous_callee_taint
}

/// Applied when control returns to the resumer (either via `yield` or the
/// coroutine finishing): the caller's `stacktaint` becomes whichever of
/// {pre-resume, the coroutine's final stacktaint} is non-absent, with the
/// caller's own pre-existing taint taking precedence when both are
/// present. This is the "a coroutine cannot clean its caller" invariant:
/// a coroutine can only ever add taint to its resumer, never remove it.
pub fn merge_stacktaint_on_return(pre_resume: &Taint, coroutine_final: &Taint) -> Taint {
    match pre_resume {
        Some(_) => pre_resume.clone(),
        None => coroutine_final.clone(),
    }
}
