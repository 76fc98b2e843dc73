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

//! The allocation hook.
//!
//! The collector itself -- the incremental mark-and-sweep pass that
//! reclaims unreachable objects -- is an external collaborator per this
//! crate's scope: we do not respecify its tracing algorithm.
//! Heap object lifetime here is managed with reference counting (`Rc`),
//! which is sufficient for every acyclic object this runtime creates and
//! keeps the allocation-hook invariants -- the actual in-scope part --
//! front and center instead of buried in a tracing collector's plumbing.
//!
//! What *is* in scope, and fully implemented here, is the single point
//! every allocation is routed through and the priority order it applies
//! when stamping a fresh object's header.

use crate::label::Taint;
use crate::object::GcHeader;
use crate::thread::ThreadState;
use std::cell::RefCell;
use std::rc::Rc;

/// A garbage-collected heap object: a header (carrying the object's own
/// taint "heap object header") plus its payload.
pub struct GcBox<T> {
    pub header: GcHeader,
    pub data: T,
}

/// A handle to a heap-allocated object. Reference-counted for lifetime
/// management; the header lives alongside the data so object taint can be
/// queried and updated independently of any value taint pointing at it.
pub type Gc<T> = Rc<RefCell<GcBox<T>>>;

/// Running totals the allocation hook maintains for `profiling.rs`'s
/// per-source "owned bytes" statistic. Not a real size
/// accounting pass -- just a monotonic counter of `alloc` calls and a
/// caller-supplied size estimate, which is all the profiler needs.
#[derive(Debug, Default)]
pub struct AllocStats {
    pub objects_allocated: u64,
    pub bytes_allocated: u64,
}

/// Allocates a fresh heap object, applying this priority order:
///
/// 1. if `newgctaint` is set, use it;
/// 2. else if `stacktaint` is set, use it;
/// 3. else, for function objects only (`is_function`), if `newcltaint` is
///    set, use it;
/// 4. else leave it absent.
///
/// The result is finally ANDed with `writemask`: a write-blocked thread
/// never taints allocations, even if `stacktaint` is set and reads are
/// open. This corner case is intentional and covered by a unit test
/// below.
pub fn alloc<T>(thread: &mut ThreadState, data: T, is_function: bool, approx_bytes: u64) -> Gc<T> {
    let taint = allocation_taint(thread, is_function);
    thread.alloc_stats.objects_allocated += 1;
    thread.alloc_stats.bytes_allocated += approx_bytes;
    Rc::new(RefCell::new(GcBox {
        header: GcHeader { taint },
        data,
    }))
}

/// The taint a fresh allocation would be stamped with, without performing
/// the allocation. Exposed separately so callers that build the object's
/// `data` can read `thread.writemask` consistently even when they need to
/// construct the payload in multiple steps.
pub fn allocation_taint(thread: &ThreadState, is_function: bool) -> Taint {
    let taint = if thread.newgctaint.is_some() {
        thread.newgctaint.clone()
    } else if thread.stacktaint.is_some() {
        thread.stacktaint.clone()
    } else if is_function && thread.newcltaint.is_some() {
        thread.newcltaint.clone()
    } else {
        None
    };
    crate::label::gate(&taint, thread.writemask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::LabelTable;

    fn fresh_thread() -> ThreadState {
        ThreadState::new(Rc::new(LabelTable::new()))
    }

    #[test]
    fn newgctaint_wins_over_everything() {
        let mut t = fresh_thread();
        let labels = t.labels.clone();
        t.newgctaint = Some(labels.intern("Net"));
        t.stacktaint = Some(labels.intern("Secret"));
        t.newcltaint = Some(labels.intern("Other"));
        let taint = allocation_taint(&t, true);
        assert_eq!(taint.unwrap().name(), "Net");
    }

    #[test]
    fn stacktaint_wins_over_newcltaint_for_non_functions() {
        let mut t = fresh_thread();
        let labels = t.labels.clone();
        t.stacktaint = Some(labels.intern("Secret"));
        t.newcltaint = Some(labels.intern("ClosureTaint"));
        let taint = allocation_taint(&t, false);
        assert_eq!(taint.unwrap().name(), "Secret");
    }

    #[test]
    fn newcltaint_only_applies_to_functions() {
        let mut t = fresh_thread();
        let labels = t.labels.clone();
        t.newcltaint = Some(labels.intern("ClosureTaint"));
        assert!(allocation_taint(&t, false).is_none());
        assert_eq!(allocation_taint(&t, true).unwrap().name(), "ClosureTaint");
    }

    /// Open question resolved: a thread with writes blocked but
    /// reads open allocates untainted objects even while `stacktaint` is
    /// set.
    #[test]
    fn writemask_blocked_forces_untainted_allocation() {
        let mut t = fresh_thread();
        let labels = t.labels.clone();
        t.stacktaint = Some(labels.intern("Secret"));
        t.writemask = false;
        t.readmask = true;
        assert!(allocation_taint(&t, false).is_none());
    }
}
