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

//! Per-thread taint state and the call-frame stack.
//!
//! Each thread (including coroutines) owns the ambient taint
//! bookkeeping the rest of the subsystem consults on every read and
//! write. Only the four operations named below
//! (`mask_read`/`mask_write`/`taint_stack_from`/`save`+`restore`) are
//! meant to be called by the runtime core -- everything else in this
//! module is plumbing around them.

use crate::gc::{AllocStats, Gc};
use crate::label::{LabelTable, Taint};
use crate::object::Closure;
use crate::value::TaggedValue;
use std::rc::Rc;

/// A single activation record. `savedtaint` is the ambient `stacktaint`
/// at the moment the frame was entered, queryable by the
/// security-query surface and by `debug`-style introspection.
pub struct Frame {
    pub closure: Gc<Closure>,
    pub pc: usize,
    /// Index into the thread's value stack where this frame's registers
    /// begin.
    pub base: usize,
    /// Absolute stack index one past the last logically valid value --
    /// the "to-top" marker a `b=0`/`c=0` call or a `...` expansion leaves
    /// behind for the next to-top consumer to read.
    pub top: usize,
    pub varargs: Vec<TaggedValue>,
    pub savedtaint: Taint,
    /// Set just before a `CALL` instruction invokes its callee: the
    /// destination register and result-count encoding that instruction's
    /// own result-spreading would use. If that callee yields instead of
    /// returning, this is how `Vm::resume_coroutine` knows where to
    /// deliver the eventual resume values once this frame continues.
    pub pending_call: Option<(u8, u8)>,
    /// `Vm::instructions_executed` at frame entry, for the profiler's
    /// own-ticks accounting.
    pub entry_instructions: u64,
    /// `ThreadState::alloc_stats.bytes_allocated` at frame entry.
    pub entry_bytes: u64,
    /// Ticks spent in calls this frame itself made, accumulated at each
    /// `CALL` as it returns -- subtracted from the frame's total lifetime
    /// so the profiler attributes subroutine time to the subroutine, not
    /// its caller.
    pub subroutine_ticks: u64,
}

/// A snapshot of the mutable taint substate, for `save()`/`restore()`
/// and protected-call checkpointing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaintSnapshot {
    pub stacktaint: Taint,
    pub readmask: bool,
    pub writemask: bool,
    pub vmexecmask: bool,
    pub newgctaint: Taint,
    pub newcltaint: Taint,
    pub fixedtaint: bool,
}

pub struct ThreadState {
    pub labels: Rc<LabelTable>,

    pub stacktaint: Taint,
    pub readmask: bool,
    pub writemask: bool,
    /// Forced on whenever the VM is currently executing a function whose
    /// *object* taint is present; an
    /// insecure function taints everything it touches no matter what the
    /// embedder's masks say.
    pub vmexecmask: bool,
    pub newgctaint: Taint,
    pub newcltaint: Taint,
    /// Freezes `stacktaint` against further changes from reads; used
    /// while restoring a checkpoint so the restore itself cannot be
    /// undone by a read that races with it (single-threaded, but the flag
    /// still matters across reentrant restores).
    pub fixedtaint: bool,
    /// Cached masked form of `stacktaint`, recomputed by `mask_write`.
    pub writetaint: Taint,

    pub stack: Vec<TaggedValue>,
    pub frames: Vec<Frame>,

    pub alloc_stats: AllocStats,

    /// True for a coroutine's own thread state, false for a state's main
    /// thread. Only used by `coroutine.isyieldable()`.
    pub is_coroutine: bool,
}

impl ThreadState {
    pub fn new(labels: Rc<LabelTable>) -> Self {
        Self {
            labels,
            stacktaint: None,
            readmask: true,
            writemask: true,
            vmexecmask: false,
            newgctaint: None,
            newcltaint: None,
            fixedtaint: false,
            writetaint: None,
            stack: Vec::new(),
            frames: Vec::new(),
            alloc_stats: AllocStats::default(),
            is_coroutine: false,
        }
    }

    /// `mask_read(source_taint)`: source-taint ANDed with
    /// `readmask | vmexecmask`. `vmexecmask` forces reads open
    /// even if the embedder closed `readmask`, because an insecure
    /// function must taint everything it reads.
    pub fn mask_read(&self, source_taint: &Taint) -> Taint {
        crate::label::gate(source_taint, self.readmask || self.vmexecmask)
    }

    /// `mask_write()`: `stacktaint` ANDed with `writemask`.
    pub fn mask_write(&mut self) -> Taint {
        self.writetaint = crate::label::gate(&self.stacktaint, self.writemask);
        self.writetaint.clone()
    }

    /// `taint_stack_from(source)`: applies `mask_read` and, if the result
    /// is non-absent and `fixedtaint` is absent, installs it as the new
    /// `stacktaint`. This is how "reading a tainted value
    /// taints the stack" is implemented.
    pub fn taint_stack_from(&mut self, source_taint: &Taint) {
        let masked = self.mask_read(source_taint);
        if masked.is_some() && !self.fixedtaint {
            self.stacktaint = masked;
        }
    }

    pub fn snapshot(&self) -> TaintSnapshot {
        TaintSnapshot {
            stacktaint: self.stacktaint.clone(),
            readmask: self.readmask,
            writemask: self.writemask,
            vmexecmask: self.vmexecmask,
            newgctaint: self.newgctaint.clone(),
            newcltaint: self.newcltaint.clone(),
            fixedtaint: self.fixedtaint,
        }
    }

    pub fn restore(&mut self, snap: &TaintSnapshot) {
        self.stacktaint = snap.stacktaint.clone();
        self.readmask = snap.readmask;
        self.writemask = snap.writemask;
        self.vmexecmask = snap.vmexecmask;
        self.newgctaint = snap.newgctaint.clone();
        self.newcltaint = snap.newcltaint.clone();
        self.fixedtaint = snap.fixedtaint;
    }

    /// `exchange(ts)`: swaps the current substate with `other`, returning
    /// what was previously installed. Calling this twice with the same
    /// pair of snapshots is the identity.
    pub fn exchange(&mut self, other: TaintSnapshot) -> TaintSnapshot {
        let previous = self.snapshot();
        self.restore(&other);
        previous
    }

    /// `resettaint`: debugger helper that wipes all stack and frame
    /// taint to absent.
    pub fn reset_taint(&mut self) {
        self.stacktaint = None;
        self.writetaint = None;
        self.fixedtaint = false;
        for v in &mut self.stack {
            v.taint = None;
        }
        for f in &mut self.frames {
            f.savedtaint = None;
        }
    }

    pub fn is_secure(&self) -> bool {
        self.stacktaint.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> ThreadState {
        ThreadState::new(Rc::new(LabelTable::new()))
    }

    #[test]
    fn mask_read_gated_by_readmask_or_vmexecmask() {
        let mut t = fresh();
        let label = Some(t.labels.clone().intern("X"));
        t.readmask = false;
        t.vmexecmask = false;
        assert_eq!(t.mask_read(&label), None);
        t.vmexecmask = true;
        assert_eq!(t.mask_read(&label), label);
    }

    #[test]
    fn save_restore_round_trips() {
        let mut t = fresh();
        let label = Some(t.labels.clone().intern("X"));
        t.stacktaint = label.clone();
        t.readmask = false;
        let snap = t.snapshot();
        t.stacktaint = None;
        t.readmask = true;
        t.restore(&snap);
        assert_eq!(t.stacktaint, label);
        assert!(!t.readmask);
    }

    #[test]
    fn exchange_twice_is_identity() {
        let mut t = fresh();
        let label_a = Some(t.labels.clone().intern("A"));
        let label_b = Some(t.labels.clone().intern("B"));
        t.stacktaint = label_a.clone();
        let snap_b = TaintSnapshot {
            stacktaint: label_b.clone(),
            readmask: true,
            writemask: true,
            vmexecmask: false,
            newgctaint: None,
            newcltaint: None,
            fixedtaint: false,
        };
        let original = t.exchange(snap_b.clone());
        assert_eq!(t.stacktaint, label_b);
        let back = t.exchange(original);
        assert_eq!(t.stacktaint, label_a);
        assert_eq!(back, snap_b);
    }

    #[test]
    fn fixedtaint_blocks_taint_stack_from() {
        let mut t = fresh();
        t.fixedtaint = true;
        let label = Some(t.labels.clone().intern("X"));
        t.taint_stack_from(&label);
        assert!(t.stacktaint.is_none());
    }
}
