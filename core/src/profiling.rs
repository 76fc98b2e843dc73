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

//! Profiling and script timeouts.
//!
//! Orthogonal to taint propagation but sharing the frame-enter/leave
//! hooks: each frame records entry ticks and accumulates own-ticks vs
//! subroutine-ticks at leave; per-source statistics sum own-ticks and
//! owned bytes across functions sharing a taint label. When profiling is
//! globally disabled the hooks are expected to take a fast path -- see
//! `enabled` below, checked before any bookkeeping happens.

use crate::label::LabelRef;
use std::collections::HashMap;

/// Per-(taint-label) aggregate, keyed by `None` for secure code and
/// `Some(label)` for code tainted with that label -- "per
/// source statistics sum own-ticks and owned-bytes across functions
/// sharing a taint label".
#[derive(Debug, Clone, Default)]
pub struct SourceStats {
    pub own_ticks: u64,
    pub owned_bytes: u64,
    pub calls: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TaintKey(Option<usize>);

fn key_for(label: &Option<LabelRef>) -> TaintKey {
    TaintKey(label.as_ref().map(|l| std::rc::Rc::as_ptr(&l.0) as usize))
}

pub struct Profiler {
    pub enabled: bool,
    by_source: HashMap<TaintKey, SourceStats>,
    label_names: HashMap<TaintKey, String>,
}

impl Profiler {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            by_source: HashMap::new(),
            label_names: HashMap::new(),
        }
    }

    /// Called on frame leave with the own-ticks consumed since entry
    /// (excluding ticks attributed to called subroutines) and the frame's
    /// object taint, which determines the bucket.
    pub fn record_frame(&mut self, taint: &Option<LabelRef>, own_ticks: u64, owned_bytes: u64) {
        if !self.enabled {
            return;
        }
        let key = key_for(taint);
        self.label_names
            .entry(key)
            .or_insert_with(|| taint.as_ref().map(|l| l.name().to_string()).unwrap_or_default());
        let entry = self.by_source.entry(key).or_default();
        entry.own_ticks += own_ticks;
        entry.owned_bytes += owned_bytes;
        entry.calls += 1;
    }

    pub fn stats_for(&self, taint: &Option<LabelRef>) -> SourceStats {
        self.by_source.get(&key_for(taint)).cloned().unwrap_or_default()
    }

    pub fn total_sources(&self) -> usize {
        self.by_source.len()
    }
}

/// A script-execution budget. Triggering either limit raises a runtime
/// error with a distinguished message, caught by any enclosing protected
/// call.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    pub max_ticks_since_entry: Option<u64>,
    pub max_instructions: Option<u64>,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            max_ticks_since_entry: None,
            max_instructions: None,
        }
    }
}

impl TimeoutPolicy {
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Checked at each instruction and each call edge. Returns
    /// the specific `VmError` to raise, or `None` if still within budget.
    pub fn check(&self, ticks_since_entry: u64, instructions_executed: u64) -> Option<crate::error::VmError> {
        if let Some(max_ticks) = self.max_ticks_since_entry {
            if ticks_since_entry > max_ticks {
                return Some(crate::error::VmError::TimeBudgetExceeded);
            }
        }
        if let Some(max_instr) = self.max_instructions {
            if instructions_executed > max_instr {
                return Some(crate::error::VmError::InstructionBudgetExceeded);
            }
        }
        None
    }
}
