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

//! Embedder-tunable knobs, serializable so a host process can load them
//! from a config file or environment alongside the rest of its settings.

use serde::{Deserialize, Serialize};

/// Knobs a `State` is constructed with. None of these affect taint
/// semantics -- they govern resource limits and diagnostics only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum elapsed ticks a single frame activation may run before the
    /// timeout policy raises `TimeBudgetExceeded`. `None` disables the
    /// check.
    pub max_ticks_since_entry: Option<u64>,
    /// Maximum instructions a thread may execute before
    /// `InstructionBudgetExceeded` is raised. `None` disables the check.
    pub max_instructions: Option<u64>,
    /// Whether the profiler records per-source statistics. Disabled by
    /// default; the allocation and frame-leave hooks take a fast path
    /// when this is off.
    pub profiling_enabled: bool,
    /// Approximate bytes between GC steps. Purely advisory -- this
    /// runtime's collector is not respecified here, only the taint hook
    /// on allocation -- but embedders size their own step budget from it.
    pub gc_step_bytes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_ticks_since_entry: None,
            max_instructions: None,
            profiling_enabled: false,
            gc_step_bytes: 64 * 1024,
        }
    }
}

impl Config {
    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_no_budgets() {
        let cfg = Config::default();
        assert!(cfg.max_ticks_since_entry.is_none());
        assert!(cfg.max_instructions.is_none());
        assert!(!cfg.profiling_enabled);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let cfg = Config::from_json(r#"{"profiling_enabled": true}"#).unwrap();
        assert!(cfg.profiling_enabled);
        assert!(cfg.max_instructions.is_none());
        assert_eq!(cfg.gc_step_bytes, 64 * 1024);
    }

    #[test]
    fn round_trips_through_json() {
        let cfg = Config {
            max_ticks_since_entry: Some(10_000),
            max_instructions: Some(1_000_000),
            profiling_enabled: true,
            gc_step_bytes: 4096,
        };
        let json = cfg.to_json().unwrap();
        let back = Config::from_json(&json).unwrap();
        assert_eq!(cfg.max_ticks_since_entry, back.max_ticks_since_entry);
        assert_eq!(cfg.max_instructions, back.max_instructions);
        assert_eq!(cfg.profiling_enabled, back.profiling_enabled);
        assert_eq!(cfg.gc_step_bytes, back.gc_step_bytes);
    }
}
