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

//! Taint label store.
//!
//! A label is either *absent* (the distinguished "secure" value, modelled
//! as `Taint::absent()` / `Option::None` at call sites) or a small,
//! immutable, interned record carrying a human-readable name. Two labels
//! are equal iff they were interned with equal names -- interning gives us
//! that for free as identity comparison, never string comparison at read
//! time.
//!
//! Labels are not a lattice: there is no ordering between them, only an
//! equality domain. This is deliberately unlike capability or
//! confidentiality taint systems (see the crate's Non-goals) -- a label
//! only ever records "some untrusted source touched this", never "how
//! untrusted".

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// The well-known label a script stamps on itself via `forceinsecure()`
/// when it wants to become insecure without attributing a source.
pub const FORCE_INSECURE_NAME: &str = "*** ForceInsecure ***";

/// An interned label record. Labels are heap objects that participate in
/// GC (see `gc.rs`) but are pinned non-collectable while any live
/// reference -- including the intern table's own entry -- points at them.
#[derive(Debug)]
pub struct LabelRecord {
    pub name: String,
}

impl fmt::Display for LabelRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A reference to an interned label. Cloning is cheap (reference-counted);
/// equality is by interned identity, not by name.
#[derive(Debug, Clone)]
pub struct LabelRef(pub Rc<LabelRecord>);

impl PartialEq for LabelRef {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for LabelRef {}

impl std::hash::Hash for LabelRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl fmt::Display for LabelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.name)
    }
}

impl LabelRef {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// The ForceInsecure label is "not expected" by tools that flag
    /// anomalous taint at a point that should be clean.
    pub fn is_force_insecure(&self) -> bool {
        self.0.name == FORCE_INSECURE_NAME
    }
}

/// Process-wide (per thread-group / `State`) intern table.
/// The first lookup of a name allocates; every subsequent lookup of the
/// same name returns the same `LabelRef`.
#[derive(Debug, Default)]
pub struct LabelTable {
    by_name: RefCell<HashMap<String, LabelRef>>,
}

impl LabelTable {
    pub fn new() -> Self {
        Self {
            by_name: RefCell::new(HashMap::new()),
        }
    }

    /// Interns `name`, returning the canonical `LabelRef` for it.
    pub fn intern(&self, name: &str) -> LabelRef {
        if let Some(existing) = self.by_name.borrow().get(name) {
            return existing.clone();
        }
        let record = LabelRef(Rc::new(LabelRecord {
            name: name.to_string(),
        }));
        self.by_name
            .borrow_mut()
            .insert(name.to_string(), record.clone());
        record
    }

    /// The well-known ForceInsecure label, interned on first use.
    pub fn force_insecure(&self) -> LabelRef {
        self.intern(FORCE_INSECURE_NAME)
    }

    /// Number of currently-interned labels. Exposed for GC/profiling
    /// diagnostics, not part of the language surface.
    pub fn len(&self) -> usize {
        self.by_name.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops intern-table entries whose only remaining reference is the
    /// table itself (`Rc` strong count of 1). Called by the GC's sweep
    /// phase; labels are otherwise ordinary GC participants.
    pub fn sweep_unreferenced(&self) {
        self.by_name
            .borrow_mut()
            .retain(|_, label| Rc::strong_count(&label.0) > 1);
    }
}

/// The taint carried by a value or an object header: either absent
/// (secure) or a reference to an interned label. A plain type alias keeps
/// call sites reading plainly ("taint slot is absent or a
/// label reference").
pub type Taint = Option<LabelRef>;

/// Prefers the source's taint (preserving provenance), otherwise falls
/// back to the ambient contribution.
pub fn merge_taint(source: &Taint, ambient: &Taint) -> Taint {
    match source {
        Some(_) => source.clone(),
        None => ambient.clone(),
    }
}

/// ANDs two taints the way the mask operations do: `Some` wins
/// only if both sides are `Some`... actually masking is gate-by-bool, see
/// `thread.rs::mask_read`/`mask_write`, which consume `bool` masks, not
/// two taints. This helper is the label-domain equivalent used when a
/// boolean gate should pass a taint through unchanged or erase it.
pub fn gate(taint: &Taint, open: bool) -> Taint {
    if open {
        taint.clone()
    } else {
        None
    }
}
