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

//! The script-visible standard library surface.
//!
//! `base` holds the security-observable primitives a script uses to
//! introspect and manage its own taint; `coroutine` holds the
//! `create`/`resume`/`yield`/`status`/`wrap`/`isyieldable` surface built
//! on the suspend/resume machinery in `coroutine.rs` and `vm.rs`. A real
//! embedding would add `string`/`table`/`math` here alongside them; this
//! runtime's scope is the taint system, not a complete base-language
//! library, so those are left to the embedder. Each module's `install`
//! is opt-in, called explicitly by the embedder the way `luaL_openlibs`
//! lets a host pick which standard libraries to open.

pub mod base;
pub mod coroutine;
