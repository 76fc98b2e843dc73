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

//! The instruction set the VM dispatch loop interprets.
//!
//! Register-based, in the spirit of the base language's own bytecode --
//! registers are stack slot indices relative to the current frame's base.
//! Every opcode that moves data is named explicitly below; this
//! enum carries exactly those plus the handful of control-flow opcodes an
//! end-to-end VM needs (jumps, `FORLOOP`, vararg).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instr {
    /// R(a) := constants[bx]. Does not contribute ambient taint -- see
    /// `vm.rs` doc comment on the secure-constant resolution.
    LoadK { a: u8, bx: u16 },
    /// R(a) := b; if skip_next, pc += 1 (the two-instruction idiom used to
    /// materialize a comparison opcode's result as a plain value).
    LoadBool { a: u8, b: bool, skip_next: bool },
    LoadNil { a: u8, b: u8 },
    /// R(a) := R(b). Follows the stack-move write barrier.
    Move { a: u8, b: u8 },
    GetGlobal { a: u8, name: u16 },
    SetGlobal { a: u8, name: u16 },
    GetUpval { a: u8, b: u8 },
    SetUpval { a: u8, b: u8 },
    /// R(a) := R(b)[R(c)]
    GetTable { a: u8, b: u8, c: u8 },
    /// R(a)[R(b)] := R(c)
    SetTable { a: u8, b: u8, c: u8 },
    /// R(a) := R(b); R(a+1) := R(b)[R(c)] (method-call sugar)
    SelfOp { a: u8, b: u8, c: u8 },
    NewTable { a: u8 },
    Add { a: u8, b: u8, c: u8 },
    Sub { a: u8, b: u8, c: u8 },
    Mul { a: u8, b: u8, c: u8 },
    Div { a: u8, b: u8, c: u8 },
    Mod { a: u8, b: u8, c: u8 },
    Pow { a: u8, b: u8, c: u8 },
    Unm { a: u8, b: u8 },
    Not { a: u8, b: u8 },
    Len { a: u8, b: u8 },
    Concat { a: u8, b: u8, c: u8 },
    Jmp { offset: i32 },
    Eq { a: bool, b: u8, c: u8 },
    Lt { a: bool, b: u8, c: u8 },
    Le { a: bool, b: u8, c: u8 },
    Test { a: u8, c: bool },
    /// Call R(a)(R(a+1)..R(a+b-1)); nargs=b-1 (0 means "to top"); nresults=c-1.
    Call { a: u8, b: u8, c: u8 },
    TailCall { a: u8, b: u8 },
    Return { a: u8, b: u8 },
    ForPrep { a: u8, offset: i32 },
    ForLoop { a: u8, offset: i32 },
    /// R(a) := closure(protos[bx])
    Closure { a: u8, bx: u16 },
    Vararg { a: u8, b: u8 },
}
