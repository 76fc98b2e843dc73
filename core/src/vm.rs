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

//! The VM dispatch loop: the instruction-by-instruction
//! interpreter that every write-barrier rule ultimately funnels through.
//!
//! **LOADK / LOADBOOL / LOADNIL.** Taken literally, these
//! "contribute ambient taint" like any other stack-move destination. But a
//! securely-compiled function's numeric-literal assignment needs to stay
//! secure when called from an insecure context, which only holds if
//! literal loads do *not* pick up the live ambient taint. The resolution
//! (recorded in `proto.rs` and `DESIGN.md`) is that a
//! constant's taint is frozen once, at chunk-load time (`chunk.rs` stamps
//! every constant with the loading thread's ambient taint), never
//! recomputed per `LOADK`; a securely-loaded chunk's constants are
//! therefore permanently secure regardless of who later calls into it.
//! `LOADBOOL`/`LOADNIL` have no constant pool backing but are literals in
//! exactly the same sense, so they get the same treatment: always secure.
//!
//! Calls are modelled by host-language recursion -- a Lua-to-Lua call is a
//! nested Rust call into `exec_loop`, not an explicit frame-stack trampoline
//! -- which keeps this module a direct transcription of the opcode table
//! instead of a second bytecode interpreter for its own control flow.

use crate::error::{Status, Thrown, VmError};
use crate::gc::{self, Gc};
use crate::label::Taint;
use crate::object::{Closure, ClosureKind, NativeFn, TableObj, UpvalCell};
use crate::opcode::Instr;
use crate::profiling::{Profiler, TimeoutPolicy};
use crate::proto::Proto;
use crate::thread::{Frame, ThreadState};
use crate::value::{TaggedValue, Value};
use std::rc::Rc;

const MAX_CALL_DEPTH: usize = 200;

pub struct Vm {
    pub thread: ThreadState,
    pub globals: Gc<TableObj>,
    pub profiler: Profiler,
    pub timeout: TimeoutPolicy,
    /// The installed error handler, settable from script via
    /// `stdlib::base::seterrorhandler` and consulted by
    /// `stdlib::base::geterrorhandler`. Not consulted by `pcall`/`xpcall`
    /// themselves -- those always take an explicit handler argument.
    pub error_handler: Option<Gc<Closure>>,
    /// The chain of coroutines currently inside a `resume` call, innermost
    /// last. Consulted only by `stdlib::coroutine::status` to tell a
    /// "normal" coroutine (waiting on a nested resume it issued) apart
    /// from one that is merely suspended.
    pub coroutine_stack: Vec<Gc<crate::coroutine::LuaThread>>,
    instructions_executed: u64,
}

/// Renders a Lua number the way the base language's `tostring`/`..` coercion
/// does: integral values print without a decimal point.
pub fn number_to_string(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

impl Vm {
    pub fn new(labels: Rc<crate::label::LabelTable>) -> Self {
        let mut thread = ThreadState::new(labels);
        let globals = gc::alloc(&mut thread, TableObj::new(), false, 64);
        Vm {
            thread,
            globals,
            profiler: Profiler::new(false),
            timeout: TimeoutPolicy::unlimited(),
            error_handler: None,
            coroutine_stack: Vec::new(),
            instructions_executed: 0,
        }
    }

    fn runtime_error(&self, err: VmError) -> Thrown {
        let value = TaggedValue::new(
            Value::Str(Rc::new(std::cell::RefCell::new(gc::GcBox {
                header: crate::object::GcHeader::default(),
                data: crate::object::LStr(err.to_string()),
            }))),
            self.thread.stacktaint.clone(),
        );
        Thrown::from_vm_error(err, value)
    }

    /// Invokes `closure` with `args`. The caller's `stacktaint` can only
    /// become *more* tainted by the call, never cleaner, matching the
    /// coroutine "cannot clean caller" invariant, which is the same rule
    /// applied across a resume.
    pub fn call(&mut self, closure: Gc<Closure>, args: Vec<TaggedValue>) -> Result<Vec<TaggedValue>, Thrown> {
        if self.thread.frames.len() >= MAX_CALL_DEPTH {
            return Err(self.runtime_error(VmError::StackOverflow));
        }
        enum Kind {
            Native(NativeFn),
            Lua(Gc<Proto>, Vec<Gc<UpvalCell>>),
        }
        let object_taint = closure.borrow().header.taint.clone();
        let kind = {
            let b = closure.borrow();
            match &b.data.kind {
                ClosureKind::Native(f) => Kind::Native(f.clone()),
                ClosureKind::Lua { proto, upvalues } => Kind::Lua(proto.clone(), upvalues.clone()),
            }
        };
        let prev_vmexecmask = self.thread.vmexecmask;
        if object_taint.is_some() {
            self.thread.vmexecmask = true;
        }
        let before = self.thread.stacktaint.clone();
        let result = match kind {
            Kind::Native(f) => (f)(self, args),
            Kind::Lua(proto, upvalues) => self.run_lua(closure.clone(), proto, upvalues, args, before.clone()),
        };
        self.thread.vmexecmask = prev_vmexecmask;
        if before.is_some() && self.thread.stacktaint.is_none() {
            self.thread.stacktaint = before;
        }
        result
    }

    fn run_lua(
        &mut self,
        closure: Gc<Closure>,
        proto: Gc<Proto>,
        upvalues: Vec<Gc<UpvalCell>>,
        mut args: Vec<TaggedValue>,
        savedtaint: Taint,
    ) -> Result<Vec<TaggedValue>, Thrown> {
        let (nparams, max_stack, is_vararg) = {
            let p = proto.borrow();
            (p.data.num_params as usize, p.data.max_stack as usize, p.data.is_vararg)
        };
        let base = self.thread.stack.len();
        let varargs = if is_vararg && args.len() > nparams {
            args.split_off(nparams)
        } else {
            Vec::new()
        };
        while args.len() < nparams {
            args.push(TaggedValue::nil());
        }
        args.truncate(nparams);
        for _ in 0..max_stack {
            self.thread.stack.push(TaggedValue::nil());
        }
        for (i, a) in args.into_iter().enumerate() {
            self.thread.stack[base + i] = a;
        }
        self.thread.frames.push(Frame {
            closure,
            pc: 0,
            base,
            top: base + nparams,
            varargs,
            savedtaint,
            pending_call: None,
            entry_instructions: self.instructions_executed,
            entry_bytes: self.thread.alloc_stats.bytes_allocated,
            subroutine_ticks: 0,
        });
        let result = self.exec_loop(&proto, &upvalues);
        // A yielding call leaves this frame (and everything beneath it)
        // on the thread exactly as it was, pc already past the CALL
        // instruction that invoked `coroutine.yield` -- `resume_coroutine`
        // re-enters `exec_loop` on it later. Any other outcome (normal
        // return or a real error) really does leave this activation.
        if !matches!(&result, Err(t) if t.status == crate::error::Status::Yield) {
            if result.is_ok() {
                self.finish_frame_profiling();
            }
            self.thread.frames.pop();
            self.thread.stack.truncate(base);
        }
        result
    }

    /// Records this completing frame's own-ticks and owned-bytes against
    /// its closure's object taint, per `profiling.rs`'s per-source
    /// statistics. A no-op while profiling is disabled.
    fn finish_frame_profiling(&mut self) {
        let frame = self.thread.frames.last().unwrap();
        let own_ticks = self
            .instructions_executed
            .saturating_sub(frame.entry_instructions)
            .saturating_sub(frame.subroutine_ticks);
        let owned_bytes = self.thread.alloc_stats.bytes_allocated.saturating_sub(frame.entry_bytes);
        let taint = frame.closure.borrow().header.taint.clone();
        self.profiler.record_frame(&taint, own_ticks, owned_bytes);
    }

    /// Writes `results` into registers starting at `a`, following the
    /// same to-top/fixed-count convention `CALL`'s `c` operand encodes
    /// (`c == 0` spreads every result to the frame's to-top marker;
    /// otherwise exactly `c - 1` results are written, nil-padded).
    fn deliver_results(&mut self, a: u8, c: u8, results: Vec<TaggedValue>) {
        if c == 0 {
            self.spread_to(a, &results);
        } else {
            let want = (c - 1) as usize;
            let mut padded = results;
            padded.resize_with(want, TaggedValue::nil);
            self.spread_to(a, &padded[..want]);
        }
    }

    fn frame_proto_upvalues(&self, idx: usize) -> (Gc<Proto>, Vec<Gc<UpvalCell>>) {
        let closure = self.thread.frames[idx].closure.clone();
        let b = closure.borrow();
        match &b.data.kind {
            ClosureKind::Lua { proto, upvalues } => (proto.clone(), upvalues.clone()),
            ClosureKind::Native(_) => unreachable!("only Lua frames are ever pushed onto thread.frames"),
        }
    }

    /// Continues a coroutine whose most recent `resume` ended in a
    /// `coroutine.yield` call, delivering `resume_args` as that call's
    /// return values and running until the coroutine's outermost frame
    /// returns or yields again.
    ///
    /// Every `CALL` instruction records its own `(a, c)` on its frame
    /// before invoking its callee (see the `Instr::Call` arm below), so
    /// this naturally generalizes across nested Lua-to-Lua calls: each
    /// frame on the chain already knows where to deliver the result that
    /// was in flight when the yield unwound past it. Yielding through a
    /// native wrapper that doesn't know about `Status::Yield` (`pcall`,
    /// `securecall`, a secure delegate, ...) is not supported, matching
    /// the base language's own restriction against yielding across a
    /// C-call boundary.
    pub fn resume_coroutine(&mut self, resume_args: Vec<TaggedValue>) -> Result<Vec<TaggedValue>, Thrown> {
        let mut delivered = resume_args;
        loop {
            let idx = match self.thread.frames.len() {
                0 => return Ok(delivered),
                n => n - 1,
            };
            if let Some((a, c)) = self.thread.frames[idx].pending_call.take() {
                self.deliver_results(a, c, delivered.clone());
            }
            let (proto, upvalues) = self.frame_proto_upvalues(idx);
            match self.exec_loop(&proto, &upvalues) {
                Ok(results) => {
                    self.finish_frame_profiling();
                    let base = self.thread.frames[idx].base;
                    self.thread.frames.truncate(idx);
                    self.thread.stack.truncate(base);
                    delivered = results;
                }
                Err(thrown) => return Err(thrown),
            }
        }
    }

    fn reg(&self, i: u8) -> TaggedValue {
        let base = self.thread.frames.last().unwrap().base;
        self.thread.stack[base + i as usize].clone()
    }

    fn set_reg(&mut self, i: u8, v: TaggedValue) {
        let base = self.thread.frames.last().unwrap().base;
        self.thread.stack[base + i as usize] = v;
    }

    fn top_of(&self) -> usize {
        self.thread.frames.last().unwrap().top
    }

    fn set_top(&mut self, abs: usize) {
        self.thread.frames.last_mut().unwrap().top = abs;
    }

    /// Copies `values` into consecutive registers starting at `a`, updating
    /// the frame's to-top marker -- the backing for `b=0`/`c=0` "to top"
    /// calls and `...` expansion.
    fn spread_to(&mut self, a: u8, values: &[TaggedValue]) {
        let base = self.thread.frames.last().unwrap().base;
        for (i, v) in values.iter().enumerate() {
            let idx = base + a as usize + i;
            if idx >= self.thread.stack.len() {
                self.thread.stack.resize_with(idx + 1, TaggedValue::nil);
            }
            self.thread.stack[idx] = v.clone();
        }
        self.set_top(base + a as usize + values.len());
    }

    fn take_range(&self, a: u8, n: usize) -> Vec<TaggedValue> {
        let base = self.thread.frames.last().unwrap().base;
        (0..n).map(|i| self.thread.stack[base + a as usize + i].clone()).collect()
    }

    fn take_to_top(&self, a: u8) -> Vec<TaggedValue> {
        let base = self.thread.frames.last().unwrap().base;
        let start = base + a as usize;
        let top = self.top_of();
        if top <= start {
            Vec::new()
        } else {
            self.thread.stack[start..top].to_vec()
        }
    }

    fn arith_binary(&mut self, a: u8, b: u8, c: u8, op: fn(f64, f64) -> Result<f64, VmError>) -> Result<(), Thrown> {
        let lv = self.reg(b);
        let rv = self.reg(c);
        self.thread.taint_stack_from(&lv.taint);
        self.thread.taint_stack_from(&rv.taint);
        let l = lv.value.as_number().ok_or_else(|| self.runtime_error(VmError::TypeMismatch(lv.value.type_name())))?;
        let r = rv.value.as_number().ok_or_else(|| self.runtime_error(VmError::TypeMismatch(rv.value.type_name())))?;
        let result = op(l, r).map_err(|e| self.runtime_error(e))?;
        let taint = self.thread.mask_write();
        self.set_reg(a, TaggedValue::new(Value::Number(result), taint));
        Ok(())
    }

    fn exec_loop(&mut self, proto: &Gc<Proto>, upvalues: &[Gc<UpvalCell>]) -> Result<Vec<TaggedValue>, Thrown> {
        loop {
            let frame = self.thread.frames.last().unwrap();
            let pc = frame.pc;
            let ticks_since_entry = self
                .instructions_executed
                .saturating_sub(frame.entry_instructions)
                .saturating_sub(frame.subroutine_ticks);
            if let Some(err) = self.timeout.check(ticks_since_entry, self.instructions_executed) {
                return Err(self.runtime_error(err));
            }
            self.instructions_executed += 1;
            let instr = {
                let p = proto.borrow();
                match p.data.code.get(pc) {
                    Some(i) => *i,
                    None => return Ok(Vec::new()),
                }
            };
            self.thread.frames.last_mut().unwrap().pc += 1;

            match instr {
                Instr::LoadK { a, bx } => {
                    let c = proto.borrow().data.constants[bx as usize].clone();
                    self.set_reg(a, c);
                }
                Instr::LoadBool { a, b, skip_next } => {
                    self.set_reg(a, TaggedValue::clean(Value::Boolean(b)));
                    if skip_next {
                        self.thread.frames.last_mut().unwrap().pc += 1;
                    }
                }
                Instr::LoadNil { a, b } => {
                    for i in 0..=b {
                        self.set_reg(a + i, TaggedValue::nil());
                    }
                }
                Instr::Move { a, b } => {
                    let v = self.reg(b);
                    let moved = crate::barriers::move_to_stack(&mut self.thread, &v);
                    self.set_reg(a, moved);
                }
                Instr::GetGlobal { a, name } => {
                    let key_const = proto.borrow().data.constants[name as usize].clone();
                    let field = self.globals.borrow().data.get(&key_const.value);
                    let v = crate::barriers::move_to_stack(&mut self.thread, &field);
                    self.set_reg(a, v);
                }
                Instr::SetGlobal { a, name } => {
                    let key_const = proto.borrow().data.constants[name as usize].clone();
                    let src = self.reg(a);
                    let stored = crate::barriers::settable_store(&src);
                    self.globals.borrow_mut().data.raw_set(key_const.value, stored);
                }
                Instr::GetUpval { a, b } => {
                    let v = upvalues[b as usize].borrow().value.clone();
                    let moved = crate::barriers::move_to_stack(&mut self.thread, &v);
                    self.set_reg(a, moved);
                }
                Instr::SetUpval { a, b } => {
                    let src = self.reg(a);
                    let stored = crate::barriers::setupval_store(&src);
                    upvalues[b as usize].borrow_mut().value = stored;
                }
                Instr::GetTable { a, b, c } => {
                    let table_v = self.reg(b);
                    let key_v = self.reg(c);
                    let field = match &table_v.value {
                        Value::Table(t) => t.borrow().data.get(&key_v.value),
                        other => return Err(self.runtime_error(VmError::TypeMismatch(other.type_name()))),
                    };
                    let v = crate::barriers::move_to_stack(&mut self.thread, &field);
                    self.set_reg(a, v);
                }
                Instr::SetTable { a, b, c } => {
                    let table_v = self.reg(a);
                    let key_v = self.reg(b);
                    let src = self.reg(c);
                    let stored = crate::barriers::settable_store(&src);
                    match &table_v.value {
                        Value::Table(t) => t.borrow_mut().data.raw_set(key_v.value, stored),
                        other => return Err(self.runtime_error(VmError::TypeMismatch(other.type_name()))),
                    }
                }
                Instr::SelfOp { a, b, c } => {
                    let obj = self.reg(b);
                    let copy = crate::barriers::move_to_stack(&mut self.thread, &obj);
                    self.set_reg(a, copy);
                    let key_v = self.reg(c);
                    let field = match &obj.value {
                        Value::Table(t) => t.borrow().data.get(&key_v.value),
                        other => return Err(self.runtime_error(VmError::TypeMismatch(other.type_name()))),
                    };
                    let v = crate::barriers::move_to_stack(&mut self.thread, &field);
                    self.set_reg(a + 1, v);
                }
                Instr::NewTable { a } => {
                    let t = gc::alloc(&mut self.thread, TableObj::new(), false, 32);
                    let v = crate::barriers::move_to_stack(&mut self.thread, &TaggedValue::clean(Value::Table(t)));
                    self.set_reg(a, v);
                }
                Instr::Add { a, b, c } => self.arith_binary(a, b, c, |l, r| Ok(l + r))?,
                Instr::Sub { a, b, c } => self.arith_binary(a, b, c, |l, r| Ok(l - r))?,
                Instr::Mul { a, b, c } => self.arith_binary(a, b, c, |l, r| Ok(l * r))?,
                Instr::Div { a, b, c } => self.arith_binary(a, b, c, |l, r| Ok(l / r))?,
                Instr::Mod { a, b, c } => self.arith_binary(a, b, c, |l, r| Ok(l - (l / r).floor() * r))?,
                Instr::Pow { a, b, c } => self.arith_binary(a, b, c, |l, r| Ok(l.powf(r)))?,
                Instr::Unm { a, b } => {
                    let v = self.reg(b);
                    self.thread.taint_stack_from(&v.taint);
                    let n = v.value.as_number().ok_or_else(|| self.runtime_error(VmError::TypeMismatch(v.value.type_name())))?;
                    let taint = self.thread.mask_write();
                    self.set_reg(a, TaggedValue::new(Value::Number(-n), taint));
                }
                Instr::Not { a, b } => {
                    let v = self.reg(b);
                    self.thread.taint_stack_from(&v.taint);
                    let taint = self.thread.mask_write();
                    self.set_reg(a, TaggedValue::new(Value::Boolean(!v.value.truthy()), taint));
                }
                Instr::Len { a, b } => {
                    let v = self.reg(b);
                    self.thread.taint_stack_from(&v.taint);
                    let len = match &v.value {
                        Value::Str(s) => s.borrow().data.as_str().len() as f64,
                        Value::Table(t) => t.borrow().data.array.len() as f64,
                        other => return Err(self.runtime_error(VmError::TypeMismatch(other.type_name()))),
                    };
                    let taint = self.thread.mask_write();
                    self.set_reg(a, TaggedValue::new(Value::Number(len), taint));
                }
                Instr::Concat { a, b, c } => {
                    let lv = self.reg(b);
                    let rv = self.reg(c);
                    self.thread.taint_stack_from(&lv.taint);
                    self.thread.taint_stack_from(&rv.taint);
                    let ls = lv.value.as_str().ok_or_else(|| self.runtime_error(VmError::TypeMismatch(lv.value.type_name())))?;
                    let rs = rv.value.as_str().ok_or_else(|| self.runtime_error(VmError::TypeMismatch(rv.value.type_name())))?;
                    let joined = format!("{}{}", ls, rs);
                    let taint = self.thread.mask_write();
                    let s = crate::interner::intern_adhoc(&mut self.thread, &joined);
                    self.set_reg(a, TaggedValue::new(Value::Str(s), taint));
                }
                Instr::Jmp { offset } => {
                    let cur = self.thread.frames.last().unwrap().pc as i64;
                    self.thread.frames.last_mut().unwrap().pc = (cur + offset as i64) as usize;
                }
                Instr::Eq { a, b, c } => {
                    let lv = self.reg(b);
                    let rv = self.reg(c);
                    self.thread.taint_stack_from(&lv.taint);
                    self.thread.taint_stack_from(&rv.taint);
                    if (lv.value == rv.value) != a {
                        self.thread.frames.last_mut().unwrap().pc += 1;
                    }
                }
                Instr::Lt { a, b, c } => {
                    let lv = self.reg(b);
                    let rv = self.reg(c);
                    self.thread.taint_stack_from(&lv.taint);
                    self.thread.taint_stack_from(&rv.taint);
                    let less = compare_less(&lv.value, &rv.value).map_err(|e| self.runtime_error(e))?;
                    if less != a {
                        self.thread.frames.last_mut().unwrap().pc += 1;
                    }
                }
                Instr::Le { a, b, c } => {
                    let lv = self.reg(b);
                    let rv = self.reg(c);
                    self.thread.taint_stack_from(&lv.taint);
                    self.thread.taint_stack_from(&rv.taint);
                    let le = lv.value == rv.value || compare_less(&lv.value, &rv.value).map_err(|e| self.runtime_error(e))?;
                    if le != a {
                        self.thread.frames.last_mut().unwrap().pc += 1;
                    }
                }
                Instr::Test { a, c } => {
                    let v = self.reg(a);
                    if v.value.truthy() != c {
                        self.thread.frames.last_mut().unwrap().pc += 1;
                    }
                }
                Instr::Call { a, b, c } => {
                    let args = if b == 0 { self.take_to_top(a + 1) } else { self.take_range(a + 1, (b - 1) as usize) };
                    let callee = self.reg(a);
                    let func = match callee.value {
                        Value::Function(f) => f,
                        other => return Err(self.runtime_error(VmError::TypeMismatch(other.type_name()))),
                    };
                    self.thread.frames.last_mut().unwrap().pending_call = Some((a, c));
                    let ticks_before = self.instructions_executed;
                    let results = self.call(func, args)?;
                    let elapsed = self.instructions_executed - ticks_before;
                    let frame = self.thread.frames.last_mut().unwrap();
                    frame.pending_call = None;
                    frame.subroutine_ticks += elapsed;
                    self.deliver_results(a, c, results);
                }
                Instr::TailCall { a, b } => {
                    let args = if b == 0 { self.take_to_top(a + 1) } else { self.take_range(a + 1, (b - 1) as usize) };
                    let callee = self.reg(a);
                    let func = match callee.value {
                        Value::Function(f) => f,
                        other => return Err(self.runtime_error(VmError::TypeMismatch(other.type_name()))),
                    };
                    return self.call(func, args);
                }
                Instr::Return { a, b } => {
                    return Ok(if b == 0 { self.take_to_top(a) } else { self.take_range(a, (b - 1) as usize) });
                }
                Instr::ForPrep { a, offset } => {
                    let start = self.reg(a).value.as_number().ok_or_else(|| self.runtime_error(VmError::TypeMismatch("non-number")))?;
                    let step = self.reg(a + 2).value.as_number().unwrap_or(1.0);
                    self.set_reg(a, TaggedValue::clean(Value::Number(start - step)));
                    let cur = self.thread.frames.last().unwrap().pc as i64;
                    self.thread.frames.last_mut().unwrap().pc = (cur + offset as i64) as usize;
                }
                Instr::ForLoop { a, offset } => {
                    let idx = self.reg(a).value.as_number().unwrap_or(0.0);
                    let limit = self.reg(a + 1).value.as_number().unwrap_or(0.0);
                    let step = self.reg(a + 2).value.as_number().unwrap_or(1.0);
                    let next = idx + step;
                    let continue_loop = if step >= 0.0 { next <= limit } else { next >= limit };
                    if continue_loop {
                        self.set_reg(a, TaggedValue::clean(Value::Number(next)));
                        self.set_reg(a + 3, TaggedValue::clean(Value::Number(next)));
                        let cur = self.thread.frames.last().unwrap().pc as i64;
                        self.thread.frames.last_mut().unwrap().pc = (cur + offset as i64) as usize;
                    }
                }
                Instr::Closure { a, bx } => {
                    let nested_proto = proto.borrow().data.nested[bx as usize].clone();
                    let descs = nested_proto.borrow().data.upvalues.clone();
                    let mut captured = Vec::with_capacity(descs.len());
                    for d in &descs {
                        if d.in_stack {
                            let v = self.reg(d.index);
                            captured.push(Rc::new(std::cell::RefCell::new(UpvalCell { value: v })));
                        } else {
                            captured.push(upvalues[d.index as usize].clone());
                        }
                    }
                    let closure_obj = Closure {
                        kind: ClosureKind::Lua { proto: nested_proto, upvalues: captured },
                        name: "<lua>".to_string(),
                    };
                    let c = gc::alloc(&mut self.thread, closure_obj, true, 48);
                    let v = crate::barriers::move_to_stack(&mut self.thread, &TaggedValue::clean(Value::Function(c)));
                    self.set_reg(a, v);
                }
                Instr::Vararg { a, b } => {
                    let varargs = self.thread.frames.last().unwrap().varargs.clone();
                    if b == 0 {
                        self.spread_to(a, &varargs);
                    } else {
                        let want = (b - 1) as usize;
                        let mut padded = varargs;
                        padded.resize_with(want, TaggedValue::nil);
                        self.spread_to(a, &padded[..want]);
                    }
                }
            }
        }
    }
}

fn compare_less(l: &Value, r: &Value) -> Result<bool, VmError> {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => Ok(a < b),
        (Value::Str(a), Value::Str(b)) => Ok(a.borrow().data.as_str() < b.borrow().data.as_str()),
        _ => Err(VmError::TypeMismatch(l.type_name())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::label::LabelTable;
    use crate::object::ClosureKind;
    use crate::parser::Parser;

    fn run(src: &str, vm: &mut Vm) -> Vec<TaggedValue> {
        let ast = Parser::parse(src).unwrap();
        let proto = compile(&ast, "test").unwrap();
        let proto = Rc::new(std::cell::RefCell::new(gc::GcBox {
            header: crate::object::GcHeader::default(),
            data: proto,
        }));
        let closure = gc::alloc(
            &mut vm.thread,
            Closure { kind: ClosureKind::Lua { proto, upvalues: Vec::new() }, name: "chunk".to_string() },
            true,
            0,
        );
        vm.call(closure, Vec::new()).unwrap()
    }

    #[test]
    fn runs_basic_arithmetic() {
        let mut vm = Vm::new(Rc::new(LabelTable::new()));
        run("x = 1 + 2 * 3", &mut vm);
        let v = vm.globals.borrow().data.get(&Value::Str(Rc::new(std::cell::RefCell::new(gc::GcBox {
            header: Default::default(),
            data: crate::object::LStr("x".to_string()),
        }))));
        assert_eq!(v.value.as_number(), Some(7.0));
    }

    #[test]
    fn forceinsecure_taints_subsequent_concat() {
        let mut vm = Vm::new(Rc::new(LabelTable::new()));
        vm.thread.stacktaint = Some(vm.thread.labels.clone().force_insecure());
        run("y = \"a\" .. \"b\"", &mut vm);
        assert!(vm.thread.stacktaint.is_some());
    }

    #[test]
    fn numeric_for_accumulates() {
        let mut vm = Vm::new(Rc::new(LabelTable::new()));
        run("total = 0 for i = 1, 5 do total = total + i end", &mut vm);
        let key = Value::Str(Rc::new(std::cell::RefCell::new(gc::GcBox {
            header: Default::default(),
            data: crate::object::LStr("total".to_string()),
        })));
        let v = vm.globals.borrow().data.get(&key);
        assert_eq!(v.value.as_number(), Some(15.0));
    }

    #[test]
    fn max_ticks_since_entry_actually_aborts_a_long_running_frame() {
        let mut vm = Vm::new(Rc::new(LabelTable::new()));
        vm.timeout = TimeoutPolicy { max_ticks_since_entry: Some(5), max_instructions: None };
        let ast = Parser::parse("total = 0 for i = 1, 1000000 do total = total + i end").unwrap();
        let proto = compile(&ast, "test").unwrap();
        let proto = Rc::new(std::cell::RefCell::new(gc::GcBox { header: crate::object::GcHeader::default(), data: proto }));
        let closure = gc::alloc(
            &mut vm.thread,
            Closure { kind: ClosureKind::Lua { proto, upvalues: Vec::new() }, name: "chunk".to_string() },
            true,
            0,
        );
        let result = vm.call(closure, Vec::new());
        match result {
            Err(thrown) => assert_eq!(thrown.status, Status::RuntimeError),
            Ok(_) => panic!("expected the tick budget to abort execution"),
        }
    }
}
