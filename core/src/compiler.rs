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

//! Lowers `ast::Block` into `proto::Proto` bytecode (the compiler
//! front end). Register allocation is deliberately simple -- registers are
//! never reused within an expression once reserved, only reclaimed at
//! block and function boundaries -- trading a larger `max_stack` for a
//! compiler an order of magnitude smaller than a liveness-tracking one.
//! Multi-value expansion is likewise simplified: only a trailing `...` in
//! an argument or return list expands to "all remaining values"; a
//! trailing call does not implicitly expand its own multiple results.
//!
//! Constants are emitted with an absent taint slot -- see `proto.rs`'s doc
//! comment on `constants` for why that slot gets filled in at load time
//! rather than here.

use crate::ast::*;
use crate::error::VmError;
use crate::gc::Gc;
use crate::object::{GcHeader, LStr};
use crate::opcode::Instr;
use crate::proto::{Proto, UpvalDesc};
use crate::value::{TaggedValue, Value};
use std::cell::RefCell;
use std::rc::Rc;

enum NameRef {
    Local(u8),
    Upval(u8),
    Global(String),
}

struct FuncState {
    proto: Proto,
    locals: Vec<(String, u8)>,
    block_starts: Vec<(usize, u8)>,
    free_reg: u8,
    loop_breaks: Vec<Vec<usize>>,
}

pub struct Compiler {
    fs_stack: Vec<FuncState>,
}

/// Compiles a parsed chunk into a top-level prototype. Top-level chunks are
/// always vararg, matching the base language's `main` chunk convention.
pub fn compile(block: &Block, source_name: &str) -> Result<Proto, VmError> {
    let mut c = Compiler { fs_stack: Vec::new() };
    c.enter_function(true, 0, source_name);
    c.compile_block(block)?;
    c.emit(Instr::Return { a: 0, b: 1 }, 0);
    Ok(c.leave_function())
}

fn wrap_proto(proto: Proto) -> Gc<Proto> {
    Rc::new(RefCell::new(crate::gc::GcBox {
        header: GcHeader::default(),
        data: proto,
    }))
}

impl Compiler {
    fn cur(&mut self) -> &mut FuncState {
        self.fs_stack.last_mut().unwrap()
    }

    fn cur_ref(&self) -> &FuncState {
        self.fs_stack.last().unwrap()
    }

    fn enter_function(&mut self, is_vararg: bool, line: u32, source_name: &str) {
        let mut proto = Proto::empty(source_name.to_string());
        proto.is_vararg = is_vararg;
        proto.line_defined = line;
        proto.max_stack = 0;
        self.fs_stack.push(FuncState {
            proto,
            locals: Vec::new(),
            block_starts: Vec::new(),
            free_reg: 0,
            loop_breaks: Vec::new(),
        });
    }

    fn leave_function(&mut self) -> Proto {
        self.fs_stack.pop().unwrap().proto
    }

    fn emit(&mut self, instr: Instr, line: u32) -> usize {
        let fs = self.cur();
        fs.proto.code.push(instr);
        fs.proto.lines.push(line);
        fs.proto.code.len() - 1
    }

    fn reserve_reg(&mut self) -> u8 {
        let fs = self.cur();
        let r = fs.free_reg;
        fs.free_reg = fs.free_reg.saturating_add(1);
        if fs.free_reg > fs.proto.max_stack {
            fs.proto.max_stack = fs.free_reg;
        }
        r
    }

    fn free_to(&mut self, r: u8) {
        self.cur().free_reg = r;
    }

    fn new_local(&mut self, name: &str) -> u8 {
        let r = self.reserve_reg();
        self.cur().locals.push((name.to_string(), r));
        r
    }

    fn enter_block(&mut self) {
        let fs = self.cur();
        let mark = (fs.locals.len(), fs.free_reg);
        fs.block_starts.push(mark);
    }

    fn leave_block(&mut self) {
        let fs = self.cur();
        let (locals_len, free_reg) = fs.block_starts.pop().unwrap();
        fs.locals.truncate(locals_len);
        fs.free_reg = free_reg;
    }

    fn enter_loop(&mut self) {
        self.cur().loop_breaks.push(Vec::new());
    }

    fn leave_loop(&mut self) -> Vec<usize> {
        self.cur().loop_breaks.pop().unwrap()
    }

    fn add_const(&mut self, value: Value) -> u16 {
        let fs = self.cur();
        let idx = fs.proto.constants.len() as u16;
        fs.proto.constants.push(TaggedValue::clean(value));
        idx
    }

    fn const_string(&mut self, s: &str) -> u16 {
        let lstr: Gc<LStr> = Rc::new(RefCell::new(crate::gc::GcBox {
            header: GcHeader::default(),
            data: LStr(s.to_string()),
        }));
        self.add_const(Value::Str(lstr))
    }

    fn patch_offset(&mut self, idx: usize, target_pc: usize) {
        let fs = self.cur();
        let offset = target_pc as i32 - (idx as i32 + 1);
        match &mut fs.proto.code[idx] {
            Instr::Jmp { offset: o } => *o = offset,
            Instr::ForPrep { offset: o, .. } => *o = offset,
            Instr::ForLoop { offset: o, .. } => *o = offset,
            _ => unreachable!("patch_offset on a non-jump instruction"),
        }
    }

    fn patch_here(&mut self, idx: usize) {
        let here = self.cur_ref().proto.code.len();
        self.patch_offset(idx, here);
    }

    fn resolve_local_at(&self, level: usize, name: &str) -> Option<u8> {
        self.fs_stack[level]
            .locals
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, r)| *r)
    }

    fn resolve_upval(&mut self, level: usize, name: &str) -> Option<u8> {
        if level == 0 {
            return None;
        }
        if let Some(idx) = self.fs_stack[level]
            .proto
            .upvalues
            .iter()
            .position(|u| u.name == name)
        {
            return Some(idx as u8);
        }
        if let Some(r) = self.resolve_local_at(level - 1, name) {
            let idx = self.fs_stack[level].proto.upvalues.len() as u8;
            self.fs_stack[level].proto.upvalues.push(UpvalDesc {
                name: name.to_string(),
                in_stack: true,
                index: r,
            });
            return Some(idx);
        }
        if let Some(pu) = self.resolve_upval(level - 1, name) {
            let idx = self.fs_stack[level].proto.upvalues.len() as u8;
            self.fs_stack[level].proto.upvalues.push(UpvalDesc {
                name: name.to_string(),
                in_stack: false,
                index: pu,
            });
            return Some(idx);
        }
        None
    }

    fn resolve_name(&mut self, name: &str) -> NameRef {
        let level = self.fs_stack.len() - 1;
        if let Some(r) = self.resolve_local_at(level, name) {
            return NameRef::Local(r);
        }
        if let Some(u) = self.resolve_upval(level, name) {
            return NameRef::Upval(u);
        }
        NameRef::Global(name.to_string())
    }

    fn compile_block(&mut self, block: &Block) -> Result<(), VmError> {
        for stmt in block {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<(), VmError> {
        let line = 0;
        match stmt {
            Stmt::Local(names, exprs) => {
                let regs = self.compile_exprlist_to_n(exprs, names.len(), line)?;
                for (name, r) in names.iter().zip(regs) {
                    self.cur().locals.push((name.clone(), r));
                }
            }
            Stmt::Assign(targets, exprs) => {
                let regs = self.compile_exprlist_to_n(exprs, targets.len(), line)?;
                for (target, r) in targets.iter().zip(regs) {
                    self.compile_store(target, r, line)?;
                }
            }
            Stmt::ExprStmt(e) => match e {
                Expr::Call(f, args) => {
                    let base = self.reserve_reg();
                    self.compile_call_into(f, args, base, 1, line)?;
                    self.free_to(base);
                }
                Expr::MethodCall(obj, method, args) => {
                    let base = self.reserve_reg();
                    self.compile_methodcall_into(obj, method, args, base, 1, line)?;
                    self.free_to(base);
                }
                other => {
                    let _ = self.compile_expr_any(other, line)?;
                }
            },
            Stmt::If(branches, else_block) => {
                let mut end_jmps = Vec::new();
                for (i, (cond, body)) in branches.iter().enumerate() {
                    let false_jmp = self.jump_if_false(cond, line)?;
                    self.enter_block();
                    self.compile_block(body)?;
                    self.leave_block();
                    if i + 1 < branches.len() || else_block.is_some() {
                        end_jmps.push(self.emit(Instr::Jmp { offset: 0 }, line));
                    }
                    self.patch_here(false_jmp);
                }
                if let Some(eb) = else_block {
                    self.enter_block();
                    self.compile_block(eb)?;
                    self.leave_block();
                }
                for j in end_jmps {
                    self.patch_here(j);
                }
            }
            Stmt::While(cond, body) => {
                let loop_start = self.cur_ref().proto.code.len();
                self.enter_loop();
                let false_jmp = self.jump_if_false(cond, line)?;
                self.enter_block();
                self.compile_block(body)?;
                self.leave_block();
                let back = self.emit(Instr::Jmp { offset: 0 }, line);
                self.patch_offset(back, loop_start);
                self.patch_here(false_jmp);
                let end_pc = self.cur_ref().proto.code.len();
                for j in self.leave_loop() {
                    self.patch_offset(j, end_pc);
                }
            }
            Stmt::Repeat(body, cond) => {
                let loop_start = self.cur_ref().proto.code.len();
                self.enter_loop();
                // `repeat ... until cond` lets the body's locals stay in
                // scope for `cond`, so the block isn't popped until after
                // the condition is compiled.
                self.enter_block();
                self.compile_block(body)?;
                let r = self.compile_expr_any(cond, line)?;
                self.emit(Instr::Test { a: r, c: false }, line);
                let back = self.emit(Instr::Jmp { offset: 0 }, line);
                self.patch_offset(back, loop_start);
                self.leave_block();
                let end_pc = self.cur_ref().proto.code.len();
                for j in self.leave_loop() {
                    self.patch_offset(j, end_pc);
                }
            }
            Stmt::NumericFor { var, start, stop, step, body } => {
                self.enter_block();
                let base = self.reserve_reg();
                self.compile_expr_to(start, base, line)?;
                let limit = self.reserve_reg();
                self.compile_expr_to(stop, limit, line)?;
                let stepreg = self.reserve_reg();
                match step {
                    Some(e) => self.compile_expr_to(e, stepreg, line)?,
                    None => {
                        let k = self.add_const(Value::Number(1.0));
                        self.emit(Instr::LoadK { a: stepreg, bx: k }, line);
                    }
                }
                self.reserve_reg(); // base+3: the user-visible loop variable
                self.enter_loop();
                let forprep = self.emit(Instr::ForPrep { a: base, offset: 0 }, line);
                let body_start = self.cur_ref().proto.code.len();
                self.enter_block();
                self.cur().locals.push((var.clone(), base + 3));
                self.compile_block(body)?;
                self.leave_block();
                let forloop = self.emit(Instr::ForLoop { a: base, offset: 0 }, line);
                self.patch_offset(forloop, body_start);
                self.patch_offset(forprep, forloop);
                let end_pc = self.cur_ref().proto.code.len();
                for j in self.leave_loop() {
                    self.patch_offset(j, end_pc);
                }
                self.leave_block();
            }
            Stmt::GenericFor { vars, exprs, body } => {
                self.enter_block();
                let regs = self.compile_exprlist_to_n(exprs, 3, line)?;
                let (f_reg, s_reg, ctrl_reg) = (regs[0], regs[1], regs[2]);
                self.enter_loop();
                let loop_start = self.cur_ref().proto.code.len();
                let call_base = self.reserve_reg();
                self.emit(Instr::Move { a: call_base, b: f_reg }, line);
                let s_copy = self.reserve_reg();
                self.emit(Instr::Move { a: s_copy, b: s_reg }, line);
                let ctrl_copy = self.reserve_reg();
                self.emit(Instr::Move { a: ctrl_copy, b: ctrl_reg }, line);
                let nvars = vars.len() as u8;
                self.emit(
                    Instr::Call { a: call_base, b: 3, c: nvars + 1 },
                    line,
                );
                self.free_to(call_base);
                for _ in 0..nvars {
                    self.reserve_reg();
                }
                self.emit(Instr::Move { a: ctrl_reg, b: call_base }, line);
                self.emit(Instr::Test { a: ctrl_reg, c: true }, line);
                let break_jmp = self.emit(Instr::Jmp { offset: 0 }, line);
                self.enter_block();
                for (i, name) in vars.iter().enumerate() {
                    self.cur().locals.push((name.clone(), call_base + i as u8));
                }
                self.compile_block(body)?;
                self.leave_block();
                let back = self.emit(Instr::Jmp { offset: 0 }, line);
                self.patch_offset(back, loop_start);
                self.patch_here(break_jmp);
                let end_pc = self.cur_ref().proto.code.len();
                for j in self.leave_loop() {
                    self.patch_offset(j, end_pc);
                }
                self.leave_block();
            }
            Stmt::FunctionDecl(path, _is_method, body) => {
                let mut target = Expr::Name(path[0].clone());
                for seg in &path[1..] {
                    target = Expr::Index(Box::new(target), Box::new(Expr::Str(seg.clone())));
                }
                let reg = self.compile_expr_any(&Expr::Function(body.clone()), line)?;
                self.compile_store(&target, reg, line)?;
            }
            Stmt::LocalFunction(name, body) => {
                let reg = self.new_local(name);
                self.compile_function_literal(body, reg, line)?;
            }
            Stmt::Return(exprs) => {
                let base = self.cur_ref().free_reg;
                let (n, is_multi) = self.push_args(exprs, base, line)?;
                let b = if is_multi { 0 } else { n + 1 };
                self.emit(Instr::Return { a: base, b }, line);
            }
            Stmt::Break => {
                let j = self.emit(Instr::Jmp { offset: 0 }, line);
                match self.cur().loop_breaks.last_mut() {
                    Some(v) => v.push(j),
                    None => return Err(VmError::Compile("break outside a loop".to_string())),
                }
            }
            Stmt::Do(body) => {
                self.enter_block();
                self.compile_block(body)?;
                self.leave_block();
            }
        }
        Ok(())
    }

    fn compile_store(&mut self, target: &Expr, src_reg: u8, line: u32) -> Result<(), VmError> {
        match target {
            Expr::Name(n) => match self.resolve_name(n) {
                NameRef::Local(r) => {
                    if r != src_reg {
                        self.emit(Instr::Move { a: r, b: src_reg }, line);
                    }
                }
                NameRef::Upval(u) => {
                    self.emit(Instr::SetUpval { a: u, b: src_reg }, line);
                }
                NameRef::Global(name) => {
                    let k = self.const_string(&name);
                    self.emit(Instr::SetGlobal { a: src_reg, name: k }, line);
                }
            },
            Expr::Index(obj, key) => {
                let obj_reg = self.compile_expr_any(obj, line)?;
                let key_reg = self.compile_expr_any(key, line)?;
                self.emit(Instr::SetTable { a: obj_reg, b: key_reg, c: src_reg }, line);
            }
            _ => return Err(VmError::Compile("invalid assignment target".to_string())),
        }
        Ok(())
    }

    fn compile_exprlist_to_n(&mut self, exprs: &[Expr], n: usize, line: u32) -> Result<Vec<u8>, VmError> {
        let mut regs = Vec::with_capacity(n);
        for (i, e) in exprs.iter().enumerate() {
            let r = self.reserve_reg();
            self.compile_expr_to(e, r, line)?;
            if i < n {
                regs.push(r);
            }
        }
        while regs.len() < n {
            let r = self.reserve_reg();
            self.emit(Instr::LoadNil { a: r, b: 0 }, line);
            regs.push(r);
        }
        Ok(regs)
    }

    /// Pushes argument/return values starting at `start`, expanding a
    /// trailing `...` to "all remaining values" (to-top semantics, `b=0`).
    fn push_args(&mut self, exprs: &[Expr], start: u8, line: u32) -> Result<(u8, bool), VmError> {
        self.free_to(start);
        for (i, e) in exprs.iter().enumerate() {
            let is_last = i + 1 == exprs.len();
            if is_last && matches!(e, Expr::Vararg) {
                let r = self.reserve_reg();
                self.emit(Instr::Vararg { a: r, b: 0 }, line);
                return Ok((i as u8, true));
            }
            let r = self.reserve_reg();
            self.compile_expr_to(e, r, line)?;
        }
        Ok((exprs.len() as u8, false))
    }

    fn compile_expr_any(&mut self, e: &Expr, line: u32) -> Result<u8, VmError> {
        let r = self.reserve_reg();
        self.compile_expr_to(e, r, line)?;
        Ok(r)
    }

    fn jump_if_false(&mut self, cond: &Expr, line: u32) -> Result<usize, VmError> {
        let r = self.compile_expr_any(cond, line)?;
        self.emit(Instr::Test { a: r, c: false }, line);
        Ok(self.emit(Instr::Jmp { offset: 0 }, line))
    }

    fn compile_and(&mut self, l: &Expr, r: &Expr, target: u8, line: u32) -> Result<(), VmError> {
        self.compile_expr_to(l, target, line)?;
        self.emit(Instr::Test { a: target, c: false }, line);
        let jmp = self.emit(Instr::Jmp { offset: 0 }, line);
        self.compile_expr_to(r, target, line)?;
        self.patch_here(jmp);
        Ok(())
    }

    fn compile_or(&mut self, l: &Expr, r: &Expr, target: u8, line: u32) -> Result<(), VmError> {
        self.compile_expr_to(l, target, line)?;
        self.emit(Instr::Test { a: target, c: true }, line);
        let jmp = self.emit(Instr::Jmp { offset: 0 }, line);
        self.compile_expr_to(r, target, line)?;
        self.patch_here(jmp);
        Ok(())
    }

    fn compile_compare(&mut self, op: BinOp, l: &Expr, r: &Expr, target: u8, line: u32) -> Result<(), VmError> {
        let l_reg = self.compile_expr_any(l, line)?;
        let r_reg = self.compile_expr_any(r, line)?;
        let test = match op {
            BinOp::Eq => Instr::Eq { a: true, b: l_reg, c: r_reg },
            BinOp::NotEq => Instr::Eq { a: false, b: l_reg, c: r_reg },
            BinOp::Less => Instr::Lt { a: true, b: l_reg, c: r_reg },
            BinOp::LessEq => Instr::Le { a: true, b: l_reg, c: r_reg },
            BinOp::Greater => Instr::Lt { a: true, b: r_reg, c: l_reg },
            BinOp::GreaterEq => Instr::Le { a: true, b: r_reg, c: l_reg },
            _ => unreachable!(),
        };
        self.emit(test, line);
        self.emit(Instr::LoadBool { a: target, b: true, skip_next: true }, line);
        self.emit(Instr::LoadBool { a: target, b: false, skip_next: false }, line);
        Ok(())
    }

    fn compile_call_into(
        &mut self,
        f: &Expr,
        args: &[Expr],
        target: u8,
        want_results: u8,
        line: u32,
    ) -> Result<(), VmError> {
        self.free_to(target);
        self.compile_expr_to(f, target, line)?;
        self.free_to(target + 1);
        let (nargs, is_multi) = self.push_args(args, target + 1, line)?;
        let b = if is_multi { 0 } else { nargs + 1 };
        self.emit(Instr::Call { a: target, b, c: want_results }, line);
        self.free_to(target + 1);
        Ok(())
    }

    fn compile_methodcall_into(
        &mut self,
        obj: &Expr,
        method: &str,
        args: &[Expr],
        target: u8,
        want_results: u8,
        line: u32,
    ) -> Result<(), VmError> {
        self.free_to(target);
        let base = self.reserve_reg();
        self.reserve_reg(); // base+1: the implicit `self` slot, filled by SelfOp
        let obj_reg = self.compile_expr_any(obj, line)?;
        let key_reg = self.reserve_reg();
        let key = self.const_string(method);
        self.emit(Instr::LoadK { a: key_reg, bx: key }, line);
        self.emit(Instr::SelfOp { a: base, b: obj_reg, c: key_reg }, line);
        self.free_to(base + 2);
        let (nargs, is_multi) = self.push_args(args, base + 2, line)?;
        let b = if is_multi { 0 } else { nargs + 2 };
        self.emit(Instr::Call { a: base, b, c: want_results }, line);
        self.free_to(base + 1);
        Ok(())
    }

    fn compile_function_literal(&mut self, body: &FuncBody, target: u8, line: u32) -> Result<(), VmError> {
        let source_name = self.cur_ref().proto.source_name.clone();
        self.enter_function(body.is_vararg, body.line, &source_name);
        for p in &body.params {
            self.new_local(p);
        }
        self.compile_block(&body.body)?;
        self.emit(Instr::Return { a: 0, b: 1 }, body.line);
        let proto = self.leave_function();
        let nested = wrap_proto(proto);
        let fs = self.cur();
        let idx = fs.proto.nested.len() as u16;
        fs.proto.nested.push(nested);
        self.emit(Instr::Closure { a: target, bx: idx }, line);
        Ok(())
    }

    fn compile_table(&mut self, fields: &[TableField], target: u8, line: u32) -> Result<(), VmError> {
        self.emit(Instr::NewTable { a: target }, line);
        let mut array_index: i64 = 1;
        for field in fields {
            match field {
                TableField::Positional(e) => {
                    let vreg = self.compile_expr_any(e, line)?;
                    let kreg = self.reserve_reg();
                    let k = self.add_const(Value::Number(array_index as f64));
                    self.emit(Instr::LoadK { a: kreg, bx: k }, line);
                    self.emit(Instr::SetTable { a: target, b: kreg, c: vreg }, line);
                    array_index += 1;
                }
                TableField::Named(name, e) => {
                    let vreg = self.compile_expr_any(e, line)?;
                    let kreg = self.reserve_reg();
                    let k = self.const_string(name);
                    self.emit(Instr::LoadK { a: kreg, bx: k }, line);
                    self.emit(Instr::SetTable { a: target, b: kreg, c: vreg }, line);
                }
            }
        }
        Ok(())
    }

    fn compile_expr_to(&mut self, e: &Expr, target: u8, line: u32) -> Result<(), VmError> {
        match e {
            Expr::Nil => {
                self.emit(Instr::LoadNil { a: target, b: 0 }, line);
            }
            Expr::True => {
                self.emit(Instr::LoadBool { a: target, b: true, skip_next: false }, line);
            }
            Expr::False => {
                self.emit(Instr::LoadBool { a: target, b: false, skip_next: false }, line);
            }
            Expr::Vararg => {
                self.emit(Instr::Vararg { a: target, b: 2 }, line);
            }
            Expr::Number(n) => {
                let k = self.add_const(Value::Number(*n));
                self.emit(Instr::LoadK { a: target, bx: k }, line);
            }
            Expr::Str(s) => {
                let k = self.const_string(s);
                self.emit(Instr::LoadK { a: target, bx: k }, line);
            }
            Expr::Name(n) => match self.resolve_name(n) {
                NameRef::Local(r) => {
                    if r != target {
                        self.emit(Instr::Move { a: target, b: r }, line);
                    }
                }
                NameRef::Upval(u) => {
                    self.emit(Instr::GetUpval { a: target, b: u }, line);
                }
                NameRef::Global(name) => {
                    let k = self.const_string(&name);
                    self.emit(Instr::GetGlobal { a: target, name: k }, line);
                }
            },
            Expr::Index(obj, key) => {
                let obj_reg = self.compile_expr_any(obj, line)?;
                let key_reg = self.compile_expr_any(key, line)?;
                self.emit(Instr::GetTable { a: target, b: obj_reg, c: key_reg }, line);
            }
            Expr::Call(f, args) => {
                self.compile_call_into(f, args, target, 2, line)?;
            }
            Expr::MethodCall(obj, method, args) => {
                self.compile_methodcall_into(obj, method, args, target, 2, line)?;
            }
            Expr::Bin(op, l, r) => match op {
                BinOp::And => self.compile_and(l, r, target, line)?,
                BinOp::Or => self.compile_or(l, r, target, line)?,
                BinOp::Eq | BinOp::NotEq | BinOp::Less | BinOp::LessEq | BinOp::Greater | BinOp::GreaterEq => {
                    self.compile_compare(*op, l, r, target, line)?
                }
                _ => {
                    let l_reg = self.compile_expr_any(l, line)?;
                    let r_reg = self.compile_expr_any(r, line)?;
                    let instr = match op {
                        BinOp::Add => Instr::Add { a: target, b: l_reg, c: r_reg },
                        BinOp::Sub => Instr::Sub { a: target, b: l_reg, c: r_reg },
                        BinOp::Mul => Instr::Mul { a: target, b: l_reg, c: r_reg },
                        BinOp::Div => Instr::Div { a: target, b: l_reg, c: r_reg },
                        BinOp::Mod => Instr::Mod { a: target, b: l_reg, c: r_reg },
                        BinOp::Pow => Instr::Pow { a: target, b: l_reg, c: r_reg },
                        BinOp::Concat => Instr::Concat { a: target, b: l_reg, c: r_reg },
                        _ => unreachable!(),
                    };
                    self.emit(instr, line);
                }
            },
            Expr::Un(op, e) => {
                let src = self.compile_expr_any(e, line)?;
                let instr = match op {
                    UnOp::Neg => Instr::Unm { a: target, b: src },
                    UnOp::Not => Instr::Not { a: target, b: src },
                    UnOp::Len => Instr::Len { a: target, b: src },
                };
                self.emit(instr, line);
            }
            Expr::Function(body) => {
                self.compile_function_literal(body, target, line)?;
            }
            Expr::Table(fields) => {
                self.compile_table(fields, target, line)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn compile_src(src: &str) -> Proto {
        let ast = Parser::parse(src).unwrap();
        compile(&ast, "test").unwrap()
    }

    #[test]
    fn compiles_local_arithmetic() {
        let proto = compile_src("local a = 1 + 2");
        assert!(proto.code.iter().any(|i| matches!(i, Instr::Add { .. })));
        assert_eq!(proto.constants.len(), 2);
    }

    #[test]
    fn compiles_global_assignment() {
        let proto = compile_src("x = 5");
        assert!(proto.code.iter().any(|i| matches!(i, Instr::SetGlobal { .. })));
    }

    #[test]
    fn compiles_if_with_jumps() {
        let proto = compile_src("if a then b = 1 else b = 2 end");
        let jmp_count = proto.code.iter().filter(|i| matches!(i, Instr::Jmp { .. })).count();
        assert_eq!(jmp_count, 2);
    }

    #[test]
    fn compiles_numeric_for_with_forprep_forloop() {
        let proto = compile_src("for i = 1, 10 do x = i end");
        assert!(proto.code.iter().any(|i| matches!(i, Instr::ForPrep { .. })));
        assert!(proto.code.iter().any(|i| matches!(i, Instr::ForLoop { .. })));
    }

    #[test]
    fn compiles_nested_function_closure() {
        let proto = compile_src("local f = function(x) return x end");
        assert_eq!(proto.nested.len(), 1);
        assert!(proto.code.iter().any(|i| matches!(i, Instr::Closure { .. })));
    }

    #[test]
    fn compiles_comparison_to_boolean_value() {
        let proto = compile_src("local ok = a < b");
        assert!(proto.code.iter().any(|i| matches!(i, Instr::Lt { .. })));
        let bool_loads = proto
            .code
            .iter()
            .filter(|i| matches!(i, Instr::LoadBool { .. }))
            .count();
        assert_eq!(bool_loads, 2);
    }

    #[test]
    fn break_outside_loop_is_a_compile_error() {
        let ast = Parser::parse("break").unwrap();
        assert!(compile(&ast, "test").is_err());
    }
}
