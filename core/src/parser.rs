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

//! Recursive-descent parser producing the `ast` module's tree. Another
//! external-contract module; kept small and direct rather than
//! table-driven since the grammar is fixed and small.

use crate::ast::*;
use crate::error::VmError;
use crate::lexer::{Lexer, Tok, Token};

pub struct Parser {
    toks: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn parse(src: &str) -> Result<Block, VmError> {
        let toks = Lexer::new(src).tokenize()?;
        let mut p = Parser { toks, pos: 0 };
        let block = p.block()?;
        p.expect(Tok::Eof)?;
        Ok(block)
    }

    fn peek(&self) -> &Tok {
        &self.toks[self.pos].tok
    }

    fn line(&self) -> u32 {
        self.toks[self.pos].line
    }

    fn advance(&mut self) -> Tok {
        let t = self.toks[self.pos].tok.clone();
        if self.pos + 1 < self.toks.len() {
            self.pos += 1;
        }
        t
    }

    fn check(&self, t: &Tok) -> bool {
        self.peek() == t
    }

    fn accept(&mut self, t: &Tok) -> bool {
        if self.check(t) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, t: Tok) -> Result<(), VmError> {
        if self.check(&t) {
            self.advance();
            Ok(())
        } else {
            Err(VmError::Parse(format!(
                "expected {:?}, found {:?} at line {}",
                t,
                self.peek(),
                self.line()
            )))
        }
    }

    fn expect_name(&mut self) -> Result<String, VmError> {
        match self.peek().clone() {
            Tok::Name(n) => {
                self.advance();
                Ok(n)
            }
            other => Err(VmError::Parse(format!(
                "expected name, found {:?} at line {}",
                other,
                self.line()
            ))),
        }
    }

    fn block_end(&self) -> bool {
        matches!(
            self.peek(),
            Tok::Eof | Tok::End | Tok::Else | Tok::Elseif | Tok::Until
        )
    }

    fn block(&mut self) -> Result<Block, VmError> {
        let mut stmts = Vec::new();
        while !self.block_end() {
            if self.accept(&Tok::Semi) {
                continue;
            }
            if self.check(&Tok::Return) {
                self.advance();
                let mut exprs = Vec::new();
                if !self.block_end() && !self.check(&Tok::Semi) {
                    exprs.push(self.expr()?);
                    while self.accept(&Tok::Comma) {
                        exprs.push(self.expr()?);
                    }
                }
                self.accept(&Tok::Semi);
                stmts.push(Stmt::Return(exprs));
                break;
            }
            stmts.push(self.statement()?);
        }
        Ok(stmts)
    }

    fn statement(&mut self) -> Result<Stmt, VmError> {
        match self.peek().clone() {
            Tok::Local => {
                self.advance();
                if self.accept(&Tok::Function) {
                    let name = self.expect_name()?;
                    let body = self.func_body()?;
                    return Ok(Stmt::LocalFunction(name, body));
                }
                let mut names = vec![self.expect_name()?];
                while self.accept(&Tok::Comma) {
                    names.push(self.expect_name()?);
                }
                let mut exprs = Vec::new();
                if self.accept(&Tok::Assign) {
                    exprs.push(self.expr()?);
                    while self.accept(&Tok::Comma) {
                        exprs.push(self.expr()?);
                    }
                }
                Ok(Stmt::Local(names, exprs))
            }
            Tok::If => {
                self.advance();
                let mut branches = Vec::new();
                let cond = self.expr()?;
                self.expect(Tok::Then)?;
                let body = self.block()?;
                branches.push((cond, body));
                let mut else_block = None;
                loop {
                    if self.accept(&Tok::Elseif) {
                        let cond = self.expr()?;
                        self.expect(Tok::Then)?;
                        let body = self.block()?;
                        branches.push((cond, body));
                    } else if self.accept(&Tok::Else) {
                        else_block = Some(self.block()?);
                        break;
                    } else {
                        break;
                    }
                }
                self.expect(Tok::End)?;
                Ok(Stmt::If(branches, else_block))
            }
            Tok::While => {
                self.advance();
                let cond = self.expr()?;
                self.expect(Tok::Do)?;
                let body = self.block()?;
                self.expect(Tok::End)?;
                Ok(Stmt::While(cond, body))
            }
            Tok::Repeat => {
                self.advance();
                let body = self.block()?;
                self.expect(Tok::Until)?;
                let cond = self.expr()?;
                Ok(Stmt::Repeat(body, cond))
            }
            Tok::Do => {
                self.advance();
                let body = self.block()?;
                self.expect(Tok::End)?;
                Ok(Stmt::Do(body))
            }
            Tok::Break => {
                self.advance();
                Ok(Stmt::Break)
            }
            Tok::For => {
                self.advance();
                let first = self.expect_name()?;
                if self.accept(&Tok::Assign) {
                    let start = self.expr()?;
                    self.expect(Tok::Comma)?;
                    let stop = self.expr()?;
                    let step = if self.accept(&Tok::Comma) {
                        Some(self.expr()?)
                    } else {
                        None
                    };
                    self.expect(Tok::Do)?;
                    let body = self.block()?;
                    self.expect(Tok::End)?;
                    Ok(Stmt::NumericFor {
                        var: first,
                        start,
                        stop,
                        step,
                        body,
                    })
                } else {
                    let mut vars = vec![first];
                    while self.accept(&Tok::Comma) {
                        vars.push(self.expect_name()?);
                    }
                    self.expect(Tok::In)?;
                    let mut exprs = vec![self.expr()?];
                    while self.accept(&Tok::Comma) {
                        exprs.push(self.expr()?);
                    }
                    self.expect(Tok::Do)?;
                    let body = self.block()?;
                    self.expect(Tok::End)?;
                    Ok(Stmt::GenericFor { vars, exprs, body })
                }
            }
            Tok::Function => {
                self.advance();
                let mut path = vec![self.expect_name()?];
                let mut is_method = false;
                while self.accept(&Tok::Dot) {
                    path.push(self.expect_name()?);
                }
                if self.accept(&Tok::Colon) {
                    path.push(self.expect_name()?);
                    is_method = true;
                }
                let mut body = self.func_body()?;
                if is_method {
                    body.params.insert(0, "self".to_string());
                }
                Ok(Stmt::FunctionDecl(path, is_method, body))
            }
            _ => {
                let expr = self.suffixed_expr()?;
                if self.check(&Tok::Assign) || self.check(&Tok::Comma) {
                    let mut targets = vec![expr];
                    while self.accept(&Tok::Comma) {
                        targets.push(self.suffixed_expr()?);
                    }
                    self.expect(Tok::Assign)?;
                    let mut exprs = vec![self.expr()?];
                    while self.accept(&Tok::Comma) {
                        exprs.push(self.expr()?);
                    }
                    Ok(Stmt::Assign(targets, exprs))
                } else {
                    Ok(Stmt::ExprStmt(expr))
                }
            }
        }
    }

    fn func_body(&mut self) -> Result<FuncBody, VmError> {
        let line = self.line();
        self.expect(Tok::LParen)?;
        let mut params = Vec::new();
        let mut is_vararg = false;
        if !self.check(&Tok::RParen) {
            loop {
                if self.accept(&Tok::Ellipsis) {
                    is_vararg = true;
                    break;
                }
                params.push(self.expect_name()?);
                if !self.accept(&Tok::Comma) {
                    break;
                }
            }
        }
        self.expect(Tok::RParen)?;
        let body = self.block()?;
        self.expect(Tok::End)?;
        Ok(FuncBody {
            params,
            is_vararg,
            body,
            line,
        })
    }

    // Precedence-climbing expression parser.
    fn expr(&mut self) -> Result<Expr, VmError> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr, VmError> {
        let mut lhs = self.and_expr()?;
        while self.accept(&Tok::Or) {
            let rhs = self.and_expr()?;
            lhs = Expr::Bin(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, VmError> {
        let mut lhs = self.cmp_expr()?;
        while self.accept(&Tok::And) {
            let rhs = self.cmp_expr()?;
            lhs = Expr::Bin(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn cmp_expr(&mut self) -> Result<Expr, VmError> {
        let mut lhs = self.concat_expr()?;
        loop {
            let op = match self.peek() {
                Tok::Eq => BinOp::Eq,
                Tok::NotEq => BinOp::NotEq,
                Tok::Less => BinOp::Less,
                Tok::LessEq => BinOp::LessEq,
                Tok::Greater => BinOp::Greater,
                Tok::GreaterEq => BinOp::GreaterEq,
                _ => break,
            };
            self.advance();
            let rhs = self.concat_expr()?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn concat_expr(&mut self) -> Result<Expr, VmError> {
        let lhs = self.add_expr()?;
        if self.accept(&Tok::DotDot) {
            let rhs = self.concat_expr()?;
            return Ok(Expr::Bin(BinOp::Concat, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn add_expr(&mut self) -> Result<Expr, VmError> {
        let mut lhs = self.mul_expr()?;
        loop {
            let op = match self.peek() {
                Tok::Plus => BinOp::Add,
                Tok::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.mul_expr()?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn mul_expr(&mut self) -> Result<Expr, VmError> {
        let mut lhs = self.unary_expr()?;
        loop {
            let op = match self.peek() {
                Tok::Star => BinOp::Mul,
                Tok::Slash => BinOp::Div,
                Tok::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let rhs = self.unary_expr()?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary_expr(&mut self) -> Result<Expr, VmError> {
        match self.peek() {
            Tok::Not => {
                self.advance();
                Ok(Expr::Un(UnOp::Not, Box::new(self.unary_expr()?)))
            }
            Tok::Minus => {
                self.advance();
                Ok(Expr::Un(UnOp::Neg, Box::new(self.unary_expr()?)))
            }
            Tok::Hash => {
                self.advance();
                Ok(Expr::Un(UnOp::Len, Box::new(self.unary_expr()?)))
            }
            _ => self.pow_expr(),
        }
    }

    fn pow_expr(&mut self) -> Result<Expr, VmError> {
        let lhs = self.suffixed_expr()?;
        if self.accept(&Tok::Caret) {
            let rhs = self.unary_expr()?;
            return Ok(Expr::Bin(BinOp::Pow, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn suffixed_expr(&mut self) -> Result<Expr, VmError> {
        let mut e = self.primary_expr()?;
        loop {
            match self.peek().clone() {
                Tok::Dot => {
                    self.advance();
                    let name = self.expect_name()?;
                    e = Expr::Index(Box::new(e), Box::new(Expr::Str(name)));
                }
                Tok::LBracket => {
                    self.advance();
                    let idx = self.expr()?;
                    self.expect(Tok::RBracket)?;
                    e = Expr::Index(Box::new(e), Box::new(idx));
                }
                Tok::Colon => {
                    self.advance();
                    let method = self.expect_name()?;
                    let args = self.call_args()?;
                    e = Expr::MethodCall(Box::new(e), method, args);
                }
                Tok::LParen | Tok::Str(_) | Tok::LBrace => {
                    let args = self.call_args()?;
                    e = Expr::Call(Box::new(e), args);
                }
                _ => break,
            }
        }
        Ok(e)
    }

    fn call_args(&mut self) -> Result<Vec<Expr>, VmError> {
        match self.peek().clone() {
            Tok::Str(s) => {
                self.advance();
                Ok(vec![Expr::Str(s)])
            }
            Tok::LBrace => Ok(vec![self.table_expr()?]),
            _ => {
                self.expect(Tok::LParen)?;
                let mut args = Vec::new();
                if !self.check(&Tok::RParen) {
                    args.push(self.expr()?);
                    while self.accept(&Tok::Comma) {
                        args.push(self.expr()?);
                    }
                }
                self.expect(Tok::RParen)?;
                Ok(args)
            }
        }
    }

    fn table_expr(&mut self) -> Result<Expr, VmError> {
        self.expect(Tok::LBrace)?;
        let mut fields = Vec::new();
        while !self.check(&Tok::RBrace) {
            match self.peek().clone() {
                Tok::LBracket => {
                    self.advance();
                    let key = self.expr()?;
                    self.expect(Tok::RBracket)?;
                    self.expect(Tok::Assign)?;
                    let val = self.expr()?;
                    if let Expr::Str(name) = key {
                        fields.push(TableField::Named(name, val));
                    } else {
                        fields.push(TableField::Positional(val));
                    }
                }
                Tok::Name(n) if self.toks.get(self.pos + 1).map(|t| &t.tok) == Some(&Tok::Assign) => {
                    self.advance();
                    self.advance();
                    let val = self.expr()?;
                    fields.push(TableField::Named(n, val));
                }
                _ => fields.push(TableField::Positional(self.expr()?)),
            }
            if !self.accept(&Tok::Comma) && !self.accept(&Tok::Semi) {
                break;
            }
        }
        self.expect(Tok::RBrace)?;
        Ok(Expr::Table(fields))
    }

    fn primary_expr(&mut self) -> Result<Expr, VmError> {
        match self.peek().clone() {
            Tok::Nil => {
                self.advance();
                Ok(Expr::Nil)
            }
            Tok::True => {
                self.advance();
                Ok(Expr::True)
            }
            Tok::False => {
                self.advance();
                Ok(Expr::False)
            }
            Tok::Ellipsis => {
                self.advance();
                Ok(Expr::Vararg)
            }
            Tok::Number(n) => {
                self.advance();
                Ok(Expr::Number(n))
            }
            Tok::Str(s) => {
                self.advance();
                Ok(Expr::Str(s))
            }
            Tok::Name(n) => {
                self.advance();
                Ok(Expr::Name(n))
            }
            Tok::LParen => {
                self.advance();
                let e = self.expr()?;
                self.expect(Tok::RParen)?;
                Ok(e)
            }
            Tok::Function => {
                self.advance();
                Ok(Expr::Function(self.func_body()?))
            }
            Tok::LBrace => self.table_expr(),
            other => Err(VmError::Parse(format!(
                "unexpected token {:?} at line {}",
                other,
                self.line()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_local_assignment() {
        let block = Parser::parse("local a, b = 1, 2 + 3").unwrap();
        assert_eq!(block.len(), 1);
        assert!(matches!(block[0], Stmt::Local(_, _)));
    }

    #[test]
    fn parses_if_elseif_else() {
        let block = Parser::parse("if a then return 1 elseif b then return 2 else return 3 end").unwrap();
        match &block[0] {
            Stmt::If(branches, else_block) => {
                assert_eq!(branches.len(), 2);
                assert!(else_block.is_some());
            }
            _ => panic!("expected if"),
        }
    }

    #[test]
    fn parses_function_call_chain() {
        let block = Parser::parse("a.b.c(1, 2)").unwrap();
        assert!(matches!(block[0], Stmt::ExprStmt(Expr::Call(_, _))));
    }

    #[test]
    fn parses_numeric_for() {
        let block = Parser::parse("for i = 1, 10 do x = x + i end").unwrap();
        assert!(matches!(block[0], Stmt::NumericFor { .. }));
    }
}
