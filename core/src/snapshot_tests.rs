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

//! AST/bytecode snapshot tests -- catches a parser or codegen change that
//! silently alters output for a given source snippet. If a commit mutates
//! the AST shape or the instruction stream for any snippet below, these
//! tests fail with a diff instead of staying quietly green.
//!
//! Uses the `insta` crate for snapshot management. Run `cargo insta
//! review` to accept new snapshots after an intentional change.

use crate::ast::Block;
use crate::compiler;

// ─── Helpers ────────────────────────────────────────────────────────────────

fn parse(source: &str) -> Block {
    crate::parser::Parser::parse(source).expect("parse failed")
}

fn compile_opcodes(source: &str) -> Vec<String> {
    let ast = parse(source);
    let proto = compiler::compile(&ast, "snapshot").expect("compile failed");
    proto.code.iter().map(|op| format!("{:?}", op)).collect()
}

// ─── AST Snapshots ──────────────────────────────────────────────────────────

#[test]
fn snapshot_ast_arithmetic() {
    let ast = parse("local x = 1 + 2 * 3 - 4 / 2\nreturn x");
    insta::assert_debug_snapshot!("arithmetic_ast", ast);
}

#[test]
fn snapshot_ast_if_else() {
    let ast = parse(
        r#"
        local x = 10
        if x > 5 then
            print("big")
        else
            print("small")
        end
        "#,
    );
    insta::assert_debug_snapshot!("if_else_ast", ast);
}

#[test]
fn snapshot_ast_numeric_for() {
    let ast = parse(
        r#"
        local sum = 0
        for i = 1, 10 do
            sum = sum + i
        end
        return sum
        "#,
    );
    insta::assert_debug_snapshot!("numeric_for_ast", ast);
}

#[test]
fn snapshot_ast_closure() {
    let ast = parse(
        r#"
        local function counter()
            local n = 0
            return function()
                n = n + 1
                return n
            end
        end
        "#,
    );
    insta::assert_debug_snapshot!("closure_ast", ast);
}

#[test]
fn snapshot_ast_table_constructor() {
    let ast = parse(r#"local t = { x = 1, y = 2, "positional", "another" }"#);
    insta::assert_debug_snapshot!("table_constructor_ast", ast);
}

// ─── Bytecode Snapshots ─────────────────────────────────────────────────────

#[test]
fn snapshot_bytecode_arithmetic() {
    let opcodes = compile_opcodes("local x = 1 + 2 * 3 - 4 / 2\nreturn x");
    insta::assert_debug_snapshot!("arithmetic_bytecode", opcodes);
}

#[test]
fn snapshot_bytecode_if_else() {
    let opcodes = compile_opcodes(
        r#"
        local x = 10
        if x > 5 then
            print("big")
        else
            print("small")
        end
        "#,
    );
    insta::assert_debug_snapshot!("if_else_bytecode", opcodes);
}

#[test]
fn snapshot_bytecode_numeric_for() {
    let opcodes = compile_opcodes(
        r#"
        local sum = 0
        for i = 1, 10 do
            sum = sum + i
        end
        return sum
        "#,
    );
    insta::assert_debug_snapshot!("numeric_for_bytecode", opcodes);
}

#[test]
fn snapshot_bytecode_closure() {
    let opcodes = compile_opcodes(
        r#"
        local function counter()
            local n = 0
            return function()
                n = n + 1
                return n
            end
        end
        "#,
    );
    insta::assert_debug_snapshot!("closure_bytecode", opcodes);
}

// ─── Targeted Regression Snippets ───────────────────────────────────────────
// Small programs exercising specific compiler/VM-facing paths that have
// broken before or are easy to regress silently.

#[test]
fn snapshot_ast_coroutine_script() {
    let ast = parse(
        r#"
        local co = coroutine.create(function(a)
            local b = coroutine.yield(a + 1)
            return a + b
        end)
        local ok, first = coroutine.resume(co, 10)
        local ok2, second = coroutine.resume(co, 100)
        "#,
    );
    insta::assert_debug_snapshot!("coroutine_script_ast", ast);
}

#[test]
fn snapshot_bytecode_coroutine_script() {
    let opcodes = compile_opcodes(
        r#"
        local co = coroutine.create(function(a)
            local b = coroutine.yield(a + 1)
            return a + b
        end)
        local ok, first = coroutine.resume(co, 10)
        "#,
    );
    insta::assert_debug_snapshot!("coroutine_script_bytecode", opcodes);
}

#[test]
fn snapshot_bytecode_generic_for() {
    let opcodes = compile_opcodes(
        r#"
        for k, v in pairs(t) do
            print(k, v)
        end
        "#,
    );
    insta::assert_debug_snapshot!("generic_for_bytecode", opcodes);
}

#[test]
fn snapshot_bytecode_method_call_and_concat() {
    let opcodes = compile_opcodes(r#"return ("hello" .. " " .. name):upper()"#);
    insta::assert_debug_snapshot!("method_call_concat_bytecode", opcodes);
}

// ─── JSON Snapshot (Embedder Config) ────────────────────────────────────────
// The embedder-facing config format is a stable wire contract; this catches
// an accidental field rename or default-value drift.

#[test]
fn snapshot_json_default_config() {
    let config = crate::config::Config::default();
    insta::assert_json_snapshot!("default_config_json", config);
}
