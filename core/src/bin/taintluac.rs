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

//! `taintluac` — a standalone compiler driver. Parses and compiles one or
//! more source files (or stdin, via `-`) into prototypes and either lists
//! them, dumps them to a wire-format chunk, or just checks for syntax
//! errors.

use std::env;
use std::fs;
use std::io::{self, Read, Write};
use std::process::ExitCode;
use taintlua_core::chunk;
use taintlua_core::compiler;
use taintlua_core::parser::Parser;

struct Options {
    list: bool,
    parse_only: bool,
    strip_debug: bool,
    output: Option<String>,
    inputs: Vec<String>,
}

fn print_usage() {
    eprintln!("usage: taintluac [-l] [-o file] [-p] [-s] [-v] [--] [file | -] ...");
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut opts = Options {
        list: false,
        parse_only: false,
        strip_debug: false,
        output: None,
        inputs: Vec::new(),
    };
    let mut i = 0;
    let mut no_more_flags = false;
    while i < args.len() {
        let a = &args[i];
        if no_more_flags {
            opts.inputs.push(a.clone());
        } else if a == "--" {
            no_more_flags = true;
        } else if a == "-l" {
            opts.list = true;
        } else if a == "-p" {
            opts.parse_only = true;
        } else if a == "-s" {
            opts.strip_debug = true;
        } else if a == "-v" {
            println!("taintluac {}", env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        } else if a == "-o" {
            i += 1;
            let path = args.get(i).ok_or("-o: missing output file")?;
            opts.output = Some(path.clone());
        } else if a == "-" || !a.starts_with('-') {
            opts.inputs.push(a.clone());
        } else {
            return Err(format!("unrecognized option '{}'", a));
        }
        i += 1;
    }
    if opts.inputs.is_empty() {
        opts.inputs.push("-".to_string());
    }
    Ok(opts)
}

fn read_source(path: &str) -> Result<String, String> {
    if path == "-" {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf).map_err(|e| format!("stdin: {}", e))?;
        Ok(buf)
    } else {
        fs::read_to_string(path).map_err(|e| format!("cannot open {}: {}", path, e))
    }
}

fn run(opts: Options) -> Result<(), String> {
    let mut protos = Vec::new();
    for path in &opts.inputs {
        let source = read_source(path)?;
        let ast = Parser::parse(&source).map_err(|e| format!("{}: {}", path, e))?;
        if opts.parse_only {
            continue;
        }
        let mut proto = compiler::compile(&ast, path).map_err(|e| format!("{}: {}", path, e))?;
        if opts.strip_debug {
            strip_debug(&mut proto);
        }
        if opts.list {
            println!("{}: {} instructions, {} constants", path, proto.code.len(), proto.constants.len());
        }
        protos.push(proto);
    }
    if opts.parse_only {
        return Ok(());
    }
    if let Some(out_path) = &opts.output {
        let proto = protos.last().ok_or("no input produced a chunk to write")?;
        let mut buf = Vec::new();
        chunk::dump(proto, &mut buf).map_err(|e| format!("{}: {}", out_path, e))?;
        if out_path == "-" {
            io::stdout().write_all(&buf).map_err(|e| e.to_string())?;
        } else {
            fs::write(out_path, &buf).map_err(|e| format!("cannot write {}: {}", out_path, e))?;
        }
    }
    Ok(())
}

/// Recursively clears each prototype's own debug source name, matching
/// the base compiler's `-s` behavior of shrinking a chunk without
/// changing its semantics.
fn strip_debug(proto: &mut taintlua_core::proto::Proto) {
    proto.source_name = String::new();
    for nested in &proto.nested {
        strip_debug_nested(nested);
    }
}

fn strip_debug_nested(proto: &taintlua_core::gc::Gc<taintlua_core::proto::Proto>) {
    let nested: Vec<_> = {
        let mut b = proto.borrow_mut();
        b.data.source_name = String::new();
        b.data.nested.clone()
    };
    for child in &nested {
        strip_debug_nested(child);
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    let opts = match parse_args(&args) {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("taintluac: {}", e);
            print_usage();
            return ExitCode::FAILURE;
        }
    };
    match run(opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("taintluac: {}", e);
            ExitCode::FAILURE
        }
    }
}
