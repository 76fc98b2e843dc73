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

//! Bytecode wire format.
//!
//! Unchanged from the base language's precompiled-chunk layout: a
//! signature byte sequence (`ESC L u a`), a version byte, an integer/
//! number size header, then function prototype records -- constant
//! pool, code vector, line info, local/upvalue names, nested
//! prototypes. Taint is never part of this format: a loaded chunk's
//! constants and its top-level closure's object taint are assigned from
//! the *loading* thread's ambient state at `load` time, exactly as if
//! the chunk had just been compiled in that thread.

use crate::error::VmError;
use crate::opcode::Instr;
use crate::proto::{LocalDesc, Proto, UpvalDesc};
use crate::thread::ThreadState;
use crate::value::{TaggedValue, Value};
use std::io::{self, Read, Write};

pub const SIGNATURE: [u8; 4] = [0x1B, b'L', b'u', b'a'];
pub const VERSION: u8 = 0x51;

fn io_err(e: impl std::fmt::Display) -> VmError {
    VmError::Compile(format!("malformed chunk: {e}"))
}

fn write_u8(w: &mut impl Write, v: u8) -> io::Result<()> {
    w.write_all(&[v])
}

fn write_u32(w: &mut impl Write, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_i32(w: &mut impl Write, v: i32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_f64(w: &mut impl Write, v: f64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_str(w: &mut impl Write, s: &str) -> io::Result<()> {
    write_u32(w, s.len() as u32)?;
    w.write_all(s.as_bytes())
}

fn read_u8(r: &mut impl Read) -> Result<u8, VmError> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf).map_err(io_err)?;
    Ok(buf[0])
}

fn read_u32(r: &mut impl Read) -> Result<u32, VmError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).map_err(io_err)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_i32(r: &mut impl Read) -> Result<i32, VmError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).map_err(io_err)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_f64(r: &mut impl Read) -> Result<f64, VmError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).map_err(io_err)?;
    Ok(f64::from_le_bytes(buf))
}

fn read_str(r: &mut impl Read) -> Result<String, VmError> {
    let len = read_u32(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).map_err(io_err)?;
    String::from_utf8(buf).map_err(io_err)
}

/// Tags for the constant pool and for encoded `Value`s in general.
/// Constants are restricted to the scalar/string subset a compiler ever
/// emits into `LOADK`.
mod tag {
    pub const NIL: u8 = 0;
    pub const FALSE: u8 = 1;
    pub const TRUE: u8 = 2;
    pub const NUMBER: u8 = 3;
    pub const STRING: u8 = 4;
}

fn write_const(w: &mut impl Write, v: &Value) -> io::Result<()> {
    match v {
        Value::Nil => write_u8(w, tag::NIL),
        Value::Boolean(false) => write_u8(w, tag::FALSE),
        Value::Boolean(true) => write_u8(w, tag::TRUE),
        Value::Number(n) => {
            write_u8(w, tag::NUMBER)?;
            write_f64(w, *n)
        }
        Value::Str(s) => {
            write_u8(w, tag::STRING)?;
            write_str(w, s.borrow().data.as_str())
        }
        other => panic!("constant pool cannot hold a {}", other.type_name()),
    }
}

fn read_const(r: &mut impl Read, thread: &mut ThreadState) -> Result<TaggedValue, VmError> {
    let t = read_u8(r)?;
    let value = match t {
        tag::NIL => Value::Nil,
        tag::FALSE => Value::Boolean(false),
        tag::TRUE => Value::Boolean(true),
        tag::NUMBER => Value::Number(read_f64(r)?),
        tag::STRING => {
            let s = read_str(r)?;
            Value::Str(crate::interner::intern_adhoc(thread, &s))
        }
        other => return Err(VmError::Compile(format!("unknown constant tag {other}"))),
    };
    // Constants are frozen with the loading thread's ambient taint, not
    // recomputed per LOADK -- see vm.rs.
    let taint = thread.mask_write();
    Ok(TaggedValue::new(value, taint))
}

fn write_instr(w: &mut impl Write, instr: &Instr) -> io::Result<()> {
    macro_rules! op {
        ($code:expr) => {
            write_u8(w, $code)
        };
    }
    match *instr {
        Instr::LoadK { a, bx } => {
            op!(0)?;
            write_u8(w, a)?;
            w.write_all(&bx.to_le_bytes())
        }
        Instr::LoadBool { a, b, skip_next } => {
            op!(1)?;
            write_u8(w, a)?;
            write_u8(w, b as u8)?;
            write_u8(w, skip_next as u8)
        }
        Instr::LoadNil { a, b } => {
            op!(2)?;
            write_u8(w, a)?;
            write_u8(w, b)
        }
        Instr::Move { a, b } => {
            op!(3)?;
            write_u8(w, a)?;
            write_u8(w, b)
        }
        Instr::GetGlobal { a, name } => {
            op!(4)?;
            write_u8(w, a)?;
            w.write_all(&name.to_le_bytes())
        }
        Instr::SetGlobal { a, name } => {
            op!(5)?;
            write_u8(w, a)?;
            w.write_all(&name.to_le_bytes())
        }
        Instr::GetUpval { a, b } => {
            op!(6)?;
            write_u8(w, a)?;
            write_u8(w, b)
        }
        Instr::SetUpval { a, b } => {
            op!(7)?;
            write_u8(w, a)?;
            write_u8(w, b)
        }
        Instr::GetTable { a, b, c } => {
            op!(8)?;
            write_u8(w, a)?;
            write_u8(w, b)?;
            write_u8(w, c)
        }
        Instr::SetTable { a, b, c } => {
            op!(9)?;
            write_u8(w, a)?;
            write_u8(w, b)?;
            write_u8(w, c)
        }
        Instr::SelfOp { a, b, c } => {
            op!(10)?;
            write_u8(w, a)?;
            write_u8(w, b)?;
            write_u8(w, c)
        }
        Instr::NewTable { a } => {
            op!(11)?;
            write_u8(w, a)
        }
        Instr::Add { a, b, c } => {
            op!(12)?;
            write_u8(w, a)?;
            write_u8(w, b)?;
            write_u8(w, c)
        }
        Instr::Sub { a, b, c } => {
            op!(13)?;
            write_u8(w, a)?;
            write_u8(w, b)?;
            write_u8(w, c)
        }
        Instr::Mul { a, b, c } => {
            op!(14)?;
            write_u8(w, a)?;
            write_u8(w, b)?;
            write_u8(w, c)
        }
        Instr::Div { a, b, c } => {
            op!(15)?;
            write_u8(w, a)?;
            write_u8(w, b)?;
            write_u8(w, c)
        }
        Instr::Mod { a, b, c } => {
            op!(16)?;
            write_u8(w, a)?;
            write_u8(w, b)?;
            write_u8(w, c)
        }
        Instr::Pow { a, b, c } => {
            op!(17)?;
            write_u8(w, a)?;
            write_u8(w, b)?;
            write_u8(w, c)
        }
        Instr::Unm { a, b } => {
            op!(18)?;
            write_u8(w, a)?;
            write_u8(w, b)
        }
        Instr::Not { a, b } => {
            op!(19)?;
            write_u8(w, a)?;
            write_u8(w, b)
        }
        Instr::Len { a, b } => {
            op!(20)?;
            write_u8(w, a)?;
            write_u8(w, b)
        }
        Instr::Concat { a, b, c } => {
            op!(21)?;
            write_u8(w, a)?;
            write_u8(w, b)?;
            write_u8(w, c)
        }
        Instr::Jmp { offset } => {
            op!(22)?;
            write_i32(w, offset)
        }
        Instr::Eq { a, b, c } => {
            op!(23)?;
            write_u8(w, a as u8)?;
            write_u8(w, b)?;
            write_u8(w, c)
        }
        Instr::Lt { a, b, c } => {
            op!(24)?;
            write_u8(w, a as u8)?;
            write_u8(w, b)?;
            write_u8(w, c)
        }
        Instr::Le { a, b, c } => {
            op!(25)?;
            write_u8(w, a as u8)?;
            write_u8(w, b)?;
            write_u8(w, c)
        }
        Instr::Test { a, c } => {
            op!(26)?;
            write_u8(w, a)?;
            write_u8(w, c as u8)
        }
        Instr::Call { a, b, c } => {
            op!(27)?;
            write_u8(w, a)?;
            write_u8(w, b)?;
            write_u8(w, c)
        }
        Instr::TailCall { a, b } => {
            op!(28)?;
            write_u8(w, a)?;
            write_u8(w, b)
        }
        Instr::Return { a, b } => {
            op!(29)?;
            write_u8(w, a)?;
            write_u8(w, b)
        }
        Instr::ForPrep { a, offset } => {
            op!(30)?;
            write_u8(w, a)?;
            write_i32(w, offset)
        }
        Instr::ForLoop { a, offset } => {
            op!(31)?;
            write_u8(w, a)?;
            write_i32(w, offset)
        }
        Instr::Closure { a, bx } => {
            op!(32)?;
            write_u8(w, a)?;
            w.write_all(&bx.to_le_bytes())
        }
        Instr::Vararg { a, b } => {
            op!(33)?;
            write_u8(w, a)?;
            write_u8(w, b)
        }
    }
}

fn read_u16(r: &mut impl Read) -> Result<u16, VmError> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf).map_err(io_err)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_instr(r: &mut impl Read) -> Result<Instr, VmError> {
    let op = read_u8(r)?;
    Ok(match op {
        0 => Instr::LoadK { a: read_u8(r)?, bx: read_u16(r)? },
        1 => Instr::LoadBool { a: read_u8(r)?, b: read_u8(r)? != 0, skip_next: read_u8(r)? != 0 },
        2 => Instr::LoadNil { a: read_u8(r)?, b: read_u8(r)? },
        3 => Instr::Move { a: read_u8(r)?, b: read_u8(r)? },
        4 => Instr::GetGlobal { a: read_u8(r)?, name: read_u16(r)? },
        5 => Instr::SetGlobal { a: read_u8(r)?, name: read_u16(r)? },
        6 => Instr::GetUpval { a: read_u8(r)?, b: read_u8(r)? },
        7 => Instr::SetUpval { a: read_u8(r)?, b: read_u8(r)? },
        8 => Instr::GetTable { a: read_u8(r)?, b: read_u8(r)?, c: read_u8(r)? },
        9 => Instr::SetTable { a: read_u8(r)?, b: read_u8(r)?, c: read_u8(r)? },
        10 => Instr::SelfOp { a: read_u8(r)?, b: read_u8(r)?, c: read_u8(r)? },
        11 => Instr::NewTable { a: read_u8(r)? },
        12 => Instr::Add { a: read_u8(r)?, b: read_u8(r)?, c: read_u8(r)? },
        13 => Instr::Sub { a: read_u8(r)?, b: read_u8(r)?, c: read_u8(r)? },
        14 => Instr::Mul { a: read_u8(r)?, b: read_u8(r)?, c: read_u8(r)? },
        15 => Instr::Div { a: read_u8(r)?, b: read_u8(r)?, c: read_u8(r)? },
        16 => Instr::Mod { a: read_u8(r)?, b: read_u8(r)?, c: read_u8(r)? },
        17 => Instr::Pow { a: read_u8(r)?, b: read_u8(r)?, c: read_u8(r)? },
        18 => Instr::Unm { a: read_u8(r)?, b: read_u8(r)? },
        19 => Instr::Not { a: read_u8(r)?, b: read_u8(r)? },
        20 => Instr::Len { a: read_u8(r)?, b: read_u8(r)? },
        21 => Instr::Concat { a: read_u8(r)?, b: read_u8(r)?, c: read_u8(r)? },
        22 => Instr::Jmp { offset: read_i32(r)? },
        23 => Instr::Eq { a: read_u8(r)? != 0, b: read_u8(r)?, c: read_u8(r)? },
        24 => Instr::Lt { a: read_u8(r)? != 0, b: read_u8(r)?, c: read_u8(r)? },
        25 => Instr::Le { a: read_u8(r)? != 0, b: read_u8(r)?, c: read_u8(r)? },
        26 => Instr::Test { a: read_u8(r)?, c: read_u8(r)? != 0 },
        27 => Instr::Call { a: read_u8(r)?, b: read_u8(r)?, c: read_u8(r)? },
        28 => Instr::TailCall { a: read_u8(r)?, b: read_u8(r)? },
        29 => Instr::Return { a: read_u8(r)?, b: read_u8(r)? },
        30 => Instr::ForPrep { a: read_u8(r)?, offset: read_i32(r)? },
        31 => Instr::ForLoop { a: read_u8(r)?, offset: read_i32(r)? },
        32 => Instr::Closure { a: read_u8(r)?, bx: read_u16(r)? },
        33 => Instr::Vararg { a: read_u8(r)?, b: read_u8(r)? },
        other => return Err(VmError::Compile(format!("unknown opcode byte {other}"))),
    })
}

fn write_proto(w: &mut impl Write, proto: &Proto) -> io::Result<()> {
    write_str(w, &proto.source_name)?;
    write_u32(w, proto.line_defined)?;
    write_u8(w, proto.num_params)?;
    write_u8(w, proto.is_vararg as u8)?;
    write_u8(w, proto.max_stack)?;

    write_u32(w, proto.code.len() as u32)?;
    for instr in &proto.code {
        write_instr(w, instr)?;
    }
    write_u32(w, proto.lines.len() as u32)?;
    for line in &proto.lines {
        write_u32(w, *line)?;
    }

    write_u32(w, proto.constants.len() as u32)?;
    for c in &proto.constants {
        write_const(w, &c.value)?;
    }

    write_u32(w, proto.upvalues.len() as u32)?;
    for u in &proto.upvalues {
        write_str(w, &u.name)?;
        write_u8(w, u.in_stack as u8)?;
        write_u8(w, u.index)?;
    }

    write_u32(w, proto.locals.len() as u32)?;
    for l in &proto.locals {
        write_str(w, &l.name)?;
        write_u32(w, l.start_pc)?;
        write_u32(w, l.end_pc)?;
    }

    write_u32(w, proto.nested.len() as u32)?;
    for n in &proto.nested {
        write_proto(w, &n.borrow().data)?;
    }
    Ok(())
}

fn read_proto(r: &mut impl Read, thread: &mut ThreadState) -> Result<Proto, VmError> {
    let source_name = read_str(r)?;
    let line_defined = read_u32(r)?;
    let num_params = read_u8(r)?;
    let is_vararg = read_u8(r)? != 0;
    let max_stack = read_u8(r)?;

    let code_len = read_u32(r)? as usize;
    let mut code = Vec::with_capacity(code_len);
    for _ in 0..code_len {
        code.push(read_instr(r)?);
    }
    let lines_len = read_u32(r)? as usize;
    let mut lines = Vec::with_capacity(lines_len);
    for _ in 0..lines_len {
        lines.push(read_u32(r)?);
    }

    let const_len = read_u32(r)? as usize;
    let mut constants = Vec::with_capacity(const_len);
    for _ in 0..const_len {
        constants.push(read_const(r, thread)?);
    }

    let upval_len = read_u32(r)? as usize;
    let mut upvalues = Vec::with_capacity(upval_len);
    for _ in 0..upval_len {
        upvalues.push(UpvalDesc {
            name: read_str(r)?,
            in_stack: read_u8(r)? != 0,
            index: read_u8(r)?,
        });
    }

    let local_len = read_u32(r)? as usize;
    let mut locals = Vec::with_capacity(local_len);
    for _ in 0..local_len {
        locals.push(LocalDesc {
            name: read_str(r)?,
            start_pc: read_u32(r)?,
            end_pc: read_u32(r)?,
        });
    }

    let nested_len = read_u32(r)? as usize;
    let mut nested = Vec::with_capacity(nested_len);
    for _ in 0..nested_len {
        let child = read_proto(r, thread)?;
        nested.push(crate::gc::alloc(thread, child, false, 0));
    }

    Ok(Proto {
        source_name,
        line_defined,
        num_params,
        is_vararg,
        max_stack,
        code,
        lines,
        constants,
        nested,
        upvalues,
        locals,
    })
}

/// Serializes a top-level `Proto` to the wire format. Object/value taint
/// is never written -- only the shape a compiler produces.
pub fn dump(proto: &Proto, w: &mut impl Write) -> io::Result<()> {
    w.write_all(&SIGNATURE)?;
    write_u8(w, VERSION)?;
    write_u8(w, std::mem::size_of::<i32>() as u8)?;
    write_u8(w, std::mem::size_of::<f64>() as u8)?;
    write_proto(w, proto)
}

/// Loads a chunk, stamping every constant (and, by the caller via
/// `gc::alloc`, the wrapping closure) with `thread`'s current ambient
/// taint -- the loading thread's state, not whatever thread originally
/// compiled it.
pub fn load(r: &mut impl Read, thread: &mut ThreadState) -> Result<Proto, VmError> {
    let mut sig = [0u8; 4];
    r.read_exact(&mut sig).map_err(io_err)?;
    if sig != SIGNATURE {
        return Err(VmError::Compile("not a precompiled chunk (bad signature)".to_string()));
    }
    let version = read_u8(r)?;
    if version != VERSION {
        return Err(VmError::Compile(format!("unsupported chunk version {version:#x}")));
    }
    let _int_size = read_u8(r)?;
    let _number_size = read_u8(r)?;
    read_proto(r, thread)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::LabelTable;
    use std::rc::Rc;

    fn compile_proto(src: &str) -> Proto {
        let ast = crate::parser::Parser::parse(src).unwrap();
        crate::compiler::compile(&ast, "test").unwrap()
    }

    #[test]
    fn round_trips_a_simple_chunk() {
        let proto = compile_proto("x = 1 + 2");
        let mut buf = Vec::new();
        dump(&proto, &mut buf).unwrap();
        assert_eq!(&buf[0..4], &SIGNATURE);

        let mut thread = ThreadState::new(Rc::new(LabelTable::new()));
        let loaded = load(&mut buf.as_slice(), &mut thread).unwrap();
        assert_eq!(loaded.code.len(), proto.code.len());
        assert_eq!(loaded.constants.len(), proto.constants.len());
    }

    #[test]
    fn loaded_constants_pick_up_loading_thread_taint() {
        let proto = compile_proto("x = 1");
        let mut buf = Vec::new();
        dump(&proto, &mut buf).unwrap();

        let mut thread = ThreadState::new(Rc::new(LabelTable::new()));
        thread.stacktaint = Some(thread.labels.clone().intern("Untrusted"));
        let loaded = load(&mut buf.as_slice(), &mut thread).unwrap();
        assert!(loaded.constants.iter().any(|c| c.taint.is_some()));
    }

    #[test]
    fn rejects_bad_signature() {
        let mut thread = ThreadState::new(Rc::new(LabelTable::new()));
        let garbage = b"not a chunk at all";
        assert!(load(&mut &garbage[..], &mut thread).is_err());
    }
}
