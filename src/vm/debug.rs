//! Human-readable bytecode listings.

use std::fmt::Write;

use super::{Chunk, Op};

/// Disassemble a whole chunk under a header name.
pub fn disassemble(chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {} ==", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(chunk, offset, &mut out);
    }
    out
}

/// Disassemble one instruction, returning the offset of the next.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let _ = write!(out, "{:04} ", offset);
    if offset > 0 && chunk.line_at(offset) == chunk.line_at(offset - 1) {
        let _ = write!(out, "   | ");
    } else {
        let _ = write!(out, "{:4} ", chunk.line_at(offset));
    }

    let Some(op) = Op::from_u8(chunk.code[offset]) else {
        let _ = writeln!(out, "unknown opcode {}", chunk.code[offset]);
        return offset + 1;
    };

    match op {
        Op::Const => const_instruction(chunk, offset, out),
        Op::Str => string_instruction(chunk, offset, out),
        Op::GetLocal | Op::SetLocal | Op::GetUpvalue | Op::SetUpvalue | Op::Call => {
            byte_instruction(chunk, op, offset, out)
        }
        Op::GetGlobal
        | Op::SetGlobal
        | Op::DefineGlobal
        | Op::Class
        | Op::Method
        | Op::GetProp
        | Op::SetProp
        | Op::GetSuper => name_instruction(chunk, op, offset, out),
        Op::Invoke | Op::SuperInvoke => invoke_instruction(chunk, op, offset, out),
        Op::Jump | Op::JumpIfFalse => jump_instruction(chunk, op, 1, offset, out),
        Op::Loop => jump_instruction(chunk, op, -1, offset, out),
        Op::Closure => closure_instruction(chunk, offset, out),
        _ => {
            let _ = writeln!(out, "{:?}", op);
            offset + 1
        }
    }
}

fn const_instruction(chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let idx = chunk.read_u16(offset + 1) as usize;
    let _ = writeln!(out, "{:<12} {:4} ({})", "Const", idx, chunk.consts[idx]);
    offset + 3
}

fn string_instruction(chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let idx = chunk.read_u16(offset + 1) as usize;
    let _ = writeln!(out, "{:<12} {:4} ({:?})", "Str", idx, chunk.strings[idx]);
    offset + 3
}

fn byte_instruction(chunk: &Chunk, op: Op, offset: usize, out: &mut String) -> usize {
    let operand = chunk.code[offset + 1];
    let _ = writeln!(out, "{:<12} {:4}", format!("{:?}", op), operand);
    offset + 2
}

fn name_instruction(chunk: &Chunk, op: Op, offset: usize, out: &mut String) -> usize {
    let idx = chunk.read_u16(offset + 1) as usize;
    let _ = writeln!(
        out,
        "{:<12} {:4} ('{}')",
        format!("{:?}", op),
        idx,
        chunk.names[idx]
    );
    offset + 3
}

fn invoke_instruction(chunk: &Chunk, op: Op, offset: usize, out: &mut String) -> usize {
    let idx = chunk.read_u16(offset + 1) as usize;
    let argc = chunk.code[offset + 3];
    let _ = writeln!(
        out,
        "{:<12} {:4} ('{}', {} args)",
        format!("{:?}", op),
        idx,
        chunk.names[idx],
        argc
    );
    offset + 4
}

fn jump_instruction(chunk: &Chunk, op: Op, sign: i64, offset: usize, out: &mut String) -> usize {
    let distance = chunk.read_u16(offset + 1) as i64;
    let target = offset as i64 + 3 + sign * distance;
    let _ = writeln!(out, "{:<12} {:4} -> {}", format!("{:?}", op), offset, target);
    offset + 3
}

fn closure_instruction(chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let entry = chunk.read_u16(offset + 1) as usize;
    let name_idx = chunk.read_u16(offset + 3) as usize;
    let arity = chunk.code[offset + 5];
    let n_upvalues = chunk.code[offset + 6] as usize;
    let _ = writeln!(
        out,
        "{:<12} '{}' entry={} arity={}",
        "Closure", chunk.names[name_idx], entry, arity
    );
    let mut at = offset + 7;
    for _ in 0..n_upvalues {
        let is_local = chunk.code[at] == 1;
        let index = chunk.code[at + 1];
        let _ = writeln!(
            out,
            "{:04}    |                     {} {}",
            at,
            if is_local { "local" } else { "upvalue" },
            index
        );
        at += 2;
    }
    at
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_source;

    #[test]
    fn test_disassemble_covers_whole_chunk() {
        let chunk = compile_source(
            "fun adder(a, b) { return a + b; } \
             class C { m() { return 1; } } \
             var r = adder(1, 2);",
        )
        .unwrap();
        let listing = disassemble(&chunk, "test");
        assert!(listing.starts_with("== test =="));
        assert!(listing.contains("Closure"));
        assert!(listing.contains("Class"));
        assert!(listing.contains("Method"));
        assert!(listing.contains("Return"));
        assert!(!listing.contains("unknown opcode"));
    }

    #[test]
    fn test_disassemble_resolves_names() {
        let chunk = compile_source("var answer = 42;").unwrap();
        let listing = disassemble(&chunk, "main");
        assert!(listing.contains("'answer'"));
        assert!(listing.contains("(42)"));
    }

    #[test]
    fn test_closure_lists_upvalues() {
        let chunk = compile_source(
            "fun outer() { var x = 1; fun inner() { return x; } return inner; }",
        )
        .unwrap();
        let listing = disassemble(&chunk, "t");
        assert!(listing.contains("local 1"));
    }
}
