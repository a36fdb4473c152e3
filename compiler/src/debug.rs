//! Bytecode disassembler. Not part of the execution pipeline: only the
//! CLI's `--disassemble` flag and the chunk/compiler tests in this crate
//! call into it (spec.md §1/§6 names disassembly as an out-of-CORE
//! collaborator).

use std::fmt::Write;

use crate::chunk::{Chunk, OpCode};
use crate::heap::Heap;

/// Disassembles a top-level function and, recursively, every function
/// nested in its constant pool (the way a function literal's own chunk is
/// reachable only through its enclosing chunk's constants). Used by the
/// CLI's `--disassemble` flag to show a whole compiled script at once.
pub fn disassemble_function(function: crate::heap::ObjRef, heap: &Heap) -> String {
    let mut out = String::new();
    disassemble_function_into(&mut out, function, heap);
    out
}

fn disassemble_function_into(out: &mut String, function: crate::heap::ObjRef, heap: &Heap) {
    let crate::heap::ObjData::Function(f) = heap.data(function) else {
        unreachable!("disassemble_function_into called on a non-function ObjRef");
    };
    let name = match f.name {
        Some(n) => heap.as_str(n).to_string(),
        None => "<script>".to_string(),
    };
    out.push_str(&disassemble_chunk(&f.chunk, &name, heap));
    let nested: Vec<crate::heap::ObjRef> = f
        .chunk
        .constants()
        .iter()
        .filter_map(|c| match c {
            crate::value::Value::Obj(r) if matches!(heap.data(*r), crate::heap::ObjData::Function(_)) => {
                Some(*r)
            }
            _ => None,
        })
        .collect();
    for nested_fn in nested {
        out.push('\n');
        disassemble_function_into(out, nested_fn, heap);
    }
}

/// Disassembles every instruction in `chunk`, naming it `name` in the
/// header. `heap` is needed to render constant operands (e.g. an
/// interned identifier or a string literal) the way `print` would.
pub fn disassemble_chunk(chunk: &Chunk, name: &str, heap: &Heap) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {name} ==");
    let mut offset = 0;
    while offset < chunk.code_len() {
        let (text, next) = disassemble_instruction(chunk, offset, heap);
        out.push_str(&text);
        offset = next;
    }
    out
}

/// Disassembles one instruction at `offset`, returning its rendered text
/// and the offset of the next instruction. A repeated disassembly of the
/// same chunk always produces the same text (spec.md §8 round-trip).
pub fn disassemble_instruction(chunk: &Chunk, offset: usize, heap: &Heap) -> (String, usize) {
    let mut out = String::new();
    let _ = write!(out, "{offset:04} ");
    let line = chunk.line_at(offset);
    if offset > 0 && line == chunk.line_at(offset - 1) {
        let _ = write!(out, "   | ");
    } else {
        let _ = write!(out, "{line:4} ");
    }

    let op = OpCode::from(chunk.byte(offset));
    let next = match op {
        OpCode::Constant => constant_instruction(&mut out, op, chunk, offset, heap),
        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call => byte_instruction(&mut out, op, chunk, offset),
        OpCode::GetGlobal
        | OpCode::DefineGlobal
        | OpCode::SetGlobal
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::GetSuper
        | OpCode::Class
        | OpCode::Method => constant_instruction(&mut out, op, chunk, offset, heap),
        OpCode::Jump | OpCode::JumpIfFalse => jump_instruction(&mut out, op, 1, chunk, offset),
        OpCode::Loop => jump_instruction(&mut out, op, -1, chunk, offset),
        OpCode::Invoke | OpCode::SuperInvoke => {
            invoke_instruction(&mut out, op, chunk, offset, heap)
        }
        OpCode::Closure => closure_instruction(&mut out, chunk, offset, heap),
        _ => simple_instruction(&mut out, op, offset),
    };
    out.push('\n');
    (out, next)
}

fn simple_instruction(out: &mut String, op: OpCode, offset: usize) -> usize {
    let _ = write!(out, "{}", op.name());
    offset + 1
}

fn byte_instruction(out: &mut String, op: OpCode, chunk: &Chunk, offset: usize) -> usize {
    let slot = chunk.byte(offset + 1);
    let _ = write!(out, "{:<16} {:4}", op.name(), slot);
    offset + 2
}

fn constant_instruction(
    out: &mut String,
    op: OpCode,
    chunk: &Chunk,
    offset: usize,
    heap: &Heap,
) -> usize {
    let idx = chunk.byte(offset + 1);
    let value = chunk.constant(idx);
    let _ = write!(
        out,
        "{:<16} {:4} '{}'",
        op.name(),
        idx,
        value.display(heap)
    );
    offset + 2
}

fn invoke_instruction(
    out: &mut String,
    op: OpCode,
    chunk: &Chunk,
    offset: usize,
    heap: &Heap,
) -> usize {
    let idx = chunk.byte(offset + 1);
    let argc = chunk.byte(offset + 2);
    let value = chunk.constant(idx);
    let _ = write!(
        out,
        "{:<16} ({} args) {:4} '{}'",
        op.name(),
        argc,
        idx,
        value.display(heap)
    );
    offset + 3
}

fn jump_instruction(out: &mut String, op: OpCode, sign: i32, chunk: &Chunk, offset: usize) -> usize {
    let jump = chunk.read_u16(offset + 1) as i32;
    let target = offset as i32 + 3 + sign * jump;
    let _ = write!(out, "{:<16} {:4} -> {}", op.name(), offset, target);
    offset + 3
}

fn closure_instruction(out: &mut String, chunk: &Chunk, offset: usize, heap: &Heap) -> usize {
    let idx = chunk.byte(offset + 1);
    let value = chunk.constant(idx);
    let _ = write!(out, "{:<16} {:4} '{}'", OpCode::Closure.name(), idx, value.display(heap));
    let mut next = offset + 2;
    if let crate::value::Value::Obj(r) = value {
        if let crate::heap::ObjData::Function(f) = heap.data(r) {
            for _ in 0..f.upvalue_count {
                let is_local = chunk.byte(next);
                let index = chunk.byte(next + 1);
                let kind = if is_local != 0 { "local" } else { "upvalue" };
                let _ = write!(out, "\n{next:04}      |                     {kind} {index}");
                next += 2;
            }
        }
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::heap::Heap;

    #[test]
    fn disassembly_of_the_same_chunk_is_idempotent() {
        let mut heap = Heap::new();
        let script = compile("print 1 + 2 * 3;", &mut heap).unwrap();
        let chunk = match heap.data(script) {
            crate::heap::ObjData::Function(f) => &f.chunk,
            _ => unreachable!(),
        };
        let first = disassemble_chunk(chunk, "script", &heap);
        let second = disassemble_chunk(chunk, "script", &heap);
        assert_eq!(first, second);
    }

    #[test]
    fn constant_instruction_names_its_value() {
        let mut heap = Heap::new();
        let script = compile("nil;", &mut heap).unwrap();
        let chunk = match heap.data(script) {
            crate::heap::ObjData::Function(f) => &f.chunk,
            _ => unreachable!(),
        };
        let text = disassemble_chunk(chunk, "script", &heap);
        assert!(text.contains("Nil"));
    }
}
