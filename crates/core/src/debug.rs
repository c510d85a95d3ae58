//! Chunk disassembler.
//!
//! Pure functions from chunk + offset to text and the next offset, used
//! by the execution tracer, the compiler's code dump, and tests. Every
//! instruction's operand layout is encoded here and nowhere else.

use crate::chunk::{Chunk, OpCode};
use crate::heap::Heap;

/// Disassemble a whole chunk under a banner line.
pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut out = format!("== {name} ==\n");
    let mut offset = 0;
    while offset < chunk.code.len() {
        let (line, next) = disassemble_instruction(heap, chunk, offset);
        out.push_str(&line);
        out.push('\n');
        offset = next;
    }
    out
}

/// Disassemble the instruction at `offset`; returns its rendering and
/// the offset of the next instruction.
pub fn disassemble_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut out = format!("{offset:04} ");
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        out.push_str("   | ");
    } else {
        out.push_str(&format!("{:4} ", chunk.lines[offset]));
    }

    let byte = chunk.code[offset];
    let Some(op) = OpCode::decode(byte) else {
        out.push_str(&format!("Unknown opcode {byte}"));
        return (out, offset + 1);
    };

    let name = op_name(op);
    let next = match op {
        OpCode::Constant
        | OpCode::GetGlobal
        | OpCode::DefineGlobal
        | OpCode::SetGlobal
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::GetSuper
        | OpCode::Class
        | OpCode::Method => {
            let constant = chunk.code[offset + 1];
            out.push_str(&format!(
                "{name:<16} {constant:4} '{}'",
                heap.show_value(chunk.constants[constant as usize])
            ));
            offset + 2
        }
        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call => {
            let slot = chunk.code[offset + 1];
            out.push_str(&format!("{name:<16} {slot:4}"));
            offset + 2
        }
        OpCode::Jump | OpCode::JumpIfFalse | OpCode::Loop => {
            let jump = u16::from_be_bytes([chunk.code[offset + 1], chunk.code[offset + 2]]);
            let target = if op == OpCode::Loop {
                offset + 3 - jump as usize
            } else {
                offset + 3 + jump as usize
            };
            out.push_str(&format!("{name:<16} {offset:4} -> {target}"));
            offset + 3
        }
        OpCode::Invoke | OpCode::SuperInvoke => {
            let constant = chunk.code[offset + 1];
            let arg_count = chunk.code[offset + 2];
            out.push_str(&format!(
                "{name:<16} ({arg_count} args) {constant:4} '{}'",
                heap.show_value(chunk.constants[constant as usize])
            ));
            offset + 3
        }
        OpCode::Closure => {
            let constant = chunk.code[offset + 1];
            out.push_str(&format!(
                "{name:<16} {constant:4} {}",
                heap.show_value(chunk.constants[constant as usize])
            ));
            let mut next = offset + 2;
            let function = match chunk.constants[constant as usize] {
                crate::value::Value::Obj(r) => r,
                _ => unreachable!("closure operand is not a function"),
            };
            for _ in 0..heap.function(function).upvalue_count {
                let is_local = chunk.code[next];
                let index = chunk.code[next + 1];
                let kind = if is_local == 1 { "local" } else { "upvalue" };
                out.push_str(&format!(
                    "\n{next:04}      |                     {kind} {index}"
                ));
                next += 2;
            }
            next
        }
        _ => {
            out.push_str(name);
            offset + 1
        }
    };
    (out, next)
}

fn op_name(op: OpCode) -> &'static str {
    match op {
        OpCode::Constant => "CONSTANT",
        OpCode::Nil => "NIL",
        OpCode::True => "TRUE",
        OpCode::False => "FALSE",
        OpCode::Pop => "POP",
        OpCode::GetLocal => "GET_LOCAL",
        OpCode::SetLocal => "SET_LOCAL",
        OpCode::GetGlobal => "GET_GLOBAL",
        OpCode::DefineGlobal => "DEFINE_GLOBAL",
        OpCode::SetGlobal => "SET_GLOBAL",
        OpCode::GetUpvalue => "GET_UPVALUE",
        OpCode::SetUpvalue => "SET_UPVALUE",
        OpCode::GetProperty => "GET_PROPERTY",
        OpCode::SetProperty => "SET_PROPERTY",
        OpCode::GetSuper => "GET_SUPER",
        OpCode::Equal => "EQUAL",
        OpCode::Greater => "GREATER",
        OpCode::Less => "LESS",
        OpCode::Add => "ADD",
        OpCode::Subtract => "SUBTRACT",
        OpCode::Multiply => "MULTIPLY",
        OpCode::Divide => "DIVIDE",
        OpCode::Not => "NOT",
        OpCode::Negate => "NEGATE",
        OpCode::Print => "PRINT",
        OpCode::Jump => "JUMP",
        OpCode::JumpIfFalse => "JUMP_IF_FALSE",
        OpCode::Loop => "LOOP",
        OpCode::Call => "CALL",
        OpCode::Invoke => "INVOKE",
        OpCode::SuperInvoke => "SUPER_INVOKE",
        OpCode::Closure => "CLOSURE",
        OpCode::CloseUpvalue => "CLOSE_UPVALUE",
        OpCode::Return => "RETURN",
        OpCode::Class => "CLASS",
        OpCode::Inherit => "INHERIT",
        OpCode::Method => "METHOD",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Function, Obj};
    use crate::value::Value;

    #[test]
    fn test_simple_instruction() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Return, 1);
        let (text, next) = disassemble_instruction(&heap, &chunk, 0);
        assert_eq!(next, 1);
        assert!(text.contains("RETURN"));
    }

    #[test]
    fn test_constant_instruction_shows_value() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        let idx = chunk.add_constant(Value::Number(7.0));
        chunk.write_op(OpCode::Constant, 1);
        chunk.write(idx as u8, 1);
        let (text, next) = disassemble_instruction(&heap, &chunk, 0);
        assert_eq!(next, 2);
        assert!(text.contains("CONSTANT"));
        assert!(text.contains("'7'"));
    }

    #[test]
    fn test_walk_touches_every_byte_exactly_once() {
        let mut heap = Heap::new();
        let mut chunk = Chunk::new();

        // One of each operand layout.
        let c = chunk.add_constant(Value::Number(1.0)) as u8;
        chunk.write_op(OpCode::Constant, 1);
        chunk.write(c, 1);
        chunk.write_op(OpCode::GetLocal, 1);
        chunk.write(0, 1);
        chunk.write_op(OpCode::Jump, 2);
        chunk.write(0, 2);
        chunk.write(3, 2);
        chunk.write_op(OpCode::Loop, 2);
        chunk.write(0, 2);
        chunk.write(8, 2);

        let mut inner = Function::new(None);
        inner.upvalue_count = 2;
        let fref = heap.alloc(Obj::Function(inner));
        let fc = chunk.add_constant(Value::Obj(fref)) as u8;
        chunk.write_op(OpCode::Closure, 3);
        chunk.write(fc, 3);
        chunk.write(1, 3);
        chunk.write(0, 3);
        chunk.write(0, 3);
        chunk.write(1, 3);

        let name = heap.intern("m");
        let nc = chunk.add_constant(Value::Obj(name)) as u8;
        chunk.write_op(OpCode::Invoke, 4);
        chunk.write(nc, 4);
        chunk.write(2, 4);
        chunk.write_op(OpCode::Return, 4);

        let mut offset = 0;
        let mut advances = 0;
        while offset < chunk.code.len() {
            let (_, next) = disassemble_instruction(&heap, &chunk, offset);
            assert!(next > offset);
            advances += next - offset;
            offset = next;
        }
        assert_eq!(advances, chunk.code.len());
        assert_eq!(offset, chunk.code.len());
    }

    #[test]
    fn test_unknown_opcode_advances_one() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        chunk.write(0xEE, 1);
        let (text, next) = disassemble_instruction(&heap, &chunk, 0);
        assert_eq!(next, 1);
        assert!(text.contains("Unknown opcode"));
    }
}
