use crate::compiler::chunk::Chunk;
use crate::vm::instruction::OpCode;

/// Print every chunk right after it finishes compiling.
pub const LOG_COMPILED_CODE: bool = false;

/// Log each byte the compiler emits.
pub const LOG_COMPILER: bool = false;

/// Print each instruction as it executes.
pub const TRACE_EXECUTION_INSTR: bool = false;

/// Print the value stack before each instruction.
pub const TRACE_EXECUTION_STACK: bool = false;

/// Log collector activity: marking, blackening, sweeping, totals.
pub const LOG_GC: bool = false;

/// Log object allocation and destruction.
pub const LOG_OBJECT: bool = false;

/// Collect on every allocation. Slow; surfaces missing GC roots.
pub const STRESS_GC: bool = false;

/// Prints a whole chunk, one instruction per line, with a source-line
/// column that collapses repeats into `|`.
pub fn disassemble_chunk(chunk: &Chunk, name: &str) {
    println!("== {} ==", name);

    let mut offset = 0;
    while offset < chunk.code.len() {
        let line = match chunk.lines.get(offset) {
            Some(current) if offset > 0 && chunk.lines.get(offset - 1) == Some(current) => {
                "   |".to_owned()
            }
            Some(current) => format!("{:4}", current),
            None => "   ?".to_owned(),
        };

        let (text, size) = disassemble_instruction(chunk, offset);
        println!("{:04} {} {}", offset, line, text);
        offset += size;
    }
}

/// Renders the instruction at `offset` and returns its total size in bytes.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> (String, usize) {
    let op_code = match chunk.code.get(offset) {
        Some(byte) => OpCode::from(byte),
        None => return ("<end>".to_owned(), 1),
    };

    match op_code {
        OpCode::Nil
        | OpCode::True
        | OpCode::False
        | OpCode::Pop
        | OpCode::Equal
        | OpCode::Greater
        | OpCode::Less
        | OpCode::Add
        | OpCode::Subtract
        | OpCode::Multiply
        | OpCode::Divide
        | OpCode::Not
        | OpCode::Negate
        | OpCode::Print
        | OpCode::CloseUpvalue
        | OpCode::Inherit
        | OpCode::Return => (op_code.name().to_owned(), 1),

        OpCode::Constant
        | OpCode::GetGlobal
        | OpCode::DefineGlobal
        | OpCode::SetGlobal
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::GetSuper
        | OpCode::Class
        | OpCode::Method => constant_instruction(chunk, op_code, offset),

        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call => byte_instruction(chunk, op_code, offset),

        OpCode::Jump | OpCode::JumpIfFalse => jump_instruction(chunk, op_code, offset, 1),
        OpCode::Loop => jump_instruction(chunk, op_code, offset, -1),

        OpCode::Invoke | OpCode::SuperInvoke => invoke_instruction(chunk, op_code, offset),

        OpCode::Closure => closure_instruction(chunk, offset),
    }
}

fn constant_at(chunk: &Chunk, offset: usize) -> (u8, String) {
    match chunk.code.get(offset) {
        Some(index) => {
            let rendered = chunk
                .read_constant(*index)
                .map(|value| value.to_string())
                .unwrap_or_else(|| "<bad constant>".to_owned());
            (*index, rendered)
        }
        None => (0, "<truncated>".to_owned()),
    }
}

fn constant_instruction(chunk: &Chunk, op_code: OpCode, offset: usize) -> (String, usize) {
    let (index, constant) = constant_at(chunk, offset + 1);
    (
        format!("{:<16} {:4} '{}'", op_code.name(), index, constant),
        2,
    )
}

fn byte_instruction(chunk: &Chunk, op_code: OpCode, offset: usize) -> (String, usize) {
    let slot = chunk.code.get(offset + 1).copied().unwrap_or(0);
    (format!("{:<16} {:4}", op_code.name(), slot), 2)
}

fn jump_instruction(
    chunk: &Chunk,
    op_code: OpCode,
    offset: usize,
    direction: i64,
) -> (String, usize) {
    let hi = chunk.code.get(offset + 1).copied().unwrap_or(0) as i64;
    let lo = chunk.code.get(offset + 2).copied().unwrap_or(0) as i64;
    let jump = (hi << 8 | lo) * direction;
    let target = offset as i64 + 3 + jump;
    (
        format!("{:<16} {:4} -> {}", op_code.name(), offset, target),
        3,
    )
}

fn invoke_instruction(chunk: &Chunk, op_code: OpCode, offset: usize) -> (String, usize) {
    let (index, constant) = constant_at(chunk, offset + 1);
    let arg_count = chunk.code.get(offset + 2).copied().unwrap_or(0);
    (
        format!(
            "{:<16} ({} args) {:4} '{}'",
            op_code.name(),
            arg_count,
            index,
            constant
        ),
        3,
    )
}

/// Closure is variable length: the function constant plus an
/// (is_local, index) byte pair per captured upvalue.
fn closure_instruction(chunk: &Chunk, offset: usize) -> (String, usize) {
    let (index, constant) = constant_at(chunk, offset + 1);
    let mut text = format!("{:<16} {:4} '{}'", OpCode::Closure.name(), index, constant);

    let upvalue_count = chunk
        .read_constant(index)
        .map(|value| value.as_object().as_function().upvalue_count)
        .unwrap_or(0);

    let mut size = 2;
    for _ in 0..upvalue_count {
        let is_local = chunk.code.get(offset + size).copied().unwrap_or(0);
        let slot = chunk.code.get(offset + size + 1).copied().unwrap_or(0);
        let kind = if is_local == 1 { "local" } else { "upvalue" };
        text.push_str(&format!("\n{:04}    |   {} {}", offset + size, kind, slot));
        size += 2;
    }
    (text, size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::value::Value;

    #[test]
    fn sizes_cover_operands() {
        let mut chunk = Chunk::new();
        chunk.write(OpCode::Nil, 1);
        let index = chunk.add_constant(Value::Number(1.0)).unwrap();
        chunk.write_pair(OpCode::Constant, index, 1);
        chunk.write(OpCode::Jump, 2);
        chunk.write_byte(0, 2);
        chunk.write_byte(5, 2);

        let (_, size) = disassemble_instruction(&chunk, 0);
        assert_eq!(size, 1);
        let (text, size) = disassemble_instruction(&chunk, 1);
        assert_eq!(size, 2);
        assert!(text.contains("Constant"));
        let (text, size) = disassemble_instruction(&chunk, 3);
        assert_eq!(size, 3);
        assert!(text.contains("->"));
    }
}
