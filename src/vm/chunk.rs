// src/vm/chunk.rs

use crate::value::Value;
use crate::vm::opcode::OpCode;

/// Marks the first byte offset compiled from a new source line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineStart {
    pub offset: usize,
    pub line: usize,
}

// A chunk of bytecode representing a compiled script or function.
#[derive(Debug, Default, Clone)]
pub struct Chunk {
    // The sequence of bytecode instructions.
    pub code: Vec<u8>,
    // The pool of constant values used by the code.
    pub constants: Vec<Value>,
    // Sparse line table: one entry per run of bytes sharing a line.
    lines: Vec<LineStart>,
}

impl Chunk {
    // Creates a new, empty chunk.
    pub fn new() -> Self {
        Self::default()
    }

    // Appends a byte to the chunk, which can be an OpCode or an operand.
    // A line entry is only recorded when the line changes.
    pub fn write(&mut self, byte: u8, line: usize) {
        let offset = self.code.len();
        self.code.push(byte);
        if self.lines.last().map_or(true, |last| last.line != line) {
            self.lines.push(LineStart { offset, line });
        }
    }

    // A convenience method to write an OpCode.
    pub fn write_opcode(&mut self, op: OpCode, line: usize) {
        self.write(op as u8, line);
    }

    // Adds a constant value to the chunk's constant pool.
    // Returns the index of that constant in the pool.
    pub fn add_constant(&mut self, value: Value) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }

    /// Source line of the instruction at `offset`: the last entry starting at
    /// or before it. Only used on error paths.
    pub fn line_at(&self, offset: usize) -> usize {
        let after = self.lines.partition_point(|start| start.offset <= offset);
        match after {
            0 => 0,
            n => self.lines[n - 1].line,
        }
    }

    pub fn line_entries(&self) -> usize {
        self.lines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::opcode::OpCode;

    #[test]
    fn test_write_and_add_constant() {
        let mut chunk = Chunk::new();

        // Add a constant and write the instruction to load it
        let const_idx = chunk.add_constant(Value::Number(1.23));
        chunk.write_opcode(OpCode::OpConstant, 1);
        chunk.write(const_idx as u8, 1);

        // Add another instruction
        chunk.write_opcode(OpCode::OpNegate, 2);

        assert_eq!(chunk.code, vec![OpCode::OpConstant as u8, 0, OpCode::OpNegate as u8]);
        assert_eq!(chunk.constants, vec![Value::Number(1.23)]);
        assert_eq!(chunk.line_entries(), 2);
    }

    #[test]
    fn test_sparse_line_lookup() {
        let mut chunk = Chunk::new();
        for _ in 0..4 {
            chunk.write_opcode(OpCode::OpNil, 1);
        }
        chunk.write_opcode(OpCode::OpPop, 3);
        chunk.write_opcode(OpCode::OpPop, 3);
        chunk.write_opcode(OpCode::OpReturn, 7);

        assert_eq!(chunk.line_entries(), 3);
        assert_eq!(chunk.line_at(0), 1);
        assert_eq!(chunk.line_at(3), 1);
        assert_eq!(chunk.line_at(4), 3);
        assert_eq!(chunk.line_at(5), 3);
        assert_eq!(chunk.line_at(6), 7);
        // Past the end still resolves to the last known line.
        assert_eq!(chunk.line_at(100), 7);
    }
}
