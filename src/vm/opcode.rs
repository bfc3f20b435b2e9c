// src/vm/opcode.rs

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    // --- Constants and Literals ---
    /// Pushes a constant from the chunk's constant pool onto the stack.
    /// The operand is a single byte representing the index in the pool.
    OpConstant,
    /// Same as `OpConstant` with a 3-byte big-endian index.
    OpConstantLong,
    OpNil,
    OpTrue,
    OpFalse,

    // --- Stack ---
    OpPop,
    /// Pops as many values as its 1-byte operand says.
    OpPopN,
    OpDup,

    // --- Variables ---
    OpGetLocal,
    OpSetLocal,
    /// Pushes the value of a global variable. Operand is a name constant.
    OpGetGlobal,
    /// Defines (or redefines) a global from the top of the stack.
    OpDefineGlobal,
    /// Assigns an existing global; undefined names are a runtime error.
    OpSetGlobal,
    OpGetUpvalue,
    OpSetUpvalue,
    OpGetProperty,
    OpSetProperty,
    OpGetSuper,

    // --- Comparison ---
    OpEqual,
    OpGreater,
    OpLess,

    // --- Arithmetic ---
    OpAdd,
    OpSubtract,
    OpMultiply,
    OpDivide,
    OpNot,
    OpNegate,

    OpPrint,

    // --- Jumps ---
    /// Unconditionally jumps forward by a 16-bit offset.
    OpJump,
    /// Jumps forward by a 16-bit offset if the top of the stack is falsey.
    /// Leaves the condition on the stack.
    OpJumpIfFalse,
    /// Jumps backward by a 16-bit offset.
    OpLoop,

    // --- Calls and Closures ---
    /// Operand: argument count.
    OpCall,
    /// Operands: method name constant, argument count.
    OpInvoke,
    OpSuperInvoke,
    /// Operands: function constant, then an (is_local, index) pair per upvalue.
    OpClosure,
    OpCloseUpvalue,
    OpReturn,

    OpAssert,
    OpExit,

    // --- Classes ---
    OpClass,
    OpInherit,
    OpMethod,
}

impl OpCode {
    const ALL: [OpCode; 42] = [
        OpCode::OpConstant,
        OpCode::OpConstantLong,
        OpCode::OpNil,
        OpCode::OpTrue,
        OpCode::OpFalse,
        OpCode::OpPop,
        OpCode::OpPopN,
        OpCode::OpDup,
        OpCode::OpGetLocal,
        OpCode::OpSetLocal,
        OpCode::OpGetGlobal,
        OpCode::OpDefineGlobal,
        OpCode::OpSetGlobal,
        OpCode::OpGetUpvalue,
        OpCode::OpSetUpvalue,
        OpCode::OpGetProperty,
        OpCode::OpSetProperty,
        OpCode::OpGetSuper,
        OpCode::OpEqual,
        OpCode::OpGreater,
        OpCode::OpLess,
        OpCode::OpAdd,
        OpCode::OpSubtract,
        OpCode::OpMultiply,
        OpCode::OpDivide,
        OpCode::OpNot,
        OpCode::OpNegate,
        OpCode::OpPrint,
        OpCode::OpJump,
        OpCode::OpJumpIfFalse,
        OpCode::OpLoop,
        OpCode::OpCall,
        OpCode::OpInvoke,
        OpCode::OpSuperInvoke,
        OpCode::OpClosure,
        OpCode::OpCloseUpvalue,
        OpCode::OpReturn,
        OpCode::OpAssert,
        OpCode::OpExit,
        OpCode::OpClass,
        OpCode::OpInherit,
        OpCode::OpMethod,
    ];
}

// Decoding is checked: the VM reports unknown bytes as a runtime error.
impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        OpCode::ALL.get(byte as usize).copied().ok_or(byte)
    }
}
