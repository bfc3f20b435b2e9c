// src/vm/mod.rs

// Declare the modules within the `vm` crate.
pub mod chunk;
pub mod class;
pub mod closure;
pub mod compiler;
pub mod function;
pub mod natives;
pub mod opcode;
pub mod vm;

#[cfg(test)]
mod natives_test;

// Re-export the key structures and functions.
pub use chunk::Chunk;
pub use compiler::compile;
pub use function::Function;
pub use opcode::OpCode;
pub use vm::{CallFrame, Completion, Vm};
