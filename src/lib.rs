pub mod ast;
pub mod builtins;
pub mod chunk;
pub mod compiler;
pub mod diagnostic;
pub mod session;
pub mod value;
pub mod vm;

// Compile a program into bytecode
pub use chunk::{Chunk, OpCode};
pub use compiler::compile;

// Run compiled bytecode
pub use vm::{run, Config, Environment, VM};

// Keep state between inputs
pub use session::Session;

pub use diagnostic::{Diagnostic, DiagnosticKind};
pub use value::Value;
