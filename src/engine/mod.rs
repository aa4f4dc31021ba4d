pub mod builtins;
pub mod interpreter;
pub mod parser;
pub mod value;

use thiserror::Error;

use crate::intrinsics::FuzzOutput;

pub use interpreter::Interpreter;

/// A script-level failure. These end one iteration, never the harness.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error("SyntaxError: {0}")]
    Syntax(String),
    #[error("Uncaught {0}")]
    Uncaught(String),
}

/// What the harness hands every fresh engine instance.
#[derive(Clone)]
pub struct HostContext {
    pub output: FuzzOutput,
}

/// The interpreter the harness drives. Dropping the engine tears it down;
/// nothing may survive into the next instance.
pub trait ScriptEngine: Sized {
    type Program;

    /// Build a fresh instance with the fuzzing intrinsics and host bindings
    /// installed in its global scope.
    fn init(host: HostContext) -> Self;
    fn parse(&mut self, source: &str) -> Result<Self::Program, ScriptError>;
    fn run(&mut self, program: Self::Program) -> Result<(), ScriptError>;
    /// Run queued jobs until the queue is empty or one of them throws.
    fn drain_jobs(&mut self) -> Result<(), ScriptError>;
}
