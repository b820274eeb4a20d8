pub mod chunk;
#[allow(clippy::module_inception)]
pub mod compiler;
mod rle;
mod scanner;
mod token;
mod util;

use thiserror::Error;

use scanner::ScannerError;

pub use compiler::Compiler;

type Result<T> = std::result::Result<T, CompileError>;

#[derive(Debug, Clone, Error)]
pub enum CompileError {
    #[error("Number of compiler errors: {}", .0.len())]
    Aggregate(Vec<CompileError>),

    #[error(transparent)]
    Scanner(#[from] ScannerError),

    #[error("Error parsing number: {}", .0)]
    ParseFloat(#[from] std::num::ParseFloatError),

    #[error("Could not find token while parsing (should not happen)")]
    TokenNotFound,

    #[error("Parse rule could not be found (should not happen)")]
    ParseRuleNotFound,

    #[error("{message}")]
    Parse { message: &'static str, line: u64 },

    #[error("Too many local variables in function.")]
    TooManyLocals,

    #[error("Too many constants in one chunk.")]
    TooManyConstants,

    #[error("Too many closure variables in function.")]
    TooManyUpvalues,

    #[error("Can't have more than 255 parameters.")]
    TooManyParameters,

    #[error("Can't have more than 255 arguments.")]
    TooManyArguments,

    #[error("Too much code to jump over.")]
    JumpTooLarge,

    #[error("Loop body is too large.")]
    LoopTooLarge,

    #[error("Already a variable named '{}' in this scope.", .0)]
    DuplicateVariable(String),

    #[error("Can't read local variable in its own initializer.")]
    LocalInitializer,

    #[error("Invalid assignment target.")]
    InvalidAssignment,

    #[error("Can't use 'this' outside of a class.")]
    ThisOutsideClass,

    #[error("Can't use 'super' outside of a class.")]
    SuperOutsideClass,

    #[error("Can't use 'super' in a class with no superclass.")]
    SuperWithoutSuperclass,

    #[error("Can't return from top-level code.")]
    ReturnAtTopLevel,

    #[error("Can't return a value from an initializer.")]
    ReturnFromInitializer,

    #[error("A class can't inherit from itself.")]
    SelfInheritance,

    #[error("String exceeds length limits.")]
    StringTooLong,
}
