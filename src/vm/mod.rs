use thiserror::Error;

use crate::compiler::CompileError;

mod call_frame;
pub mod instruction;
pub mod value;
#[allow(clippy::module_inception)]
pub mod vm;

pub use call_frame::CallFrame;
pub use vm::VM;

pub type Result<T> = std::result::Result<T, VMError>;

#[derive(Debug, Error)]
pub enum VMError {
    #[error("Compile error")]
    CompileError(#[from] CompileError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Operand must be a number.")]
    OperandMustBeNumber,

    #[error("Operands must be numbers.")]
    OperandsMustBeNumbers,

    #[error("Operands must be two numbers or two strings.")]
    AddOperands,

    #[error("Undefined variable '{}'.", .0)]
    UndefinedVariable(String),

    #[error("Undefined property '{}'.", .0)]
    UndefinedProperty(String),

    #[error("Only instances have properties.")]
    OnlyInstancesHaveProperties,

    #[error("Only instances have fields.")]
    OnlyInstancesHaveFields,

    #[error("Only instances have methods.")]
    OnlyInstancesHaveMethods,

    #[error("Can only call closures and classes.")]
    NotCallable,

    #[error("Expected {expected} arguments but got {got}.")]
    ArityMismatch { expected: usize, got: usize },

    #[error("Stack overflow.")]
    StackOverflow,

    #[error("Superclass must be a class.")]
    SuperclassMustBeClass,

    #[error("Trying to access an empty stack.")]
    EmptyStack,

    #[error("Trying to access an empty list of call frames.")]
    NoCallFrame,

    #[error("Malformed bytecode.")]
    CorruptBytecode,
}
