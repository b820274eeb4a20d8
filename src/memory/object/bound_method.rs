use std::fmt;

use super::{Gc, Object};
use crate::vm::value::Value;

/// A method closure paired with the receiver it was accessed through.
/// Produced whenever a method is read as a value instead of invoked.
#[derive(Debug, Clone)]
pub struct BoundMethod {
    pub receiver: Value,
    pub method: Gc<Object>,
}

impl BoundMethod {
    pub fn new(receiver: Value, method: Gc<Object>) -> Self {
        Self { receiver, method }
    }

    pub fn method_name(&self) -> &str {
        self.method.as_closure().function.as_function().function_name()
    }
}

impl fmt::Display for BoundMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<fn {}>", self.method_name())
    }
}
