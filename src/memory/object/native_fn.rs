use std::fmt;

use super::{Gc, Object};
use crate::vm::value::Value;

/// Signature every native function implemented by the host must have.
pub type NativeFunction = fn(usize, &[Value]) -> Value;

/// A host function callable from the language.
#[derive(Clone)]
pub struct NativeFn {
    pub name: Gc<Object>,
    pub fun: NativeFunction,
}

impl NativeFn {
    pub fn new(name: Gc<Object>, fun: NativeFunction) -> Self {
        Self { name, fun }
    }

    pub fn function_name(&self) -> &str {
        self.name.as_string().as_str()
    }
}

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<native fn {}>", self.function_name())
    }
}

impl fmt::Display for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<native fn {}>", self.function_name())
    }
}
