use super::{Gc, Object};

/// Runtime pairing of a function with the upvalues it captured. Several
/// closures may share one function while capturing different variables.
#[derive(Debug, Clone)]
pub struct Closure {
    pub function: Gc<Object>,
    pub upvalues: Vec<Gc<Object>>,
    pub upvalue_count: usize,
}

impl Closure {
    pub fn new(function: Gc<Object>) -> Self {
        let upvalue_count = function.as_function().upvalue_count;
        Self {
            function,
            upvalues: Vec::with_capacity(upvalue_count),
            upvalue_count,
        }
    }
}
