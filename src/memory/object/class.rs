use std::fmt;

use super::{Gc, Object};
use crate::memory::table::Table;

/// A class declaration: its name and method table. Methods are keyed by
/// interned name and hold closure values.
#[derive(Debug, Clone)]
pub struct Class {
    pub name: Gc<Object>,
    pub methods: Table,
}

impl Class {
    pub fn new(name: Gc<Object>) -> Self {
        Self {
            name,
            methods: Table::new(),
        }
    }
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<class {}>", self.name.as_string())
    }
}
