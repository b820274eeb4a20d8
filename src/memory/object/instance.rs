use std::fmt;

use super::{Gc, Object};
use crate::memory::table::Table;

/// An instance of a class, with its own field table.
#[derive(Debug, Clone)]
pub struct Instance {
    pub class: Gc<Object>,
    pub fields: Table,
}

impl Instance {
    pub fn new(class: Gc<Object>) -> Self {
        Self {
            class,
            fields: Table::new(),
        }
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<instance of {}>", self.class.as_class().name.as_string())
    }
}
