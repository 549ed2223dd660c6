//! Result rows handed back by a [`crate::Connection`].

use crate::value::Value;
use std::sync::Arc;

/// One selected row: column labels paired positionally with their values.
///
/// Labels are reference counted so a driver can build every row of a result
/// set from the same header.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    /// Build a row from its column labels and values.
    pub fn new(columns: impl Into<Arc<[String]>>, values: Vec<Value>) -> Self {
        Self {
            columns: columns.into(),
            values,
        }
    }

    /// Column labels in select order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value at a select-list position.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Value of the column labelled `name`, matched case-insensitively.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        let index = self
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))?;
        self.values.get(index)
    }

    /// Value of `name`, or NULL when the driver did not return that column.
    pub fn value_or_null(&self, name: &str) -> Value {
        self.get_by_name(name).cloned().unwrap_or(Value::Null)
    }
}
