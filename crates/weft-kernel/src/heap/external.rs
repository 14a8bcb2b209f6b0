//! External references and missing-reference stand-ins
//!
//! The kernel persists references to host-owned objects by id plus a
//! snapshot of their known fields. On rehydration the host resolver is asked
//! for the object again; if it is gone, the cell becomes a stand-in that
//! serves only the previously known fields and raises a descriptive error
//! for anything else.

use crate::error::{TaskError, TaskErrorKind};
use crate::heap::Marks;
use crate::value::Value;
use std::collections::BTreeMap;

/// Host hook resolving an external id to the object's current fields
pub trait ExternalResolver {
    /// Return the object's fields, or `None` if it no longer exists
    fn resolve(&self, id: &str) -> Option<BTreeMap<String, Value>>;
}

/// Resolver for hosts without external objects; never resolves anything
#[derive(Debug, Default)]
pub struct NoopResolver;

impl ExternalResolver for NoopResolver {
    fn resolve(&self, _id: &str) -> Option<BTreeMap<String, Value>> {
        None
    }
}

/// A reference to a host-owned object
#[derive(Debug, Clone)]
pub struct ExternalCell {
    ext_id: String,
    fields: BTreeMap<String, Value>,
    available: bool,
}

impl ExternalCell {
    /// A cell backed by a live host object
    pub fn resolved(ext_id: impl Into<String>, fields: BTreeMap<String, Value>) -> Self {
        Self {
            ext_id: ext_id.into(),
            fields,
            available: true,
        }
    }

    /// The external id
    pub fn ext_id(&self) -> &str {
        &self.ext_id
    }

    /// Whether the host object was found at rehydration
    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Read a field
    ///
    /// Resolved cells treat absent fields as `Null`; stand-ins only serve
    /// what was known at save time and error on anything else.
    pub fn field(&self, name: &str) -> Result<Value, TaskError> {
        match self.fields.get(name) {
            Some(value) => Ok(value.clone()),
            None if self.available => Ok(Value::Null),
            None => Err(TaskError::new(
                TaskErrorKind::Unavailable,
                format!("{} is not available ({name})", self.ext_id),
            )),
        }
    }

    pub(crate) fn encode(&self) -> Value {
        Value::map([
            ("id", Value::str(self.ext_id.clone())),
            ("fields", Value::Map(self.fields.clone())),
        ])
    }

    pub(crate) fn decode(
        state: &Value,
        resolver: &dyn ExternalResolver,
    ) -> Result<Self, TaskError> {
        let ext_id = state
            .field("id")
            .and_then(Value::as_str)
            .ok_or_else(|| TaskError::invalid("Malformed external reference"))?
            .to_string();
        let known = state
            .field("fields")
            .and_then(Value::as_map)
            .cloned()
            .unwrap_or_default();
        match resolver.resolve(&ext_id) {
            Some(fields) => Ok(Self {
                ext_id,
                fields,
                available: true,
            }),
            None => Ok(Self {
                ext_id,
                fields: known,
                available: false,
            }),
        }
    }

    pub(crate) fn trace(&self, marks: &mut Marks) {
        for value in self.fields.values() {
            value.trace(marks);
        }
    }
}
