//! Dynamic value model
//!
//! [`Value`] is the currency of the kernel: task arguments, resume inputs,
//! results, channel payloads, and persisted object fields are all values.
//! Identity-bearing data (anything shared or cyclic) never lives inline;
//! it lives in the heap and is referenced by [`Value::Ref`], so a value tree
//! itself is always finite and cheap to clone.

use crate::heap::{Marks, ObjectId};
use crate::process::ProcessId;
use crate::scheduler::TaskId;
use crate::sync::{ChannelId, SemaphoreId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A dynamic kernel value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Absent / unit value
    Null,
    /// Boolean
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Floating point number
    Float(f64),
    /// UTF-8 string
    Str(String),
    /// Ordered sequence
    List(Vec<Value>),
    /// String-keyed map
    Map(BTreeMap<String, Value>),
    /// Reference to a heap object
    Ref(ObjectId),
    /// Task handle
    Task(TaskId),
    /// Semaphore handle
    Semaphore(SemaphoreId),
    /// Channel handle
    Channel(ChannelId),
    /// Process handle
    Process(ProcessId),
}

impl Value {
    /// Build a string value
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    /// Build a map value from key/value pairs
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// The boolean payload, if this is a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The integer payload, if this is an integer
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// The string payload, if this is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The list payload, if this is a list
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// The map payload, if this is a map
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// The heap reference, if this is a reference
    pub fn as_ref_id(&self) -> Option<ObjectId> {
        match self {
            Value::Ref(id) => Some(*id),
            _ => None,
        }
    }

    /// The task handle, if this is one
    pub fn as_task(&self) -> Option<TaskId> {
        match self {
            Value::Task(id) => Some(*id),
            _ => None,
        }
    }

    /// The semaphore handle, if this is one
    pub fn as_semaphore(&self) -> Option<SemaphoreId> {
        match self {
            Value::Semaphore(id) => Some(*id),
            _ => None,
        }
    }

    /// The channel handle, if this is one
    pub fn as_channel(&self) -> Option<ChannelId> {
        match self {
            Value::Channel(id) => Some(*id),
            _ => None,
        }
    }

    /// The process handle, if this is one
    pub fn as_process(&self) -> Option<ProcessId> {
        match self {
            Value::Process(id) => Some(*id),
            _ => None,
        }
    }

    /// Look up a map field, treating non-maps and absent keys as `None`
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Mark every handle reachable from this value tree
    pub fn trace(&self, marks: &mut Marks) {
        match self {
            Value::Null | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Str(_) => {}
            Value::List(items) => {
                for item in items {
                    item.trace(marks);
                }
            }
            Value::Map(entries) => {
                for value in entries.values() {
                    value.trace(marks);
                }
            }
            Value::Ref(id) => marks.object(*id),
            Value::Task(id) => marks.task(*id),
            Value::Semaphore(id) => marks.semaphore(*id),
            Value::Channel(id) => marks.channel(*id),
            Value::Process(id) => marks.process(*id),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}
