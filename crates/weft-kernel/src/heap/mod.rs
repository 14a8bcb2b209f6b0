//! Persistent object store
//!
//! The heap holds everything open-ended the kernel must persist: shared and
//! cyclic user data, error values, external references, and the encoded
//! state of suspended routines. It is split into a frozen partition
//! (undecoded entries carried over from the last load or save) and a live
//! partition (rehydrated cells); an entry moves from frozen to live at most
//! once, on first access, so per-tick decode cost is bounded by the touched
//! subgraph.
//!
//! Shared identity and cycles are expressed through [`ObjectId`] references
//! alone: a cell's value never embeds another cell, it points at it, so
//! encoding never recurses and reference identity survives a round trip by
//! construction. Collection is reachability-from-root at save time: ids the
//! mark pass does not reach are simply not written, and nothing else is ever
//! freed.

mod blob;
mod external;
mod registry;

pub use blob::{open, seal, SnapshotChecksum, SnapshotHeader, SNAPSHOT_MAGIC, SNAPSHOT_VERSION};
pub use external::{ExternalCell, ExternalResolver, NoopResolver};
pub use registry::{encode_routine, CodecRegistry, ProgramRegistry, Spawned};

use crate::error::{SerializationError, TaskError, TaskErrorKind};
use crate::process::ProcessId;
use crate::scheduler::TaskId;
use crate::sync::{ChannelId, SemaphoreId};
use crate::value::Value;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unique identifier for a heap object
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ObjectId(u64);

impl ObjectId {
    /// The numeric id value
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Rebuild an id from its numeric value
    pub fn from_u64(id: u64) -> Self {
        Self(id)
    }
}

/// Type tag of plain data cells
pub const DATA_TAG: &str = "@data";
/// Type tag of error cells
pub const ERROR_TAG: &str = "@err";
/// Type tag of external-reference cells
pub const EXTERNAL_TAG: &str = "@ext";

/// A rehydrated heap object
#[derive(Debug, Clone)]
pub enum HeapCell {
    /// Plain shared data; may reference other cells, including itself
    Data(Value),
    /// An error value
    Error(TaskError),
    /// A reference to a host-owned object, resolved or standing in
    External(ExternalCell),
}

impl HeapCell {
    fn trace(&self, marks: &mut Marks) {
        match self {
            HeapCell::Data(value) => value.trace(marks),
            HeapCell::Error(err) => {
                for value in err.fields.values() {
                    value.trace(marks);
                }
            }
            HeapCell::External(cell) => cell.trace(marks),
        }
    }
}

/// Reachability accumulator for the save-time mark pass
#[derive(Default)]
pub struct Marks {
    /// Reachable heap objects
    pub objects: FxHashSet<ObjectId>,
    /// Reachable task handles (retains finished-task outcomes)
    pub tasks: FxHashSet<TaskId>,
    /// Reachable semaphores
    pub semaphores: FxHashSet<SemaphoreId>,
    /// Reachable channels
    pub channels: FxHashSet<ChannelId>,
    /// Reachable process handles (retains finished-process records)
    pub processes: FxHashSet<ProcessId>,
    pending: Vec<RootRef>,
}

/// A reference whose outgoing edges still need expanding
#[derive(Debug, Copy, Clone)]
pub(crate) enum RootRef {
    /// A heap object
    Object(ObjectId),
    /// A task (finished outcomes carry values)
    Task(TaskId),
    /// A channel (two semaphores plus buffered values)
    Channel(ChannelId),
    /// A process (finished records carry an outcome)
    Process(ProcessId),
}

impl Marks {
    /// Mark a heap object
    pub fn object(&mut self, id: ObjectId) {
        if self.objects.insert(id) {
            self.pending.push(RootRef::Object(id));
        }
    }

    /// Mark a task handle
    pub fn task(&mut self, id: TaskId) {
        if self.tasks.insert(id) {
            self.pending.push(RootRef::Task(id));
        }
    }

    /// Mark a semaphore
    pub fn semaphore(&mut self, id: SemaphoreId) {
        self.semaphores.insert(id);
    }

    /// Mark a channel
    pub fn channel(&mut self, id: ChannelId) {
        if self.channels.insert(id) {
            self.pending.push(RootRef::Channel(id));
        }
    }

    /// Mark a process handle
    pub fn process(&mut self, id: ProcessId) {
        if self.processes.insert(id) {
            self.pending.push(RootRef::Process(id));
        }
    }

    pub(crate) fn pop(&mut self) -> Option<RootRef> {
        self.pending.pop()
    }
}

/// The persistent object store
pub struct Heap {
    /// Undecoded entries, keyed by id
    frozen: FxHashMap<ObjectId, Value>,
    /// Rehydrated cells
    live: FxHashMap<ObjectId, HeapCell>,
    next_id: u64,
    resolver: Box<dyn ExternalResolver>,
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("frozen", &self.frozen.len())
            .field("live", &self.live.len())
            .finish()
    }
}

impl Heap {
    /// Create an empty heap resolving external references through `resolver`
    pub fn new(resolver: Box<dyn ExternalResolver>) -> Self {
        Self {
            frozen: FxHashMap::default(),
            live: FxHashMap::default(),
            next_id: 0,
            resolver,
        }
    }

    /// Number of entries across both partitions
    pub fn len(&self) -> usize {
        self.frozen.len() + self.live.len()
    }

    /// Whether the heap holds no entries
    pub fn is_empty(&self) -> bool {
        self.frozen.is_empty() && self.live.is_empty()
    }

    /// Assign the lowest id not used by either partition
    pub(crate) fn reserve_id(&mut self) -> ObjectId {
        while self.frozen.contains_key(&ObjectId(self.next_id))
            || self.live.contains_key(&ObjectId(self.next_id))
        {
            self.next_id += 1;
        }
        let id = ObjectId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Allocate a shared data cell
    pub fn alloc_data(&mut self, value: Value) -> ObjectId {
        let id = self.reserve_id();
        self.live.insert(id, HeapCell::Data(value));
        id
    }

    /// Allocate an error cell
    pub fn alloc_error(&mut self, err: TaskError) -> ObjectId {
        let id = self.reserve_id();
        self.live.insert(id, HeapCell::Error(err));
        id
    }

    /// Allocate a resolved external-reference cell
    pub fn alloc_external(
        &mut self,
        ext_id: impl Into<String>,
        fields: BTreeMap<String, Value>,
    ) -> ObjectId {
        let id = self.reserve_id();
        self.live
            .insert(id, HeapCell::External(ExternalCell::resolved(ext_id, fields)));
        id
    }

    /// Rehydrate (if needed) and return a cell
    pub fn cell(&mut self, id: ObjectId) -> Result<&HeapCell, TaskError> {
        if !self.live.contains_key(&id) {
            let encoded = self
                .frozen
                .get(&id)
                .ok_or_else(|| {
                    TaskError::invalid(format!("Invalid heap reference {}", id.as_u64()))
                })?
                .clone();
            let cell = self.decode_cell(&encoded)?;
            self.live.insert(id, cell);
        }
        Ok(&self.live[&id])
    }

    /// Read a data cell's value
    pub fn data(&mut self, id: ObjectId) -> Result<&Value, TaskError> {
        self.cell(id)?;
        match self.live.get(&id) {
            Some(HeapCell::Data(value)) => Ok(value),
            _ => Err(TaskError::invalid(format!(
                "Heap object {} is not a data cell",
                id.as_u64()
            ))),
        }
    }

    /// Overwrite a data cell's value
    pub fn set_data(&mut self, id: ObjectId, value: Value) -> Result<(), TaskError> {
        self.data(id)?;
        self.live.insert(id, HeapCell::Data(value));
        Ok(())
    }

    /// Read one field of a data cell holding a map
    pub fn data_field(&mut self, id: ObjectId, key: &str) -> Result<Value, TaskError> {
        Ok(self.data(id)?.field(key).cloned().unwrap_or(Value::Null))
    }

    /// Update one field of a data cell holding a map
    pub fn set_data_field(
        &mut self,
        id: ObjectId,
        key: impl Into<String>,
        value: Value,
    ) -> Result<(), TaskError> {
        let mut current = self.data(id)?.clone();
        match &mut current {
            Value::Map(entries) => {
                entries.insert(key.into(), value);
            }
            _ => {
                return Err(TaskError::invalid(format!(
                    "Heap object {} is not a map cell",
                    id.as_u64()
                )))
            }
        }
        self.live.insert(id, HeapCell::Data(current));
        Ok(())
    }

    /// Read an error cell
    pub fn error(&mut self, id: ObjectId) -> Result<&TaskError, TaskError> {
        self.cell(id)?;
        match self.live.get(&id) {
            Some(HeapCell::Error(err)) => Ok(err),
            _ => Err(TaskError::invalid(format!(
                "Heap object {} is not an error cell",
                id.as_u64()
            ))),
        }
    }

    /// Read a field of an external reference; absent fields on a missing
    /// stand-in raise an unavailable-reference error
    pub fn external_field(&mut self, id: ObjectId, field: &str) -> Result<Value, TaskError> {
        match self.cell(id)? {
            HeapCell::External(cell) => cell.field(field),
            _ => Err(TaskError::invalid(format!(
                "Heap object {} is not an external reference",
                id.as_u64()
            ))),
        }
    }

    /// Whether the object is a real resolved reference rather than a
    /// missing-reference stand-in; non-external cells are always real
    pub fn is_available(&mut self, id: ObjectId) -> Result<bool, TaskError> {
        match self.cell(id)? {
            HeapCell::External(cell) => Ok(cell.is_available()),
            _ => Ok(true),
        }
    }

    /// An undecoded frozen entry
    pub(crate) fn frozen_entry(&self, id: ObjectId) -> Option<&Value> {
        self.frozen.get(&id)
    }

    /// Store an encoded entry into the frozen partition (routine freezing)
    pub(crate) fn store_frozen(&mut self, id: ObjectId, encoded: Value) {
        self.frozen.insert(id, encoded);
    }

    /// Trace the outgoing references of an entry, live or frozen
    pub(crate) fn trace_entry(&self, id: ObjectId, marks: &mut Marks) {
        if let Some(cell) = self.live.get(&id) {
            cell.trace(marks);
        } else if let Some(encoded) = self.frozen.get(&id) {
            encoded.trace(marks);
        }
    }

    /// Drop unreachable entries and export the reachable ones in encoded form
    pub(crate) fn sweep_export(&mut self, marks: &Marks) -> BTreeMap<u64, Value> {
        self.live.retain(|id, _| marks.objects.contains(id));
        self.frozen.retain(|id, _| marks.objects.contains(id));

        let mut out = BTreeMap::new();
        for id in &marks.objects {
            if let Some(cell) = self.live.get(id) {
                out.insert(id.as_u64(), encode_cell(cell));
            } else if let Some(encoded) = self.frozen.get(id) {
                out.insert(id.as_u64(), encoded.clone());
            } else {
                tracing::warn!(object = id.as_u64(), "dangling heap reference dropped at save");
            }
        }
        out
    }

    /// Install the frozen partition from a loaded snapshot
    pub(crate) fn import_frozen(&mut self, objects: BTreeMap<u64, Value>) {
        self.frozen = objects
            .into_iter()
            .map(|(id, value)| (ObjectId(id), value))
            .collect();
        self.live.clear();
        self.next_id = 0;
    }

    /// Check that every frozen entry carries a known type tag
    ///
    /// Runs eagerly at load so an unregistered type fails the whole restore;
    /// field decoding stays lazy.
    pub(crate) fn validate_tags(&self, codecs: &CodecRegistry) -> Result<(), SerializationError> {
        for (id, encoded) in &self.frozen {
            let tag = encoded.field("@type").and_then(Value::as_str).ok_or_else(|| {
                SerializationError::Malformed(format!("heap entry {} has no type tag", id.as_u64()))
            })?;
            let known = matches!(tag, DATA_TAG | ERROR_TAG | EXTERNAL_TAG) || codecs.contains(tag);
            if !known {
                return Err(SerializationError::UnregisteredType(tag.to_string()));
            }
        }
        Ok(())
    }

    fn decode_cell(&self, encoded: &Value) -> Result<HeapCell, TaskError> {
        let tag = encoded
            .field("@type")
            .and_then(Value::as_str)
            .ok_or_else(|| TaskError::invalid("Heap entry has no type tag"))?;
        let state = encoded
            .field("state")
            .ok_or_else(|| TaskError::invalid("Heap entry has no state"))?;
        match tag {
            DATA_TAG => Ok(HeapCell::Data(state.clone())),
            ERROR_TAG => Ok(HeapCell::Error(value_to_error(state)?)),
            EXTERNAL_TAG => Ok(HeapCell::External(ExternalCell::decode(
                state,
                self.resolver.as_ref(),
            )?)),
            other => Err(TaskError::invalid(format!(
                "Heap entry tagged {other:?} is not a data cell"
            ))),
        }
    }
}

/// Encode a live cell into its tagged persisted form
pub(crate) fn encode_cell(cell: &HeapCell) -> Value {
    let (tag, state) = match cell {
        HeapCell::Data(value) => (DATA_TAG, value.clone()),
        HeapCell::Error(err) => (ERROR_TAG, error_to_value(err)),
        HeapCell::External(cell) => (EXTERNAL_TAG, cell.encode()),
    };
    Value::map([("@type", Value::str(tag)), ("state", state)])
}

fn kind_name(kind: TaskErrorKind) -> &'static str {
    match kind {
        TaskErrorKind::User => "user",
        TaskErrorKind::Canceled => "canceled",
        TaskErrorKind::SemaphoreDestroyed => "semaphore-destroyed",
        TaskErrorKind::ChannelClosed => "channel-closed",
        TaskErrorKind::Invalid => "invalid",
        TaskErrorKind::Unavailable => "unavailable",
        TaskErrorKind::Serialization => "serialization",
    }
}

fn kind_from_name(name: &str) -> Option<TaskErrorKind> {
    Some(match name {
        "user" => TaskErrorKind::User,
        "canceled" => TaskErrorKind::Canceled,
        "semaphore-destroyed" => TaskErrorKind::SemaphoreDestroyed,
        "channel-closed" => TaskErrorKind::ChannelClosed,
        "invalid" => TaskErrorKind::Invalid,
        "unavailable" => TaskErrorKind::Unavailable,
        "serialization" => TaskErrorKind::Serialization,
        _ => return None,
    })
}

fn error_to_value(err: &TaskError) -> Value {
    Value::map([
        ("kind", Value::str(kind_name(err.kind))),
        ("message", Value::str(err.message.clone())),
        (
            "trace",
            Value::List(err.trace.iter().map(|t| Value::str(t.clone())).collect()),
        ),
        ("fields", Value::Map(err.fields.clone())),
    ])
}

fn value_to_error(state: &Value) -> Result<TaskError, TaskError> {
    let kind = state
        .field("kind")
        .and_then(Value::as_str)
        .and_then(kind_from_name)
        .ok_or_else(|| TaskError::invalid("Malformed error cell"))?;
    let message = state
        .field("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let trace = state
        .field("trace")
        .and_then(Value::as_list)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let fields = state
        .field("fields")
        .and_then(Value::as_map)
        .cloned()
        .unwrap_or_default();
    Ok(TaskError {
        kind,
        message,
        trace,
        fields,
    })
}
