//! Codec and program registries
//!
//! The codec registry maps a type tag to the decode function that rebuilds a
//! suspended routine from its encoded state; every routine the kernel might
//! persist needs an entry, and the built-in routines register themselves.
//! The program registry maps a program name to a constructor so spawns can
//! be expressed, and persisted, by name.

use crate::error::{SerializationError, TaskError};
use crate::routine::Routine;
use crate::value::Value;
use rustc_hash::FxHashMap;

/// A resolved spawn target
#[derive(Debug)]
pub enum Spawned {
    /// A suspendable computation to run as a task
    Routine(Box<dyn Routine>),
    /// A plain value: the "function" completed synchronously
    Value(Value),
}

type ProgramFn = Box<dyn Fn(&[Value]) -> Result<Spawned, TaskError>>;

/// Named spawnable programs
#[derive(Default)]
pub struct ProgramRegistry {
    programs: FxHashMap<String, ProgramFn>,
}

impl std::fmt::Debug for ProgramRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramRegistry")
            .field("programs", &self.programs.len())
            .finish()
    }
}

impl ProgramRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a program constructor under a name
    pub fn register(
        &mut self,
        name: impl Into<String>,
        constructor: impl Fn(&[Value]) -> Result<Spawned, TaskError> + 'static,
    ) {
        let name = name.into();
        if self.programs.insert(name.clone(), Box::new(constructor)).is_some() {
            tracing::warn!(%name, "program registration replaced an existing entry");
        }
    }

    /// Whether a program is registered under the name
    pub fn contains(&self, name: &str) -> bool {
        self.programs.contains_key(name)
    }

    /// Instantiate a program; unknown names are a task-level error
    pub fn spawn(&self, name: &str, args: &[Value]) -> Result<Spawned, TaskError> {
        let constructor = self
            .programs
            .get(name)
            .ok_or_else(|| TaskError::invalid(format!("Unknown program {name:?}")))?;
        constructor(args)
    }
}

type DecodeFn = Box<dyn Fn(&Value, &CodecRegistry) -> Result<Box<dyn Routine>, SerializationError>>;

/// Type-tag-indexed routine codecs
pub struct CodecRegistry {
    decoders: FxHashMap<String, DecodeFn>,
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("decoders", &self.decoders.len())
            .finish()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CodecRegistry {
    /// Create a registry with the built-in routine codecs installed
    pub fn new() -> Self {
        let mut registry = Self {
            decoders: FxHashMap::default(),
        };
        registry.register_standard_types();
        registry
    }

    fn register_standard_types(&mut self) {
        use crate::conn;
        use crate::process;
        use crate::routine;
        use crate::sync::channel;

        self.register(routine::IMMEDIATE_TAG, |state, _| {
            Ok(Box::new(routine::Immediate::decode(state)?) as Box<dyn Routine>)
        });
        self.register(routine::DELAY_TAG, |state, _| {
            Ok(Box::new(routine::Delay::decode(state)?) as Box<dyn Routine>)
        });
        self.register(routine::GROUP_TAG, |state, _| {
            Ok(Box::new(routine::GroupCarrier::decode(state)?) as Box<dyn Routine>)
        });
        self.register(channel::CHANNEL_CREATE_TAG, |state, _| {
            Ok(Box::new(channel::ChannelCreate::decode(state)?) as Box<dyn Routine>)
        });
        self.register(channel::CHANNEL_READ_TAG, |state, _| {
            Ok(Box::new(channel::ChannelRead::decode(state)?) as Box<dyn Routine>)
        });
        self.register(channel::CHANNEL_WRITE_TAG, |state, _| {
            Ok(Box::new(channel::ChannelWrite::decode(state)?) as Box<dyn Routine>)
        });
        self.register(channel::CHANNEL_CLOSE_TAG, |state, _| {
            Ok(Box::new(channel::ChannelClose::decode(state)?) as Box<dyn Routine>)
        });
        self.register(process::PROCESS_WAIT_TAG, |state, _| {
            Ok(Box::new(process::ProcessWait::decode(state)?) as Box<dyn Routine>)
        });
        self.register(conn::LISTEN_TAG, |state, _| {
            Ok(Box::new(conn::Listen::decode(state)?) as Box<dyn Routine>)
        });
        self.register(conn::CONNECT_TAG, |state, _| {
            Ok(Box::new(conn::Connect::decode(state)?) as Box<dyn Routine>)
        });
        self.register(conn::ACCEPT_TAG, |state, _| {
            Ok(Box::new(conn::Accept::decode(state)?) as Box<dyn Routine>)
        });
        self.register(conn::CONNECTION_CLOSE_TAG, |state, _| {
            Ok(Box::new(conn::ConnectionClose::decode(state)?) as Box<dyn Routine>)
        });
        self.register(conn::SOCKET_CLOSE_TAG, |state, _| {
            Ok(Box::new(conn::SocketClose::decode(state)?) as Box<dyn Routine>)
        });
    }

    /// Register a codec for a routine type tag
    pub fn register(
        &mut self,
        tag: impl Into<String>,
        decode: impl Fn(&Value, &CodecRegistry) -> Result<Box<dyn Routine>, SerializationError>
            + 'static,
    ) {
        let tag = tag.into();
        if self.decoders.insert(tag.clone(), Box::new(decode)).is_some() {
            tracing::warn!(%tag, "codec registration replaced an existing entry");
        }
    }

    /// Whether a codec is registered for the tag
    pub fn contains(&self, tag: &str) -> bool {
        self.decoders.contains_key(tag)
    }

    /// Rebuild a routine from its tagged encoded form
    ///
    /// Delegating codecs call this recursively to decode nested routines.
    pub fn decode_routine(&self, encoded: &Value) -> Result<Box<dyn Routine>, SerializationError> {
        let tag = encoded
            .field("@type")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                SerializationError::Malformed("routine entry has no type tag".to_string())
            })?;
        let state = encoded.field("state").ok_or_else(|| {
            SerializationError::Malformed(format!("routine entry {tag:?} has no state"))
        })?;
        let decode = self
            .decoders
            .get(tag)
            .ok_or_else(|| SerializationError::UnregisteredType(tag.to_string()))?;
        decode(state, self)
    }
}

/// Encode a routine into its tagged persisted form
///
/// Routines holding nested routines call this on them from `save_state`,
/// so delegation chains nest inside one heap entry.
pub fn encode_routine(routine: &dyn Routine) -> Result<Value, SerializationError> {
    let state = routine.save_state()?;
    Ok(Value::map([
        ("@type", Value::str(routine.type_tag())),
        ("state", state),
    ]))
}
