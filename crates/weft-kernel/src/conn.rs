//! Connections: named endpoints over channels
//!
//! A socket is a named endpoint with an incoming channel of connections; a
//! connection is a pair of channels, one per direction. Both are plain value
//! maps of channel handles, so they pass between tasks and persist without
//! any dedicated machinery. The write side of every connection end is tied
//! to its owning process's exit cleanup, so a dying process hangs up.

use crate::effect::{call_routine, Effect};
use crate::error::{SerializationError, TaskError};
use crate::heap::Marks;
use crate::routine::{Resume, Routine, Step};
use crate::scheduler::EffectContext;
use crate::sync::{ChannelId, OverflowPolicy};
use crate::value::Value;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Named listening endpoints
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EndpointTable {
    endpoints: FxHashMap<String, ChannelId>,
}

impl EndpointTable {
    /// The incoming channel bound to an address
    pub fn lookup(&self, address: &str) -> Option<ChannelId> {
        self.endpoints.get(address).copied()
    }

    /// Bind an address to an incoming channel
    pub(crate) fn bind(&mut self, address: String, incoming: ChannelId) {
        self.endpoints.insert(address, incoming);
    }

    /// Release an address
    pub(crate) fn unbind(&mut self, address: &str) {
        self.endpoints.remove(address);
    }

    /// Number of bound addresses
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Whether no address is bound
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub(crate) fn trace(&self, marks: &mut Marks) {
        for chan in self.endpoints.values() {
            marks.channel(*chan);
        }
    }
}

fn socket_value(address: &str, incoming: ChannelId) -> Value {
    Value::map([
        ("address", Value::str(address)),
        ("incoming", Value::Channel(incoming)),
    ])
}

fn connection_value(read: ChannelId, write: ChannelId) -> Value {
    Value::map([
        ("read", Value::Channel(read)),
        ("write", Value::Channel(write)),
    ])
}

/// Pull the address and incoming channel out of a socket value
pub fn socket_parts(socket: &Value) -> Result<(String, ChannelId), TaskError> {
    let address = socket
        .field("address")
        .and_then(Value::as_str)
        .ok_or_else(|| TaskError::invalid("Not a socket"))?
        .to_string();
    let incoming = socket
        .field("incoming")
        .and_then(Value::as_channel)
        .ok_or_else(|| TaskError::invalid("Not a socket"))?;
    Ok((address, incoming))
}

/// Pull the read and write channels out of a connection value
pub fn connection_parts(conn: &Value) -> Result<(ChannelId, ChannelId), TaskError> {
    let read = conn
        .field("read")
        .and_then(Value::as_channel)
        .ok_or_else(|| TaskError::invalid("Not a connection"))?;
    let write = conn
        .field("write")
        .and_then(Value::as_channel)
        .ok_or_else(|| TaskError::invalid("Not a connection"))?;
    Ok((read, write))
}

/// Whether both directions of a connection still accept traffic
pub fn connection_is_open(ctx: &EffectContext<'_>, conn: &Value) -> Result<bool, TaskError> {
    let (read, write) = connection_parts(conn)?;
    Ok(ctx.channel_is_open(read) && ctx.channel_is_open(write))
}

/// Bind an address and resume with a socket value
pub fn listen(address: impl Into<String>) -> Effect {
    call_routine(Box::new(Listen {
        address: address.into(),
    }))
}

/// Connect to a listening address and resume with a connection value
pub fn connect(address: impl Into<String>) -> Effect {
    call_routine(Box::new(Connect {
        address: address.into(),
        local: None,
        awaiting: false,
    }))
}

/// Accept the next peer connection on a socket
pub fn accept(socket: Value) -> Effect {
    call_routine(Box::new(Accept {
        socket,
        awaiting: false,
    }))
}

/// Read the next value from a connection
pub fn connection_read(conn: &Value) -> Result<Effect, TaskError> {
    let (read, _) = connection_parts(conn)?;
    Ok(crate::sync::read(read))
}

/// Write a value to a connection
pub fn connection_write(conn: &Value, value: impl Into<Value>) -> Result<Effect, TaskError> {
    let (_, write) = connection_parts(conn)?;
    Ok(crate::sync::write(write, value))
}

/// Close both directions of a connection
pub fn connection_close(conn: Value) -> Effect {
    call_routine(Box::new(ConnectionClose { conn }))
}

/// Unbind a socket's address and close its incoming channel
pub fn socket_close(socket: Value) -> Effect {
    call_routine(Box::new(SocketClose { socket }))
}

/// Type tag for [`Listen`]
pub const LISTEN_TAG: &str = "@conn.listen";
/// Type tag for [`Connect`]
pub const CONNECT_TAG: &str = "@conn.connect";
/// Type tag for [`Accept`]
pub const ACCEPT_TAG: &str = "@conn.accept";
/// Type tag for [`ConnectionClose`]
pub const CONNECTION_CLOSE_TAG: &str = "@conn.close";
/// Type tag for [`SocketClose`]
pub const SOCKET_CLOSE_TAG: &str = "@sock.close";

/// Built-in routine behind [`listen`]
#[derive(Debug)]
pub struct Listen {
    address: String,
}

impl Listen {
    pub(crate) fn decode(state: &Value) -> Result<Self, SerializationError> {
        let address = state
            .field("address")
            .and_then(Value::as_str)
            .ok_or_else(|| SerializationError::Malformed("listen state".to_string()))?
            .to_string();
        Ok(Self { address })
    }
}

impl Routine for Listen {
    fn resume(
        &mut self,
        ctx: &mut EffectContext<'_>,
        input: Resume,
    ) -> Result<Step, TaskError> {
        input.into_result()?;
        if let Some(existing) = ctx.endpoint_table().lookup(&self.address) {
            if ctx.channel_is_open(existing) {
                return Err(TaskError::user("Address already in use"));
            }
        }
        let incoming = ctx.channel_create(1, OverflowPolicy::Block);
        ctx.endpoint_table().bind(self.address.clone(), incoming);
        ctx.channel_close_on_exit(incoming)?;
        Ok(Step::Done(socket_value(&self.address, incoming)))
    }

    fn type_tag(&self) -> &'static str {
        LISTEN_TAG
    }

    fn save_state(&self) -> Result<Value, SerializationError> {
        Ok(Value::map([("address", Value::str(self.address.clone()))]))
    }
}

/// Built-in routine behind [`connect`]
#[derive(Debug)]
pub struct Connect {
    address: String,
    local: Option<Value>,
    awaiting: bool,
}

impl Connect {
    pub(crate) fn decode(state: &Value) -> Result<Self, SerializationError> {
        let address = state
            .field("address")
            .and_then(Value::as_str)
            .ok_or_else(|| SerializationError::Malformed("connect state".to_string()))?
            .to_string();
        Ok(Self {
            address,
            local: state.field("local").cloned().filter(|v| *v != Value::Null),
            awaiting: state
                .field("awaiting")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }
}

impl Routine for Connect {
    fn resume(
        &mut self,
        ctx: &mut EffectContext<'_>,
        input: Resume,
    ) -> Result<Step, TaskError> {
        input.into_result()?;
        if self.awaiting {
            return Ok(Step::Done(self.local.take().unwrap_or(Value::Null)));
        }

        let incoming = ctx.endpoint_table().lookup(&self.address);
        let incoming = match incoming {
            Some(chan) if ctx.channel_is_open(chan) => chan,
            _ => return Err(TaskError::user("Connection refused")),
        };

        let read = ctx.channel_create(1, OverflowPolicy::Block);
        let write = ctx.channel_create(1, OverflowPolicy::Block);
        ctx.channel_close_on_exit(write)?;

        self.local = Some(connection_value(read, write));
        // The peer sees the two directions reversed.
        let remote = connection_value(write, read);
        self.awaiting = true;
        Ok(Step::Yield(crate::sync::write(incoming, remote)))
    }

    fn type_tag(&self) -> &'static str {
        CONNECT_TAG
    }

    fn save_state(&self) -> Result<Value, SerializationError> {
        Ok(Value::map([
            ("address", Value::str(self.address.clone())),
            ("local", self.local.clone().unwrap_or(Value::Null)),
            ("awaiting", Value::Bool(self.awaiting)),
        ]))
    }
}

/// Built-in routine behind [`accept`]
#[derive(Debug)]
pub struct Accept {
    socket: Value,
    awaiting: bool,
}

impl Accept {
    pub(crate) fn decode(state: &Value) -> Result<Self, SerializationError> {
        let socket = state
            .field("socket")
            .cloned()
            .ok_or_else(|| SerializationError::Malformed("accept state".to_string()))?;
        Ok(Self {
            socket,
            awaiting: state
                .field("awaiting")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }
}

impl Routine for Accept {
    fn resume(
        &mut self,
        ctx: &mut EffectContext<'_>,
        input: Resume,
    ) -> Result<Step, TaskError> {
        if !self.awaiting {
            input.into_result()?;
            let (_, incoming) = socket_parts(&self.socket)?;
            self.awaiting = true;
            return Ok(Step::Yield(crate::sync::read(incoming)));
        }
        let conn = input.into_result()?;
        let (_, write) = connection_parts(&conn)?;
        ctx.channel_close_on_exit(write)?;
        Ok(Step::Done(conn))
    }

    fn type_tag(&self) -> &'static str {
        ACCEPT_TAG
    }

    fn save_state(&self) -> Result<Value, SerializationError> {
        Ok(Value::map([
            ("socket", self.socket.clone()),
            ("awaiting", Value::Bool(self.awaiting)),
        ]))
    }
}

/// Built-in routine behind [`connection_close`]
#[derive(Debug)]
pub struct ConnectionClose {
    conn: Value,
}

impl ConnectionClose {
    pub(crate) fn decode(state: &Value) -> Result<Self, SerializationError> {
        let conn = state
            .field("conn")
            .cloned()
            .ok_or_else(|| SerializationError::Malformed("connection close state".to_string()))?;
        Ok(Self { conn })
    }
}

impl Routine for ConnectionClose {
    fn resume(
        &mut self,
        ctx: &mut EffectContext<'_>,
        input: Resume,
    ) -> Result<Step, TaskError> {
        input.into_result()?;
        let (read, write) = connection_parts(&self.conn)?;
        ctx.channel_close(write)?;
        ctx.channel_close(read)?;
        Ok(Step::Done(Value::Null))
    }

    fn type_tag(&self) -> &'static str {
        CONNECTION_CLOSE_TAG
    }

    fn save_state(&self) -> Result<Value, SerializationError> {
        Ok(Value::map([("conn", self.conn.clone())]))
    }
}

/// Built-in routine behind [`socket_close`]
#[derive(Debug)]
pub struct SocketClose {
    socket: Value,
}

impl SocketClose {
    pub(crate) fn decode(state: &Value) -> Result<Self, SerializationError> {
        let socket = state
            .field("socket")
            .cloned()
            .ok_or_else(|| SerializationError::Malformed("socket close state".to_string()))?;
        Ok(Self { socket })
    }
}

impl Routine for SocketClose {
    fn resume(
        &mut self,
        ctx: &mut EffectContext<'_>,
        input: Resume,
    ) -> Result<Step, TaskError> {
        input.into_result()?;
        let (address, incoming) = socket_parts(&self.socket)?;
        ctx.endpoint_table().unbind(&address);
        ctx.channel_close(incoming)?;
        Ok(Step::Done(Value::Null))
    }

    fn type_tag(&self) -> &'static str {
        SOCKET_CLOSE_TAG
    }

    fn save_state(&self) -> Result<Value, SerializationError> {
        Ok(Value::map([("socket", self.socket.clone())]))
    }
}
