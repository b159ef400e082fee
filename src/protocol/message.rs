//! Message variants exchanged between clients and the broker.
//!
//! Every variant except `KeepAlive` carries a [`Header`]. The set of variants
//! is closed; the codec maps each [`CommandType`] tag to exactly one of them.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Command tag written at the start of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    Disconnect,
    Unknown,
    SendMessage,
    Subscribe,
    Announce,
    Acknowledge,
    KeepAlive,
}

impl CommandType {
    pub const fn tag(self) -> i32 {
        match self {
            CommandType::Disconnect => -1,
            CommandType::Unknown => 0,
            CommandType::SendMessage => 1,
            CommandType::Subscribe => 2,
            CommandType::Announce => 3,
            CommandType::Acknowledge => 4,
            CommandType::KeepAlive => 65536,
        }
    }

    pub fn from_tag(tag: i32) -> Option<Self> {
        let command = match tag {
            -1 => CommandType::Disconnect,
            0 => CommandType::Unknown,
            1 => CommandType::SendMessage,
            2 => CommandType::Subscribe,
            3 => CommandType::Announce,
            4 => CommandType::Acknowledge,
            65536 => CommandType::KeepAlive,
            _ => return None,
        };
        Some(command)
    }
}

/// Durability of a subscription. `Remove` is only ever a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscribeMode {
    TemporaryConsumer,
    PermanentConsumer,
    Remove,
}

impl SubscribeMode {
    pub const fn code(self) -> i32 {
        match self {
            SubscribeMode::TemporaryConsumer => 0,
            SubscribeMode::PermanentConsumer => 1,
            SubscribeMode::Remove => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(SubscribeMode::TemporaryConsumer),
            1 => Some(SubscribeMode::PermanentConsumer),
            2 => Some(SubscribeMode::Remove),
            _ => None,
        }
    }

    pub fn is_permanent(self) -> bool {
        self == SubscribeMode::PermanentConsumer
    }
}

/// Fields shared by every framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub sender_id: Uuid,
    pub conversation_id: Uuid,
    pub created: DateTime<Utc>,
    pub queue_name: String,
}

impl Header {
    /// Header for a new message: fresh conversation id, stamped now.
    pub fn new(sender_id: Uuid, queue_name: impl Into<String>) -> Self {
        Self {
            sender_id,
            conversation_id: Uuid::new_v4(),
            created: now(),
            queue_name: queue_name.into(),
        }
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::new(Uuid::nil(), String::new())
    }
}

/// Current time truncated to the 100ns tick resolution of the wire format,
/// so freshly stamped headers survive an encode/decode cycle unchanged.
pub fn now() -> DateTime<Utc> {
    let now = Utc::now();
    let nanos = now.timestamp_subsec_nanos() / 100 * 100;
    DateTime::from_timestamp(now.timestamp(), nanos).unwrap_or(now)
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Content {
    pub header: Header,
    pub topic: String,
    pub content_type: String,
    pub payload: Bytes,
}

impl Content {
    pub fn new(sender_id: Uuid, queue_name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            header: Header::new(sender_id, queue_name),
            topic: String::new(),
            content_type: String::new(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub header: Header,
    pub mode: SubscribeMode,
}

impl Subscription {
    pub fn new(sender_id: Uuid, queue_name: impl Into<String>, mode: SubscribeMode) -> Self {
        Self {
            header: Header::new(sender_id, queue_name),
            mode,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Announce {
    pub header: Header,
    pub service_name: String,
    pub node_name: String,
    pub operating_system: String,
    pub client_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Disconnect {
    pub header: Header,
}

impl Disconnect {
    pub fn new(sender_id: Uuid) -> Self {
        Self {
            header: Header::new(sender_id, String::new()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Content(Content),
    Subscription(Subscription),
    Announce(Announce),
    Disconnect(Disconnect),
    /// Tag-only liveness probe; carries no header.
    KeepAlive,
}

impl Message {
    pub fn command(&self) -> CommandType {
        match self {
            Message::Content(_) => CommandType::SendMessage,
            Message::Subscription(_) => CommandType::Subscribe,
            Message::Announce(_) => CommandType::Announce,
            Message::Disconnect(_) => CommandType::Disconnect,
            Message::KeepAlive => CommandType::KeepAlive,
        }
    }

    pub fn header(&self) -> Option<&Header> {
        match self {
            Message::Content(m) => Some(&m.header),
            Message::Subscription(m) => Some(&m.header),
            Message::Announce(m) => Some(&m.header),
            Message::Disconnect(m) => Some(&m.header),
            Message::KeepAlive => None,
        }
    }

    pub fn header_mut(&mut self) -> Option<&mut Header> {
        match self {
            Message::Content(m) => Some(&mut m.header),
            Message::Subscription(m) => Some(&mut m.header),
            Message::Announce(m) => Some(&mut m.header),
            Message::Disconnect(m) => Some(&mut m.header),
            Message::KeepAlive => None,
        }
    }

    /// Target queue name, empty for control messages.
    pub fn queue_name(&self) -> &str {
        self.header().map(|h| h.queue_name.as_str()).unwrap_or("")
    }
}

impl From<Content> for Message {
    fn from(m: Content) -> Self {
        Message::Content(m)
    }
}

impl From<Subscription> for Message {
    fn from(m: Subscription) -> Self {
        Message::Subscription(m)
    }
}

impl From<Announce> for Message {
    fn from(m: Announce) -> Self {
        Message::Announce(m)
    }
}

impl From<Disconnect> for Message {
    fn from(m: Disconnect) -> Self {
        Message::Disconnect(m)
    }
}
