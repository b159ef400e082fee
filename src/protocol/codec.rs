//! Binary frame codec.
//!
//! Frame layout (all integers little-endian):
//!
//! ```text
//! tag:i32 | begin:u32 | len:i64 | header + body [len bytes] | end:u32
//! ```
//!
//! A KeepAlive is the 4-byte tag alone. The declared length always decides
//! where the next frame starts: fields appended by a newer encoder are left
//! unread inside the body and skipped, which keeps old decoders working
//! against newer peers.

use std::collections::HashMap;
use std::sync::LazyLock;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::message::{
    Announce, CommandType, Content, Disconnect, Header, Message, SubscribeMode, Subscription,
};

pub const MESSAGE_BEGIN: u32 = 0x4242_4242;
pub const MESSAGE_END: u32 = 0x2424_2424;

const TAG_LEN: usize = 4;
/// Tag, begin marker and declared length.
pub const ENVELOPE_LEN: usize = 16;
pub const TRAILER_LEN: usize = 4;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

// .NET DateTime.ToBinary(): 100ns ticks since 0001-01-01, kind in the top two bits.
const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;
const TICKS_PER_SECOND: i64 = 10_000_000;
const KIND_UTC: i64 = 0x4000_0000_0000_0000;
const TICKS_MASK: i64 = 0x3FFF_FFFF_FFFF_FFFF;

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("frame begin marker mismatch: {0:#010x}")]
    BeginMarker(u32),
    #[error("unknown command tag {0}")]
    UnknownCommand(i32),
    #[error("invalid length {0}")]
    InvalidLength(i64),
    #[error("frame body of {declared} bytes exceeds limit of {limit}")]
    FrameTooLarge { declared: u64, limit: usize },
    #[error("frame body ended before all fields were read")]
    Truncated,
    #[error("string field is not valid utf-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("invalid subscribe mode {0}")]
    InvalidMode(i32),
    #[error("timestamp out of range: {0}")]
    InvalidTimestamp(i64),
}

pub type Result<T> = std::result::Result<T, CodecError>;

struct VariantCodec {
    encode_body: fn(&Message, &mut BytesMut),
    decode_body: fn(Header, &mut Bytes) -> Result<Message>,
}

static REGISTRY: LazyLock<HashMap<i32, VariantCodec>> = LazyLock::new(|| {
    let mut registry = HashMap::new();
    registry.insert(
        CommandType::SendMessage.tag(),
        VariantCodec {
            encode_body: encode_content,
            decode_body: decode_content,
        },
    );
    registry.insert(
        CommandType::Subscribe.tag(),
        VariantCodec {
            encode_body: encode_subscription,
            decode_body: decode_subscription,
        },
    );
    registry.insert(
        CommandType::Announce.tag(),
        VariantCodec {
            encode_body: encode_announce,
            decode_body: decode_announce,
        },
    );
    registry.insert(
        CommandType::Disconnect.tag(),
        VariantCodec {
            encode_body: |_, _| {},
            decode_body: |header, _| Ok(Message::Disconnect(Disconnect { header })),
        },
    );
    registry
});

/// Stateless apart from the frame size limit; cheap to copy into every
/// connection.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    pub fn encode(&self, message: &Message) -> Bytes {
        encode(message)
    }

    /// Decode one frame from the front of `src`.
    ///
    /// Returns `Ok(None)` and leaves `src` untouched when the frame is not
    /// complete yet. Every error is fatal for the stream.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.len() < TAG_LEN {
            return Ok(None);
        }

        let tag = (&src[..TAG_LEN]).get_i32_le();
        if tag == CommandType::KeepAlive.tag() {
            src.advance(TAG_LEN);
            return Ok(Some(Message::KeepAlive));
        }

        let variant = REGISTRY.get(&tag).ok_or(CodecError::UnknownCommand(tag))?;

        if src.len() < ENVELOPE_LEN {
            return Ok(None);
        }

        let mut envelope = &src[TAG_LEN..ENVELOPE_LEN];
        let begin = envelope.get_u32_le();
        if begin != MESSAGE_BEGIN {
            return Err(CodecError::BeginMarker(begin));
        }
        let declared = envelope.get_i64_le();
        if declared < 0 {
            return Err(CodecError::InvalidLength(declared));
        }
        if declared as u64 > self.max_frame_bytes as u64 {
            return Err(CodecError::FrameTooLarge {
                declared: declared as u64,
                limit: self.max_frame_bytes,
            });
        }

        let body_len = declared as usize;
        let total = ENVELOPE_LEN + body_len + TRAILER_LEN;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total).freeze();
        frame.advance(ENVELOPE_LEN);
        let mut body = frame.split_to(body_len);

        let header = get_header(&mut body)?;
        let message = (variant.decode_body)(header, &mut body)?;

        // Anything left in `body`, and an end marker that is not where this
        // decoder expected it, come from fields it does not know. The split
        // above already moved past them.
        Ok(Some(message))
    }
}

/// Encode a message into a complete frame.
pub fn encode(message: &Message) -> Bytes {
    let command = message.command();
    let mut buf = BytesMut::new();
    buf.put_i32_le(command.tag());

    let (Some(header), Some(variant)) = (message.header(), REGISTRY.get(&command.tag())) else {
        return buf.freeze();
    };

    let mut body = BytesMut::new();
    put_header(&mut body, header);
    (variant.encode_body)(message, &mut body);

    buf.reserve(ENVELOPE_LEN - TAG_LEN + body.len() + TRAILER_LEN);
    buf.put_u32_le(MESSAGE_BEGIN);
    buf.put_i64_le(body.len() as i64);
    buf.put_slice(&body);
    buf.put_u32_le(MESSAGE_END);
    buf.freeze()
}

/// Decode a single complete frame.
pub fn decode(frame: &[u8]) -> Result<Message> {
    let mut buf = BytesMut::from(frame);
    FrameCodec::new(usize::MAX)
        .decode(&mut buf)?
        .ok_or(CodecError::Truncated)
}

pub fn keep_alive_frame() -> Bytes {
    Bytes::copy_from_slice(&CommandType::KeepAlive.tag().to_le_bytes())
}

fn put_header(buf: &mut BytesMut, header: &Header) {
    put_uuid(buf, header.sender_id);
    put_uuid(buf, header.conversation_id);
    buf.put_i64_le(to_binary(header.created));
    put_string(buf, &header.queue_name);
}

fn get_header(buf: &mut Bytes) -> Result<Header> {
    let sender_id = get_uuid(buf)?;
    let conversation_id = get_uuid(buf)?;
    let created = from_binary(get_i64(buf)?)?;
    let queue_name = get_string(buf)?;
    Ok(Header {
        sender_id,
        conversation_id,
        created,
        queue_name,
    })
}

fn encode_content(message: &Message, buf: &mut BytesMut) {
    if let Message::Content(content) = message {
        put_string(buf, &content.content_type);
        put_string(buf, &content.topic);
        buf.put_i64_le(content.payload.len() as i64);
        buf.put_slice(&content.payload);
    }
}

fn decode_content(header: Header, buf: &mut Bytes) -> Result<Message> {
    let content_type = get_string(buf)?;
    let topic = get_string(buf)?;
    let len = get_i64(buf)?;
    if len < 0 {
        return Err(CodecError::InvalidLength(len));
    }
    let payload = take(buf, len as usize)?;
    Ok(Message::Content(Content {
        header,
        topic,
        content_type,
        payload,
    }))
}

fn encode_subscription(message: &Message, buf: &mut BytesMut) {
    if let Message::Subscription(subscription) = message {
        buf.put_i32_le(subscription.mode.code());
    }
}

fn decode_subscription(header: Header, buf: &mut Bytes) -> Result<Message> {
    let code = get_i32(buf)?;
    let mode = SubscribeMode::from_code(code).ok_or(CodecError::InvalidMode(code))?;
    Ok(Message::Subscription(Subscription { header, mode }))
}

fn encode_announce(message: &Message, buf: &mut BytesMut) {
    if let Message::Announce(announce) = message {
        put_string(buf, &announce.service_name);
        put_string(buf, &announce.node_name);
        put_string(buf, &announce.operating_system);
        put_string(buf, &announce.client_version);
    }
}

fn decode_announce(header: Header, buf: &mut Bytes) -> Result<Message> {
    Ok(Message::Announce(Announce {
        header,
        service_name: get_string(buf)?,
        node_name: get_string(buf)?,
        operating_system: get_string(buf)?,
        client_version: get_string(buf)?,
    }))
}

pub(crate) fn put_uuid(buf: &mut BytesMut, id: Uuid) {
    buf.put_slice(&id.to_bytes_le());
}

pub(crate) fn get_uuid(buf: &mut Bytes) -> Result<Uuid> {
    ensure(buf, 16)?;
    let mut raw = [0u8; 16];
    buf.copy_to_slice(&mut raw);
    Ok(Uuid::from_bytes_le(raw))
}

pub(crate) fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_i32_le(value.len() as i32);
    buf.put_slice(value.as_bytes());
}

pub(crate) fn get_string(buf: &mut Bytes) -> Result<String> {
    let len = get_i32(buf)?;
    if len < 0 {
        return Err(CodecError::InvalidLength(len.into()));
    }
    let raw = take(buf, len as usize)?;
    Ok(String::from_utf8(raw.to_vec())?)
}

pub(crate) fn get_i32(buf: &mut Bytes) -> Result<i32> {
    ensure(buf, 4)?;
    Ok(buf.get_i32_le())
}

fn get_i64(buf: &mut Bytes) -> Result<i64> {
    ensure(buf, 8)?;
    Ok(buf.get_i64_le())
}

fn take(buf: &mut Bytes, len: usize) -> Result<Bytes> {
    ensure(buf, len)?;
    Ok(buf.split_to(len))
}

fn ensure(buf: &Bytes, len: usize) -> Result<()> {
    if buf.remaining() < len {
        return Err(CodecError::Truncated);
    }
    Ok(())
}

fn to_binary(created: DateTime<Utc>) -> i64 {
    let ticks = created
        .timestamp()
        .saturating_mul(TICKS_PER_SECOND)
        .saturating_add(UNIX_EPOCH_TICKS)
        .saturating_add(i64::from(created.timestamp_subsec_nanos() / 100));
    ticks.clamp(0, TICKS_MASK) | KIND_UTC
}

fn from_binary(raw: i64) -> Result<DateTime<Utc>> {
    let since_epoch = (raw & TICKS_MASK) - UNIX_EPOCH_TICKS;
    let secs = since_epoch.div_euclid(TICKS_PER_SECOND);
    let nanos = (since_epoch.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
    DateTime::from_timestamp(secs, nanos).ok_or(CodecError::InvalidTimestamp(raw))
}
