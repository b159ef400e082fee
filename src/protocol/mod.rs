//! The `protocol` module defines the messages exchanged between clients and
//! the broker and the binary frame format that carries them.
//!
//! - `message`: the header shared by all variants and the closed set of
//!   message variants.
//! - `codec`: frame encoding/decoding with forward-compatible skipping of
//!   unknown trailing fields.

pub mod codec;
pub mod message;

pub use codec::{CodecError, FrameCodec};
pub use message::{
    Announce, CommandType, Content, Disconnect, Header, Message, SubscribeMode, Subscription,
};
