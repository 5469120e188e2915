//! # ucapi-core
//!
//! Shared library for UC integration drivers containing the entity model, the
//! JSON control-channel message types, and the binary voice-audio codec.
//!
//! The crate does no I/O.  It has no dependency on tokio, sockets, or the
//! file system, so everything in here can be unit tested synchronously.
//!
//! # Architecture overview (for beginners)
//!
//! An *integration driver* is a small network service that exposes devices
//! (TVs, lights, buttons, voice assistants, ...) to a remote controller.  The
//! controller connects over a WebSocket and talks a JSON request/response/event
//! protocol; voice audio travels as binary WebSocket frames on the same
//! connection.
//!
//! - **`domain`** – Pure data: [`Entity`] with its per-type capability tables,
//!   [`LanguageText`] for localized labels, and the setup dialogue types
//!   ([`SetupAction`], [`SetupRequest`]) a driver author works with.
//!
//! - **`protocol`** – How those values look on the wire.  JSON envelopes for
//!   the control channel ([`InboundMessage`], [`OutboundMessage`]) and a
//!   compact big-endian header format for voice frames ([`VoiceFrame`]).

pub mod domain;
pub mod protocol;

pub use domain::entity::{Entity, EntityBuilder, EntityError, EntityType};
pub use domain::setup::{SetupAction, SetupErrorCode, SetupRequest, SetupStep};
pub use domain::text::LanguageText;
pub use protocol::codec::{decode_voice_frame, encode_voice_frame, ProtocolError};
pub use protocol::messages::{
    AssistantErrorCode, AssistantEvent, AssistantEventType, DeviceState, EventCategory,
    InboundMessage, OutboundMessage, StatusCode,
};
pub use protocol::voice::{AudioConfiguration, AudioFormat, SampleFormat, VoiceFrame};
