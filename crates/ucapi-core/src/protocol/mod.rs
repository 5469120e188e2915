//! Protocol module: JSON control-channel messages, voice frame types and the
//! binary voice codec.

pub mod codec;
pub mod messages;
pub mod sequence;
pub mod voice;

pub use codec::{decode_voice_frame, encode_voice_frame, ProtocolError};
pub use messages::*;
pub use sequence::SequenceCounter;
pub use voice::{AudioConfiguration, AudioFormat, SampleFormat, VoiceFrame, VoiceFrameKind};
