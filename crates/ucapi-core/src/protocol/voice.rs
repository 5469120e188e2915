//! Voice sub-protocol types carried in binary WebSocket frames.
//!
//! A voice session is opened by a `Begin` frame that fixes the audio
//! configuration, carries any number of `Data` frames, and is closed by an
//! `End` frame.  All three carry the controller-assigned session id.

use serde::{Deserialize, Serialize};

/// Current voice frame format version.
pub const VOICE_PROTOCOL_VERSION: u8 = 0x01;

/// Fixed header size: version(1) + kind(1) + reserved(2) + session_id(4) + payload_len(4).
pub const VOICE_HEADER_SIZE: usize = 12;

/// Payload size of a `Begin` frame.
pub const BEGIN_PAYLOAD_SIZE: usize = 7;

// ── Frame kinds ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VoiceFrameKind {
    Begin = 0x01,
    Data = 0x02,
    End = 0x03,
}

impl TryFrom<u8> for VoiceFrameKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(VoiceFrameKind::Begin),
            0x02 => Ok(VoiceFrameKind::Data),
            0x03 => Ok(VoiceFrameKind::End),
            _ => Err(()),
        }
    }
}

// ── Audio configuration ───────────────────────────────────────────────────────

/// PCM sample encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum SampleFormat {
    #[default]
    I16 = 0x01,
    I32 = 0x02,
    U16 = 0x03,
    U32 = 0x04,
    F32 = 0x05,
}

impl TryFrom<u8> for SampleFormat {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(SampleFormat::I16),
            0x02 => Ok(SampleFormat::I32),
            0x03 => Ok(SampleFormat::U16),
            0x04 => Ok(SampleFormat::U32),
            0x05 => Ok(SampleFormat::F32),
            _ => Err(()),
        }
    }
}

/// Audio container of the data frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum AudioFormat {
    #[default]
    Pcm = 0x01,
    Wav = 0x02,
    Ogg = 0x03,
}

impl TryFrom<u8> for AudioFormat {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(AudioFormat::Pcm),
            0x02 => Ok(AudioFormat::Wav),
            0x03 => Ok(AudioFormat::Ogg),
            _ => Err(()),
        }
    }
}

/// Audio parameters fixed for the lifetime of a voice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConfiguration {
    pub channels: u8,
    pub sample_rate: u32,
    pub sample_format: SampleFormat,
    pub audio_format: AudioFormat,
}

impl Default for AudioConfiguration {
    /// Mono, 16 kHz, signed 16-bit PCM.
    fn default() -> Self {
        Self {
            channels: 1,
            sample_rate: 16_000,
            sample_format: SampleFormat::I16,
            audio_format: AudioFormat::Pcm,
        }
    }
}

// ── Frames ────────────────────────────────────────────────────────────────────

/// One decoded binary frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceFrame {
    Begin {
        session_id: u32,
        config: AudioConfiguration,
    },
    Data {
        session_id: u32,
        samples: Vec<u8>,
    },
    End {
        session_id: u32,
    },
}

impl VoiceFrame {
    pub fn session_id(&self) -> u32 {
        match self {
            VoiceFrame::Begin { session_id, .. }
            | VoiceFrame::Data { session_id, .. }
            | VoiceFrame::End { session_id } => *session_id,
        }
    }

    pub fn kind(&self) -> VoiceFrameKind {
        match self {
            VoiceFrame::Begin { .. } => VoiceFrameKind::Begin,
            VoiceFrame::Data { .. } => VoiceFrameKind::Data,
            VoiceFrame::End { .. } => VoiceFrameKind::End,
        }
    }
}
