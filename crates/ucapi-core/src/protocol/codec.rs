//! Binary codec for voice frames.
//!
//! Wire format:
//! ```text
//! [version:1][kind:1][reserved:2][session_id:4][payload_len:4][payload:N]
//! ```
//! Header size: 12 bytes. All multi-byte integers are big-endian.
//!
//! Payloads:
//! - `Begin`: `[channels:1][sample_rate:4][sample_format:1][audio_format:1]`
//! - `Data`:  raw audio bytes
//! - `End`:   empty

use thiserror::Error;
use tracing::trace;

use crate::protocol::voice::{
    AudioConfiguration, AudioFormat, SampleFormat, VoiceFrame, VoiceFrameKind,
    BEGIN_PAYLOAD_SIZE, VOICE_HEADER_SIZE, VOICE_PROTOCOL_VERSION,
};

/// Errors that can occur while encoding or decoding a voice frame.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The byte slice is shorter than the minimum required length.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The kind byte in the header is not a recognized value.
    #[error("unknown voice frame kind: 0x{0:02X}")]
    UnknownFrameKind(u8),

    /// The version byte in the header is not supported.
    #[error("unsupported voice protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The payload could not be parsed (field value out of range, wrong size, etc.).
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The payload length field does not match the data available.
    #[error("payload length mismatch: header says {declared}, available is {available}")]
    PayloadLengthMismatch { declared: usize, available: usize },
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`VoiceFrame`] into a byte vector including the 12-byte header.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPayload`] if a data payload does not fit
/// the 32-bit length field.
///
/// # Examples
///
/// ```rust
/// use ucapi_core::protocol::{decode_voice_frame, encode_voice_frame, VoiceFrame};
///
/// let frame = VoiceFrame::End { session_id: 7 };
/// let bytes = encode_voice_frame(&frame).unwrap();
/// let (decoded, consumed) = decode_voice_frame(&bytes).unwrap();
/// assert_eq!(decoded, frame);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_voice_frame(frame: &VoiceFrame) -> Result<Vec<u8>, ProtocolError> {
    let payload = encode_payload(frame);
    let payload_len = u32::try_from(payload.len()).map_err(|_| {
        ProtocolError::MalformedPayload(format!("payload of {} bytes is too large", payload.len()))
    })?;

    let mut buf = Vec::with_capacity(VOICE_HEADER_SIZE + payload.len());
    buf.push(VOICE_PROTOCOL_VERSION);
    buf.push(frame.kind() as u8);
    buf.push(0x00); // reserved
    buf.push(0x00); // reserved
    buf.extend_from_slice(&frame.session_id().to_be_bytes());
    buf.extend_from_slice(&payload_len.to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decodes one [`VoiceFrame`] from the beginning of `bytes`.
///
/// Returns the frame and the number of bytes consumed (header + payload).
///
/// # Errors
///
/// Returns [`ProtocolError`] if the bytes are malformed.
pub fn decode_voice_frame(bytes: &[u8]) -> Result<(VoiceFrame, usize), ProtocolError> {
    require_len(bytes, VOICE_HEADER_SIZE)?;

    let version = bytes[0];
    if version != VOICE_PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    let kind_byte = bytes[1];
    let kind =
        VoiceFrameKind::try_from(kind_byte).map_err(|_| ProtocolError::UnknownFrameKind(kind_byte))?;

    // bytes[2..4] are reserved – ignored on decode

    let session_id = read_u32(&bytes[4..8]);
    let payload_len = read_u32(&bytes[8..12]) as usize;

    let total = VOICE_HEADER_SIZE + payload_len;
    if bytes.len() < total {
        return Err(ProtocolError::PayloadLengthMismatch {
            declared: payload_len,
            available: bytes.len() - VOICE_HEADER_SIZE,
        });
    }

    let payload = &bytes[VOICE_HEADER_SIZE..total];
    let frame = match kind {
        VoiceFrameKind::Begin => VoiceFrame::Begin {
            session_id,
            config: decode_begin(payload)?,
        },
        VoiceFrameKind::Data => VoiceFrame::Data {
            session_id,
            samples: payload.to_vec(),
        },
        VoiceFrameKind::End => {
            if !payload.is_empty() {
                return Err(ProtocolError::MalformedPayload(format!(
                    "end frame carries {} payload bytes",
                    payload.len()
                )));
            }
            VoiceFrame::End { session_id }
        }
    };

    trace!("decoded {kind:?} frame for voice session {session_id} ({payload_len} bytes)");
    Ok((frame, total))
}

// ── Payloads ──────────────────────────────────────────────────────────────────

fn encode_payload(frame: &VoiceFrame) -> Vec<u8> {
    match frame {
        VoiceFrame::Begin { config, .. } => {
            let mut buf = Vec::with_capacity(BEGIN_PAYLOAD_SIZE);
            buf.push(config.channels);
            buf.extend_from_slice(&config.sample_rate.to_be_bytes());
            buf.push(config.sample_format as u8);
            buf.push(config.audio_format as u8);
            buf
        }
        VoiceFrame::Data { samples, .. } => samples.clone(),
        VoiceFrame::End { .. } => Vec::new(),
    }
}

fn decode_begin(payload: &[u8]) -> Result<AudioConfiguration, ProtocolError> {
    if payload.len() != BEGIN_PAYLOAD_SIZE {
        return Err(ProtocolError::MalformedPayload(format!(
            "begin payload must be {BEGIN_PAYLOAD_SIZE} bytes, got {}",
            payload.len()
        )));
    }

    let channels = payload[0];
    if channels == 0 {
        return Err(ProtocolError::MalformedPayload(
            "channel count must be at least 1".to_string(),
        ));
    }

    let sample_rate = read_u32(&payload[1..5]);
    if sample_rate == 0 {
        return Err(ProtocolError::MalformedPayload(
            "sample rate must be positive".to_string(),
        ));
    }

    let sample_format = SampleFormat::try_from(payload[5]).map_err(|_| {
        ProtocolError::MalformedPayload(format!("unknown sample format 0x{:02X}", payload[5]))
    })?;
    let audio_format = AudioFormat::try_from(payload[6]).map_err(|_| {
        ProtocolError::MalformedPayload(format!("unknown audio format 0x{:02X}", payload[6]))
    })?;

    Ok(AudioConfiguration {
        channels,
        sample_rate,
        sample_format,
        audio_format,
    })
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn require_len(bytes: &[u8], needed: usize) -> Result<(), ProtocolError> {
    if bytes.len() < needed {
        Err(ProtocolError::InsufficientData {
            needed,
            available: bytes.len(),
        })
    } else {
        Ok(())
    }
}

/// Reads a big-endian u32 from a slice of exactly four bytes.
fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
