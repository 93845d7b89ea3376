// src/core/protocol/codec.rs

//! Implements the envelope wire format and the corresponding `Encoder` and
//! `Decoder` for network communication.
//!
//! Every frame is laid out as:
//!
//! ```text
//! +----------------+------+------+---------+----------------+
//! | length (u32 BE)| flow | type | needAck | body ...       |
//! +----------------+------+------+---------+----------------+
//! ```
//!
//! `length` counts everything after the prefix. The body is serialized with
//! the codec's `WireFormat`: compact `bincode` for binary clients or JSON for
//! text clients.

use super::envelope::{Body, BodyKind, Envelope, Flow};
use crate::core::BrokerError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

const LEN_PREFIX: usize = 4;
const HEADER_LEN: usize = 3;

/// Default upper bound on a single frame, prefix excluded.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// How envelope bodies are serialized.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    #[default]
    Binary,
    Json,
}

/// A `tokio_util::codec` implementation for encoding and decoding `Envelope`s.
///
/// Decoding yields `Result<Envelope, BrokerError>` items: a frame whose bounds
/// are intact but whose contents are malformed is surfaced as an item so the
/// connection can answer it and keep going. Only I/O failures end the stream.
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    format: WireFormat,
    max_frame_size: usize,
    /// Bytes of an oversized frame still to be thrown away.
    discarding: usize,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(WireFormat::Binary, DEFAULT_MAX_FRAME_SIZE)
    }
}

impl EnvelopeCodec {
    pub fn new(format: WireFormat, max_frame_size: usize) -> Self {
        Self {
            format,
            max_frame_size,
            discarding: 0,
        }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Serializes an envelope into `dst` without taking ownership of it.
    pub fn encode_envelope(&self, item: &Envelope, dst: &mut BytesMut) -> Result<(), BrokerError> {
        item.check_consistency()?;

        let body = match &item.body {
            Body::Heartbeat(b) => self.encode_body(b)?,
            Body::Command(b) => self.encode_body(b)?,
            Body::Message(b) => self.encode_body(b)?,
            Body::Event(b) => self.encode_body(b)?,
        };

        let frame_len = HEADER_LEN + body.len();
        if frame_len > self.max_frame_size {
            return Err(BrokerError::Encode(format!(
                "frame of {frame_len} bytes exceeds limit of {} bytes",
                self.max_frame_size
            )));
        }

        dst.reserve(LEN_PREFIX + frame_len);
        dst.put_u32(frame_len as u32);
        dst.put_u8(item.flow as u8);
        dst.put_u8(item.kind as u8);
        dst.put_u8(item.need_ack as u8);
        dst.extend_from_slice(&body);
        Ok(())
    }

    fn encode_body<T>(&self, body: &T) -> Result<Vec<u8>, BrokerError>
    where
        T: Serialize + bincode::Encode,
    {
        match self.format {
            WireFormat::Binary => Ok(bincode::encode_to_vec(
                body,
                bincode::config::standard(),
            )?),
            WireFormat::Json => serde_json::to_vec(body)
                .map_err(|e| BrokerError::Encode(format!("json: {e}"))),
        }
    }

    fn decode_body<T>(&self, bytes: &[u8]) -> Result<T, BrokerError>
    where
        T: DeserializeOwned + bincode::Decode<()>,
    {
        match self.format {
            WireFormat::Binary => {
                let (body, read) =
                    bincode::decode_from_slice::<T, _>(bytes, bincode::config::standard())?;
                if read != bytes.len() {
                    return Err(BrokerError::Decode(format!(
                        "{} trailing bytes after body",
                        bytes.len() - read
                    )));
                }
                Ok(body)
            }
            WireFormat::Json => serde_json::from_slice(bytes)
                .map_err(|e| BrokerError::Decode(format!("json: {e}"))),
        }
    }

    /// Parses one complete frame, prefix already stripped.
    fn parse_frame(&self, frame: &[u8]) -> Result<Envelope, BrokerError> {
        if frame.len() < HEADER_LEN {
            return Err(BrokerError::Decode(format!(
                "frame of {} bytes is shorter than the header",
                frame.len()
            )));
        }
        let flow = Flow::try_from(frame[0])?;
        let kind = BodyKind::try_from(frame[1])?;
        let need_ack = match frame[2] {
            0 => false,
            1 => true,
            other => {
                return Err(BrokerError::Decode(format!("invalid needAck flag {other}")));
            }
        };

        let payload = &frame[HEADER_LEN..];
        let body = match kind {
            BodyKind::Heartbeat => Body::Heartbeat(self.decode_body(payload)?),
            BodyKind::Command => Body::Command(self.decode_body(payload)?),
            BodyKind::Message => Body::Message(self.decode_body(payload)?),
            BodyKind::Event => Body::Event(self.decode_body(payload)?),
        };

        Ok(Envelope {
            flow,
            kind,
            need_ack,
            body,
        })
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = BrokerError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encode_envelope(&item, dst)
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Result<Envelope, BrokerError>;
    type Error = BrokerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.discarding > 0 {
            let skip = self.discarding.min(src.len());
            src.advance(skip);
            self.discarding -= skip;
            if self.discarding > 0 {
                return Ok(None);
            }
        }

        if src.len() < LEN_PREFIX {
            return Ok(None);
        }

        let mut prefix = [0u8; LEN_PREFIX];
        prefix.copy_from_slice(&src[..LEN_PREFIX]);
        let frame_len = u32::from_be_bytes(prefix) as usize;

        // Oversized frames are skipped rather than buffered, and reported once.
        if frame_len > self.max_frame_size {
            src.advance(LEN_PREFIX);
            let skip = frame_len.min(src.len());
            src.advance(skip);
            self.discarding = frame_len - skip;
            return Ok(Some(Err(BrokerError::Decode(format!(
                "frame of {frame_len} bytes exceeds limit of {} bytes",
                self.max_frame_size
            )))));
        }

        if src.len() < LEN_PREFIX + frame_len {
            src.reserve(LEN_PREFIX + frame_len - src.len());
            return Ok(None);
        }

        src.advance(LEN_PREFIX);
        let frame = src.split_to(frame_len);
        Ok(Some(self.parse_frame(&frame)))
    }
}

/// Encodes a single envelope with the default binary codec.
pub fn encode(envelope: &Envelope) -> Result<Bytes, BrokerError> {
    let mut buf = BytesMut::new();
    EnvelopeCodec::default().encode_envelope(envelope, &mut buf)?;
    Ok(buf.freeze())
}

/// Decodes exactly one envelope from `bytes` with the default binary codec.
pub fn decode(bytes: &[u8]) -> Result<Envelope, BrokerError> {
    EnvelopeCodec::default().decode_exact(bytes)
}

impl EnvelopeCodec {
    /// Decodes exactly one frame; truncated input and trailing bytes are errors.
    pub fn decode_exact(&mut self, bytes: &[u8]) -> Result<Envelope, BrokerError> {
        let mut buf = BytesMut::from(bytes);
        match self.decode(&mut buf)? {
            Some(result) => {
                let envelope = result?;
                if !buf.is_empty() {
                    return Err(BrokerError::Decode(format!(
                        "{} trailing bytes after frame",
                        buf.len()
                    )));
                }
                Ok(envelope)
            }
            None => Err(BrokerError::Decode("truncated frame".into())),
        }
    }
}
