// src/core/store/resp.rs

//! RESP2 frames as spoken to a Redis-compatible store, with the client-side
//! `Encoder` and `Decoder`.

use crate::core::BrokerError;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const CRLF: &[u8] = b"\r\n";

// Protocol-level limits guarding against a misbehaving server.
const MAX_ARRAY_ELEMENTS: i64 = 1_024 * 1_024;
const MAX_BULK_SIZE: i64 = 512 * 1024 * 1024;
const MAX_DEPTH: usize = 32;

/// A single RESP2 frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RespFrame {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(Bytes),
    Null,
    Array(Vec<RespFrame>),
}

impl RespFrame {
    /// Builds a command frame: an array of bulk strings.
    pub fn command<I, A>(args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Bytes>,
    {
        RespFrame::Array(
            args.into_iter()
                .map(|a| RespFrame::BulkString(a.into()))
                .collect(),
        )
    }
}

/// A reply value, as handed back to store callers and to scripts.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    SimpleString(String),
    BulkString(Bytes),
    Integer(i64),
    Array(Vec<RespValue>),
    Null,
    Error(String),
}

impl RespValue {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(i) => Some(*i),
            RespValue::BulkString(b) => std::str::from_utf8(b).ok()?.parse().ok(),
            _ => None,
        }
    }

    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            RespValue::BulkString(b) => Some(b),
            RespValue::SimpleString(s) => Some(Bytes::from(s)),
            _ => None,
        }
    }

    /// Turns an error reply into a `BrokerError::Store`, passing every other
    /// value through.
    pub fn into_result(self) -> Result<RespValue, BrokerError> {
        match self {
            RespValue::Error(e) => Err(BrokerError::Store(e)),
            other => Ok(other),
        }
    }
}

impl From<RespFrame> for RespValue {
    fn from(frame: RespFrame) -> Self {
        match frame {
            RespFrame::SimpleString(s) => RespValue::SimpleString(s),
            RespFrame::Error(e) => RespValue::Error(e),
            RespFrame::Integer(i) => RespValue::Integer(i),
            RespFrame::BulkString(b) => RespValue::BulkString(b),
            RespFrame::Null => RespValue::Null,
            RespFrame::Array(items) => {
                RespValue::Array(items.into_iter().map(RespValue::from).collect())
            }
        }
    }
}

/// A `tokio_util::codec` implementation for RESP2 frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct RespFrameCodec;

impl Encoder<RespFrame> for RespFrameCodec {
    type Error = BrokerError;

    fn encode(&mut self, item: RespFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        write_frame(&item, dst);
        Ok(())
    }
}

fn write_frame(frame: &RespFrame, dst: &mut BytesMut) {
    let mut num = itoa::Buffer::new();
    match frame {
        RespFrame::SimpleString(s) => {
            dst.extend_from_slice(b"+");
            dst.extend_from_slice(s.as_bytes());
            dst.extend_from_slice(CRLF);
        }
        RespFrame::Error(s) => {
            dst.extend_from_slice(b"-");
            dst.extend_from_slice(s.as_bytes());
            dst.extend_from_slice(CRLF);
        }
        RespFrame::Integer(i) => {
            dst.extend_from_slice(b":");
            dst.extend_from_slice(num.format(*i).as_bytes());
            dst.extend_from_slice(CRLF);
        }
        RespFrame::BulkString(b) => {
            dst.extend_from_slice(b"$");
            dst.extend_from_slice(num.format(b.len()).as_bytes());
            dst.extend_from_slice(CRLF);
            dst.extend_from_slice(b);
            dst.extend_from_slice(CRLF);
        }
        RespFrame::Null => dst.extend_from_slice(b"$-1\r\n"),
        RespFrame::Array(items) => {
            dst.extend_from_slice(b"*");
            dst.extend_from_slice(num.format(items.len()).as_bytes());
            dst.extend_from_slice(CRLF);
            for item in items {
                write_frame(item, dst);
            }
        }
    }
}

impl Decoder for RespFrameCodec {
    type Item = RespFrame;
    type Error = BrokerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut cursor: &[u8] = &src[..];
        match parse(&mut cursor, 0)? {
            Some(frame) => {
                let consumed = src.len() - cursor.len();
                src.advance(consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

/// Parses one frame from the front of `buf`. `Ok(None)` means more bytes are
/// needed; `buf` is only meaningful when a frame is returned.
fn parse(buf: &mut &[u8], depth: usize) -> Result<Option<RespFrame>, BrokerError> {
    if depth > MAX_DEPTH {
        return Err(BrokerError::Store("reply nesting too deep".into()));
    }
    let Some(&tag) = buf.first() else {
        return Ok(None);
    };
    *buf = &buf[1..];
    let Some(line) = read_line(buf) else {
        return Ok(None);
    };

    let frame = match tag {
        b'+' => RespFrame::SimpleString(String::from_utf8_lossy(line).into_owned()),
        b'-' => RespFrame::Error(String::from_utf8_lossy(line).into_owned()),
        b':' => RespFrame::Integer(parse_int(line)?),
        b'$' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some(RespFrame::Null));
            }
            if len > MAX_BULK_SIZE {
                return Err(BrokerError::Store(format!("bulk reply of {len} bytes")));
            }
            let len = len as usize;
            if buf.len() < len + CRLF.len() {
                return Ok(None);
            }
            if &buf[len..len + CRLF.len()] != CRLF {
                return Err(BrokerError::Store("bulk reply missing terminator".into()));
            }
            let data = Bytes::copy_from_slice(&buf[..len]);
            *buf = &buf[len + CRLF.len()..];
            RespFrame::BulkString(data)
        }
        b'*' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some(RespFrame::Null));
            }
            if len > MAX_ARRAY_ELEMENTS {
                return Err(BrokerError::Store(format!("array reply of {len} elements")));
            }
            let mut items = Vec::with_capacity(len as usize);
            for _ in 0..len {
                match parse(buf, depth + 1)? {
                    Some(item) => items.push(item),
                    None => return Ok(None),
                }
            }
            RespFrame::Array(items)
        }
        other => {
            return Err(BrokerError::Store(format!(
                "unexpected reply type byte {other:#04x}"
            )));
        }
    };
    Ok(Some(frame))
}

fn read_line<'a>(buf: &mut &'a [u8]) -> Option<&'a [u8]> {
    let pos = buf.windows(CRLF.len()).position(|w| w == CRLF)?;
    let line = &buf[..pos];
    *buf = &buf[pos + CRLF.len()..];
    Some(line)
}

fn parse_int(line: &[u8]) -> Result<i64, BrokerError> {
    Ok(std::str::from_utf8(line)?.parse::<i64>()?)
}
