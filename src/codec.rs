//! Self-describing message codec over `bytes::Bytes`, backed by compact
//! msgpack (via `rmp-serde`) so this crate interoperates with existing
//! deployments of the wire format (spec §6).
//!
//! [`MessageReader`] exposes typed `decode_*` accessors that advance an
//! internal cursor; [`MessageWriter`] is the dual for building replies.
//! Neither type parses the whole buffer up front — each field is read lazily,
//! matching the original's streaming `msgpack.Decoder` over a `bytes.Reader`.

use crate::error::DecodeError;
use bytes::Bytes;
use serde::de::Deserialize;
use serde::Serialize;
use serde_bytes::{ByteBuf, Bytes as SerdeBytes};
use std::io::Cursor;

/// Inbound message buffer plus cursor.
///
/// `retained` defaults to `false`. A handler sets it via [`MessageReader::retain`]
/// to signal the dispatcher that ownership of the underlying buffer has moved
/// into a spawned task, which must eventually drop it itself (spec §5
/// "buffer ownership").
pub struct MessageReader {
    buf: Bytes,
    pos: usize,
    retained: bool,
}

impl MessageReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf, pos: 0, retained: false }
    }

    pub fn retained(&self) -> bool {
        self.retained
    }

    /// Mark this reader's buffer as retained past handler return.
    pub fn retain(&mut self) {
        self.retained = true;
    }

    /// Remaining unread bytes, not consumed.
    pub fn remaining(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn decode_value<T: for<'de> Deserialize<'de>>(&mut self) -> Result<T, DecodeError> {
        let cursor = Cursor::new(&self.buf[self.pos..]);
        let mut de = rmp_serde::Deserializer::new(cursor);
        let value = T::deserialize(&mut de).map_err(|e| {
            if self.pos >= self.buf.len() {
                DecodeError::ShortRead { want: 1 }
            } else {
                DecodeError::Malformed(e.to_string())
            }
        })?;
        self.pos += de.into_inner().position() as usize;
        Ok(value)
    }

    pub fn decode_u8(&mut self) -> Result<u8, DecodeError> {
        self.decode_value()
    }

    pub fn decode_int(&mut self) -> Result<i64, DecodeError> {
        self.decode_value()
    }

    pub fn decode_u64(&mut self) -> Result<u64, DecodeError> {
        self.decode_value()
    }

    pub fn decode_bytes(&mut self) -> Result<Bytes, DecodeError> {
        let bb: ByteBuf = self.decode_value()?;
        Ok(Bytes::from(bb.into_vec()))
    }

    pub fn decode_string(&mut self) -> Result<String, DecodeError> {
        self.decode_value()
    }

    /// Copy the unread tail verbatim into `writer`, without re-parsing it as
    /// framed fields (used when forwarding a packet's trailing payload).
    pub fn write_remaining_to(&self, writer: &mut MessageWriter) {
        writer.buf.extend_from_slice(self.remaining());
    }

    /// Clone the underlying buffer (cheap, `Bytes` is ref-counted) and the
    /// current cursor into an owned, independent reader, marked retained.
    /// Used by handlers that hand decoding off to a spawned background task
    /// (spec §5 "buffer ownership"): the task gets its own reader positioned
    /// where the dispatcher left off, without needing the original borrow
    /// to outlive the dispatch loop's stack frame.
    pub fn fork(&self) -> MessageReader {
        MessageReader { buf: self.buf.clone(), pos: self.pos, retained: true }
    }
}

/// Outbound message buffer. Built fresh per response (spec §4.1: "outbound
/// buffers are built fresh per response").
#[derive(Default)]
pub struct MessageWriter {
    buf: Vec<u8>,
}

impl MessageWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn encode_value<T: Serialize>(&mut self, v: &T) -> &mut Self {
        let mut ser = rmp_serde::Serializer::new(&mut self.buf);
        v.serialize(&mut ser).expect("write to Vec cannot fail");
        self
    }

    pub fn write_u64(&mut self, v: u64) -> &mut Self {
        self.encode_value(&v)
    }

    pub fn write_int(&mut self, v: i64) -> &mut Self {
        self.encode_value(&v)
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.encode_value(&v)
    }

    pub fn write_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.encode_value(&SerdeBytes::new(v))
    }

    pub fn write_string(&mut self, v: &str) -> &mut Self {
        self.encode_value(&v)
    }

    pub fn extend_raw(&mut self, raw: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(raw);
        self
    }

    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.buf)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
