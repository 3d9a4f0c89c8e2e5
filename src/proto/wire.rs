//! Big-endian primitive encoding shared by every protocol record.
//!
//! The codec is pure: it consumes caller-provided byte slices and appends to
//! caller-provided buffers, never touching I/O.

use bytes::{Buf, BufMut};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("frame ended while reading {field}")]
    ShortFrame { field: &'static str },
    #[error("length {len} for {field} exceeds limit {limit}")]
    Overflow {
        field: &'static str,
        len: i32,
        limit: usize,
    },
    #[error("malformed {field}: {reason}")]
    Malformed {
        field: &'static str,
        reason: &'static str,
    },
}

/// Sanity bound on any single length-prefixed element; frames themselves are
/// bounded separately by the transport.
const MAX_ELEMENT_LEN: usize = 64 * 1024 * 1024;

pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Hands back everything not yet consumed.
    pub fn take_rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }

    pub fn read_i32(&mut self, field: &'static str) -> Result<i32, WireError> {
        if self.buf.remaining() < 4 {
            return Err(WireError::ShortFrame { field });
        }
        Ok(self.buf.get_i32())
    }

    pub fn read_i64(&mut self, field: &'static str) -> Result<i64, WireError> {
        if self.buf.remaining() < 8 {
            return Err(WireError::ShortFrame { field });
        }
        Ok(self.buf.get_i64())
    }

    pub fn read_bool(&mut self, field: &'static str) -> Result<bool, WireError> {
        if self.buf.remaining() < 1 {
            return Err(WireError::ShortFrame { field });
        }
        match self.buf.get_u8() {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(WireError::Malformed {
                field,
                reason: "boolean byte not 0 or 1",
            }),
        }
    }

    /// Length-prefixed byte buffer; a length of -1 encodes absence.
    pub fn read_buffer(&mut self, field: &'static str) -> Result<Option<Vec<u8>>, WireError> {
        let len = self.read_i32(field)?;
        if len == -1 {
            return Ok(None);
        }
        Ok(Some(self.read_exact(field, len)?.to_vec()))
    }

    pub fn read_string(&mut self, field: &'static str) -> Result<String, WireError> {
        let len = self.read_i32(field)?;
        if len == -1 {
            return Ok(String::new());
        }
        let raw = self.read_exact(field, len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::Malformed {
            field,
            reason: "invalid UTF-8",
        })
    }

    pub fn read_string_vec(&mut self, field: &'static str) -> Result<Vec<String>, WireError> {
        let count = self.read_i32(field)?;
        if count == -1 {
            return Ok(Vec::new());
        }
        if count < 0 || count as usize > MAX_ELEMENT_LEN {
            return Err(WireError::Overflow {
                field,
                len: count,
                limit: MAX_ELEMENT_LEN,
            });
        }
        let mut out = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            out.push(self.read_string(field)?);
        }
        Ok(out)
    }

    fn read_exact(&mut self, field: &'static str, len: i32) -> Result<&'a [u8], WireError> {
        if len < 0 {
            return Err(WireError::Malformed {
                field,
                reason: "negative length",
            });
        }
        let len = len as usize;
        if len > MAX_ELEMENT_LEN {
            return Err(WireError::Overflow {
                field,
                len: len as i32,
                limit: MAX_ELEMENT_LEN,
            });
        }
        if self.buf.len() < len {
            return Err(WireError::ShortFrame { field });
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }
}

pub fn put_i32(buf: &mut Vec<u8>, v: i32) {
    buf.put_i32(v);
}

pub fn put_i64(buf: &mut Vec<u8>, v: i64) {
    buf.put_i64(v);
}

pub fn put_bool(buf: &mut Vec<u8>, v: bool) {
    buf.put_u8(v as u8);
}

pub fn put_buffer(buf: &mut Vec<u8>, v: Option<&[u8]>) {
    match v {
        None => buf.put_i32(-1),
        Some(bytes) => {
            buf.put_i32(bytes.len() as i32);
            buf.put_slice(bytes);
        }
    }
}

pub fn put_string(buf: &mut Vec<u8>, v: &str) {
    buf.put_i32(v.len() as i32);
    buf.put_slice(v.as_bytes());
}

pub fn put_string_vec(buf: &mut Vec<u8>, v: &[String]) {
    buf.put_i32(v.len() as i32);
    for s in v {
        put_string(buf, s);
    }
}
