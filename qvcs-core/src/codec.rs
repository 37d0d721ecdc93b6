//! Little-endian field reader/writer for the archive file format
//!
//! Archive integers are 2-byte "common shorts" and 4-byte "common longs",
//! both little-endian. Strings are stored with a trailing NUL and a separately
//! recorded size that includes the NUL.

use bytes::{Buf, BufMut};
use chrono::{DateTime, Utc};

use crate::error::{QvcsError, Result};

/// Bounds-checked cursor over an archive buffer
pub struct ArchiveReader<'a> {
    buf: &'a [u8],
    total: usize,
}

impl<'a> ArchiveReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, total: buf.len() }
    }

    /// Offset of the next unread byte from the start of the buffer
    pub fn position(&self) -> usize {
        self.total - self.buf.len()
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn ensure(&self, needed: usize, what: &str) -> Result<()> {
        if self.buf.len() < needed {
            return Err(QvcsError::Format(format!(
                "truncated {} at offset {}: need {} bytes, have {}",
                what,
                self.position(),
                needed,
                self.buf.len()
            )));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1, "byte")?;
        Ok(self.buf.get_u8())
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.ensure(2, "short")?;
        Ok(self.buf.get_u16_le())
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        self.ensure(2, "short")?;
        Ok(self.buf.get_i16_le())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.ensure(4, "long")?;
        Ok(self.buf.get_u32_le())
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.ensure(4, "long")?;
        Ok(self.buf.get_i32_le())
    }

    pub fn read_u16_be(&mut self) -> Result<u16> {
        self.ensure(2, "short")?;
        Ok(self.buf.get_u16())
    }

    pub fn read_u32_be(&mut self) -> Result<u32> {
        self.ensure(4, "long")?;
        Ok(self.buf.get_u32())
    }

    /// Read a 4-byte Unix-seconds timestamp
    pub fn read_time(&mut self) -> Result<DateTime<Utc>> {
        Ok(secs_to_datetime(self.read_u32()?))
    }

    /// Borrow the next `len` bytes
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.ensure(len, "byte run")?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// Read a string whose stored size (including the NUL) is `size`
    pub fn read_nul_string(&mut self, size: usize) -> Result<String> {
        if size == 0 {
            return Ok(String::new());
        }
        let raw = self.read_bytes(size)?;
        let text = match raw.iter().position(|b| *b == 0) {
            Some(nul) => &raw[..nul],
            None => raw,
        };
        Ok(String::from_utf8_lossy(text).into_owned())
    }
}

/// Append helpers for building archive images
pub trait ArchiveWrite {
    fn put_nul_string(&mut self, text: &str);
    fn put_time(&mut self, time: &DateTime<Utc>);
}

impl ArchiveWrite for Vec<u8> {
    fn put_nul_string(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.put_slice(text.as_bytes());
        self.put_u8(0);
    }

    fn put_time(&mut self, time: &DateTime<Utc>) {
        self.put_u32_le(datetime_to_secs(time));
    }
}

/// Longest string that fits a u16 size field once its NUL is counted
pub const MAX_STORED_STRING: usize = u16::MAX as usize - 1;

/// Stored size of a NUL-terminated string (0 for an absent string).
/// `field` names the string in the error when it does not fit.
pub fn nul_string_size(field: &'static str, text: &str) -> Result<u16> {
    if text.is_empty() {
        return Ok(0);
    }
    u16::try_from(text.len() + 1).map_err(|_| QvcsError::StringTooLong {
        field,
        length: text.len(),
        max: MAX_STORED_STRING,
    })
}

pub fn secs_to_datetime(secs: u32) -> DateTime<Utc> {
    DateTime::from_timestamp(secs as i64, 0).unwrap_or_default()
}

pub fn datetime_to_secs(time: &DateTime<Utc>) -> u32 {
    time.timestamp().clamp(0, u32::MAX as i64) as u32
}
