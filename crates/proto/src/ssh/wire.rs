//! SSH data type encoding (RFC 4251 Section 5).
//!
//! Every message codec in this crate reads through [`Reader`] and writes with
//! the `put_*` helpers, so that bounds checking lives in one place.
//!
//! ```rust
//! use bytes::BytesMut;
//! use strand_proto::ssh::wire::{put_name_list, put_string, Reader};
//!
//! let mut buf = BytesMut::new();
//! put_string(&mut buf, b"ssh-connection");
//! put_name_list(&mut buf, &["zlib".to_string(), "none".to_string()]);
//!
//! let mut r = Reader::new(&buf);
//! assert_eq!(r.read_utf8().unwrap(), "ssh-connection");
//! assert_eq!(r.read_name_list().unwrap(), vec!["zlib", "none"]);
//! assert!(r.is_empty());
//! ```

use bytes::{BufMut, BytesMut};
use strand_platform::{StrandError, StrandResult};

/// Cursor over a received payload.
///
/// All reads fail with a protocol error instead of panicking on truncated
/// input.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    /// Starts reading at the beginning of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Starts reading after the message type byte, checking that it matches.
    pub fn for_message(data: &'a [u8], expected: u8, name: &str) -> StrandResult<Self> {
        match data.first() {
            None => Err(StrandError::malformed(format!("{} message is empty", name))),
            Some(&ty) if ty != expected => Err(StrandError::malformed(format!(
                "Invalid message type: expected {} ({}), got {}",
                expected, name, ty
            ))),
            Some(_) => Ok(Self { data, offset: 1 }),
        }
    }

    /// Current offset into the payload.
    pub fn position(&self) -> usize {
        self.offset
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.offset..]
    }

    /// Whether every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }

    fn take(&mut self, len: usize) -> StrandResult<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                StrandError::malformed(format!(
                    "Data truncated: expected {} bytes at offset {}",
                    len, self.offset
                ))
            })?;
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    /// Reads a single byte.
    pub fn read_u8(&mut self) -> StrandResult<u8> {
        Ok(self.take(1)?[0])
    }

    /// Reads an SSH `boolean`.
    pub fn read_bool(&mut self) -> StrandResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a big-endian `uint32`.
    pub fn read_u32(&mut self) -> StrandResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a big-endian `uint64`.
    pub fn read_u64(&mut self) -> StrandResult<u64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    /// Reads `len` raw bytes.
    pub fn read_raw(&mut self, len: usize) -> StrandResult<&'a [u8]> {
        self.take(len)
    }

    /// Reads a length-prefixed `string` as raw bytes.
    pub fn read_string(&mut self) -> StrandResult<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    /// Reads a length-prefixed `string` that must be valid UTF-8.
    pub fn read_utf8(&mut self) -> StrandResult<String> {
        let raw = self.read_string()?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|_| StrandError::malformed("String contains invalid UTF-8"))
    }

    /// Reads a comma-separated `name-list`.
    pub fn read_name_list(&mut self) -> StrandResult<Vec<String>> {
        let list = self.read_utf8()?;
        if list.is_empty() {
            Ok(vec![])
        } else {
            Ok(list.split(',').map(String::from).collect())
        }
    }

    /// Reads an `mpint`, returning its two's complement magnitude bytes.
    pub fn read_mpint(&mut self) -> StrandResult<&'a [u8]> {
        let raw = self.read_string()?;
        if raw.first().map_or(false, |b| b & 0x80 != 0) {
            return Err(StrandError::malformed("Negative mpint not allowed here"));
        }
        Ok(raw)
    }
}

/// Writes a `boolean`.
pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Writes a length-prefixed `string`.
pub fn put_string(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

/// Writes a comma-separated `name-list`.
pub fn put_name_list(buf: &mut BytesMut, names: &[String]) {
    put_string(buf, names.join(",").as_bytes());
}

/// Writes an unsigned big integer as an `mpint`.
///
/// Leading zero bytes are stripped and a zero byte is prepended when the high
/// bit is set, so the value always reads back as positive.
pub fn put_mpint(buf: &mut BytesMut, magnitude: &[u8]) {
    let start = magnitude
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(magnitude.len());
    let trimmed = &magnitude[start..];
    let pad = trimmed.first().map_or(false, |b| b & 0x80 != 0);
    buf.put_u32((trimmed.len() + usize::from(pad)) as u32);
    if pad {
        buf.put_u8(0);
    }
    buf.put_slice(trimmed);
}

/// Returns the `mpint` encoding of `magnitude` as a fresh vector.
pub fn mpint_bytes(magnitude: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(magnitude.len() + 5);
    put_mpint(&mut buf, magnitude);
    buf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_list_write_read() {
        let names = vec![
            "first".to_string(),
            "second".to_string(),
            "third".to_string(),
        ];
        let mut buf = BytesMut::new();
        put_name_list(&mut buf, &names);

        let mut r = Reader::new(&buf);
        assert_eq!(r.read_name_list().unwrap(), names);
        assert!(r.is_empty());
    }

    #[test]
    fn test_name_list_empty() {
        let mut buf = BytesMut::new();
        put_name_list(&mut buf, &[]);
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
        assert!(Reader::new(&buf).read_name_list().unwrap().is_empty());
    }

    #[test]
    fn test_truncated_string() {
        let data = [0, 0, 0, 10, b'a', b'b'];
        let err = Reader::new(&data).read_string().unwrap_err();
        match err {
            StrandError::Protocol { message, .. } => assert!(message.contains("truncated")),
            other => panic!("Expected Protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_huge_length_does_not_overflow() {
        let data = [0xff, 0xff, 0xff, 0xff];
        assert!(Reader::new(&data).read_string().is_err());
    }

    #[test]
    fn test_for_message_checks_type() {
        assert!(Reader::for_message(&[], 96, "CHANNEL_EOF").is_err());
        assert!(Reader::for_message(&[97, 0], 96, "CHANNEL_EOF").is_err());
        let r = Reader::for_message(&[96, 0, 0, 0, 1], 96, "CHANNEL_EOF").unwrap();
        assert_eq!(r.position(), 1);
    }

    #[test]
    fn test_mpint_encoding() {
        assert_eq!(mpint_bytes(&[]), vec![0, 0, 0, 0]);
        assert_eq!(mpint_bytes(&[0x12, 0x34]), vec![0, 0, 0, 2, 0x12, 0x34]);
        assert_eq!(mpint_bytes(&[0x80, 0x00]), vec![0, 0, 0, 3, 0, 0x80, 0x00]);
        assert_eq!(
            mpint_bytes(&[0x00, 0x00, 0x12, 0x34]),
            vec![0, 0, 0, 2, 0x12, 0x34]
        );

        let encoded = mpint_bytes(&[0x80, 0x01]);
        assert_eq!(Reader::new(&encoded).read_mpint().unwrap(), &[0, 0x80, 0x01]);
    }

    #[test]
    fn test_utf8_rejected() {
        let data = [0, 0, 0, 2, 0xc3, 0x28];
        assert!(Reader::new(&data).read_utf8().is_err());
    }
}
