//! TSK batch wire codec.
//!
//! A TSK message is a length-prefixed, big-endian frame carrying all values
//! for exactly one timestamp and one channel:
//!
//! ```text
//! offset  size      field
//! 0       8         magic = "TSKBATCH"
//! 8       1         version = 0
//! 9       4         timestamp (BE u32, Unix)
//! 13      2         channel-name length (BE u16)
//! 15      chanlen   channel-name (UTF-8)
//! ...     2         key length (BE u16)    \
//! ...     keylen    key bytes (UTF-8)       > repeats until end of frame
//! ...     8         value (BE u64)         /
//! ```
//!
//! There is no trailing marker and no record count; the message ends when
//! the carrying bus frame ends. Encode functions append to a caller-supplied
//! buffer; decode functions borrow from the input and never allocate.

use thiserror::Error;

/// Magic string opening every TSK frame.
pub const MAGIC: &[u8; 8] = b"TSKBATCH";

/// The only protocol version this codec speaks.
pub const VERSION: u8 = 0;

/// Length of the fixed header prefix (magic + version + time + chanlen).
pub const FIXED_HEADER_LEN: usize = MAGIC.len() + 1 + 4 + 2;

/// Decode-side failures.
///
/// `consumed` fields report how many bytes were read before the failure so
/// callers can log the position without re-parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Fewer bytes remain than the next field needs.
    #[error("truncated frame: need {need} bytes at offset {consumed}, {remain} remain")]
    Truncated {
        /// Bytes the next field requires.
        need: usize,
        /// Bytes left in the buffer.
        remain: usize,
        /// Bytes consumed before the failure.
        consumed: usize,
    },

    /// The frame does not start with `"TSKBATCH"`.
    #[error("bad magic (expected \"TSKBATCH\")")]
    BadMagic,

    /// Version byte differs from [`VERSION`].
    #[error("unsupported version {0} (expected {VERSION})")]
    BadVersion(u8),

    /// Encode-side: a key of 2^16 bytes or longer cannot be framed.
    #[error("key length {0} exceeds u16 range")]
    KeyTooLong(usize),

    /// Encode-side: a channel name of 2^16 bytes or longer cannot be framed.
    #[error("channel length {0} exceeds u16 range")]
    ChannelTooLong(usize),
}

/// Appends the frame header for `time` and `channel` to `buf`.
///
/// Returns the number of bytes written.
///
/// # Errors
///
/// Returns [`CodecError::ChannelTooLong`] if the channel name does not fit
/// in the u16 length field.
pub fn write_header(buf: &mut Vec<u8>, time: u32, channel: &[u8]) -> Result<usize, CodecError> {
    let chanlen =
        u16::try_from(channel.len()).map_err(|_| CodecError::ChannelTooLong(channel.len()))?;

    let start = buf.len();
    buf.extend_from_slice(MAGIC);
    buf.push(VERSION);
    buf.extend_from_slice(&time.to_be_bytes());
    buf.extend_from_slice(&chanlen.to_be_bytes());
    buf.extend_from_slice(channel);
    Ok(buf.len() - start)
}

/// Appends one `(key, value)` record to `buf`.
///
/// Returns the number of bytes written.
///
/// # Errors
///
/// Returns [`CodecError::KeyTooLong`] if the key does not fit in the u16
/// length field.
pub fn write_kv(buf: &mut Vec<u8>, key: &[u8], value: u64) -> Result<usize, CodecError> {
    let keylen = u16::try_from(key.len()).map_err(|_| CodecError::KeyTooLong(key.len()))?;

    let start = buf.len();
    buf.extend_from_slice(&keylen.to_be_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(&value.to_be_bytes());
    Ok(buf.len() - start)
}

/// Encodes a complete batch in one call.
///
/// Convenience for single-message producers and tests; the Kafka backend
/// streams through [`write_header`] / [`write_kv`] instead so it can chunk
/// on buffer pressure.
///
/// # Errors
///
/// Propagates the length-field errors of the write functions.
pub fn encode(
    time: u32,
    channel: &[u8],
    records: &[(&[u8], u64)],
) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::with_capacity(FIXED_HEADER_LEN + channel.len() + records.len() * 16);
    write_header(&mut buf, time, channel)?;
    for &(key, value) in records {
        write_kv(&mut buf, key, value)?;
    }
    Ok(buf)
}

/// A decoded frame header borrowing the channel name and the record region
/// from the input buffer.
#[derive(Debug, Clone, Copy)]
pub struct Batch<'a> {
    /// Timestamp all records in this frame share.
    pub time: u32,
    /// Channel name bytes (UTF-8 by convention, not validated).
    pub channel: &'a [u8],
    records: &'a [u8],
    header_len: usize,
}

impl<'a> Batch<'a> {
    /// Parses the frame header and returns a view over the records.
    ///
    /// # Errors
    ///
    /// [`CodecError::Truncated`] if the buffer is shorter than the fixed
    /// prefix or the channel name, [`CodecError::BadMagic`] /
    /// [`CodecError::BadVersion`] on malformed frames.
    pub fn decode(buf: &'a [u8]) -> Result<Self, CodecError> {
        if buf.len() < FIXED_HEADER_LEN {
            return Err(CodecError::Truncated {
                need: FIXED_HEADER_LEN,
                remain: buf.len(),
                consumed: 0,
            });
        }
        if &buf[..MAGIC.len()] != MAGIC {
            return Err(CodecError::BadMagic);
        }
        let version = buf[8];
        if version != VERSION {
            return Err(CodecError::BadVersion(version));
        }

        let time = u32::from_be_bytes([buf[9], buf[10], buf[11], buf[12]]);
        let chanlen = usize::from(u16::from_be_bytes([buf[13], buf[14]]));

        let remain = buf.len() - FIXED_HEADER_LEN;
        if remain < chanlen {
            return Err(CodecError::Truncated {
                need: chanlen,
                remain,
                consumed: FIXED_HEADER_LEN,
            });
        }

        let header_len = FIXED_HEADER_LEN + chanlen;
        Ok(Self {
            time,
            channel: &buf[FIXED_HEADER_LEN..header_len],
            records: &buf[header_len..],
            header_len,
        })
    }

    /// Iterates the `(key, value)` records following the header.
    #[must_use]
    pub fn records(&self) -> RecordIter<'a> {
        RecordIter {
            buf: self.records,
            consumed: self.header_len,
        }
    }
}

/// One decoded record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record<'a> {
    /// Key bytes, borrowed from the frame.
    pub key: &'a [u8],
    /// The 64-bit value.
    pub value: u64,
}

/// Iterator over the records of a [`Batch`].
///
/// Yields an error item and then stops if the remaining bytes do not form a
/// whole record.
#[derive(Debug)]
pub struct RecordIter<'a> {
    buf: &'a [u8],
    consumed: usize,
}

impl<'a> RecordIter<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() < n {
            let err = CodecError::Truncated {
                need: n,
                remain: self.buf.len(),
                consumed: self.consumed,
            };
            // poison the iterator so a malformed tail yields exactly one error
            self.buf = &[];
            return Err(err);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        self.consumed += n;
        Ok(head)
    }
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = Result<Record<'a>, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }

        let res = (|| {
            let len = self.take(2)?;
            let keylen = usize::from(u16::from_be_bytes([len[0], len[1]]));
            let key = self.take(keylen)?;
            let val = self.take(8)?;
            let value = u64::from_be_bytes(val.try_into().expect("slice is 8 bytes"));
            Ok(Record { key, value })
        })();
        Some(res)
    }
}
