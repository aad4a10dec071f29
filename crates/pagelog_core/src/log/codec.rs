//! Little-endian field codec and log frame envelope.

use crate::error::{CoreError, CoreResult};
use crate::types::{Lsn, TxnId};

/// Magic bytes opening every log frame.
pub const LOG_MAGIC: [u8; 4] = *b"PLOG";

/// Current log format version.
pub const LOG_VERSION: u16 = 1;

/// magic (4) + version (2) + body_len (4) + prev_frame_len (4)
pub const FRAME_HEADER_SIZE: usize = 14;

/// Trailing CRC32.
pub const FRAME_CRC_SIZE: usize = 4;

/// Bytes a frame adds around its body.
pub const FRAME_OVERHEAD: usize = FRAME_HEADER_SIZE + FRAME_CRC_SIZE;

/// Computes the IEEE CRC32 of `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        crc = (crc >> 8) ^ CRC32_TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize];
    }
    !crc
}

/// Wraps a record body in a frame.
///
/// `prev_frame_len` is the total length of the frame written before this one
/// (0 for the first frame of the log).
pub fn encode_frame(body: &[u8], prev_frame_len: u32) -> CoreResult<Vec<u8>> {
    let body_len = u32::try_from(body.len())
        .map_err(|_| CoreError::invalid_operation("log record body too large"))?;
    let mut frame = Vec::with_capacity(FRAME_OVERHEAD + body.len());
    frame.extend_from_slice(&LOG_MAGIC);
    frame.extend_from_slice(&LOG_VERSION.to_le_bytes());
    frame.extend_from_slice(&body_len.to_le_bytes());
    frame.extend_from_slice(&prev_frame_len.to_le_bytes());
    frame.extend_from_slice(body);
    let crc = compute_crc32(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

/// Parsed fixed part of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Length of the record body.
    pub body_len: u32,
    /// Total length of the preceding frame.
    pub prev_frame_len: u32,
}

impl FrameHeader {
    /// Parses the first [`FRAME_HEADER_SIZE`] bytes of a frame.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LogCorruption`] on a bad magic or an unsupported
    /// version.
    pub fn parse(bytes: &[u8]) -> CoreResult<Self> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(CoreError::log_corruption("frame header truncated"));
        }
        if bytes[0..4] != LOG_MAGIC {
            return Err(CoreError::log_corruption(format!(
                "invalid frame magic: {:02x?}",
                &bytes[0..4]
            )));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != LOG_VERSION {
            return Err(CoreError::log_corruption(format!(
                "unsupported log version {version}"
            )));
        }
        Ok(Self {
            body_len: u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]),
            prev_frame_len: u32::from_le_bytes([bytes[10], bytes[11], bytes[12], bytes[13]]),
        })
    }

    /// Total frame length including header and CRC.
    #[must_use]
    pub fn frame_len(&self) -> u64 {
        FRAME_OVERHEAD as u64 + u64::from(self.body_len)
    }
}

/// Checks the CRC of a complete frame and returns its body.
///
/// # Errors
///
/// Returns [`CoreError::ChecksumMismatch`] if the stored CRC differs.
pub fn verify_frame(frame: &[u8]) -> CoreResult<&[u8]> {
    if frame.len() < FRAME_OVERHEAD {
        return Err(CoreError::log_corruption("frame shorter than its envelope"));
    }
    let split = frame.len() - FRAME_CRC_SIZE;
    let stored = u32::from_le_bytes([
        frame[split],
        frame[split + 1],
        frame[split + 2],
        frame[split + 3],
    ]);
    let computed = compute_crc32(&frame[..split]);
    if stored != computed {
        return Err(CoreError::ChecksumMismatch {
            expected: stored,
            actual: computed,
        });
    }
    Ok(&frame[FRAME_HEADER_SIZE..split])
}

/// Appends little-endian fields to a buffer.
#[derive(Debug, Default)]
pub struct FieldWriter {
    buf: Vec<u8>,
}

impl FieldWriter {
    /// Creates an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the encoded bytes.
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    /// Writes one byte.
    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    /// Writes a u16.
    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Writes a u32.
    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Writes an i32.
    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Writes a u64.
    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Writes an LSN as two u32s.
    pub fn lsn(&mut self, v: Lsn) -> &mut Self {
        self.u32(v.file).u32(v.offset)
    }

    /// Writes a transaction id.
    pub fn txnid(&mut self, v: TxnId) -> &mut Self {
        self.u32(v.as_u32())
    }

    /// Writes fixed-width raw bytes.
    pub fn raw(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    /// Writes a u32 length prefix followed by the bytes.
    ///
    /// Callers keep variable fields well below 4 GiB: they are page-sized.
    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.u32(v.len() as u32).raw(v)
    }

    /// Writes a length-prefixed UTF-8 string.
    pub fn string(&mut self, v: &str) -> &mut Self {
        self.bytes(v.as_bytes())
    }
}

/// Reads little-endian fields from a buffer, rejecting short input.
#[derive(Debug)]
pub struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    /// Creates a reader over `buf`.
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &str) -> CoreResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                CoreError::malformed(format!(
                    "unexpected end of record reading {what}: need {n} bytes at {}, have {}",
                    self.pos,
                    self.buf.len()
                ))
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Reads one byte.
    pub fn u8(&mut self, what: &str) -> CoreResult<u8> {
        Ok(self.take(1, what)?[0])
    }

    /// Reads a u16.
    pub fn u16(&mut self, what: &str) -> CoreResult<u16> {
        let b = self.take(2, what)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Reads a u32.
    pub fn u32(&mut self, what: &str) -> CoreResult<u32> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads an i32.
    pub fn i32(&mut self, what: &str) -> CoreResult<i32> {
        let b = self.take(4, what)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a u64.
    pub fn u64(&mut self, what: &str) -> CoreResult<u64> {
        let b = self.take(8, what)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    /// Reads an LSN.
    pub fn lsn(&mut self, what: &str) -> CoreResult<Lsn> {
        Ok(Lsn::new(self.u32(what)?, self.u32(what)?))
    }

    /// Reads a transaction id.
    pub fn txnid(&mut self, what: &str) -> CoreResult<TxnId> {
        Ok(TxnId::new(self.u32(what)?))
    }

    /// Reads exactly `N` raw bytes.
    pub fn array<const N: usize>(&mut self, what: &str) -> CoreResult<[u8; N]> {
        let mut arr = [0u8; N];
        arr.copy_from_slice(self.take(N, what)?);
        Ok(arr)
    }

    /// Reads a length-prefixed byte field.
    pub fn bytes(&mut self, what: &str) -> CoreResult<Vec<u8>> {
        let len = self.u32(what)? as usize;
        Ok(self.take(len, what)?.to_vec())
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn string(&mut self, what: &str) -> CoreResult<String> {
        String::from_utf8(self.bytes(what)?)
            .map_err(|_| CoreError::malformed(format!("{what} is not valid UTF-8")))
    }

    /// Takes every unread byte.
    pub fn rest(&mut self) -> Vec<u8> {
        let rest = self.buf[self.pos..].to_vec();
        self.pos = self.buf.len();
        rest
    }

    /// Fails if any bytes remain unread.
    pub fn finish(&self, what: &str) -> CoreResult<()> {
        if self.pos != self.buf.len() {
            return Err(CoreError::malformed(format!(
                "trailing bytes in {what} record: expected {} bytes, got {}",
                self.pos,
                self.buf.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn frame_envelope_layout() {
        let frame = encode_frame(b"body", 40).unwrap();
        assert_eq!(frame.len(), FRAME_OVERHEAD + 4);
        assert_eq!(&frame[0..4], b"PLOG");
        let header = FrameHeader::parse(&frame).unwrap();
        assert_eq!(header.body_len, 4);
        assert_eq!(header.prev_frame_len, 40);
        assert_eq!(header.frame_len(), frame.len() as u64);
        assert_eq!(verify_frame(&frame).unwrap(), b"body");
    }

    #[test]
    fn flipped_bit_fails_checksum() {
        let mut frame = encode_frame(b"payload", 0).unwrap();
        frame[FRAME_HEADER_SIZE + 2] ^= 0x10;
        assert!(matches!(
            verify_frame(&frame),
            Err(CoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn bad_magic_is_corruption() {
        let mut frame = encode_frame(b"x", 0).unwrap();
        frame[0] = b'X';
        assert!(matches!(
            FrameHeader::parse(&frame),
            Err(CoreError::LogCorruption { .. })
        ));
    }

    #[test]
    fn reader_rejects_short_and_trailing_input() {
        let mut w = FieldWriter::new();
        w.u32(7).bytes(b"abc").lsn(Lsn::new(1, 2));
        let buf = w.finish();

        let mut r = FieldReader::new(&buf);
        assert_eq!(r.u32("a").unwrap(), 7);
        assert_eq!(r.bytes("b").unwrap(), b"abc");
        assert_eq!(r.lsn("c").unwrap(), Lsn::new(1, 2));
        assert!(r.finish("test").is_ok());

        let mut short = FieldReader::new(&buf[..6]);
        short.u32("a").unwrap();
        assert!(matches!(
            short.bytes("b"),
            Err(CoreError::MalformedRecord { .. })
        ));

        let r = FieldReader::new(&buf);
        assert!(r.finish("test").is_err());
    }

    #[test]
    fn oversized_length_prefix_is_malformed() {
        let mut w = FieldWriter::new();
        w.u32(u32::MAX);
        let buf = w.finish();
        let mut r = FieldReader::new(&buf);
        assert!(r.bytes("blob").is_err());
    }
}
