//! Bounds-checked cursor primitives for message bodies.
//!
//! Every field read or write is a single call that either succeeds or reports a
//! typed error with the opcode, field name and offset. Offsets are relative to the
//! first byte after the 16-byte header.

use crate::document::{Document, MIN_DOCUMENT_SIZE};
use crate::error::ProtocolError;
use crate::header::{MessageHeader, OpCode, HEADER_SIZE};
use crate::MAX_MESSAGE_SIZE;
use bytes::{BufMut, Bytes, BytesMut};

/// Reads fields out of a message body.
pub struct WireReader<'a> {
    buf: &'a Bytes,
    pos: usize,
    end: usize,
    op_code: OpCode,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a Bytes, op_code: OpCode) -> Self {
        Self {
            buf,
            pos: 0,
            end: buf.len(),
            op_code,
        }
    }

    /// Current offset into the body.
    pub fn offset(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.end - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.end
    }

    fn take(&mut self, field: &'static str, needed: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < needed {
            return Err(ProtocolError::Truncated {
                op_code: self.op_code,
                field,
                offset: self.pos,
                needed,
                available: self.remaining(),
            });
        }
        let buf: &'a Bytes = self.buf;
        let bytes = &buf[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(bytes)
    }

    pub fn read_u8(&mut self, field: &'static str) -> Result<u8, ProtocolError> {
        Ok(self.take(field, 1)?[0])
    }

    pub fn read_i32(&mut self, field: &'static str) -> Result<i32, ProtocolError> {
        let bytes = self.take(field, 4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u32(&mut self, field: &'static str) -> Result<u32, ProtocolError> {
        Ok(self.read_i32(field)? as u32)
    }

    pub fn read_i64(&mut self, field: &'static str) -> Result<i64, ProtocolError> {
        let bytes = self.take(field, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(i64::from_le_bytes(raw))
    }

    /// Reads a NUL-terminated UTF-8 string, consuming the terminator.
    pub fn read_cstring(&mut self, field: &'static str) -> Result<String, ProtocolError> {
        let start = self.pos;
        let window = &self.buf[start..self.end];
        let nul = window
            .iter()
            .position(|&b| b == 0)
            .ok_or(ProtocolError::UnterminatedCString {
                op_code: self.op_code,
                field,
                offset: start,
            })?;
        let value = std::str::from_utf8(&window[..nul])
            .map_err(|_| ProtocolError::InvalidUtf8 {
                op_code: self.op_code,
                field,
                offset: start,
            })?
            .to_string();
        self.pos += nul + 1;
        Ok(value)
    }

    /// Slices the next document using its own length prefix.
    pub fn read_document(&mut self, field: &'static str) -> Result<Document, ProtocolError> {
        let start = self.pos;
        if self.remaining() < 4 {
            return Err(ProtocolError::Truncated {
                op_code: self.op_code,
                field,
                offset: start,
                needed: 4,
                available: self.remaining(),
            });
        }
        let p = &self.buf[start..start + 4];
        let length = i32::from_le_bytes([p[0], p[1], p[2], p[3]]);
        if length < MIN_DOCUMENT_SIZE as i32 || length as usize > self.remaining() {
            return Err(ProtocolError::InvalidDocumentLength {
                op_code: self.op_code,
                field,
                offset: start,
                length,
                available: self.remaining(),
            });
        }
        let end = start + length as usize;
        self.pos = end;
        Ok(Document::from_validated(self.buf.slice(start..end)))
    }

    /// Reads documents until the reader is exhausted.
    pub fn read_documents(&mut self, field: &'static str) -> Result<Vec<Document>, ProtocolError> {
        let mut docs = Vec::new();
        while !self.is_empty() {
            docs.push(self.read_document(field)?);
        }
        Ok(docs)
    }

    /// Splits off a reader over the next `len` bytes and skips past them.
    pub fn sub_reader(
        &mut self,
        field: &'static str,
        len: usize,
    ) -> Result<WireReader<'a>, ProtocolError> {
        let start = self.pos;
        self.take(field, len)?;
        Ok(WireReader {
            buf: self.buf,
            pos: start,
            end: start + len,
            op_code: self.op_code,
        })
    }

    /// Consumes everything left.
    pub fn read_rest(&mut self) -> Bytes {
        let rest = self.buf.slice(self.pos..self.end);
        self.pos = self.end;
        rest
    }
}

/// Serializes a message: a zeroed header slot followed by body fields.
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn with_capacity(body_capacity: usize) -> Self {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + body_capacity);
        buf.put_bytes(0, HEADER_SIZE);
        Self { buf }
    }

    /// Absolute position in the output, header included.
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_i32(&mut self, value: i32) {
        self.buf.put_i32_le(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.put_u32_le(value);
    }

    pub fn put_i64(&mut self, value: i64) {
        self.buf.put_i64_le(value);
    }

    pub fn put_cstring(&mut self, field: &'static str, value: &str) -> Result<(), ProtocolError> {
        if value.as_bytes().contains(&0) {
            return Err(ProtocolError::InteriorNul { field });
        }
        self.buf.put_slice(value.as_bytes());
        self.buf.put_u8(0);
        Ok(())
    }

    pub fn put_document(&mut self, doc: &Document) {
        self.buf.put_slice(doc.as_bytes());
    }

    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Overwrites an int32 previously written at absolute position `at`.
    pub fn patch_i32(&mut self, at: usize, value: i32) {
        self.buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Bytes written so far, header slot included.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Stamps the final size into `header`, writes it into the header slot and
    /// returns the complete message.
    pub fn finish(mut self, header: &mut MessageHeader) -> Result<BytesMut, ProtocolError> {
        let size = self.buf.len();
        if size > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size,
                max: MAX_MESSAGE_SIZE,
            });
        }
        header.size = size as i32;
        header.write_into(&mut self.buf[..HEADER_SIZE]);
        Ok(self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(bytes: &[u8]) -> Bytes {
        Bytes::copy_from_slice(bytes)
    }

    #[test]
    fn test_read_fixed_fields() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&7i32.to_le_bytes());
        raw.extend_from_slice(&(-2i64).to_le_bytes());
        raw.push(1);
        let buf = body(&raw);
        let mut reader = WireReader::new(&buf, OpCode::Reply);

        assert_eq!(reader.read_i32("flags").unwrap(), 7);
        assert_eq!(reader.read_i64("cursor_id").unwrap(), -2);
        assert_eq!(reader.read_u8("kind").unwrap(), 1);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_truncated_fixed_field() {
        let buf = body(&[1, 2]);
        let mut reader = WireReader::new(&buf, OpCode::Query);
        match reader.read_i32("flags") {
            Err(ProtocolError::Truncated {
                field,
                offset,
                needed,
                available,
                ..
            }) => {
                assert_eq!(field, "flags");
                assert_eq!(offset, 0);
                assert_eq!(needed, 4);
                assert_eq!(available, 2);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_cstring() {
        let buf = body(b"admin.$cmd\0rest");
        let mut reader = WireReader::new(&buf, OpCode::Query);
        assert_eq!(reader.read_cstring("ns").unwrap(), "admin.$cmd");
        assert_eq!(reader.offset(), 11);
        assert_eq!(reader.remaining(), 4);
    }

    #[test]
    fn test_unterminated_cstring() {
        let buf = body(b"admin.$cmd");
        let mut reader = WireReader::new(&buf, OpCode::Query);
        assert!(matches!(
            reader.read_cstring("ns"),
            Err(ProtocolError::UnterminatedCString { offset: 0, .. })
        ));
    }

    #[test]
    fn test_invalid_utf8_cstring() {
        let buf = body(&[0xff, 0xfe, 0]);
        let mut reader = WireReader::new(&buf, OpCode::Insert);
        assert!(matches!(
            reader.read_cstring("ns"),
            Err(ProtocolError::InvalidUtf8 { .. })
        ));
    }

    #[test]
    fn test_document_length_checks() {
        // Declares 16 bytes but only 5 are present.
        let buf = body(&[16, 0, 0, 0, 0]);
        let mut reader = WireReader::new(&buf, OpCode::Insert);
        assert!(matches!(
            reader.read_document("docs"),
            Err(ProtocolError::InvalidDocumentLength { length: 16, .. })
        ));

        // Declares a length below the minimum.
        let buf = body(&[3, 0, 0, 0, 0]);
        let mut reader = WireReader::new(&buf, OpCode::Insert);
        assert!(matches!(
            reader.read_document("docs"),
            Err(ProtocolError::InvalidDocumentLength { length: 3, .. })
        ));
    }

    #[test]
    fn test_read_documents_fills_remainder() {
        let buf = body(&[5, 0, 0, 0, 0, 5, 0, 0, 0, 0]);
        let mut reader = WireReader::new(&buf, OpCode::Insert);
        let docs = reader.read_documents("docs").unwrap();
        assert_eq!(docs.len(), 2);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_sub_reader_is_bounded() {
        let buf = body(&[5, 0, 0, 0, 0, 5, 0, 0, 0, 0]);
        let mut reader = WireReader::new(&buf, OpCode::Msg);
        let mut sub = reader.sub_reader("sequence", 5).unwrap();
        assert_eq!(sub.read_documents("documents").unwrap().len(), 1);
        assert_eq!(reader.offset(), 5);
        assert_eq!(reader.remaining(), 5);
    }

    #[test]
    fn test_writer_rejects_interior_nul() {
        let mut writer = WireWriter::with_capacity(0);
        assert!(matches!(
            writer.put_cstring("ns", "a\0b"),
            Err(ProtocolError::InteriorNul { field: "ns" })
        ));
    }

    #[test]
    fn test_writer_finish_stamps_size() {
        let mut writer = WireWriter::with_capacity(4);
        writer.put_i32(99);
        let mut header = MessageHeader::new(3, 0, OpCode::Delete);
        let out = writer.finish(&mut header).unwrap();
        assert_eq!(out.len(), 20);
        assert_eq!(header.size, 20);
        assert_eq!(&out[..4], &20i32.to_le_bytes());
        assert_eq!(&out[4..8], &3i32.to_le_bytes());
    }
}
