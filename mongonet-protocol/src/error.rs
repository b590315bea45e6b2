//! Protocol error types.

use crate::header::OpCode;
use thiserror::Error;

/// Errors raised while framing, decoding or encoding wire messages.
///
/// Every malformed-message variant carries the opcode, the field being read and
/// the byte offset (relative to the start of the message body) so a failure can be
/// traced back to the exact spot in the buffer.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(
        "truncated {op_code} message: field '{field}' needs {needed} bytes at offset {offset}, \
         {available} available"
    )]
    Truncated {
        op_code: OpCode,
        field: &'static str,
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("unterminated cstring '{field}' in {op_code} message at offset {offset}")]
    UnterminatedCString {
        op_code: OpCode,
        field: &'static str,
        offset: usize,
    },

    #[error("invalid UTF-8 in cstring '{field}' of {op_code} message at offset {offset}")]
    InvalidUtf8 {
        op_code: OpCode,
        field: &'static str,
        offset: usize,
    },

    #[error(
        "invalid document length {length} for '{field}' in {op_code} message at offset {offset} \
         ({available} bytes available)"
    )]
    InvalidDocumentLength {
        op_code: OpCode,
        field: &'static str,
        offset: usize,
        length: i32,
        available: usize,
    },

    #[error("unknown section kind {kind} in OP_MSG at offset {offset}")]
    UnknownSectionKind { kind: u8, offset: usize },

    #[error("invalid document sequence size {size} in OP_MSG at offset {offset}")]
    InvalidSectionSize { size: i32, offset: usize },

    #[error("OP_MSG carries no sections")]
    EmptyMsg,

    #[error("OP_MSG checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("cstring '{field}' contains an interior NUL byte")]
    InteriorNul { field: &'static str },

    #[error("unknown opcode: {0}")]
    UnknownOpCode(i32),

    #[error("message size {size} is smaller than the 16-byte header")]
    MessageTooSmall { size: i32 },

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("document is not a valid length-prefixed blob: {0}")]
    InvalidDocument(String),

    #[error("BSON serialization error: {0}")]
    BsonSer(#[from] bson::ser::Error),

    #[error("BSON deserialization error: {0}")]
    BsonDe(#[from] bson::de::Error),

    #[error("no reply shape for {0} requests")]
    NoReplyShape(OpCode),
}

impl ProtocolError {
    /// Returns whether the error describes bytes that violate the wire layout.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            ProtocolError::Truncated { .. }
                | ProtocolError::UnterminatedCString { .. }
                | ProtocolError::InvalidUtf8 { .. }
                | ProtocolError::InvalidDocumentLength { .. }
                | ProtocolError::UnknownSectionKind { .. }
                | ProtocolError::InvalidSectionSize { .. }
                | ProtocolError::EmptyMsg
                | ProtocolError::ChecksumMismatch { .. }
                | ProtocolError::UnknownOpCode(_)
                | ProtocolError::MessageTooSmall { .. }
                | ProtocolError::MessageTooLarge { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncated_display_carries_context() {
        let err = ProtocolError::Truncated {
            op_code: OpCode::Query,
            field: "skip",
            offset: 14,
            needed: 4,
            available: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("OP_QUERY"));
        assert!(msg.contains("skip"));
        assert!(msg.contains("14"));
        assert!(msg.contains("2 available"));
    }

    #[test]
    fn test_checksum_display_is_hex() {
        let err = ProtocolError::ChecksumMismatch {
            expected: 0xABC,
            actual: 0xDEF,
        };
        let msg = err.to_string();
        assert!(msg.contains("0xabc"));
        assert!(msg.contains("0xdef"));
    }

    #[test]
    fn test_is_malformed() {
        assert!(ProtocolError::EmptyMsg.is_malformed());
        assert!(ProtocolError::UnknownOpCode(9999).is_malformed());
        assert!(ProtocolError::MessageTooSmall { size: 3 }.is_malformed());
        assert!(!ProtocolError::InteriorNul { field: "ns" }.is_malformed());
        assert!(!ProtocolError::NoReplyShape(OpCode::Insert).is_malformed());
    }
}
