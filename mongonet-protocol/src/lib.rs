//! # mongonet-protocol
//!
//! Wire protocol implementation for the MongoDB-style binary message protocol.
//!
//! This crate provides:
//! - The 16-byte message header and opcode table
//! - A closed set of message variants with byte-exact encode/decode
//! - Bounds-checked reader/writer primitives for little-endian fields,
//!   cstrings and self-length-prefixed documents
//! - An incremental decoder that frames whole messages out of a byte stream

pub mod codec;
pub mod document;
pub mod error;
pub mod header;
pub mod message;
pub mod wire;

pub use codec::Decoder;
pub use document::Document;
pub use error::ProtocolError;
pub use header::{MessageHeader, OpCode, HEADER_SIZE};
pub use message::{
    CommandMessage, CommandReplyMessage, DeleteMessage, InsertMessage, Message, MsgMessage,
    OpaqueMessage, QueryMessage, ReplyMessage, Section, UpdateMessage,
};

/// Maximum size of a single wire message, header included.
pub const MAX_MESSAGE_SIZE: usize = 48_000_000;

/// Default port of a MongoDB node.
pub const DEFAULT_PORT: u16 = 27017;

/// Returns whether a namespace addresses the command pseudo-collection (`<db>.$cmd`).
pub fn namespace_is_command(namespace: &str) -> bool {
    namespace.ends_with(".$cmd")
}

/// Returns the database part of a `<db>.<collection>` namespace.
pub fn database_of(namespace: &str) -> &str {
    match namespace.find('.') {
        Some(idx) => &namespace[..idx],
        None => namespace,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_is_command() {
        assert!(namespace_is_command("admin.$cmd"));
        assert!(namespace_is_command("test.$cmd"));
        assert!(!namespace_is_command("test.users"));
        assert!(!namespace_is_command("$cmd"));
    }

    #[test]
    fn test_database_of() {
        assert_eq!(database_of("admin.$cmd"), "admin");
        assert_eq!(database_of("test.users.archive"), "test");
        assert_eq!(database_of("plain"), "plain");
    }
}
