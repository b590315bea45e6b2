//! Message header and opcode table.
//!
//! Header layout (16 bytes, all fields little-endian int32):
//!
//! ```text
//! +--------+------------+-------------+---------+
//! |  size  | request_id | response_to | op_code |
//! | 4 bytes|   4 bytes  |   4 bytes   | 4 bytes |
//! +--------+------------+-------------+---------+
//! ```
//!
//! `size` counts the whole message, header included.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut};
use std::fmt;

/// Size of the fixed message header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Wire opcodes understood by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Reply,
    Update,
    Insert,
    Query,
    GetMore,
    Delete,
    KillCursors,
    Command,
    CommandReply,
    Msg,
}

impl OpCode {
    pub fn from_i32(value: i32) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(OpCode::Reply),
            2001 => Ok(OpCode::Update),
            2002 => Ok(OpCode::Insert),
            2004 => Ok(OpCode::Query),
            2005 => Ok(OpCode::GetMore),
            2006 => Ok(OpCode::Delete),
            2007 => Ok(OpCode::KillCursors),
            2010 => Ok(OpCode::Command),
            2011 => Ok(OpCode::CommandReply),
            2013 => Ok(OpCode::Msg),
            other => Err(ProtocolError::UnknownOpCode(other)),
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            OpCode::Reply => 1,
            OpCode::Update => 2001,
            OpCode::Insert => 2002,
            OpCode::Query => 2004,
            OpCode::GetMore => 2005,
            OpCode::Delete => 2006,
            OpCode::KillCursors => 2007,
            OpCode::Command => 2010,
            OpCode::CommandReply => 2011,
            OpCode::Msg => 2013,
        }
    }

    /// Stable lowercase label, used for metrics.
    pub fn label(self) -> &'static str {
        match self {
            OpCode::Reply => "reply",
            OpCode::Update => "update",
            OpCode::Insert => "insert",
            OpCode::Query => "query",
            OpCode::GetMore => "get_more",
            OpCode::Delete => "delete",
            OpCode::KillCursors => "kill_cursors",
            OpCode::Command => "command",
            OpCode::CommandReply => "command_reply",
            OpCode::Msg => "msg",
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpCode::Reply => write!(f, "OP_REPLY"),
            OpCode::Update => write!(f, "OP_UPDATE"),
            OpCode::Insert => write!(f, "OP_INSERT"),
            OpCode::Query => write!(f, "OP_QUERY"),
            OpCode::GetMore => write!(f, "OP_GET_MORE"),
            OpCode::Delete => write!(f, "OP_DELETE"),
            OpCode::KillCursors => write!(f, "OP_KILL_CURSORS"),
            OpCode::Command => write!(f, "OP_COMMAND"),
            OpCode::CommandReply => write!(f, "OP_COMMAND_REPLY"),
            OpCode::Msg => write!(f, "OP_MSG"),
        }
    }
}

/// Standard message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Total message length, header included. Recomputed on every encode.
    pub size: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: OpCode,
}

impl MessageHeader {
    pub fn new(request_id: i32, response_to: i32, op_code: OpCode) -> Self {
        Self {
            size: 0,
            request_id,
            response_to,
            op_code,
        }
    }

    /// Parses a header from the first 16 bytes of `buf`.
    ///
    /// Returns `Ok(None)` if fewer than 16 bytes are available.
    pub fn peek(mut buf: &[u8]) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let size = buf.get_i32_le();
        let request_id = buf.get_i32_le();
        let response_to = buf.get_i32_le();
        let op_code = OpCode::from_i32(buf.get_i32_le())?;
        Ok(Some(Self {
            size,
            request_id,
            response_to,
            op_code,
        }))
    }

    /// Writes the header into the first 16 bytes of `dst`.
    pub fn write_into(&self, mut dst: &mut [u8]) {
        dst.put_i32_le(self.size);
        dst.put_i32_le(self.request_id);
        dst.put_i32_le(self.response_to);
        dst.put_i32_le(self.op_code.as_i32());
    }
}
