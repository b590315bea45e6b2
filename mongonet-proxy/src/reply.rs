//! Replies the proxy synthesizes on its own.

use crate::interceptor::InterceptError;
use mongonet_protocol::{
    CommandReplyMessage, Document, Message, MessageHeader, MsgMessage, OpCode, ProtocolError,
    ReplyMessage,
};
use std::sync::atomic::{AtomicI32, Ordering};

/// Proxy-wide source of request ids for synthesized messages.
#[derive(Debug)]
pub struct RequestIds(AtomicI32);

impl RequestIds {
    pub fn new() -> Self {
        Self(AtomicI32::new(1))
    }

    /// Returns the next id. Wraps on overflow.
    pub fn next_id(&self) -> i32 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for RequestIds {
    fn default() -> Self {
        Self::new()
    }
}

/// `{ok: 1}` when there is no error, otherwise the error's own document.
pub fn error_document(err: Option<&InterceptError>) -> bson::Document {
    match err {
        None => bson::doc! { "ok": 1_i32 },
        Some(err) => err.to_document(),
    }
}

/// Wraps `doc` in the reply shape that matches the request's opcode.
///
/// Legacy queries and get-more get an OP_REPLY, OP_COMMAND gets an
/// OP_COMMAND_REPLY and OP_MSG gets a single-section OP_MSG. Other opcodes have
/// no reply shape.
pub fn build_reply(
    request: &MessageHeader,
    request_id: i32,
    doc: Document,
) -> Result<Message, ProtocolError> {
    let reply = match request.op_code {
        // Errors travel in errmsg, so the query-failure bit stays clear.
        OpCode::Query | OpCode::GetMore => {
            Message::Reply(ReplyMessage::new(request_id, request.request_id, vec![doc]))
        }
        OpCode::Command => Message::CommandReply(CommandReplyMessage::new(
            request_id,
            request.request_id,
            doc,
        )),
        OpCode::Msg => Message::Msg(MsgMessage::new(request_id, request.request_id, doc)),
        other => return Err(ProtocolError::NoReplyShape(other)),
    };
    Ok(reply)
}

/// Builds the reply reporting `err` (or success when `None`) for `request`.
pub fn build_error_reply(
    request: &MessageHeader,
    request_id: i32,
    err: Option<&InterceptError>,
) -> Result<Message, ProtocolError> {
    let doc = Document::from_bson(&error_document(err))?;
    build_reply(request, request_id, doc)
}
