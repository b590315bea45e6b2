//! Policy hooks a session consults for every client message.
//!
//! A factory builds one [`ProxyInterceptor`] per accepted client. The interceptor
//! sees each request before it is forwarded and may pass it through (optionally
//! rewritten, optionally with a [`ResponseInterceptor`] for the reply), answer it
//! directly through the [`Responder`], or fail it with an [`InterceptError`].

use crate::pool::{PoolCounters, PoolStats};
use crate::reply::{self, RequestIds};
use mongonet_protocol::{Document, Message, MessageHeader, ProtocolError};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Error reported back to the client with an explicit code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MongoError {
    pub code: i32,
    pub code_name: String,
    pub message: Option<String>,
}

impl MongoError {
    pub fn new(code: i32, code_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            code_name: code_name.into(),
            message: Some(message.into()),
        }
    }

    /// An error carrying only a code and code name.
    pub fn bare(code: i32, code_name: impl Into<String>) -> Self {
        Self {
            code,
            code_name: code_name.into(),
            message: None,
        }
    }

    /// `{ok: 0, errmsg?, code, codeName}`
    pub fn to_document(&self) -> bson::Document {
        let mut doc = bson::doc! { "ok": 0_i32 };
        if let Some(message) = &self.message {
            doc.insert("errmsg", message.as_str());
        }
        doc.insert("code", self.code);
        doc.insert("codeName", self.code_name.as_str());
        doc
    }
}

impl fmt::Display for MongoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code={} codeName={}", self.code, self.code_name)?;
        if let Some(message) = &self.message {
            write!(f, " errmsg={}", message)?;
        }
        Ok(())
    }
}

impl std::error::Error for MongoError {}

/// Failure raised by an interceptor hook.
#[derive(Debug, Error)]
pub enum InterceptError {
    #[error("{0}")]
    Mongo(MongoError),

    #[error("{0}")]
    Failed(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl InterceptError {
    pub fn failed(message: impl Into<String>) -> Self {
        InterceptError::Failed(message.into())
    }

    /// The document sent to the client in place of a reply.
    ///
    /// Coded errors carry their code; anything else is reported as `errmsg` alone.
    pub fn to_document(&self) -> bson::Document {
        match self {
            InterceptError::Mongo(err) => err.to_document(),
            other => bson::doc! { "ok": 0_i32, "errmsg": other.to_string() },
        }
    }
}

impl From<MongoError> for InterceptError {
    fn from(err: MongoError) -> Self {
        InterceptError::Mongo(err)
    }
}

/// What a session should do with an intercepted request.
pub enum Interception {
    /// Send `message` to the backend; route the reply through `response` if set.
    Forward {
        message: Message,
        response: Option<Box<dyn ResponseInterceptor>>,
    },
    /// The interceptor answered through the responder; skip the backend.
    Handled,
}

impl Interception {
    /// Forwards the message unchanged.
    pub fn forward(message: Message) -> Self {
        Interception::Forward {
            message,
            response: None,
        }
    }
}

impl fmt::Debug for Interception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interception::Forward { message, response } => f
                .debug_struct("Forward")
                .field("message", message)
                .field("response_hook", &response.is_some())
                .finish(),
            Interception::Handled => write!(f, "Handled"),
        }
    }
}

/// Rewrites backend replies for a single request/response cycle.
pub trait ResponseInterceptor: Send {
    fn intercept_mongo_to_client(&mut self, reply: Message) -> Result<Message, InterceptError>;
}

/// Per-session policy.
pub trait ProxyInterceptor: Send {
    fn intercept_client_to_mongo(
        &mut self,
        message: Message,
        responder: &mut Responder<'_>,
    ) -> Result<Interception, InterceptError>;

    fn track_request(&mut self, _header: &MessageHeader) {}

    fn track_request_message(&mut self, _message: &Message) {}

    fn track_response(&mut self, _header: &MessageHeader) {}

    fn track_response_message(&mut self, _message: &Message) {}

    /// Probed every [`check_connection_interval`](Self::check_connection_interval)
    /// while the session waits on the client. An error closes the session.
    fn check_connection(&mut self) -> Result<(), InterceptError> {
        Ok(())
    }

    fn check_connection_interval(&self) -> Option<Duration> {
        None
    }

    /// Called once when the session ends.
    fn close(&mut self) {}
}

/// Builds interceptors for new sessions. Called concurrently from many tasks.
pub trait InterceptorFactory: Send + Sync {
    fn new_interceptor(
        &self,
        session: &SessionInfo,
    ) -> Result<Box<dyn ProxyInterceptor>, InterceptError>;
}

/// What an interceptor may know about its session.
#[derive(Clone)]
pub struct SessionInfo {
    pub id: String,
    pub remote_addr: SocketAddr,
    /// Port the proxy accepted this client on.
    pub server_port: u16,
    /// SNI name the client sent during the TLS handshake.
    pub sni_name: Option<String>,
    pool: Arc<PoolCounters>,
}

impl SessionInfo {
    pub fn new(
        remote_addr: SocketAddr,
        server_port: u16,
        sni_name: Option<String>,
        pool: Arc<PoolCounters>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            remote_addr,
            server_port,
            sni_name,
            pool,
        }
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.snapshot()
    }

    /// `{connectionPool: {totalCreated, idle}}`
    pub fn stats_document(&self) -> bson::Document {
        let stats = self.pool_stats();
        let total_created = stats.total_created as i64;
        let idle = stats.idle as i64;
        bson::doc! {
            "connectionPool": {
                "totalCreated": total_created,
                "idle": idle,
            }
        }
    }
}

impl fmt::Debug for SessionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionInfo")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("server_port", &self.server_port)
            .field("sni_name", &self.sni_name)
            .finish()
    }
}

/// Queues replies an interceptor sends straight to the client.
///
/// Queued replies are written, in order, as soon as the hook returns.
pub struct Responder<'a> {
    ids: &'a RequestIds,
    replies: Vec<Message>,
}

impl<'a> Responder<'a> {
    pub fn new(ids: &'a RequestIds) -> Self {
        Self {
            ids,
            replies: Vec::new(),
        }
    }

    /// Answers `request` with `doc`, shaped for the request's opcode.
    pub fn respond_to_command(
        &mut self,
        request: &MessageHeader,
        doc: &bson::Document,
    ) -> Result<(), ProtocolError> {
        let doc = Document::from_bson(doc)?;
        let reply = reply::build_reply(request, self.ids.next_id(), doc)?;
        self.replies.push(reply);
        Ok(())
    }

    /// Answers `request` with the error document for `err`.
    pub fn respond_with_error(
        &mut self,
        request: &MessageHeader,
        err: &InterceptError,
    ) -> Result<(), ProtocolError> {
        let reply = reply::build_error_reply(request, self.ids.next_id(), Some(err))?;
        self.replies.push(reply);
        Ok(())
    }

    /// Queues an arbitrary message for the client.
    pub fn send(&mut self, message: Message) {
        self.replies.push(message);
    }

    pub fn pending(&self) -> usize {
        self.replies.len()
    }

    /// The queued replies, in send order.
    pub fn into_replies(self) -> Vec<Message> {
        self.replies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongonet_protocol::OpCode;

    #[test]
    fn test_mongo_error_document_field_order() {
        let err = MongoError::new(20000, "SNITesterError", "no sni");
        let doc = err.to_document();
        let keys: Vec<&str> = doc.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["ok", "errmsg", "code", "codeName"]);
        assert_eq!(doc.get_i32("ok").unwrap(), 0);
        assert_eq!(doc.get_i32("code").unwrap(), 20000);

        let bare = MongoError::bare(13, "Unauthorized").to_document();
        let keys: Vec<&str> = bare.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["ok", "code", "codeName"]);
    }

    #[test]
    fn test_plain_error_document() {
        let doc = InterceptError::failed("denied").to_document();
        assert_eq!(doc, bson::doc! { "ok": 0_i32, "errmsg": "denied" });
    }

    #[test]
    fn test_mongo_error_display() {
        let err = InterceptError::from(MongoError::new(2, "BadValue", "nope"));
        assert_eq!(err.to_string(), "code=2 codeName=BadValue errmsg=nope");
    }

    #[test]
    fn test_responder_queues_shaped_replies() {
        let ids = RequestIds::new();
        let mut responder = Responder::new(&ids);
        let request = MessageHeader::new(41, 0, OpCode::Command);
        responder
            .respond_to_command(&request, &bson::doc! { "ok": 1 })
            .unwrap();
        responder
            .respond_with_error(&request, &InterceptError::failed("x"))
            .unwrap();
        assert_eq!(responder.pending(), 2);

        let replies = responder.into_replies();
        assert!(replies
            .iter()
            .all(|r| r.op_code() == OpCode::CommandReply && r.header().response_to == 41));
        assert_ne!(
            replies[0].header().request_id,
            replies[1].header().request_id
        );
    }

    #[test]
    fn test_responder_rejects_non_request_opcode() {
        let ids = RequestIds::new();
        let mut responder = Responder::new(&ids);
        let request = MessageHeader::new(1, 0, OpCode::Insert);
        assert!(matches!(
            responder.respond_to_command(&request, &bson::doc! {}),
            Err(ProtocolError::NoReplyShape(OpCode::Insert))
        ));
        assert_eq!(responder.pending(), 0);
    }

    #[test]
    fn test_session_info_stats_document() {
        let counters = Arc::new(PoolCounters::default());
        let info = SessionInfo::new("127.0.0.1:5000".parse().unwrap(), 9999, None, counters);
        let doc = info.stats_document();
        let pool = doc.get_document("connectionPool").unwrap();
        assert_eq!(pool.get_i64("totalCreated").unwrap(), 0);
        assert_eq!(info.id.len(), 36);
    }
}
