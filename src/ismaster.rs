//! Reference interceptor: answers `isMaster` and `sni` locally and forwards
//! everything else, logging the traffic it sees.

use bson::doc;
use mongonet_protocol::{namespace_is_command, Message, MessageHeader};
use mongonet_proxy::{
    InterceptError, Interception, InterceptorFactory, MongoError, ProxyInterceptor, Responder,
    SessionInfo,
};
use std::net::SocketAddr;

/// Wire versions advertised in the synthesized `isMaster` reply.
const MAX_WIRE_VERSION: i32 = 5;
const MIN_WIRE_VERSION: i32 = 0;

/// Error code reported when the `sni` reply cannot be built.
const SNI_ERROR_CODE: i32 = 20000;

/// Builds one [`IsMasterRewriter`] per client.
#[derive(Debug, Default)]
pub struct IsMasterRewriterFactory;

impl InterceptorFactory for IsMasterRewriterFactory {
    fn new_interceptor(
        &self,
        info: &SessionInfo,
    ) -> Result<Box<dyn ProxyInterceptor>, InterceptError> {
        Ok(Box::new(IsMasterRewriter {
            remote_addr: info.remote_addr,
            sni_name: info.sni_name.clone(),
        }))
    }
}

#[derive(Debug)]
pub struct IsMasterRewriter {
    remote_addr: SocketAddr,
    sni_name: Option<String>,
}

/// Which local command, if any, a request names.
#[derive(Debug, PartialEq, Eq)]
enum LocalCommand {
    IsMaster,
    Sni,
}

fn local_command(name: &str) -> Option<LocalCommand> {
    match name.to_ascii_lowercase().as_str() {
        "ismaster" => Some(LocalCommand::IsMaster),
        "sni" => Some(LocalCommand::Sni),
        _ => None,
    }
}

/// Command name of a legacy `$cmd` query or an OP_COMMAND.
///
/// A `$cmd` query that is empty or does not parse yields `None`; the backend
/// answers it with its own error.
fn command_name(message: &Message) -> Option<String> {
    match message {
        Message::Query(q) if namespace_is_command(&q.namespace) => match q.query.to_bson() {
            Ok(query) => query.keys().next().cloned(),
            Err(e) => {
                tracing::debug!("Forwarding unparsable command query: {}", e);
                None
            }
        },
        Message::Command(c) => Some(c.command_name.clone()),
        _ => None,
    }
}

impl IsMasterRewriter {
    fn answer(
        &self,
        command: LocalCommand,
        request: &MessageHeader,
        responder: &mut Responder<'_>,
    ) -> Result<(), InterceptError> {
        match command {
            LocalCommand::IsMaster => {
                let reply = doc! {
                    "maxWireVersion": MAX_WIRE_VERSION,
                    "minWireVersion": MIN_WIRE_VERSION,
                    "ok": 1,
                };
                responder.respond_to_command(request, &reply)?;
            }
            LocalCommand::Sni => {
                let sni_name = self.sni_name.clone().unwrap_or_default();
                let reply = doc! { "sniName": sni_name, "ok": 1 };
                responder.respond_to_command(request, &reply).map_err(|e| {
                    MongoError::new(SNI_ERROR_CODE, "SNITesterError", e.to_string())
                })?;
            }
        }
        Ok(())
    }
}

impl ProxyInterceptor for IsMasterRewriter {
    fn intercept_client_to_mongo(
        &mut self,
        message: Message,
        responder: &mut Responder<'_>,
    ) -> Result<Interception, InterceptError> {
        let command = command_name(&message).as_deref().and_then(local_command);
        match command {
            Some(command) => {
                tracing::debug!("[{}] Answering {:?} locally", self.remote_addr, command);
                self.answer(command, message.header(), responder)?;
                Ok(Interception::Handled)
            }
            None => Ok(Interception::forward(message)),
        }
    }

    fn track_request_message(&mut self, message: &Message) {
        tracing::info!("[{}] client -> mongo: {}", self.remote_addr, message);
    }

    fn track_response_message(&mut self, message: &Message) {
        tracing::info!("[{}] mongo -> client: {}", self.remote_addr, message);
    }

    fn close(&mut self) {
        tracing::debug!("[{}] Rewriter closed", self.remote_addr);
    }
}
