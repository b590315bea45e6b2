//! Per-client session loop.
//!
//! Each cycle reads one client message, runs it past the interceptor, and either
//! answers locally or forwards it over a leased backend connection and relays the
//! reply. A legacy query with the exhaust bit set keeps the lease until the
//! backend sends a reply with a zero cursor id.

use crate::context::ProxyContext;
use crate::error::ProxyError;
use crate::interceptor::{
    Interception, InterceptError, ProxyInterceptor, Responder, ResponseInterceptor, SessionInfo,
};
use crate::pool::{Connector, PooledConnection};
use crate::reply;
use mongonet_protocol::{Decoder, Message};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::time::{Instant, Interval, MissedTickBehavior};

enum Wake {
    Read(std::io::Result<usize>),
    Check,
    Shutdown,
}

/// One proxied client connection.
pub struct ProxySession<S, C: Connector> {
    info: SessionInfo,
    client: S,
    decoder: Decoder,
    context: Arc<ProxyContext<C>>,
    interceptor: Option<Box<dyn ProxyInterceptor>>,
    shutdown: Option<broadcast::Receiver<()>>,
}

impl<S, C> ProxySession<S, C>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    C: Connector,
{
    pub fn new(
        client: S,
        info: SessionInfo,
        context: Arc<ProxyContext<C>>,
        interceptor: Option<Box<dyn ProxyInterceptor>>,
    ) -> Self {
        Self {
            info,
            client,
            decoder: Decoder::new(),
            context,
            interceptor,
            shutdown: None,
        }
    }

    /// Ends the session when `shutdown` fires while it waits on the client.
    pub fn with_shutdown(mut self, shutdown: broadcast::Receiver<()>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Drives the session to completion. Clean client EOF returns `Ok(())`.
    pub async fn run(mut self) -> Result<(), ProxyError> {
        let addr = self.info.remote_addr;
        tracing::debug!("[{}] Session {} started", addr, self.info.id);

        let result = self.serve().await;

        if let Some(mut interceptor) = self.interceptor.take() {
            interceptor.close();
        }

        match &result {
            Ok(()) => tracing::debug!("[{}] Session {} closed", addr, self.info.id),
            Err(ProxyError::ShuttingDown) => {
                tracing::debug!("[{}] Session {} stopped for shutdown", addr, self.info.id)
            }
            Err(e) => {
                self.context.record_error(e.label());
                tracing::warn!("[{}] Session {} failed: {}", addr, self.info.id, e);
            }
        }
        result
    }

    async fn serve(&mut self) -> Result<(), ProxyError> {
        let mut check = self
            .interceptor
            .as_ref()
            .and_then(|i| i.check_connection_interval())
            .filter(|period| !period.is_zero())
            .map(|period| {
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                interval
            });

        while let Some(message) = self.next_request(&mut check).await? {
            self.handle_request(message).await?;
        }
        Ok(())
    }

    /// Reads the next whole client message; `None` on EOF at a message boundary.
    async fn next_request(
        &mut self,
        check: &mut Option<Interval>,
    ) -> Result<Option<Message>, ProxyError> {
        let addr = self.info.remote_addr;
        loop {
            if let Some(message) = self.decoder.decode_message()? {
                return Ok(Some(message));
            }

            let wake = tokio::select! {
                read = self.client.read_buf(self.decoder.buffer_mut()) => Wake::Read(read),
                _ = tick(check) => Wake::Check,
                _ = shutdown_signal(&mut self.shutdown) => Wake::Shutdown,
            };

            match wake {
                Wake::Read(Ok(0)) => {
                    let buffered = self.decoder.buffered();
                    if buffered == 0 {
                        tracing::debug!("[{}] Connection closed by client", addr);
                        return Ok(None);
                    }
                    return Err(ProxyError::UnexpectedEof { buffered });
                }
                Wake::Read(Ok(n)) => tracing::trace!("[{}] Received {} bytes", addr, n),
                Wake::Read(Err(e)) => return Err(ProxyError::Io(e)),
                Wake::Check => {
                    if let Some(interceptor) = self.interceptor.as_mut() {
                        interceptor
                            .check_connection()
                            .map_err(ProxyError::ConnectionCheck)?;
                    }
                }
                Wake::Shutdown => return Err(ProxyError::ShuttingDown),
            }
        }
    }

    async fn handle_request(&mut self, message: Message) -> Result<(), ProxyError> {
        let addr = self.info.remote_addr;
        let context = self.context.clone();
        let request = *message.header();
        let expects_response = message.has_response();
        let started = std::time::Instant::now();

        tracing::debug!("[{}] Request: {}", addr, message);
        context.stats.requests_total.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = context.metrics {
            metrics
                .requests_total
                .with_label_values(&[request.op_code.label()])
                .inc();
        }

        let (outcome, queued) = match self.interceptor.as_mut() {
            None => (Ok(Interception::forward(message)), Vec::new()),
            Some(interceptor) => {
                interceptor.track_request(&request);
                interceptor.track_request_message(&message);
                let mut responder = Responder::new(&context.request_ids);
                let outcome = interceptor.intercept_client_to_mongo(message, &mut responder);
                record_intercept(&context, &outcome);
                (outcome, responder.into_replies())
            }
        };
        self.write_replies(queued).await?;

        let (message, response_hook) = match outcome {
            Ok(Interception::Forward { message, response }) => (message, response),
            Ok(Interception::Handled) => {
                context
                    .stats
                    .short_circuited_total
                    .fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    "[{}] Request {} answered by interceptor",
                    addr,
                    request.request_id
                );
                return Ok(());
            }
            Err(err) => return self.fail_request(&request, expects_response, err).await,
        };

        let mut conn = context.pool.get().await?;
        let result = self.relay(&mut conn, message, response_hook).await;
        if result.is_err() {
            conn.mark_bad();
        }
        context.pool.release(conn).await;

        if let Some(ref metrics) = context.metrics {
            metrics
                .request_duration
                .with_label_values(&[request.op_code.label()])
                .observe(started.elapsed().as_secs_f64());
        }
        result
    }

    /// Turns an interceptor error into a client reply, or ends the session when
    /// the request takes no reply.
    async fn fail_request(
        &mut self,
        request: &mongonet_protocol::MessageHeader,
        expects_response: bool,
        err: InterceptError,
    ) -> Result<(), ProxyError> {
        if !expects_response {
            return Err(ProxyError::Intercept(err));
        }
        tracing::info!(
            "[{}] Responding with error to request {}: {}",
            self.info.remote_addr,
            request.request_id,
            err
        );
        let reply =
            reply::build_error_reply(request, self.context.request_ids.next_id(), Some(&err))?;
        self.write_replies(vec![reply]).await
    }

    /// Forwards one request and relays its reply (or reply stream).
    async fn relay(
        &mut self,
        conn: &mut PooledConnection<C::Stream>,
        mut message: Message,
        mut response_hook: Option<Box<dyn ResponseInterceptor>>,
    ) -> Result<(), ProxyError> {
        let addr = self.info.remote_addr;
        let exhaust = message.is_exhaust();

        conn.send(&mut message).await?;
        tracing::trace!("[{}] Forwarded {} over #{}", addr, message, conn.id());

        if !message.has_response() {
            return Ok(());
        }

        loop {
            let reply = conn.recv().await?;
            let more = if exhaust {
                match &reply {
                    Message::Reply(r) => r.cursor_id != 0,
                    other => return Err(ProxyError::UnexpectedExhaustReply(other.op_code())),
                }
            } else {
                matches!(&reply, Message::Msg(m) if m.more_to_come())
            };

            let mut reply = match response_hook.as_mut() {
                Some(hook) => hook.intercept_mongo_to_client(reply)?,
                None => reply,
            };

            let bytes = reply.encode()?;
            self.client.write_all(&bytes).await?;
            tracing::debug!("[{}] Response: {}", addr, reply);

            if let Some(ref metrics) = self.context.metrics {
                metrics
                    .replies_total
                    .with_label_values(&[reply.op_code().label()])
                    .inc();
            }
            if let Some(interceptor) = self.interceptor.as_mut() {
                interceptor.track_response(reply.header());
                interceptor.track_response_message(&reply);
            }

            if !more {
                return Ok(());
            }
        }
    }

    async fn write_replies(&mut self, replies: Vec<Message>) -> Result<(), ProxyError> {
        for mut reply in replies {
            let bytes = reply.encode()?;
            self.client.write_all(&bytes).await?;
            tracing::debug!("[{}] Local reply: {}", self.info.remote_addr, reply);
        }
        Ok(())
    }
}

fn record_intercept<C: Connector>(
    context: &ProxyContext<C>,
    outcome: &Result<Interception, InterceptError>,
) {
    if let Some(ref metrics) = context.metrics {
        let label = match outcome {
            Ok(Interception::Forward { .. }) => "forwarded",
            Ok(Interception::Handled) => "handled",
            Err(_) => "error",
        };
        metrics.intercepts_total.with_label_values(&[label]).inc();
    }
}

async fn tick(check: &mut Option<Interval>) {
    match check {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn shutdown_signal(shutdown: &mut Option<broadcast::Receiver<()>>) {
    match shutdown {
        Some(rx) => {
            let _ = rx.recv().await;
        }
        None => std::future::pending().await,
    }
}
