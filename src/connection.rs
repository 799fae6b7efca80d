mod establish;
mod serve;

pub(crate) use establish::CycleEnd;

use crate::config::{ConfigError, ServerConfig};
use crate::connector_set::ConnectorSet;
use crate::wire::{
    self, ErrorMessage, FIELD_MESSAGE_HEADERS, QUERY_COMPLETE, QUERY_EMPTY, QUERY_PARTIAL,
    REPLY_ADDR_HEADER,
};

use futures::future::BoxFuture;
use futures::FutureExt;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, Weak};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type WsSink = SplitSink<WsStream, Message>;

#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Configuration problems, including an auth token the server rejects.
    /// These are not helped by retry and escape the reconnect loop.
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("connection error: {0}")]
    Connection(String),

    /// An unexpected or malformed server frame during negotiation.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid usage: {0}")]
    InvalidUsage(String),

    #[error("connection closed")]
    Closed,
}

/// Context passed to handlers and required for query responses. For query
/// callbacks `response_address` carries the server's reply address; for
/// everything else it is absent.
#[derive(Debug, Clone)]
pub struct ConnectorContext {
    pub source_name: String,
    pub response_address: Option<String>,
}

pub type CloseHandler = Arc<dyn Fn(ConnectorContext) -> BoxFuture<'static, ()> + Send + Sync>;
pub type ConnectHandler =
    Arc<dyn Fn(ConnectorContext, Value) -> BoxFuture<'static, ()> + Send + Sync>;
pub type PublishHandler =
    Arc<dyn Fn(ConnectorContext, Value) -> BoxFuture<'static, ()> + Send + Sync>;
pub type QueryHandler =
    Arc<dyn Fn(ConnectorContext, Value) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone, Default)]
pub(crate) struct Handlers {
    pub close: Option<CloseHandler>,
    pub connect: Option<ConnectHandler>,
    pub publish: Option<PublishHandler>,
    pub query: Option<QueryHandler>,
}

/// Readiness of the session, published through a watch channel so that
/// senders blocked on a dead session observe the successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadyState {
    NotReady,
    Ready,
    Closed,
}

/// The connection to the server on behalf of a single source.
///
/// Owns the socket and the reconnect state machine; dispatches inbound
/// publish/query frames to the configured handlers and serializes outbound
/// sends behind the readiness signal. Safe for concurrent use.
pub struct SourceConnection {
    source_name: String,
    config: ServerConfig,
    /// Stable per source and process; the server uses it to recognize a
    /// resumed session across reconnects.
    reconnect_secret: String,
    handlers: StdMutex<Handlers>,
    sink: Mutex<Option<WsSink>>,
    ready_tx: watch::Sender<ReadyState>,
    is_connected: AtomicBool,
    closed: AtomicBool,
    connector_set: OnceLock<Weak<ConnectorSet>>,
}

impl SourceConnection {
    pub fn new(source_name: String, config: ServerConfig) -> Self {
        let suffix = config
            .fixed_reconnect_secret
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let reconnect_secret = format!("{source_name}_{suffix}");
        let (ready_tx, _) = watch::channel(ReadyState::NotReady);

        SourceConnection {
            source_name,
            config,
            reconnect_secret,
            handlers: StdMutex::new(Handlers::default()),
            sink: Mutex::new(None),
            ready_tx,
            is_connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            connector_set: OnceLock::new(),
        }
    }

    /// The source on whose behalf this connection operates.
    pub fn source(&self) -> &str {
        &self.source_name
    }

    /// The configuration snapshot this connection was built from.
    pub fn server_config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::SeqCst)
    }

    pub(crate) fn reconnect_secret(&self) -> &str {
        &self.reconnect_secret
    }

    pub(crate) fn attach_set(&self, set: Weak<ConnectorSet>) {
        let _ = self.connector_set.set(set);
    }

    /// The set this connection belongs to, if it is still alive.
    pub fn connector_set(&self) -> Option<Arc<ConnectorSet>> {
        self.connector_set.get().and_then(Weak::upgrade)
    }

    /// Declares the owning set healthy (starts the health probe).
    pub async fn declare_healthy(&self) -> Result<(), ConnectorError> {
        match self.connector_set() {
            Some(set) => set.declare_healthy().await,
            None => Ok(()),
        }
    }

    /// Declares the owning set unhealthy (tears the health probe down).
    pub async fn declare_unhealthy(&self) {
        if let Some(set) = self.connector_set() {
            set.declare_unhealthy().await;
        }
    }

    /// Health of the owning set; `None` until a declaration has been made.
    pub fn is_healthy(&self) -> Option<bool> {
        self.connector_set().and_then(|set| set.is_healthy())
    }

    /// Provides handlers for close, connect, publish, and query operations.
    /// Any handler may be absent; frames without a handler are logged and
    /// dropped.
    pub fn configure_handlers(
        &self,
        close: Option<CloseHandler>,
        connect: Option<ConnectHandler>,
        publish: Option<PublishHandler>,
        query: Option<QueryHandler>,
    ) {
        let mut handlers = self.handlers.lock().expect("handler lock poisoned");
        handlers.close = close;
        handlers.connect = connect;
        handlers.publish = publish;
        handlers.query = query;
    }

    pub(crate) fn handlers(&self) -> Handlers {
        self.handlers.lock().expect("handler lock poisoned").clone()
    }

    /// Runs the connection: connect, authenticate, negotiate, then serve
    /// until the server requires a reconnect or the socket fails, looping
    /// with backoff. Returns only on a terminal close, on an auth/config
    /// failure, or on any failure when `failOnConnectionError` is set.
    pub async fn run(&self) -> Result<(), ConnectorError> {
        let mut consecutive_failures: u64 = 0;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(());
            }
            info!(
                source = %self.source_name,
                server = %self.config.target_server,
                "connecting to server"
            );

            let cycle = establish::perform_connection(self).await;
            let reached_ready = self.is_connected();
            self.teardown_session().await;
            if reached_ready {
                consecutive_failures = 0;
                self.invoke_close_handler().await;
            }

            match cycle {
                Ok(CycleEnd::TestClose) => {
                    info!(source = %self.source_name, "connection completing");
                    return Ok(());
                }
                Ok(CycleEnd::ReconnectRequired) => {
                    debug!(source = %self.source_name, "server requested reconnect");
                }
                Ok(CycleEnd::StreamClosed) => {
                    debug!(source = %self.source_name, "server closed the socket");
                }
                Err(err @ ConnectorError::Config(_)) => {
                    // Not recoverable and not helped by continuous retry.
                    return Err(err);
                }
                Err(err) => {
                    consecutive_failures += 1;
                    if self.config.fail_on_connection_error {
                        error!(
                            source = %self.source_name,
                            "failOnConnectionError set and could not connect: {err}"
                        );
                        return Err(err);
                    }
                    let wait = Duration::from_millis(500 * consecutive_failures);
                    warn!(
                        source = %self.source_name,
                        "connection cycle failed ({err}); waiting {wait:?} to reconnect"
                    );
                    sleep(wait).await;
                }
            }
        }
    }

    /// Closes the socket and marks the connection terminally closed; any
    /// senders still waiting on readiness observe the closure.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.ready_tx.send_replace(ReadyState::Closed);
        let mut sink = self.sink.lock().await;
        if let Some(sink) = sink.as_mut() {
            let _ = sink.send(Message::Close(None)).await;
        }
        *sink = None;
        self.is_connected.store(false, Ordering::SeqCst);
    }

    /// Responds to a query. `code` must be 100 (partial), 200 (complete),
    /// or 204 (empty); non-empty codes require a body. The context must be
    /// the one handed to the query handler.
    pub async fn send_query_response(
        &self,
        ctx: &ConnectorContext,
        code: i64,
        body: Option<Value>,
    ) -> Result<(), ConnectorError> {
        if !matches!(code, QUERY_PARTIAL | QUERY_COMPLETE | QUERY_EMPTY) {
            return Err(ConnectorError::InvalidUsage(format!(
                "send_query_response(): invalid code: {code}"
            )));
        }
        if code != QUERY_EMPTY && body.is_none() {
            return Err(ConnectorError::InvalidUsage(
                "send_query_response(): non-empty responses require a body".to_string(),
            ));
        }
        let reply_address = self.reply_address(ctx)?;
        let frame = wire::query_response_frame(code, reply_address, body.as_ref());
        self.transmit(&frame).await
    }

    /// Responds to a query with an error (status 400). The error must carry
    /// a code, a template, and the substitution parameters.
    pub async fn send_query_error(
        &self,
        ctx: &ConnectorContext,
        error: &ErrorMessage,
    ) -> Result<(), ConnectorError> {
        if error.code.is_empty() || error.template.is_empty() {
            return Err(ConnectorError::InvalidUsage(format!(
                "send_query_error(): missing or incomplete error message information: {error:?}"
            )));
        }
        let reply_address = self.reply_address(ctx)?;
        let body = serde_json::to_value(error)?;
        let frame = wire::query_response_frame(wire::QUERY_ERROR, reply_address, Some(&body));
        self.transmit(&frame).await
    }

    /// Sends a notification (an event from this source) to the server.
    pub async fn send_notification(&self, body: Value) -> Result<(), ConnectorError> {
        let frame = wire::notification_frame(&self.source_name, &body);
        self.transmit(&frame).await
    }

    fn reply_address<'a>(&self, ctx: &'a ConnectorContext) -> Result<&'a str, ConnectorError> {
        if ctx.source_name != self.source_name {
            return Err(ConnectorError::InvalidUsage(format!(
                "context source {} does not belong to connection for {}",
                ctx.source_name, self.source_name
            )));
        }
        ctx.response_address.as_deref().ok_or_else(|| {
            ConnectorError::InvalidUsage("query response context has no reply address".to_string())
        })
    }

    /// Sends a frame once the connection is READY. A sender scheduled while
    /// the session is down (or that loses the socket mid-send) waits for the
    /// next session; nothing is ever written to a dead socket.
    async fn transmit(&self, frame: &Value) -> Result<(), ConnectorError> {
        let raw = serde_json::to_string(frame)?;
        let mut ready_rx = self.ready_tx.subscribe();
        loop {
            let state = *ready_rx
                .wait_for(|state| *state != ReadyState::NotReady)
                .await
                .map_err(|_| ConnectorError::Closed)?;
            if state == ReadyState::Closed {
                return Err(ConnectorError::Closed);
            }

            let sent = {
                let mut sink = self.sink.lock().await;
                match sink.as_mut() {
                    Some(sink) => match sink.send(Message::Text(raw.clone())).await {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(
                                source = %self.source_name,
                                "send failed, waiting for the next session: {e}"
                            );
                            false
                        }
                    },
                    None => false,
                }
            };
            if sent {
                return Ok(());
            }

            // Readiness was observed but the socket is gone; wait for the
            // state to move before retrying on the successor session.
            if ready_rx.changed().await.is_err() {
                return Err(ConnectorError::Closed);
            }
        }
    }

    /// Sends a raw control message on the current socket, if any. Used by
    /// the serve loop for ping/pong traffic.
    pub(crate) async fn send_control(&self, message: Message) -> Result<(), ConnectorError> {
        let mut sink = self.sink.lock().await;
        match sink.as_mut() {
            Some(sink) => Ok(sink.send(message).await?),
            None => Err(ConnectorError::Closed),
        }
    }

    pub(crate) async fn install_session(&self, sink: WsSink) {
        *self.sink.lock().await = Some(sink);
        self.is_connected.store(true, Ordering::SeqCst);
        self.ready_tx.send_replace(ReadyState::Ready);
        debug!(source = %self.source_name, "connection ready");
    }

    pub(crate) async fn teardown_session(&self) {
        let next = if self.closed.load(Ordering::SeqCst) {
            ReadyState::Closed
        } else {
            ReadyState::NotReady
        };
        self.ready_tx.send_replace(next);
        *self.sink.lock().await = None;
        self.is_connected.store(false, Ordering::SeqCst);
    }

    /// Builds the handler context, extracting the reply address from the
    /// frame's message headers when present.
    pub(crate) fn make_context(&self, message: Option<&Value>) -> ConnectorContext {
        let response_address = message
            .and_then(|m| m.get(FIELD_MESSAGE_HEADERS))
            .and_then(|headers| headers.get(REPLY_ADDR_HEADER))
            .and_then(Value::as_str)
            .map(str::to_string);
        ConnectorContext {
            source_name: self.source_name.clone(),
            response_address,
        }
    }

    async fn invoke_close_handler(&self) {
        if let Some(handler) = self.handlers().close {
            let ctx = self.make_context(None);
            invoke_guarded("close", handler(ctx)).await;
        }
    }
}

/// Runs a handler future, containing any panic so that a misbehaving
/// handler cannot tear down the connection.
pub(crate) async fn invoke_guarded(name: &str, fut: BoxFuture<'static, ()>) {
    if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
        let detail = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        error!(handler = name, "handler panicked: {detail}");
    }
}
