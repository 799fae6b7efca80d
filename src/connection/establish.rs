use super::{invoke_guarded, serve, ConnectorError, SourceConnection, WsStream};
use crate::config::{ConfigError, ServerConfig};
use crate::wire::{
    self, FIELD_BODY, FIELD_OP, FIELD_STATUS, OP_CONFIGURE_EXTENSION,
};

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, connect_async_tls_with_config, Connector};
use tracing::{debug, error};

const WS_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Up to this many status-only frames are tolerated while waiting for the
/// negotiated configuration.
const MAX_STATUS_FRAMES: usize = 10;

/// How one connection cycle ended, for cycles that ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CycleEnd {
    /// The server asked for a reconnect; re-dial immediately.
    ReconnectRequired,
    /// Test-only terminal close; leave the reconnect loop.
    TestClose,
    /// The socket closed cleanly; re-dial.
    StreamClosed,
}

/// Runs one full cycle: dial, authenticate, negotiate, then serve inside
/// READY until the cycle ends.
pub(crate) async fn perform_connection(
    conn: &SourceConnection,
) -> Result<CycleEnd, ConnectorError> {
    let ws = dial(conn.server_config()).await?;
    debug!(source = %conn.source(), "socket open");
    let (mut sink, mut stream) = ws.split();

    authenticate(conn, &mut sink, &mut stream).await?;
    let source_config = negotiate(conn, &mut sink, &mut stream).await?;

    if let Some(handler) = conn.handlers().connect {
        let ctx = conn.make_context(None);
        invoke_guarded("connect", handler(ctx, source_config)).await;
    }

    conn.install_session(sink).await;
    serve::process_messages(conn, &mut stream).await
}

async fn dial(config: &ServerConfig) -> Result<WsStream, ConnectorError> {
    let request = config.target_server.as_str().into_client_request()?;

    let connected = if config.disable_ssl_verification {
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| ConnectorError::Connection(format!("TLS connector setup failed: {e}")))?;
        let connect_future =
            connect_async_tls_with_config(request, None, false, Some(Connector::NativeTls(tls)));
        timeout(WS_CONNECT_TIMEOUT, connect_future).await
    } else {
        timeout(WS_CONNECT_TIMEOUT, connect_async(request)).await
    };

    let (ws_stream, _response) = connected
        .map_err(|_| ConnectorError::Connection("WebSocket connection timed out".to_string()))??;

    Ok(ws_stream)
}

/// Sends the access token for validation. A rejection is a configuration
/// error and escapes the reconnect loop.
async fn authenticate(
    conn: &SourceConnection,
    sink: &mut super::WsSink,
    stream: &mut SplitStream<WsStream>,
) -> Result<(), ConnectorError> {
    let token = conn
        .server_config()
        .auth_token
        .as_deref()
        .ok_or_else(|| ConfigError::Invalid("no authToken configured".to_string()))?;

    send_json(sink, &wire::validate_frame(token)).await?;
    let response = next_json(stream).await?;
    debug!(source = %conn.source(), "authenticate returned: {response}");

    if let Some(status) = response.get(FIELD_STATUS).and_then(Value::as_i64) {
        if status != 200 {
            let (code, message) = first_body_error(&response);
            error!(
                source = %conn.source(),
                "connect call failed: {status} :: {code}:{message}"
            );
            return Err(
                ConfigError::Invalid(format!("Connect call failed: {status} :: {code}:{message}"))
                    .into(),
            );
        }
    }
    Ok(())
}

/// Announces the source (with its reconnect secret) and waits for the
/// negotiated configuration, tolerating a bounded number of status-only
/// frames on the way.
async fn negotiate(
    conn: &SourceConnection,
    sink: &mut super::WsSink,
    stream: &mut SplitStream<WsStream>,
) -> Result<Value, ConnectorError> {
    let frame = wire::connect_extension_frame(conn.source(), conn.reconnect_secret());
    send_json(sink, &frame).await?;

    let mut response = next_json(stream).await?;
    let mut status_frames = 0;
    while response.get(FIELD_OP).is_none() && status_frames < MAX_STATUS_FRAMES {
        status_frames += 1;
        if let Some(status) = response.get(FIELD_STATUS).and_then(Value::as_i64) {
            debug!(source = %conn.source(), "connect returned: {status}");
            if status >= 300 {
                return Err(ConnectorError::Connection(format!(
                    "connection failed: negotiation returned status {status}"
                )));
            }
        }
        response = next_json(stream).await?;
    }

    let Some(op) = response.get(FIELD_OP).and_then(Value::as_str) else {
        return Err(ConnectorError::Protocol(format!(
            "no {OP_CONFIGURE_EXTENSION} message received after {status_frames} tries"
        )));
    };
    if op != OP_CONFIGURE_EXTENSION {
        return Err(ConnectorError::Protocol(format!(
            "unexpected operation for configuration: {op}"
        )));
    }

    response
        .pointer("/object/config")
        .cloned()
        .ok_or_else(|| {
            ConnectorError::Protocol(format!("malformed configuration message: {response}"))
        })
}

async fn send_json(sink: &mut super::WsSink, frame: &Value) -> Result<(), ConnectorError> {
    let raw = serde_json::to_string(frame)?;
    Ok(sink.send(Message::Text(raw)).await?)
}

/// Reads the next data frame and parses it as JSON; control frames are
/// skipped, closure is an error at this stage.
async fn next_json(stream: &mut SplitStream<WsStream>) -> Result<Value, ConnectorError> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => return Ok(serde_json::from_str(&text)?),
            Some(Ok(Message::Binary(data))) => return Ok(serde_json::from_slice(&data)?),
            Some(Ok(Message::Close(_))) | None => {
                return Err(ConnectorError::Connection(
                    "connection closed during negotiation".to_string(),
                ))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

fn first_body_error(response: &Value) -> (String, String) {
    let first = response
        .get(FIELD_BODY)
        .and_then(Value::as_array)
        .and_then(|errors| errors.first());
    let code = first
        .and_then(|e| e.get("code"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let message = first
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    (code, message)
}
