use super::{invoke_guarded, ConnectorError, CycleEnd, SourceConnection, WsStream};
use crate::wire::{
    FIELD_OBJECT, FIELD_OP, FIELD_STATUS, OP_PUBLISH, OP_QUERY, OP_RECONNECT_REQUIRED,
    OP_TEST_CLOSE,
};

use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

const PING_INTERVAL: Duration = Duration::from_secs(20);
const PONG_TIMEOUT: Duration = Duration::from_secs(20);

/// The READY read loop: classifies each inbound frame and dispatches it,
/// sending keepalive pings when configured. Returns how the cycle ended.
pub(crate) async fn process_messages(
    conn: &SourceConnection,
    stream: &mut SplitStream<WsStream>,
) -> Result<CycleEnd, ConnectorError> {
    let mut keepalive = conn.server_config().send_pings.then(|| {
        let mut ticker = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    let mut awaiting_pong: Option<Instant> = None;

    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if let Some(end) = handle_frame(conn, &text).await {
                        return Ok(end);
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    match std::str::from_utf8(&data) {
                        Ok(text) => {
                            if let Some(end) = handle_frame(conn, text).await {
                                return Ok(end);
                            }
                        }
                        Err(_) => error!(source = %conn.source(), "non-UTF-8 binary frame ignored"),
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    debug!(source = %conn.source(), "responding to ping");
                    conn.send_control(Message::Pong(payload)).await?;
                }
                Some(Ok(Message::Pong(_))) => {
                    awaiting_pong = None;
                }
                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = frame {
                        info!(
                            source = %conn.source(),
                            code = %frame.code,
                            reason = %frame.reason,
                            "connection closed by server"
                        );
                    } else {
                        info!(source = %conn.source(), "connection closed by server");
                    }
                    return Ok(CycleEnd::StreamClosed);
                }
                Some(Ok(_)) => {
                    warn!(source = %conn.source(), "unhandled message type");
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(CycleEnd::StreamClosed),
            },
            _ = tick(&mut keepalive) => {
                if let Some(since) = awaiting_pong {
                    if since.elapsed() >= PONG_TIMEOUT {
                        return Err(ConnectorError::Connection(
                            "keepalive pong not received in time".to_string(),
                        ));
                    }
                }
                conn.send_control(Message::Ping(Vec::new())).await?;
                awaiting_pong.get_or_insert_with(Instant::now);
            }
        }
    }
}

async fn tick(keepalive: &mut Option<tokio::time::Interval>) {
    match keepalive.as_mut() {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Classifies one inbound frame. Returns `Some` when the frame ends the
/// cycle.
async fn handle_frame(conn: &SourceConnection, raw: &str) -> Option<CycleEnd> {
    let message: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            error!(source = %conn.source(), "malformed message received from server: {e}");
            return None;
        }
    };
    debug!(source = %conn.source(), "received message: {message}");

    if let Some(op) = message.get(FIELD_OP).and_then(Value::as_str) {
        match op {
            OP_RECONNECT_REQUIRED => return Some(CycleEnd::ReconnectRequired),
            OP_TEST_CLOSE => return Some(CycleEnd::TestClose),
            OP_PUBLISH => dispatch(conn, OP_PUBLISH, &message).await,
            OP_QUERY => dispatch(conn, OP_QUERY, &message).await,
            other => error!(source = %conn.source(), "unexpected operation: {other} -- ignored"),
        }
    } else if let Some(status) = message.get(FIELD_STATUS).and_then(Value::as_i64) {
        // An HTTP-style reply; fine unless it signals a problem.
        if status >= 300 {
            error!(
                source = %conn.source(),
                "received status message indicating a problem: {message}"
            );
        }
    } else {
        error!(source = %conn.source(), "malformed message received from server: {message}");
    }
    None
}

async fn dispatch(conn: &SourceConnection, op: &str, message: &Value) {
    let handlers = conn.handlers();
    let handler = match op {
        OP_PUBLISH => handlers.publish,
        _ => handlers.query,
    };
    let Some(handler) = handler else {
        error!(source = %conn.source(), "no handler found for operation {op}");
        return;
    };

    let ctx = conn.make_context(Some(message));
    let object = message.get(FIELD_OBJECT).cloned().unwrap_or(Value::Null);
    invoke_guarded(op, handler(ctx, object)).await;
}
