//! Scripted WebSocket server standing in for the real one: answers the
//! validate / connectExtension handshake, records every client frame, and
//! lets tests push arbitrary frames or drop connections.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{accept_async, tungstenite::protocol::Message};

const FRAME_WAIT: Duration = Duration::from_secs(5);

/// How the server behaves during the handshake.
#[derive(Clone)]
pub struct MockServerOptions {
    pub auth_status: i64,
    /// Body of the auth reply when `auth_status` is not 200.
    pub auth_errors: Vec<Value>,
    /// Returned to the client as `object.config`.
    pub source_config: Value,
    /// Status-only frames sent before the configuration message.
    pub status_frames_before_config: usize,
}

impl Default for MockServerOptions {
    fn default() -> Self {
        MockServerOptions {
            auth_status: 200,
            auth_errors: Vec::new(),
            source_config: json!({}),
            status_frames_before_config: 0,
        }
    }
}

enum ServerCommand {
    Send(Value),
    DropConnections,
}

#[derive(Clone)]
pub struct MockServer {
    address: String,
    command_sender: mpsc::Sender<ServerCommand>,
    received: Arc<Mutex<mpsc::UnboundedReceiver<Value>>>,
    shutdown_notify: Arc<Notify>,
    connection_count: Arc<AtomicUsize>,
}

impl MockServer {
    pub async fn new(options: MockServerOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock server address");
        let address = listener.local_addr().unwrap().to_string();

        let (command_sender, mut command_receiver) = mpsc::channel::<ServerCommand>(100);
        let (received_tx, received_rx) = mpsc::unbounded_channel::<Value>();
        let clients = Arc::new(Mutex::new(Vec::<mpsc::Sender<Message>>::new()));
        let shutdown_notify = Arc::new(Notify::new());
        let connection_count = Arc::new(AtomicUsize::new(0));

        let clients_accept = clients.clone();
        let shutdown_accept = shutdown_notify.clone();
        let count_accept = connection_count.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        let Ok((stream, _)) = accept_result else { break };
                        let Ok(ws_stream) = accept_async(stream).await else { continue };
                        count_accept.fetch_add(1, Ordering::SeqCst);

                        let (client_sender, client_receiver) = mpsc::channel::<Message>(100);
                        clients_accept.lock().await.push(client_sender);

                        tokio::spawn(run_client(
                            ws_stream,
                            client_receiver,
                            received_tx.clone(),
                            options.clone(),
                        ));
                    }
                    _ = shutdown_accept.notified() => {
                        clients_accept.lock().await.clear();
                        break;
                    }
                }
            }
        });

        let clients_command = clients.clone();
        tokio::spawn(async move {
            while let Some(cmd) = command_receiver.recv().await {
                match cmd {
                    ServerCommand::Send(frame) => {
                        let clients = clients_command.lock().await;
                        for client in clients.iter() {
                            let _ = client.send(Message::Text(frame.to_string())).await;
                        }
                    }
                    ServerCommand::DropConnections => {
                        clients_command.lock().await.clear();
                    }
                }
            }
        });

        MockServer {
            address,
            command_sender,
            received: Arc::new(Mutex::new(received_rx)),
            shutdown_notify,
            connection_count,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::SeqCst)
    }

    /// Sends a frame to every connected client.
    pub async fn send_json(&self, frame: Value) {
        let _ = self.command_sender.send(ServerCommand::Send(frame)).await;
    }

    pub async fn drop_connections(&self) {
        let _ = self
            .command_sender
            .send(ServerCommand::DropConnections)
            .await;
    }

    pub async fn shutdown(&self) {
        self.shutdown_notify.notify_waiters();
    }

    /// Next recorded client frame; panics if none arrives in time.
    pub async fn next_frame(&self) -> Value {
        let mut received = self.received.lock().await;
        timeout(FRAME_WAIT, received.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("frame channel closed")
    }

    /// Next recorded frame carrying the given op.
    pub async fn next_frame_with_op(&self, op: &str) -> Value {
        loop {
            let frame = self.next_frame().await;
            if frame.get("op").and_then(Value::as_str) == Some(op) {
                return frame;
            }
        }
    }

    /// Next recorded response frame (status present, no op).
    pub async fn next_response(&self) -> Value {
        loop {
            let frame = self.next_frame().await;
            if frame.get("status").is_some() && frame.get("op").is_none() {
                return frame;
            }
        }
    }

    /// Drains whatever frames are already recorded.
    pub async fn drain_frames(&self) -> Vec<Value> {
        let mut received = self.received.lock().await;
        let mut frames = Vec::new();
        while let Ok(Some(frame)) =
            timeout(Duration::from_millis(200), received.recv()).await
        {
            frames.push(frame);
        }
        frames
    }
}

async fn run_client(
    ws_stream: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    mut commands: mpsc::Receiver<Message>,
    received: mpsc::UnboundedSender<Value>,
    options: MockServerOptions,
) {
    let (mut sink, mut stream) = ws_stream.split();
    loop {
        tokio::select! {
            outbound = commands.recv() => match outbound {
                Some(message) => {
                    if sink.send(message).await.is_err() {
                        break;
                    }
                }
                // Removed from the registry: drop the connection.
                None => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let Ok(frame) = serde_json::from_str::<Value>(&text) else { continue };
                    let _ = received.send(frame.clone());
                    for reply in scripted_replies(&options, &frame) {
                        if sink.send(Message::Text(reply.to_string())).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = sink.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            }
        }
    }
}

/// The handshake script: a status reply to `validate`, then the optional
/// status-only frames and the configuration for `connectExtension`.
fn scripted_replies(options: &MockServerOptions, frame: &Value) -> Vec<Value> {
    match frame.get("op").and_then(Value::as_str) {
        Some("validate") => {
            if options.auth_status == 200 {
                vec![json!({"status": 200})]
            } else {
                vec![json!({
                    "status": options.auth_status,
                    "body": options.auth_errors,
                })]
            }
        }
        Some("connectExtension") => {
            let mut replies = Vec::new();
            for _ in 0..options.status_frames_before_config {
                replies.push(json!({"status": 200}));
            }
            replies.push(json!({
                "op": "configureExtension",
                "object": { "config": options.source_config },
            }));
            replies
        }
        _ => Vec::new(),
    }
}
