//! WebSocket Routes
//!
//! Push binding for the chunk protocol on `GET /ws`.
//!
//! Text frames carry `{"event": ..., "data": ...}` commands (`check`,
//! `merge`, `subscribe`). Chunks travel as binary frames (see
//! [`super::frame`]). A connection is subscribed to every identity it
//! touches, so merge progress and outcomes reach it whoever started the
//! merge.

use std::collections::HashMap;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::frame::{parse_chunk_frame, MAX_HEADER_LEN};
use crate::events::{CheckedEvent, ErrorEvent, ServerEvent, UploadedEvent};
use crate::state::AppState;
use crate::upload::{BroadcastSink, CheckRequest, IdentityRequest, MergeRequest, UploadError, UploadIdentity};

/// Outbound events queued per connection before command handling waits
const OUTBOUND_CAPACITY: usize = 64;

/// Client-to-server command
#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    Check(CheckRequest),
    Merge(MergeRequest),
    Subscribe(IdentityRequest),
}

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_handler))
}

/// GET /ws
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let limit = state.config().storage.max_chunk_bytes + MAX_HEADER_LEN + 4;

    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(OUTBOUND_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to encode event");
                    continue;
                }
            };
            if let Err(e) = sender.send(Message::Text(text)).await {
                tracing::debug!(error = %e, "WebSocket write failed");
                break;
            }
        }
        let _ = sender.close().await;
    });

    let mut connection = Connection::new(state, tx);
    tracing::debug!("WebSocket client connected");

    while let Some(message) = receiver.next().await {
        let keep_going = match message {
            Ok(Message::Text(text)) => connection.handle_text(&text).await,
            Ok(Message::Binary(frame)) => connection.handle_frame(&frame).await,
            Ok(Message::Close(_)) => false,
            // Ping/pong are answered by axum
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(error = %e, "WebSocket read failed");
                false
            }
        };
        if !keep_going {
            break;
        }
    }

    connection.close();
    let _ = writer.await;
    tracing::debug!("WebSocket client disconnected");
}

// ============================================================================
// Connection
// ============================================================================

/// Per-socket command handling and identity subscriptions
struct Connection {
    state: AppState,
    tx: mpsc::Sender<ServerEvent>,
    /// Forwarding tasks keyed by namespace key
    subscriptions: HashMap<String, JoinHandle<()>>,
}

impl Connection {
    fn new(state: AppState, tx: mpsc::Sender<ServerEvent>) -> Self {
        Self {
            state,
            tx,
            subscriptions: HashMap::new(),
        }
    }

    /// Queue an event for this client. False once the writer is gone.
    async fn send(&self, event: ServerEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    async fn handle_text(&mut self, text: &str) -> bool {
        let command: ClientCommand = match serde_json::from_str(text) {
            Ok(command) => command,
            Err(e) => {
                let error = UploadError::InvalidRequest(format!("bad command: {e}"));
                return self.send(ServerEvent::Error(ErrorEvent::from_error(&error))).await;
            }
        };

        match command {
            ClientCommand::Check(request) => self.check(request).await,
            ClientCommand::Merge(request) => self.merge(request).await,
            ClientCommand::Subscribe(request) => match request.identity() {
                Ok(identity) => {
                    self.subscribe(&identity);
                    true
                }
                Err(e) => self.send(ServerEvent::Error(ErrorEvent::from_error(&e))).await,
            },
        }
    }

    async fn check(&mut self, request: CheckRequest) -> bool {
        let identity = match request.identity() {
            Ok(identity) => identity,
            Err(e) => return self.send(ServerEvent::Error(ErrorEvent::from_error(&e))).await,
        };
        self.subscribe(&identity);

        let event = match self.state.uploads().check(&identity, request.total).await {
            Ok(result) => ServerEvent::Checked(CheckedEvent::new(&identity, result)),
            Err(e) => ServerEvent::Error(ErrorEvent::from_error(&e).for_identity(&identity)),
        };
        self.send(event).await
    }

    async fn handle_frame(&mut self, frame: &[u8]) -> bool {
        let (header, body) = match parse_chunk_frame(frame) {
            Ok(parsed) => parsed,
            Err(e) => {
                let error = UploadError::from(e);
                return self.send(ServerEvent::Error(ErrorEvent::from_error(&error))).await;
            }
        };
        let identity = match header.identity() {
            Ok(identity) => identity,
            Err(e) => {
                let event = ErrorEvent::from_error(&e).for_index(header.index);
                return self.send(ServerEvent::Error(event)).await;
            }
        };
        self.subscribe(&identity);

        let max_chunk_bytes = self.state.config().storage.max_chunk_bytes;
        let result = if body.len() > max_chunk_bytes {
            Err(UploadError::InvalidRequest(format!(
                "chunk of {} bytes exceeds the {max_chunk_bytes} byte limit",
                body.len()
            )))
        } else {
            self.state
                .uploads()
                .upload_chunk(&identity, header.index, body, header.total)
                .await
        };

        let event = match result {
            Ok(receipt) => ServerEvent::Uploaded(UploadedEvent::new(&identity, &receipt)),
            Err(e) => ServerEvent::Error(
                ErrorEvent::from_error(&e)
                    .for_identity(&identity)
                    .for_index(header.index),
            ),
        };
        self.send(event).await
    }

    /// Start a merge in the background; its outcome arrives as `done`
    async fn merge(&mut self, request: MergeRequest) -> bool {
        let identity = match request.identity() {
            Ok(identity) => identity,
            Err(e) => return self.send(ServerEvent::Error(ErrorEvent::from_error(&e))).await,
        };
        self.subscribe(&identity);

        let state = self.state.clone();
        tokio::spawn(async move {
            let sink = BroadcastSink::new(state.events().clone());
            let _ = state
                .uploads()
                .merge(&identity, request.total, &request.name, &sink)
                .await;
        });

        true
    }

    fn subscribe(&mut self, identity: &UploadIdentity) {
        let key = identity.namespace_key();
        if self.subscriptions.contains_key(&key) {
            return;
        }

        let mut events = self.state.events().subscribe(identity);
        let tx = self.tx.clone();
        let channel = key.clone();
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(channel = %channel, skipped = skipped, "Subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        tracing::debug!(channel = %key, "Subscribed connection");
        self.subscriptions.insert(key, handle);
    }

    fn close(self) {
        for (_, handle) in self.subscriptions {
            handle.abort();
        }
        self.state.events().prune();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, StorageBackend};
    use crate::routes::frame::encode_chunk_frame;
    use crate::upload::ChunkHeader;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn spawn_server(temp_dir: &TempDir) -> (SocketAddr, AppState) {
        let mut config = Config::default();
        config.storage.backend = StorageBackend::Memory;
        config.storage.output_dir = temp_dir.path().join("files");
        let state = AppState::new(config);

        let app = router().with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (addr, state)
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .unwrap();
        client
    }

    async fn send_command(client: &mut Client, command: serde_json::Value) {
        client.send(WsMessage::Text(command.to_string().into())).await.unwrap();
    }

    async fn send_chunk(client: &mut Client, hash: &str, index: u64, total: u64, body: &[u8]) {
        let header = ChunkHeader {
            hash: hash.into(),
            chunk_size: 4,
            index,
            total: Some(total),
        };
        let frame = encode_chunk_frame(&header, body).unwrap();
        client.send(WsMessage::Binary(frame.into())).await.unwrap();
    }

    async fn next_event(client: &mut Client) -> ServerEvent {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for event")
                .expect("connection closed")
                .unwrap();
            if message.is_text() {
                return serde_json::from_str(message.to_text().unwrap()).unwrap();
            }
        }
    }

    /// Skip progress events until the merge outcome arrives
    async fn next_done(client: &mut Client) -> crate::events::DoneEvent {
        loop {
            match next_event(client).await {
                ServerEvent::Done(done) => return done,
                ServerEvent::Progress(_) => continue,
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_check_upload_merge_over_socket() {
        let temp_dir = TempDir::new().unwrap();
        let (addr, _state) = spawn_server(&temp_dir).await;
        let mut client = connect(addr).await;

        let check = serde_json::json!({"event": "check", "data": {"hash": "wsfile", "chunkSize": 4, "total": 2}});
        send_command(&mut client, check.clone()).await;
        match next_event(&mut client).await {
            ServerEvent::Checked(checked) => {
                assert_eq!(checked.kind, 0);
                assert_eq!(checked.missing, vec![0, 1]);
            }
            other => panic!("unexpected event {other:?}"),
        }

        send_chunk(&mut client, "wsfile", 1, 2, b"ket").await;
        match next_event(&mut client).await {
            ServerEvent::Uploaded(uploaded) => {
                assert_eq!(uploaded.index, 1);
                assert!(uploaded.stored);
            }
            other => panic!("unexpected event {other:?}"),
        }
        send_chunk(&mut client, "wsfile", 0, 2, b"sock").await;
        assert!(matches!(next_event(&mut client).await, ServerEvent::Uploaded(_)));

        send_command(
            &mut client,
            serde_json::json!({"event": "merge", "data": {"hash": "wsfile", "chunkSize": "4", "total": 2, "name": "socket.bin"}}),
        )
        .await;
        let done = next_done(&mut client).await;
        assert!(done.success);
        assert_eq!(done.size, Some(6));
        assert_eq!(std::fs::read(temp_dir.path().join("files/socket.bin")).unwrap(), b"socket");
    }

    #[tokio::test]
    async fn test_incomplete_merge_reports_failure() {
        let temp_dir = TempDir::new().unwrap();
        let (addr, _state) = spawn_server(&temp_dir).await;
        let mut client = connect(addr).await;

        send_chunk(&mut client, "gappy", 0, 3, b"aaaa").await;
        assert!(matches!(next_event(&mut client).await, ServerEvent::Uploaded(_)));

        send_command(
            &mut client,
            serde_json::json!({"event": "merge", "data": {"hash": "gappy", "chunkSize": 4, "total": 3, "name": "gappy.bin"}}),
        )
        .await;
        let done = next_done(&mut client).await;
        assert!(!done.success);
        assert!(done.msg.contains("upload the missing chunks"));
        assert!(!temp_dir.path().join("files/gappy.bin").exists());
    }

    #[tokio::test]
    async fn test_subscriber_hears_other_clients_merge() {
        let temp_dir = TempDir::new().unwrap();
        let (addr, _state) = spawn_server(&temp_dir).await;
        let mut uploader = connect(addr).await;
        let mut watcher = connect(addr).await;

        send_command(
            &mut watcher,
            serde_json::json!({"event": "subscribe", "data": {"hash": "shared", "chunkSize": 4}}),
        )
        .await;
        // Commands run in order, so the checked reply means the subscription is live
        send_command(
            &mut watcher,
            serde_json::json!({"event": "check", "data": {"hash": "shared", "chunkSize": 4, "total": 1}}),
        )
        .await;
        assert!(matches!(next_event(&mut watcher).await, ServerEvent::Checked(_)));

        send_chunk(&mut uploader, "shared", 0, 1, b"data").await;
        assert!(matches!(next_event(&mut uploader).await, ServerEvent::Uploaded(_)));
        send_command(
            &mut uploader,
            serde_json::json!({"event": "merge", "data": {"hash": "shared", "chunkSize": 4, "total": 1, "name": "shared.bin"}}),
        )
        .await;

        assert!(next_done(&mut uploader).await.success);
        assert!(next_done(&mut watcher).await.success);
    }

    #[tokio::test]
    async fn test_bad_input_yields_error_events() {
        let temp_dir = TempDir::new().unwrap();
        let (addr, _state) = spawn_server(&temp_dir).await;
        let mut client = connect(addr).await;

        send_command(&mut client, serde_json::json!({"event": "launch", "data": {}})).await;
        match next_event(&mut client).await {
            ServerEvent::Error(error) => assert_eq!(error.code, "INVALID_REQUEST"),
            other => panic!("unexpected event {other:?}"),
        }

        client.send(WsMessage::Binary(vec![0u8, 0].into())).await.unwrap();
        match next_event(&mut client).await {
            ServerEvent::Error(error) => assert!(error.msg.contains("bad chunk frame")),
            other => panic!("unexpected event {other:?}"),
        }

        send_chunk(&mut client, "ranged", 7, 2, b"late").await;
        match next_event(&mut client).await {
            ServerEvent::Error(error) => {
                assert_eq!(error.code, "INDEX_OUT_OF_RANGE");
                assert_eq!(error.index, Some(7));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
