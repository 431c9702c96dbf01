// WebSocket transport between clients and the lifecycle engine.
//
// One persistent connection per client. Each accepted connection gets a
// process-unique id, a reader task that forwards text frames into the
// engine's event channel, and a writer task that drains the connection's
// outbound channel to the socket. The engine never touches sockets
// directly; it only sees `EngineEvent`s and outbound channel senders.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::engine::EngineEvent;
use crate::registry::ConnectionId;

/// Connection id source. Ids are never reused within a process lifetime.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A bound-but-not-yet-serving listener. Binding is separate from serving
/// so callers (and tests) can bind port 0 and read back the real address.
pub struct WsListener {
    listener: TcpListener,
}

impl WsListener {
    /// Bind on `127.0.0.1:{port}`. Pass port 0 for an ephemeral port.
    pub async fn bind(port: u16) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(format!("127.0.0.1:{port}")).await?;
        Ok(WsListener { listener })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// Accept connections forever, spawning a handler per connection. Returns
/// only on listener failure (or when the task is aborted at shutdown).
pub async fn run(listener: WsListener, events: mpsc::Sender<EngineEvent>) -> anyhow::Result<()> {
    let local_addr = listener.local_addr()?;
    info!("WebSocket server listening on {local_addr}");

    loop {
        let (stream, addr) = listener.listener.accept().await?;
        let conn = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        debug!("Accepted TCP connection from {addr} as connection {conn}");
        tokio::spawn(handle_connection(stream, addr, conn, events.clone()));
    }
}

/// Drive one client connection from handshake to close.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    conn: ConnectionId,
    events: mpsc::Sender<EngineEvent>,
) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake failed for {addr}: {e}");
            return;
        }
    };

    let (mut write, read) = ws_stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();

    if events
        .send(EngineEvent::Connected {
            conn,
            outbound: outbound_tx,
        })
        .await
        .is_err()
    {
        // Engine is gone; nothing useful to do with this socket.
        return;
    }

    // Writer: drains the outbound channel to the socket. Ends when the
    // engine drops the sender (session pruned/unregistered) or the socket
    // rejects a write.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if write.send(Message::text(frame)).await.is_err() {
                break;
            }
        }
        let _ = write.close().await;
    });

    // Reader: forwards inbound text frames until close/error.
    forward_messages(read, conn, &events).await;

    let _ = events.send(EngineEvent::Disconnected { conn }).await;
    // The engine's disconnect handling drops the outbound sender, which in
    // turn ends the writer task; await it so the close frame gets out.
    let _ = writer.await;
    debug!("Connection {conn} ({addr}) closed");
}

/// Forward inbound WebSocket messages from a read half. Wrapper around
/// [`forward_message_stream`] for real sockets.
async fn forward_messages<S>(
    read: SplitStream<WebSocketStream<S>>,
    conn: ConnectionId,
    events: &mpsc::Sender<EngineEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    forward_message_stream(read, conn, events).await;
}

/// Forward text payloads from any message stream into the engine channel.
/// Stops on a close frame, a transport error, or a closed engine channel.
/// Binary, ping, and pong frames are ignored.
///
/// Generic over the stream type so it can be tested with in-memory streams
/// without opening TCP ports.
pub async fn forward_message_stream<St>(
    mut stream: St,
    conn: ConnectionId,
    events: &mpsc::Sender<EngineEvent>,
) where
    St: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg_result) = stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                let event = EngineEvent::Inbound {
                    conn,
                    text: text.to_string(),
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => {
                debug!("Connection {conn} sent close frame");
                break;
            }
            Err(e) => {
                warn!("WebSocket error on connection {conn}: {e}");
                break;
            }
            _ => {
                // Ignore Binary, Ping, Pong, Frame variants.
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use tokio_tungstenite::tungstenite::Error as WsError;

    fn mock_stream(
        messages: Vec<Result<Message, WsError>>,
    ) -> impl Stream<Item = Result<Message, WsError>> + Unpin {
        stream::iter(messages)
    }

    fn inbound_text(event: EngineEvent) -> (ConnectionId, String) {
        match event {
            EngineEvent::Inbound { conn, text } => (conn, text),
            other => panic!("expected Inbound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn text_frames_forward_with_connection_id() {
        let (tx, mut rx) = mpsc::channel(64);
        let messages = vec![
            Ok(Message::Text("first".into())),
            Ok(Message::Text("second".into())),
        ];

        forward_message_stream(mock_stream(messages), 7, &tx).await;

        assert_eq!(inbound_text(rx.recv().await.unwrap()), (7, "first".into()));
        assert_eq!(inbound_text(rx.recv().await.unwrap()), (7, "second".into()));
    }

    #[tokio::test]
    async fn close_frame_stops_forwarding() {
        let (tx, mut rx) = mpsc::channel(64);
        let messages = vec![
            Ok(Message::Text("before_close".into())),
            Ok(Message::Close(None)),
            Ok(Message::Text("after_close_should_not_appear".into())),
        ];

        forward_message_stream(mock_stream(messages), 1, &tx).await;

        assert_eq!(
            inbound_text(rx.recv().await.unwrap()),
            (1, "before_close".into())
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn transport_error_stops_forwarding() {
        let (tx, mut rx) = mpsc::channel(64);
        let messages = vec![
            Ok(Message::Text("before_error".into())),
            Err(WsError::ConnectionClosed),
            Ok(Message::Text("after_error_should_not_appear".into())),
        ];

        forward_message_stream(mock_stream(messages), 1, &tx).await;

        assert_eq!(
            inbound_text(rx.recv().await.unwrap()),
            (1, "before_error".into())
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn binary_and_ping_frames_are_ignored() {
        let (tx, mut rx) = mpsc::channel(64);
        let messages = vec![
            Ok(Message::Binary(vec![1, 2, 3].into())),
            Ok(Message::Ping(vec![].into())),
            Ok(Message::Pong(vec![].into())),
            Ok(Message::Text("after_ignored".into())),
        ];

        forward_message_stream(mock_stream(messages), 1, &tx).await;

        assert_eq!(
            inbound_text(rx.recv().await.unwrap()),
            (1, "after_ignored".into())
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_engine_channel_stops_forwarding() {
        let (tx, rx) = mpsc::channel(64);
        drop(rx);
        let messages = vec![Ok(Message::Text("orphan".into()))];

        // Must simply return, not panic.
        forward_message_stream(mock_stream(messages), 1, &tx).await;
    }

    #[tokio::test]
    async fn bind_port_zero_yields_real_address() {
        let listener = WsListener::bind(0).await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }
}
