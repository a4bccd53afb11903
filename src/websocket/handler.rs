use std::sync::Arc;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::data::messages::{ClientMessage, ErrorCode, OutboundMessage};
use crate::hub::Hub;
use crate::websocket::ConnectionId;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Runs one client connection after the handshake: greeting, connect-time
/// topics, then the read loop until either side goes away.
pub async fn handle_connection(
    hub: Arc<Hub>,
    mut ws_stream: WebSocketStream<TcpStream>,
    peer_addr: String,
    initial_topics: Vec<String>,
) {
    let (connection_id, rx) = match hub.connect(&peer_addr) {
        Ok(accepted) => accepted,
        Err(e) => {
            warn!("Rejecting {}: {}", peer_addr, e);
            let frame = CloseFrame {
                code: CloseCode::Again,
                reason: "server busy".into(),
            };
            let _ = ws_stream.close(Some(frame)).await;
            return;
        }
    };

    let (sink, mut stream) = ws_stream.split();
    let mut writer = tokio::spawn(write_loop(sink, rx));
    let mut writer_done = false;

    // The writer is already draining, so replies here only wait on the client
    hub.subscribe_on_connect(&connection_id, &initial_topics).await;

    loop {
        tokio::select! {
            // The registry dropped our queue: pruned, evicted or shutting down
            _ = &mut writer => {
                writer_done = true;
                break;
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_text(&hub, &connection_id, &text),
                Some(Ok(Message::Pong(_))) => {
                    hub.registry().record_ack(&connection_id);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Read error on {}: {}", connection_id, e);
                    break;
                }
            }
        }
    }

    hub.disconnect(&connection_id, "client disconnected");
    if !writer_done {
        let _ = writer.await;
    }
    info!("Connection {} from {} finished", connection_id, peer_addr);
}

fn handle_text(hub: &Hub, connection_id: &ConnectionId, text: &str) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => hub.handle_client_message(connection_id, message),
        Err(e) => {
            debug!("Unparsable message from {}: {}", connection_id, e);
            hub.registry().send(
                connection_id,
                &OutboundMessage::error(
                    ErrorCode::InvalidMessage,
                    "expected {\"type\": \"subscribe\" | \"unsubscribe\" | \"pong\" | \"ping\"}",
                ),
            );
        }
    }
}

/// Drains the connection's queue into the socket. Once the queue is closed
/// every frame already queued is written, followed by a Close frame.
async fn write_loop(mut sink: WsSink, mut rx: mpsc::Receiver<Message>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = sink.send(frame).await {
            debug!("Write failed: {}", e);
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}
