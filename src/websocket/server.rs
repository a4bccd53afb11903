use std::sync::Arc;

use log::{error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::data::topic::split_topic_list;
use crate::error::HubError;
use crate::hub::Hub;
use crate::websocket::handler;

pub const WS_PATH: &str = "/ws";

/// Accepts sockets until cancelled. Every connection task is spawned on
/// `tracker` so shutdown can wait for them to flush.
pub async fn run(listener: TcpListener, hub: Arc<Hub>, tracker: TaskTracker, cancel: CancellationToken) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept TCP connection: {}", e);
                    continue;
                }
            },
        };

        let hub = hub.clone();
        tracker.spawn(handle_socket(stream, peer.to_string(), hub));
    }

    info!("WebSocket listener stopped");
}

fn error_response(status: StatusCode, message: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(message.to_string()));
    *response.status_mut() = status;
    response
}

async fn handle_socket(stream: TcpStream, peer_addr: String, hub: Arc<Hub>) {
    let mut initial_topics = Vec::new();

    let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let path = req.uri().path();
        if path != WS_PATH {
            warn!("Unknown WebSocket path '{}' from {}", path, peer_addr);
            return Err(error_response(StatusCode::NOT_FOUND, "Invalid WebSocket path"));
        }
        if hub.registry().at_capacity() {
            let rejected = HubError::ConnectionRejected("connection limit reached".to_string());
            warn!("{} ({})", rejected, peer_addr);
            return Err(error_response(StatusCode::SERVICE_UNAVAILABLE, "Too many connections"));
        }

        initial_topics = topics_from_query(req.uri().query());
        Ok(response)
    };

    let ws_stream = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", peer_addr, e);
            return;
        }
    };

    handler::handle_connection(hub, ws_stream, peer_addr, initial_topics).await;
}

/// Reads the connect-time `topics=` list from a request query string.
pub fn topics_from_query(query: Option<&str>) -> Vec<String> {
    let Some(query) = query else {
        return Vec::new();
    };

    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .filter(|(key, _)| *key == "topics")
        .flat_map(|(_, value)| {
            let decoded = urlencoding::decode(value)
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| value.to_string());
            split_topic_list(&decoded)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topics_from_query() {
        assert!(topics_from_query(None).is_empty());
        assert_eq!(
            topics_from_query(Some("topics=price%3AAAA%2Cmarket-status&x=1")),
            vec!["price:AAA", "market-status"]
        );
        assert_eq!(
            topics_from_query(Some("topics=price:AAA,,signal:momentum&topics=price:BBB")),
            vec!["price:AAA", "signal:momentum", "price:BBB"]
        );
    }
}
