//! Direct WebSocket connection to the hosted live model.
//!
//! The setup message goes out as the first text frame. The service answers
//! with JSON in text or binary frames; both are parsed the same way.

use crate::channel::{ChannelEvent, Connector, RemoteChannel, INBOUND_CAPACITY};
use crate::error::{VoiceError, VoiceResult};
use crate::protocol::{ClientMessage, ServerMessage, SessionSetup};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

pub const DEFAULT_LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Talks the live protocol straight to the hosted service.
#[derive(Clone)]
pub struct LiveConnector {
    endpoint: String,
    api_key: String,
}

impl std::fmt::Debug for LiveConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveConnector")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl LiveConnector {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Endpoint with the key attached as a query parameter.
    fn session_url(&self) -> String {
        let separator = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{}key={}", self.endpoint, separator, self.api_key)
    }
}

/// `None` for frames that carry no protocol message.
fn decode_frame(frame: Message) -> Option<Result<ServerMessage, serde_json::Error>> {
    match frame {
        Message::Text(text) => Some(serde_json::from_str(&text)),
        Message::Binary(bytes) => Some(serde_json::from_slice(&bytes)),
        _ => None,
    }
}

#[async_trait]
impl Connector for LiveConnector {
    async fn connect(&self, setup: &SessionSetup, outbound_capacity: usize) -> VoiceResult<RemoteChannel> {
        info!(endpoint = %self.endpoint, model = %setup.model, "Opening live session");

        let (socket, response) = connect_async(self.session_url())
            .await
            .map_err(|e| VoiceError::ChannelOpen(format!("{}: {}", self.endpoint, e)))?;
        debug!(status = %response.status(), "WebSocket handshake complete");

        let (mut sink, mut stream) = socket.split();

        let setup_json = serde_json::to_string(&ClientMessage::setup(setup))?;
        sink.send(Message::Text(setup_json))
            .await
            .map_err(|e| VoiceError::ChannelOpen(e.to_string()))?;

        let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(outbound_capacity.max(1));
        let (in_tx, in_rx) = mpsc::channel::<ChannelEvent>(INBOUND_CAPACITY);

        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to serialize outbound message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json)).await {
                    warn!("Live socket write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
            debug!("Live writer finished");
        });

        let reader = tokio::spawn(async move {
            if in_tx.send(ChannelEvent::Opened).await.is_err() {
                return;
            }
            loop {
                let event = match stream.next().await {
                    Some(Ok(Message::Close(frame))) => {
                        if let Some(frame) = frame {
                            info!(code = %frame.code, reason = %frame.reason, "Live service closed the socket");
                        }
                        ChannelEvent::Closed
                    }
                    Some(Ok(frame)) => match decode_frame(frame) {
                        Some(Ok(msg)) => ChannelEvent::Message(msg),
                        Some(Err(e)) => {
                            warn!("Skipping unparseable live message: {}", e);
                            continue;
                        }
                        // ping/pong are answered by tungstenite
                        None => continue,
                    },
                    Some(Err(e)) => ChannelEvent::Error(e.to_string()),
                    None => ChannelEvent::Closed,
                };
                let terminal = matches!(event, ChannelEvent::Closed | ChannelEvent::Error(_));
                if in_tx.send(event).await.is_err() || terminal {
                    break;
                }
            }
            debug!("Live reader finished");
        });

        Ok(RemoteChannel::new(out_tx, in_rx).with_tasks(vec![writer, reader]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    fn setup() -> SessionSetup {
        SessionSetup {
            model: "test-model".to_string(),
            voice_name: "Kore".to_string(),
            system_instruction: "hi".to_string(),
        }
    }

    #[test]
    fn key_goes_into_the_query() {
        let plain = LiveConnector::new("wss://example.test/live", "secret");
        assert_eq!(plain.session_url(), "wss://example.test/live?key=secret");

        let with_query = LiveConnector::new("wss://example.test/live?alt=json", "secret");
        assert_eq!(with_query.session_url(), "wss://example.test/live?alt=json&key=secret");

        assert!(!format!("{:?}", plain).contains("secret"));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_channel_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = LiveConnector::new(format!("ws://{}/live", addr), "k")
            .connect(&setup(), 4)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, VoiceError::ChannelOpen(_)));
    }

    #[tokio::test]
    async fn live_socket_carries_both_directions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let service = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let (uri_tx, uri_rx) = oneshot::channel();
            let record_uri = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                let _ = uri_tx.send(req.uri().to_string());
                Ok(resp)
            };
            let mut socket = tokio_tungstenite::accept_hdr_async(tcp, record_uri)
                .await
                .unwrap();

            let setup_frame = socket.next().await.unwrap().unwrap();
            let audio_frame = socket.next().await.unwrap().unwrap();

            socket
                .send(Message::Binary(b"{\"setupComplete\":{}}".to_vec()))
                .await
                .unwrap();
            socket.send(Message::Text("not json".to_string())).await.unwrap();
            socket
                .send(Message::Text("{\"serverContent\":{\"interrupted\":true}}".to_string()))
                .await
                .unwrap();
            socket.close(None).await.unwrap();

            (uri_rx.await.unwrap(), setup_frame, audio_frame)
        });

        let channel = LiveConnector::new(format!("ws://{}/live", addr), "test-key")
            .connect(&setup(), 4)
            .await
            .unwrap();
        let (outbound, mut inbound, tasks) = channel.into_parts();
        assert_eq!(tasks.len(), 2);

        outbound.send(ClientMessage::audio("AAAA".to_string())).await.unwrap();

        assert_eq!(inbound.recv().await.unwrap(), ChannelEvent::Opened);
        match inbound.recv().await.unwrap() {
            ChannelEvent::Message(msg) => assert!(msg.setup_complete.is_some()),
            other => panic!("unexpected event {:?}", other),
        }
        match inbound.recv().await.unwrap() {
            ChannelEvent::Message(msg) => assert!(msg.is_interrupted()),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(inbound.recv().await.unwrap(), ChannelEvent::Closed);

        let (uri, setup_frame, audio_frame) = service.await.unwrap();
        assert_eq!(uri, "/live?key=test-key");

        let setup_msg: ClientMessage = serde_json::from_str(setup_frame.to_text().unwrap()).unwrap();
        assert_eq!(setup_msg, ClientMessage::setup(&setup()));
        let audio_msg: ClientMessage = serde_json::from_str(audio_frame.to_text().unwrap()).unwrap();
        assert_eq!(audio_msg, ClientMessage::audio("AAAA".to_string()));
    }
}
