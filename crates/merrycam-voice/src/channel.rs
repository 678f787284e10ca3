//! Remote session channel.
//!
//! A [`Connector`] opens a bidirectional message stream to the conversational
//! service. [`LiveConnector`](crate::live::LiveConnector) speaks WebSocket
//! to the hosted service directly. [`RelayConnector`] talks newline-delimited
//! JSON over TCP to a local relay instead. [`LoopbackConnector`] keeps both
//! ends in-process and hands the far end to the caller.

use crate::error::{VoiceError, VoiceResult};
use crate::pcm;
use crate::protocol::{ClientMessage, ServerMessage, SessionSetup};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Inbound traffic and lifecycle of a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Opened,
    Message(ServerMessage),
    Closed,
    Error(String),
}

/// An open channel: a bounded send side and the inbound event stream.
pub struct RemoteChannel {
    pub outbound: mpsc::Sender<ClientMessage>,
    pub inbound: mpsc::Receiver<ChannelEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl RemoteChannel {
    pub fn new(outbound: mpsc::Sender<ClientMessage>, inbound: mpsc::Receiver<ChannelEvent>) -> Self {
        Self {
            outbound,
            inbound,
            tasks: Vec::new(),
        }
    }

    /// Attach I/O tasks that must be stopped along with the session.
    pub fn with_tasks(mut self, tasks: Vec<JoinHandle<()>>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn into_parts(
        self,
    ) -> (
        mpsc::Sender<ClientMessage>,
        mpsc::Receiver<ChannelEvent>,
        Vec<JoinHandle<()>>,
    ) {
        (self.outbound, self.inbound, self.tasks)
    }
}

/// Opens channels to the remote service.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a channel configured by `setup`. `outbound_capacity` bounds the
    /// send queue; senders that find it full drop their message.
    async fn connect(&self, setup: &SessionSetup, outbound_capacity: usize) -> VoiceResult<RemoteChannel>;
}

pub(crate) const INBOUND_CAPACITY: usize = 256;

/// Newline-delimited JSON over TCP to a live-protocol relay.
#[derive(Debug, Clone)]
pub struct RelayConnector {
    addr: String,
}

impl RelayConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl Connector for RelayConnector {
    async fn connect(&self, setup: &SessionSetup, outbound_capacity: usize) -> VoiceResult<RemoteChannel> {
        info!(relay = %self.addr, model = %setup.model, "Opening live session");

        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| VoiceError::ChannelOpen(format!("{}: {}", self.addr, e)))?;
        let (read_half, mut write_half) = stream.into_split();

        let mut line = serde_json::to_string(&ClientMessage::setup(setup))?;
        line.push('\n');
        write_half
            .write_all(line.as_bytes())
            .await
            .map_err(|e| VoiceError::ChannelOpen(e.to_string()))?;

        let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(outbound_capacity.max(1));
        let (in_tx, in_rx) = mpsc::channel::<ChannelEvent>(INBOUND_CAPACITY);

        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let mut line = match serde_json::to_string(&msg) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Failed to serialize outbound message: {}", e);
                        continue;
                    }
                };
                line.push('\n');
                if let Err(e) = write_half.write_all(line.as_bytes()).await {
                    warn!("Relay write failed: {}", e);
                    break;
                }
            }
            let _ = write_half.shutdown().await;
            debug!("Relay writer finished");
        });

        let reader = tokio::spawn(async move {
            if in_tx.send(ChannelEvent::Opened).await.is_err() {
                return;
            }
            let mut lines = BufReader::new(read_half).lines();
            loop {
                let event = match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<ServerMessage>(line) {
                            Ok(msg) => ChannelEvent::Message(msg),
                            Err(e) => {
                                warn!("Skipping unparseable relay message: {}", e);
                                continue;
                            }
                        }
                    }
                    Ok(None) => ChannelEvent::Closed,
                    Err(e) => ChannelEvent::Error(e.to_string()),
                };
                let terminal = matches!(event, ChannelEvent::Closed | ChannelEvent::Error(_));
                if in_tx.send(event).await.is_err() || terminal {
                    break;
                }
            }
            debug!("Relay reader finished");
        });

        Ok(RemoteChannel::new(out_tx, in_rx).with_tasks(vec![writer, reader]))
    }
}

/// Far end of a loopback channel, standing in for the remote service.
pub struct RemotePeer {
    pub setup: SessionSetup,
    from_client: mpsc::Receiver<ClientMessage>,
    to_client: mpsc::Sender<ChannelEvent>,
}

impl RemotePeer {
    /// Next message the session sent.
    pub async fn recv(&mut self) -> Option<ClientMessage> {
        self.from_client.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ClientMessage> {
        self.from_client.try_recv().ok()
    }

    pub async fn send(&self, msg: ServerMessage) -> VoiceResult<()> {
        self.to_client
            .send(ChannelEvent::Message(msg))
            .await
            .map_err(|_| VoiceError::ChannelClosed)
    }

    /// Speak `samples` (24 kHz) to the session.
    pub async fn send_audio(&self, samples: &[f32]) -> VoiceResult<()> {
        self.send(ServerMessage::audio(pcm::encode_pcm16(samples))).await
    }

    pub async fn interrupt(&self) -> VoiceResult<()> {
        self.send(ServerMessage::interrupted()).await
    }

    /// Close the channel from the remote side.
    pub async fn close(&self) -> VoiceResult<()> {
        self.to_client
            .send(ChannelEvent::Closed)
            .await
            .map_err(|_| VoiceError::ChannelClosed)
    }

    /// Fail the channel from the remote side.
    pub async fn fail(&self, reason: impl Into<String>) -> VoiceResult<()> {
        self.to_client
            .send(ChannelEvent::Error(reason.into()))
            .await
            .map_err(|_| VoiceError::ChannelClosed)
    }

    /// True once the session has let go of its end.
    pub fn is_detached(&self) -> bool {
        self.to_client.is_closed()
    }
}

/// In-process connector; each successful connect yields a [`RemotePeer`].
pub struct LoopbackConnector {
    peers: mpsc::UnboundedSender<RemotePeer>,
    refuse_next: AtomicBool,
}

impl LoopbackConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RemotePeer>) {
        let (peers, peers_rx) = mpsc::unbounded_channel();
        (
            Self {
                peers,
                refuse_next: AtomicBool::new(false),
            },
            peers_rx,
        )
    }

    /// Fail the next connect as if the service were unreachable.
    pub fn refuse_next(&self) {
        self.refuse_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, setup: &SessionSetup, outbound_capacity: usize) -> VoiceResult<RemoteChannel> {
        if self.refuse_next.swap(false, Ordering::SeqCst) {
            return Err(VoiceError::ChannelOpen("loopback connection refused".to_string()));
        }

        let (out_tx, out_rx) = mpsc::channel(outbound_capacity.max(1));
        let (in_tx, in_rx) = mpsc::channel(INBOUND_CAPACITY);
        let _ = in_tx.try_send(ChannelEvent::Opened);

        let peer = RemotePeer {
            setup: setup.clone(),
            from_client: out_rx,
            to_client: in_tx,
        };
        self.peers
            .send(peer)
            .map_err(|_| VoiceError::ChannelOpen("loopback listener is gone".to_string()))?;

        Ok(RemoteChannel::new(out_tx, in_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn setup() -> SessionSetup {
        SessionSetup {
            model: "test-model".to_string(),
            voice_name: "Kore".to_string(),
            system_instruction: "hi".to_string(),
        }
    }

    #[tokio::test]
    async fn loopback_carries_both_directions() {
        let (connector, mut peers) = LoopbackConnector::new();
        let channel = connector.connect(&setup(), 4).await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        assert_eq!(peer.setup.voice_name, "Kore");

        let (outbound, mut inbound, tasks) = channel.into_parts();
        assert!(tasks.is_empty());
        assert_eq!(inbound.recv().await.unwrap(), ChannelEvent::Opened);

        outbound.send(ClientMessage::audio("AAAA".to_string())).await.unwrap();
        assert_eq!(peer.recv().await.unwrap(), ClientMessage::audio("AAAA".to_string()));

        peer.interrupt().await.unwrap();
        peer.close().await.unwrap();
        match inbound.recv().await.unwrap() {
            ChannelEvent::Message(msg) => assert!(msg.is_interrupted()),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(inbound.recv().await.unwrap(), ChannelEvent::Closed);
    }

    #[tokio::test]
    async fn loopback_can_refuse() {
        let (connector, _peers) = LoopbackConnector::new();
        connector.refuse_next();
        assert!(matches!(
            connector.connect(&setup(), 4).await,
            Err(VoiceError::ChannelOpen(_))
        ));
        assert!(connector.connect(&setup(), 4).await.is_ok());
    }

    #[tokio::test]
    async fn relay_connect_failure_is_channel_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = RelayConnector::new(addr.to_string())
            .connect(&setup(), 4)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, VoiceError::ChannelOpen(_)));
    }

    #[tokio::test]
    async fn relay_speaks_json_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let relay = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut lines = BufReader::new(read_half).lines();

            let setup_line = lines.next_line().await.unwrap().unwrap();
            let audio_line = lines.next_line().await.unwrap().unwrap();

            write_half.write_all(b"{\"setupComplete\":{}}\n").await.unwrap();
            write_half.write_all(b"this is not json\n").await.unwrap();
            write_half
                .write_all(b"{\"serverContent\":{\"interrupted\":true}}\n")
                .await
                .unwrap();
            write_half.shutdown().await.unwrap();
            (setup_line, audio_line)
        });

        let channel = RelayConnector::new(addr.to_string())
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

        let (setup_line, audio_line) = relay.await.unwrap();
        let setup_msg: ClientMessage = serde_json::from_str(&setup_line).unwrap();
        assert_eq!(setup_msg, ClientMessage::setup(&setup()));
        let audio_msg: ClientMessage = serde_json::from_str(&audio_line).unwrap();
        assert_eq!(audio_msg, ClientMessage::audio("AAAA".to_string()));
    }
}
