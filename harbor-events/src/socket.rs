//! Socket seam between the transport and a concrete websocket library.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use harbor_core::TransportError;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// Close code reported when the connection drops without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// What a live socket reports to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketSignal {
    /// The handshake completed; frames can flow.
    Opened,
    /// One inbound text frame.
    Text(String),
    /// The socket closed. Terminal.
    Closed { code: u16, reason: String },
    /// The socket failed. Terminal.
    Error(String),
}

/// Channels bridging one socket to the transport.
///
/// Dropping `outbound` asks the socket to close.
#[derive(Debug)]
pub struct SocketLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<SocketSignal>,
}

/// Opens sockets for the transport.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<SocketLink, TransportError>;
}

/// [`Connector`] over `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct TungsteniteConnector {
    endpoint: String,
}

impl TungsteniteConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self) -> Result<SocketLink, TransportError> {
        let (stream, _) = tokio_tungstenite::connect_async(self.endpoint.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut sink, mut source) = stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let _ = inbound_tx.send(SocketSignal::Opened);

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(err) = sink.send(Message::Text(frame)).await {
                    debug!(error = %err, "Websocket write failed");
                    return;
                }
            }
            let close = CloseFrame {
                code: CloseCode::Normal,
                reason: "client disconnect".into(),
            };
            let _ = sink.send(Message::Close(Some(close))).await;
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                let signal = match message {
                    Ok(Message::Text(text)) => SocketSignal::Text(text),
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.into_owned()))
                            .unwrap_or((1005, String::new()));
                        let _ = inbound_tx.send(SocketSignal::Closed { code, reason });
                        return;
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        let _ = inbound_tx.send(SocketSignal::Error(err.to_string()));
                        return;
                    }
                };
                if inbound_tx.send(signal).is_err() {
                    return;
                }
            }
            let _ = inbound_tx.send(SocketSignal::Closed {
                code: ABNORMAL_CLOSURE,
                reason: String::new(),
            });
        });

        Ok(SocketLink { outbound, inbound })
    }
}
