//! STOMP-over-WebSocket broker transport.
//!
//! Production implementation of [`MessageTransport`] used by the agent to
//! talk to the DUET `app-sender` broker endpoint.

use crate::error::EnvError;
use crate::stomp::Frame;
use crate::transport::MessageTransport;
use crate::types::{ClientId, InboundMessage};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Broker transport speaking STOMP 1.2 over a WebSocket.
pub struct StompWsTransport {
    /// WebSocket endpoint, e.g. `wss://broker.example/app-sender/websocket`
    url: String,

    /// Virtual host sent in the CONNECT frame
    host: String,

    client_id: ClientId,

    /// Write half of the live connection
    sink: Mutex<Option<SplitSink<WsStream, Message>>>,

    /// Read half of the live connection
    stream: Mutex<Option<SplitStream<WsStream>>>,

    /// Subscription id counter (`sub-N`)
    next_subscription: AtomicU64,
}

impl StompWsTransport {
    /// Creates a transport for the given endpoint. Does not connect.
    pub fn new(url: impl Into<String>, host: impl Into<String>, client_id: ClientId) -> Self {
        Self {
            url: url.into(),
            host: host.into(),
            client_id,
            sink: Mutex::new(None),
            stream: Mutex::new(None),
            next_subscription: AtomicU64::new(0),
        }
    }

    async fn send_frame(&self, frame: Frame) -> Result<(), EnvError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(EnvError::NotConnected)?;
        sink.send(Message::Text(frame.encode()))
            .await
            .map_err(|e| EnvError::network(e.to_string()))
    }

    /// Reads frames until one is available, skipping heart-beats.
    async fn next_frame(stream: &mut SplitStream<WsStream>) -> Result<Frame, EnvError> {
        loop {
            let text = match stream.next().await {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Binary(bytes))) => String::from_utf8(bytes)
                    .map_err(|e| EnvError::SerializationError(e.to_string()))?,
                Some(Ok(Message::Close(_))) | None => return Err(EnvError::ConnectionClosed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(EnvError::network(e.to_string())),
            };
            if let Some(frame) = Frame::decode(&text)? {
                return Ok(frame);
            }
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[async_trait]
impl MessageTransport for StompWsTransport {
    async fn connect(&self) -> Result<(), EnvError> {
        self.disconnect().await;

        let (socket, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| EnvError::network(format!("{}: {}", self.url, e)))?;
        let (mut sink, mut stream) = socket.split();

        sink.send(Message::Text(Frame::connect(&self.host).encode()))
            .await
            .map_err(|e| EnvError::network(e.to_string()))?;

        let reply = Self::next_frame(&mut stream).await?;
        match reply.command.as_str() {
            "CONNECTED" => {
                info!(
                    url = %self.url,
                    version = reply.header("version").unwrap_or("?"),
                    "Websockets are: CONNECTED"
                );
            }
            "ERROR" => {
                return Err(EnvError::protocol(
                    reply.header("message").unwrap_or(reply.body.as_str()).to_string(),
                ))
            }
            other => return Err(EnvError::protocol(format!("unexpected {other} frame during connect"))),
        }

        *self.sink.lock().await = Some(sink);
        *self.stream.lock().await = Some(stream);
        self.next_subscription.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, destination: &str) -> Result<(), EnvError> {
        let id = format!("sub-{}", self.next_subscription.fetch_add(1, Ordering::SeqCst));
        self.send_frame(Frame::subscribe(&id, destination)).await?;
        debug!(%destination, %id, "subscribed to topic");
        Ok(())
    }

    async fn recv(&self) -> Result<InboundMessage, EnvError> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(EnvError::NotConnected)?;
        loop {
            let frame = match Self::next_frame(stream).await {
                Ok(frame) => frame,
                Err(e) => {
                    *guard = None;
                    return Err(e);
                }
            };
            match frame.command.as_str() {
                "MESSAGE" => {
                    let destination = frame.header("destination").unwrap_or_default().to_string();
                    return Ok(InboundMessage::new(destination, frame.body, now_ms()));
                }
                "ERROR" => {
                    *guard = None;
                    return Err(EnvError::protocol(
                        frame.header("message").unwrap_or(frame.body.as_str()).to_string(),
                    ));
                }
                other => {
                    warn!(command = other, "ignoring unexpected frame");
                }
            }
        }
    }

    async fn send(&self, destination: &str, body: &str) -> Result<(), EnvError> {
        self.send_frame(Frame::send(destination, body)).await
    }

    async fn disconnect(&self) {
        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            let _ = sink.send(Message::Text(Frame::disconnect().encode())).await;
            let _ = sink.close().await;
        }
        self.stream.lock().await.take();
    }

    fn client_id(&self) -> &ClientId {
        &self.client_id
    }
}
