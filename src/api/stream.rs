use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::FeedError;

pub const BACKPACK_WS_URL: &str = "wss://ws.backpack.exchange";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport-level frame, stripped of the websocket library's types
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Text(String),
    Ping(Vec<u8>),
    Pong,
    Close,
}

/// Opens streaming sessions. One call = one connection attempt.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn StreamSession>, FeedError>;
}

#[async_trait]
pub trait StreamSession: Send {
    async fn send_text(&mut self, text: String) -> Result<(), FeedError>;

    async fn send_pong(&mut self, payload: Vec<u8>) -> Result<(), FeedError>;

    /// `None` once the connection is gone
    async fn next_message(&mut self) -> Option<Result<StreamMessage, FeedError>>;

    async fn close(&mut self);
}

/// Websocket connector backed by tokio-tungstenite
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(BACKPACK_WS_URL)
    }
}

#[async_trait]
impl StreamConnector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn StreamSession>, FeedError> {
        tracing::info!(url = %self.url, "Connecting to price stream");
        let (ws_stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| FeedError::Connection(e.to_string()))?;
        let (write, read) = ws_stream.split();
        Ok(Box::new(WsSession { write, read }))
    }
}

struct WsSession {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
}

#[async_trait]
impl StreamSession for WsSession {
    async fn send_text(&mut self, text: String) -> Result<(), FeedError> {
        self.write.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn send_pong(&mut self, payload: Vec<u8>) -> Result<(), FeedError> {
        self.write.send(Message::Pong(payload.into())).await?;
        Ok(())
    }

    async fn next_message(&mut self) -> Option<Result<StreamMessage, FeedError>> {
        loop {
            let frame = match self.read.next().await? {
                Ok(frame) => frame,
                Err(e) => return Some(Err(e.into())),
            };
            let message = match frame {
                Message::Text(text) => StreamMessage::Text(text.to_string()),
                Message::Ping(data) => StreamMessage::Ping(data.to_vec()),
                Message::Pong(_) => StreamMessage::Pong,
                Message::Close(frame) => {
                    tracing::info!("Price stream closed by server: {:?}", frame);
                    StreamMessage::Close
                }
                // Binary and raw frames carry nothing we read
                _ => continue,
            };
            return Some(Ok(message));
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.write.close().await {
            tracing::debug!("Error while closing price stream: {}", e);
        }
    }
}
