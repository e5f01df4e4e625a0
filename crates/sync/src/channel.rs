//! Push-channel transport.
//!
//! The server pushes `{ "event": ..., "data": ... }` frames over a
//! websocket. [`PushChannel`] abstracts the transport so the router loop can
//! be driven by a scripted channel in tests.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use printline_protocol::{SyncError, SyncResult};

use crate::router::SyncRouter;

/// One event frame off the push channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushFrame {
    pub event: String,
    pub data: Value,
}

#[async_trait]
pub trait PushChannel: Send {
    /// Next frame, or `None` once the channel has closed.
    async fn next_frame(&mut self) -> SyncResult<Option<PushFrame>>;
}

/// Production push channel over tokio-tungstenite.
pub struct WsPushChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsPushChannel {
    pub async fn connect(url: &str) -> SyncResult<Self> {
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| SyncError::channel(format!("websocket connect failed: {e}")))?;
        info!(url, "push channel connected");
        Ok(Self { stream })
    }
}

#[async_trait]
impl PushChannel for WsPushChannel {
    async fn next_frame(&mut self) -> SyncResult<Option<PushFrame>> {
        loop {
            let message = match self.stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(error)) => {
                    return Err(SyncError::channel(format!("websocket error: {error}")))
                }
                None => return Ok(None),
            };

            match message {
                Message::Text(text) => match parse_frame(&text) {
                    Ok(frame) => return Ok(Some(frame)),
                    Err(error) => {
                        warn!(%error, "skipping malformed push frame");
                    }
                },
                Message::Close(_) => return Ok(None),
                Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => {
                    continue;
                }
            }
        }
    }
}

#[derive(Deserialize)]
struct WireFrame {
    event: String,
    #[serde(default)]
    data: Value,
}

pub(crate) fn parse_frame(text: &str) -> SyncResult<PushFrame> {
    let wire: WireFrame = serde_json::from_str(text)?;
    Ok(PushFrame {
        event: wire.event,
        data: wire.data,
    })
}

/// Drive a router from a push channel until the channel closes or errors.
pub async fn pump<C: PushChannel>(mut channel: C, router: SyncRouter) {
    loop {
        match channel.next_frame().await {
            Ok(Some(frame)) => {
                router.handle_frame(&frame.event, frame.data).await;
            }
            Ok(None) => {
                debug!("push channel closed");
                return;
            }
            Err(error) => {
                warn!(%error, "push channel failed");
                return;
            }
        }
    }
}
