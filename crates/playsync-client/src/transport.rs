//! Framed text channel to the hub, plus the health probe that gates opening it.
//!
//! The connection manager only ever sees a [`Channel`]: a sink of outgoing
//! frames and a stream of incoming ones.  [`WsConnector`] produces them over a
//! real WebSocket; [`memory_channel`] produces an in-process pair.

use std::future::Future;
use std::pin::Pin;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::PollSender;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ChannelError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("channel closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
}

pub type FrameSink = Pin<Box<dyn Sink<String, Error = ChannelError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, ChannelError>> + Send>>;

/// One open control channel.
pub struct Channel {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> impl Future<Output = Result<Channel, ChannelError>> + Send;
}

/// Cheap reachability check performed before every connect attempt.
pub trait HealthProbe: Send + Sync + 'static {
    fn check(&self) -> impl Future<Output = bool> + Send;
}

pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WsConnector {
    async fn connect(&self) -> Result<Channel, ChannelError> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        let (ws_tx, ws_rx) = ws.split();

        let sink = ws_tx
            .sink_map_err(|e| ChannelError::Transport(e.to_string()))
            .with(|text: String| futures_util::future::ready(Ok::<_, ChannelError>(Message::Text(text))));

        let stream = ws_rx.filter_map(|frame| {
            futures_util::future::ready(match frame {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(bytes)) => Some(
                    String::from_utf8(bytes)
                        .map_err(|e| ChannelError::Transport(format!("non-utf8 frame: {}", e))),
                ),
                // Ping/pong are answered by tungstenite; close ends the stream.
                Ok(_) => None,
                Err(e) => Some(Err(ChannelError::Transport(e.to_string()))),
            })
        });

        Ok(Channel {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// The far end of a [`memory_channel`].
pub struct MemoryPeer {
    /// Frames the client wrote.
    pub outbound: mpsc::Receiver<String>,
    /// Frames (or errors) to deliver to the client.  Dropping it closes the channel.
    pub inbound: mpsc::Sender<Result<String, ChannelError>>,
}

pub fn memory_channel(buffer: usize) -> (Channel, MemoryPeer) {
    let (out_tx, out_rx) = mpsc::channel::<String>(buffer);
    let (in_tx, in_rx) = mpsc::channel::<Result<String, ChannelError>>(buffer);

    let sink = PollSender::new(out_tx).sink_map_err(|_| ChannelError::Closed);
    let stream = futures_util::stream::unfold(in_rx, |mut rx| async move {
        rx.recv().await.map(|frame| (frame, rx))
    });

    let channel = Channel {
        sink: Box::pin(sink),
        stream: Box::pin(stream),
    };
    let peer = MemoryPeer {
        outbound: out_rx,
        inbound: in_tx,
    };
    (channel, peer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_channel_carries_frames_both_ways() {
        let (mut channel, mut peer) = memory_channel(4);

        channel.sink.send("hello".to_string()).await.unwrap();
        assert_eq!(peer.outbound.recv().await.unwrap(), "hello");

        peer.inbound.send(Ok("world".to_string())).await.unwrap();
        assert_eq!(channel.stream.next().await, Some(Ok("world".to_string())));

        drop(peer);
        assert_eq!(channel.stream.next().await, None);
        assert_eq!(
            channel.sink.send("late".to_string()).await,
            Err(ChannelError::Closed)
        );
    }
}
