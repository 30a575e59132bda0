//! The caller's connection, as seen by the main coordinator.

use crate::error::{ParleyError, Result};
use crate::pipeline::messages::{AudioChunk, OutboundFrame};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Bidirectional audio connection to one caller.
#[async_trait]
pub trait CallConnection: Send {
    /// Next inbound chunk, in order. `None` once the caller hung up.
    ///
    /// Must be cancel-safe: the coordinator polls it inside `select!`.
    async fn recv_audio(&mut self) -> Option<AudioChunk>;

    /// Write an outbound frame. A `Stop` frame must abort queued audio.
    async fn send(&mut self, frame: OutboundFrame) -> Result<()>;

    /// Close from our side, telling the caller why.
    async fn close(&mut self, reason: &str);
}

/// In-process connection backed by channels.
pub struct ChannelConnection {
    inbound: mpsc::Receiver<AudioChunk>,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    closed: watch::Sender<Option<String>>,
}

/// The far end of a [`ChannelConnection`].
pub struct ChannelPeer {
    audio_tx: Option<mpsc::Sender<AudioChunk>>,
    /// Frames written by the session.
    pub frames_rx: mpsc::UnboundedReceiver<OutboundFrame>,
    closed: watch::Receiver<Option<String>>,
}

/// Create a connected pair buffering up to `buffer` inbound chunks.
pub fn channel_connection(buffer: usize) -> (ChannelConnection, ChannelPeer) {
    let (audio_tx, inbound) = mpsc::channel(buffer.max(1));
    let (outbound, frames_rx) = mpsc::unbounded_channel();
    let (closed, closed_rx) = watch::channel(None);
    (
        ChannelConnection {
            inbound,
            outbound,
            closed,
        },
        ChannelPeer {
            audio_tx: Some(audio_tx),
            frames_rx,
            closed: closed_rx,
        },
    )
}

#[async_trait]
impl CallConnection for ChannelConnection {
    async fn recv_audio(&mut self) -> Option<AudioChunk> {
        if self.closed.borrow().is_some() {
            return None;
        }
        self.inbound.recv().await
    }

    async fn send(&mut self, frame: OutboundFrame) -> Result<()> {
        if self.closed.borrow().is_some() {
            return Err(ParleyError::Channel("connection closed".into()));
        }
        self.outbound
            .send(frame)
            .map_err(|_| ParleyError::Channel("caller went away".into()))
    }

    async fn close(&mut self, reason: &str) {
        debug!(reason, "closing connection");
        self.closed.send_replace(Some(reason.to_owned()));
        self.inbound.close();
    }
}

impl ChannelPeer {
    /// Send caller audio. Returns false once hung up or the session stopped
    /// listening.
    pub async fn send_audio(&self, chunk: AudioChunk) -> bool {
        match &self.audio_tx {
            Some(tx) => tx.send(chunk).await.is_ok(),
            None => false,
        }
    }

    /// Hang up; the session sees the end of inbound audio.
    pub fn hang_up(&mut self) {
        self.audio_tx = None;
    }

    /// Why the session closed the connection, if it has.
    pub fn close_reason(&self) -> Option<String> {
        self.closed.borrow().clone()
    }

    /// Wait until the session closes the connection and return the reason.
    pub async fn closed(&mut self) -> Option<String> {
        self.closed
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|r| r.clone())
    }
}
