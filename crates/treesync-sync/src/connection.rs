//! Write-serialized peer connection
//!
//! A WebSocket sink cannot be written from two tasks at once. On the server
//! the per-connection read loop (answering file requests) and the shared
//! apply-queue processor (broadcasting) both write to the same peer, so every
//! write goes through the mutex held by [`Connection`].
//!
//! The read half is not wrapped: exactly one task reads each connection.

use std::pin::Pin;

use futures_util::{Sink, SinkExt};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use treesync_core::protocol::{Envelope, ProtocolError};

use crate::SyncError;

type MessageSink = Pin<Box<dyn Sink<Message, Error = SyncError> + Send>>;

/// Outbound half of one peer connection
pub struct Connection {
    sink: Mutex<MessageSink>,
}

impl Connection {
    /// Wraps any message sink, typically the write half of a split WebSocket stream.
    pub fn new<S>(sink: S) -> Self
    where
        S: Sink<Message> + Send + 'static,
        S::Error: std::fmt::Display,
    {
        let sink = sink.sink_map_err(|e| SyncError::Transport(e.to_string()));
        Self {
            sink: Mutex::new(Box::pin(sink)),
        }
    }

    /// Encodes and sends one envelope.
    ///
    /// # Errors
    /// Returns an error if encoding fails or the peer can no longer be written to.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), SyncError> {
        let text = envelope.encode()?;
        debug!(kind = envelope.kind(), bytes = text.len(), "Sending envelope");
        self.send_encoded(text).await
    }

    /// Sends an already-encoded envelope.
    ///
    /// Broadcasting encodes once and calls this for every peer.
    pub async fn send_encoded(&self, text: String) -> Result<(), SyncError> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text.into())).await
    }

    /// Sends a close frame and flushes. Errors are ignored; the peer may already be gone.
    pub async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    }
}

/// Decodes the envelope carried by one inbound frame.
///
/// Text frames and binary frames holding UTF-8 JSON both carry envelopes.
/// Control frames yield `Ok(None)`.
pub fn decode_message(message: &Message) -> Result<Option<Envelope>, ProtocolError> {
    match message {
        Message::Text(text) => Envelope::decode(text.as_str()).map(Some),
        Message::Binary(bytes) => Envelope::decode(&String::from_utf8_lossy(bytes)).map(Some),
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) | Message::Frame(_) => Ok(None),
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}
