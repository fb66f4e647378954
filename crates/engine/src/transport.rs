use std::future::Future;
use std::pin::Pin;

use mnemo_protocol::{Conversation, ConversationId, Message, MessageId, TransportResult};
use tokio::sync::{mpsc, oneshot};

use crate::session::StreamTarget;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Detached future that drives one stream's network side to completion.
pub type StreamWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Capability set the engine consumes from the transport boundary.
///
/// `mnemo-client` implements this against the real backend; tests supply
/// in-memory fakes.
pub trait ChatTransport: Send + Sync + 'static {
    fn list_conversations(&self) -> BoxFuture<'_, TransportResult<Vec<Conversation>>>;

    fn create_conversation(&self) -> BoxFuture<'_, TransportResult<Conversation>>;

    fn delete_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, TransportResult<()>>;

    fn load_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, TransportResult<Vec<Message>>>;

    /// Opens the streaming channel for one user message. The returned handle
    /// carries the event receiver plus the worker future the caller spawns;
    /// no network traffic happens until the worker is polled.
    fn open_stream(
        &self,
        conversation_id: ConversationId,
        content: String,
        target: StreamTarget,
    ) -> TransportResult<StreamHandle>;
}

/// Inbound signals on one stream, already mapped out of the wire format.
#[derive(Debug)]
pub enum StreamSignal {
    Chunk(String),
    /// End-of-stream. Carries the server-assigned id of the persisted
    /// assistant message when the completion event provided one.
    Completed { message_id: Option<MessageId> },
    Failed { error: mnemo_protocol::TransportError },
}

/// Receiving half of one stream. Dropping it signals cancellation to the
/// worker, so channel resources are released on every exit path.
pub struct StreamEvents {
    target: StreamTarget,
    signals: mpsc::UnboundedReceiver<StreamSignal>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl StreamEvents {
    pub fn target(&self) -> &StreamTarget {
        &self.target
    }

    pub async fn recv(&mut self) -> Option<StreamSignal> {
        self.signals.recv().await
    }

    /// Explicit cancellation; returns false when the worker already finished.
    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for StreamEvents {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// One opened stream: the event receiver plus the worker that feeds it.
pub struct StreamHandle {
    pub events: StreamEvents,
    pub worker: StreamWorker,
}

/// Builds the plumbing shared by every transport implementation: an
/// unbounded signal channel and a cancel oneshot wired into [`StreamEvents`].
pub fn stream_channel(
    target: StreamTarget,
) -> (
    mpsc::UnboundedSender<StreamSignal>,
    StreamEvents,
    oneshot::Receiver<()>,
) {
    let (signal_tx, signals) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        signal_tx,
        StreamEvents {
            target,
            signals,
            cancel_tx: Some(cancel_tx),
        },
        cancel_rx,
    )
}
