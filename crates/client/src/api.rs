use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use mnemo_engine::{BoxFuture, ChatTransport, StreamHandle, StreamSignal, StreamTarget, stream_channel};
use mnemo_protocol::error::ProtocolSnafu;
use mnemo_protocol::{
    Conversation, ConversationDto, ConversationId, CreateConversationRequest, Message, MessageDto,
    SendMessageRequest, ServerFrame, SseDecoder, StreamEvent, TransportError, TransportResult,
};
use reqwest::Method;
use snafu::ResultExt;
use tokio::sync::{mpsc, oneshot};

use crate::config::ClientConfig;
use crate::http::Backend;

/// Backend REST + SSE transport consumed by the engine through
/// [`ChatTransport`].
pub struct ApiClient {
    backend: Arc<Backend>,
}

impl ApiClient {
    pub fn new(config: ClientConfig) -> TransportResult<Self> {
        Ok(Self {
            backend: Arc::new(Backend::new(config)?),
        })
    }

    /// Shares an existing backend, so the auth client and the chat transport
    /// use the same pool and token.
    pub fn with_backend(backend: Arc<Backend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }
}

impl ChatTransport for ApiClient {
    fn list_conversations(&self) -> BoxFuture<'_, TransportResult<Vec<Conversation>>> {
        Box::pin(async move {
            let request =
                self.backend
                    .authed(Method::GET, "/chat/conversations", "list-conversations")?;
            let listing: Vec<ConversationDto> = self
                .backend
                .send_json(request, "list-conversations")
                .await?;

            Ok(listing
                .into_iter()
                .map(ConversationDto::into_conversation)
                .collect())
        })
    }

    fn create_conversation(&self) -> BoxFuture<'_, TransportResult<Conversation>> {
        Box::pin(async move {
            let request = self
                .backend
                .authed(Method::POST, "/chat/conversations", "create-conversation")?
                .json(&CreateConversationRequest { title: None });
            let created: ConversationDto = self
                .backend
                .send_json(request, "create-conversation")
                .await?;

            Ok(created.into_conversation())
        })
    }

    fn delete_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, TransportResult<()>> {
        Box::pin(async move {
            let path = format!("/chat/conversations/{conversation_id}");
            let request = self
                .backend
                .authed(Method::DELETE, &path, "delete-conversation")?;
            self.backend
                .send_no_content(request, "delete-conversation")
                .await
        })
    }

    fn load_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, TransportResult<Vec<Message>>> {
        Box::pin(async move {
            let path = format!("/chat/conversations/{conversation_id}/messages");
            let request = self
                .backend
                .authed(Method::GET, &path, "load-messages")?
                .query(&[("limit", self.backend.config().history_limit)]);
            let history: Vec<MessageDto> = self.backend.send_json(request, "load-messages").await?;

            Ok(history
                .into_iter()
                .map(|message| message.into_message(conversation_id.clone()))
                .collect())
        })
    }

    fn open_stream(
        &self,
        conversation_id: ConversationId,
        content: String,
        target: StreamTarget,
    ) -> TransportResult<StreamHandle> {
        let request = self
            .backend
            .authed(Method::POST, "/chat/send", "open-stream")?
            .json(&SendMessageRequest {
                content,
                conversation_id,
                stream: true,
            });

        let inactivity = self.backend.config().stream_inactivity_timeout();
        let (signal_tx, events, cancel_rx) = stream_channel(target);
        let worker = Box::pin(run_stream_worker(request, signal_tx, cancel_rx, inactivity));

        Ok(StreamHandle { events, worker })
    }
}

/// Network side of one stream. Runs until a terminal event, the cancel
/// signal or an error; dropping the response tears the connection down.
async fn run_stream_worker(
    request: reqwest::RequestBuilder,
    signal_tx: mpsc::UnboundedSender<StreamSignal>,
    cancel_rx: oneshot::Receiver<()>,
    inactivity: Duration,
) {
    let drive = drive_stream(request, &signal_tx, inactivity);
    tokio::pin!(drive);

    let result = tokio::select! {
        _ = cancel_rx => {
            tracing::debug!("stream worker cancelled");
            return;
        }
        result = &mut drive => result,
    };

    if let Err(error) = result {
        let _ = signal_tx.send(StreamSignal::Failed { error });
    }
}

async fn drive_stream(
    request: reqwest::RequestBuilder,
    signal_tx: &mpsc::UnboundedSender<StreamSignal>,
    inactivity: Duration,
) -> TransportResult<()> {
    let response = request
        .send()
        .await
        .map_err(|error| TransportError::Network {
            stage: "open-stream",
            message: error.to_string(),
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TransportError::Status {
            stage: "open-stream",
            status: status.as_u16(),
            body,
        });
    }

    pump_sse(response.bytes_stream(), signal_tx, inactivity).await
}

/// Decodes SSE frames into stream signals, enforcing the inactivity limit
/// between chunks. Generic over the byte stream so it is unit-testable
/// without a server.
async fn pump_sse<S, B, E>(
    stream: S,
    signal_tx: &mpsc::UnboundedSender<StreamSignal>,
    inactivity: Duration,
) -> TransportResult<()>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut stream = std::pin::pin!(stream);
    let mut decoder = SseDecoder::new();

    loop {
        let next = tokio::time::timeout(inactivity, stream.next())
            .await
            .map_err(|_| TransportError::StreamInactive {
                stage: "stream-pump",
                limit_seconds: inactivity.as_secs(),
            })?;

        let Some(item) = next else {
            // Connection ended without `[DONE]`; dropping the sender lets the
            // consumer treat the silent close as a failure.
            tracing::debug!("event stream ended without a terminal frame");
            return Ok(());
        };
        let bytes = item.map_err(|error| TransportError::Network {
            stage: "stream-pump",
            message: error.to_string(),
        })?;

        let frames = decoder.feed(bytes.as_ref()).context(ProtocolSnafu {
            stage: "stream-pump",
        })?;
        for frame in frames {
            match frame {
                ServerFrame::Event(StreamEvent::Chunk { content }) => {
                    if signal_tx.send(StreamSignal::Chunk(content)).is_err() {
                        // Receiver gone: the stream was abandoned.
                        return Ok(());
                    }
                }
                ServerFrame::Event(StreamEvent::Complete { message }) => {
                    let _ = signal_tx.send(StreamSignal::Completed {
                        message_id: Some(message.id),
                    });
                    return Ok(());
                }
                ServerFrame::Event(StreamEvent::Error { message }) => {
                    return Err(TransportError::Upstream {
                        stage: "stream-pump",
                        message,
                    });
                }
                ServerFrame::Done => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use futures::stream;

    use super::*;

    fn byte_stream(
        parts: Vec<&'static str>,
    ) -> impl Stream<Item = Result<&'static [u8], Infallible>> {
        stream::iter(parts.into_iter().map(|part| Ok(part.as_bytes())))
    }

    fn channel() -> (
        mpsc::UnboundedSender<StreamSignal>,
        mpsc::UnboundedReceiver<StreamSignal>,
    ) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn chunks_complete_and_done_map_to_signals_in_order() {
        let (signal_tx, mut signal_rx) = channel();
        let parts = vec![
            "data: {\"type\":\"chunk\",\"content\":\"Hi\"}\n\n",
            // Frame split across two network reads.
            "data: {\"type\":\"chunk\",\"cont",
            "ent\":\" there\"}\n\ndata: {\"type\":\"complete\",\"message\":\
             {\"id\":\"m9\",\"content\":\"Hi there\",\"turn_number\":5,\
             \"created_at\":\"2026-08-23T09:15:03\"}}\n\ndata: [DONE]\n\n",
        ];

        pump_sse(byte_stream(parts), &signal_tx, Duration::from_secs(5))
            .await
            .expect("pump");
        drop(signal_tx);

        assert!(matches!(
            signal_rx.recv().await,
            Some(StreamSignal::Chunk(chunk)) if chunk == "Hi"
        ));
        assert!(matches!(
            signal_rx.recv().await,
            Some(StreamSignal::Chunk(chunk)) if chunk == " there"
        ));
        assert!(matches!(
            signal_rx.recv().await,
            Some(StreamSignal::Completed { message_id: Some(id) }) if id.as_str() == "m9"
        ));
        assert!(signal_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn server_error_events_fail_the_pump() {
        let (signal_tx, mut signal_rx) = channel();
        let parts = vec![
            "data: {\"type\":\"chunk\",\"content\":\"par\"}\n\n",
            "data: {\"type\":\"error\",\"message\":\"model unavailable\"}\n\n",
        ];

        let error = pump_sse(byte_stream(parts), &signal_tx, Duration::from_secs(5))
            .await
            .expect_err("upstream error");
        assert!(matches!(
            error,
            TransportError::Upstream { message, .. } if message == "model unavailable"
        ));

        // The partial chunk was still delivered before the failure.
        assert!(matches!(
            signal_rx.recv().await,
            Some(StreamSignal::Chunk(chunk)) if chunk == "par"
        ));
    }

    #[tokio::test]
    async fn malformed_frames_fail_with_a_protocol_error() {
        let (signal_tx, _signal_rx) = channel();
        let parts = vec!["data: {not json}\n\n"];

        let error = pump_sse(byte_stream(parts), &signal_tx, Duration::from_secs(5))
            .await
            .expect_err("decode failure");
        assert!(matches!(error, TransportError::Protocol { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn a_silent_stream_times_out() {
        let (signal_tx, _signal_rx) = channel();
        let silent = stream::pending::<Result<&'static [u8], Infallible>>();

        let error = pump_sse(silent, &signal_tx, Duration::from_secs(60))
            .await
            .expect_err("inactivity timeout");
        assert!(matches!(
            error,
            TransportError::StreamInactive {
                limit_seconds: 60,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn done_without_complete_ends_the_pump_cleanly() {
        let (signal_tx, mut signal_rx) = channel();
        let parts = vec!["data: [DONE]\n\n"];

        pump_sse(byte_stream(parts), &signal_tx, Duration::from_secs(5))
            .await
            .expect("pump");
        drop(signal_tx);

        // No terminal signal was sent; the consumer sees a closed channel.
        assert!(signal_rx.recv().await.is_none());
    }
}
