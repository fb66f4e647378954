use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::Utc;
use mnemo_protocol::{Conversation, ConversationId, Message, MessageId, Role, TransportError};
use snafu::ResultExt;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;

use crate::conversations::ConversationStore;
use crate::error::{
    EngineResult, InvalidStateSnafu, NotFoundSnafu, TransportSnafu, ValidationSnafu,
};
use crate::session::{StreamTarget, StreamingSession};
use crate::state::{EngineEvent, EngineState};
use crate::timeline::MessageTimeline;
use crate::transport::{ChatTransport, StreamEvents, StreamSignal};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Orchestrates the conversation store, message timeline and streaming
/// session, and is the sole owner of mutation.
///
/// Every operation locks the core, mutates, publishes a fresh snapshot and
/// unlocks; network awaits never happen under the lock, so chunk application
/// and engine operations interleave only at suspension points.
pub struct ChatEngine<T: ChatTransport> {
    transport: Arc<T>,
    shared: Arc<EngineShared>,
}

struct EngineShared {
    core: Mutex<EngineCore>,
    snapshot: ArcSwap<EngineState>,
    events: broadcast::Sender<EngineEvent>,
}

#[derive(Default)]
struct EngineCore {
    conversations: ConversationStore,
    timeline: MessageTimeline,
    session: StreamingSession,
    active_stream: Option<ActiveStream>,
    is_busy: bool,
    last_error: Option<String>,
}

/// Task handles for the in-flight stream. Aborting the reader drops its
/// [`StreamEvents`], which fires the cancel oneshot toward the worker.
struct ActiveStream {
    worker_task: JoinHandle<()>,
    reader_task: JoinHandle<()>,
}

impl ActiveStream {
    fn abort(self) {
        self.worker_task.abort();
        self.reader_task.abort();
    }
}

impl<T: ChatTransport> ChatEngine<T> {
    pub fn new(transport: T) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            transport: Arc::new(transport),
            shared: Arc::new(EngineShared {
                core: Mutex::new(EngineCore::default()),
                snapshot: ArcSwap::from_pointee(EngineState::default()),
                events,
            }),
        }
    }

    /// Current immutable snapshot; cheap to call from any render pass.
    pub fn state(&self) -> Arc<EngineState> {
        self.shared.snapshot.load_full()
    }

    /// Granular change notifications for scroll-follow style consumers.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }

    /// Replaces the conversation list from the server. On failure the prior
    /// list (and selection) stays intact so the UI never regresses to empty.
    pub async fn load_conversations(&self) -> EngineResult<()> {
        self.shared.set_busy(true).await;
        let result = self.transport.list_conversations().await;

        let mut core = self.shared.core.lock().await;
        core.is_busy = false;
        match result {
            Ok(conversations) => {
                tracing::debug!(count = conversations.len(), "replaced conversation list");
                let selection_lost = core.conversations.replace_all(conversations);
                let mut events = vec![
                    EngineEvent::BusyChanged(false),
                    EngineEvent::ConversationsReplaced,
                ];
                if selection_lost {
                    core.timeline.clear();
                    events.push(EngineEvent::ConversationSelected(None));
                }
                self.shared.publish(&core, events);
                Ok(())
            }
            Err(error) => {
                core.last_error = Some(error.to_string());
                self.shared.publish(
                    &core,
                    vec![EngineEvent::BusyChanged(false), EngineEvent::ErrorChanged],
                );
                Err(error).context(TransportSnafu {
                    stage: "load-conversations",
                })
            }
        }
    }

    /// Creates a conversation, inserts it at the head of the list and
    /// selects it. Any prior timeline and draft are cleared, which cancels
    /// an in-flight stream.
    pub async fn create_conversation(&self) -> EngineResult<Conversation> {
        self.shared.set_busy(true).await;
        let result = self.transport.create_conversation().await;

        let mut core = self.shared.core.lock().await;
        core.is_busy = false;
        match result {
            Ok(conversation) => {
                let mut events = vec![EngineEvent::BusyChanged(false)];
                if let Some(target) = core.cancel_active_stream() {
                    events.push(EngineEvent::DraftCancelled(target));
                }

                tracing::info!(conversation_id = %conversation.id, "created conversation");
                core.conversations.insert_created(conversation.clone());
                core.timeline.replace(conversation.id.clone(), Vec::new());
                events.extend([
                    EngineEvent::ConversationCreated(conversation.id.clone()),
                    EngineEvent::ConversationSelected(Some(conversation.id.clone())),
                    EngineEvent::TimelineReplaced(conversation.id.clone()),
                ]);
                self.shared.publish(&core, events);
                Ok(conversation)
            }
            Err(error) => {
                core.last_error = Some(error.to_string());
                self.shared.publish(
                    &core,
                    vec![EngineEvent::BusyChanged(false), EngineEvent::ErrorChanged],
                );
                Err(error).context(TransportSnafu {
                    stage: "create-conversation",
                })
            }
        }
    }

    /// Makes `conversation_id` current and reloads its history. A foreign
    /// in-flight draft is left streaming in the background; it is promoted
    /// into its own conversation on completion. Deleting that conversation
    /// is the one thing that cancels it.
    pub async fn select_conversation(&self, conversation_id: &ConversationId) -> EngineResult<()> {
        {
            let core = self.shared.core.lock().await;
            if core.conversations.current_id() == Some(conversation_id) {
                return Ok(());
            }
            if !core.conversations.contains(conversation_id) {
                return NotFoundSnafu {
                    stage: "select-conversation",
                    conversation_id: conversation_id.clone(),
                }
                .fail();
            }
        }

        self.shared.set_busy(true).await;
        let result = self.transport.load_messages(conversation_id.clone()).await;

        let mut core = self.shared.core.lock().await;
        core.is_busy = false;
        match result {
            Ok(messages) => {
                // The conversation may have been deleted while history loaded.
                if core.conversations.select(conversation_id).is_err() {
                    self.shared
                        .publish(&core, vec![EngineEvent::BusyChanged(false)]);
                    return NotFoundSnafu {
                        stage: "select-conversation",
                        conversation_id: conversation_id.clone(),
                    }
                    .fail();
                }

                core.timeline.replace(conversation_id.clone(), messages);
                self.shared.publish(
                    &core,
                    vec![
                        EngineEvent::BusyChanged(false),
                        EngineEvent::ConversationSelected(Some(conversation_id.clone())),
                        EngineEvent::TimelineReplaced(conversation_id.clone()),
                    ],
                );
                Ok(())
            }
            Err(error) => {
                // Selection is not committed on a failed history read, so
                // the previous timeline still matches the previous current.
                core.last_error = Some(error.to_string());
                self.shared.publish(
                    &core,
                    vec![EngineEvent::BusyChanged(false), EngineEvent::ErrorChanged],
                );
                Err(error).context(TransportSnafu {
                    stage: "select-conversation",
                })
            }
        }
    }

    /// Deletes a conversation. If it was current, the selection and timeline
    /// are cleared; if it owned the active draft, that stream is cancelled,
    /// since the conversation the draft would attach to no longer exists.
    pub async fn delete_conversation(&self, conversation_id: &ConversationId) -> EngineResult<()> {
        {
            let core = self.shared.core.lock().await;
            if !core.conversations.contains(conversation_id) {
                return NotFoundSnafu {
                    stage: "delete-conversation",
                    conversation_id: conversation_id.clone(),
                }
                .fail();
            }
        }

        self.shared.set_busy(true).await;
        let result = self
            .transport
            .delete_conversation(conversation_id.clone())
            .await;

        let mut core = self.shared.core.lock().await;
        core.is_busy = false;
        match result {
            Ok(()) => {
                let mut events = vec![EngineEvent::BusyChanged(false)];

                let owns_draft = core
                    .session
                    .active_target()
                    .is_some_and(|target| target.conversation_id == *conversation_id);
                if owns_draft
                    && let Some(target) = core.cancel_active_stream()
                {
                    events.push(EngineEvent::DraftCancelled(target));
                }

                match core.conversations.remove(conversation_id) {
                    Ok(was_current) => {
                        if was_current {
                            core.timeline.clear();
                            events.push(EngineEvent::ConversationSelected(None));
                        }
                    }
                    Err(error) => {
                        // A refresh dropped it locally while the server
                        // delete was in flight; the outcome is the same.
                        tracing::warn!(
                            %error,
                            "conversation vanished locally before the delete finished"
                        );
                    }
                }

                tracing::info!(%conversation_id, "deleted conversation");
                events.push(EngineEvent::ConversationDeleted(conversation_id.clone()));
                self.shared.publish(&core, events);
                Ok(())
            }
            Err(error) => {
                core.last_error = Some(error.to_string());
                self.shared.publish(
                    &core,
                    vec![EngineEvent::BusyChanged(false), EngineEvent::ErrorChanged],
                );
                Err(error).context(TransportSnafu {
                    stage: "delete-conversation",
                })
            }
        }
    }

    /// Appends the user's message optimistically and opens the streaming
    /// channel for the assistant reply. Fails fast with `ValidationError`
    /// on blank input, `InvalidStateError` without a selected conversation
    /// and `ConcurrentStreamError` while another stream is active; none of
    /// these contact the transport.
    pub async fn send_message(&self, content: &str) -> EngineResult<()> {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return ValidationSnafu {
                stage: "send-message",
                reason: "message content is empty after trimming",
            }
            .fail();
        }

        let (conversation_id, target) = {
            let mut core = self.shared.core.lock().await;
            let conversation_id = core
                .conversations
                .current()
                .map(|conversation| conversation.id.clone())
                .ok_or_else(|| {
                    InvalidStateSnafu {
                        stage: "send-message",
                        operation: "send_message",
                    }
                    .build()
                })?;

            let target = core.session.begin(conversation_id.clone())?;

            let now = Utc::now();
            let user_message = Message {
                id: MessageId::local(),
                conversation_id: conversation_id.clone(),
                role: Role::User,
                content: trimmed.to_string(),
                turn_number: core.timeline.max_turn() + 1,
                created_at: now,
            };
            let appended = EngineEvent::MessageAppended {
                conversation_id: conversation_id.clone(),
                message_id: user_message.id.clone(),
                turn_number: user_message.turn_number,
            };
            core.conversations
                .note_turn(&conversation_id, user_message.turn_number, now);
            if let Err(error) = core.timeline.append(user_message) {
                // Unreachable by construction (max + 1), but never panic here.
                core.session.cancel();
                return Err(error);
            }

            self.shared
                .publish(&core, vec![appended, EngineEvent::DraftStarted(target.clone())]);
            (conversation_id, target)
        };

        match self
            .transport
            .open_stream(conversation_id, trimmed.to_string(), target.clone())
        {
            Ok(handle) => {
                let worker_task = tokio::spawn(handle.worker);
                let reader_task =
                    tokio::spawn(run_stream_reader(self.shared.clone(), handle.events));

                let mut core = self.shared.core.lock().await;
                if core.session.accepts(&target) {
                    core.active_stream = Some(ActiveStream {
                        worker_task,
                        reader_task,
                    });
                } else {
                    // The session ended while the lock was released (a
                    // cancel or delete landed, or the stream already
                    // finished). Tear the fresh tasks down so the channel
                    // closes instead of leaking a detached stream.
                    worker_task.abort();
                    reader_task.abort();
                }
                Ok(())
            }
            Err(error) => {
                let mut core = self.shared.core.lock().await;
                if core.session.fail(&target).is_some() {
                    core.last_error = Some(error.to_string());
                    self.shared.publish(
                        &core,
                        vec![EngineEvent::DraftFailed(target), EngineEvent::ErrorChanged],
                    );
                }
                Err(error).context(TransportSnafu {
                    stage: "open-stream",
                })
            }
        }
    }

    /// Explicit stop: closes the channel and discards the draft. Idempotent;
    /// cancelling with no active stream is a no-op.
    pub async fn cancel_stream(&self) -> EngineResult<()> {
        let mut core = self.shared.core.lock().await;
        let Some(target) = core.cancel_active_stream() else {
            return Ok(());
        };

        tracing::info!(?target, "cancelled stream; draft discarded");
        self.shared
            .publish(&core, vec![EngineEvent::DraftCancelled(target)]);
        Ok(())
    }
}

impl<T: ChatTransport> Drop for ChatEngine<T> {
    fn drop(&mut self) {
        // Best-effort teardown so the worker's connection is released even
        // when the engine goes away mid-stream.
        if let Ok(mut core) = self.shared.core.try_lock() {
            core.cancel_active_stream();
        }
    }
}

impl EngineCore {
    /// Cancels the session and aborts both stream tasks. Returns the target
    /// that was cancelled, if any.
    fn cancel_active_stream(&mut self) -> Option<StreamTarget> {
        let target = self.session.active_target().cloned();
        self.session.cancel();
        if let Some(active) = self.active_stream.take() {
            active.abort();
        }
        target
    }
}

impl EngineShared {
    async fn set_busy(&self, busy: bool) {
        let mut core = self.core.lock().await;
        core.is_busy = busy;
        self.publish(&core, vec![EngineEvent::BusyChanged(busy)]);
    }

    /// Rebuilds and stores the snapshot, then emits the change events.
    /// Missing or lagging subscribers never block the engine.
    fn publish(&self, core: &EngineCore, events: Vec<EngineEvent>) {
        let state = EngineState {
            conversations: core.conversations.conversations().to_vec(),
            current_conversation: core.conversations.current().cloned(),
            timeline: core.timeline.messages().to_vec(),
            draft: core.session.draft().cloned(),
            is_busy: core.is_busy,
            last_error: core.last_error.clone(),
        };
        self.snapshot.store(Arc::new(state));

        for event in events {
            let _ = self.events.send(event);
        }
    }

    async fn apply_chunk(&self, target: &StreamTarget, delta: String) {
        let mut core = self.core.lock().await;
        match core.session.push_chunk(target, &delta) {
            Some(accumulated_len) => self.publish(
                &core,
                vec![EngineEvent::DraftDelta {
                    target: target.clone(),
                    accumulated_len,
                }],
            ),
            None => tracing::debug!(?target, "ignored chunk for stale stream target"),
        }
    }

    async fn apply_completion(&self, target: &StreamTarget, message_id: Option<MessageId>) {
        let mut core = self.core.lock().await;
        let Some(draft) = core.session.complete(target) else {
            tracing::debug!(?target, "ignored completion for stale stream target");
            return;
        };
        core.active_stream.take();

        let conversation_id = draft.conversation_id.clone();
        let now = Utc::now();
        let mut events = Vec::new();

        let displayed = core.timeline.conversation_id() == Some(&conversation_id);
        let turn_number = if displayed {
            core.timeline.max_turn() + 1
        } else {
            core.conversations
                .get(&conversation_id)
                .map(|conversation| conversation.turn_count + 1)
                .unwrap_or(1)
        };

        let message = Message {
            id: message_id.unwrap_or_else(MessageId::local),
            conversation_id: conversation_id.clone(),
            role: Role::Assistant,
            content: draft.accumulated_text,
            turn_number,
            created_at: now,
        };

        if displayed {
            match core.timeline.append(message.clone()) {
                Ok(()) => events.push(EngineEvent::MessageAppended {
                    conversation_id: conversation_id.clone(),
                    message_id: message.id.clone(),
                    turn_number,
                }),
                Err(error) => {
                    tracing::warn!(%error, "dropped promoted assistant message")
                }
            }
        } else {
            // Promotion into a switched-away conversation already happened
            // server-side; only the sidebar counters move locally.
            tracing::debug!(%conversation_id, "stream completed for a background conversation");
        }

        core.conversations.note_turn(&conversation_id, turn_number, now);
        events.push(EngineEvent::DraftCompleted(target.clone()));
        self.publish(&core, events);
    }

    async fn apply_failure(&self, target: &StreamTarget, error: TransportError) {
        let mut core = self.core.lock().await;
        if core.session.fail(target).is_none() {
            tracing::debug!(?target, "ignored failure for stale stream target");
            return;
        }
        core.active_stream.take();

        tracing::warn!(%error, ?target, "stream failed; partial draft discarded");
        core.last_error = Some(error.to_string());
        self.publish(
            &core,
            vec![
                EngineEvent::DraftFailed(target.clone()),
                EngineEvent::ErrorChanged,
            ],
        );
    }
}

/// Consumes one stream's signals and applies them to the engine. A channel
/// that closes without a terminal signal is treated as a failure so a torn
/// connection can never leave the session active forever.
async fn run_stream_reader(shared: Arc<EngineShared>, mut events: StreamEvents) {
    let target = events.target().clone();

    while let Some(signal) = events.recv().await {
        match signal {
            StreamSignal::Chunk(delta) => shared.apply_chunk(&target, delta).await,
            StreamSignal::Completed { message_id } => {
                shared.apply_completion(&target, message_id).await;
                return;
            }
            StreamSignal::Failed { error } => {
                shared.apply_failure(&target, error).await;
                return;
            }
        }
    }

    shared
        .apply_failure(
            &target,
            TransportError::ChannelClosed {
                stage: "stream-reader",
            },
        )
        .await;
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::mpsc;
    use std::time::Duration;

    use mnemo_protocol::TransportResult;
    use tokio::sync::Notify;

    use super::*;
    use crate::error::EngineError;
    use crate::transport::{BoxFuture, StreamHandle, stream_channel};

    #[derive(Clone)]
    enum ScriptStep {
        Chunk(&'static str),
        Complete,
        Fail(&'static str),
        /// Park until the test calls `release()`, then continue.
        WaitForRelease,
        /// Park until the stream is cancelled.
        HoldUntilCancelled,
    }

    /// Rendezvous for holding one transport call open: the call signals
    /// `entered_tx` and then blocks until the test sends on the paired
    /// proceed channel.
    struct CallGate {
        entered_tx: mpsc::Sender<()>,
        proceed_rx: mpsc::Receiver<()>,
    }

    impl CallGate {
        fn pass(self) {
            let _ = self.entered_tx.send(());
            let _ = self.proceed_rx.recv();
        }
    }

    /// Flips the shared flag when dropped, so tests can observe a worker
    /// future being torn down.
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, AtomicOrdering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeTransport {
        conversations: StdMutex<Vec<Conversation>>,
        histories: StdMutex<HashMap<ConversationId, Vec<Message>>>,
        scripts: StdMutex<VecDeque<Vec<ScriptStep>>>,
        opened_streams: AtomicUsize,
        created: AtomicUsize,
        fail_listing: AtomicBool,
        release: Arc<Notify>,
        open_gate: StdMutex<Option<CallGate>>,
        delete_gate: StdMutex<Option<CallGate>>,
        worker_dropped: Arc<AtomicBool>,
    }

    impl FakeTransport {
        fn seed_conversation(&self, raw_id: &str, turns: &[&str]) {
            let id = ConversationId::new(raw_id);
            let messages: Vec<Message> = turns
                .iter()
                .enumerate()
                .map(|(index, content)| Message {
                    id: MessageId::local(),
                    conversation_id: id.clone(),
                    role: if index % 2 == 0 {
                        Role::User
                    } else {
                        Role::Assistant
                    },
                    content: content.to_string(),
                    turn_number: index as u32 + 1,
                    created_at: Utc::now(),
                })
                .collect();

            self.conversations.lock().unwrap().push(Conversation {
                id: id.clone(),
                title: format!("Conversation {raw_id}"),
                turn_count: messages.len() as u32,
                updated_at: Utc::now(),
            });
            self.histories.lock().unwrap().insert(id, messages);
        }

        fn script_stream(&self, steps: Vec<ScriptStep>) {
            self.scripts.lock().unwrap().push_back(steps);
        }

        fn release(&self) {
            self.release.notify_one();
        }

        fn opened_streams(&self) -> usize {
            self.opened_streams.load(AtomicOrdering::SeqCst)
        }

        fn gate_next_open(&self) -> (mpsc::Receiver<()>, mpsc::Sender<()>) {
            Self::arm_gate(&self.open_gate)
        }

        fn gate_next_delete(&self) -> (mpsc::Receiver<()>, mpsc::Sender<()>) {
            Self::arm_gate(&self.delete_gate)
        }

        fn arm_gate(slot: &StdMutex<Option<CallGate>>) -> (mpsc::Receiver<()>, mpsc::Sender<()>) {
            let (entered_tx, entered_rx) = mpsc::channel();
            let (proceed_tx, proceed_rx) = mpsc::channel();
            *slot.lock().unwrap() = Some(CallGate {
                entered_tx,
                proceed_rx,
            });
            (entered_rx, proceed_tx)
        }
    }

    impl ChatTransport for FakeTransport {
        fn list_conversations(&self) -> BoxFuture<'_, TransportResult<Vec<Conversation>>> {
            let result = if self.fail_listing.load(AtomicOrdering::SeqCst) {
                Err(TransportError::Network {
                    stage: "fake-list",
                    message: "connection refused".to_string(),
                })
            } else {
                Ok(self.conversations.lock().unwrap().clone())
            };
            Box::pin(async move { result })
        }

        fn create_conversation(&self) -> BoxFuture<'_, TransportResult<Conversation>> {
            let created = Conversation {
                id: ConversationId::new(format!(
                    "created-{}",
                    self.created.fetch_add(1, AtomicOrdering::SeqCst)
                )),
                title: "New Conversation".to_string(),
                turn_count: 0,
                updated_at: Utc::now(),
            };
            self.conversations.lock().unwrap().push(created.clone());
            Box::pin(async move { Ok(created) })
        }

        fn delete_conversation(
            &self,
            conversation_id: ConversationId,
        ) -> BoxFuture<'_, TransportResult<()>> {
            if let Some(gate) = self.delete_gate.lock().unwrap().take() {
                gate.pass();
            }
            let mut conversations = self.conversations.lock().unwrap();
            let result = match conversations
                .iter()
                .position(|conversation| conversation.id == conversation_id)
            {
                Some(index) => {
                    conversations.remove(index);
                    Ok(())
                }
                None => Err(TransportError::Status {
                    stage: "fake-delete",
                    status: 404,
                    body: "Conversation not found".to_string(),
                }),
            };
            Box::pin(async move { result })
        }

        fn load_messages(
            &self,
            conversation_id: ConversationId,
        ) -> BoxFuture<'_, TransportResult<Vec<Message>>> {
            let messages = self
                .histories
                .lock()
                .unwrap()
                .get(&conversation_id)
                .cloned()
                .unwrap_or_default();
            Box::pin(async move { Ok(messages) })
        }

        fn open_stream(
            &self,
            _conversation_id: ConversationId,
            _content: String,
            target: StreamTarget,
        ) -> TransportResult<StreamHandle> {
            if let Some(gate) = self.open_gate.lock().unwrap().take() {
                gate.pass();
            }
            self.opened_streams.fetch_add(1, AtomicOrdering::SeqCst);
            let steps = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| vec![ScriptStep::Complete]);
            let release = Arc::clone(&self.release);
            let worker_guard = DropFlag(Arc::clone(&self.worker_dropped));

            let (signal_tx, events, cancel_rx) = stream_channel(target);
            let worker = Box::pin(async move {
                let _worker_guard = worker_guard;
                let mut cancel_rx = cancel_rx;
                for step in steps {
                    match step {
                        ScriptStep::Chunk(text) => {
                            let _ = signal_tx.send(StreamSignal::Chunk(text.to_string()));
                        }
                        ScriptStep::Complete => {
                            let _ = signal_tx.send(StreamSignal::Completed { message_id: None });
                            return;
                        }
                        ScriptStep::Fail(message) => {
                            let _ = signal_tx.send(StreamSignal::Failed {
                                error: TransportError::Upstream {
                                    stage: "fake-stream",
                                    message: message.to_string(),
                                },
                            });
                            return;
                        }
                        ScriptStep::WaitForRelease => release.notified().await,
                        ScriptStep::HoldUntilCancelled => {
                            let _ = (&mut cancel_rx).await;
                            return;
                        }
                    }
                }
            });

            Ok(StreamHandle { events, worker })
        }
    }

    async fn engine_with_two_conversations() -> (ChatEngine<FakeTransport>, ConversationId) {
        let transport = FakeTransport::default();
        transport.seed_conversation("a", &["first", "reply", "follow-up"]);
        transport.seed_conversation("b", &[]);

        let engine = ChatEngine::new(transport);
        engine.load_conversations().await.expect("load");
        let id_a = ConversationId::new("a");
        engine.select_conversation(&id_a).await.expect("select a");
        (engine, id_a)
    }

    fn transport_of<'e>(engine: &'e ChatEngine<FakeTransport>) -> &'e FakeTransport {
        &engine.transport
    }

    async fn wait_for_event(
        receiver: &mut broadcast::Receiver<EngineEvent>,
        predicate: impl Fn(&EngineEvent) -> bool,
    ) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = receiver.recv().await.expect("event channel open");
                if predicate(&event) {
                    return;
                }
            }
        })
        .await
        .expect("timed out waiting for engine event");
    }

    #[tokio::test]
    async fn send_message_appends_user_turn_then_promotes_streamed_reply() {
        let (engine, _id_a) = engine_with_two_conversations().await;
        transport_of(&engine).script_stream(vec![
            ScriptStep::Chunk("Hi"),
            ScriptStep::Chunk(" there"),
            ScriptStep::WaitForRelease,
            ScriptStep::Complete,
        ]);

        let mut events = engine.subscribe();
        engine.send_message("hello").await.expect("send");

        // Promotion is gated on the release, so only the optimistic user
        // turn is visible here.
        let after_send = engine.state();
        assert_eq!(after_send.timeline.len(), 4);
        let user_turn = after_send.timeline.last().expect("user turn");
        assert_eq!(user_turn.role, Role::User);
        assert_eq!(user_turn.content, "hello");
        assert_eq!(user_turn.turn_number, 4);

        transport_of(&engine).release();
        wait_for_event(&mut events, |event| {
            matches!(event, EngineEvent::DraftCompleted(_))
        })
        .await;

        let state = engine.state();
        assert_eq!(state.timeline.len(), 5);
        let reply = state.timeline.last().expect("assistant turn");
        assert_eq!(reply.role, Role::Assistant);
        assert_eq!(reply.content, "Hi there");
        assert_eq!(reply.turn_number, 5);
        assert!(state.draft.is_none());
        assert_eq!(
            state.current_conversation.as_ref().expect("current").turn_count,
            5
        );
    }

    #[tokio::test]
    async fn blank_input_fails_validation_without_touching_the_transport() {
        let (engine, _id_a) = engine_with_two_conversations().await;
        let before = engine.state().timeline.len();

        for input in ["", "   ", "\n\t "] {
            let error = engine.send_message(input).await.expect_err("blank input");
            assert!(matches!(error, EngineError::Validation { .. }));
        }

        assert_eq!(engine.state().timeline.len(), before);
        assert_eq!(transport_of(&engine).opened_streams(), 0);
    }

    #[tokio::test]
    async fn send_without_a_selected_conversation_is_an_invalid_state() {
        let transport = FakeTransport::default();
        let engine = ChatEngine::new(transport);
        engine.load_conversations().await.expect("load");

        let error = engine.send_message("hello").await.expect_err("no current");
        assert!(matches!(error, EngineError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn second_send_while_streaming_is_rejected_and_opens_no_channel() {
        let (engine, _id_a) = engine_with_two_conversations().await;
        transport_of(&engine)
            .script_stream(vec![ScriptStep::Chunk("Hi"), ScriptStep::HoldUntilCancelled]);

        let mut events = engine.subscribe();
        engine.send_message("hello").await.expect("first send");
        wait_for_event(&mut events, |event| {
            matches!(event, EngineEvent::DraftDelta { .. })
        })
        .await;

        let error = engine
            .send_message("one more")
            .await
            .expect_err("second send");
        assert!(matches!(error, EngineError::ConcurrentStream { .. }));
        assert_eq!(transport_of(&engine).opened_streams(), 1);

        engine.cancel_stream().await.expect("cleanup");
    }

    #[tokio::test]
    async fn cancel_discards_the_draft_and_returns_to_idle() {
        let (engine, _id_a) = engine_with_two_conversations().await;
        transport_of(&engine).script_stream(vec![
            ScriptStep::Chunk("partial output"),
            ScriptStep::HoldUntilCancelled,
        ]);

        let mut events = engine.subscribe();
        engine.send_message("hello").await.expect("send");
        wait_for_event(&mut events, |event| {
            matches!(event, EngineEvent::DraftDelta { .. })
        })
        .await;

        engine.cancel_stream().await.expect("cancel");

        let state = engine.state();
        assert!(state.draft.is_none());
        // The optimistic user turn stays; no assistant message was created.
        assert_eq!(state.timeline.len(), 4);
        assert_eq!(state.timeline.last().expect("last").role, Role::User);

        // Cancelling again is a no-op, not an error.
        engine.cancel_stream().await.expect("idempotent cancel");

        // The engine is idle again: a fresh send is accepted.
        transport_of(&engine).script_stream(vec![ScriptStep::Complete]);
        engine.send_message("again").await.expect("fresh send");
    }

    #[tokio::test]
    async fn stream_failure_discards_partial_output_and_sets_last_error() {
        let (engine, _id_a) = engine_with_two_conversations().await;
        transport_of(&engine).script_stream(vec![
            ScriptStep::Chunk("gar"),
            ScriptStep::Fail("model unavailable"),
        ]);

        let mut events = engine.subscribe();
        engine.send_message("hello").await.expect("send");
        wait_for_event(&mut events, |event| {
            matches!(event, EngineEvent::DraftFailed(_))
        })
        .await;

        let state = engine.state();
        assert!(state.draft.is_none());
        assert_eq!(state.timeline.len(), 4, "no assistant message persisted");
        let last_error = state.last_error.as_deref().expect("last_error set");
        assert!(last_error.contains("model unavailable"));
    }

    #[tokio::test]
    async fn deleting_the_selected_conversation_clears_state_and_cancels_its_draft() {
        let (engine, id_a) = engine_with_two_conversations().await;
        transport_of(&engine)
            .script_stream(vec![ScriptStep::Chunk("Hi"), ScriptStep::HoldUntilCancelled]);

        let mut events = engine.subscribe();
        engine.send_message("hello").await.expect("send");
        wait_for_event(&mut events, |event| {
            matches!(event, EngineEvent::DraftDelta { .. })
        })
        .await;

        engine.delete_conversation(&id_a).await.expect("delete");
        wait_for_event(&mut events, |event| {
            matches!(event, EngineEvent::ConversationDeleted(id) if *id == id_a)
        })
        .await;

        let state = engine.state();
        assert!(state.current_conversation.is_none());
        assert!(state.timeline.is_empty());
        assert!(state.draft.is_none());
        assert!(
            state
                .conversations
                .iter()
                .all(|conversation| conversation.id != id_a)
        );
    }

    #[tokio::test]
    async fn deleting_an_unknown_conversation_fails_with_not_found() {
        let (engine, _id_a) = engine_with_two_conversations().await;
        let ghost = ConversationId::new("ghost");

        let error = engine
            .delete_conversation(&ghost)
            .await
            .expect_err("unknown id");
        assert!(matches!(error, EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn switching_away_keeps_the_stream_alive_and_promotes_in_the_background() {
        let (engine, id_a) = engine_with_two_conversations().await;
        transport_of(&engine).script_stream(vec![
            ScriptStep::Chunk("Hi"),
            ScriptStep::Chunk(" there"),
            ScriptStep::WaitForRelease,
            ScriptStep::Complete,
        ]);

        let mut events = engine.subscribe();
        engine.send_message("hello").await.expect("send");
        wait_for_event(&mut events, |event| {
            matches!(event, EngineEvent::DraftDelta { accumulated_len, .. } if *accumulated_len == "Hi there".len())
        })
        .await;

        let id_b = ConversationId::new("b");
        engine.select_conversation(&id_b).await.expect("select b");

        let state = engine.state();
        // The foreign draft keeps streaming but is not displayed.
        let draft = state.draft.as_ref().expect("draft still present");
        assert_eq!(draft.conversation_id, id_a);
        assert!(state.visible_draft().is_none());
        assert!(state.timeline.is_empty(), "timeline belongs to b");

        transport_of(&engine).release();
        wait_for_event(&mut events, |event| {
            matches!(event, EngineEvent::DraftCompleted(_))
        })
        .await;

        let state = engine.state();
        assert!(state.draft.is_none());
        assert!(state.timeline.is_empty(), "b's timeline is untouched");
        let conversation_a = state
            .conversations
            .iter()
            .find(|conversation| conversation.id == id_a)
            .expect("a still listed");
        // User turn 4 plus the background-promoted assistant turn 5.
        assert_eq!(conversation_a.turn_count, 5);
    }

    #[tokio::test]
    async fn failed_listing_keeps_prior_conversations_and_reports_the_cause() {
        let (engine, _id_a) = engine_with_two_conversations().await;
        let before = engine.state();
        assert_eq!(before.conversations.len(), 2);

        transport_of(&engine)
            .fail_listing
            .store(true, AtomicOrdering::SeqCst);
        let error = engine
            .load_conversations()
            .await
            .expect_err("listing fails");
        assert!(matches!(error, EngineError::Transport { .. }));

        let state = engine.state();
        assert_eq!(state.conversations.len(), 2, "prior list intact");
        assert!(!state.is_busy);
        assert!(state.last_error.is_some());
    }

    #[tokio::test]
    async fn creating_a_conversation_selects_it_and_clears_the_timeline() {
        let (engine, _id_a) = engine_with_two_conversations().await;
        assert_eq!(engine.state().timeline.len(), 3);

        let created = engine.create_conversation().await.expect("create");

        let state = engine.state();
        assert_eq!(state.conversations[0].id, created.id);
        assert_eq!(
            state.current_conversation.as_ref().expect("current").id,
            created.id
        );
        assert!(state.timeline.is_empty());
        assert!(state.draft.is_none());
    }

    #[tokio::test]
    async fn selecting_an_unknown_conversation_fails_with_not_found() {
        let (engine, id_a) = engine_with_two_conversations().await;

        let error = engine
            .select_conversation(&ConversationId::new("ghost"))
            .await
            .expect_err("unknown id");
        assert!(matches!(error, EngineError::NotFound { .. }));
        // The previous selection is untouched.
        assert_eq!(
            engine.state().current_conversation.as_ref().expect("current").id,
            id_a
        );
    }

    #[tokio::test]
    async fn timeline_and_draft_updates_are_individually_observable() {
        let (engine, _id_a) = engine_with_two_conversations().await;
        transport_of(&engine).script_stream(vec![
            ScriptStep::Chunk("Hi"),
            ScriptStep::Chunk(" there"),
            ScriptStep::Complete,
        ]);

        let mut events = engine.subscribe();
        engine.send_message("hello").await.expect("send");

        let mut appended = 0;
        let mut deltas = 0;
        let done = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match events.recv().await.expect("event channel open") {
                    EngineEvent::MessageAppended { .. } => appended += 1,
                    EngineEvent::DraftDelta { .. } => deltas += 1,
                    EngineEvent::DraftCompleted(_) => return,
                    _ => {}
                }
            }
        })
        .await;
        done.expect("stream finished");

        // One user append, one promoted assistant append, one event per chunk.
        assert_eq!(appended, 2);
        assert_eq!(deltas, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_while_the_channel_is_opening_still_tears_down_the_worker() {
        let (engine, _id_a) = engine_with_two_conversations().await;
        let engine = Arc::new(engine);
        transport_of(&engine).script_stream(vec![ScriptStep::HoldUntilCancelled]);
        let (entered_rx, proceed_tx) = transport_of(&engine).gate_next_open();

        let sender = Arc::clone(&engine);
        let send_task = tokio::spawn(async move { sender.send_message("hello").await });

        // Hold the transport call open and cancel in the window before the
        // stream tasks are registered with the core.
        tokio::task::spawn_blocking(move || entered_rx.recv())
            .await
            .expect("join entered wait")
            .expect("open_stream entered");
        engine.cancel_stream().await.expect("cancel");
        assert!(engine.state().draft.is_none());

        proceed_tx.send(()).expect("release open_stream");
        send_task.await.expect("join send").expect("send");

        // The freshly spawned worker must be dropped rather than left
        // parked on a cancel signal that will never fire.
        let dropped = Arc::clone(&transport_of(&engine).worker_dropped);
        tokio::time::timeout(Duration::from_secs(2), async move {
            while !dropped.load(AtomicOrdering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("worker torn down after late registration");

        // Back to idle: a fresh send opens a new channel and completes.
        transport_of(&engine).script_stream(vec![ScriptStep::Complete]);
        let mut events = engine.subscribe();
        engine.send_message("again").await.expect("second send");
        wait_for_event(&mut events, |event| {
            matches!(event, EngineEvent::DraftCompleted(_))
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delete_succeeds_even_when_the_conversation_vanished_locally_mid_flight() {
        let (engine, id_a) = engine_with_two_conversations().await;
        let engine = Arc::new(engine);
        let (entered_rx, proceed_tx) = transport_of(&engine).gate_next_delete();

        let deleter = Arc::clone(&engine);
        let delete_id = id_a.clone();
        let delete_task = tokio::spawn(async move { deleter.delete_conversation(&delete_id).await });

        tokio::task::spawn_blocking(move || entered_rx.recv())
            .await
            .expect("join entered wait")
            .expect("delete entered");

        // While the server delete is held open, a refresh drops the
        // conversation from the local list.
        transport_of(&engine)
            .conversations
            .lock()
            .unwrap()
            .retain(|conversation| conversation.id != id_a);
        engine.load_conversations().await.expect("refresh");
        assert!(engine.state().current_conversation.is_none());

        // Restore the row so the held server delete still finds it.
        transport_of(&engine).seed_conversation("a", &[]);

        let mut events = engine.subscribe();
        proceed_tx.send(()).expect("release delete");
        delete_task.await.expect("join delete").expect("delete");

        wait_for_event(&mut events, |event| {
            matches!(event, EngineEvent::ConversationDeleted(id) if *id == id_a)
        })
        .await;
        let state = engine.state();
        assert!(
            state
                .conversations
                .iter()
                .all(|conversation| conversation.id != id_a)
        );
        assert!(state.current_conversation.is_none());
    }
}
