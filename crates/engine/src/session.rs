use mnemo_protocol::{ConversationId, DraftStatus, StreamingDraft};

use crate::error::{ConcurrentStreamSnafu, EngineResult};

/// Identifier for one streaming generation session.
///
/// Allocated monotonically per engine so stale stream events can always be
/// rejected, even when a new stream starts for the same conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamSessionId(pub u64);

/// Stream routing key used for stale-event rejection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamTarget {
    pub conversation_id: ConversationId,
    pub session_id: StreamSessionId,
}

impl StreamTarget {
    pub fn new(conversation_id: ConversationId, session_id: StreamSessionId) -> Self {
        Self {
            conversation_id,
            session_id,
        }
    }
}

/// The single in-flight assistant response: `idle → active → terminal → idle`.
///
/// Terminal transitions consume the draft and return it with its final
/// status; the machine itself always lands back on idle, so "idle" and
/// "no draft held here" are the same observation.
#[derive(Debug, Default)]
pub struct StreamingSession {
    next_session_id: u64,
    active: Option<ActiveSession>,
}

#[derive(Debug)]
struct ActiveSession {
    target: StreamTarget,
    draft: StreamingDraft,
}

impl StreamingSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_target(&self) -> Option<&StreamTarget> {
        self.active.as_ref().map(|session| &session.target)
    }

    pub fn draft(&self) -> Option<&StreamingDraft> {
        self.active.as_ref().map(|session| &session.draft)
    }

    /// Opens a session for `conversation_id`. At most one stream exists per
    /// engine; a second `begin` fails with `ConcurrentStreamError`.
    pub fn begin(&mut self, conversation_id: ConversationId) -> EngineResult<StreamTarget> {
        if let Some(active) = &self.active {
            return ConcurrentStreamSnafu {
                stage: "session-begin",
                conversation_id: active.target.conversation_id.clone(),
            }
            .fail();
        }

        self.next_session_id += 1;
        let target = StreamTarget::new(
            conversation_id.clone(),
            StreamSessionId(self.next_session_id),
        );
        self.active = Some(ActiveSession {
            target: target.clone(),
            draft: StreamingDraft::begin(conversation_id),
        });
        Ok(target)
    }

    /// Returns true when `target` names the currently active session.
    pub fn accepts(&self, target: &StreamTarget) -> bool {
        self.active
            .as_ref()
            .is_some_and(|session| session.target == *target)
    }

    /// Appends one chunk to the active draft. Stale targets are ignored and
    /// reported as `None`.
    pub fn push_chunk(&mut self, target: &StreamTarget, delta: &str) -> Option<usize> {
        let session = self.active.as_mut()?;
        if session.target != *target {
            return None;
        }

        session.draft.accumulated_text.push_str(delta);
        Some(session.draft.accumulated_text.len())
    }

    /// End-of-stream: consumes and returns the completed draft for promotion.
    pub fn complete(&mut self, target: &StreamTarget) -> Option<StreamingDraft> {
        self.finish_matching(target, DraftStatus::Completed)
    }

    /// Transport error or timeout: the partial text is handed back solely so
    /// callers can log it; it must never be promoted.
    pub fn fail(&mut self, target: &StreamTarget) -> Option<StreamingDraft> {
        self.finish_matching(target, DraftStatus::Failed)
    }

    /// Explicit abort. Idempotent: cancelling with no active session is a
    /// no-op, not an error.
    pub fn cancel(&mut self) -> Option<StreamingDraft> {
        self.active.take().map(|mut session| {
            session.draft.status = DraftStatus::Cancelled;
            session.draft
        })
    }

    /// Cancels only when the active session belongs to `conversation_id`.
    pub fn cancel_for_conversation(
        &mut self,
        conversation_id: &ConversationId,
    ) -> Option<StreamingDraft> {
        if self
            .active
            .as_ref()
            .is_some_and(|session| session.target.conversation_id == *conversation_id)
        {
            self.cancel()
        } else {
            None
        }
    }

    fn finish_matching(
        &mut self,
        target: &StreamTarget,
        status: DraftStatus,
    ) -> Option<StreamingDraft> {
        if !self.accepts(target) {
            return None;
        }

        self.active.take().map(|mut session| {
            session.draft.status = status;
            session.draft
        })
    }
}
