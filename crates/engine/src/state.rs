use mnemo_protocol::{Conversation, ConversationId, Message, MessageId, StreamingDraft};

use crate::session::StreamTarget;

/// Immutable aggregate the view layer renders from.
///
/// Published as a fresh `Arc` snapshot after every mutation, so observers
/// never see a half-updated aggregate.
#[derive(Debug, Clone, Default)]
pub struct EngineState {
    pub conversations: Vec<Conversation>,
    pub current_conversation: Option<Conversation>,
    pub timeline: Vec<Message>,
    pub draft: Option<StreamingDraft>,
    pub is_busy: bool,
    pub last_error: Option<String>,
}

impl EngineState {
    /// The draft as the chat screen shows it: only when it belongs to the
    /// current conversation. A background stream for a switched-away
    /// conversation stays in `draft` but is not displayed.
    pub fn visible_draft(&self) -> Option<&StreamingDraft> {
        let draft = self.draft.as_ref()?;
        let current = self.current_conversation.as_ref()?;
        (draft.conversation_id == current.id).then_some(draft)
    }
}

/// Granular change notifications.
///
/// Timeline growth and draft text growth are separate events so a view can
/// sample its scroll position before applying each kind of update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    ConversationsReplaced,
    ConversationCreated(ConversationId),
    ConversationDeleted(ConversationId),
    ConversationSelected(Option<ConversationId>),
    TimelineReplaced(ConversationId),
    MessageAppended {
        conversation_id: ConversationId,
        message_id: MessageId,
        turn_number: u32,
    },
    DraftStarted(StreamTarget),
    DraftDelta {
        target: StreamTarget,
        accumulated_len: usize,
    },
    DraftCompleted(StreamTarget),
    DraftCancelled(StreamTarget),
    DraftFailed(StreamTarget),
    BusyChanged(bool),
    ErrorChanged,
}
