use mnemo_protocol::{ConversationId, Message};

use crate::error::{EngineResult, OrderingSnafu};

/// Ordered, persisted history of the currently selected conversation.
///
/// Owns its messages exclusively; the only mutations are a wholesale replace
/// on selection and strictly-ordered appends.
#[derive(Debug, Default)]
pub struct MessageTimeline {
    conversation_id: Option<ConversationId>,
    messages: Vec<Message>,
}

impl MessageTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.conversation_id.as_ref()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Highest turn number currently held; zero for an empty timeline.
    pub fn max_turn(&self) -> u32 {
        self.messages
            .iter()
            .map(|message| message.turn_number)
            .max()
            .unwrap_or(0)
    }

    /// Replaces the whole timeline with `conversation_id`'s history.
    /// Stable sort keeps arrival order for equal turn numbers.
    pub fn replace(&mut self, conversation_id: ConversationId, mut messages: Vec<Message>) {
        messages.sort_by_key(|message| message.turn_number);
        self.conversation_id = Some(conversation_id);
        self.messages = messages;
    }

    pub fn clear(&mut self) {
        self.conversation_id = None;
        self.messages.clear();
    }

    /// Appends one message, rejecting duplicate or out-of-order delivery.
    /// On rejection the timeline is left unchanged.
    pub fn append(&mut self, message: Message) -> EngineResult<()> {
        let current_max = self.max_turn();
        if !self.is_empty() && message.turn_number <= current_max {
            return OrderingSnafu {
                stage: "timeline-append",
                attempted: message.turn_number,
                current_max,
            }
            .fail();
        }

        self.messages.push(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mnemo_protocol::{MessageId, Role};

    use crate::error::EngineError;

    fn message(turn: u32, content: &str) -> Message {
        Message {
            id: MessageId::local(),
            conversation_id: ConversationId::new("c1"),
            role: if turn % 2 == 1 {
                Role::User
            } else {
                Role::Assistant
            },
            content: content.to_string(),
            turn_number: turn,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn appends_keep_turn_numbers_strictly_increasing() {
        let mut timeline = MessageTimeline::new();
        timeline.replace(ConversationId::new("c1"), vec![message(1, "a")]);

        timeline.append(message(2, "b")).expect("turn 2");
        timeline.append(message(5, "c")).expect("gaps are fine");

        let turns: Vec<u32> = timeline
            .messages()
            .iter()
            .map(|message| message.turn_number)
            .collect();
        assert_eq!(turns, vec![1, 2, 5]);
    }

    #[test]
    fn duplicate_or_stale_turns_are_rejected_and_leave_the_timeline_unchanged() {
        let mut timeline = MessageTimeline::new();
        timeline.replace(
            ConversationId::new("c1"),
            vec![message(1, "a"), message(2, "b")],
        );

        for stale_turn in [1, 2] {
            let error = timeline
                .append(message(stale_turn, "redelivered"))
                .expect_err("stale turn must fail");
            assert!(matches!(
                error,
                EngineError::Ordering {
                    attempted,
                    current_max: 2,
                    ..
                } if attempted == stale_turn
            ));
        }

        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline.max_turn(), 2);
    }

    #[test]
    fn replace_sorts_history_and_clear_resets_ownership() {
        let mut timeline = MessageTimeline::new();
        timeline.replace(
            ConversationId::new("c9"),
            vec![message(3, "late"), message(1, "early"), message(2, "mid")],
        );

        assert_eq!(
            timeline.conversation_id(),
            Some(&ConversationId::new("c9"))
        );
        assert_eq!(timeline.max_turn(), 3);
        assert_eq!(timeline.messages()[0].content, "early");

        timeline.clear();
        assert!(timeline.is_empty());
        assert_eq!(timeline.conversation_id(), None);
        assert_eq!(timeline.max_turn(), 0);
    }
}
