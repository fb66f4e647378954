use chrono::{DateTime, Utc};
use mnemo_protocol::{Conversation, ConversationId};

use crate::error::{EngineResult, NotFoundSnafu};

/// The signed-in user's conversations plus the current selection.
///
/// Selection is the only place a "current conversation" exists, so the
/// dangling-reference invariant is enforced entirely here.
#[derive(Debug, Default)]
pub struct ConversationStore {
    conversations: Vec<Conversation>,
    current: Option<ConversationId>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn current_id(&self) -> Option<&ConversationId> {
        self.current.as_ref()
    }

    pub fn current(&self) -> Option<&Conversation> {
        let current = self.current.as_ref()?;
        self.get(current)
    }

    pub fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations
            .iter()
            .find(|conversation| conversation.id == *id)
    }

    pub fn contains(&self, id: &ConversationId) -> bool {
        self.get(id).is_some()
    }

    /// Replaces the known set with the server's listing (already ordered by
    /// recency). A selection that no longer exists is dropped so the current
    /// conversation never dangles.
    ///
    /// Returns true when the replacement invalidated the selection.
    pub fn replace_all(&mut self, conversations: Vec<Conversation>) -> bool {
        self.conversations = conversations;

        let selection_lost = self
            .current
            .as_ref()
            .is_some_and(|current| !self.contains_id(current));
        if selection_lost {
            self.current = None;
        }
        selection_lost
    }

    /// Inserts a freshly created conversation at the head and selects it.
    pub fn insert_created(&mut self, conversation: Conversation) {
        self.current = Some(conversation.id.clone());
        self.conversations.insert(0, conversation);
    }

    pub fn select(&mut self, id: &ConversationId) -> EngineResult<&Conversation> {
        let index = self
            .conversations
            .iter()
            .position(|conversation| conversation.id == *id)
            .ok_or_else(|| {
                NotFoundSnafu {
                    stage: "conversation-select",
                    conversation_id: id.clone(),
                }
                .build()
            })?;

        self.current = Some(id.clone());
        Ok(&self.conversations[index])
    }

    /// Removes a conversation. Returns true when it was the current one,
    /// in which case the selection has been cleared.
    pub fn remove(&mut self, id: &ConversationId) -> EngineResult<bool> {
        let index = self
            .conversations
            .iter()
            .position(|conversation| conversation.id == *id)
            .ok_or_else(|| {
                NotFoundSnafu {
                    stage: "conversation-remove",
                    conversation_id: id.clone(),
                }
                .build()
            })?;

        self.conversations.remove(index);
        let was_current = self.current.as_ref() == Some(id);
        if was_current {
            self.current = None;
        }
        Ok(was_current)
    }

    /// Records a newly appended turn: turn counts grow monotonically and the
    /// conversation's recency timestamp moves forward.
    pub fn note_turn(&mut self, id: &ConversationId, turn_number: u32, at: DateTime<Utc>) {
        if let Some(conversation) = self
            .conversations
            .iter_mut()
            .find(|conversation| conversation.id == *id)
        {
            conversation.turn_count = conversation.turn_count.max(turn_number);
            conversation.updated_at = at;
        }
    }

    fn contains_id(&self, id: &ConversationId) -> bool {
        self.conversations
            .iter()
            .any(|conversation| conversation.id == *id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    fn conversation(raw: &str, turn_count: u32) -> Conversation {
        Conversation {
            id: ConversationId::new(raw),
            title: format!("Conversation {raw}"),
            turn_count,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn selection_always_points_inside_the_known_set() {
        let mut store = ConversationStore::new();
        store.replace_all(vec![conversation("a", 3), conversation("b", 0)]);

        store.select(&ConversationId::new("a")).expect("select a");
        assert_eq!(store.current().expect("current").id.as_str(), "a");

        let missing = ConversationId::new("ghost");
        let error = store.select(&missing).expect_err("unknown id");
        assert!(matches!(error, EngineError::NotFound { .. }));
        // A failed select leaves the previous selection intact.
        assert_eq!(store.current_id(), Some(&ConversationId::new("a")));
    }

    #[test]
    fn replacing_the_set_drops_a_vanished_selection() {
        let mut store = ConversationStore::new();
        store.replace_all(vec![conversation("a", 1)]);
        store.select(&ConversationId::new("a")).expect("select");

        let selection_lost = store.replace_all(vec![conversation("b", 0)]);
        assert!(selection_lost);
        assert_eq!(store.current_id(), None);
    }

    #[test]
    fn removing_the_current_conversation_clears_the_selection() {
        let mut store = ConversationStore::new();
        store.replace_all(vec![conversation("a", 1), conversation("b", 2)]);
        store.select(&ConversationId::new("b")).expect("select");

        let was_current = store.remove(&ConversationId::new("b")).expect("remove");
        assert!(was_current);
        assert_eq!(store.current_id(), None);
        assert_eq!(store.conversations().len(), 1);

        let error = store
            .remove(&ConversationId::new("b"))
            .expect_err("second remove");
        assert!(matches!(error, EngineError::NotFound { .. }));
    }

    #[test]
    fn created_conversations_land_at_the_head_and_become_current() {
        let mut store = ConversationStore::new();
        store.replace_all(vec![conversation("old", 5)]);

        store.insert_created(conversation("fresh", 0));
        assert_eq!(store.conversations()[0].id.as_str(), "fresh");
        assert_eq!(store.current().expect("current").id.as_str(), "fresh");
    }

    #[test]
    fn note_turn_is_monotonic() {
        let mut store = ConversationStore::new();
        store.replace_all(vec![conversation("a", 4)]);
        let id = ConversationId::new("a");

        store.note_turn(&id, 2, Utc::now());
        assert_eq!(store.get(&id).expect("a").turn_count, 4);

        store.note_turn(&id, 6, Utc::now());
        assert_eq!(store.get(&id).expect("a").turn_count, 6);
    }
}
