use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The three cursor fields a conversation carries for classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationCursor {
    pub conversation_id: Uuid,
    pub workspace_id: Uuid,
    #[serde(default)]
    pub last_inbound_message_id: Option<Uuid>,
    #[serde(default)]
    pub last_classified_message_id: Option<Uuid>,
    #[serde(default)]
    pub last_classify_enqueued_message_id: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifySkip {
    NoInboundMessage,
    CaughtUp,
    AlreadyEnqueued,
}

impl ConversationCursor {
    pub fn is_caught_up(&self) -> bool {
        self.last_inbound_message_id.is_some()
            && self.last_inbound_message_id == self.last_classified_message_id
    }

    /// Returns the message a classify job is owed for, or why none is owed.
    ///
    /// A job is owed only when the inbound cursor is ahead of both the
    /// classified cursor and the enqueued cursor.
    pub fn owed_classification(&self) -> Result<Uuid, ClassifySkip> {
        let Some(target) = self.last_inbound_message_id else {
            return Err(ClassifySkip::NoInboundMessage);
        };
        if self.last_classified_message_id == Some(target) {
            return Err(ClassifySkip::CaughtUp);
        }
        if self.last_classify_enqueued_message_id == Some(target) {
            return Err(ClassifySkip::AlreadyEnqueued);
        }
        Ok(target)
    }
}
