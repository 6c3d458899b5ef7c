use thiserror::Error;

use lingua_types::ConversationId;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("unknown conversation {0}")]
    UnknownConversation(ConversationId),
    #[error("draft is empty")]
    EmptyDraft,
}
