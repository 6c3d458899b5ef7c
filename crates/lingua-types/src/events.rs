use serde::{Deserialize, Serialize};

use crate::models::{ConversationId, CorrelationToken, MessageType};

/// Destination every compose action is published to.
pub const COMPOSE_DESTINATION: &str = "/app/chat";

/// Per-user queue carrying messages for conversations the client may not be
/// subscribed to individually.
pub const PERSONAL_QUEUE: &str = "/user/queue/messages";

const TOPIC_PREFIX: &str = "/topic/";

/// Topic carrying live events for one conversation.
pub fn conversation_topic(id: &ConversationId) -> String {
    format!("{}{}", TOPIC_PREFIX, id)
}

/// Inverse of [`conversation_topic`]. Returns `None` for any other destination.
pub fn topic_conversation(topic: &str) -> Option<ConversationId> {
    topic
        .strip_prefix(TOPIC_PREFIX)
        .filter(|rest| !rest.is_empty())
        .map(ConversationId::new)
}

/// Payload published to [`COMPOSE_DESTINATION`] when the user sends a message.
/// For attachment kinds `message_text` carries the uploaded media url.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComposeAction {
    pub conversation_id: ConversationId,
    pub message_text: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Echoed back by servers that support it; older servers ignore it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationToken>,
}
