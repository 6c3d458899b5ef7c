//! Types shared by every Lingua crate: the canonical chat domain records,
//! the REST envelope and request bodies, and the outbound compose payload.

pub mod api;
pub mod events;
pub mod models;

pub use models::{
    Attachment, ConversationId, ConversationKind, CorrelationToken, Delivery, Message, MessageId,
    MessageType, UserId, UserSummary,
};
