//! Client-side conversation sync: normalizes every wire shape into one
//! message record, merges history pages, live pushes and optimistic sends
//! into an ordered deduplicated store, and routes channel subscriptions.

pub mod config;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod normalize;
pub mod router;
pub mod store;

pub use config::{PreviewLabels, SyncConfig};
pub use cursor::{PageCursor, PageTicket};
pub use engine::{Action, EngineEvent, SendReceipt, SyncEngine, Update};
pub use error::SyncError;
pub use normalize::{ConversationSummary, Draft, MessageUpdate, NormalizeError};
pub use router::{SubscriptionDelta, SubscriptionRouter};
pub use store::{Conversation, ConversationStore, HistoryDirection, HistoryOutcome, LiveOutcome, Placement};
