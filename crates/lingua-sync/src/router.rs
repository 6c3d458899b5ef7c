use std::collections::BTreeSet;

use lingua_types::events::{conversation_topic, topic_conversation};
use lingua_types::ConversationId;

/// Topics to add and drop to move the channel from its active set to the
/// desired one.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubscriptionDelta {
    pub subscribe: Vec<String>,
    pub unsubscribe: Vec<String>,
}

impl SubscriptionDelta {
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }
}

/// Decides which conversation topics stay subscribed: the open conversation
/// plus the `recent_limit` most recently active ones.
#[derive(Debug, Clone)]
pub struct SubscriptionRouter {
    recent_limit: usize,
}

impl SubscriptionRouter {
    pub fn new(recent_limit: usize) -> Self {
        Self { recent_limit }
    }

    pub fn desired(&self, order: &[ConversationId], open: Option<&ConversationId>) -> BTreeSet<String> {
        order
            .iter()
            .take(self.recent_limit)
            .chain(open)
            .map(conversation_topic)
            .collect()
    }

    /// Only conversation topics in `active` are considered; other
    /// destinations (the personal queue) are never touched.
    pub fn plan(&self, desired: &BTreeSet<String>, active: &[String]) -> SubscriptionDelta {
        let active: BTreeSet<&str> = active
            .iter()
            .map(String::as_str)
            .filter(|topic| topic_conversation(topic).is_some())
            .collect();

        SubscriptionDelta {
            subscribe: desired
                .iter()
                .filter(|topic| !active.contains(topic.as_str()))
                .cloned()
                .collect(),
            unsubscribe: active
                .iter()
                .filter(|topic| !desired.contains(**topic))
                .map(|topic| topic.to_string())
                .collect(),
        }
    }
}
