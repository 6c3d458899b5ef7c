use std::time::Duration;

use lingua_types::MessageType;

/// List-preview placeholders for attachment messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewLabels {
    pub image: String,
    pub video: String,
    pub audio: String,
    pub file: String,
}

impl Default for PreviewLabels {
    fn default() -> Self {
        Self {
            image: "[Image]".to_string(),
            video: "[Video]".to_string(),
            audio: "[Audio]".to_string(),
            file: "[File]".to_string(),
        }
    }
}

impl PreviewLabels {
    pub fn label(&self, kind: MessageType) -> Option<&str> {
        match kind {
            MessageType::Text => None,
            MessageType::Image => Some(&self.image),
            MessageType::Video => Some(&self.video),
            MessageType::Audio => Some(&self.audio),
            MessageType::File => Some(&self.file),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub conversation_page_size: u32,
    pub message_page_size: u32,
    /// How many of the most recently active conversations keep a live
    /// subscription while not open.
    pub recent_limit: usize,
    /// How long after an optimistic send an uncorrelated echo may still be
    /// paired with it. Sends still unechoed after this are marked failed.
    pub echo_window: Duration,
    pub labels: PreviewLabels,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            conversation_page_size: 20,
            message_page_size: 20,
            recent_limit: 5,
            echo_window: Duration::from_secs(10),
            labels: PreviewLabels::default(),
        }
    }
}
