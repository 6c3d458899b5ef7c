use serde_json::Value;

use lingua_types::ConversationId;

use crate::client::{ApiClient, page_items};
use crate::error::ApiError;

impl ApiClient {
    /// `GET /chat/message/{id}?page&size`. Raw records, newest first.
    pub async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        page: u32,
        size: u32,
    ) -> Result<Vec<Value>, ApiError> {
        let url = self.endpoint(&["chat", "message", conversation_id.as_str()])?;
        let req = self.http.get(url).query(&[("page", page), ("size", size)]);
        Ok(page_items(self.send(req).await?))
    }
}
