use reqwest::header::CONTENT_TYPE;
use serde_json::Value;

use lingua_types::api::{AddMembersRequest, CreateDirectRequest, CreateGroupRequest};
use lingua_types::{ConversationId, UserId};

use crate::client::{ApiClient, page_items};
use crate::error::ApiError;

impl ApiClient {
    /// `GET /chat/message/list?page&size`: conversation summaries, most
    /// recently active first.
    pub async fn list_conversations(&self, page: u32, size: u32) -> Result<Vec<Value>, ApiError> {
        let url = self.endpoint(&["chat", "message", "list"])?;
        let req = self.http.get(url).query(&[("page", page), ("size", size)]);
        Ok(page_items(self.send(req).await?))
    }

    pub async fn create_direct(&self, to_user_id: &UserId) -> Result<Value, ApiError> {
        let url = self.endpoint(&["chat", "conversation"])?;
        let body = CreateDirectRequest {
            to_user_id: to_user_id.clone(),
        };
        self.send_required(self.http.post(url).json(&body)).await
    }

    pub async fn create_group(
        &self,
        name: &str,
        members: &[UserId],
        locale: Option<&str>,
    ) -> Result<Value, ApiError> {
        let url = self.endpoint(&["chat", "conversation", "group"])?;
        let body = CreateGroupRequest {
            user_ids: members.to_vec(),
            conversation_name: name.to_string(),
            locale: locale.map(str::to_owned),
        };
        self.send_required(self.http.post(url).json(&body)).await
    }

    /// `PUT /chat/{id}/name` with a plain-text body. Returns the updated
    /// summary, or `Null` when the server sends none.
    pub async fn rename(&self, conversation_id: &ConversationId, name: &str) -> Result<Value, ApiError> {
        let url = self.endpoint(&["chat", conversation_id.as_str(), "name"])?;
        let req = self
            .http
            .put(url)
            .header(CONTENT_TYPE, "text/plain")
            .body(name.to_string());
        Ok(self.send(req).await?.unwrap_or_default())
    }

    pub async fn set_locale(&self, conversation_id: &ConversationId, locale: &str) -> Result<Value, ApiError> {
        let url = self.endpoint(&["chat", conversation_id.as_str(), "locale"])?;
        let req = self
            .http
            .put(url)
            .header(CONTENT_TYPE, "text/plain")
            .body(locale.to_string());
        Ok(self.send(req).await?.unwrap_or_default())
    }

    pub async fn add_members(&self, conversation_id: &ConversationId, members: &[UserId]) -> Result<Value, ApiError> {
        let url = self.endpoint(&["chat", conversation_id.as_str(), "group", "member"])?;
        let body = AddMembersRequest {
            user_ids: members.to_vec(),
        };
        Ok(self.send(self.http.post(url).json(&body)).await?.unwrap_or_default())
    }
}
