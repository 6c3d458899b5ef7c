use std::future::Future;

use serde_json::Value;

use lingua_types::{ConversationId, UserId};

use crate::client::ApiClient;
use crate::error::ApiError;

/// The REST calls the sync engine depends on. Results are raw JSON; the
/// engine normalizes them. Implementations are cloned into spawned fetch
/// tasks.
pub trait ChatBackend: Clone + Send + Sync + 'static {
    fn list_conversations(&self, page: u32, size: u32) -> impl Future<Output = Result<Vec<Value>, ApiError>> + Send;

    fn list_messages(
        &self,
        conversation_id: &ConversationId,
        page: u32,
        size: u32,
    ) -> impl Future<Output = Result<Vec<Value>, ApiError>> + Send;

    fn create_direct(&self, to_user_id: &UserId) -> impl Future<Output = Result<Value, ApiError>> + Send;

    fn create_group(
        &self,
        name: &str,
        members: &[UserId],
        locale: Option<&str>,
    ) -> impl Future<Output = Result<Value, ApiError>> + Send;

    fn rename(&self, conversation_id: &ConversationId, name: &str) -> impl Future<Output = Result<Value, ApiError>> + Send;

    fn set_locale(
        &self,
        conversation_id: &ConversationId,
        locale: &str,
    ) -> impl Future<Output = Result<Value, ApiError>> + Send;

    fn add_members(
        &self,
        conversation_id: &ConversationId,
        members: &[UserId],
    ) -> impl Future<Output = Result<Value, ApiError>> + Send;
}

impl ChatBackend for ApiClient {
    async fn list_conversations(&self, page: u32, size: u32) -> Result<Vec<Value>, ApiError> {
        ApiClient::list_conversations(self, page, size).await
    }

    async fn list_messages(&self, conversation_id: &ConversationId, page: u32, size: u32) -> Result<Vec<Value>, ApiError> {
        ApiClient::list_messages(self, conversation_id, page, size).await
    }

    async fn create_direct(&self, to_user_id: &UserId) -> Result<Value, ApiError> {
        ApiClient::create_direct(self, to_user_id).await
    }

    async fn create_group(&self, name: &str, members: &[UserId], locale: Option<&str>) -> Result<Value, ApiError> {
        ApiClient::create_group(self, name, members, locale).await
    }

    async fn rename(&self, conversation_id: &ConversationId, name: &str) -> Result<Value, ApiError> {
        ApiClient::rename(self, conversation_id, name).await
    }

    async fn set_locale(&self, conversation_id: &ConversationId, locale: &str) -> Result<Value, ApiError> {
        ApiClient::set_locale(self, conversation_id, locale).await
    }

    async fn add_members(&self, conversation_id: &ConversationId, members: &[UserId]) -> Result<Value, ApiError> {
        ApiClient::add_members(self, conversation_id, members).await
    }
}
