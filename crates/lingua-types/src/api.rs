use serde::{Deserialize, Serialize};

use crate::models::{UserId, UserSummary};

/// Status code the backend reports inside a successful envelope.
pub const CODE_OK: i64 = 200;

/// Every REST response is wrapped in this envelope.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub code: i64,
    pub message: Option<String>,
    pub result: Option<T>,
}

// -- Auth --

#[derive(Debug, Serialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthResult {
    #[serde(default)]
    pub authenticated: bool,
    pub token: Option<String>,
}

/// User profile from the identity service: the signed-in user
/// (`GET /identify/users`) or a find-user match.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentUser {
    pub user_id: Option<UserId>,
    pub username: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl CurrentUser {
    /// The id messages from this user carry. Accounts without a user id are
    /// identified by username.
    pub fn id(&self) -> UserId {
        self.user_id
            .clone()
            .unwrap_or_else(|| UserId::new(self.username.clone()))
    }

    pub fn summary(&self) -> UserSummary {
        UserSummary {
            user_id: self.id(),
            username: Some(self.username.clone()),
            full_name: self.full_name.clone(),
            avatar_url: self.avatar_url.clone(),
        }
    }
}

// -- Conversations --

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDirectRequest {
    pub to_user_id: UserId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupRequest {
    pub user_ids: Vec<UserId>,
    pub conversation_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddMembersRequest {
    pub user_ids: Vec<UserId>,
}
