use serde_json::Value;
use tracing::{debug, info};

use lingua_types::UserSummary;
use lingua_types::api::{AuthResult, CurrentUser, LoginRequest};

use crate::client::ApiClient;
use crate::error::ApiError;

impl ApiClient {
    /// `POST /identify/auth`. On success the token is kept for every later
    /// request and returned for the realtime channel.
    pub async fn login(&self, username: &str, password: &str) -> Result<String, ApiError> {
        let url = self.endpoint(&["identify", "auth"])?;
        let body = LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        let auth: AuthResult = self.send_required(self.http.post(url).json(&body)).await?;

        match auth.token {
            Some(token) if auth.authenticated => {
                info!("Authenticated as {}", username);
                self.set_token(Some(token.clone()));
                Ok(token)
            }
            _ => Err(ApiError::Rejected {
                code: 401,
                message: "authentication failed".to_string(),
            }),
        }
    }

    /// `GET /identify/users`: profile of the token's owner.
    pub async fn current_user(&self) -> Result<CurrentUser, ApiError> {
        let url = self.endpoint(&["identify", "users"])?;
        self.send_required(self.http.get(url)).await
    }

    /// `POST /identify/users/find-user?request=`: users matching `query`
    /// (a username or email). An empty list means nobody matched.
    pub async fn find_users(&self, query: &str) -> Result<Vec<UserSummary>, ApiError> {
        let url = self.endpoint(&["identify", "users", "find-user"])?;
        let req = self.http.post(url).query(&[("request", query.trim())]);
        let users = user_rows(self.send(req).await?)?;
        debug!("find-user {:?}: {} match(es)", query, users.len());
        Ok(users)
    }
}

/// The lookup answers with a single profile or a list of them.
fn user_rows(result: Option<Value>) -> Result<Vec<UserSummary>, ApiError> {
    let rows = match result {
        Some(Value::Array(items)) => items,
        Some(item @ Value::Object(_)) => vec![item],
        _ => return Ok(Vec::new()),
    };
    rows.into_iter()
        .map(|row| Ok(serde_json::from_value::<CurrentUser>(row)?.summary()))
        .collect()
}
