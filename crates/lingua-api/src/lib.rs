//! REST client for the chat backend.

pub mod auth;
pub mod backend;
pub mod client;
pub mod conversations;
pub mod error;
pub mod messages;

pub use backend::ChatBackend;
pub use client::{ApiClient, ApiConfig};
pub use error::ApiError;
