use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

use lingua_api::ApiConfig;
use lingua_gateway::GatewayConfig;
use lingua_sync::SyncConfig;

/// Everything the client reads from the environment.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api: ApiConfig,
    pub gateway: GatewayConfig,
    pub sync: SyncConfig,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Skips login when set.
    pub token: Option<String>,
}

impl ClientConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut api = ApiConfig::default();
        if let Some(url) = lookup("LINGUA_API_URL") {
            api.base_url = url;
        }
        api.timeout = Duration::from_secs(parse(&lookup, "LINGUA_REQUEST_TIMEOUT_SECS", api.timeout.as_secs())?);

        let mut gateway = lookup("LINGUA_WS_URL").map(GatewayConfig::new).unwrap_or_default();
        gateway.heartbeat = Duration::from_secs(parse(&lookup, "LINGUA_HEARTBEAT_SECS", gateway.heartbeat.as_secs())?);
        gateway.backoff.max = Duration::from_secs(parse(
            &lookup,
            "LINGUA_RECONNECT_MAX_SECS",
            gateway.backoff.max.as_secs(),
        )?);
        gateway.backoff.max_attempts = lookup("LINGUA_RECONNECT_MAX_ATTEMPTS")
            .map(|raw| raw.parse().context("LINGUA_RECONNECT_MAX_ATTEMPTS must be a number"))
            .transpose()?;

        let mut sync = SyncConfig::default();
        let page_size = parse(&lookup, "LINGUA_PAGE_SIZE", sync.message_page_size)?;
        sync.message_page_size = page_size;
        sync.conversation_page_size = page_size;
        sync.recent_limit = parse(&lookup, "LINGUA_RECENT_LIMIT", sync.recent_limit)?;
        sync.echo_window = Duration::from_secs(parse(&lookup, "LINGUA_ECHO_WINDOW_SECS", sync.echo_window.as_secs())?);

        Ok(Self {
            api,
            gateway,
            sync,
            username: lookup("LINGUA_USERNAME"),
            password: lookup("LINGUA_PASSWORD"),
            token: lookup("LINGUA_TOKEN").filter(|t| !t.is_empty()),
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().with_context(|| format!("invalid {}: {:?}", key, raw)),
        None => Ok(default),
    }
}
