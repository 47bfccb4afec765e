use serde::Deserialize;

/// Input for [`SessionRepository::create`](super::repo::SessionRepository::create).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewSession {
    pub ip_address: String,
    pub user_agent: String,
    /// Lifetime of the session; the configured default when absent.
    #[serde(skip)]
    pub ttl: Option<time::Duration>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl NewSession {
    pub fn new(ip_address: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            ip_address: ip_address.into(),
            user_agent: user_agent.into(),
            ttl: None,
            metadata: None,
        }
    }

    pub fn with_ttl(mut self, ttl: time::Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}
