use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::calls::IceServer;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("user_id must not be empty")]
    MissingUserId,
}

/// Durations are written as whole milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Unanswered calls end with `no_answer` after this long.
    #[serde(with = "duration_ms")]
    pub ring_timeout: Duration,
    /// How long connectivity checks may run before an ICE restart.
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// A `disconnected` link gets this long to recover on its own.
    #[serde(with = "duration_ms")]
    pub disconnect_grace: Duration,
    /// Delay before the single re-send of an unanswered offer.
    #[serde(with = "duration_ms")]
    pub reoffer_delay: Duration,
    #[serde(with = "duration_ms")]
    pub quality_interval: Duration,
    /// How long a not-yet-connected call survives a transport outage.
    #[serde(with = "duration_ms")]
    pub transport_grace: Duration,
    pub max_ice_restarts: u32,
    /// Extra attempts for call-control sends before giving up.
    pub signaling_retries: u32,
    #[serde(with = "duration_ms")]
    pub signaling_retry_delay: Duration,
    pub ice_servers: Vec<IceServer>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            disconnect_grace: Duration::from_secs(3),
            reoffer_delay: Duration::from_secs(2),
            quality_interval: Duration::from_secs(3),
            transport_grace: Duration::from_secs(15),
            max_ice_restarts: 5,
            signaling_retries: 2,
            signaling_retry_delay: Duration::from_millis(500),
            ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Flush attempts before a queued message is marked failed.
    pub max_retries: u32,
    pub manual_retry_attempts: u32,
    /// First manual-retry delay; doubles per attempt.
    #[serde(with = "duration_ms")]
    pub manual_retry_base_delay: Duration,
    /// Peer typing indicators clear after this much silence.
    #[serde(with = "duration_ms")]
    pub typing_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            manual_retry_attempts: 3,
            manual_retry_base_delay: Duration::from_secs(1),
            typing_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub user_id: String,
    /// Directory for the persisted message queue. In-memory when unset.
    pub store_path: Option<PathBuf>,
    pub call: CallConfig,
    pub queue: QueueConfig,
}

impl ClientConfig {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = tokio::fs::read(path.as_ref()).await?;
        let config: Self = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.user_id.trim().is_empty() {
            return Err(ConfigError::MissingUserId);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: ClientConfig = serde_json::from_str(
            r#"{"user_id": "alice", "call": {"ring_timeout": 30000}, "queue": {"max_retries": 3}}"#,
        )
        .unwrap();
        assert_eq!(config.user_id, "alice");
        assert_eq!(config.call.ring_timeout, Duration::from_secs(30));
        assert_eq!(config.call.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.call.max_ice_restarts, 5);
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.queue.typing_timeout, Duration::from_secs(5));
        assert!(config.store_path.is_none());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.json");
        tokio::fs::write(&path, r#"{"user_id": "bob", "store_path": "/tmp/q"}"#)
            .await
            .unwrap();

        let config = ClientConfig::load(&path).await.unwrap();
        assert_eq!(config.user_id, "bob");
        assert_eq!(config.store_path, Some(PathBuf::from("/tmp/q")));
    }

    #[tokio::test]
    async fn test_load_rejects_missing_user() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.json");
        tokio::fs::write(&path, "{}").await.unwrap();
        assert!(matches!(
            ClientConfig::load(&path).await,
            Err(ConfigError::MissingUserId)
        ));
    }
}
