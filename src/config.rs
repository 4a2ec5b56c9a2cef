use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection and execution settings for a [`Client`](crate::client::Client).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// `sqlite::memory:` or `sqlite://path/to/file.db`
    pub url: String,
    /// Size of the read pool for file databases
    pub max_read_connections: u32,
    /// How long a connection waits on a locked database file
    pub busy_timeout_ms: u64,
    /// Write-ahead logging for file databases
    pub wal: bool,
    /// Minimum row count for the single-statement bulk insert path
    pub bulk_insert_threshold: usize,
    /// Enforce foreign keys on every connection
    pub foreign_keys: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_read_connections: 4,
            busy_timeout_ms: 5000,
            wal: true,
            bulk_insert_threshold: 2,
            foreign_keys: true,
        }
    }
}

impl ClientConfig {
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn file(path: impl AsRef<std::path::Path>) -> Self {
        Self {
            url: format!("sqlite://{}", path.as_ref().display()),
            ..Default::default()
        }
    }

    pub fn is_memory(&self) -> bool {
        self.url.contains(":memory:") || self.url.contains("mode=memory")
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert!(config.is_memory());
        assert_eq!(config.max_read_connections, 4);
        assert_eq!(config.busy_timeout(), Duration::from_secs(5));
        assert!(config.foreign_keys);
    }

    #[test]
    fn test_partial_deserialize_keeps_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"url": "sqlite://data.db", "wal": false}"#).unwrap();
        assert_eq!(config.url, "sqlite://data.db");
        assert!(!config.wal);
        assert!(!config.is_memory());
        assert_eq!(config.bulk_insert_threshold, 2);
    }

    #[test]
    fn test_file_config() {
        let config = ClientConfig::file("/tmp/app.db");
        assert_eq!(config.url, "sqlite:///tmp/app.db");
    }
}
