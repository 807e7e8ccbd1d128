//! Configuration types for enclosure-dl

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Scheduling and storage configuration
///
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Base directory for in-progress files (default: "./temp")
    ///
    /// Must be creatable; construction fails rather than falling back elsewhere.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Maximum number of transfers running at once (default: 2)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_downloads: usize,

    /// Fail a transfer when no data arrives for this long (default: 60 seconds, None = never)
    #[serde(default = "default_stall_timeout", with = "optional_duration_serde")]
    pub stall_timeout: Option<Duration>,

    /// Capacity of the event broadcast channel (default: 1000)
    ///
    /// Subscribers that fall further behind receive `RecvError::Lagged`.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            temp_dir: default_temp_dir(),
            max_concurrent_downloads: default_max_concurrent(),
            stall_timeout: default_stall_timeout(),
            event_buffer: default_event_buffer(),
        }
    }
}

/// HTTP client settings for [`HttpTransport`](crate::task::HttpTransport)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpConfig {
    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// TCP connect timeout (default: 30 seconds)
    #[serde(default = "default_connect_timeout", with = "duration_serde")]
    pub connect_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

/// Main configuration for [`DownloadManager`](crate::DownloadManager)
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Scheduling and storage settings
    #[serde(default)]
    pub download: DownloadConfig,

    /// HTTP client settings
    #[serde(default)]
    pub http: HttpConfig,
}

impl Config {
    /// Root directory for partial and finished downloads
    pub fn temp_dir(&self) -> &Path {
        &self.download.temp_dir
    }

    /// Load a configuration from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("failed to read '{}': {}", path.display(), e),
            key: None,
        })?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.download.max_concurrent_downloads == 0 {
            return Err(Error::Config {
                message: "max_concurrent_downloads must be at least 1".to_string(),
                key: Some("max_concurrent_downloads".to_string()),
            });
        }
        if self.download.event_buffer == 0 {
            return Err(Error::Config {
                message: "event_buffer must be at least 1".to_string(),
                key: Some("event_buffer".to_string()),
            });
        }
        if self.download.stall_timeout == Some(Duration::ZERO) {
            return Err(Error::Config {
                message: "stall_timeout must be positive; use null to disable".to_string(),
                key: Some("stall_timeout".to_string()),
            });
        }
        Ok(())
    }
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("./temp")
}

fn default_max_concurrent() -> usize {
    2
}

fn default_stall_timeout() -> Option<Duration> {
    Some(Duration::from_secs(60))
}

fn default_event_buffer() -> usize {
    1000
}

fn default_user_agent() -> String {
    concat!("enclosure-dl/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Optional Duration serialization helper
mod optional_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}
