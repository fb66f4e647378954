use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_STREAM_INACTIVITY_TIMEOUT_SECONDS: u64 = 60;
pub const DEFAULT_HISTORY_LIMIT: u32 = 100;
pub const CONFIG_DIRECTORY_NAME: &str = "mnemo";
pub const CONFIG_FILE_NAME: &str = "client.json";
pub const ENV_PREFIX: &str = "MNEMO_";

/// Transport configuration: defaults, overridden by the config file,
/// overridden by `MNEMO_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    /// Longest a stream may go without a chunk before it is failed.
    #[serde(default = "default_stream_inactivity_timeout_seconds")]
    pub stream_inactivity_timeout_seconds: u64,
    /// `limit` query parameter for history loads.
    #[serde(default = "default_history_limit")]
    pub history_limit: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_seconds: default_request_timeout_seconds(),
            stream_inactivity_timeout_seconds: default_stream_inactivity_timeout_seconds(),
            history_limit: default_history_limit(),
        }
    }
}

impl ClientConfig {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(CONFIG_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".mnemo"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(CONFIG_FILE_NAME)
    }

    pub fn load() -> Self {
        Self::load_from(&Self::default_config_path())
    }

    /// A missing file is the normal first run; a broken file falls back to
    /// defaults with a warning rather than refusing to start.
    pub fn load_from(path: &Path) -> Self {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!("config file not found at {:?}, using defaults", path);
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX));

        match figment.extract::<Self>() {
            Ok(config) => config.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse config from {:?}: {}. using defaults",
                    path,
                    error
                );
                Self::default()
            }
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn stream_inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_inactivity_timeout_seconds)
    }

    /// Joins `path` (always `/`-prefixed) onto the configured base URL.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn normalized(mut self) -> Self {
        self.base_url = self.base_url.trim().trim_end_matches('/').to_string();
        if self.base_url.is_empty() {
            self.base_url = default_base_url();
        }
        if self.request_timeout_seconds == 0 {
            self.request_timeout_seconds = default_request_timeout_seconds();
        }
        if self.stream_inactivity_timeout_seconds == 0 {
            self.stream_inactivity_timeout_seconds = default_stream_inactivity_timeout_seconds();
        }
        if self.history_limit == 0 {
            self.history_limit = default_history_limit();
        }
        self
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_request_timeout_seconds() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECONDS
}

fn default_stream_inactivity_timeout_seconds() -> u64 {
    DEFAULT_STREAM_INACTIVITY_TIMEOUT_SECONDS
}

fn default_history_limit() -> u32 {
    DEFAULT_HISTORY_LIMIT
}
