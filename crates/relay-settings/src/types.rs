use std::collections::BTreeMap;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::{Result, SettingsError};

pub const MAX_HISTORY_LIMIT: usize = 1000;

/// Root settings, loaded from `~/.relay/settings.json`. All keys are camelCase
/// and every field has a default, so partial files are fine:
///
/// ```json
/// { "server": { "baseUrl": "https://planner.example.com" } }
/// ```
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    pub server: ServerSettings,
    pub chat: ChatSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub base_url: String,
    pub chat_path: String,
    pub actions_path: String,
    pub connect_timeout_ms: u64,
    /// Bearer token. Read from the file or `RELAY_API_TOKEN`, never written back.
    #[serde(skip_serializing, deserialize_with = "deserialize_token")]
    pub api_token: Option<SecretString>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            chat_path: "/api/chat/stream".to_string(),
            actions_path: "/api/chat/actions".to_string(),
            connect_timeout_ms: 10_000,
            api_token: None,
        }
    }
}

fn deserialize_token<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<SecretString>, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?
        .filter(|token| !token.is_empty())
        .map(SecretString::from))
}

impl ServerSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatSettings {
    /// Settled messages sent with each request.
    pub history_limit: usize,
    pub use_dynamic_queries: bool,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            history_limit: 20,
            use_dynamic_queries: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    /// Per-target overrides, e.g. `{"relay_stream": "debug"}`.
    pub module_levels: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            json: false,
            module_levels: BTreeMap::new(),
        }
    }
}

impl RelaySettings {
    /// Reject values that would only fail later, at request time.
    pub fn validate(&self) -> Result<()> {
        let url = &self.server.base_url;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(SettingsError::InvalidValue(format!(
                "server.baseUrl must be an http(s) URL, got {url:?}"
            )));
        }
        for (key, path) in [
            ("chatPath", &self.server.chat_path),
            ("actionsPath", &self.server.actions_path),
        ] {
            if !path.starts_with('/') {
                return Err(SettingsError::InvalidValue(format!(
                    "server.{key} must start with '/', got {path:?}"
                )));
            }
        }
        if self.server.connect_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "server.connectTimeoutMs must be positive".to_string(),
            ));
        }
        if self.chat.history_limit > MAX_HISTORY_LIMIT {
            return Err(SettingsError::InvalidValue(format!(
                "chat.historyLimit must be at most {MAX_HISTORY_LIMIT}, got {}",
                self.chat.history_limit
            )));
        }
        Ok(())
    }
}
