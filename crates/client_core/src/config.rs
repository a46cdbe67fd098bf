use std::{collections::HashMap, fs, path::Path, time::Duration};

use shared::domain::{ThreadId, UserId};
use url::Url;

use crate::{
    channel::ReconnectPolicy,
    error::{ClientError, Result},
};

pub const DEFAULT_SETTINGS_FILE: &str = "messaging.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub api_base_url: String,
    pub ws_path: String,
    pub reconnect_base_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub event_buffer: usize,
    pub request_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:3000".into(),
            ws_path: "/api/ws".into(),
            reconnect_base_delay_ms: 1000,
            max_reconnect_attempts: 5,
            event_buffer: 1024,
            request_timeout_secs: 15,
        }
    }
}

impl Settings {
    pub fn with_api_base_url(mut self, api_base_url: impl Into<String>) -> Self {
        self.api_base_url = api_base_url.into();
        self
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Push endpoint for `user_id`; `wss` when the API is served over `https`.
    pub fn websocket_url(&self, token: &str, user_id: &UserId) -> Result<Url> {
        let mut url = Url::parse(self.api_base_url.trim_end_matches('/'))
            .map_err(|err| ClientError::Config(format!("invalid api_base_url: {err}")))?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => {
                return Err(ClientError::Config(format!(
                    "api_base_url must use http or https, got {other}"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| ClientError::Config(format!("cannot switch scheme to {scheme}")))?;
        url.set_path(&self.ws_path);
        url.query_pairs_mut()
            .clear()
            .append_pair("token", token)
            .append_pair("userId", user_id.as_str());
        Ok(url)
    }

    pub fn api_url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base_url.trim_end_matches('/'))
    }

    /// `/api/messages/threads/{id}[/{action}]` with the id encoded as one path segment.
    pub fn thread_url(&self, thread_id: &ThreadId, action: Option<&str>) -> Result<Url> {
        let mut url = Url::parse(&self.api_base_url)
            .map_err(|err| ClientError::Config(format!("invalid api_base_url: {err}")))?;
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                ClientError::Config(format!("api_base_url cannot carry a path: {}", self.api_base_url))
            })?;
            segments
                .pop_if_empty()
                .extend(["api", "messages", "threads", thread_id.as_str()]);
            if let Some(action) = action {
                segments.push(action);
            }
        }
        Ok(url)
    }
}

pub fn load_settings() -> Settings {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE))
}

pub fn load_settings_from(path: &Path) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            Ok(file_cfg) => apply_file_overrides(&mut settings, &file_cfg),
            Err(err) => tracing::warn!(path = %path.display(), "config: ignoring invalid settings file: {err}"),
        }
    }

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_file_overrides(settings: &mut Settings, file_cfg: &HashMap<String, toml::Value>) {
    if let Some(v) = file_cfg.get("api_url").and_then(toml::Value::as_str) {
        settings.api_base_url = v.to_string();
    }
    if let Some(v) = file_cfg.get("ws_path").and_then(toml::Value::as_str) {
        settings.ws_path = v.to_string();
    }
    if let Some(v) = file_cfg.get("reconnect_base_delay_ms").and_then(toml::Value::as_integer) {
        if let Ok(v) = u64::try_from(v) {
            settings.reconnect_base_delay_ms = v;
        }
    }
    if let Some(v) = file_cfg.get("max_reconnect_attempts").and_then(toml::Value::as_integer) {
        if let Ok(v) = u32::try_from(v) {
            settings.max_reconnect_attempts = v;
        }
    }
    if let Some(v) = file_cfg.get("event_buffer").and_then(toml::Value::as_integer) {
        if let Ok(v) = usize::try_from(v) {
            settings.event_buffer = v.max(1);
        }
    }
    if let Some(v) = file_cfg.get("request_timeout_secs").and_then(toml::Value::as_integer) {
        if let Ok(v) = u64::try_from(v) {
            settings.request_timeout_secs = v;
        }
    }
}

fn apply_env_overrides(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("MESSAGING_API_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = var("APP__API_URL") {
        settings.api_base_url = v;
    }

    if let Some(v) = var("MESSAGING_WS_PATH") {
        settings.ws_path = v;
    }

    if let Some(v) = var("APP__RECONNECT_BASE_DELAY_MS") {
        if let Ok(parsed) = v.parse() {
            settings.reconnect_base_delay_ms = parsed;
        }
    }
    if let Some(v) = var("APP__MAX_RECONNECT_ATTEMPTS") {
        if let Ok(parsed) = v.parse() {
            settings.max_reconnect_attempts = parsed;
        }
    }
    if let Some(v) = var("APP__EVENT_BUFFER") {
        if let Ok(parsed) = v.parse::<usize>() {
            settings.event_buffer = parsed.max(1);
        }
    }
    if let Some(v) = var("APP__REQUEST_TIMEOUT_SECS") {
        if let Ok(parsed) = v.parse() {
            settings.request_timeout_secs = parsed;
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
