use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

pub const CONFIG_FILE_NAME: &str = "cognito_config.json";

const DEFAULT_PAGE_SIZE: usize = 50;
const DEFAULT_UPLOAD_TIMEOUT_SECS: u64 = 30;
const DEFAULT_TOAST_DISMISS_SECS: u64 = 3;
const DEFAULT_MEDIA_BUCKET: &str = "media";

/// Contents of `cognito_config.json`. Every field is optional; accessors apply defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AppConfig {
    pub disable_network: Option<bool>,
    pub backend_url: Option<String>,
    pub realtime_url: Option<String>,
    pub api_key: Option<String>,
    pub access_token: Option<String>,
    pub media_bucket: Option<String>,
    pub message_page_size: Option<usize>,
    pub upload_timeout_secs: Option<u64>,
    pub toast_dismiss_secs: Option<u64>,
    /// Count unread from the unfiltered message feed instead of the per-user inbox view.
    pub global_inbox_fallback: Option<bool>,
}

impl AppConfig {
    /// Network collaborators are used only when enabled and a backend is configured.
    pub fn network_enabled(&self) -> bool {
        self.disable_network != Some(true)
            && self
                .backend_url
                .as_deref()
                .is_some_and(|u| !u.trim().is_empty())
    }

    pub fn page_size(&self) -> usize {
        self.message_page_size
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_PAGE_SIZE)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(
            self.upload_timeout_secs
                .filter(|s| *s > 0)
                .unwrap_or(DEFAULT_UPLOAD_TIMEOUT_SECS),
        )
    }

    pub fn toast_dismiss(&self) -> Duration {
        Duration::from_secs(
            self.toast_dismiss_secs
                .unwrap_or(DEFAULT_TOAST_DISMISS_SECS),
        )
    }

    pub fn media_bucket(&self) -> String {
        self.media_bucket
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .unwrap_or(DEFAULT_MEDIA_BUCKET)
            .to_string()
    }
}

pub fn load_app_config(data_dir: &str) -> AppConfig {
    let path = Path::new(data_dir).join(CONFIG_FILE_NAME);
    let bytes = match std::fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return AppConfig::default(),
        Err(e) => {
            tracing::warn!(%e, path = %path.display(), "failed to read config; using defaults");
            return AppConfig::default();
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!(%e, path = %path.display(), "malformed config; using defaults");
            AppConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_app_config(&dir.path().to_string_lossy());
        assert_eq!(cfg, AppConfig::default());
        assert_eq!(cfg.page_size(), 50);
        assert_eq!(cfg.upload_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.toast_dismiss(), Duration::from_secs(3));
        assert_eq!(cfg.media_bucket(), "media");
        assert!(!cfg.network_enabled());
    }

    #[test]
    fn reads_fields_and_ignores_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"{
                "backend_url": "https://abc.example.co",
                "api_key": "anon",
                "message_page_size": 20,
                "upload_timeout_secs": 5,
                "media_bucket": "chat-media",
                "some_future_key": true
            }"#,
        )
        .unwrap();
        let cfg = load_app_config(&dir.path().to_string_lossy());
        assert!(cfg.network_enabled());
        assert_eq!(cfg.page_size(), 20);
        assert_eq!(cfg.upload_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.media_bucket(), "chat-media");
        assert_eq!(cfg.api_key.as_deref(), Some("anon"));
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "{ not json").unwrap();
        let cfg = load_app_config(&dir.path().to_string_lossy());
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn disable_network_wins_over_backend_url() {
        let cfg = AppConfig {
            disable_network: Some(true),
            backend_url: Some("https://abc.example.co".into()),
            ..AppConfig::default()
        };
        assert!(!cfg.network_enabled());
    }

    #[test]
    fn zero_page_size_uses_default() {
        let cfg = AppConfig {
            message_page_size: Some(0),
            ..AppConfig::default()
        };
        assert_eq!(cfg.page_size(), 50);
    }
}
