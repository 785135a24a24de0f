//! Client configuration.

use crate::error::{EntitlementError, EntitlementResult};
use crate::session::SESSION_FILE;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default bound on a single remote call.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Settings for the entitlement client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// URL of the entitlement endpoint.
    pub api_url: String,
    /// Per-deployment static credential attached to every call.
    pub api_key: String,
    /// Bound on a single remote call, in seconds.
    pub timeout_secs: u64,
    /// Overrides the application data directory.
    pub data_dir: Option<PathBuf>,
    /// Secret mixed into the session checksum.
    pub session_secret: String,
    /// Application name, used for the data directory and the user agent.
    pub app_name: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.dlgconnect.app/functions/v1/bot-auth".to_string(),
            api_key: String::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            data_dir: None,
            session_secret: "dlg-connect-session-v2".to_string(),
            app_name: "DLG Connect".to_string(),
        }
    }
}

impl ClientConfig {
    /// Defaults overlaid with `DLG_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `DLG_TIMEOUT_SECS` is not a positive integer.
    pub fn from_env() -> EntitlementResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error if `DLG_TIMEOUT_SECS` is not a positive integer.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> EntitlementResult<Self> {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("DLG_API_URL") {
            config.api_url = url;
        }
        if let Some(key) = get("DLG_API_KEY") {
            config.api_key = key;
        }
        if let Some(secret) = get("DLG_SESSION_SECRET") {
            config.session_secret = secret;
        }
        if let Some(dir) = get("DLG_DATA_DIR") {
            config.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(raw) = get("DLG_TIMEOUT_SECS") {
            config.timeout_secs = raw
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .ok_or_else(|| {
                    EntitlementError::Config(format!("DLG_TIMEOUT_SECS must be positive, got {raw:?}"))
                })?;
        }
        Ok(config)
    }

    /// Bound on a single remote call.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Application-private data directory.
    ///
    /// `data_dir` if set, else the platform data directory joined with the
    /// application name, else the current directory.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|base| base.join(&self.app_name))
                .unwrap_or_else(|| PathBuf::from("."))
        })
    }

    /// Path of the session record.
    #[must_use]
    pub fn session_path(&self) -> PathBuf {
        self.data_dir().join(SESSION_FILE)
    }
}
