use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use serde::Deserialize;

use crate::error::{DeckError, DeckResult};
use crate::executions::BusSettings;
use crate::manager::ManagerSettings;

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DeckConfig {
    /// HTTP base of the management backend; WebSocket URLs derive from it.
    pub server_url: String,
    pub state_dir: PathBuf,
    pub terminal: TerminalConfig,
    pub executions: ExecutionsConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct TerminalConfig {
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub restore_grace_ms: u64,
    pub close_timeout_ms: u64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ExecutionsConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub lookup_timeout_ms: u64,
}

impl Default for DeckConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8000".to_string(),
            state_dir: deck_protocol::paths::default_state_dir(),
            terminal: TerminalConfig::default(),
            executions: ExecutionsConfig::default(),
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 2_000,
            restore_grace_ms: 1_000,
            close_timeout_ms: 3_000,
        }
    }
}

impl Default for ExecutionsConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            max_delay_ms: 30_000,
            lookup_timeout_ms: 5_000,
        }
    }
}

impl DeckConfig {
    /// Load from the default config path, falling back to defaults.
    pub fn load() -> DeckResult<Self> {
        Self::load_from(&deck_protocol::paths::config_path())
    }

    pub fn load_from(path: &Path) -> DeckResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|e| DeckError::Config(format!("invalid {}: {e}", path.display())))
    }

    pub fn server_base(&self) -> DeckResult<Url> {
        Url::parse(&self.server_url)
            .map_err(|e| DeckError::Config(format!("invalid server_url {}: {e}", self.server_url)))
    }

    /// `server_url` with its scheme switched to ws/wss.
    pub fn websocket_base(&self) -> DeckResult<Url> {
        let mut url = self.server_base()?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(DeckError::Config(format!(
                    "unsupported server_url scheme: {other}"
                )));
            }
        };
        url.set_scheme(scheme)
            .map_err(|()| DeckError::Config(format!("cannot derive {scheme} url")))?;
        Ok(url)
    }

    pub fn manager_settings(&self) -> DeckResult<ManagerSettings> {
        Ok(ManagerSettings {
            ws_base: self.websocket_base()?,
            max_attempts: self.terminal.max_attempts,
            retry_delay: Duration::from_millis(self.terminal.retry_delay_ms),
            restore_grace: Duration::from_millis(self.terminal.restore_grace_ms),
            close_timeout: Duration::from_millis(self.terminal.close_timeout_ms),
        })
    }

    pub fn bus_settings(&self) -> DeckResult<BusSettings> {
        Ok(BusSettings {
            ws_base: self.websocket_base()?,
            base_delay: Duration::from_millis(self.executions.base_delay_ms),
            max_delay: Duration::from_millis(self.executions.max_delay_ms),
            lookup_timeout: Duration::from_millis(self.executions.lookup_timeout_ms),
        })
    }
}

/// Append path segments to a base URL, keeping its query empty.
pub(crate) fn join_path(base: &Url, segments: &[&str]) -> DeckResult<Url> {
    let mut url = base.clone();
    url.set_query(None);
    url.path_segments_mut()
        .map_err(|()| DeckError::Config(format!("{base} cannot be a base url")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}
