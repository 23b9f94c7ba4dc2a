use std::{collections::HashMap, env, fs, path::Path, path::PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceSettings {
    pub listen_addr: String,
    pub database_path: PathBuf,
    /// WebSocket URL of the cross-instance relay. Absent means
    /// single-instance mode.
    pub bridge_url: Option<String>,
    pub tick_interval_secs: u64,
    /// Bearer token -> user id, consumed by the static verifier.
    pub tokens: HashMap<String, String>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:4590".into(),
            database_path: PathBuf::from("tempo.db"),
            bridge_url: None,
            tick_interval_secs: 10,
            tokens: HashMap::new(),
        }
    }
}

impl ServiceSettings {
    /// Loads settings from a JSON file (defaults when absent), then applies
    /// `TEMPO_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path)
                    .with_context(|| format!("failed to read settings from {}", path.display()))?;
                serde_json::from_str(&contents)
                    .with_context(|| format!("invalid settings file {}", path.display()))?
            }
            _ => Self::default(),
        };
        settings.apply_env();
        Ok(settings)
    }

    fn apply_env(&mut self) {
        if let Ok(addr) = env::var("TEMPO_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Ok(path) = env::var("TEMPO_DB_PATH") {
            self.database_path = PathBuf::from(path);
        }
        if let Ok(url) = env::var("TEMPO_BRIDGE_URL") {
            if url.is_empty() {
                self.bridge_url = None;
            } else {
                self.bridge_url = Some(url);
            }
        }
        if let Ok(secs) = env::var("TEMPO_TICK_SECS") {
            if let Ok(parsed) = secs.parse() {
                self.tick_interval_secs = parsed;
            }
        }
    }
}
