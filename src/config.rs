use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_AUTHORITY_URL: &str = "https://login.microsoftonline.com";
pub const TRADE_SHOW_LEAD_SOURCE: i64 = 7;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub upload_dir: PathBuf,
    pub dynamics_authority_url: String,
    pub page_size: u32,
    pub default_lead_source_code: i64,
    /// Alias (case-insensitive) to rep name. Per-connection aliases win over these.
    pub rep_aliases: BTreeMap<String, String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("leadsync");
        Self {
            database_path: data_dir.join("leadsync.db"),
            upload_dir: data_dir.join("uploads"),
            dynamics_authority_url: DEFAULT_AUTHORITY_URL.to_string(),
            page_size: 100,
            default_lead_source_code: TRADE_SHOW_LEAD_SOURCE,
            rep_aliases: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("leadsync")
            .join("config.json")
    }

    pub fn load(config_path: &Path) -> Self {
        let mut config = if config_path.exists() {
            match std::fs::read_to_string(config_path) {
                Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                    log::warn!("Ignoring malformed config {}: {}", config_path.display(), e);
                    Self::default()
                }),
                Err(_) => Self::default(),
            }
        } else {
            let c = Self::default();
            c.save(config_path);
            c
        };

        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    pub fn save(&self, config_path: &Path) {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        if let Ok(content) = serde_json::to_string_pretty(self) {
            std::fs::write(config_path, content).ok();
        }
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let set = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(path) = set("LEADSYNC_DATABASE_PATH") {
            self.database_path = PathBuf::from(path);
        }
        if let Some(dir) = set("LEADSYNC_UPLOAD_DIR") {
            self.upload_dir = PathBuf::from(dir);
        }
        if let Some(url) = set("LEADSYNC_AUTHORITY_URL") {
            self.dynamics_authority_url = url;
        }
    }
}
