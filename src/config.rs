use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

/// Runtime settings, read from `config.toml` and overridden by environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Any sqlx URL; defaults to a SQLite file in the user's data directory.
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub http: HttpSettings,
    /// Access tokens for APIs that answer with an OAuth/Bearer challenge.
    #[serde(default)]
    pub oauth: Vec<OAuthProvider>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSettings {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self { timeout_secs: default_timeout_secs(), user_agent: default_user_agent() }
    }
}

fn default_timeout_secs() -> u64 { 30 }
fn default_user_agent() -> String { format!("rest-migrate/{}", env!("CARGO_PKG_VERSION")) }

#[derive(Clone, Serialize, Deserialize)]
pub struct OAuthProvider {
    pub host: String,
    pub access_token: String,
}

impl std::fmt::Debug for OAuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthProvider").field("host", &self.host).finish_non_exhaustive()
    }
}

impl Settings {
    /// Load from `path`, `REST_MIGRATE_CONFIG`, or the default config file.
    /// A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => std::env::var("REST_MIGRATE_CONFIG")
                .ok()
                .map(PathBuf::from)
                .or_else(default_config_path),
        };
        let mut settings = match path {
            Some(p) if p.exists() => {
                let text = std::fs::read_to_string(&p)
                    .with_context(|| format!("reading config: {}", p.display()))?;
                Self::from_toml_str(&text)
                    .with_context(|| format!("parsing config: {}", p.display()))?
            }
            _ => Self::default(),
        };
        settings.apply_env();
        Ok(settings)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("REST_MIGRATE_DATABASE_URL") {
            if !url.trim().is_empty() { self.database_url = Some(url); }
        }
        let timeout = std::env::var("REST_MIGRATE_HTTP_TIMEOUT_SECS").ok();
        if let Some(secs) = timeout.and_then(|s| s.parse().ok()) {
            self.http.timeout_secs = secs;
        }
    }

    pub fn oauth_token_for(&self, host: &str) -> Option<&str> {
        self.oauth
            .iter()
            .find(|p| p.host.eq_ignore_ascii_case(host))
            .map(|p| p.access_token.as_str())
    }
}

fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("dev", "rest-migrate", "rest-migrate")
        .map(|p| p.config_dir().join("config.toml"))
}
