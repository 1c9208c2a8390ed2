use std::time::Duration;

use url::Url;

use crate::settings::GlobalDefaults;

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_QR_REFRESH_SECS: u64 = 20;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub database_url: Option<String>,
    pub defaults: GlobalDefaults,
    pub qr_refresh: Duration,
    pub assistant_name: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_GEMINI_BASE_URL.into(),
            database_url: None,
            defaults: GlobalDefaults::default(),
            qr_refresh: Duration::from_secs(DEFAULT_QR_REFRESH_SECS),
            assistant_name: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub database_url: Option<String>,
    pub model: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    // blank values count as unset
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut cfg = Self::default();

        cfg.api_key = get("GEMINI_API_KEY").or_else(|| get("API_KEY"));
        if let Some(base) = get("GEMINI_BASE_URL") {
            let parsed = Url::parse(&base).map_err(|e| anyhow::anyhow!("invalid GEMINI_BASE_URL {base:?}: {e}"))?;
            anyhow::ensure!(matches!(parsed.scheme(), "http" | "https"), "GEMINI_BASE_URL must be http(s)");
            cfg.base_url = base;
        }
        cfg.database_url = get("AUTOPILOT_DATABASE_URL");
        if let Some(model) = get("AUTOPILOT_DEFAULT_MODEL") {
            cfg.defaults.default_model = model;
        }
        if let Some(secs) = get("AUTOPILOT_QR_REFRESH_SECS") {
            let secs: u64 = secs.parse().map_err(|e| anyhow::anyhow!("invalid AUTOPILOT_QR_REFRESH_SECS: {e}"))?;
            anyhow::ensure!(secs > 0, "AUTOPILOT_QR_REFRESH_SECS must be positive");
            cfg.qr_refresh = Duration::from_secs(secs);
        }
        cfg.assistant_name = get("AUTOPILOT_ASSISTANT_NAME");
        Ok(cfg)
    }

    pub fn with_overrides(mut self, cli: CliOverrides) -> Self {
        if let Some(url) = cli.database_url {
            self.database_url = Some(url);
        }
        if let Some(model) = cli.model.filter(|m| !m.trim().is_empty()) {
            self.defaults.default_model = model;
        }
        self
    }
}
