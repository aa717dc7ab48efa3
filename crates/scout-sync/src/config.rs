use std::path::PathBuf;
use std::time::Duration;

use scout_core::DEFAULT_BASE_CURRENCY;

use crate::smtp::{SmtpSettings, DEFAULT_SMTP_PORT};

#[derive(Debug, Clone)]
pub struct ScoutConfig {
    pub data_file: PathBuf,
    pub persist_debounce: Duration,
    pub base_currency: String,
    pub scheduler_enabled: bool,
    /// Six-field cron expression (seconds first).
    pub scraper_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub page_delay: Duration,
    pub metagames_page_limit: usize,
    pub sources_file: PathBuf,
    pub web_port: u16,
    pub alert_from_email: String,
    pub notify_timeout: Duration,
    /// Set only when host, user and password are all present.
    pub smtp: Option<SmtpSettings>,
}

impl ScoutConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| get(key).and_then(|v| v.trim().parse::<u64>().ok());
        Self {
            data_file: get("SCOUT_DATA_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/scout.json")),
            persist_debounce: Duration::from_millis(
                parsed("SCOUT_PERSIST_DEBOUNCE_MS").unwrap_or(50),
            ),
            base_currency: get("SCOUT_BASE_CURRENCY")
                .map(|v| v.trim().to_uppercase())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_BASE_CURRENCY.to_string()),
            scheduler_enabled: get("SCOUT_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
            scraper_cron: normalize_cron(
                &get("SCRAPER_CRON").unwrap_or_else(|| "0 */30 * * * *".to_string()),
            ),
            user_agent: get("SCOUT_USER_AGENT").unwrap_or_else(|| {
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) PokemonScoutBot/0.2".to_string()
            }),
            http_timeout_secs: parsed("SCOUT_HTTP_TIMEOUT_SECS").unwrap_or(20),
            page_delay: Duration::from_millis(parsed("SCRAPER_DELAY_MS").unwrap_or(750)),
            metagames_page_limit: parsed("METAGAMES_PAGE_LIMIT")
                .map(|v| v as usize)
                .unwrap_or(50),
            sources_file: get("SCOUT_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("sources.yaml")),
            web_port: get("SCOUT_WEB_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(4000),
            alert_from_email: get("ALERT_FROM_EMAIL")
                .unwrap_or_else(|| "no-reply@pokemon-scout.local".to_string()),
            notify_timeout: Duration::from_secs(parsed("SCOUT_NOTIFY_TIMEOUT_SECS").unwrap_or(15)),
            smtp: smtp_settings(&get),
        }
    }
}

fn smtp_settings(get: &impl Fn(&str) -> Option<String>) -> Option<SmtpSettings> {
    let present = |key: &str| get(key).filter(|v| !v.trim().is_empty());
    Some(SmtpSettings {
        host: present("SMTP_HOST")?.trim().to_string(),
        port: get("SMTP_PORT")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_SMTP_PORT),
        username: present("SMTP_USER")?,
        password: present("SMTP_PASS")?,
    })
}

/// Accept classic five-field cron lines by pinning the seconds field to 0.
pub fn normalize_cron(expr: &str) -> String {
    let expr = expr.trim();
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}
