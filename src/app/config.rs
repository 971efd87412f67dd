//! Layered configuration.
//!
//! Sources, lowest to highest priority: built-in defaults, the user file
//! `~/.config/sitemend/config.toml`, the project file (`./sitemend.toml` or
//! `--config`), then `SITEMEND_*` environment variables with `__` separating
//! sections (`SITEMEND_CRAWLER__MAX_CONCURRENCY=3`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_FETCH_CONCURRENCY: usize = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Figment(#[from] figment::Error),

    #[error("invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub crawler: CrawlerConfig,
    #[serde(default)]
    pub verifier: VerifierConfig,
    #[serde(default)]
    pub widget: WidgetConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CrawlerConfig {
    pub max_concurrency: usize,
    pub request_delay_ms: u64,
    pub timeout_secs: u64,
    pub user_agent: String,
    pub default_max_pages: usize,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            request_delay_ms: 100,
            timeout_secs: 20,
            user_agent: format!("sitemend/{} (+site audit)", env!("CARGO_PKG_VERSION")),
            default_max_pages: 50,
        }
    }
}

impl CrawlerConfig {
    pub fn concurrency(&self) -> usize {
        self.max_concurrency.clamp(1, MAX_FETCH_CONCURRENCY)
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Browser {
    Chrome,
    Firefox,
    Edge,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct VerifierConfig {
    pub webdriver_url: String,
    pub browser: Browser,
    pub headless: bool,
    pub timeout_secs: u64,
    pub settle_ms: u64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:4444".to_string(),
            browser: Browser::Chrome,
            headless: true,
            timeout_secs: 60,
            settle_ms: 1000,
        }
    }
}

impl VerifierConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct WidgetConfig {
    pub cache_ttl_secs: u64,
}

impl WidgetConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for WidgetConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "sitemend.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub monthly_pages: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self { monthly_pages: 500 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
}

impl AppConfig {
    /// Load from every source, using `explicit` in place of `./sitemend.toml`
    /// when given.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let config: Self = Self::figment(explicit).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn figment(explicit: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(global_path) = Self::global_config_path()
            && global_path.exists()
        {
            figment = figment.merge(Toml::file(global_path));
        }

        let local_path = explicit
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("sitemend.toml"));
        if local_path.exists() {
            figment = figment.merge(Toml::file(local_path));
        }

        figment.merge(Env::prefixed("SITEMEND_").split("__"))
    }

    fn global_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("sitemend").join("config.toml"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.crawler.max_concurrency == 0 {
            return Err(invalid("crawler.max_concurrency", "must be at least 1"));
        }
        if self.crawler.timeout_secs == 0 {
            return Err(invalid("crawler.timeout_secs", "must be at least 1"));
        }
        if self.verifier.timeout_secs == 0 {
            return Err(invalid("verifier.timeout_secs", "must be at least 1"));
        }
        if self.quota.monthly_pages == 0 {
            return Err(invalid("quota.monthly_pages", "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.crawler.concurrency(), 4);
        assert_eq!(config.widget.cache_ttl_secs, 3600);
        assert_eq!(config.verifier.settle_ms, 1000);
    }

    #[test]
    fn concurrency_is_clamped_to_polite_range() {
        let crawler = CrawlerConfig {
            max_concurrency: 64,
            ..CrawlerConfig::default()
        };
        assert_eq!(crawler.concurrency(), MAX_FETCH_CONCURRENCY);
    }

    #[test]
    fn project_file_and_env_layer_over_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "sitemend.toml",
                r#"
                [crawler]
                max_concurrency = 2
                request_delay_ms = 0

                [verifier]
                browser = "firefox"
                "#,
            )?;
            jail.set_env("SITEMEND_STORE__PATH", ":memory:");
            jail.set_env("SITEMEND_CRAWLER__MAX_CONCURRENCY", "3");

            let config = AppConfig::load(None).expect("config should load");
            assert_eq!(config.crawler.max_concurrency, 3);
            assert_eq!(config.crawler.request_delay_ms, 0);
            assert_eq!(config.verifier.browser, Browser::Firefox);
            assert_eq!(config.store.path, ":memory:");
            Ok(())
        });
    }

    #[test]
    fn zero_quota_is_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("SITEMEND_QUOTA__MONTHLY_PAGES", "0");
            let err = AppConfig::load(None).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidValue { .. }));
            Ok(())
        });
    }
}
