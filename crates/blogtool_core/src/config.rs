use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::identifiers::DEFAULT_STAGING_BASE;

pub const DEFAULT_USER_AGENT: &str = "blogtool/0.2";
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BlogConfig {
    #[serde(default)]
    pub site: SiteSection,
    #[serde(default)]
    pub renumber: RenumberSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SiteSection {
    pub url: Option<String>,
    pub revalidate_url: Option<String>,
    pub revalidate_secret: Option<String>,
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct RenumberSection {
    pub staging_base: Option<i64>,
}

impl BlogConfig {
    /// Resolve the page revalidation endpoint: env BLOGTOOL_REVALIDATE_URL > config > None.
    pub fn revalidate_url(&self) -> Option<String> {
        env_override("BLOGTOOL_REVALIDATE_URL").or_else(|| {
            self.site
                .revalidate_url
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        })
    }

    pub fn revalidate_secret(&self) -> Option<String> {
        env_override("BLOGTOOL_REVALIDATE_SECRET").or_else(|| self.site.revalidate_secret.clone())
    }

    /// Resolve user agent: env BLOGTOOL_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        env_override("BLOGTOOL_USER_AGENT")
            .or_else(|| self.site.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn timeout_ms(&self) -> u64 {
        env_override("BLOGTOOL_HTTP_TIMEOUT_MS")
            .and_then(|value| value.parse::<u64>().ok())
            .or(self.site.timeout_ms)
            .unwrap_or(DEFAULT_TIMEOUT_MS)
    }

    /// Resolve the staging base: env BLOGTOOL_STAGING_BASE > config > DEFAULT_STAGING_BASE.
    /// Non-positive values are rejected.
    pub fn staging_base(&self) -> Result<i64> {
        let from_env = match env_override("BLOGTOOL_STAGING_BASE") {
            Some(value) => Some(
                value
                    .parse::<i64>()
                    .with_context(|| format!("BLOGTOOL_STAGING_BASE is not an integer: {value}"))?,
            ),
            None => None,
        };
        let base = from_env
            .or(self.renumber.staging_base)
            .unwrap_or(DEFAULT_STAGING_BASE);
        if base <= 0 {
            bail!("staging_base must be positive, got {base}");
        }
        Ok(base)
    }
}

/// Load and parse a BlogConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<BlogConfig> {
    if !config_path.exists() {
        return Ok(BlogConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: BlogConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

/// Commented starter config written by `blogtool init`.
pub const CONFIG_TEMPLATE: &str = r#"# blogtool configuration

[site]
# url = "https://blog.example.org"
# revalidate_url = "https://blog.example.org/api/revalidate"
# revalidate_secret = "change-me"
# user_agent = "blogtool/0.2"
# timeout_ms = 10000

[renumber]
# First id of the temporary band used while renumbering; must exceed the article count.
staging_base = 50000
"#;

fn env_override(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
