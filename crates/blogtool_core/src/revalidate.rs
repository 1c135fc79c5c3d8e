use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde_json::json;

use crate::config::BlogConfig;

const SECRET_HEADER: &str = "x-revalidate-secret";
const MAX_RETRIES: usize = 1;
const RETRY_DELAY_MS: u64 = 250;

/// Tells the rendering layer that every cached page may be stale.
pub trait PageInvalidator {
    fn invalidate_all(&self) -> Result<()>;
}

/// Used when no revalidation endpoint is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInvalidator;

impl PageInvalidator for NoopInvalidator {
    fn invalidate_all(&self) -> Result<()> {
        tracing::debug!("no revalidation endpoint configured; skipping page invalidation");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpInvalidatorConfig {
    pub url: String,
    pub secret: Option<String>,
    pub user_agent: String,
    pub timeout_ms: u64,
}

pub struct HttpInvalidator {
    client: Client,
    config: HttpInvalidatorConfig,
}

impl HttpInvalidator {
    pub fn new(config: HttpInvalidatorConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build revalidation HTTP client")?;
        Ok(Self { client, config })
    }

    fn post_once(&self) -> Result<StatusCode, reqwest::Error> {
        let mut request = self
            .client
            .post(&self.config.url)
            .header("User-Agent", self.config.user_agent.clone())
            .json(&json!({ "scope": "all" }));
        if let Some(secret) = &self.config.secret {
            request = request.header(SECRET_HEADER, secret.clone());
        }
        request.send().map(|response| response.status())
    }
}

impl PageInvalidator for HttpInvalidator {
    fn invalidate_all(&self) -> Result<()> {
        for attempt in 0..=MAX_RETRIES {
            match self.post_once() {
                Ok(status) if status.is_success() => {
                    tracing::info!(url = %self.config.url, "invalidated rendered pages");
                    return Ok(());
                }
                Ok(status) => {
                    if attempt < MAX_RETRIES && status.is_server_error() {
                        sleep(Duration::from_millis(RETRY_DELAY_MS));
                        continue;
                    }
                    bail!("revalidation request failed with HTTP {status}");
                }
                Err(error) => {
                    if attempt < MAX_RETRIES && (error.is_timeout() || error.is_connect()) {
                        sleep(Duration::from_millis(RETRY_DELAY_MS));
                        continue;
                    }
                    return Err(error).with_context(|| {
                        format!("revalidation request to {} failed", self.config.url)
                    });
                }
            }
        }
        bail!("revalidation request exhausted retry budget")
    }
}

/// Picks the HTTP invalidator when a revalidation URL is configured, otherwise the no-op.
pub fn invalidator_from_config(config: &BlogConfig) -> Result<Box<dyn PageInvalidator>> {
    match config.revalidate_url() {
        Some(url) => Ok(Box::new(HttpInvalidator::new(HttpInvalidatorConfig {
            url,
            secret: config.revalidate_secret(),
            user_agent: config.user_agent(),
            timeout_ms: config.timeout_ms(),
        })?)),
        None => Ok(Box::new(NoopInvalidator)),
    }
}
