//! HTTP transport to the appliance
//!
//! Sends one JSON request with basic authentication. Connection failures
//! and timeouts are retried with exponential backoff up to the configured
//! number of tries; anything else is returned after the first attempt.

use crate::config::StorageEndpointConfig;
use crate::domain::ports::{RawResponse, RestTransport, TransportError};
use crate::error::{Error, Result};
use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, trace, warn};

const INITIAL_RETRY_INTERVAL: Duration = Duration::from_millis(250);
const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// reqwest-backed [`RestTransport`]
pub struct RestProxy {
    client: reqwest::Client,
    base_url: String,
    user: String,
    pass: String,
    tries: u32,
}

impl RestProxy {
    /// Build a transport for one storage endpoint
    pub fn new(cfg: &StorageEndpointConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(cfg.insecure_tls)
            .pool_idle_timeout(Duration::from_secs(cfg.idle_timeout_secs))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Configuration(format!("HTTP client for {}: {}", cfg.name, e)))?;

        Ok(Self {
            client,
            base_url: format!("{}://{}:{}", cfg.protocol, cfg.addr, cfg.port),
            user: cfg.user.clone(),
            pass: cfg.pass.clone(),
            tries: cfg.tries.max(1),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn policy() -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: INITIAL_RETRY_INTERVAL,
            initial_interval: INITIAL_RETRY_INTERVAL,
            max_interval: MAX_RETRY_INTERVAL,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }
}

#[async_trait]
impl RestTransport for RestProxy {
    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> std::result::Result<RawResponse, TransportError> {
        let url = self.url(path);
        let attempts = AtomicU32::new(0);

        trace!("{} {}", method, url);

        let response = retry(Self::policy(), || {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            let mut request = self
                .client
                .request(method.clone(), &url)
                .basic_auth(&self.user, Some(&self.pass));
            if let Some(body) = &body {
                request = request.json(body);
            }
            let tries = self.tries;
            let url = url.as_str();

            async move {
                match request.send().await {
                    Ok(rsp) => Ok(rsp),
                    Err(e) if e.is_connect() || e.is_timeout() => {
                        if attempt < tries {
                            warn!("Attempt {}/{} to reach {} failed: {}", attempt, tries, url, e);
                            Err(backoff::Error::transient(TransportError::Connect(e.to_string())))
                        } else {
                            Err(backoff::Error::permanent(TransportError::Connect(e.to_string())))
                        }
                    }
                    Err(e) => Err(backoff::Error::permanent(TransportError::Request(e.to_string()))),
                }
            }
        })
        .await?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Request(format!("reading body of {}: {}", url, e)))?
            .to_vec();

        debug!("{} {} -> {}", method, url, status);

        Ok(RawResponse { status, body })
    }
}
