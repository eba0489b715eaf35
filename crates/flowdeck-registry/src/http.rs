//! Generic HTTP-backed tool client.
//!
//! Used for integrations discovered from manifest files: a dotted action
//! path becomes a POST to `<base_url>/<path with dots as slashes>` with
//! the inputs as the JSON body.  Response rate-limit headers are fed back
//! into the limiter so the local bucket tracks the server's view.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use flowdeck_core::{EngineError, Result, ToolClient};
use flowdeck_reliability::RateLimiterRegistry;
use serde_json::Value;
use tracing::debug;

/// How auth material is attached to requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AuthStyle {
    /// `Authorization: Bearer <token>` from the `token` auth key.
    #[default]
    Bearer,
    /// A custom header carrying the `token` auth key.
    Header(String),
    /// A query parameter carrying the `token` auth key.
    Query(String),
    /// No authentication.
    None,
}

impl AuthStyle {
    /// Parse the manifest `auth_style` field (`bearer`, `header:<name>`,
    /// `query:<name>`, `none`).
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "bearer" => Ok(Self::Bearer),
            "none" => Ok(Self::None),
            other => {
                if let Some(name) = other.strip_prefix("header:") {
                    Ok(Self::Header(name.to_string()))
                } else if let Some(name) = other.strip_prefix("query:") {
                    Ok(Self::Query(name.to_string()))
                } else {
                    Err(EngineError::invalid_config(format!(
                        "unknown auth_style `{other}`"
                    )))
                }
            }
        }
    }
}

/// A [`ToolClient`] speaking plain JSON-over-HTTP.
pub struct GenericHttpClient {
    service: String,
    base_url: url::Url,
    auth_style: AuthStyle,
    token: Option<String>,
    http: reqwest::Client,
    limiter: Option<RateLimiterRegistry>,
}

impl GenericHttpClient {
    /// Build a client for `service` rooted at `base_url`.
    pub fn new(
        service: impl Into<String>,
        base_url: &str,
        auth_style: AuthStyle,
        token: Option<String>,
        limiter: Option<RateLimiterRegistry>,
    ) -> Result<Self> {
        let base_url = url::Url::parse(base_url)
            .map_err(|e| EngineError::invalid_config(format!("invalid base_url: {e}")))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| EngineError::internal("failed to build http client").with_source(e))?;

        Ok(Self {
            service: service.into(),
            base_url,
            auth_style,
            token,
            http,
            limiter,
        })
    }

    fn endpoint(&self, path: &str) -> Result<url::Url> {
        let suffix = path.replace('.', "/");
        self.base_url
            .join(&suffix)
            .map_err(|e| EngineError::invalid_config(format!("invalid action path `{path}`: {e}")))
    }
}

#[async_trait]
impl ToolClient for GenericHttpClient {
    async fn call_action(&self, path: &str, inputs: Value) -> Result<Value> {
        let mut endpoint = self.endpoint(path)?;

        let mut request = self.http.post(endpoint.clone());
        match (&self.auth_style, &self.token) {
            (AuthStyle::Bearer, Some(token)) => {
                request = request.bearer_auth(token);
            }
            (AuthStyle::Header(name), Some(token)) => {
                request = request.header(name, token);
            }
            (AuthStyle::Query(name), Some(token)) => {
                endpoint.query_pairs_mut().append_pair(name, token);
                request = self.http.post(endpoint);
            }
            _ => {}
        }

        debug!(service = %self.service, path, "dispatching http action");

        let response = request.json(&inputs).send().await.map_err(|e| {
            let kind_err = if e.is_timeout() {
                EngineError::timeout(format!("request to `{}` timed out", self.service))
            } else {
                EngineError::network(format!("request to `{}` failed: {e}", self.service))
            };
            kind_err.with_source(e)
        })?;

        // Feed the server's remaining-quota view back into the bucket.
        if let Some(limiter) = &self.limiter {
            let headers: HashMap<String, String> = response
                .headers()
                .iter()
                .filter_map(|(k, v)| {
                    v.to_str()
                        .ok()
                        .map(|v| (k.as_str().to_string(), v.to_string()))
                })
                .collect();
            limiter.update_from_headers(&self.service, &headers);
        }

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let body = response.text().await.unwrap_or_default();

            let mut err = EngineError::from_status(
                status.as_u16(),
                format!("`{}` returned {status}: {body}", self.service),
            )
            .with_service(&self.service);
            if let Some(secs) = retry_after {
                err = err.with_retry_after(secs);
            }
            return Err(err);
        }

        response.json().await.map_err(|e| {
            EngineError::internal(format!(
                "`{}` returned a non-JSON response",
                self.service
            ))
            .with_source(e)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
