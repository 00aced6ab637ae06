//! Domain-allow-listed, timeout-bounded outbound fetch reachable from
//! inside a script.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// Outbound fetch limits. The allow-list is process-wide, read-only
/// configuration; an empty list denies every destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchPolicy {
    pub allowed_domains: Vec<String>,
    pub allowed_schemes: Vec<String>,
    /// Fetch-specific timeout, distinct from the script timeout.
    pub timeout: Duration,
    pub max_response_bytes: usize,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            allowed_domains: vec![],
            allowed_schemes: vec!["https".into(), "http".into()],
            timeout: Duration::from_secs(10),
            max_response_bytes: 1024 * 1024,
        }
    }
}

/// Errors raised before a request leaves the process. These surface inside
/// the sandbox as script exceptions.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("blocked scheme: {0}")]
    BlockedScheme(String),
    #[error("domain not allowed: {0}")]
    DomainNotAllowed(String),
    #[error("invalid http method: {0}")]
    InvalidMethod(String),
    #[error("http client build failed: {0}")]
    ClientBuildFailed(String),
}

/// `*.example.com` matches any subdomain and the apex; a bare pattern
/// matches exactly.
pub fn domain_matches(host: &str, pattern: &str) -> bool {
    if let Some(stripped) = pattern.strip_prefix("*.") {
        let suffix = &pattern[1..];
        host.ends_with(suffix) || host == stripped
    } else {
        host == pattern
    }
}

/// Request shape accepted from the sandbox.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FetchOptions {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Option<serde_json::Map<String, Value>>,
    #[serde(default)]
    pub body: Option<Value>,
}

impl FetchOptions {
    pub fn from_json(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}

pub struct SafeFetcher {
    client: reqwest::Client,
    policy: FetchPolicy,
}

impl SafeFetcher {
    pub fn new(policy: FetchPolicy) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(policy.timeout)
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()
            .map_err(|e| FetchError::ClientBuildFailed(e.to_string()))?;
        Ok(Self { client, policy })
    }

    /// Rejects the URL before any request leaves the process.
    pub fn check_url(&self, raw: &str) -> Result<Url, FetchError> {
        let url = Url::parse(raw).map_err(|_| FetchError::InvalidUrl(raw.to_string()))?;

        if !self
            .policy
            .allowed_schemes
            .iter()
            .any(|s| s.eq_ignore_ascii_case(url.scheme()))
        {
            return Err(FetchError::BlockedScheme(url.scheme().to_string()));
        }

        let host = url
            .host_str()
            .ok_or_else(|| FetchError::InvalidUrl(raw.to_string()))?;
        if !self
            .policy
            .allowed_domains
            .iter()
            .any(|d| domain_matches(host, d))
        {
            return Err(FetchError::DomainNotAllowed(host.to_string()));
        }

        Ok(url)
    }

    /// Performs the call and sanitizes the response to `{status, ok, body}`.
    /// Transport faults never leak raw: the detail goes to the log and the
    /// sandbox sees a generic failure value.
    pub async fn fetch(&self, url: Url, opts: FetchOptions) -> Value {
        let method = match self.parse_method(opts.method.as_deref()) {
            Ok(m) => m,
            Err(err) => {
                return serde_json::json!({
                    "status": 0,
                    "ok": false,
                    "body": err.to_string(),
                })
            }
        };

        let mut request = self.client.request(method, url.clone());
        if let Some(headers) = &opts.headers {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name, value);
                }
            }
        }
        if let Some(body) = &opts.body {
            request = request.json(body);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let ok = response.status().is_success();
                let body = match response.bytes().await {
                    Ok(bytes) => {
                        let mut bytes = bytes.to_vec();
                        bytes.truncate(self.policy.max_response_bytes);
                        sanitize_body(&bytes)
                    }
                    Err(err) => {
                        tracing::warn!(url = %url, error = %err, "failed reading fetch body");
                        Value::Null
                    }
                };
                serde_json::json!({ "status": status, "ok": ok, "body": body })
            }
            Err(err) => {
                tracing::warn!(url = %url, error = %err, "outbound fetch failed");
                serde_json::json!({
                    "status": 0,
                    "ok": false,
                    "body": "request failed",
                })
            }
        }
    }

    fn parse_method(&self, method: Option<&str>) -> Result<reqwest::Method, FetchError> {
        match method {
            None => Ok(reqwest::Method::GET),
            Some(m) => reqwest::Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                .map_err(|_| FetchError::InvalidMethod(m.to_string())),
        }
    }
}

/// Best-effort structured parse with a textual fallback.
fn sanitize_body(bytes: &[u8]) -> Value {
    if let Ok(json) = serde_json::from_slice::<Value>(bytes) {
        return json;
    }
    Value::String(String::from_utf8_lossy(bytes).into_owned())
}
