//! HTTP write client for InfluxDB.

use std::future::Future;

use modflux_common::Sample;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use tracing::{debug, trace};

use crate::config::{InfluxApi, InfluxConfig};
use crate::error::SinkError;
use crate::line::encode_batch;

/// Longest response body kept in error messages.
const MAX_ERROR_BODY: usize = 512;

/// Destination for batches of samples.
///
/// Implemented by [`InfluxClient`]; the writer only depends on this trait so
/// other sinks can be plugged in.
pub trait PointSink: Send + Sync + 'static {
    /// Write one batch. The whole batch succeeds or fails.
    fn write(&self, samples: &[Sample]) -> impl Future<Output = Result<(), SinkError>> + Send;
}

#[derive(Debug, Clone)]
enum Auth {
    None,
    Token(String),
    Basic {
        username: String,
        password: Option<String>,
    },
}

/// InfluxDB HTTP write API client.
#[derive(Debug, Clone)]
pub struct InfluxClient {
    http: reqwest::Client,
    write_url: String,
    query: Vec<(&'static str, String)>,
    auth: Auth,
}

impl InfluxClient {
    /// Create a client from configuration.
    pub fn new(config: &InfluxConfig) -> Result<Self, SinkError> {
        let base = config.url.trim_end_matches('/');
        if base.is_empty() {
            return Err(SinkError::Config("url cannot be empty".to_string()));
        }

        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| SinkError::Config(format!("Failed to build HTTP client: {}", e)))?;

        let (write_url, query, auth) = match &config.api {
            InfluxApi::V1 {
                database,
                retention_policy,
                username,
                password,
            } => {
                let mut query = vec![("db", database.clone()), ("precision", "ms".to_string())];
                if let Some(rp) = retention_policy {
                    query.push(("rp", rp.clone()));
                }
                let auth = match username {
                    Some(username) => Auth::Basic {
                        username: username.clone(),
                        password: password.clone(),
                    },
                    None => Auth::None,
                };
                (format!("{}/write", base), query, auth)
            }
            InfluxApi::V2 { org, bucket, token } => (
                format!("{}/api/v2/write", base),
                vec![
                    ("org", org.clone()),
                    ("bucket", bucket.clone()),
                    ("precision", "ms".to_string()),
                ],
                Auth::Token(token.clone()),
            ),
        };

        debug!(url = %write_url, "Created InfluxDB client");

        Ok(Self {
            http,
            write_url,
            query,
            auth,
        })
    }

    /// Full URL of the write endpoint (without query string).
    pub fn write_url(&self) -> &str {
        &self.write_url
    }
}

impl PointSink for InfluxClient {
    async fn write(&self, samples: &[Sample]) -> Result<(), SinkError> {
        let body = encode_batch(samples);
        if body.is_empty() {
            return Ok(());
        }

        let mut request = self
            .http
            .post(&self.write_url)
            .query(&self.query)
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body);

        request = match &self.auth {
            Auth::None => request,
            Auth::Token(token) => request.header(AUTHORIZATION, format!("Token {}", token)),
            Auth::Basic { username, password } => request.basic_auth(username, password.as_ref()),
        };

        let response = request.send().await.map_err(|e| SinkError::Unavailable {
            status: None,
            reason: e.to_string(),
        })?;

        let status = response.status();
        if status.is_success() {
            trace!(samples = samples.len(), status = %status, "Batch written");
            return Ok(());
        }

        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let cut = (0..=MAX_ERROR_BODY)
                .rev()
                .find(|i| body.is_char_boundary(*i))
                .unwrap_or(0);
            body.truncate(cut);
        }

        Err(classify(status, body))
    }
}

/// Map a non-success HTTP status to a retryable or non-retryable error.
pub fn classify(status: StatusCode, body: String) -> SinkError {
    let transient = status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT;

    if transient {
        SinkError::Unavailable {
            status: Some(status.as_u16()),
            reason: format!("HTTP {}: {}", status.as_u16(), body),
        }
    } else {
        SinkError::Rejected {
            status: status.as_u16(),
            body,
        }
    }
}
