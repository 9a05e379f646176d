use std::env;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use reqwest::blocking::{RequestBuilder, Response as HttpResponse};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use super::MalformedResponse;
use crate::error::truncate_text;

/// Transport-level retry for timeouts and connection failures. Status errors are not
/// retried.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Duration::ZERO,
        }
    }

    /// Reads `<PREFIX>_TRANSPORT_RETRIES` and `<PREFIX>_RETRY_BACKOFF` (seconds).
    pub fn from_env(prefix: &str) -> Self {
        let defaults = Self::default();
        let max_retries = non_empty_env(&format!("{prefix}_TRANSPORT_RETRIES"))
            .and_then(|raw| raw.parse::<usize>().ok())
            .map(|value| value.min(4))
            .unwrap_or(defaults.max_retries);
        let backoff = non_empty_env(&format!("{prefix}_RETRY_BACKOFF"))
            .and_then(|raw| raw.parse::<f64>().ok())
            .filter(|value| value.is_finite())
            .map(|value| Duration::from_secs_f64(value.clamp(0.0, 10.0)))
            .unwrap_or(defaults.backoff);
        Self {
            max_retries,
            backoff,
        }
    }

    fn delay_for(&self, attempt: usize) -> Duration {
        self.backoff.mul_f64(attempt as f64 + 1.0)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff: Duration::from_millis(1200),
        }
    }
}

/// Which transport failures a call may resend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetryOn {
    /// Timeouts and connection failures. Used for file uploads.
    Transport,
    /// Connection failures only, and only while the next attempt still starts inside the
    /// budget measured from the first send. A timed-out request is never resent.
    ConnectWithin(Duration),
}

impl RetryOn {
    fn allows(self, err: &anyhow::Error, next_start: Duration) -> bool {
        match self {
            RetryOn::Transport => is_retryable_transport_error(err),
            RetryOn::ConnectWithin(budget) => next_start < budget && is_connect_error(err),
        }
    }
}

/// Sends the request built by `build`, rebuilding it for each retry (multipart bodies are
/// single-use).
pub(crate) fn send_with_transport_retries(
    label: &str,
    policy: &RetryPolicy,
    retry_on: RetryOn,
    build: impl Fn() -> Result<RequestBuilder>,
) -> Result<HttpResponse> {
    let started = Instant::now();
    let mut attempt = 0;
    loop {
        let sent = build()?.send();
        match sent {
            Ok(response) => return Ok(response),
            Err(raw) => {
                let err = anyhow::Error::new(raw).context(format!("{label} request failed"));
                let delay = policy.delay_for(attempt);
                if attempt >= policy.max_retries
                    || !retry_on.allows(&err, started.elapsed() + delay)
                {
                    return Err(err);
                }
                warn!(
                    label,
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    "transient transport failure; retrying"
                );
                thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

pub(crate) fn response_json_or_error(label: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{label} response body read failed"))?;
    if !status.is_success() {
        bail!("{label} request failed ({code}): {}", truncate_text(&body, 512));
    }
    serde_json::from_str(&body).map_err(|err| {
        anyhow::Error::new(MalformedResponse::new(
            label,
            format!("body is not JSON ({err}): {}", truncate_text(&body, 200)),
        ))
    })
}

/// Deserializes a JSON body into its wire type; shape mismatches become
/// [`MalformedResponse`].
pub(crate) fn decode_payload<T: DeserializeOwned>(label: &str, payload: Value) -> Result<T> {
    serde_json::from_value(payload)
        .map_err(|err| anyhow::Error::new(MalformedResponse::new(label, err.to_string())))
}

pub(crate) fn is_retryable_transport_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .map(|reqwest_err| reqwest_err.is_timeout() || reqwest_err.is_connect())
            .unwrap_or(false)
    })
}

fn is_connect_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .map(|reqwest_err| reqwest_err.is_connect())
            .unwrap_or(false)
    })
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn env_api_base(key: &str, default: &str) -> String {
    non_empty_env(key)
        .map(|value| value.trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

pub(crate) fn env_duration_secs(key: &str, default: Duration) -> Duration {
    non_empty_env(key)
        .and_then(|raw| raw.parse::<f64>().ok())
        .filter(|value| value.is_finite() && *value > 0.0)
        .map(Duration::from_secs_f64)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::{decode_payload, is_retryable_transport_error, RetryOn, RetryPolicy};
    use crate::providers::{EditResponse, MalformedResponse};

    #[test]
    fn retry_delay_grows_linearly() {
        let policy = RetryPolicy {
            max_retries: 3,
            backoff: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(300));
        assert_eq!(RetryPolicy::none().max_retries, 0);
    }

    #[test]
    fn decode_payload_marks_shape_mismatch_as_malformed() {
        let err = decode_payload::<EditResponse>("OpenAI edits", json!({ "data": "nope" }))
            .unwrap_err();
        let malformed = err
            .downcast_ref::<MalformedResponse>()
            .expect("malformed marker");
        assert_eq!(malformed.provider, "OpenAI edits");
    }

    #[test]
    fn plain_errors_are_not_retryable() {
        let err = anyhow::anyhow!("OpenAI edits request failed (400): bad size");
        assert!(!is_retryable_transport_error(&err));
    }

    #[test]
    fn connect_only_retries_respect_budget() -> anyhow::Result<()> {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
            listener.local_addr()?.port()
        };
        let refused = reqwest::blocking::Client::new()
            .get(format!("http://127.0.0.1:{port}/"))
            .send()
            .map(|_| ())
            .map_err(anyhow::Error::new)
            .unwrap_err();

        assert!(RetryOn::Transport.allows(&refused, Duration::from_secs(60)));
        assert!(RetryOn::ConnectWithin(Duration::from_secs(5))
            .allows(&refused, Duration::from_millis(100)));
        assert!(!RetryOn::ConnectWithin(Duration::from_secs(5))
            .allows(&refused, Duration::from_secs(6)));

        let status = anyhow::anyhow!("Gemini generateContent request failed (503): busy");
        assert!(!RetryOn::ConnectWithin(Duration::from_secs(5)).allows(&status, Duration::ZERO));
        Ok(())
    }
}
