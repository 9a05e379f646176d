use std::error::Error as StdError;
use std::path::PathBuf;

use thiserror::Error;

use crate::providers::MalformedResponse;

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Failure kinds surfaced by the codec utilities, the stages and the pipeline driver.
///
/// Wrapping variants keep the underlying cause as their `source`; use [`error_chain_text`]
/// to render the whole chain for warnings and event payloads.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source image not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("failed reading {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported media type '{detected}' for {subject} (supported: image/jpeg, image/png, image/webp)")]
    UnsupportedMediaType { subject: String, detected: String },

    #[error("failed to decode {context}")]
    Decode {
        context: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to encode {context}")]
    Encode {
        context: String,
        #[source]
        source: BoxError,
    },

    #[error("{provider} {operation} call failed")]
    ProviderCallFailed {
        provider: String,
        operation: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("{provider} response contained no candidates")]
    EmptyProviderResponse { provider: String },

    #[error("{provider} did not return an image: {}", render_diagnostics(.diagnostics))]
    NoImageReturned {
        provider: String,
        diagnostics: Vec<String>,
    },

    #[error("{provider} returned an invalid response: {detail}")]
    InvalidProviderResponse { provider: String, detail: String },

    #[error("worker for {operation} failed")]
    Worker {
        operation: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("pipeline run cancelled")]
    Cancelled,
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::SourceNotFound(_) => "source_not_found",
            Self::Io { .. } => "io",
            Self::UnsupportedMediaType { .. } => "unsupported_media_type",
            Self::Decode { .. } => "decode_error",
            Self::Encode { .. } => "encode_error",
            Self::ProviderCallFailed { .. } => "provider_call_failed",
            Self::EmptyProviderResponse { .. } => "empty_provider_response",
            Self::NoImageReturned { .. } => "no_image_returned",
            Self::InvalidProviderResponse { .. } => "invalid_provider_response",
            Self::Worker { .. } => "worker_failed",
            Self::Config(_) => "config",
            Self::Cancelled => "cancelled",
        }
    }

    pub(crate) fn decode(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Decode {
            context: context.into(),
            source: source.into(),
        }
    }

    pub(crate) fn encode(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Encode {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Classifies a provider client failure. A [`MalformedResponse`] anywhere in the chain
    /// means the call succeeded but the body had the wrong shape.
    pub(crate) fn from_provider(
        provider: &str,
        operation: &'static str,
        err: anyhow::Error,
    ) -> Self {
        if let Some(malformed) = err.downcast_ref::<MalformedResponse>().or_else(|| {
            err.chain()
                .find_map(|cause| cause.downcast_ref::<MalformedResponse>())
        }) {
            return Self::InvalidProviderResponse {
                provider: provider.to_string(),
                detail: malformed.detail.clone(),
            };
        }
        Self::ProviderCallFailed {
            provider: provider.to_string(),
            operation,
            source: err.into(),
        }
    }
}

fn render_diagnostics(diagnostics: &[String]) -> String {
    if diagnostics.is_empty() {
        return "no image output".to_string();
    }
    diagnostics.join(" / ")
}

/// Joins an error and its sources into one line, dropping consecutive duplicates.
pub fn error_chain_text(err: &(dyn StdError + 'static), max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(cause) = current {
        let text = cause.to_string();
        let trimmed = text.trim();
        if !trimmed.is_empty() && parts.last().map(String::as_str) != Some(trimmed) {
            parts.push(trimmed.to_string());
        }
        current = cause.source();
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(": "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
