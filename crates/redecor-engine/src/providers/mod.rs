//! Capability traits for the two external services, their wire response types, and the
//! HTTP clients that implement them.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::MediaType;
use crate::size::OutputSize;

pub mod dryrun;
pub mod gemini;
mod http;
pub mod openai;

pub use dryrun::{DryrunEditor, DryrunGenerator};
pub use gemini::{GeminiClient, GeminiConfig};
pub use http::RetryPolicy;
pub use openai::{OpenAiConfig, OpenAiImageEditor};

/// Marker error: the provider answered successfully but the body did not have the expected
/// shape. Stages map it to `InvalidProviderResponse` instead of `ProviderCallFailed`.
#[derive(Debug, Clone, Error)]
#[error("{provider} returned a malformed response: {detail}")]
pub struct MalformedResponse {
    pub provider: String,
    pub detail: String,
}

impl MalformedResponse {
    pub fn new(provider: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EditRequest<'a> {
    pub file_name: &'a str,
    pub image: &'a [u8],
    pub media_type: MediaType,
    pub instruction: &'a str,
    pub size: OutputSize,
}

/// Images/edits response body: `{ "data": [{ "b64_json": ... }] }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EditResponse {
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub data: Vec<EditedImage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EditedImage {
    #[serde(default)]
    pub b64_json: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub revised_prompt: Option<String>,
}

impl EditResponse {
    pub fn from_b64(b64_json: impl Into<String>) -> Self {
        Self {
            created: None,
            data: vec![EditedImage {
                b64_json: Some(b64_json.into()),
                ..EditedImage::default()
            }],
        }
    }

    /// The single image payload the stages consume, or why the body is unusable.
    pub fn first_image_b64(&self) -> Result<&str, String> {
        let Some(first) = self.data.first() else {
            return Err("response carried no images".to_string());
        };
        first
            .b64_json
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| "first image has no b64_json payload".to_string())
    }
}

pub trait ImageEditingProvider: Send + Sync {
    fn name(&self) -> &str;
    fn edit(&self, request: &EditRequest<'_>) -> anyhow::Result<EditResponse>;
}

/// Reference to a file held in the multimodal provider's file store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHandle {
    pub name: String,
    pub uri: String,
    pub mime_type: String,
}

/// Upload hook used by the compositing stage. Any provider or closure can stand in.
pub trait FileUploader {
    fn upload(
        &self,
        bytes: &[u8],
        media_type: MediaType,
        display_name: &str,
    ) -> anyhow::Result<FileHandle>;
}

impl<F> FileUploader for F
where
    F: Fn(&[u8], MediaType, &str) -> anyhow::Result<FileHandle>,
{
    fn upload(
        &self,
        bytes: &[u8],
        media_type: MediaType,
        display_name: &str,
    ) -> anyhow::Result<FileHandle> {
        self(bytes, media_type, display_name)
    }
}

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub instruction: String,
    pub files: Vec<FileHandle>,
    pub timeout: Duration,
}

/// generateContent response body, reduced to what the stages read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default, alias = "finish_reason")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<ContentPart>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, alias = "inline_data", skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default, alias = "mime_type")]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub data: String,
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            inline_data: None,
        }
    }

    pub fn inline(mime_type: &str, data: impl Into<String>) -> Self {
        Self {
            text: None,
            inline_data: Some(InlineData {
                mime_type: Some(mime_type.to_string()),
                data: data.into(),
            }),
        }
    }
}

impl GenerateContentResponse {
    pub fn from_parts(parts: Vec<ContentPart>) -> Self {
        Self {
            candidates: vec![Candidate {
                content: Some(Content {
                    role: Some("model".to_string()),
                    parts,
                }),
                finish_reason: Some("STOP".to_string()),
            }],
        }
    }
}

pub trait MultimodalProvider: Send + Sync {
    fn name(&self) -> &str;
    fn upload_file(
        &self,
        bytes: &[u8],
        media_type: MediaType,
        display_name: &str,
    ) -> anyhow::Result<FileHandle>;
    fn generate_content(&self, request: &GenerateRequest)
        -> anyhow::Result<GenerateContentResponse>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ContentPart, EditResponse, GenerateContentResponse};

    #[test]
    fn edit_response_reports_missing_payloads() -> anyhow::Result<()> {
        let empty: EditResponse = serde_json::from_value(json!({ "created": 1, "data": [] }))?;
        assert!(empty.first_image_b64().is_err());

        let url_only: EditResponse =
            serde_json::from_value(json!({ "data": [{ "url": "https://cdn/img.png" }] }))?;
        assert_eq!(
            url_only.first_image_b64(),
            Err("first image has no b64_json payload".to_string())
        );

        let ok = EditResponse::from_b64(" aGVsbG8= ");
        assert_eq!(ok.first_image_b64(), Ok("aGVsbG8="));
        Ok(())
    }

    #[test]
    fn generate_response_accepts_camel_and_snake_inline_data() -> anyhow::Result<()> {
        let parsed: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        { "text": "here" },
                        { "inlineData": { "mimeType": "image/png", "data": "AAA=" } },
                        { "inline_data": { "mime_type": "image/jpeg", "data": "BBB=" } }
                    ]
                },
                "finishReason": "STOP"
            }],
            "usageMetadata": { "totalTokenCount": 10 }
        }))?;
        let parts = &parsed.candidates[0]
            .content
            .as_ref()
            .map(|content| content.parts.clone())
            .unwrap_or_default();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], ContentPart::text("here"));
        assert_eq!(parts[1], ContentPart::inline("image/png", "AAA="));
        assert_eq!(parts[2], ContentPart::inline("image/jpeg", "BBB="));
        assert_eq!(parsed.candidates[0].finish_reason.as_deref(), Some("STOP"));
        Ok(())
    }
}
