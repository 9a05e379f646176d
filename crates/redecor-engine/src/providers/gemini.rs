use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client as HttpClient;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::http::{
    decode_payload, env_api_base, env_duration_secs, non_empty_env, response_json_or_error,
    send_with_transport_retries, RetryOn, RetryPolicy,
};
use super::{
    FileHandle, GenerateContentResponse, GenerateRequest, MalformedResponse, MultimodalProvider,
};
use crate::codec::MediaType;
use crate::error::{PipelineError, PipelineResult};

pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_GEMINI_IMAGE_MODEL: &str = "gemini-2.5-flash-image";
const UPLOAD_LABEL: &str = "Gemini file upload";
const GENERATE_LABEL: &str = "Gemini generateContent";

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub api_base: String,
    pub model: String,
    /// Applied to uploads; generation uses the per-request timeout.
    pub upload_timeout: Duration,
    pub retry: RetryPolicy,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_base: DEFAULT_GEMINI_API_BASE.to_string(),
            model: DEFAULT_GEMINI_IMAGE_MODEL.to_string(),
            upload_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }

    /// `GEMINI_API_KEY` (or `GOOGLE_API_KEY`), with optional `GEMINI_API_BASE`,
    /// `GEMINI_IMAGE_MODEL` and `GEMINI_UPLOAD_TIMEOUT` overrides.
    pub fn from_env() -> PipelineResult<Self> {
        let api_key = non_empty_env("GEMINI_API_KEY")
            .or_else(|| non_empty_env("GOOGLE_API_KEY"))
            .ok_or_else(|| {
                PipelineError::Config("GEMINI_API_KEY (or GOOGLE_API_KEY) must be set".to_string())
            })?;
        let defaults = Self::new(api_key);
        Ok(Self {
            api_base: env_api_base("GEMINI_API_BASE", DEFAULT_GEMINI_API_BASE),
            model: non_empty_env("GEMINI_IMAGE_MODEL").unwrap_or(defaults.model.clone()),
            upload_timeout: env_duration_secs("GEMINI_UPLOAD_TIMEOUT", defaults.upload_timeout),
            retry: RetryPolicy::from_env("GEMINI"),
            ..defaults
        })
    }
}

/// Files API upload plus generateContent client.
pub struct GeminiClient {
    config: GeminiConfig,
    http: HttpClient,
}

#[derive(Debug, Deserialize)]
struct UploadedFileEnvelope {
    file: UploadedFile,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadedFile {
    name: String,
    uri: String,
    #[serde(default, alias = "mime_type")]
    mime_type: Option<String>,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> PipelineResult<Self> {
        let http = HttpClient::builder()
            .build()
            .map_err(|err| PipelineError::Config(format!("Gemini http client: {err}")))?;
        Ok(Self { config, http })
    }

    pub fn from_env() -> PipelineResult<Self> {
        Self::new(GeminiConfig::from_env()?)
    }

    pub fn config(&self) -> &GeminiConfig {
        &self.config
    }

    fn start_upload(
        &self,
        bytes: &[u8],
        media_type: MediaType,
        display_name: &str,
    ) -> Result<String> {
        let endpoint = format!("{}/upload/v1beta/files", self.config.api_base);
        let metadata = json!({ "file": { "display_name": display_name } });
        let response = send_with_transport_retries(
            UPLOAD_LABEL,
            &self.config.retry,
            RetryOn::Transport,
            || {
                Ok(self
                    .http
                    .post(&endpoint)
                    .query(&[("key", self.config.api_key.as_str())])
                    .timeout(self.config.upload_timeout)
                    .header("X-Goog-Upload-Protocol", "resumable")
                    .header("X-Goog-Upload-Command", "start")
                    .header("X-Goog-Upload-Header-Content-Length", bytes.len().to_string())
                    .header("X-Goog-Upload-Header-Content-Type", media_type.mime())
                    .json(&metadata))
            },
        )?;
        let status = response.status();
        let upload_url = response
            .headers()
            .get("x-goog-upload-url")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        match upload_url {
            Some(url) if status.is_success() => Ok(url),
            _ => {
                // Surfaces the status error, or flags a 2xx without the session header.
                response_json_or_error(UPLOAD_LABEL, response)?;
                Err(anyhow::Error::new(MalformedResponse::new(
                    UPLOAD_LABEL,
                    "upload session response carried no x-goog-upload-url header",
                )))
            }
        }
    }
}

impl MultimodalProvider for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    fn upload_file(
        &self,
        bytes: &[u8],
        media_type: MediaType,
        display_name: &str,
    ) -> Result<FileHandle> {
        let upload_url = self
            .start_upload(bytes, media_type, display_name)
            .with_context(|| format!("starting upload of {display_name}"))?;
        debug!(display_name, bytes = bytes.len(), mime = media_type.mime(), "uploading file");
        let response = send_with_transport_retries(
            UPLOAD_LABEL,
            &self.config.retry,
            RetryOn::Transport,
            || {
                Ok(self
                    .http
                    .post(&upload_url)
                    .timeout(self.config.upload_timeout)
                    .header("X-Goog-Upload-Offset", "0")
                    .header("X-Goog-Upload-Command", "upload, finalize")
                    .body(bytes.to_vec()))
            },
        )?;
        let payload = response_json_or_error(UPLOAD_LABEL, response)?;
        decode_uploaded_file(payload, media_type)
    }

    fn generate_content(&self, request: &GenerateRequest) -> Result<GenerateContentResponse> {
        let endpoint = generate_endpoint(&self.config.api_base, &self.config.model);
        let payload = build_generate_payload(request);
        debug!(
            model = %self.config.model,
            files = request.files.len(),
            timeout_s = request.timeout.as_secs_f64(),
            "sending generateContent"
        );
        let response = send_with_transport_retries(
            GENERATE_LABEL,
            &self.config.retry,
            RetryOn::ConnectWithin(request.timeout),
            || {
                Ok(self
                    .http
                    .post(&endpoint)
                    .query(&[("key", self.config.api_key.as_str())])
                    .timeout(request.timeout)
                    .json(&payload))
            },
        )?;
        let body = response_json_or_error(GENERATE_LABEL, response)?;
        decode_payload(GENERATE_LABEL, body)
    }
}

fn generate_endpoint(api_base: &str, model: &str) -> String {
    let model = model.trim().trim_start_matches("models/");
    format!("{api_base}/v1beta/models/{model}:generateContent")
}

/// One user turn: the instruction text followed by every uploaded file, in order.
pub(crate) fn build_generate_payload(request: &GenerateRequest) -> Value {
    let mut parts = vec![json!({ "text": request.instruction })];
    for file in &request.files {
        parts.push(json!({
            "fileData": {
                "mimeType": file.mime_type,
                "fileUri": file.uri,
            }
        }));
    }
    json!({
        "contents": [{ "role": "user", "parts": parts }],
        "generationConfig": { "responseModalities": ["TEXT", "IMAGE"] },
    })
}

fn decode_uploaded_file(payload: Value, media_type: MediaType) -> Result<FileHandle> {
    let envelope: UploadedFileEnvelope = decode_payload(UPLOAD_LABEL, payload)?;
    let file = envelope.file;
    if file.uri.trim().is_empty() {
        return Err(anyhow::Error::new(MalformedResponse::new(
            UPLOAD_LABEL,
            format!("uploaded file {} has no uri", file.name),
        )));
    }
    Ok(FileHandle {
        name: file.name,
        uri: file.uri,
        mime_type: file
            .mime_type
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| media_type.mime().to_string()),
    })
}
