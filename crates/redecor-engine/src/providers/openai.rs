use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::Client as HttpClient;
use serde_json::Value;
use tracing::debug;

use super::http::{
    decode_payload, env_api_base, env_duration_secs, non_empty_env, response_json_or_error,
    send_with_transport_retries, RetryOn, RetryPolicy,
};
use super::{EditRequest, EditResponse, ImageEditingProvider, MalformedResponse};
use crate::error::{truncate_text, PipelineError, PipelineResult};

pub const DEFAULT_OPENAI_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_IMAGE_MODEL: &str = "gpt-image-1";
const EDITS_LABEL: &str = "OpenAI edits";

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub api_base: String,
    pub model: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_base: DEFAULT_OPENAI_API_BASE.to_string(),
            model: DEFAULT_OPENAI_IMAGE_MODEL.to_string(),
            timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
        }
    }

    /// `OPENAI_API_KEY` (or `OPENAI_TEAM_API_KEY`), with optional `OPENAI_API_BASE`,
    /// `OPENAI_IMAGE_MODEL` and `OPENAI_EDIT_TIMEOUT` overrides.
    pub fn from_env() -> PipelineResult<Self> {
        let api_key = non_empty_env("OPENAI_API_KEY")
            .or_else(|| non_empty_env("OPENAI_TEAM_API_KEY"))
            .ok_or_else(|| {
                PipelineError::Config(
                    "OPENAI_API_KEY (or OPENAI_TEAM_API_KEY) must be set".to_string(),
                )
            })?;
        let defaults = Self::new(api_key);
        Ok(Self {
            api_base: env_api_base("OPENAI_API_BASE", DEFAULT_OPENAI_API_BASE),
            model: non_empty_env("OPENAI_IMAGE_MODEL").unwrap_or(defaults.model.clone()),
            timeout: env_duration_secs("OPENAI_EDIT_TIMEOUT", defaults.timeout),
            retry: RetryPolicy::from_env("OPENAI"),
            ..defaults
        })
    }
}

/// Image-editing client for the `/images/edits` endpoint.
pub struct OpenAiImageEditor {
    config: OpenAiConfig,
    http: HttpClient,
}

impl OpenAiImageEditor {
    pub fn new(config: OpenAiConfig) -> PipelineResult<Self> {
        let http = HttpClient::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| PipelineError::Config(format!("OpenAI http client: {err}")))?;
        Ok(Self { config, http })
    }

    pub fn from_env() -> PipelineResult<Self> {
        Self::new(OpenAiConfig::from_env()?)
    }

    pub fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    fn edit_form(&self, request: &EditRequest<'_>) -> Result<MultipartForm> {
        let mut form = MultipartForm::new()
            .text("model", self.config.model.clone())
            .text("prompt", request.instruction.to_string())
            .text("size", request.size.to_string())
            .text("n", "1".to_string());
        if wants_response_format(&self.config.model) {
            form = form.text("response_format", "b64_json".to_string());
        }
        let mime = request.media_type.mime();
        let part = MultipartPart::bytes(request.image.to_vec())
            .file_name(request.file_name.to_string())
            .mime_str(mime)
            .with_context(|| format!("invalid mime '{mime}' for {}", request.file_name))?;
        Ok(form.part("image", part))
    }

    fn download_image_b64(&self, url: &str) -> Result<String> {
        let response = self
            .http
            .get(url)
            .send()
            .with_context(|| format!("failed downloading provider image ({url})"))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            bail!(
                "provider image download failed ({code}): {}",
                truncate_text(&body, 512)
            );
        }
        let bytes = response
            .bytes()
            .context("failed reading provider image bytes")?;
        Ok(BASE64.encode(bytes))
    }
}

impl ImageEditingProvider for OpenAiImageEditor {
    fn name(&self) -> &str {
        "openai"
    }

    fn edit(&self, request: &EditRequest<'_>) -> Result<EditResponse> {
        let endpoint = format!("{}/images/edits", self.config.api_base);
        debug!(
            endpoint = %endpoint,
            model = %self.config.model,
            size = %request.size,
            bytes = request.image.len(),
            "sending image edit"
        );
        let response = send_with_transport_retries(
            EDITS_LABEL,
            &self.config.retry,
            RetryOn::ConnectWithin(self.config.timeout),
            || {
                Ok(self
                    .http
                    .post(&endpoint)
                    .bearer_auth(&self.config.api_key)
                    .multipart(self.edit_form(request)?))
            },
        )?;
        let payload = response_json_or_error(EDITS_LABEL, response)?;
        let mut decoded = decode_edit_response(payload)?;
        if let Some(first) = decoded.data.first_mut() {
            if first.b64_json.is_none() {
                if let Some(url) = first.url.clone() {
                    first.b64_json = Some(self.download_image_b64(&url)?);
                }
            }
        }
        Ok(decoded)
    }
}

/// DALL·E models default to URL responses; gpt-image models always return base64 and
/// reject the parameter.
fn wants_response_format(model: &str) -> bool {
    model.trim().to_ascii_lowercase().starts_with("dall-e")
}

pub(crate) fn decode_edit_response(payload: Value) -> Result<EditResponse> {
    if let Some(error) = payload.get("error").filter(|value| !value.is_null()) {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(anyhow::Error::new(MalformedResponse::new(
            EDITS_LABEL,
            format!("error object in success body: {}", truncate_text(&message, 200)),
        )));
    }
    if !payload.is_object() {
        return Err(anyhow::Error::new(MalformedResponse::new(
            EDITS_LABEL,
            "body is not a JSON object",
        )));
    }
    decode_payload(EDITS_LABEL, payload)
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    use serde_json::json;

    use super::{decode_edit_response, wants_response_format, OpenAiConfig, OpenAiImageEditor};
    use crate::codec::MediaType;
    use crate::providers::{EditRequest, ImageEditingProvider, MalformedResponse};
    use crate::size::OutputSize;

    /// Reads one HTTP request, answers with `body`, and returns the raw request text.
    fn answer_once(listener: TcpListener, body: String) -> thread::JoinHandle<String> {
        thread::spawn(move || {
            let Ok((mut stream, _)) = listener.accept() else {
                return String::new();
            };
            let mut raw = Vec::new();
            let mut chunk = [0_u8; 4096];
            loop {
                let read = stream.read(&mut chunk).unwrap_or(0);
                if read == 0 {
                    break;
                }
                raw.extend_from_slice(&chunk[..read]);
                if request_complete(&raw) {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\n\
                 content-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes());
            String::from_utf8_lossy(&raw).into_owned()
        })
    }

    fn request_complete(raw: &[u8]) -> bool {
        let text = String::from_utf8_lossy(raw);
        let Some(header_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let content_length = text[..header_end].lines().find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        });
        match content_length {
            Some(length) => raw.len() >= header_end + 4 + length,
            None => text.ends_with("--\r\n") || text.ends_with("0\r\n\r\n"),
        }
    }

    #[test]
    fn edit_sends_single_image_part() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let server = answer_once(
            listener,
            json!({ "data": [{ "b64_json": "aGVsbG8=" }] }).to_string(),
        );
        let editor = OpenAiImageEditor::new(OpenAiConfig {
            api_base: format!("http://{addr}"),
            ..OpenAiConfig::new("sk-test")
        })?;

        let response = editor.edit(&EditRequest {
            file_name: "room.png",
            image: b"not-really-a-png",
            media_type: MediaType::Png,
            instruction: "empty the room",
            size: OutputSize::square(1024),
        })?;
        let request = server.join().expect("server thread");

        assert_eq!(response.first_image_b64(), Ok("aGVsbG8="));
        assert!(request.starts_with("POST /images/edits"));
        assert!(request.contains("name=\"image\"; filename=\"room.png\""));
        assert!(!request.contains("image[]"));
        assert!(!request.contains("response_format"));
        Ok(())
    }

    #[test]
    fn decodes_b64_edit_payload() -> anyhow::Result<()> {
        let decoded = decode_edit_response(json!({
            "created": 1_713_833_628,
            "data": [{ "b64_json": "aGVsbG8=", "revised_prompt": "empty room" }],
            "usage": { "total_tokens": 100 }
        }))?;
        assert_eq!(decoded.created, Some(1_713_833_628));
        assert_eq!(decoded.first_image_b64(), Ok("aGVsbG8="));
        assert_eq!(
            decoded.data[0].revised_prompt.as_deref(),
            Some("empty room")
        );
        Ok(())
    }

    #[test]
    fn error_object_in_body_is_malformed() {
        let err = decode_edit_response(json!({
            "error": { "message": "content policy violation" }
        }))
        .unwrap_err();
        let malformed = err
            .downcast_ref::<MalformedResponse>()
            .expect("malformed marker");
        assert!(malformed.detail.contains("content policy violation"));
    }

    #[test]
    fn non_object_body_is_malformed() {
        let err = decode_edit_response(json!(["not", "an", "object"])).unwrap_err();
        assert!(err.downcast_ref::<MalformedResponse>().is_some());
    }

    #[test]
    fn response_format_only_for_dalle_models() {
        assert!(wants_response_format("dall-e-2"));
        assert!(!wants_response_format("gpt-image-1"));
    }

    #[test]
    fn config_defaults_match_edit_endpoint() {
        let config = OpenAiConfig::new("sk-test");
        assert_eq!(config.api_base, "https://api.openai.com/v1");
        assert_eq!(config.model, "gpt-image-1");
        assert_eq!(config.timeout.as_secs(), 120);
        assert_eq!(config.retry.max_retries, 2);
    }
}
