//! Scriptable provider doubles for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use image::{DynamicImage, Rgba, RgbaImage};

use crate::codec::{ImageAsset, MediaType};
use crate::providers::{
    ContentPart, EditRequest, EditResponse, FileHandle, GenerateContentResponse, GenerateRequest,
    ImageEditingProvider, MalformedResponse, MultimodalProvider,
};

pub(crate) fn solid_asset(width: u32, height: u32) -> ImageAsset {
    let canvas = RgbaImage::from_pixel(width, height, Rgba([180, 120, 60, 255]));
    ImageAsset::new(DynamicImage::ImageRgba8(canvas), MediaType::Png)
}

pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    solid_asset(width, height)
        .encode(MediaType::Png)
        .expect("png encode")
}

pub(crate) fn png_b64(width: u32, height: u32) -> String {
    BASE64.encode(png_bytes(width, height))
}

/// One scripted provider answer.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Image { width: u32, height: u32 },
    Fail(String),
    Malformed,
    Text(String),
    NoCandidates,
    /// Sleeps, then answers with a small image.
    Stall(Duration),
}

impl Reply {
    pub(crate) fn image(width: u32, height: u32) -> Self {
        Self::Image { width, height }
    }
}

/// Pops scripted replies in order; once the script runs dry the `repeat` reply (if any) is
/// used for every further call.
#[derive(Debug)]
struct Script {
    queue: Mutex<VecDeque<Reply>>,
    repeat: Option<Reply>,
}

impl Script {
    fn new(replies: Vec<Reply>, repeat: Option<Reply>) -> Self {
        Self {
            queue: Mutex::new(replies.into()),
            repeat,
        }
    }

    fn next(&self) -> Reply {
        let popped = self.queue.lock().expect("script lock").pop_front();
        popped
            .or_else(|| self.repeat.clone())
            .unwrap_or_else(|| Reply::Fail("reply script exhausted".to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EditCall {
    pub file_name: String,
    pub media_type: String,
    pub instruction: String,
    pub size: String,
}

#[derive(Debug)]
pub(crate) struct FakeEditor {
    script: Script,
    calls: Mutex<Vec<EditCall>>,
}

impl FakeEditor {
    pub(crate) fn new(replies: Vec<Reply>) -> Self {
        Self {
            script: Script::new(replies, None),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn repeating(reply: Reply) -> Self {
        Self {
            script: Script::new(Vec::new(), Some(reply)),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> Vec<EditCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }
}

impl ImageEditingProvider for FakeEditor {
    fn name(&self) -> &str {
        "fake-editor"
    }

    fn edit(&self, request: &EditRequest<'_>) -> Result<EditResponse> {
        self.calls.lock().expect("calls lock").push(EditCall {
            file_name: request.file_name.to_string(),
            media_type: request.media_type.mime().to_string(),
            instruction: request.instruction.to_string(),
            size: request.size.to_string(),
        });
        match self.script.next() {
            Reply::Image { width, height } => Ok(EditResponse::from_b64(png_b64(width, height))),
            Reply::Stall(delay) => {
                thread::sleep(delay);
                Ok(EditResponse::from_b64(png_b64(8, 8)))
            }
            Reply::Fail(message) => Err(anyhow!(message).context("fake edit request failed")),
            Reply::Malformed | Reply::Text(_) | Reply::NoCandidates => Ok(EditResponse::default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UploadCall {
    pub display_name: String,
    pub media_type: MediaType,
    pub bytes: usize,
}

type GenerateHook = Box<dyn Fn(usize) + Send + Sync>;

pub(crate) struct FakeGenerator {
    script: Script,
    failing_uploads: Vec<String>,
    hook: Option<GenerateHook>,
    uploads: Mutex<Vec<UploadCall>>,
    requests: Mutex<Vec<GenerateRequest>>,
    generate_calls: AtomicUsize,
}

impl FakeGenerator {
    pub(crate) fn new(replies: Vec<Reply>) -> Self {
        Self::scripted(replies, None)
    }

    pub(crate) fn repeating(reply: Reply) -> Self {
        Self::scripted(Vec::new(), Some(reply))
    }

    fn scripted(replies: Vec<Reply>, repeat: Option<Reply>) -> Self {
        Self {
            script: Script::new(replies, repeat),
            failing_uploads: Vec::new(),
            hook: None,
            uploads: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            generate_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_failing_upload(mut self, display_name: &str) -> Self {
        self.failing_uploads.push(display_name.to_string());
        self
    }

    /// Runs before each generate call with its 1-based call number.
    pub(crate) fn with_generate_hook(
        mut self,
        hook: impl Fn(usize) + Send + Sync + 'static,
    ) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub(crate) fn uploads(&self) -> Vec<UploadCall> {
        self.uploads.lock().expect("uploads lock").clone()
    }

    pub(crate) fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub(crate) fn generate_count(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }
}

impl MultimodalProvider for FakeGenerator {
    fn name(&self) -> &str {
        "fake-generator"
    }

    fn upload_file(
        &self,
        bytes: &[u8],
        media_type: MediaType,
        display_name: &str,
    ) -> Result<FileHandle> {
        if self.failing_uploads.iter().any(|name| name == display_name) {
            return Err(anyhow!("upload rejected for {display_name}"));
        }
        let mut uploads = self.uploads.lock().expect("uploads lock");
        uploads.push(UploadCall {
            display_name: display_name.to_string(),
            media_type,
            bytes: bytes.len(),
        });
        let index = uploads.len();
        Ok(FileHandle {
            name: format!("files/fake-{index}"),
            uri: format!("fake://files/{index}"),
            mime_type: media_type.mime().to_string(),
        })
    }

    fn generate_content(&self, request: &GenerateRequest) -> Result<GenerateContentResponse> {
        let call = self.generate_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        if let Some(hook) = self.hook.as_ref() {
            hook(call);
        }
        let image_part = |width, height| ContentPart::inline("image/png", png_b64(width, height));
        match self.script.next() {
            Reply::Image { width, height } => Ok(GenerateContentResponse::from_parts(vec![
                image_part(width, height),
            ])),
            Reply::Stall(delay) => {
                thread::sleep(delay);
                Ok(GenerateContentResponse::from_parts(vec![image_part(8, 8)]))
            }
            Reply::Fail(message) => Err(anyhow!(message).context("fake generate request failed")),
            Reply::Malformed => Err(anyhow::Error::new(MalformedResponse::new(
                "fake-generator",
                "candidates is not an array",
            ))),
            Reply::Text(text) => Ok(GenerateContentResponse::from_parts(vec![
                ContentPart::text(text),
            ])),
            Reply::NoCandidates => Ok(GenerateContentResponse::default()),
        }
    }
}
