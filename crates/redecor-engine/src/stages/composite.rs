use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::codec::{
    decode_base64_image, detect_media_type, load_image, ImageAsset, MediaType,
    CANONICAL_MEDIA_TYPE,
};
use crate::error::{error_chain_text, truncate_text, PipelineError, PipelineResult};
use crate::prompts::{composite_instruction, StyleDirective};
use crate::providers::{
    FileHandle, FileUploader, GenerateContentResponse, GenerateRequest, MultimodalProvider,
};

/// Media type assumed for furniture references whose type cannot be classified.
const COERCED_MEDIA_TYPE: MediaType = MediaType::Png;
const BASE_DISPLAY_NAME: &str = "empty-room.webp";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    Missing,
    Unreadable(String),
    UploadFailed(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => f.write_str("file does not exist"),
            Self::Unreadable(detail) => write!(f, "file could not be read: {detail}"),
            Self::UploadFailed(detail) => write!(f, "upload failed: {detail}"),
        }
    }
}

/// What happened to one furniture reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FurnitureOutcome {
    Uploaded {
        path: PathBuf,
        media_type: MediaType,
        /// The reference's own type was unsupported and it was sent as PNG instead.
        coerced: bool,
        handle: FileHandle,
    },
    Skipped {
        path: PathBuf,
        reason: SkipReason,
    },
}

impl FurnitureOutcome {
    pub fn path(&self) -> &Path {
        match self {
            Self::Uploaded { path, .. } | Self::Skipped { path, .. } => path,
        }
    }

    pub fn handle(&self) -> Option<&FileHandle> {
        match self {
            Self::Uploaded { handle, .. } => Some(handle),
            Self::Skipped { .. } => None,
        }
    }

    /// Human-readable warning for a skipped or coerced reference.
    pub fn warning(&self) -> Option<String> {
        match self {
            Self::Skipped { path, reason } => Some(format!(
                "furniture reference {} skipped: {reason}",
                path.display()
            )),
            Self::Uploaded {
                path,
                coerced: true,
                media_type,
                ..
            } => Some(format!(
                "furniture reference {} has an unsupported type; sent as {media_type}",
                path.display()
            )),
            Self::Uploaded { .. } => None,
        }
    }
}

/// Stage-3 output: the composited room and the per-reference upload report.
#[derive(Debug, Clone)]
pub struct Composite {
    pub image: ImageAsset,
    pub furniture: Vec<FurnitureOutcome>,
}

impl Composite {
    pub fn uploaded_count(&self) -> usize {
        self.furniture
            .iter()
            .filter(|outcome| outcome.handle().is_some())
            .count()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.furniture
            .iter()
            .filter_map(FurnitureOutcome::warning)
            .collect()
    }
}

/// Furnishes an empty room in the given style, optionally copying supplied furniture.
///
/// The base image is always re-encoded to the canonical format and uploaded first; its
/// upload failing fails the stage. Furniture references are best effort: missing,
/// unreadable or un-uploadable ones are reported in [`Composite::furniture`] and left out of
/// the request. `uploader` overrides `provider.upload_file` for every upload.
pub fn composite_style(
    empty_room: &ImageAsset,
    directive: &StyleDirective,
    furniture: &[PathBuf],
    provider: &dyn MultimodalProvider,
    uploader: Option<&dyn FileUploader>,
    timeout: Duration,
) -> PipelineResult<Composite> {
    let upload = |bytes: &[u8], media_type: MediaType, name: &str| match uploader {
        Some(custom) => custom.upload(bytes, media_type, name),
        None => provider.upload_file(bytes, media_type, name),
    };

    let base_bytes = empty_room.encode_canonical()?;
    let base = upload(&base_bytes, CANONICAL_MEDIA_TYPE, BASE_DISPLAY_NAME)
        .map_err(|err| PipelineError::from_provider(provider.name(), "upload", err))?;
    debug!(name = %base.name, uri = %base.uri, "uploaded empty room");

    let outcomes: Vec<FurnitureOutcome> = furniture
        .iter()
        .map(|path| upload_reference(path, &upload))
        .collect();
    for warning in outcomes.iter().filter_map(FurnitureOutcome::warning) {
        warn!("{warning}");
    }

    let mut identifiers = Vec::new();
    let mut files = vec![base];
    for outcome in &outcomes {
        if let Some(handle) = outcome.handle() {
            identifiers.push(reference_identifier(outcome.path()));
            files.push(handle.clone());
        }
    }

    let request = GenerateRequest {
        instruction: composite_instruction(directive, &identifiers),
        files,
        timeout,
    };
    info!(
        provider = provider.name(),
        furniture = identifiers.len(),
        skipped = outcomes.len() - identifiers.len(),
        timeout_s = timeout.as_secs_f64(),
        "compositing style"
    );
    let response = provider
        .generate_content(&request)
        .map_err(|err| PipelineError::from_provider(provider.name(), "generate", err))?;
    let image = parse_composite_response(provider.name(), &response)?;
    Ok(Composite {
        image,
        furniture: outcomes,
    })
}

fn upload_reference(
    path: &Path,
    upload: &impl Fn(&[u8], MediaType, &str) -> anyhow::Result<FileHandle>,
) -> FurnitureOutcome {
    let skipped = |reason| FurnitureOutcome::Skipped {
        path: path.to_path_buf(),
        reason,
    };
    if !path.is_file() {
        return skipped(SkipReason::Missing);
    }
    let (media_type, coerced) = match detect_media_type(path) {
        Ok(media_type) => (media_type, false),
        Err(_) => (COERCED_MEDIA_TYPE, true),
    };
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => return skipped(SkipReason::Unreadable(err.to_string())),
    };
    let display_name = reference_identifier(path);
    match upload(&bytes, media_type, &display_name) {
        Ok(handle) => {
            debug!(path = %path.display(), uri = %handle.uri, "uploaded furniture reference");
            FurnitureOutcome::Uploaded {
                path: path.to_path_buf(),
                media_type,
                coerced,
                handle,
            }
        }
        Err(err) => skipped(SkipReason::UploadFailed(error_chain_text(&*err, 300))),
    }
}

fn reference_identifier(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Extracts the composited image from a generateContent response.
///
/// Only the first candidate is read. Its parts are scanned in order and the first inline
/// image wins; text seen before it is kept as diagnostics for [`PipelineError::NoImageReturned`].
pub fn parse_composite_response(
    provider: &str,
    response: &GenerateContentResponse,
) -> PipelineResult<ImageAsset> {
    let Some(candidate) = response.candidates.first() else {
        return Err(PipelineError::EmptyProviderResponse {
            provider: provider.to_string(),
        });
    };
    let mut diagnostics = Vec::new();
    let parts = candidate
        .content
        .as_ref()
        .map(|content| content.parts.as_slice())
        .unwrap_or_default();
    for part in parts {
        if let Some(inline) = part
            .inline_data
            .as_ref()
            .filter(|inline| !inline.data.trim().is_empty())
        {
            let bytes = decode_base64_image(&inline.data)?;
            return load_image(&bytes);
        }
        if let Some(text) = part.text.as_deref().map(str::trim) {
            if !text.is_empty() {
                diagnostics.push(truncate_text(text, 500));
            }
        }
    }
    if diagnostics.is_empty() {
        if let Some(reason) = candidate
            .finish_reason
            .as_deref()
            .filter(|reason| *reason != "STOP")
        {
            diagnostics.push(format!("finish reason {reason}"));
        }
    }
    Err(PipelineError::NoImageReturned {
        provider: provider.to_string(),
        diagnostics,
    })
}
