use std::fs;
use std::path::Path;

use tracing::info;

use super::decode_edited_image;
use crate::codec::{detect_media_type, ImageAsset};
use crate::error::{PipelineError, PipelineResult};
use crate::prompts::DEFAULT_EMPTY_ROOM_PROMPT;
use crate::providers::{EditRequest, ImageEditingProvider};
use crate::size::OutputSize;

/// Turns a furnished-room photo into an empty-room photo.
///
/// The source is classified before anything is sent, so a missing or unsupported file never
/// costs a provider call. `prompt` replaces the default removal instruction when non-blank.
pub fn empty_room(
    source: &Path,
    editor: &dyn ImageEditingProvider,
    prompt: Option<&str>,
    size: OutputSize,
) -> PipelineResult<ImageAsset> {
    if !source.is_file() {
        return Err(PipelineError::SourceNotFound(source.to_path_buf()));
    }
    let media_type = detect_media_type(source)?;
    let bytes = fs::read(source).map_err(|err| PipelineError::Io {
        path: source.to_path_buf(),
        source: err,
    })?;
    let file_name = source
        .file_name()
        .and_then(|value| value.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("source.{}", media_type.extension()));
    let instruction = prompt
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_EMPTY_ROOM_PROMPT);

    info!(
        provider = editor.name(),
        source = %source.display(),
        media_type = media_type.mime(),
        %size,
        "emptying room"
    );
    let response = editor
        .edit(&EditRequest {
            file_name: &file_name,
            image: &bytes,
            media_type,
            instruction,
            size,
        })
        .map_err(|err| PipelineError::from_provider(editor.name(), "edit", err))?;
    decode_edited_image(editor.name(), &response)
}
