use tracing::info;

use super::decode_edited_image;
use crate::codec::{ImageAsset, CANONICAL_MEDIA_TYPE};
use crate::error::{PipelineError, PipelineResult};
use crate::providers::{EditRequest, ImageEditingProvider};
use crate::size::OutputSize;

const REFINE_FILE_NAME: &str = "refine-input.webp";

/// Applies one freeform edit to an already generated image. Holds no state from earlier
/// stages, so it can be called on any stored result.
pub fn refine(
    image: &ImageAsset,
    instruction: &str,
    editor: &dyn ImageEditingProvider,
    size: OutputSize,
) -> PipelineResult<ImageAsset> {
    let instruction = instruction.trim();
    if instruction.is_empty() {
        return Err(PipelineError::Config(
            "refinement instruction must not be empty".to_string(),
        ));
    }
    let bytes = image.encode(CANONICAL_MEDIA_TYPE)?;
    info!(
        provider = editor.name(),
        width = image.width(),
        height = image.height(),
        %size,
        "refining image"
    );
    let response = editor
        .edit(&EditRequest {
            file_name: REFINE_FILE_NAME,
            image: &bytes,
            media_type: CANONICAL_MEDIA_TYPE,
            instruction,
            size,
        })
        .map_err(|err| PipelineError::from_provider(editor.name(), "edit", err))?;
    decode_edited_image(editor.name(), &response)
}
