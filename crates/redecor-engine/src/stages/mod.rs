//! The three provider-backed transforms. Each takes an image (or a path to one) and returns a
//! freshly decoded [`ImageAsset`]; none of them retries or swallows errors.

mod composite;
mod empty_room;
mod refine;

pub use composite::{
    composite_style, parse_composite_response, Composite, FurnitureOutcome, SkipReason,
};
pub use empty_room::empty_room;
pub use refine::refine;

use crate::codec::{decode_base64_image, load_image, ImageAsset};
use crate::error::{PipelineError, PipelineResult};
use crate::providers::EditResponse;

/// Decodes the single image an edit call returns.
pub(crate) fn decode_edited_image(
    provider: &str,
    response: &EditResponse,
) -> PipelineResult<ImageAsset> {
    let b64 = response
        .first_image_b64()
        .map_err(|detail| PipelineError::InvalidProviderResponse {
            provider: provider.to_string(),
            detail,
        })?;
    let bytes = decode_base64_image(b64)?;
    load_image(&bytes)
}
