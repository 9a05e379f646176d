//! Offline providers that answer with solid-colour images, for `--dryrun` runs and demos.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use image::{DynamicImage, Rgb, RgbImage};
use sha2::{Digest, Sha256};

use super::{
    ContentPart, EditRequest, EditResponse, FileHandle, GenerateContentResponse, GenerateRequest,
    ImageEditingProvider, MultimodalProvider,
};
use crate::codec::{ImageAsset, MediaType};

const FALLBACK_DIMENSIONS: (u32, u32) = (1024, 1024);

#[derive(Debug, Default)]
pub struct DryrunEditor;

impl ImageEditingProvider for DryrunEditor {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn edit(&self, request: &EditRequest<'_>) -> Result<EditResponse> {
        let (width, height) = request.size.dimensions_or(FALLBACK_DIMENSIONS);
        let png = solid_png(width, height, request.instruction)?;
        Ok(EditResponse::from_b64(BASE64.encode(png)))
    }
}

#[derive(Debug)]
pub struct DryrunGenerator {
    dimensions: (u32, u32),
    uploads: AtomicU64,
}

impl DryrunGenerator {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            dimensions: (width.max(1), height.max(1)),
            uploads: AtomicU64::new(0),
        }
    }

    pub fn upload_count(&self) -> u64 {
        self.uploads.load(Ordering::SeqCst)
    }
}

impl Default for DryrunGenerator {
    fn default() -> Self {
        Self::new(FALLBACK_DIMENSIONS.0, FALLBACK_DIMENSIONS.1)
    }
}

impl MultimodalProvider for DryrunGenerator {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn upload_file(
        &self,
        _bytes: &[u8],
        media_type: MediaType,
        _display_name: &str,
    ) -> Result<FileHandle> {
        let index = self.uploads.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(FileHandle {
            name: format!("files/dryrun-{index}"),
            uri: format!("dryrun://files/{index}"),
            mime_type: media_type.mime().to_string(),
        })
    }

    fn generate_content(&self, request: &GenerateRequest) -> Result<GenerateContentResponse> {
        let (width, height) = self.dimensions;
        let png = solid_png(width, height, &request.instruction)?;
        Ok(GenerateContentResponse::from_parts(vec![
            ContentPart::text(format!(
                "dryrun composite using {} reference file(s)",
                request.files.len()
            )),
            ContentPart::inline(MediaType::Png.mime(), BASE64.encode(png)),
        ]))
    }
}

fn solid_png(width: u32, height: u32, prompt: &str) -> Result<Vec<u8>> {
    let (r, g, b) = color_from_prompt(prompt);
    let canvas = RgbImage::from_pixel(width, height, Rgb([r, g, b]));
    let asset = ImageAsset::new(DynamicImage::ImageRgb8(canvas), MediaType::Png);
    Ok(asset.encode(MediaType::Png)?)
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let digest = Sha256::digest(prompt.as_bytes());
    (digest[0], digest[1], digest[2])
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{color_from_prompt, DryrunEditor, DryrunGenerator};
    use crate::codec::{decode_base64_image, load_image, MediaType};
    use crate::providers::{EditRequest, GenerateRequest, ImageEditingProvider, MultimodalProvider};
    use crate::size::OutputSize;

    #[test]
    fn dryrun_editor_honours_requested_size() -> anyhow::Result<()> {
        let response = DryrunEditor.edit(&EditRequest {
            file_name: "room.png",
            image: b"ignored",
            media_type: MediaType::Png,
            instruction: "empty the room",
            size: OutputSize::Exact {
                width: 64,
                height: 32,
            },
        })?;
        let bytes = decode_base64_image(response.first_image_b64().map_err(anyhow::Error::msg)?)?;
        assert_eq!(load_image(&bytes)?.dimensions(), (64, 32));
        Ok(())
    }

    #[test]
    fn dryrun_generator_numbers_uploads_and_returns_inline_image() -> anyhow::Result<()> {
        let generator = DryrunGenerator::new(16, 16);
        let first = generator.upload_file(b"a", MediaType::Webp, "base")?;
        let second = generator.upload_file(b"b", MediaType::Png, "sofa")?;
        assert_eq!(first.uri, "dryrun://files/1");
        assert_eq!(second.uri, "dryrun://files/2");
        assert_eq!(second.mime_type, "image/png");
        assert_eq!(generator.upload_count(), 2);

        let response = generator.generate_content(&GenerateRequest {
            instruction: "style".to_string(),
            files: vec![first, second],
            timeout: Duration::from_secs(1),
        })?;
        let parts = response.candidates[0]
            .content
            .as_ref()
            .map(|content| content.parts.clone())
            .unwrap_or_default();
        assert_eq!(parts.len(), 2);
        assert!(parts[0].text.as_deref().unwrap_or("").contains("2 reference"));
        assert!(parts[1].inline_data.is_some());
        Ok(())
    }

    #[test]
    fn prompt_colour_is_stable() {
        assert_eq!(color_from_prompt("same"), color_from_prompt("same"));
        assert_ne!(color_from_prompt("one"), color_from_prompt("two"));
    }
}
