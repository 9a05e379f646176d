//! Image payload helpers: media type detection, base64 decoding, full in-memory decoding,
//! and encoding to the canonical inter-stage format (WebP).

use std::fmt;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

/// Format used for every inter-stage hand-off and every multimodal upload.
pub const CANONICAL_MEDIA_TYPE: MediaType = MediaType::Webp;

const SNIFF_BYTES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Jpeg,
    Png,
    Webp,
}

impl MediaType {
    pub const ALL: [MediaType; 3] = [MediaType::Jpeg, MediaType::Png, MediaType::Webp];

    pub fn mime(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Webp => "image/webp",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Webp => "webp",
        }
    }

    pub fn image_format(self) -> ImageFormat {
        match self {
            Self::Jpeg => ImageFormat::Jpeg,
            Self::Png => ImageFormat::Png,
            Self::Webp => ImageFormat::WebP,
        }
    }

    pub fn from_image_format(format: ImageFormat) -> Option<Self> {
        match format {
            ImageFormat::Jpeg => Some(Self::Jpeg),
            ImageFormat::Png => Some(Self::Png),
            ImageFormat::WebP => Some(Self::Webp),
            _ => None,
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" | "jpe" | "jfif" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "webp" => Some(Self::Webp),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|value| value.to_str())
            .and_then(Self::from_extension)
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime())
    }
}

/// Classifies an image file.
///
/// Magic bytes win when the file is readable and its signature is recognized; a known but
/// unsupported signature (GIF, BMP, ...) is rejected even behind a `.png` name. Otherwise
/// the extension decides.
pub fn detect_media_type(path: &Path) -> PipelineResult<MediaType> {
    let subject = path.display().to_string();
    if let Some(head) = read_head(path, SNIFF_BYTES) {
        if let Ok(format) = image::guess_format(&head) {
            return MediaType::from_image_format(format).ok_or_else(|| {
                PipelineError::UnsupportedMediaType {
                    subject,
                    detected: format.to_mime_type().to_string(),
                }
            });
        }
    }

    MediaType::from_path(path).ok_or_else(|| PipelineError::UnsupportedMediaType {
        subject,
        detected: path
            .extension()
            .and_then(|value| value.to_str())
            .map(|ext| format!(".{ext}"))
            .unwrap_or_else(|| "unknown".to_string()),
    })
}

/// Classifies an in-memory payload by its signature alone.
pub fn detect_media_type_bytes(bytes: &[u8]) -> PipelineResult<MediaType> {
    let format = image::guess_format(bytes).map_err(|_| PipelineError::UnsupportedMediaType {
        subject: "image payload".to_string(),
        detected: "unknown".to_string(),
    })?;
    MediaType::from_image_format(format).ok_or_else(|| PipelineError::UnsupportedMediaType {
        subject: "image payload".to_string(),
        detected: format.to_mime_type().to_string(),
    })
}

fn read_head(path: &Path, max: usize) -> Option<Vec<u8>> {
    let mut file = File::open(path).ok()?;
    let mut head = Vec::with_capacity(max);
    file.by_ref().take(max as u64).read_to_end(&mut head).ok()?;
    if head.is_empty() {
        return None;
    }
    Some(head)
}

/// Decodes a provider base64 payload. Accepts `data:` URLs and line-wrapped input.
pub fn decode_base64_image(text: &str) -> PipelineResult<Vec<u8>> {
    let trimmed = text.trim();
    let body = match trimmed.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(',')
            .map(|(_, payload)| payload)
            .unwrap_or(rest),
        None => trimmed,
    };
    let compact: String = body.chars().filter(|ch| !ch.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(PipelineError::decode(
            "base64 image payload",
            "payload is empty".to_string(),
        ));
    }
    BASE64
        .decode(compact.as_bytes())
        .map_err(|err| PipelineError::decode("base64 image payload", err))
}

/// A fully decoded raster image and the encoding it arrived in.
#[derive(Debug, Clone)]
pub struct ImageAsset {
    image: DynamicImage,
    source: MediaType,
}

impl ImageAsset {
    pub fn new(image: DynamicImage, source: MediaType) -> Self {
        Self { image, source }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.image.width(), self.image.height())
    }

    pub fn source_media_type(&self) -> MediaType {
        self.source
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn encode(&self, media_type: MediaType) -> PipelineResult<Vec<u8>> {
        // WebP only takes 8-bit RGB(A) and JPEG has no alpha channel.
        let converted;
        let target = match media_type {
            MediaType::Webp => {
                converted = DynamicImage::ImageRgba8(self.image.to_rgba8());
                &converted
            }
            MediaType::Jpeg => {
                converted = DynamicImage::ImageRgb8(self.image.to_rgb8());
                &converted
            }
            MediaType::Png => &self.image,
        };
        let mut buffer = Cursor::new(Vec::new());
        target
            .write_to(&mut buffer, media_type.image_format())
            .map_err(|err| PipelineError::encode(format!("image as {media_type}"), err))?;
        Ok(buffer.into_inner())
    }

    pub fn encode_canonical(&self) -> PipelineResult<Vec<u8>> {
        self.encode(CANONICAL_MEDIA_TYPE)
    }

    /// Writes the image in the format named by the path's extension (canonical otherwise).
    pub fn save(&self, path: &Path) -> PipelineResult<MediaType> {
        let media_type = MediaType::from_path(path).unwrap_or(CANONICAL_MEDIA_TYPE);
        let bytes = self.encode(media_type)?;
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| PipelineError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, bytes).map_err(|source| PipelineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(media_type)
    }
}

/// Decodes raw bytes into a materialized image. Only JPEG, PNG and WebP are accepted.
pub fn load_image(bytes: &[u8]) -> PipelineResult<ImageAsset> {
    let format = image::guess_format(bytes)
        .map_err(|err| PipelineError::decode("image bytes (unrecognized signature)", err))?;
    let Some(media_type) = MediaType::from_image_format(format) else {
        return Err(PipelineError::decode(
            "image bytes",
            format!("{} is not a supported image format", format.to_mime_type()),
        ));
    };
    let image = image::load_from_memory_with_format(bytes, format)
        .map_err(|err| PipelineError::decode(format!("{media_type} image"), err))?;
    Ok(ImageAsset::new(image, media_type))
}

pub fn load_image_file(path: &Path) -> PipelineResult<ImageAsset> {
    if !path.exists() {
        return Err(PipelineError::SourceNotFound(path.to_path_buf()));
    }
    detect_media_type(path)?;
    let bytes = std::fs::read(path).map_err(|source| PipelineError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    load_image(&bytes)
}
