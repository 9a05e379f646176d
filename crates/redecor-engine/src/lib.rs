//! Room redesign pipeline: empty the room, composite a style (and optional furniture) onto
//! it, optionally refine, repeated for each requested variant.

pub mod codec;
pub mod error;
pub mod outputs;
pub mod pipeline;
pub mod prompts;
pub mod providers;
pub mod size;
pub mod stages;

#[cfg(test)]
pub(crate) mod testing;

pub use codec::{
    decode_base64_image, detect_media_type, detect_media_type_bytes, load_image, load_image_file,
    ImageAsset, MediaType, CANONICAL_MEDIA_TYPE,
};
pub use error::{error_chain_text, PipelineError, PipelineResult};
pub use outputs::write_run_outputs;
pub use pipeline::{
    run_design_pipeline, CancelToken, DesignPipeline, PipelineOptions, PipelineRun, Variant,
    DEFAULT_GENERATE_TIMEOUT,
};
pub use prompts::{StyleBrief, StyleDirective, DEFAULT_EMPTY_ROOM_PROMPT};
pub use providers::{
    DryrunEditor, DryrunGenerator, FileHandle, FileUploader, GeminiClient, GeminiConfig,
    ImageEditingProvider, MultimodalProvider, OpenAiConfig, OpenAiImageEditor, RetryPolicy,
};
pub use size::OutputSize;
pub use stages::{composite_style, empty_room, refine, Composite, FurnitureOutcome, SkipReason};
