use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use redecor_contracts::events::{
    EventPayload, EventWriter, CHECKPOINT_RESTORED, FURNITURE_SKIPPED, RUN_CANCELLED,
    RUN_FINISHED, RUN_STARTED, STAGE_COMPLETED, STAGE_STARTED, VARIANT_COMPLETED, VARIANT_FAILED,
};
use redecor_contracts::runs::checkpoint::{CheckpointEntry, CheckpointStore};
use redecor_contracts::runs::summary::RunStatus;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::codec::{load_image_file, ImageAsset};
use crate::error::{error_chain_text, PipelineError, PipelineResult};
use crate::prompts::{StyleDirective, DEFAULT_EMPTY_ROOM_PROMPT};
use crate::providers::{ImageEditingProvider, MultimodalProvider};
use crate::size::OutputSize;
use crate::stages::{self, FurnitureOutcome};

pub const DEFAULT_GENERATE_TIMEOUT: Duration = Duration::from_secs(180);
const EMPTY_ROOM_CHECKPOINT_KEY: &str = "empty_room";
const EMPTY_ROOM_CHECKPOINT_FILE: &str = "empty-room.webp";
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);
const ERROR_TEXT_LIMIT: usize = 600;

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub style: StyleDirective,
    pub refinement: Option<String>,
    pub furniture: Vec<PathBuf>,
    /// Replaces the default furniture-removal instruction.
    pub empty_room_prompt: Option<String>,
    pub size: OutputSize,
    /// Bound on each compositing call.
    pub timeout: Duration,
    /// Requested variant count; values below 1 run one variant.
    pub variants: u32,
    /// Reuse and save the empty-room image here.
    pub checkpoint_dir: Option<PathBuf>,
}

impl PipelineOptions {
    pub fn new(style: impl Into<StyleDirective>) -> Self {
        Self {
            style: style.into(),
            refinement: None,
            furniture: Vec::new(),
            empty_room_prompt: None,
            size: OutputSize::default(),
            timeout: DEFAULT_GENERATE_TIMEOUT,
            variants: 1,
            checkpoint_dir: None,
        }
    }

    pub fn variant_count(&self) -> u32 {
        self.variants.max(1)
    }

    fn refinement(&self) -> Option<&str> {
        self.refinement
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    fn empty_room_prompt(&self) -> &str {
        self.empty_room_prompt
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_EMPTY_ROOM_PROMPT)
    }
}

/// One finished branch: the composite and, when a refinement ran, its edit.
#[derive(Debug, Clone)]
pub struct Variant {
    pub index: u32,
    pub composite: ImageAsset,
    pub refined: Option<ImageAsset>,
    pub furniture: Vec<FurnitureOutcome>,
}

impl Variant {
    pub fn final_image(&self) -> &ImageAsset {
        self.refined.as_ref().unwrap_or(&self.composite)
    }

    pub fn furniture_uploaded(&self) -> usize {
        self.furniture
            .iter()
            .filter(|outcome| outcome.handle().is_some())
            .count()
    }
}

#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub run_id: String,
    pub source: PathBuf,
    pub empty_room: Arc<ImageAsset>,
    pub empty_room_restored: bool,
    pub variants: Vec<Variant>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub requested_variants: u32,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn status(&self) -> RunStatus {
        if self.cancelled {
            RunStatus::Cancelled
        } else if self.errors.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::Partial
        }
    }

    /// The image a caller shows first: the first variant's final image.
    pub fn preview(&self) -> Option<&ImageAsset> {
        self.variants.first().map(Variant::final_image)
    }
}

/// Sequences the stages for one source photo.
///
/// Stage 1 runs once and its failure fails the run. Variants then run in index order from
/// the shared empty room; after the first success, a failing variant is recorded and ends
/// the batch, while a failing first variant fails the run.
pub struct DesignPipeline {
    editor: Arc<dyn ImageEditingProvider>,
    generator: Arc<dyn MultimodalProvider>,
    events: Option<EventWriter>,
    cancel: Option<CancelToken>,
    poll_interval: Duration,
}

impl DesignPipeline {
    pub fn new(
        editor: Arc<dyn ImageEditingProvider>,
        generator: Arc<dyn MultimodalProvider>,
    ) -> Self {
        Self {
            editor,
            generator,
            events: None,
            cancel: None,
            poll_interval: CANCEL_POLL_INTERVAL,
        }
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    /// Provider calls run on worker threads while a token is set, so raising it abandons
    /// the call in flight.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn run(&self, source: &Path, options: &PipelineOptions) -> PipelineResult<PipelineRun> {
        let run_id = self
            .events
            .as_ref()
            .map(|events| events.run_id().to_string())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let started_at = Utc::now();
        let requested_variants = options.variant_count();
        info!(
            run_id = %run_id,
            source = %source.display(),
            variants = requested_variants,
            refine = options.refinement().is_some(),
            "design run started"
        );
        self.emit(
            RUN_STARTED,
            json!({
                "source": source.display().to_string(),
                "variants": requested_variants,
                "size": options.size.to_string(),
                "furniture": options.furniture.len(),
                "refine": options.refinement().is_some(),
            }),
        );

        let (empty_room, empty_room_restored) = match self.produce_empty_room(source, options) {
            Ok(result) => result,
            Err(err) => {
                self.emit_run_failure(&err);
                return Err(err);
            }
        };

        let mut run = PipelineRun {
            run_id,
            source: source.to_path_buf(),
            empty_room: Arc::new(empty_room),
            empty_room_restored,
            variants: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            requested_variants,
            cancelled: false,
            started_at,
            finished_at: started_at,
        };

        for index in 1..=requested_variants {
            if self.is_cancelled() {
                self.mark_cancelled(&mut run, index);
                break;
            }
            match self.run_variant(index, &run.empty_room, options) {
                Ok(variant) => self.record_variant(&mut run, variant),
                Err(PipelineError::Cancelled) => {
                    self.mark_cancelled(&mut run, index);
                    break;
                }
                Err(err) if run.variants.is_empty() => {
                    self.emit_variant_failure(index, &err);
                    self.emit_run_failure(&err);
                    return Err(err);
                }
                Err(err) => {
                    let message = format!(
                        "variant {index} failed: {}",
                        error_chain_text(&err, ERROR_TEXT_LIMIT)
                    );
                    warn!(run_id = %run.run_id, "{message}");
                    self.emit_variant_failure(index, &err);
                    run.errors.push(message);
                    break;
                }
            }
        }

        run.finished_at = Utc::now();
        info!(
            run_id = %run.run_id,
            status = run.status().as_str(),
            completed = run.variants.len(),
            requested = requested_variants,
            "design run finished"
        );
        self.emit(
            RUN_FINISHED,
            json!({
                "status": run.status().as_str(),
                "variants_requested": requested_variants,
                "variants_completed": run.variants.len(),
                "errors": run.errors,
                "warnings": run.warnings,
            }),
        );
        Ok(run)
    }

    /// Standalone stage-4 call against any previously produced image.
    pub fn refine(
        &self,
        image: &ImageAsset,
        instruction: &str,
        size: OutputSize,
    ) -> PipelineResult<ImageAsset> {
        let editor = Arc::clone(&self.editor);
        let image = image.clone();
        let instruction = instruction.to_string();
        self.call("refine", move || {
            stages::refine(&image, &instruction, editor.as_ref(), size)
        })
    }

    fn produce_empty_room(
        &self,
        source: &Path,
        options: &PipelineOptions,
    ) -> PipelineResult<(ImageAsset, bool)> {
        if self.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let checkpoint = options
            .checkpoint_dir
            .as_deref()
            .and_then(|dir| empty_room_fingerprint(source, options).map(|print| (dir, print)));
        if let Some((dir, fingerprint)) = checkpoint.as_ref() {
            if let Some(restored) = restore_empty_room(dir, fingerprint) {
                info!(dir = %dir.display(), "empty room restored from checkpoint");
                self.emit(
                    CHECKPOINT_RESTORED,
                    json!({
                        "stage": "empty_room",
                        "fingerprint": fingerprint,
                        "width": restored.width(),
                        "height": restored.height(),
                    }),
                );
                return Ok((restored, true));
            }
        }

        self.emit(STAGE_STARTED, json!({ "stage": "empty_room" }));
        let editor = Arc::clone(&self.editor);
        let path = source.to_path_buf();
        let prompt = options.empty_room_prompt().to_string();
        let size = options.size;
        let empty_room = self.call("empty-room", move || {
            stages::empty_room(&path, editor.as_ref(), Some(prompt.as_str()), size)
        })?;
        self.emit(
            STAGE_COMPLETED,
            json!({
                "stage": "empty_room",
                "width": empty_room.width(),
                "height": empty_room.height(),
            }),
        );

        if let Some((dir, fingerprint)) = checkpoint.as_ref() {
            if let Err(err) = save_empty_room(dir, fingerprint, &empty_room) {
                warn!(dir = %dir.display(), "empty room checkpoint not saved: {err:#}");
            }
        }
        Ok((empty_room, false))
    }

    fn run_variant(
        &self,
        index: u32,
        empty_room: &Arc<ImageAsset>,
        options: &PipelineOptions,
    ) -> PipelineResult<Variant> {
        self.emit(
            STAGE_STARTED,
            json!({ "stage": "composite", "variant": index }),
        );
        let generator = Arc::clone(&self.generator);
        let room = Arc::clone(empty_room);
        let style = options.style.clone();
        let furniture = options.furniture.clone();
        let timeout = options.timeout;
        let composite = self.call("composite", move || {
            stages::composite_style(
                room.as_ref(),
                &style,
                &furniture,
                generator.as_ref(),
                None,
                timeout,
            )
        })?;
        self.emit(
            STAGE_COMPLETED,
            json!({
                "stage": "composite",
                "variant": index,
                "furniture_uploaded": composite.uploaded_count(),
            }),
        );

        let refined = match options.refinement() {
            Some(instruction) => {
                self.emit(STAGE_STARTED, json!({ "stage": "refine", "variant": index }));
                let refined = self.refine(&composite.image, instruction, options.size)?;
                self.emit(STAGE_COMPLETED, json!({ "stage": "refine", "variant": index }));
                Some(refined)
            }
            None => None,
        };

        Ok(Variant {
            index,
            composite: composite.image,
            refined,
            furniture: composite.furniture,
        })
    }

    fn record_variant(&self, run: &mut PipelineRun, variant: Variant) {
        for outcome in &variant.furniture {
            if let Some(warning) = outcome.warning() {
                if let FurnitureOutcome::Skipped { path, reason } = outcome {
                    self.emit(
                        FURNITURE_SKIPPED,
                        json!({
                            "variant": variant.index,
                            "path": path.display().to_string(),
                            "reason": reason.to_string(),
                        }),
                    );
                }
                if !run.warnings.contains(&warning) {
                    run.warnings.push(warning);
                }
            }
        }
        let (width, height) = variant.final_image().dimensions();
        info!(run_id = %run.run_id, variant = variant.index, width, height, "variant completed");
        self.emit(
            VARIANT_COMPLETED,
            json!({
                "variant": variant.index,
                "refined": variant.refined.is_some(),
                "furniture_uploaded": variant.furniture_uploaded(),
                "width": width,
                "height": height,
            }),
        );
        run.variants.push(variant);
    }

    fn mark_cancelled(&self, run: &mut PipelineRun, index: u32) {
        warn!(run_id = %run.run_id, variant = index, "design run cancelled");
        run.cancelled = true;
        run.errors
            .push(format!("run cancelled before variant {index} completed"));
        self.emit(
            RUN_CANCELLED,
            json!({ "variant": index, "variants_completed": run.variants.len() }),
        );
    }

    fn emit_variant_failure(&self, index: u32, err: &PipelineError) {
        self.emit(
            VARIANT_FAILED,
            json!({
                "variant": index,
                "kind": err.kind_name(),
                "error": error_chain_text(err, ERROR_TEXT_LIMIT),
            }),
        );
    }

    fn emit_run_failure(&self, err: &PipelineError) {
        if matches!(err, PipelineError::Cancelled) {
            self.emit(RUN_CANCELLED, json!({ "variants_completed": 0 }));
        }
        self.emit(
            RUN_FINISHED,
            json!({
                "status": "failed",
                "kind": err.kind_name(),
                "error": error_chain_text(err, ERROR_TEXT_LIMIT),
            }),
        );
    }

    fn emit(&self, event_type: &str, payload: Value) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        if let Err(err) = events.emit(event_type, event_payload(payload)) {
            warn!(event_type, "event write failed: {err:#}");
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(CancelToken::is_cancelled)
            .unwrap_or(false)
    }

    /// Runs `job` inline, or on a named worker thread when a cancel token is installed.
    fn call<T, F>(&self, label: &'static str, job: F) -> PipelineResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> PipelineResult<T> + Send + 'static,
    {
        let Some(token) = self.cancel.as_ref() else {
            return job();
        };
        if token.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name(format!("redecor-{label}"))
            .spawn(move || {
                let _ = tx.send(job());
            })
            .map_err(|err| PipelineError::Worker {
                operation: label,
                source: Box::new(err),
            })?;
        loop {
            match rx.recv_timeout(self.poll_interval) {
                Ok(result) => return result,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if token.is_cancelled() {
                        warn!(label, "abandoning in-flight call after cancellation");
                        return Err(PipelineError::Cancelled);
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(PipelineError::Worker {
                        operation: label,
                        source: "worker thread exited without a result".into(),
                    });
                }
            }
        }
    }
}

/// One-shot driver call without events or cancellation.
pub fn run_design_pipeline(
    source: &Path,
    editor: Arc<dyn ImageEditingProvider>,
    generator: Arc<dyn MultimodalProvider>,
    options: &PipelineOptions,
) -> PipelineResult<PipelineRun> {
    DesignPipeline::new(editor, generator).run(source, options)
}

fn event_payload(value: Value) -> EventPayload {
    match value {
        Value::Object(map) => map,
        _ => EventPayload::new(),
    }
}

/// Identifies the stage-1 inputs: source bytes, removal prompt and output size.
fn empty_room_fingerprint(source: &Path, options: &PipelineOptions) -> Option<String> {
    let bytes = fs::read(source).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hasher.update(b"\n");
    hasher.update(options.empty_room_prompt().as_bytes());
    hasher.update(b"\n");
    hasher.update(options.size.to_string().as_bytes());
    Some(hex::encode(hasher.finalize()))
}

fn restore_empty_room(dir: &Path, fingerprint: &str) -> Option<ImageAsset> {
    let mut store = CheckpointStore::in_dir(dir);
    let entry = store.get_matching(EMPTY_ROOM_CHECKPOINT_KEY, fingerprint)?;
    let path = resolve_checkpoint_path(store.dir(), &entry.image_path);
    match load_image_file(&path) {
        Ok(asset) => Some(asset),
        Err(err) => {
            warn!(
                path = %path.display(),
                "ignoring unreadable checkpoint image: {}",
                error_chain_text(&err, ERROR_TEXT_LIMIT)
            );
            None
        }
    }
}

fn save_empty_room(dir: &Path, fingerprint: &str, image: &ImageAsset) -> anyhow::Result<()> {
    image.save(&dir.join(EMPTY_ROOM_CHECKPOINT_FILE))?;
    let mut store = CheckpointStore::in_dir(dir);
    store.set(
        EMPTY_ROOM_CHECKPOINT_KEY,
        &CheckpointEntry {
            fingerprint: fingerprint.to_string(),
            image_path: EMPTY_ROOM_CHECKPOINT_FILE.to_string(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false),
        },
    )
}

fn resolve_checkpoint_path(dir: &Path, image_path: &str) -> PathBuf {
    let path = PathBuf::from(image_path);
    if path.is_absolute() {
        path
    } else {
        dir.join(path)
    }
}
