use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::SecondsFormat;
use redecor_contracts::runs::summary::{write_summary, RunSummary, VariantSummary};
use serde_json::{json, Map, Value};
use tracing::info;

use crate::codec::CANONICAL_MEDIA_TYPE;
use crate::pipeline::PipelineRun;

pub const SUMMARY_FILE: &str = "summary.json";

/// Persists a finished run under `out_dir` and writes its `summary.json`.
///
/// Images are stored in the canonical format. A variant without a refinement gets the
/// same image under both its composite and final names.
pub fn write_run_outputs(run: &PipelineRun, out_dir: &Path) -> Result<RunSummary> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;
    let ext = CANONICAL_MEDIA_TYPE.extension();

    let empty_room_name = format!("empty-room.{ext}");
    run.empty_room
        .save(&out_dir.join(&empty_room_name))
        .context("failed to write empty room image")?;

    let mut variants = Vec::with_capacity(run.variants.len());
    for variant in &run.variants {
        let composite_name = format!("variant-{:02}-composite.{ext}", variant.index);
        let final_name = format!("variant-{:02}-final.{ext}", variant.index);
        variant
            .composite
            .save(&out_dir.join(&composite_name))
            .with_context(|| format!("failed to write variant {} composite", variant.index))?;
        variant
            .final_image()
            .save(&out_dir.join(&final_name))
            .with_context(|| format!("failed to write variant {} final image", variant.index))?;
        variants.push(VariantSummary {
            index: variant.index,
            composite_path: composite_name,
            final_path: final_name,
            refined: variant.refined.is_some(),
            furniture_uploaded: variant.furniture_uploaded() as u64,
        });
    }

    let summary = RunSummary {
        run_id: run.run_id.clone(),
        started_at: run
            .started_at
            .to_rfc3339_opts(SecondsFormat::Micros, false),
        finished_at: run
            .finished_at
            .to_rfc3339_opts(SecondsFormat::Micros, false),
        source: run.source.display().to_string(),
        status: run.status(),
        variants_requested: run.requested_variants,
        variants_completed: run.variants.len() as u32,
        empty_room_path: Some(empty_room_name),
        variants,
        errors: run.errors.clone(),
        warnings: run.warnings.clone(),
    };
    let extra = summary_extra(run);
    let summary_path = out_dir.join(SUMMARY_FILE);
    write_summary(&summary_path, &summary, Some(&extra))?;
    info!(
        out_dir = %out_dir.display(),
        variants = summary.variants_completed,
        "run outputs written"
    );
    Ok(summary)
}

fn summary_extra(run: &PipelineRun) -> Map<String, Value> {
    let (width, height) = run.empty_room.dimensions();
    let payload = json!({
        "empty_room_restored": run.empty_room_restored,
        "empty_room_dimensions": [width, height],
    });
    match payload {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
