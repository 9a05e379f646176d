use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use redecor_contracts::events::EventWriter;
use redecor_engine::{
    detect_media_type, error_chain_text, load_image_file, write_run_outputs, CancelToken,
    DesignPipeline, DryrunEditor, DryrunGenerator, GeminiClient, ImageEditingProvider,
    MultimodalProvider, OpenAiImageEditor, OutputSize, PipelineOptions, StyleBrief,
    StyleDirective,
};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Debug, Parser)]
#[command(name = "redecor", version, about = "AI interior redesign pipeline")]
struct Cli {
    /// Debug-level logging on stderr.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Empty the room, then composite and optionally refine N variants.
    Run(RunArgs),
    /// Apply one edit to a previously generated image.
    Refine(RefineArgs),
    /// Print the detected media type of each path.
    Detect(DetectArgs),
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[arg(long)]
    source: PathBuf,
    #[arg(long)]
    style: Option<String>,
    #[arg(long)]
    design_style: Option<String>,
    #[arg(long)]
    residence_type: Option<String>,
    #[arg(long)]
    space_type: Option<String>,
    #[arg(long)]
    family_type: Option<String>,
    #[arg(long)]
    budget_range: Option<String>,
    #[arg(long = "furniture")]
    furniture: Vec<PathBuf>,
    #[arg(long = "refine")]
    refine: Option<String>,
    #[arg(long)]
    empty_room_prompt: Option<String>,
    #[arg(long, default_value_t = 1)]
    variants: u32,
    #[arg(long, default_value = "1024x1024")]
    size: OutputSize,
    /// Seconds allowed for each compositing call.
    #[arg(long, default_value_t = 180.0)]
    timeout: f64,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    /// Reuse the empty-room image saved by an earlier run with the same inputs.
    #[arg(long)]
    resume: bool,
    /// Cancel after this many seconds, keeping finished variants.
    #[arg(long)]
    max_runtime: Option<f64>,
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Parser)]
struct RefineArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    instruction: String,
    #[arg(long)]
    out: PathBuf,
    #[arg(long, default_value = "1024x1024")]
    size: OutputSize,
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Parser)]
struct DetectArgs {
    #[arg(required = true)]
    paths: Vec<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match run(cli.command) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("redecor error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .compact()
        .init();
}

fn run(command: Command) -> Result<i32> {
    match command {
        Command::Run(args) => run_pipeline(args),
        Command::Refine(args) => run_refine(args),
        Command::Detect(args) => Ok(run_detect(&args.paths)),
    }
}

fn run_pipeline(args: RunArgs) -> Result<i32> {
    let (editor, generator) = build_providers(args.dryrun, args.size)?;
    let options = pipeline_options(&args)?;
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let events = EventWriter::new(events_path, uuid::Uuid::new_v4().to_string());
    let token = CancelToken::new();
    if let Some(seconds) = args.max_runtime {
        arm_deadline(&token, seconds)?;
    }

    let pipeline = DesignPipeline::new(editor, generator)
        .with_events(events)
        .with_cancel_token(token);
    let run = pipeline.run(&args.source, &options)?;
    let summary = write_run_outputs(&run, &args.out)?;

    for variant in &summary.variants {
        println!(
            "variant {}: {}",
            variant.index,
            args.out.join(&variant.final_path).display()
        );
    }
    for warning in &summary.warnings {
        eprintln!("warning: {warning}");
    }
    for error in &summary.errors {
        eprintln!("error: {error}");
    }
    println!(
        "run {} {} ({}/{} variants) -> {}",
        summary.run_id,
        summary.status.as_str(),
        summary.variants_completed,
        summary.variants_requested,
        args.out.join("summary.json").display()
    );
    Ok(if summary.variants.is_empty() { 1 } else { 0 })
}

fn run_refine(args: RefineArgs) -> Result<i32> {
    let (editor, generator) = build_providers(args.dryrun, args.size)?;
    let image = load_image_file(&args.image)?;
    let refined = DesignPipeline::new(editor, generator).refine(
        &image,
        &args.instruction,
        args.size,
    )?;
    let media_type = refined
        .save(&args.out)
        .with_context(|| format!("failed to write {}", args.out.display()))?;
    info!(out = %args.out.display(), media_type = media_type.mime(), "refined image written");
    println!("{}", args.out.display());
    Ok(0)
}

fn run_detect(paths: &[PathBuf]) -> i32 {
    let mut code = 0;
    for path in paths {
        match detect_media_type(path) {
            Ok(media_type) => println!("{}: {}", path.display(), media_type.mime()),
            Err(err) => {
                println!("{}: {}", path.display(), error_chain_text(&err, 200));
                code = 1;
            }
        }
    }
    code
}

fn build_providers(
    dryrun: bool,
    size: OutputSize,
) -> Result<(Arc<dyn ImageEditingProvider>, Arc<dyn MultimodalProvider>)> {
    if dryrun {
        let (width, height) = size.dimensions_or((1024, 1024));
        let editor: Arc<dyn ImageEditingProvider> = Arc::new(DryrunEditor);
        let generator: Arc<dyn MultimodalProvider> =
            Arc::new(DryrunGenerator::new(width, height));
        return Ok((editor, generator));
    }
    let editor: Arc<dyn ImageEditingProvider> =
        Arc::new(OpenAiImageEditor::from_env().context("image editing provider")?);
    let generator: Arc<dyn MultimodalProvider> =
        Arc::new(GeminiClient::from_env().context("multimodal provider")?);
    Ok((editor, generator))
}

fn pipeline_options(args: &RunArgs) -> Result<PipelineOptions> {
    if !args.timeout.is_finite() || args.timeout <= 0.0 {
        bail!("--timeout must be a positive number of seconds");
    }
    let mut options = PipelineOptions::new(resolve_style(args));
    options.refinement = args.refine.clone();
    options.furniture = args.furniture.clone();
    options.empty_room_prompt = args.empty_room_prompt.clone();
    options.size = args.size;
    options.timeout = Duration::from_secs_f64(args.timeout);
    options.variants = args.variants;
    if args.resume {
        options.checkpoint_dir = Some(checkpoint_dir(&args.out));
    }
    Ok(options)
}

/// Free-text style first, followed by any brief fields.
fn resolve_style(args: &RunArgs) -> StyleDirective {
    let brief = StyleBrief {
        design_style: args.design_style.clone(),
        residence_type: args.residence_type.clone(),
        space_type: args.space_type.clone(),
        family_type: args.family_type.clone(),
        budget_range: args.budget_range.clone(),
    };
    let style = args
        .style
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty());
    match style {
        Some(text) if brief.is_empty() => StyleDirective::new(text),
        Some(text) => StyleDirective::new(format!("{text}\n{}", brief.to_directive())),
        None => brief.to_directive(),
    }
}

fn checkpoint_dir(out: &Path) -> PathBuf {
    out.join("checkpoint")
}

fn arm_deadline(token: &CancelToken, seconds: f64) -> Result<()> {
    if !seconds.is_finite() || seconds <= 0.0 {
        bail!("--max-runtime must be a positive number of seconds");
    }
    let token = token.clone();
    thread::Builder::new()
        .name("redecor-deadline".to_string())
        .spawn(move || {
            thread::sleep(Duration::from_secs_f64(seconds));
            if !token.is_cancelled() {
                warn!(seconds, "max runtime reached; cancelling run");
                token.cancel();
            }
        })
        .context("deadline thread spawn failed")?;
    Ok(())
}
