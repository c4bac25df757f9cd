//! CLI binary for edgequake-caption.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `CaptionConfig` and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_caption::{
    CaptionConfig, CaptionPipeline, DevicePreference, ImageFormatTag, ModelInfo, PipelineResult,
    RawImageBytes,
};
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::Path;
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

fn spinner(prefix: &'static str, msg: &'static str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS),
    );
    bar.set_prefix(prefix);
    bar.set_message(msg);
    bar.enable_steady_tick(Duration::from_millis(80));
    bar
}

fn progress_bar(total: usize) -> ProgressBar {
    let bar = ProgressBar::new(total as u64);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} images  ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS),
    );
    bar.set_prefix("Captioning");
    bar.enable_steady_tick(Duration::from_millis(80));
    bar
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Caption a local file
  caption photo.jpg

  # Caption a URL
  caption https://upload.wikimedia.org/wikipedia/commons/2/26/YellowLabradorLooking_new.jpg

  # Caption a bot file path (joined to --fetch-base-url with the token)
  CAPTION_FETCH_TOKEN=123456:ABC caption photos/file_42.jpg

  # Several inputs, JSON output
  caption --json a.jpg b.png c.webp > captions.json

  # Reproducible output: deterministic beam search
  caption --greedy --num-beams 3 photo.jpg

  # Larger model, no conditioning prompt
  caption --model Salesforce/blip-image-captioning-large --no-prompt photo.jpg

  # Show what would be loaded
  caption --info

MODELS:
  Salesforce/blip-image-captioning-base   (default)  ViT-B/16, fast on CPU
  Salesforce/blip-image-captioning-large             ViT-L/16, more detail

ENVIRONMENT VARIABLES:
  HF_TOKEN              Hugging Face token for gated or private repositories
  CAPTION_MODEL         Override model ID
  CAPTION_MODEL_DIR     Load config.json / tokenizer.json / model.safetensors from here
  CAPTION_DEVICE        auto, cpu, cuda[:N], metal[:N]
  CAPTION_FETCH_TOKEN   Token substituted into the fetch base URL
  RUST_LOG              Fine-grained log filter (overrides -v / -q)
"#;

/// Describe images in natural language with a local BLIP model.
#[derive(Parser, Debug)]
#[command(
    name = "caption",
    version,
    about = "Describe images in natural language with a local BLIP model",
    long_about = "Caption local image files, URLs, or bot file references with a BLIP \
vision-to-text model running locally via candle. Models are fetched from the Hugging Face Hub \
on first use and cached.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local image paths, HTTP/HTTPS URLs, or paths relative to --fetch-base-url.
    #[arg(required_unless_present = "info")]
    inputs: Vec<String>,

    /// Hugging Face model ID.
    #[arg(long, env = "CAPTION_MODEL", default_value = edgequake_caption::config::DEFAULT_MODEL_ID)]
    model: String,

    /// Model repository revision.
    #[arg(long, env = "CAPTION_REVISION", default_value = "main")]
    revision: String,

    /// Load the model from a local directory instead of the Hub.
    #[arg(long, env = "CAPTION_MODEL_DIR")]
    model_dir: Option<std::path::PathBuf>,

    /// Hugging Face token for gated repositories.
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    hf_token: Option<String>,

    /// Compute device: auto, cpu, cuda[:N], metal[:N].
    #[arg(long, env = "CAPTION_DEVICE", default_value = "auto")]
    device: String,

    /// Maximum caption length in tokens, prompt included.
    #[arg(long, env = "CAPTION_MAX_LENGTH", default_value_t = 100)]
    max_length: usize,

    /// Beams kept per decoding step.
    #[arg(long, env = "CAPTION_NUM_BEAMS", default_value_t = 5)]
    num_beams: usize,

    /// Sampling temperature (0.01–2.0).
    #[arg(long, env = "CAPTION_TEMPERATURE", default_value_t = 1.0)]
    temperature: f32,

    /// Nucleus-sampling cutoff (0.01–1.0).
    #[arg(long, env = "CAPTION_TOP_P", default_value_t = 0.9)]
    top_p: f32,

    /// Penalty for tokens already generated.
    #[arg(long, default_value_t = 1.5)]
    repetition_penalty: f32,

    /// Exponent on caption length when ranking finished beams.
    #[arg(long, default_value_t = 1.0)]
    length_penalty: f32,

    /// Keep searching after num_beams captions have finished.
    #[arg(long)]
    no_early_stopping: bool,

    /// Deterministic beam search instead of beam sampling.
    #[arg(long)]
    greedy: bool,

    /// Seed text the caption continues.
    #[arg(long, env = "CAPTION_PROMPT", conflicts_with = "no_prompt")]
    prompt: Option<String>,

    /// Generate without a conditioning prompt.
    #[arg(long)]
    no_prompt: bool,

    /// Seed for sampling, for reproducible captions.
    #[arg(long, env = "CAPTION_SEED")]
    seed: Option<u64>,

    /// Images with a longer edge are downscaled to this size; 4× this is rejected.
    #[arg(long, env = "CAPTION_MAX_EDGE", default_value_t = 5120)]
    max_edge: u32,

    /// Accepted formats as extensions, comma separated.
    #[arg(long, env = "CAPTION_FORMATS", default_value = ".jpg,.jpeg,.png,.bmp,.webp")]
    formats: String,

    /// Base endpoint for relative references; `{token}` is replaced by --fetch-token.
    #[arg(long, env = "CAPTION_FETCH_BASE_URL", default_value = edgequake_caption::config::DEFAULT_FETCH_BASE_URL)]
    fetch_base_url: String,

    /// Token substituted into the fetch base endpoint.
    #[arg(long, env = "CAPTION_FETCH_TOKEN", hide_env_values = true)]
    fetch_token: Option<String>,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "CAPTION_FETCH_TIMEOUT", default_value_t = 30)]
    fetch_timeout: u64,

    /// Number of inputs processed at the same time.
    #[arg(short, long, env = "CAPTION_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Number of model inference calls allowed at the same time.
    #[arg(long, env = "CAPTION_INFERENCE_CONCURRENCY", default_value_t = 1)]
    inference_concurrency: usize,

    /// Output JSON instead of plain captions.
    #[arg(long, env = "CAPTION_JSON")]
    json: bool,

    /// Print model information and exit.
    #[arg(long)]
    info: bool,

    /// Disable progress display.
    #[arg(long, env = "CAPTION_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "CAPTION_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "CAPTION_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress display is active.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build config + load model ────────────────────────────────────────
    let config = build_config(&cli)?;

    let loading = show_progress.then(|| spinner("Model", "Loading caption model…"));
    let pipeline = CaptionPipeline::new(&config).await;
    if let Some(bar) = loading {
        bar.finish_and_clear();
    }
    let pipeline = pipeline.context("Failed to initialise the caption pipeline")?;

    // ── Info mode ────────────────────────────────────────────────────────
    if cli.info {
        print_info(&pipeline.model_info(), cli.json)?;
        return Ok(ExitCode::SUCCESS);
    }

    // ── Caption inputs ───────────────────────────────────────────────────
    let total = cli.inputs.len();
    let bar = (show_progress && total > 1).then(|| progress_bar(total));
    let start = Instant::now();

    let mut results: Vec<(usize, String, PipelineResult, u128)> =
        stream::iter(cli.inputs.iter().cloned().enumerate())
            .map(|(idx, input)| {
                let pipeline = pipeline.clone();
                let bar = bar.clone();
                async move {
                    let t = Instant::now();
                    let result = caption_input(&pipeline, &input).await;
                    let ms = t.elapsed().as_millis();
                    if let Some(bar) = &bar {
                        bar.println(status_line(&input, &result, ms));
                        bar.inc(1);
                    }
                    (idx, input, result, ms)
                }
            })
            .buffer_unordered(cli.concurrency.max(1))
            .collect()
            .await;
    results.sort_by_key(|(idx, ..)| *idx);

    if let Some(bar) = &bar {
        bar.finish_and_clear();
    }

    let failed = results.iter().filter(|(_, _, r, _)| !r.is_success()).count();

    // ── Output ───────────────────────────────────────────────────────────
    if cli.json {
        let entries: Vec<serde_json::Value> = results
            .iter()
            .map(|(_, input, result, ms)| {
                serde_json::json!({
                    "input": input,
                    "result": result,
                    "duration_ms": ms,
                })
            })
            .collect();
        let out = if entries.len() == 1 {
            serde_json::to_string_pretty(&entries[0])
        } else {
            serde_json::to_string_pretty(&entries)
        }
        .context("Failed to serialise output")?;
        println!("{out}");
    } else {
        for (_, input, result, _) in &results {
            match result {
                PipelineResult::Success(caption) if total == 1 => println!("{caption}"),
                PipelineResult::Success(caption) => println!("{input}\t{caption}"),
                PipelineResult::Failure(f) => {
                    if !cli.quiet || total == 1 {
                        eprintln!("{} {}: {}", red("✗"), input, f);
                        eprintln!("  {}", dim(f.kind.user_hint()));
                    }
                }
            }
        }
    }

    if !cli.quiet && !cli.json && total > 1 {
        let ok = total - failed;
        eprintln!(
            "{} {}/{} images captioned in {}ms",
            if failed == 0 { green("✔") } else { red("✘") },
            bold(&ok.to_string()),
            total,
            start.elapsed().as_millis()
        );
    }

    Ok(if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Local files enter at validation; everything else goes through the resolver.
async fn caption_input(pipeline: &CaptionPipeline, input: &str) -> PipelineResult {
    let path = Path::new(input);
    if !path.is_file() {
        return pipeline.run(input).await;
    }
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let declared_format = path
                .extension()
                .and_then(|e| e.to_str())
                .and_then(ImageFormatTag::from_extension);
            pipeline
                .run_raw(RawImageBytes {
                    bytes,
                    declared_format,
                })
                .await
        }
        Err(e) => PipelineResult::Failure(edgequake_caption::Failure::acquisition(format!(
            "failed to read '{}': {e}",
            path.display()
        ))),
    }
}

fn status_line(input: &str, result: &PipelineResult, ms: u128) -> String {
    let elapsed = dim(&format!("{:.1}s", ms as f64 / 1000.0));
    match result {
        PipelineResult::Success(caption) => {
            format!("  {} {}  {}  {}", green("✓"), input, dim(caption), elapsed)
        }
        PipelineResult::Failure(f) => {
            format!("  {} {}  {}  {}", red("✗"), input, red(&f.kind.to_string()), elapsed)
        }
    }
}

fn print_info(info: &ModelInfo, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(info).context("Failed to serialise model info")?
        );
        return Ok(());
    }
    println!("Model:        {}", info.model_id);
    println!("Variant:      {}", info.variant);
    println!("Device:       {}", info.device);
    println!("Precision:    {}", info.dtype);
    println!("Max length:   {}", info.max_length);
    println!("Beams:        {}", info.num_beams);
    println!("Temperature:  {}", info.temperature);
    println!("Top-p:        {}", info.top_p);
    match &info.conditioning_prompt {
        Some(p) => println!("Prompt:       {p:?}"),
        None => println!("Prompt:       (unconditional)"),
    }
    Ok(())
}

/// Map CLI args to `CaptionConfig`.
fn build_config(cli: &Cli) -> Result<CaptionConfig> {
    let device: DevicePreference = cli.device.parse().context("Invalid --device")?;
    let formats = parse_formats(&cli.formats)?;

    let prompt = if cli.no_prompt {
        None
    } else {
        Some(
            cli.prompt
                .clone()
                .unwrap_or_else(|| edgequake_caption::prompts::DEFAULT_CONDITIONING_PROMPT.to_string()),
        )
    };

    let mut builder = CaptionConfig::builder()
        .model_id(cli.model.clone())
        .revision(cli.revision.clone())
        .device(device)
        .max_length(cli.max_length)
        .num_beams(cli.num_beams)
        .temperature(cli.temperature)
        .top_p(cli.top_p)
        .repetition_penalty(cli.repetition_penalty)
        .length_penalty(cli.length_penalty)
        .early_stopping(!cli.no_early_stopping)
        .do_sample(!cli.greedy)
        .conditioning_prompt(prompt)
        .max_edge(cli.max_edge)
        .supported_formats(formats)
        .fetch_base_url(cli.fetch_base_url.clone())
        .fetch_timeout_secs(cli.fetch_timeout)
        .inference_concurrency(cli.inference_concurrency);

    if let Some(ref dir) = cli.model_dir {
        builder = builder.model_dir(dir.clone());
    }
    if let Some(ref token) = cli.hf_token {
        builder = builder.hf_token(token.clone());
    }
    if let Some(ref token) = cli.fetch_token {
        builder = builder.fetch_token(token.clone());
    }
    if let Some(seed) = cli.seed {
        builder = builder.seed(seed);
    }

    builder.build().context("Invalid configuration")
}

/// Parse `--formats` (".jpg,.png" or "jpeg,png") into format tags.
fn parse_formats(s: &str) -> Result<Vec<ImageFormatTag>> {
    let mut formats = Vec::new();
    for ext in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let tag = ImageFormatTag::from_extension(ext)
            .with_context(|| format!("Unsupported format '{ext}' (expected jpg, png, bmp or webp)"))?;
        if !formats.contains(&tag) {
            formats.push(tag);
        }
    }
    if formats.is_empty() {
        anyhow::bail!("--formats must name at least one format");
    }
    Ok(formats)
}
