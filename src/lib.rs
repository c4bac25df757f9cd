//! # edgequake-caption
//!
//! Describe images in natural language with a local BLIP vision-to-text model.
//!
//! ## Why this crate?
//!
//! A chat bot or upload service that wants to say what is in a photo needs
//! more than a model call: the file has to be fetched, checked, decoded and
//! resized before the model may see it, and every way that can go wrong has
//! to come back as something a transport layer can render. This crate does
//! all of that behind one call that returns either a clean sentence or a
//! single typed failure.
//!
//! ## Pipeline Overview
//!
//! ```text
//! file reference
//!  │
//!  ├─ 1. Resolve    GET the bytes (absolute URL or base-relative path)
//!  ├─ 2. Validate   sniff format, allow-list, hard size ceiling, decode
//!  ├─ 3. Normalize  RGB, longest edge ≤ max_edge (Lanczos3)
//!  ├─ 4. Caption    BLIP beam sampling, conditioned on "a photography of"
//!  └─ 5. Format     collapse whitespace, capitalise, terminal punctuation
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_caption::{CaptionConfig, CaptionPipeline, PipelineResult};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CaptionConfig::builder()
//!         .max_edge(1024)
//!         .build()?;
//!     // Downloads Salesforce/blip-image-captioning-base on first use.
//!     let pipeline = CaptionPipeline::new(&config).await?;
//!     match pipeline.run("https://example.org/dog.jpg").await {
//!         PipelineResult::Success(caption) => println!("{caption}"),
//!         PipelineResult::Failure(f) => eprintln!("{}: {}", f.kind, f.kind.user_hint()),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `caption` binary (clap + anyhow + tracing-subscriber + indicatif) |
//! | `cuda`  | off     | CUDA backend for candle |
//! | `metal` | off     | Metal backend for candle |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only deps:
//! ```toml
//! edgequake-caption = { version = "0.1", default-features = false }
//! ```
//!
//! ## Choosing a Model
//!
//! | Model | Vision tower | Notes |
//! |-------|--------------|-------|
//! | `Salesforce/blip-image-captioning-base`  | ViT-B/16 | Default, fast on CPU |
//! | `Salesforce/blip-image-captioning-large` | ViT-L/16 | Better detail, ~2× slower |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod prompts;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    CaptionConfig, CaptionConfigBuilder, DevicePreference, GenerationParameters, ImageFormatTag,
};
pub use error::{CaptionError, Failure, FailureKind};
pub use orchestrator::CaptionPipeline;
pub use output::{ModelInfo, PipelineResult};
pub use pipeline::engine::{BlipCaptioner, Captioner};
pub use pipeline::normalize::NormalizedImage;
pub use pipeline::resolve::RawImageBytes;
