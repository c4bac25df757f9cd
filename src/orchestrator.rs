//! Pipeline orchestrator: reference in, caption or failure out.
//!
//! [`CaptionPipeline`] composes the stages strictly in order. The first
//! stage that fails short-circuits the rest and its [`Failure`] becomes the
//! result. There are no partial results.
//!
//! ## Concurrency
//!
//! One pipeline instance is shared by every concurrent run. Fetching is
//! async; validation, normalisation and inference are CPU-bound and move to
//! the blocking pool. Only inference passes through the admission gate
//! (a semaphore sized by `inference_concurrency`), so downloads and decodes
//! for queued requests keep making progress while the model is busy.

use crate::config::CaptionConfig;
use crate::error::{CaptionError, Failure};
use crate::output::{ModelInfo, PipelineResult};
use crate::pipeline::engine::{BlipCaptioner, Captioner};
use crate::pipeline::normalize::{normalize, NormalizedImage};
use crate::pipeline::postprocess::clean_caption;
use crate::pipeline::resolve::{RawImageBytes, Resolver};
use crate::pipeline::validate::{validate, ValidationLimits};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// The captioning pipeline. Cheap to clone; clones share the engine and the
/// inference gate.
#[derive(Clone)]
pub struct CaptionPipeline {
    resolver: Resolver,
    limits: ValidationLimits,
    max_edge: u32,
    captioner: Arc<dyn Captioner>,
    inference_gate: Arc<Semaphore>,
}

impl std::fmt::Debug for CaptionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptionPipeline")
            .field("limits", &self.limits)
            .field("max_edge", &self.max_edge)
            .field("model", &self.captioner.info())
            .finish()
    }
}

impl CaptionPipeline {
    /// Build the pipeline, loading the caption model unless `config`
    /// already carries an engine.
    ///
    /// # Errors
    /// Any error here is fatal: the model could not be loaded or the
    /// configuration is unusable, and no request may be served.
    pub async fn new(config: &CaptionConfig) -> Result<Self, CaptionError> {
        let resolver = Resolver::new(config)?;

        let captioner: Arc<dyn Captioner> = match &config.captioner {
            Some(c) => Arc::clone(c),
            None => Arc::new(BlipCaptioner::load(config).await?),
        };

        let info = captioner.info();
        info!(
            "Caption engine: {} ({}, {} {}), beams={}, max_length={}, prompt={:?}",
            info.model_id,
            info.variant,
            info.device,
            info.dtype,
            info.num_beams,
            info.max_length,
            info.conditioning_prompt
        );

        Ok(Self {
            resolver,
            limits: ValidationLimits::from_config(config),
            max_edge: config.max_edge,
            captioner,
            inference_gate: Arc::new(Semaphore::new(config.inference_concurrency.max(1))),
        })
    }

    /// Description of the loaded engine.
    pub fn model_info(&self) -> ModelInfo {
        self.captioner.info()
    }

    /// Caption the image behind a file reference (absolute URL or path
    /// relative to the fetch base endpoint).
    pub async fn run(&self, reference: &str) -> PipelineResult {
        let start = Instant::now();
        let shown = self.resolver.redact(reference);
        info!("Captioning {}", shown);

        let result = match self.resolver.fetch(reference).await {
            Ok(raw) => self.caption_raw(raw).await,
            Err(failure) => Err(failure),
        };
        finish(&shown, start, result)
    }

    /// Caption bytes already in memory. Enters the pipeline at validation.
    pub async fn run_bytes(&self, bytes: impl Into<Vec<u8>>) -> PipelineResult {
        self.run_raw(RawImageBytes::undeclared(bytes.into())).await
    }

    /// Like [`run_bytes`](Self::run_bytes), keeping a declared format for
    /// diagnostics.
    pub async fn run_raw(&self, raw: RawImageBytes) -> PipelineResult {
        let start = Instant::now();
        let shown = format!("<{} bytes>", raw.len());
        info!("Captioning {}", shown);
        let result = self.caption_raw(raw).await;
        finish(&shown, start, result)
    }

    async fn caption_raw(&self, raw: RawImageBytes) -> Result<String, Failure> {
        // ── Step 1: Validate + normalise (blocking) ──────────────────────────
        let prep_start = Instant::now();
        let limits = self.limits.clone();
        let max_edge = self.max_edge;
        let image = tokio::task::spawn_blocking(move || {
            let decoded = validate(&raw, &limits)?;
            Ok::<_, Failure>(normalize(decoded, max_edge))
        })
        .await
        .map_err(|e| Failure::invalid_image(format!("corrupt or unreadable: decoder task failed: {e}")))??;
        debug!(
            "Prepared {}x{} image in {}ms",
            image.width(),
            image.height(),
            prep_start.elapsed().as_millis()
        );

        // ── Step 2: Inference behind the admission gate ──────────────────────
        let raw_caption = self.infer(image).await?;

        // ── Step 3: Format ───────────────────────────────────────────────────
        let caption = clean_caption(&raw_caption);
        if caption.is_empty() {
            return Err(Failure::inference("model produced an empty caption"));
        }
        Ok(caption)
    }

    async fn infer(&self, image: NormalizedImage) -> Result<String, Failure> {
        let wait_start = Instant::now();
        let permit = Arc::clone(&self.inference_gate)
            .acquire_owned()
            .await
            .map_err(|_| Failure::inference("inference gate closed"))?;
        debug!(
            "Inference slot acquired after {}ms",
            wait_start.elapsed().as_millis()
        );

        let infer_start = Instant::now();
        let captioner = Arc::clone(&self.captioner);
        let raw_caption = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            captioner.caption(&image)
        })
        .await
        .map_err(|e| Failure::inference(format!("inference task failed: {e}")))??;
        debug!("Inference took {}ms", infer_start.elapsed().as_millis());
        Ok(raw_caption)
    }
}

fn finish(shown: &str, start: Instant, result: Result<String, Failure>) -> PipelineResult {
    let elapsed = start.elapsed().as_millis();
    match &result {
        Ok(caption) => info!("Captioned {} in {}ms: {}", shown, elapsed, caption),
        Err(failure) => warn!("Captioning {} failed after {}ms: {}", shown, elapsed, failure),
    }
    result.into()
}
