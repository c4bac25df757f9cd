//! Configuration types for the caption pipeline.
//!
//! All pipeline behaviour is controlled through [`CaptionConfig`], built via
//! its [`CaptionConfigBuilder`]. The config is fixed per deployment: nothing in
//! it is mutated per request, so one instance is shared by every concurrent run.
//!
//! # Design choice: builder over constructor
//! Most callers only care about the model and the fetch endpoint. The builder
//! lets them set those and rely on the documented defaults for the rest.

use crate::error::CaptionError;
use crate::pipeline::engine::Captioner;
use crate::prompts::DEFAULT_CONDITIONING_PROMPT;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Default model repository on the Hugging Face Hub.
pub const DEFAULT_MODEL_ID: &str = "Salesforce/blip-image-captioning-base";

/// Default base endpoint for relative file references. `{token}` is replaced
/// by [`CaptionConfig::fetch_token`].
pub const DEFAULT_FETCH_BASE_URL: &str = "https://api.telegram.org/file/bot{token}";

/// Ratio between the hard reject ceiling and the soft resize threshold.
pub const HARD_EDGE_FACTOR: u32 = 4;

/// Configuration for the caption pipeline.
///
/// Built via [`CaptionConfig::builder()`] or using [`CaptionConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_caption::CaptionConfig;
///
/// let config = CaptionConfig::builder()
///     .max_edge(1024)
///     .num_beams(3)
///     .fetch_token("123456:ABC")
///     .build()
///     .unwrap();
/// assert_eq!(config.hard_edge(), 4096);
/// ```
#[derive(Clone)]
pub struct CaptionConfig {
    /// Hugging Face model repository. Default: `Salesforce/blip-image-captioning-base`.
    pub model_id: String,

    /// Repository revision (branch, tag or commit). Default: `main`.
    pub revision: String,

    /// Load model files from this directory instead of the Hub.
    pub model_dir: Option<PathBuf>,

    /// Hub token for gated or private repositories.
    pub hf_token: Option<String>,

    /// Compute device selection. Default: [`DevicePreference::Auto`].
    pub device: DevicePreference,

    /// Decoding parameters shared by conditional and unconditional generation.
    pub generation: GenerationParameters,

    /// Seed text the caption is conditioned on. `None` forces unconditional
    /// generation. Default: `"a photography of"`.
    pub conditioning_prompt: Option<String>,

    /// Seed for the sampling RNG. `None` seeds from the OS.
    pub seed: Option<u64>,

    /// Soft resize threshold for the longest edge, in pixels. Default: 5120.
    ///
    /// Anything larger is downscaled by the normalizer; anything larger than
    /// [`hard_edge`](Self::hard_edge) is rejected outright by the validator.
    pub max_edge: u32,

    /// Formats the validator accepts. Default: JPEG, PNG, BMP, WEBP.
    pub supported_formats: Vec<ImageFormatTag>,

    /// Base endpoint joined with relative file references.
    pub fetch_base_url: Option<String>,

    /// Credential substituted for `{token}` in the base endpoint.
    pub fetch_token: Option<String>,

    /// Timeout for a single image download, in seconds. Default: 30.
    pub fetch_timeout_secs: u64,

    /// How many inference calls may run at the same time. Default: 1.
    ///
    /// The BLIP decoder keeps a mutable KV cache, so the built-in engine is
    /// only safe one call at a time. Fetch, validation and normalisation are
    /// never gated.
    pub inference_concurrency: usize,

    /// Pre-constructed engine. Takes precedence over loading BLIP from `model_id`.
    pub captioner: Option<Arc<dyn Captioner>>,
}

impl Default for CaptionConfig {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            revision: "main".to_string(),
            model_dir: None,
            hf_token: None,
            device: DevicePreference::default(),
            generation: GenerationParameters::default(),
            conditioning_prompt: Some(DEFAULT_CONDITIONING_PROMPT.to_string()),
            seed: None,
            max_edge: 5120,
            supported_formats: ImageFormatTag::ALL.to_vec(),
            fetch_base_url: Some(DEFAULT_FETCH_BASE_URL.to_string()),
            fetch_token: None,
            fetch_timeout_secs: 30,
            inference_concurrency: 1,
            captioner: None,
        }
    }
}

impl fmt::Debug for CaptionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptionConfig")
            .field("model_id", &self.model_id)
            .field("revision", &self.revision)
            .field("model_dir", &self.model_dir)
            .field("hf_token", &self.hf_token.as_ref().map(|_| "***"))
            .field("device", &self.device)
            .field("generation", &self.generation)
            .field("conditioning_prompt", &self.conditioning_prompt)
            .field("seed", &self.seed)
            .field("max_edge", &self.max_edge)
            .field("supported_formats", &self.supported_formats)
            .field("fetch_base_url", &self.fetch_base_url)
            .field("fetch_token", &self.fetch_token.as_ref().map(|_| "***"))
            .field("fetch_timeout_secs", &self.fetch_timeout_secs)
            .field("inference_concurrency", &self.inference_concurrency)
            .field("captioner", &self.captioner.as_ref().map(|_| "<dyn Captioner>"))
            .finish()
    }
}

impl CaptionConfig {
    /// Create a new builder for `CaptionConfig`.
    pub fn builder() -> CaptionConfigBuilder {
        CaptionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Hard reject ceiling for the longest edge: `4 × max_edge`.
    pub fn hard_edge(&self) -> u32 {
        self.max_edge.saturating_mul(HARD_EDGE_FACTOR)
    }
}

/// Builder for [`CaptionConfig`].
#[derive(Debug)]
pub struct CaptionConfigBuilder {
    config: CaptionConfig,
}

impl CaptionConfigBuilder {
    pub fn model_id(mut self, id: impl Into<String>) -> Self {
        self.config.model_id = id.into();
        self
    }

    pub fn revision(mut self, rev: impl Into<String>) -> Self {
        self.config.revision = rev.into();
        self
    }

    pub fn model_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.model_dir = Some(dir.into());
        self
    }

    pub fn hf_token(mut self, token: impl Into<String>) -> Self {
        self.config.hf_token = Some(token.into());
        self
    }

    pub fn device(mut self, device: DevicePreference) -> Self {
        self.config.device = device;
        self
    }

    pub fn generation(mut self, params: GenerationParameters) -> Self {
        self.config.generation = params;
        self
    }

    pub fn max_length(mut self, n: usize) -> Self {
        self.config.generation.max_length = n.max(1);
        self
    }

    pub fn num_beams(mut self, n: usize) -> Self {
        self.config.generation.num_beams = n.max(1);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.generation.temperature = t.clamp(0.01, 2.0);
        self
    }

    pub fn top_p(mut self, p: f32) -> Self {
        self.config.generation.top_p = p.clamp(0.01, 1.0);
        self
    }

    pub fn repetition_penalty(mut self, p: f32) -> Self {
        self.config.generation.repetition_penalty = p;
        self
    }

    pub fn length_penalty(mut self, p: f32) -> Self {
        self.config.generation.length_penalty = p;
        self
    }

    pub fn early_stopping(mut self, v: bool) -> Self {
        self.config.generation.early_stopping = v;
        self
    }

    pub fn do_sample(mut self, v: bool) -> Self {
        self.config.generation.do_sample = v;
        self
    }

    pub fn conditioning_prompt(mut self, prompt: Option<String>) -> Self {
        self.config.conditioning_prompt = prompt;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    pub fn max_edge(mut self, px: u32) -> Self {
        self.config.max_edge = px;
        self
    }

    pub fn supported_formats(mut self, formats: Vec<ImageFormatTag>) -> Self {
        self.config.supported_formats = formats;
        self
    }

    pub fn fetch_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.fetch_base_url = Some(url.into());
        self
    }

    pub fn fetch_token(mut self, token: impl Into<String>) -> Self {
        self.config.fetch_token = Some(token.into());
        self
    }

    pub fn fetch_timeout_secs(mut self, secs: u64) -> Self {
        self.config.fetch_timeout_secs = secs.max(1);
        self
    }

    pub fn inference_concurrency(mut self, n: usize) -> Self {
        self.config.inference_concurrency = n.max(1);
        self
    }

    pub fn captioner(mut self, captioner: Arc<dyn Captioner>) -> Self {
        self.config.captioner = Some(captioner);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<CaptionConfig, CaptionError> {
        let c = &self.config;
        if c.max_edge == 0 {
            return Err(CaptionError::InvalidConfig(
                "max_edge must be ≥ 1".into(),
            ));
        }
        if c.supported_formats.is_empty() {
            return Err(CaptionError::InvalidConfig(
                "At least one supported image format is required".into(),
            ));
        }
        if c.model_id.trim().is_empty() && c.model_dir.is_none() && c.captioner.is_none() {
            return Err(CaptionError::InvalidConfig(
                "A model id, a model directory or a captioner is required".into(),
            ));
        }
        c.generation.validate()?;
        Ok(self.config)
    }
}

// ── Generation parameters ────────────────────────────────────────────────

/// Decoding parameters. Fixed per deployment; never mutated per request.
///
/// The defaults (5-beam sampling, nucleus cutoff 0.9, strong repetition
/// penalty) favour longer descriptive captions over terse labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParameters {
    /// Maximum sequence length in tokens, conditioning prefix included. Default: 100.
    pub max_length: usize,
    /// Number of beams kept per step. Default: 5.
    pub num_beams: usize,
    /// Sampling temperature. Default: 1.0.
    pub temperature: f32,
    /// Nucleus-sampling cutoff. Default: 0.9.
    pub top_p: f32,
    /// Penalty applied to tokens already present in a beam. Default: 1.5.
    pub repetition_penalty: f32,
    /// Exponent on the generated length when ranking finished hypotheses. Default: 1.0.
    pub length_penalty: f32,
    /// Stop as soon as `num_beams` hypotheses are finished. Default: true.
    pub early_stopping: bool,
    /// Sample candidates instead of taking the highest-scoring ones. Default: true.
    pub do_sample: bool,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            max_length: 100,
            num_beams: 5,
            temperature: 1.0,
            top_p: 0.9,
            repetition_penalty: 1.5,
            length_penalty: 1.0,
            early_stopping: true,
            do_sample: true,
        }
    }
}

impl GenerationParameters {
    fn validate(&self) -> Result<(), CaptionError> {
        if self.max_length == 0 {
            return Err(CaptionError::InvalidConfig("max_length must be ≥ 1".into()));
        }
        if self.num_beams == 0 {
            return Err(CaptionError::InvalidConfig("num_beams must be ≥ 1".into()));
        }
        if !(self.temperature > 0.0) {
            return Err(CaptionError::InvalidConfig(format!(
                "temperature must be > 0, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(CaptionError::InvalidConfig(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if !(self.repetition_penalty > 0.0) {
            return Err(CaptionError::InvalidConfig(format!(
                "repetition_penalty must be > 0, got {}",
                self.repetition_penalty
            )));
        }
        Ok(())
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Image formats the pipeline knows how to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormatTag {
    Jpeg,
    Png,
    Bmp,
    Webp,
}

impl ImageFormatTag {
    pub const ALL: [ImageFormatTag; 4] = [
        ImageFormatTag::Jpeg,
        ImageFormatTag::Png,
        ImageFormatTag::Bmp,
        ImageFormatTag::Webp,
    ];

    /// Map a file extension (with or without the leading dot) to a tag.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(ImageFormatTag::Jpeg),
            "png" => Some(ImageFormatTag::Png),
            "bmp" => Some(ImageFormatTag::Bmp),
            "webp" => Some(ImageFormatTag::Webp),
            _ => None,
        }
    }

    /// Map a sniffed `image` crate format to a tag, if it is one we know.
    pub fn from_image_format(format: image::ImageFormat) -> Option<Self> {
        match format {
            image::ImageFormat::Jpeg => Some(ImageFormatTag::Jpeg),
            image::ImageFormat::Png => Some(ImageFormatTag::Png),
            image::ImageFormat::Bmp => Some(ImageFormatTag::Bmp),
            image::ImageFormat::WebP => Some(ImageFormatTag::Webp),
            _ => None,
        }
    }
}

impl fmt::Display for ImageFormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ImageFormatTag::Jpeg => "JPEG",
            ImageFormatTag::Png => "PNG",
            ImageFormatTag::Bmp => "BMP",
            ImageFormatTag::Webp => "WEBP",
        };
        f.write_str(s)
    }
}

/// Which compute device the caption engine should run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// Probe for CUDA, then Metal, then fall back to the CPU. (default)
    #[default]
    Auto,
    Cpu,
    /// CUDA device ordinal.
    Cuda(usize),
    /// Metal device ordinal.
    Metal(usize),
}

impl std::str::FromStr for DevicePreference {
    type Err = CaptionError;

    /// Parse `auto`, `cpu`, `cuda`, `cuda:1`, `metal`, `metal:0`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        let (name, ordinal) = match s.split_once(':') {
            Some((name, idx)) => {
                let idx = idx.parse::<usize>().map_err(|_| {
                    CaptionError::InvalidConfig(format!("Invalid device ordinal in '{s}'"))
                })?;
                (name.to_string(), idx)
            }
            None => (s.clone(), 0),
        };
        match name.as_str() {
            "auto" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda(ordinal)),
            "metal" => Ok(DevicePreference::Metal(ordinal)),
            other => Err(CaptionError::InvalidConfig(format!(
                "Unknown device '{other}' (expected auto, cpu, cuda[:N] or metal[:N])"
            ))),
        }
    }
}
