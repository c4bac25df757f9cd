//! Caption engine: image → raw caption text.
//!
//! [`Captioner`] is the seam between the orchestrator and the model. The
//! built-in implementation, [`BlipCaptioner`], runs Salesforce BLIP on candle:
//!
//! ```text
//! NormalizedImage ─► pixel_values (1,3,384,384) ─► vision tower ─► image embeds
//!                                                                  │
//!   prompt ─► [DEC] a photography of ─► beam search over text decoder ─► token ids ─► text
//! ```
//!
//! The model is loaded once at startup. Its text decoder keeps a KV cache
//! that is mutated on every forward pass, so the model sits behind a mutex
//! and inference calls are serialised even if the orchestrator admits more.

use crate::config::{CaptionConfig, DevicePreference, GenerationParameters};
use crate::error::{CaptionError, Failure, FailureKind};
use crate::output::ModelInfo;
use crate::pipeline::decoding::{self, LogitsSource};
use crate::pipeline::encode;
use crate::pipeline::normalize::NormalizedImage;
use crate::prompts::{decoder_prefix, SpecialTokens};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::blip;
use hf_hub::api::tokio::ApiBuilder;
use hf_hub::{Repo, RepoType};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const WEIGHTS_FILE: &str = "model.safetensors";
const HF_TOKEN_ENV_VAR: &str = "HF_TOKEN";

/// Anything that can turn a normalised image into caption text.
///
/// Implementations must be shareable across concurrent pipeline runs. The
/// returned text is raw: the orchestrator formats it afterwards.
pub trait Captioner: Send + Sync {
    /// Generate a caption. Backend errors are reported as
    /// [`FailureKind::InferenceError`].
    fn caption(&self, image: &NormalizedImage) -> Result<String, Failure>;

    /// Static description of the engine.
    fn info(&self) -> ModelInfo;
}

/// Preprocessed inputs for one generation call.
#[derive(Debug, Clone)]
pub struct ModelInputs {
    /// `(1, 3, H, W)` pixel tensor. Required.
    pub pixel_values: Option<Tensor>,
    /// Decoder prefix from the conditioning prompt. `None` means
    /// unconditional generation.
    pub input_ids: Option<Vec<u32>>,
}

/// Pick the generation path for `inputs`.
///
/// Returns the pixel tensor and the decoder prefix: the prompt tokens when
/// present, otherwise just the decoder start token.
pub fn generation_inputs(inputs: ModelInputs, bos: u32) -> Result<(Tensor, Vec<u32>), Failure> {
    let pixel_values = inputs.pixel_values.ok_or_else(|| {
        Failure::new(
            FailureKind::InferenceInputError,
            "pixel_values missing from model inputs",
        )
    })?;
    let prefix = match inputs.input_ids {
        Some(ids) if !ids.is_empty() => {
            debug!("Conditional generation with {} prompt tokens", ids.len());
            ids
        }
        _ => {
            debug!("Unconditional generation");
            vec![bos]
        }
    };
    Ok((pixel_values, prefix))
}

// ── Model variant ────────────────────────────────────────────────────────

/// BLIP captioning checkpoint size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlipVariant {
    /// ViT-B/16 vision tower (`blip-image-captioning-base`).
    Base,
    /// ViT-L/16 vision tower (`blip-image-captioning-large`).
    Large,
}

impl BlipVariant {
    /// Detect the variant from a checkpoint's `config.json`.
    ///
    /// Uses `vision_config.hidden_size` (768 → base, 1024 → large). Configs
    /// that omit it fall back to the model id.
    pub fn detect(config: &serde_json::Value, model_id: &str) -> Self {
        match config
            .get("vision_config")
            .and_then(|v| v.get("hidden_size"))
            .and_then(|v| v.as_u64())
        {
            Some(1024) => BlipVariant::Large,
            Some(_) => BlipVariant::Base,
            None if model_id.contains("large") => BlipVariant::Large,
            None => BlipVariant::Base,
        }
    }

    /// candle model configuration for this variant.
    pub fn config(self) -> blip::Config {
        let mut cfg = blip::Config::image_captioning_large();
        if self == BlipVariant::Base {
            cfg.vision_config.hidden_size = 768;
            cfg.vision_config.intermediate_size = 3072;
            cfg.vision_config.num_hidden_layers = 12;
            cfg.vision_config.num_attention_heads = 12;
            cfg.text_config.encoder_hidden_size = 768;
        }
        cfg
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BlipVariant::Base => "base",
            BlipVariant::Large => "large",
        }
    }
}

// ── Device ───────────────────────────────────────────────────────────────

/// Resolve a device preference. `Auto` probes CUDA, then Metal, then
/// settles on the CPU.
pub fn select_device(pref: DevicePreference) -> Result<Device, CaptionError> {
    let unavailable = |device: String| {
        move |e: candle_core::Error| CaptionError::DeviceUnavailable {
            device,
            detail: e.to_string(),
        }
    };
    match pref {
        DevicePreference::Cpu => Ok(Device::Cpu),
        DevicePreference::Cuda(i) => Device::new_cuda(i).map_err(unavailable(format!("cuda:{i}"))),
        DevicePreference::Metal(i) => {
            Device::new_metal(i).map_err(unavailable(format!("metal:{i}")))
        }
        DevicePreference::Auto => {
            if candle_core::utils::cuda_is_available() {
                match Device::new_cuda(0) {
                    Ok(d) => return Ok(d),
                    Err(e) => warn!("CUDA reported available but failed to open: {}", e),
                }
            }
            if candle_core::utils::metal_is_available() {
                match Device::new_metal(0) {
                    Ok(d) => return Ok(d),
                    Err(e) => warn!("Metal reported available but failed to open: {}", e),
                }
            }
            Ok(Device::Cpu)
        }
    }
}

fn device_name(device: &Device) -> &'static str {
    if device.is_cuda() {
        "cuda"
    } else if device.is_metal() {
        "metal"
    } else {
        "cpu"
    }
}

// ── Model files ──────────────────────────────────────────────────────────

/// Local paths of the three files a BLIP checkpoint needs.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: PathBuf,
}

impl ModelFiles {
    /// Files inside a local model directory. Each must exist.
    pub fn from_dir(dir: &Path) -> Result<Self, CaptionError> {
        let file = |name: &str| {
            let path = dir.join(name);
            if path.is_file() {
                Ok(path)
            } else {
                Err(CaptionError::ModelFileNotFound { path })
            }
        };
        Ok(Self {
            config: file(CONFIG_FILE)?,
            tokenizer: file(TOKENIZER_FILE)?,
            weights: file(WEIGHTS_FILE)?,
        })
    }

    /// Download (or reuse from the local cache) a Hub repository's files.
    pub async fn from_hub(
        model_id: &str,
        revision: &str,
        token: Option<String>,
    ) -> Result<Self, CaptionError> {
        let token = token.or_else(|| std::env::var(HF_TOKEN_ENV_VAR).ok());
        let api = ApiBuilder::new()
            .with_progress(false)
            .with_token(token)
            .build()
            .map_err(|e| CaptionError::ModelDownload {
                model: model_id.to_string(),
                file: "-".to_string(),
                detail: e.to_string(),
            })?;
        let repo = api.repo(Repo::with_revision(
            model_id.to_string(),
            RepoType::Model,
            revision.to_string(),
        ));

        let fetch = |name: &'static str| {
            let repo = &repo;
            async move {
                let path = repo
                    .get(name)
                    .await
                    .map_err(|e| CaptionError::ModelDownload {
                        model: model_id.to_string(),
                        file: name.to_string(),
                        detail: e.to_string(),
                    })?;
                debug!("Model file {} → {}", name, path.display());
                Ok::<_, CaptionError>(path)
            }
        };

        Ok(Self {
            config: fetch(CONFIG_FILE).await?,
            tokenizer: fetch(TOKENIZER_FILE).await?,
            weights: fetch(WEIGHTS_FILE).await?,
        })
    }
}

// ── BLIP captioner ───────────────────────────────────────────────────────

struct BlipState {
    model: blip::BlipForConditionalGeneration,
    rng: StdRng,
}

/// BLIP image captioning on candle.
pub struct BlipCaptioner {
    state: Mutex<BlipState>,
    tokenizer: Tokenizer,
    device: Device,
    dtype: DType,
    image_size: usize,
    special: SpecialTokens,
    prompt_ids: Option<Vec<u32>>,
    params: GenerationParameters,
    info: ModelInfo,
}

impl std::fmt::Debug for BlipCaptioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlipCaptioner").field("info", &self.info).finish()
    }
}

impl BlipCaptioner {
    /// Locate the model files and load the model. Any failure here is fatal:
    /// the pipeline must not start without an engine.
    pub async fn load(config: &CaptionConfig) -> Result<Self, CaptionError> {
        let start = Instant::now();
        let files = match &config.model_dir {
            Some(dir) => {
                info!("Loading caption model from {}", dir.display());
                ModelFiles::from_dir(dir)?
            }
            None => {
                info!(
                    "Fetching caption model {} ({})",
                    config.model_id, config.revision
                );
                ModelFiles::from_hub(&config.model_id, &config.revision, config.hf_token.clone())
                    .await?
            }
        };

        let config = config.clone();
        let captioner = tokio::task::spawn_blocking(move || Self::from_files(&config, &files))
            .await
            .map_err(|e| CaptionError::Internal(format!("Model loading task failed: {e}")))??;

        info!(
            "Caption model ready in {}ms ({} on {})",
            start.elapsed().as_millis(),
            captioner.info.variant,
            captioner.info.device
        );
        Ok(captioner)
    }

    /// Load from files already on disk. Blocking.
    pub fn from_files(config: &CaptionConfig, files: &ModelFiles) -> Result<Self, CaptionError> {
        let model_name = config
            .model_dir
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| config.model_id.clone());
        let load_err = |detail: String| CaptionError::ModelLoad {
            model: model_name.clone(),
            detail,
        };

        let raw = std::fs::read(&files.config)
            .map_err(|e| load_err(format!("cannot read {}: {e}", files.config.display())))?;
        let json: serde_json::Value = serde_json::from_slice(&raw)
            .map_err(|e| load_err(format!("invalid {}: {e}", files.config.display())))?;
        let variant = BlipVariant::detect(&json, &model_name);
        let blip_config = variant.config();

        let device = select_device(config.device)?;
        // The text decoder's causal mask is built in F32, so weights stay F32
        // on every device.
        let dtype = DType::F32;

        let tokenizer =
            Tokenizer::from_file(&files.tokenizer).map_err(|e| CaptionError::TokenizerLoad {
                path: files.tokenizer.clone(),
                detail: e.to_string(),
            })?;

        // SAFETY: the weights file is not modified while it is mapped.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[files.weights.as_path()], dtype, &device)
        }
        .map_err(|e| load_err(e.to_string()))?;
        let model = blip::BlipForConditionalGeneration::new(&blip_config, vb)
            .map_err(|e| load_err(e.to_string()))?;

        let special = SpecialTokens::default();
        let prompt_ids = match config.conditioning_prompt.as_deref() {
            Some(prompt) if !prompt.trim().is_empty() => {
                let encoding = tokenizer.encode(prompt, true).map_err(|e| {
                    CaptionError::TokenizerLoad {
                        path: files.tokenizer.clone(),
                        detail: format!("cannot encode conditioning prompt: {e}"),
                    }
                })?;
                let prefix = decoder_prefix(encoding.get_ids(), &special);
                if prefix.is_none() {
                    warn!("Conditioning prompt produced no tokens; captions will be unconditional");
                }
                prefix
            }
            _ => None,
        };

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let params = config.generation.clone();
        let info = ModelInfo {
            model_id: model_name,
            variant: variant.as_str().to_string(),
            device: device_name(&device).to_string(),
            dtype: format!("{dtype:?}").to_lowercase(),
            max_length: params.max_length,
            num_beams: params.num_beams,
            temperature: params.temperature,
            top_p: params.top_p,
            conditioning_prompt: config.conditioning_prompt.clone(),
        };

        Ok(Self {
            state: Mutex::new(BlipState { model, rng }),
            tokenizer,
            device,
            dtype,
            image_size: blip_config.vision_config.image_size,
            special,
            prompt_ids,
            params,
            info,
        })
    }

    /// Build model inputs for `image`.
    pub fn prepare(&self, image: &NormalizedImage) -> Result<ModelInputs, Failure> {
        let pixel_values = encode::pixel_values(image, self.image_size, &self.device, self.dtype)
            .map_err(Failure::inference)?;
        Ok(ModelInputs {
            pixel_values: Some(pixel_values),
            input_ids: self.prompt_ids.clone(),
        })
    }

    /// Run generation on prepared inputs and decode the best sequence.
    pub fn generate(&self, inputs: ModelInputs) -> Result<String, Failure> {
        let (pixel_values, prefix) = generation_inputs(inputs, self.special.bos)?;

        let mut state = self
            .state
            .lock()
            .map_err(|_| Failure::inference("caption engine state is poisoned"))?;
        let BlipState { model, rng } = &mut *state;

        let result = run_generation(model, rng, &pixel_values, prefix, &self.params, self.special.sep);
        model.reset_kv_cache();
        drop(state);

        let ids = result.map_err(Failure::inference)?;
        self.tokenizer
            .decode(&ids, true)
            .map_err(|e| Failure::inference(format!("failed to decode tokens: {e}")))
    }
}

impl Captioner for BlipCaptioner {
    fn caption(&self, image: &NormalizedImage) -> Result<String, Failure> {
        let start = Instant::now();
        let inputs = self.prepare(image)?;
        let text = self.generate(inputs)?;
        debug!(
            "Generated raw caption in {}ms: {:?}",
            start.elapsed().as_millis(),
            text
        );
        Ok(text)
    }

    fn info(&self) -> ModelInfo {
        self.info.clone()
    }
}

fn run_generation(
    model: &mut blip::BlipForConditionalGeneration,
    rng: &mut StdRng,
    pixel_values: &Tensor,
    prefix: Vec<u32>,
    params: &GenerationParameters,
    eos: u32,
) -> candle_core::Result<Vec<u32>> {
    let image_embeds = model.vision_model().forward(pixel_values)?;
    model.reset_kv_cache();
    let mut source = BlipLogits {
        model,
        image_embeds,
        cached: Vec::new(),
    };
    decoding::generate(&mut source, prefix, params, eos, rng)
}

/// Logits from the BLIP text decoder.
///
/// A single beam that grew by one token since the last call reuses the KV
/// cache and feeds only the new token. Any other shape resets the cache and
/// runs the full batch, since beams are reordered between steps.
struct BlipLogits<'a> {
    model: &'a mut blip::BlipForConditionalGeneration,
    image_embeds: Tensor,
    cached: Vec<u32>,
}

impl LogitsSource for BlipLogits<'_> {
    fn next_logits(&mut self, sequences: &[&[u32]]) -> candle_core::Result<Tensor> {
        let Some(first) = sequences.first() else {
            return Err(candle_core::Error::Msg("no sequences to decode".into()));
        };
        let width = first.len();
        if sequences.iter().any(|s| s.len() != width) {
            return Err(candle_core::Error::Msg(
                "beams must have equal length".into(),
            ));
        }
        let device = self.image_embeds.device().clone();

        let incremental = sequences.len() == 1
            && !self.cached.is_empty()
            && width == self.cached.len() + 1
            && first.starts_with(&self.cached);

        let (input_ids, encoder_states) = if incremental {
            let input = Tensor::new(&first[width - 1..], &device)?.unsqueeze(0)?;
            (input, self.image_embeds.clone())
        } else {
            self.model.reset_kv_cache();
            let flat: Vec<u32> = sequences.iter().flat_map(|s| s.iter().copied()).collect();
            let input = Tensor::from_vec(flat, (sequences.len(), width), &device)?;
            let states = if sequences.len() == 1 {
                self.image_embeds.clone()
            } else {
                self.image_embeds.repeat((sequences.len(), 1, 1))?
            };
            (input, states)
        };

        let logits = self
            .model
            .text_decoder()
            .forward(&input_ids, &encoder_states)?;
        let last = logits.dim(1)? - 1;
        let rows = logits.i((.., last, ..))?.to_dtype(DType::F32)?;

        self.cached = if sequences.len() == 1 {
            first.to_vec()
        } else {
            Vec::new()
        };
        Ok(rows)
    }
}
