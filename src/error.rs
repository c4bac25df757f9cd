//! Error types for the edgequake-caption library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`CaptionError`] — **Fatal**: the pipeline cannot be built at all
//!   (invalid configuration, model weights missing, tokenizer unreadable,
//!   requested device absent). Returned as `Err(CaptionError)` from
//!   [`crate::CaptionPipeline::new`]; a process that gets one must not serve
//!   requests.
//!
//! * [`Failure`] — **Per request**: one image could not be described (bad
//!   download, corrupt file, backend error) but the pipeline is fine and the
//!   next request may succeed. Carried inside [`crate::PipelineResult`] so no
//!   raw backend error ever crosses the pipeline boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned while constructing the caption pipeline.
#[derive(Debug, Error)]
pub enum CaptionError {
    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Model errors ──────────────────────────────────────────────────────
    /// Model files could not be fetched from the Hugging Face Hub.
    #[error("Failed to download '{file}' for model '{model}': {detail}\nCheck your internet connection or set HF_TOKEN for gated repos.")]
    ModelDownload {
        model: String,
        file: String,
        detail: String,
    },

    /// A required model file is missing from a local model directory.
    #[error("Model file not found: '{path}'\nThe model directory must contain config.json, tokenizer.json and model.safetensors.")]
    ModelFileNotFound { path: PathBuf },

    /// Weights were present but could not be loaded into the model graph.
    #[error("Failed to load model '{model}': {detail}")]
    ModelLoad { model: String, detail: String },

    /// `tokenizer.json` could not be parsed.
    #[error("Failed to load tokenizer from '{path}': {detail}")]
    TokenizerLoad { path: PathBuf, detail: String },

    /// The requested compute device is not available in this build or host.
    #[error("Compute device '{device}' is unavailable: {detail}")]
    DeviceUnavailable { device: String, detail: String },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// The closed set of per-request failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network error, timeout, or non-2xx status while fetching the image.
    AcquisitionError,
    /// Bytes are corrupt, truncated, or not an image at all.
    InvalidImage,
    /// A recognised image format that is not in the allow-list.
    UnsupportedFormat,
    /// Longer edge exceeds the hard ceiling.
    ImageTooLarge,
    /// The engine was handed inputs without pixel features.
    InferenceInputError,
    /// The numeric backend failed during generation or decoding.
    InferenceError,
}

impl FailureKind {
    /// Whether resubmitting the same request may succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::AcquisitionError | FailureKind::InferenceError)
    }

    /// Short guidance a transport layer can show next to its generic error message.
    pub fn user_hint(self) -> &'static str {
        match self {
            FailureKind::AcquisitionError => "The image could not be downloaded. Please try again.",
            FailureKind::InvalidImage => "The file could not be read as an image. Please resend it.",
            FailureKind::UnsupportedFormat => "Please send a JPG, PNG, BMP or WebP image.",
            FailureKind::ImageTooLarge => "The image is too large. Please send a smaller version.",
            FailureKind::InferenceInputError | FailureKind::InferenceError => {
                "The image could not be described. Please try again later."
            }
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::AcquisitionError => "acquisition error",
            FailureKind::InvalidImage => "invalid image",
            FailureKind::UnsupportedFormat => "unsupported format",
            FailureKind::ImageTooLarge => "image too large",
            FailureKind::InferenceInputError => "inference input error",
            FailureKind::InferenceError => "inference error",
        };
        f.write_str(s)
    }
}

/// A per-request failure: which stage class failed and a human-readable detail.
///
/// Stored in [`crate::PipelineResult::Failure`]. The detail is meant for logs;
/// end users should see [`FailureKind::user_hint`] instead.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {detail}")]
pub struct Failure {
    pub kind: FailureKind,
    pub detail: String,
}

impl Failure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn acquisition(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::AcquisitionError, detail)
    }

    pub fn invalid_image(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidImage, detail)
    }

    pub fn inference(detail: impl fmt::Display) -> Self {
        Self::new(FailureKind::InferenceError, detail.to_string())
    }
}
