//! Values that cross the pipeline boundary.

use crate::error::{Failure, FailureKind};
use serde::{Deserialize, Serialize};

/// Outcome of one pipeline invocation: a formatted caption or a single failure.
///
/// No partial results exist. The transport layer renders `Success` as its
/// reply text and `Failure` as a generic error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum PipelineResult {
    /// Clean caption: single-spaced, capitalised, terminal punctuation.
    Success(String),
    Failure(Failure),
}

impl PipelineResult {
    pub fn is_success(&self) -> bool {
        matches!(self, PipelineResult::Success(_))
    }

    /// The caption, if the run succeeded.
    pub fn caption(&self) -> Option<&str> {
        match self {
            PipelineResult::Success(c) => Some(c),
            PipelineResult::Failure(_) => None,
        }
    }

    /// The failure kind, if the run failed.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            PipelineResult::Success(_) => None,
            PipelineResult::Failure(f) => Some(f.kind),
        }
    }

    pub fn into_result(self) -> Result<String, Failure> {
        self.into()
    }
}

impl From<Result<String, Failure>> for PipelineResult {
    fn from(r: Result<String, Failure>) -> Self {
        match r {
            Ok(caption) => PipelineResult::Success(caption),
            Err(failure) => PipelineResult::Failure(failure),
        }
    }
}

impl From<PipelineResult> for Result<String, Failure> {
    fn from(r: PipelineResult) -> Self {
        match r {
            PipelineResult::Success(caption) => Ok(caption),
            PipelineResult::Failure(failure) => Err(failure),
        }
    }
}

/// Static description of the loaded caption engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_id: String,
    /// Architecture size, e.g. `base` or `large`.
    pub variant: String,
    /// `cpu`, `cuda` or `metal`.
    pub device: String,
    /// Weight precision, e.g. `f32` or `f16`.
    pub dtype: String,
    pub max_length: usize,
    pub num_beams: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub conditioning_prompt: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_serialises_with_status_tag() {
        let r = PipelineResult::Success("A dog on grass.".into());
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["value"], "A dog on grass.");
    }

    #[test]
    fn failure_round_trips_through_result() {
        let f = Failure::new(FailureKind::InvalidImage, "corrupt or unreadable");
        let r: PipelineResult = Err(f.clone()).into();
        assert!(!r.is_success());
        assert_eq!(r.failure_kind(), Some(FailureKind::InvalidImage));
        assert_eq!(r.into_result(), Err(f));
    }
}
