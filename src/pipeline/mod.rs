//! Pipeline stages for image captioning.
//!
//! Each submodule implements exactly one transformation step.
//! Keeping stages separate makes each independently testable and lets us
//! swap implementations (e.g. inject a different caption engine) without
//! touching other stages.
//!
//! ## Data Flow
//!
//! ```text
//! reference ──▶ resolve ──▶ validate ──▶ normalize ──▶ engine ──▶ postprocess
//! (URL/path)    (HTTP GET)  (sniff+decode) (RGB, resize) (BLIP)    (cleanup)
//! ```
//!
//! 1. [`resolve`]   — fetch the raw bytes; the only stage with network I/O
//! 2. [`validate`]  — sniff the format, enforce the allow-list and the hard
//!    size ceiling, then decode
//! 3. [`normalize`] — convert to RGB and shrink to the soft edge threshold
//! 4. [`engine`]    — run the caption model; [`encode`] builds its pixel
//!    tensor and [`decoding`] drives token generation
//! 5. [`postprocess`] — deterministic text cleanup
//!
//! Stages 2–4 are CPU-bound and run under `spawn_blocking`.

pub mod decoding;
pub mod encode;
pub mod engine;
pub mod normalize;
pub mod postprocess;
pub mod resolve;
pub mod validate;
