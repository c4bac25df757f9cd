//! Post-processing: turn raw decoder text into a presentable sentence.
//!
//! The tokenizer's decode leaves artefacts that are harmless to the model
//! but look wrong to a reader: lowercase starts, no final punctuation,
//! doubled spaces around merged word pieces. The rules here are cheap,
//! deterministic and idempotent, so `clean_caption(clean_caption(s))`
//! always equals `clean_caption(s)`.
//!
//! ## Rule Order
//!
//! Whitespace is collapsed before capitalising so "first character" means
//! the first non-blank one. Only Unicode whitespace is touched; other
//! characters from the decoder pass through unchanged.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply all cleanup rules to a raw caption. Never fails.
///
/// Rules (applied in order):
/// 1. Collapse whitespace runs to single spaces and trim
/// 2. Uppercase the first character
/// 3. End with `.` unless already ending in `.`, `!` or `?`
///
/// Whitespace-only input yields the empty string.
pub fn clean_caption(raw: &str) -> String {
    let s = collapse_whitespace(raw);
    if s.is_empty() {
        return s;
    }
    let s = capitalise_first(&s);
    ensure_terminal_punctuation(s)
}

// ── Rule 1: Collapse whitespace ─────────────────────────────────────────────

static RE_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

fn collapse_whitespace(input: &str) -> String {
    RE_WHITESPACE.replace_all(input.trim(), " ").into_owned()
}

// ── Rule 2: Capitalise ──────────────────────────────────────────────────────

fn capitalise_first(input: &str) -> String {
    let mut chars = input.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

// ── Rule 3: Terminal punctuation ────────────────────────────────────────────

fn ensure_terminal_punctuation(mut input: String) -> String {
    if !input.ends_with(['.', '!', '?']) {
        input.push('.');
    }
    input
}
