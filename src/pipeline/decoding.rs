//! Token decoding: beam search, optionally with sampling, over any logits source.
//!
//! The search is independent of the model. The engine plugs in a
//! [`LogitsSource`] that runs the BLIP text decoder; tests plug in scripted
//! sources.
//!
//! ## Step
//!
//! For every running beam:
//! 1. log-softmax the next-token logits
//! 2. apply the repetition penalty to tokens already in the beam
//! 3. add the beam's accumulated score
//!
//! With sampling enabled the accumulated scores are divided by the
//! temperature and nucleus-filtered per beam (at least two tokens survive
//! when more than one beam is kept), and `2 × num_beams` candidates are drawn
//! without replacement from the resulting distribution over all beams.
//! Without sampling the `2 × num_beams` best candidates are taken.
//!
//! Candidates are ranked by score. End-of-sequence candidates ranked within
//! the first `num_beams` become finished hypotheses, scored
//! `sum_logprobs / generated_len^length_penalty`; the rest extend the beams.

use crate::config::GenerationParameters;
use candle_core::{DType, Tensor, D};
use candle_transformers::utils::apply_repeat_penalty;
use rand::Rng;
use std::cmp::Ordering;
use tracing::debug;

/// Produces next-token logits for a batch of sequences.
pub trait LogitsSource {
    /// A `(sequences, vocab)` tensor of logits, one row per sequence in
    /// the same order.
    fn next_logits(&mut self, sequences: &[&[u32]]) -> candle_core::Result<Tensor>;
}

#[derive(Debug, Clone)]
struct Beam {
    tokens: Vec<u32>,
    score: f32,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    beam: usize,
    token: u32,
    score: f32,
    /// Temperature-scaled score; drives sampling weights.
    warped: f32,
}

/// Finished hypotheses, capped at `num_beams`, worst evicted first.
#[derive(Debug)]
struct Hypotheses {
    capacity: usize,
    length_penalty: f32,
    early_stopping: bool,
    prefix_len: usize,
    entries: Vec<(f32, Vec<u32>)>,
}

impl Hypotheses {
    fn new(params: &GenerationParameters, prefix_len: usize) -> Self {
        Self {
            capacity: params.num_beams.max(1),
            length_penalty: params.length_penalty,
            early_stopping: params.early_stopping,
            prefix_len,
            entries: Vec::new(),
        }
    }

    fn normalised(&self, sum_logprobs: f32, generated_len: usize) -> f32 {
        sum_logprobs / (generated_len.max(1) as f32).powf(self.length_penalty)
    }

    fn worst(&self) -> f32 {
        self.entries
            .iter()
            .map(|(s, _)| *s)
            .min_by(|a, b| a.total_cmp(b))
            .unwrap_or(f32::NEG_INFINITY)
    }

    fn add(&mut self, tokens: Vec<u32>, sum_logprobs: f32) {
        let generated = tokens.len().saturating_sub(self.prefix_len);
        let score = self.normalised(sum_logprobs, generated);
        if self.entries.len() < self.capacity || score > self.worst() {
            self.entries.push((score, tokens));
            if self.entries.len() > self.capacity {
                if let Some(idx) = self
                    .entries
                    .iter()
                    .enumerate()
                    .min_by(|(_, a), (_, b)| a.0.total_cmp(&b.0))
                    .map(|(i, _)| i)
                {
                    self.entries.swap_remove(idx);
                }
            }
        }
    }

    fn is_done(&self, best_running: f32, generated_len: usize) -> bool {
        if self.entries.len() < self.capacity {
            return false;
        }
        if self.early_stopping {
            return true;
        }
        self.worst() >= self.normalised(best_running, generated_len)
    }

    fn best(self) -> Option<Vec<u32>> {
        self.entries
            .into_iter()
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, tokens)| tokens)
    }
}

/// Generate a sequence starting from `prefix`. The returned tokens include
/// the prefix and exclude the end-of-sequence token.
pub fn generate<S, R>(
    source: &mut S,
    prefix: Vec<u32>,
    params: &GenerationParameters,
    eos: u32,
    rng: &mut R,
) -> candle_core::Result<Vec<u32>>
where
    S: LogitsSource + ?Sized,
    R: Rng,
{
    let num_beams = params.num_beams.max(1);
    let prefix_len = prefix.len();
    let min_keep = if num_beams > 1 { 2 } else { 1 };

    let mut hyps = Hypotheses::new(params, prefix_len);
    let mut beams = vec![Beam {
        tokens: prefix.clone(),
        score: 0.0,
    }];
    let mut done = false;

    while beams[0].tokens.len() < params.max_length {
        let sequences: Vec<&[u32]> = beams.iter().map(|b| b.tokens.as_slice()).collect();
        let logits = source.next_logits(&sequences)?;
        let (rows, _vocab) = logits.dims2()?;
        if rows != beams.len() {
            return Err(candle_core::Error::Msg(format!(
                "logits source returned {} rows for {} beams",
                rows,
                beams.len()
            )));
        }
        let log_probs = candle_nn::ops::log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;

        let mut pool = Vec::new();
        for (beam_idx, beam) in beams.iter().enumerate() {
            let mut row = log_probs.get(beam_idx)?;
            if params.repetition_penalty != 1.0 {
                row = apply_repeat_penalty(&row, params.repetition_penalty, &beam.tokens)?;
            }
            let scores = row.to_vec1::<f32>()?;

            let keep = if params.do_sample {
                let warped: Vec<f32> = scores
                    .iter()
                    .map(|s| (s + beam.score) / params.temperature)
                    .collect();
                let keep = top_p_mask(&warped, params.top_p, min_keep);
                Some((warped, keep))
            } else {
                None
            };

            for (token, &s) in scores.iter().enumerate() {
                if !s.is_finite() {
                    continue;
                }
                let warped = match &keep {
                    Some((warped, keep)) if keep[token] => warped[token],
                    Some(_) => continue,
                    None => s + beam.score,
                };
                pool.push(Candidate {
                    beam: beam_idx,
                    token: token as u32,
                    score: s + beam.score,
                    warped,
                });
            }
        }

        let k = (2 * num_beams).min(pool.len());
        if k == 0 {
            return Err(candle_core::Error::Msg(
                "no finite candidate scores to decode from".into(),
            ));
        }
        let mut selected = if params.do_sample {
            sample_without_replacement(pool, k, rng)
        } else {
            top_k_by(pool, k, |c| f64::from(c.score))
        };
        selected.sort_by(|a, b| b.score.total_cmp(&a.score));

        let mut next = Vec::with_capacity(num_beams);
        for (rank, cand) in selected.into_iter().enumerate() {
            if cand.token == eos {
                if rank < num_beams {
                    hyps.add(beams[cand.beam].tokens.clone(), cand.score);
                }
                continue;
            }
            let mut tokens = Vec::with_capacity(beams[cand.beam].tokens.len() + 1);
            tokens.extend_from_slice(&beams[cand.beam].tokens);
            tokens.push(cand.token);
            next.push(Beam {
                tokens,
                score: cand.score,
            });
            if next.len() == num_beams {
                break;
            }
        }

        if next.is_empty() {
            done = true;
            beams = next;
            break;
        }

        let generated = next[0].tokens.len() - prefix_len;
        let best_running = next
            .iter()
            .map(|b| b.score)
            .fold(f32::NEG_INFINITY, f32::max);
        beams = next;

        if hyps.is_done(best_running, generated) {
            done = true;
            break;
        }
    }

    if !done {
        for beam in beams {
            hyps.add(beam.tokens, beam.score);
        }
    }

    let best = hyps.best().unwrap_or(prefix);
    debug!(
        "Decoded {} tokens ({} generated)",
        best.len(),
        best.len().saturating_sub(prefix_len)
    );
    Ok(best)
}

/// Smallest set of tokens whose probability mass reaches `top_p`, never
/// fewer than `min_keep`.
pub(crate) fn top_p_mask(scores: &[f32], top_p: f32, min_keep: usize) -> Vec<bool> {
    if top_p >= 1.0 {
        return scores.iter().map(|s| s.is_finite()).collect();
    }
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let probs: Vec<f64> = scores
        .iter()
        .map(|&s| if s.is_finite() { f64::from(s - max).exp() } else { 0.0 })
        .collect();
    let total: f64 = probs.iter().sum();

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));

    let mut keep = vec![false; scores.len()];
    let mut cumulative = 0.0;
    for (kept, &idx) in order.iter().enumerate() {
        if kept >= min_keep && cumulative >= f64::from(top_p) {
            break;
        }
        if probs[idx] == 0.0 && kept >= min_keep {
            break;
        }
        keep[idx] = true;
        cumulative += probs[idx] / total;
    }
    keep
}

/// Weighted sampling without replacement (Efraimidis–Spirakis keys).
fn sample_without_replacement<R: Rng>(pool: Vec<Candidate>, k: usize, rng: &mut R) -> Vec<Candidate> {
    let max = pool
        .iter()
        .map(|c| c.warped)
        .fold(f32::NEG_INFINITY, f32::max);
    let keyed: Vec<(f64, Candidate)> = pool
        .into_iter()
        .map(|c| {
            let weight = f64::from(c.warped - max).exp();
            let u: f64 = rng.random();
            let key = if weight > 0.0 {
                u.ln() / weight
            } else {
                f64::NEG_INFINITY
            };
            (key, c)
        })
        .collect();
    top_k_by(keyed, k, |(key, _)| *key)
        .into_iter()
        .map(|(_, c)| c)
        .collect()
}

fn top_k_by<T, F>(mut items: Vec<T>, k: usize, key: F) -> Vec<T>
where
    F: Fn(&T) -> f64,
{
    let k = k.min(items.len());
    if k == 0 {
        return Vec::new();
    }
    let desc = |a: &T, b: &T| -> Ordering { key(b).total_cmp(&key(a)) };
    if k < items.len() {
        items.select_nth_unstable_by(k - 1, desc);
        items.truncate(k);
    }
    items.sort_by(desc);
    items
}
