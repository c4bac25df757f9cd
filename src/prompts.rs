//! Conditioning prompt and decoder-prefix construction.
//!
//! BLIP's text decoder can continue a seed phrase instead of starting from
//! scratch. "a photography of" nudges it towards describing the scene rather
//! than naming a single class.

/// Seed text the caption is conditioned on by default.
pub const DEFAULT_CONDITIONING_PROMPT: &str = "a photography of";

/// Special token ids of the BLIP BERT tokenizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    /// Decoder start token (`[DEC]`).
    pub bos: u32,
    /// Encoder start token the tokenizer emits (`[CLS]`).
    pub cls: u32,
    /// End of sequence (`[SEP]`).
    pub sep: u32,
    pub pad: u32,
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self {
            bos: 30522,
            cls: 101,
            sep: 102,
            pad: 0,
        }
    }
}

/// Turn tokenizer output for the prompt into the decoder's input prefix.
///
/// The tokenizer wraps text as `[CLS] … [SEP]`; the decoder expects
/// `[DEC] …` with no terminator, otherwise it would stop immediately.
/// Returns `None` when the prompt produced no usable tokens, which callers
/// treat as "generate unconditionally".
pub fn decoder_prefix(encoded: &[u32], special: &SpecialTokens) -> Option<Vec<u32>> {
    let mut body = encoded;
    if let Some((&first, rest)) = body.split_first() {
        if first == special.cls || first == special.bos {
            body = rest;
        }
    }
    while let Some((&last, rest)) = body.split_last() {
        if last == special.sep || last == special.pad {
            body = rest;
        } else {
            break;
        }
    }
    if body.is_empty() {
        return None;
    }

    let mut prefix = Vec::with_capacity(body.len() + 1);
    prefix.push(special.bos);
    prefix.extend_from_slice(body);
    Some(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cls_replaced_and_sep_dropped() {
        let special = SpecialTokens::default();
        let prefix = decoder_prefix(&[101, 1037, 5855, 1997, 102], &special).unwrap();
        assert_eq!(prefix, vec![30522, 1037, 5855, 1997]);
    }

    #[test]
    fn empty_prompt_yields_no_prefix() {
        let special = SpecialTokens::default();
        assert_eq!(decoder_prefix(&[101, 102], &special), None);
        assert_eq!(decoder_prefix(&[], &special), None);
    }

    #[test]
    fn padding_is_stripped() {
        let special = SpecialTokens::default();
        let prefix = decoder_prefix(&[101, 2000, 102, 0, 0], &special).unwrap();
        assert_eq!(prefix, vec![30522, 2000]);
    }
}
