//! Token estimation
//!
//! The upstream reports no usage, so counts are a flat `chars / 3` estimate.
//! Characters, not bytes, so multi-byte text is not overcounted.

pub fn estimate_tokens(text: &str) -> u32 {
    tokens_for_chars(text.chars().count())
}

pub fn tokens_for_chars(chars: usize) -> u32 {
    u32::try_from(chars / 3).unwrap_or(u32::MAX)
}
