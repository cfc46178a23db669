//! Block-name codec.
//!
//! A block's blob name is derived purely from its tokens: each token is
//! truncated to 32 bits, written big-endian, and the concatenated bytes are
//! url-safe base64 encoded without padding. The mapping is deterministic,
//! so every worker that holds the same 128 tokens computes the same name.
//!
//! Decoding zero-extends each 32-bit group back to a `Token`, so the
//! round-trip law `decode(encode(t)) == t` holds for all tokens in the
//! `u32` range - which covers every real tokenizer vocabulary.

use crate::error::{CodecError, Result};
use crate::types::Token;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

/// Encode a token slice into its canonical blob name.
pub fn encode_block_name(tokens: &[Token]) -> String {
    let mut bytes = Vec::with_capacity(tokens.len() * 4);
    for &token in tokens {
        let token = token as u32;
        bytes.extend_from_slice(&token.to_be_bytes());
    }
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decode a canonical blob name back into its tokens.
pub fn decode_block_name(name: &str) -> Result<Vec<Token>> {
    let bytes = URL_SAFE_NO_PAD.decode(name)?;
    if bytes.len() % 4 != 0 {
        return Err(CodecError::TruncatedBlockName(bytes.len()));
    }

    let mut tokens = Vec::with_capacity(bytes.len() / 4);
    for group in bytes.chunks_exact(4) {
        let raw = u32::from_be_bytes([group[0], group[1], group[2], group[3]]);
        tokens.push(raw as Token);
    }
    Ok(tokens)
}
