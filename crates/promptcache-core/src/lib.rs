//! PromptCache Core
//!
//! This crate defines the shared vocabulary of the PromptCache system - the
//! block types exchanged between the gRPC front-end and the cache engine,
//! and the two codecs the storage protocol is built on:
//!
//! 1. **Block-name codec**: a block of 128 tokens maps to a deterministic
//!    blob name (url-safe base64 of the tokens' big-endian 32-bit forms).
//!    Two inference workers holding the same prompt prefix therefore probe
//!    the same object without any coordination.
//! 2. **Sibling-version codec**: the `additionalversions` metadata value on
//!    a canonical blob is a compact JSON array of `{hash, parentHash,
//!    location}` records. Order is significant - it doubles as the FIFO
//!    eviction queue.
//!
//! ## The hash chain
//!
//! ```text
//! block 0            block 1            block 2
//! parent = 0   ◄──   parent = h₀  ◄──   parent = h₁
//! hash   = h₀        hash   = h₁        hash   = h₂
//! ```
//!
//! Each stored block carries its own hash and the hash of the block that
//! precedes it in the token sequence. A lookup walks this chain; the first
//! broken link truncates the cached prefix. Hashes are computed by clients
//! and treated as opaque identities here.

pub mod codec;
pub mod error;
pub mod types;
pub mod versions;

pub use codec::{decode_block_name, encode_block_name};
pub use error::{CodecError, Result};
pub use types::{
    BlockHash, BlockLocation, LookupResult, PromptChunk, Token, BLOCK_TOKENS,
};
pub use versions::{parse_versions, serialize_versions, BlockVersion};
