//! Block types shared across the PromptCache crates.

use bytes::Bytes;

/// An inference token. Clients send 64-bit values; only the low 32 bits
/// participate in block naming (see [`crate::codec`]).
pub type Token = i64;

/// A client-computed block identity hash.
pub type BlockHash = u64;

/// Number of tokens per cached block. Partial tails below this size are
/// never stored or probed.
pub const BLOCK_TOKENS: usize = 128;

/// One block of cached KV activation state.
///
/// `hash` and `parent_hash` are declared by the client; the engine treats
/// them as opaque identities and links. `buffer` holds the serialized
/// activations (~1 MiB typical).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptChunk {
    pub hash: BlockHash,
    pub partition_key: String,
    pub parent_hash: BlockHash,
    pub buffer: Bytes,
    pub buffer_size: usize,
    pub tokens: Vec<Token>,
    /// Correlation id for logging; never interpreted.
    pub completion_id: String,
}

impl PromptChunk {
    pub fn new(
        hash: BlockHash,
        partition_key: impl Into<String>,
        parent_hash: BlockHash,
        buffer: Bytes,
        tokens: Vec<Token>,
        completion_id: impl Into<String>,
    ) -> Self {
        let buffer_size = buffer.len();
        Self {
            hash,
            partition_key: partition_key.into(),
            parent_hash,
            buffer,
            buffer_size,
            tokens,
            completion_id: completion_id.into(),
        }
    }

    /// Whether the declared buffer size matches the actual payload length.
    pub fn buffer_coherent(&self) -> bool {
        self.buffer_size == self.buffer.len()
    }
}

/// Where one matched block can be read from: either the canonical
/// token-derived blob name or the GUID of a sibling version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLocation {
    pub hash: BlockHash,
    pub location: String,
}

impl BlockLocation {
    pub fn new(hash: BlockHash, location: impl Into<String>) -> Self {
        Self {
            hash,
            location: location.into(),
        }
    }
}

/// Result of a hash-chain lookup: the longest stored prefix, the hash of
/// its final block, and the exact read location for every matched block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LookupResult {
    pub cached_blocks: usize,
    pub last_hash: BlockHash,
    pub locations: Vec<BlockLocation>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_buffer_coherence() {
        let chunk = PromptChunk::new(7, "pk", 0, Bytes::from(vec![1, 2, 3]), vec![], "run-1");
        assert_eq!(chunk.buffer_size, 3);
        assert!(chunk.buffer_coherent());

        let mut bad = chunk.clone();
        bad.buffer_size = 99;
        assert!(!bad.buffer_coherent());
    }

    #[test]
    fn test_lookup_result_default_is_empty() {
        let result = LookupResult::default();
        assert_eq!(result.cached_blocks, 0);
        assert_eq!(result.last_hash, 0);
        assert!(result.locations.is_empty());
    }
}
