//! Hash-chain cache engine.
//!
//! One `CacheEngine` is bound to a single (account URL, container) pair
//! and implements the three protocol operations:
//!
//! - **lookup**: probe every block name concurrently, then validate the
//!   parent chain sequentially. The probe is wide, the walk is strict:
//!   the first block with no version extending the chain truncates the
//!   result. When several versions of one block share the expected parent,
//!   the client's declared hash for that position breaks the tie.
//! - **read**: fetch one blob by the exact location a lookup returned.
//! - **write**: establish or extend the version set at a canonical name.
//!
//! ## Write protocol
//!
//! ```text
//! TRY_FIRST ── conditional create ──► done (first writer)
//!     │ conflict
//!     ▼
//! PROBE ── identical (hash,parent) found ──► done (duplicate)
//!     │ new version
//!     ▼
//! UPLOAD_SIBLING (body under fresh GUID)
//!     ▼
//! PATCH ── append to additionalversions, evict FIFO over 60,
//!          set-metadata guarded by etag; stale etag re-probes,
//!          up to 5 attempts total
//! ```
//!
//! Writers never coordinate. The etag precondition on the metadata merge
//! is the only serialization point; everything before it may race freely.
//! Two writers racing on the same identity converge to one retained
//! version (a leftover orphan sibling blob is tolerated); writers with
//! distinct parents both end up reachable through the chain.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};
use uuid::Uuid;

use promptcache_core::{
    encode_block_name, parse_versions, serialize_versions, BlockHash, BlockLocation,
    BlockVersion, LookupResult, PromptChunk, Token, BLOCK_TOKENS,
};

use crate::blob::{BlobMetadata, BlobStore};
use crate::error::{Result, StoreError};

/// Siblings retained per canonical name before FIFO eviction kicks in.
const MAX_SIBLINGS: usize = 60;

/// Total attempts for the etag-guarded metadata merge.
const MAX_PATCH_ATTEMPTS: u32 = 5;

/// Outcome of probing one block during lookup.
struct ProbedBlock {
    found: bool,
    stored_hash: BlockHash,
    stored_parent: BlockHash,
    versions_raw: String,
}

/// The per-(account, container) cache protocol implementation.
pub struct CacheEngine {
    store: Arc<dyn BlobStore>,
    account_url: String,
    container_name: String,
}

impl std::fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEngine")
            .field("account_url", &self.account_url)
            .field("container_name", &self.container_name)
            .finish_non_exhaustive()
    }
}

impl CacheEngine {
    pub fn new(store: Arc<dyn BlobStore>, account_url: &str, container_name: &str) -> Self {
        Self {
            store,
            account_url: account_url.to_string(),
            container_name: container_name.to_string(),
        }
    }

    pub fn account_url(&self) -> &str {
        &self.account_url
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    /// Find the longest stored prefix of `tokens` whose parent chain is
    /// unbroken, returning a read location for each matched block.
    ///
    /// `precomputed_hashes` are the client's declared per-block hashes.
    /// They are carried for observability only - the stored chain links
    /// decide acceptance.
    pub async fn lookup(
        &self,
        _partition_key: &str,
        completion_id: &str,
        tokens: &[Token],
        precomputed_hashes: &[BlockHash],
    ) -> LookupResult {
        let full_blocks = tokens.len() / BLOCK_TOKENS;
        if full_blocks == 0 {
            return LookupResult::default();
        }

        debug!(completion_id, blocks = full_blocks, "Starting chain lookup");

        let names: Vec<String> = (0..full_blocks)
            .map(|i| encode_block_name(&tokens[i * BLOCK_TOKENS..(i + 1) * BLOCK_TOKENS]))
            .collect();

        // Probe every block concurrently; any failure reads as absent.
        let probes = join_all(names.iter().map(|name| self.probe_block(name))).await;

        // Walk the chain sequentially, truncating at the first gap.
        let mut result = LookupResult::default();
        let mut expected_parent: BlockHash = 0;

        for (index, probe) in probes.into_iter().enumerate() {
            if !probe.found {
                debug!(completion_id, block = index, "Block absent, chain ends");
                break;
            }

            let declared = precomputed_hashes.get(index).copied().unwrap_or(0);
            let accepted = match select_version(index, &names[index], &probe, expected_parent, declared)
            {
                Some(accepted) => accepted,
                None => {
                    debug!(
                        completion_id,
                        block = index,
                        expected_parent,
                        stored_parent = probe.stored_parent,
                        declared_hash = declared,
                        "No version extends the chain, chain ends"
                    );
                    break;
                }
            };

            expected_parent = accepted.hash;
            result.last_hash = accepted.hash;
            result.cached_blocks += 1;
            result.locations.push(accepted);
        }

        info!(
            completion_id,
            cached_blocks = result.cached_blocks,
            last_hash = result.last_hash,
            "Lookup complete"
        );
        result
    }

    async fn probe_block(&self, name: &str) -> ProbedBlock {
        match self.store.get_properties(name).await {
            Ok(properties) => ProbedBlock {
                found: true,
                stored_hash: properties.metadata.get_u64("hash"),
                stored_parent: properties.metadata.get_u64("parenthash"),
                versions_raw: properties
                    .metadata
                    .get("additionalversions")
                    .unwrap_or_default()
                    .to_string(),
            },
            // Absence and failure alike truncate the chain at this block.
            Err(e) => {
                if !e.is_not_found() {
                    warn!(blob = name, error = %e, "Probe failed, treating block as absent");
                }
                ProbedBlock {
                    found: false,
                    stored_hash: 0,
                    stored_parent: 0,
                    versions_raw: String::new(),
                }
            }
        }
    }

    /// Download the blob at `location` and rebuild the chunk from its body
    /// and metadata. Tokens are not reconstructed - the caller already
    /// holds them.
    pub async fn read(
        &self,
        location: &str,
        completion_id: &str,
    ) -> Result<(bool, PromptChunk)> {
        match self.store.download(location).await {
            Ok(blob) => {
                let chunk = PromptChunk {
                    hash: blob.metadata.get_u64("hash"),
                    parent_hash: blob.metadata.get_u64("parenthash"),
                    partition_key: blob
                        .metadata
                        .get("partitionkey")
                        .unwrap_or_default()
                        .to_string(),
                    buffer_size: blob.body.len(),
                    buffer: blob.body,
                    ..PromptChunk::default()
                };

                debug!(completion_id, location, bytes = chunk.buffer_size, "Read complete");
                Ok((true, chunk))
            }
            Err(e) if e.is_not_found() => {
                debug!(completion_id, location, "Read miss");
                Ok((false, PromptChunk::default()))
            }
            Err(e) => Err(e),
        }
    }

    /// Store `chunk` under its canonical name, creating a sibling version
    /// when a different identity already owns the name.
    pub async fn write(&self, chunk: &PromptChunk) -> Result<()> {
        if !chunk.buffer_coherent() {
            return Err(StoreError::InvalidChunk(format!(
                "declared buffer size {} does not match payload length {}",
                chunk.buffer_size,
                chunk.buffer.len()
            )));
        }

        let name = encode_block_name(&chunk.tokens);
        let completion_id = chunk.completion_id.as_str();
        debug!(
            completion_id,
            hash = chunk.hash,
            parent_hash = chunk.parent_hash,
            blob = %name,
            "Write starting"
        );

        // TRY_FIRST: claim the canonical name if it is free.
        let metadata = block_metadata(chunk.hash, chunk.parent_hash, &name);
        match self
            .store
            .upload(&name, chunk.buffer.clone(), &metadata, true)
            .await
        {
            Ok(_) => {
                info!(completion_id, blob = %name, "First version stored");
                return Ok(());
            }
            Err(StoreError::Conflict(_)) => {
                debug!(completion_id, blob = %name, "Canonical exists, checking versions");
            }
            Err(e) => return Err(e),
        }

        // PROBE: the name is taken - is our identity already present?
        let properties = self.store.get_properties(&name).await?;
        if let Probe::Duplicate = self.check_duplicates(&properties.metadata, chunk)? {
            info!(completion_id, blob = %name, "Identical version already stored");
            return Ok(());
        }

        // UPLOAD_SIBLING: park the body under a fresh GUID.
        let guid = Uuid::new_v4().to_string();
        let sibling_metadata = block_metadata(chunk.hash, chunk.parent_hash, &guid);
        self.store
            .upload(&guid, chunk.buffer.clone(), &sibling_metadata, false)
            .await?;
        debug!(completion_id, blob = %name, sibling = %guid, "Sibling body uploaded");

        // PATCH: merge the new version into the canonical metadata under
        // etag protection, re-probing after every lost race.
        let mut etag = properties.etag;
        let mut metadata = properties.metadata;

        for attempt in 1..=MAX_PATCH_ATTEMPTS {
            if attempt > 1 {
                let refreshed = self.store.get_properties(&name).await?;
                etag = refreshed.etag;
                metadata = refreshed.metadata;

                // A racing writer may have inserted our identity.
                if let Probe::Duplicate = self.check_duplicates(&metadata, chunk)? {
                    info!(
                        completion_id,
                        blob = %name,
                        orphan = %guid,
                        "Identity merged by concurrent writer, leaving orphan sibling"
                    );
                    return Ok(());
                }
            }

            let mut versions = parse_versions(
                metadata.get("additionalversions").unwrap_or_default(),
            )?;
            versions.push(BlockVersion::new(chunk.hash, chunk.parent_hash, guid.clone()));

            while versions.len() > MAX_SIBLINGS {
                let evicted = versions.remove(0);
                debug!(completion_id, evicted = %evicted.location, "Evicting oldest sibling");
                match self.store.delete(&evicted.location).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        warn!(evicted = %evicted.location, error = %e, "Sibling eviction failed")
                    }
                }
            }

            let mut merged = metadata.clone();
            merged.insert("additionalversions", serialize_versions(&versions));

            match self.store.set_metadata(&name, &merged, &etag).await {
                Ok(_) => {
                    info!(
                        completion_id,
                        blob = %name,
                        sibling = %guid,
                        versions = versions.len(),
                        attempt,
                        "Version list updated"
                    );
                    return Ok(());
                }
                Err(StoreError::PreconditionFailed(_)) => {
                    debug!(completion_id, blob = %name, attempt, "Etag race lost");
                }
                Err(e) => return Err(e),
            }
        }

        Err(StoreError::Fatal(format!(
            "metadata merge for {name} lost {MAX_PATCH_ATTEMPTS} etag races"
        )))
    }

    fn check_duplicates(&self, metadata: &BlobMetadata, chunk: &PromptChunk) -> Result<Probe> {
        if metadata.get_u64("hash") == chunk.hash
            && metadata.get_u64("parenthash") == chunk.parent_hash
        {
            return Ok(Probe::Duplicate);
        }

        let versions = parse_versions(metadata.get("additionalversions").unwrap_or_default())?;
        let duplicate = versions
            .iter()
            .any(|v| v.hash == chunk.hash && v.parent_hash == chunk.parent_hash);
        Ok(if duplicate { Probe::Duplicate } else { Probe::NewVersion })
    }
}

enum Probe {
    Duplicate,
    NewVersion,
}

/// Choose which stored version of block `index` extends the chain.
///
/// Eligible versions are those whose parent hash equals `expected_parent`;
/// the canonical version is additionally always eligible at block 0. When
/// several versions are eligible (siblings can share a parent), the
/// client's declared hash breaks the tie; a declared hash that matches
/// nothing never rejects a block, the selection just falls back to the
/// canonical version and then to the first eligible sibling.
fn select_version(
    index: usize,
    canonical_name: &str,
    probe: &ProbedBlock,
    expected_parent: BlockHash,
    declared_hash: BlockHash,
) -> Option<BlockLocation> {
    let canonical_eligible = index == 0 || probe.stored_parent == expected_parent;

    if canonical_eligible && (declared_hash == 0 || probe.stored_hash == declared_hash) {
        return Some(BlockLocation::new(probe.stored_hash, canonical_name));
    }

    let siblings = if probe.versions_raw.is_empty() || probe.versions_raw == "[]" {
        Vec::new()
    } else {
        match parse_versions(&probe.versions_raw) {
            Ok(versions) => versions,
            Err(e) => {
                warn!(block = index, error = %e, "Unreadable version list on probed blob");
                Vec::new()
            }
        }
    };

    let eligible = |v: &&BlockVersion| v.parent_hash == expected_parent;

    if let Some(version) = siblings
        .iter()
        .filter(eligible)
        .find(|v| v.hash == declared_hash)
    {
        return Some(BlockLocation::new(version.hash, version.location.clone()));
    }

    if canonical_eligible {
        return Some(BlockLocation::new(probe.stored_hash, canonical_name));
    }

    siblings
        .iter()
        .find(eligible)
        .map(|v| BlockLocation::new(v.hash, v.location.clone()))
}

fn block_metadata(hash: BlockHash, parent_hash: BlockHash, location: &str) -> BlobMetadata {
    let mut metadata = BlobMetadata::new();
    metadata.insert("hash", hash.to_string());
    metadata.insert("parenthash", parent_hash.to_string());
    metadata.insert("location", location);
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptcache_core::serialize_versions;

    fn probe(hash: BlockHash, parent: BlockHash, siblings: &[BlockVersion]) -> ProbedBlock {
        ProbedBlock {
            found: true,
            stored_hash: hash,
            stored_parent: parent,
            versions_raw: serialize_versions(siblings),
        }
    }

    #[test]
    fn test_single_version_parent_must_match_past_block_zero() {
        let probed = probe(11, 7, &[]);

        let selected = select_version(1, "name-1", &probed, 7, 11).unwrap();
        assert_eq!(selected, BlockLocation::new(11, "name-1"));

        assert!(select_version(1, "name-1", &probed, 99, 11).is_none());
    }

    #[test]
    fn test_block_zero_canonical_always_eligible() {
        // Stored parent 5 can never equal the initial expected parent 0,
        // but block 0 accepts the canonical version regardless.
        let probed = probe(7, 5, &[]);
        let selected = select_version(0, "name-0", &probed, 0, 0).unwrap();
        assert_eq!(selected.hash, 7);
    }

    #[test]
    fn test_sibling_selected_when_canonical_parent_differs() {
        let siblings = vec![BlockVersion::new(19, 7, "guid-b")];
        let probed = probe(11, 99, &siblings);

        let selected = select_version(1, "name-1", &probed, 7, 0).unwrap();
        assert_eq!(selected, BlockLocation::new(19, "guid-b"));
    }

    #[test]
    fn test_declared_hash_breaks_same_parent_tie() {
        // Canonical and a sibling both descend from parent 0.
        let siblings = vec![BlockVersion::new(8, 0, "guid-8")];
        let probed = probe(7, 0, &siblings);

        // Declared hash picks the sibling over the canonical version.
        let selected = select_version(0, "name-0", &probed, 0, 8).unwrap();
        assert_eq!(selected, BlockLocation::new(8, "guid-8"));

        // A declared hash matching nothing falls back to canonical.
        let selected = select_version(0, "name-0", &probed, 0, 999).unwrap();
        assert_eq!(selected.hash, 7);

        // No declared hash also prefers canonical.
        let selected = select_version(0, "name-0", &probed, 0, 0).unwrap();
        assert_eq!(selected.hash, 7);
    }

    #[test]
    fn test_first_matching_sibling_wins_without_declared_hash() {
        let siblings = vec![
            BlockVersion::new(21, 7, "guid-first"),
            BlockVersion::new(22, 7, "guid-second"),
        ];
        let probed = probe(11, 99, &siblings);

        let selected = select_version(1, "name-1", &probed, 7, 0).unwrap();
        assert_eq!(selected.location, "guid-first");
    }

    #[test]
    fn test_no_eligible_version_breaks_chain() {
        let siblings = vec![BlockVersion::new(21, 50, "guid-x")];
        let probed = probe(11, 99, &siblings);
        assert!(select_version(1, "name-1", &probed, 7, 21).is_none());
    }
}
