//! Batch re-clustering.
//!
//! When algorithms, config or rules change, stored clustering results go
//! stale. [`Reclusterer`] brings chunks of failures up to date in parallel
//! against one immutable config and ruleset snapshot, reusing each chunk's
//! previous results where they are still valid. Progress through a shard of
//! the chunk keyspace is reported in permille by [`calculate_progress`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::algorithms::{ALGORITHMS_VERSION, Algorithms};
use crate::clustering::{ClusterDelta, ClusterResults, Failure};
use crate::config::CompiledConfig;
use crate::error::{Error, Result};
use crate::rules::{Ruleset, starting_epoch};

// ============================================================================
// Progress
// ============================================================================

/// The versions the latest re-clustering run brings stored results up to,
/// and whether it has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReclusteringProgress {
    pub algorithms_version: i64,
    pub config_version: DateTime<Utc>,
    pub rules_version: DateTime<Utc>,
    pub complete: bool,
}

impl ReclusteringProgress {
    /// Progress of a project that has never been re-clustered.
    #[must_use]
    pub fn none() -> Self {
        Self {
            algorithms_version: 0,
            config_version: starting_epoch(),
            rules_version: starting_epoch(),
            complete: false,
        }
    }

    /// Whether all stored results reflect at least the given versions.
    #[must_use]
    pub fn incorporates(
        &self,
        algorithms_version: i64,
        config_version: DateTime<Utc>,
        rules_version: DateTime<Utc>,
    ) -> bool {
        self.complete
            && self.algorithms_version >= algorithms_version
            && self.config_version >= config_version
            && self.rules_version >= rules_version
    }
}

#[async_trait]
pub trait ProgressSource: Send + Sync {
    async fn read_progress(&self, project: &str) -> Result<ReclusteringProgress>;
}

/// A [`ProgressSource`] reporting whatever progress it was last given.
#[derive(Default)]
pub struct InMemoryProgress {
    projects: Mutex<HashMap<String, ReclusteringProgress>>,
}

impl InMemoryProgress {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, project: &str, progress: ReclusteringProgress) -> Result<()> {
        self.projects
            .lock()
            .map_err(|_| Error::store("progress state poisoned"))?
            .insert(project.to_string(), progress);
        Ok(())
    }
}

#[async_trait]
impl ProgressSource for InMemoryProgress {
    async fn read_progress(&self, project: &str) -> Result<ReclusteringProgress> {
        let projects = self
            .projects
            .lock()
            .map_err(|_| Error::store("progress state poisoned"))?;
        Ok(projects
            .get(project)
            .copied()
            .unwrap_or_else(ReclusteringProgress::none))
    }
}

/// Permille progress through the shard of chunk IDs in
/// `(start_chunk_id, end_chunk_id]`, given the last chunk processed.
///
/// Chunk IDs are 32 hex digit (128 bit) keys; an empty `start_chunk_id`
/// means the start of the keyspace. Progress never reaches 1000, which is
/// reserved for a finished shard.
pub fn calculate_progress(start_chunk_id: &str, end_chunk_id: &str, current_chunk_id: &str) -> Result<u32> {
    let first = if start_chunk_id.is_empty() {
        0
    } else {
        parse_chunk_id(start_chunk_id)?.saturating_add(1)
    };
    let end = parse_chunk_id(end_chunk_id)?;
    let current = parse_chunk_id(current_chunk_id)?;
    if end < first {
        return Err(Error::validation(format!(
            "empty shard: end chunk {end_chunk_id} precedes start chunk {start_chunk_id}"
        )));
    }
    let done = current.saturating_sub(first);
    let total = end - first;
    let progress = match (done.checked_mul(1000), total.checked_add(1)) {
        (Some(scaled), Some(size)) => scaled / size,
        // Too wide to scale exactly; drop the low 32 bits of both sides.
        (_, size) => {
            let denominator = size.map_or(1 << 96, |v| v >> 32).max(1);
            (done >> 32) * 1000 / denominator
        }
    };
    Ok(u32::try_from(progress.min(999)).unwrap_or(999))
}

fn parse_chunk_id(id: &str) -> Result<u128> {
    if id.len() != 32 || !id.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
        return Err(Error::validation(format!(
            "chunk ID must be 32 lowercase hex digits: {id:?}"
        )));
    }
    u128::from_str_radix(id, 16).map_err(|err| Error::validation(format!("chunk ID {id:?}: {err}")))
}

// ============================================================================
// Re-clustering
// ============================================================================

/// A chunk of failures and their stored clustering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub chunk_id: String,
    pub failures: Vec<Failure>,
    pub results: ClusterResults,
}

/// New clustering for a chunk whose stored results were stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkUpdate {
    pub chunk_id: String,
    pub results: ClusterResults,
    /// Per-failure membership changes; empty entries where nothing changed.
    pub deltas: Vec<ClusterDelta>,
}

impl ChunkUpdate {
    /// Whether any failure joined or left a cluster.
    #[must_use]
    pub fn changes_membership(&self) -> bool {
        self.deltas.iter().any(|d| !d.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclusterOutcome {
    /// Updates for every chunk that was stale, in input order.
    pub updates: Vec<ChunkUpdate>,
    pub chunks_total: usize,
    /// Chunks in which some failure's clusters changed.
    pub chunks_changed: usize,
}

pub struct Reclusterer {
    algorithms: Arc<Algorithms>,
    config: Arc<CompiledConfig>,
    ruleset: Arc<Ruleset>,
}

impl Reclusterer {
    #[must_use]
    pub const fn new(
        algorithms: Arc<Algorithms>,
        config: Arc<CompiledConfig>,
        ruleset: Arc<Ruleset>,
    ) -> Self {
        Self {
            algorithms,
            config,
            ruleset,
        }
    }

    /// The progress a finished run of this reclusterer represents.
    #[must_use]
    pub fn target(&self) -> ReclusteringProgress {
        ReclusteringProgress {
            algorithms_version: ALGORITHMS_VERSION,
            config_version: self.config.last_updated(),
            rules_version: self.ruleset.rules_version(),
            complete: true,
        }
    }

    /// Whether `results` predate this reclusterer's algorithms, config or
    /// rules.
    #[must_use]
    pub fn is_stale(&self, results: &ClusterResults) -> bool {
        results.algorithms_version < ALGORITHMS_VERSION
            || results.config_version < self.config.last_updated()
            || results.rules_version < self.ruleset.rules_version()
    }

    /// Re-clusters every stale chunk in parallel.
    #[must_use]
    pub fn recluster(&self, chunks: &[Chunk]) -> ReclusterOutcome {
        let updates: Vec<ChunkUpdate> = chunks
            .par_iter()
            .filter(|chunk| self.is_stale(&chunk.results))
            .map(|chunk| {
                let results = self.algorithms.cluster(
                    &self.config,
                    &self.ruleset,
                    &chunk.results,
                    &chunk.failures,
                );
                ChunkUpdate {
                    chunk_id: chunk.chunk_id.clone(),
                    deltas: chunk.results.diff(&results),
                    results,
                }
            })
            .collect();
        let chunks_changed = updates.iter().filter(|u| u.changes_membership()).count();
        tracing::info!(
            project = %self.config.project(),
            chunks = chunks.len(),
            stale = updates.len(),
            changed = chunks_changed,
            rules_version = %self.ruleset.rules_version(),
            "recluster.completed"
        );
        ReclusterOutcome {
            updates,
            chunks_total: chunks.len(),
            chunks_changed,
        }
    }
}
