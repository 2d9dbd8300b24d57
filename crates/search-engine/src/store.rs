use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::alignment::{Alignment, AlignmentMatrix};

/// An indexed chain of a structure entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainInfo {
    /// Full chain identifier (`<entry>:<chain>`).
    pub chain_id: String,
    /// Residue count.
    pub length: u32,
}

/// Relational store collaborator: identifier lookup and the pairwise result cache.
#[async_trait]
pub trait StructureStore: Send + Sync {
    /// Map backend-internal numeric ids to chain identifiers, preserving order.
    /// Unknown ids are skipped.
    async fn resolve_chain_ids(&self, internal_ids: &[u64]) -> anyhow::Result<Vec<String>>;

    /// Residue count of an indexed chain.
    async fn chain_length(&self, chain_id: &str) -> anyhow::Result<Option<u32>>;

    /// Indexed chains of a structure entry.
    async fn indexed_chains(&self, entry_id: &str) -> anyhow::Result<Vec<ChainInfo>>;

    /// Descriptive name of a structure entry.
    async fn entry_name(&self, entry_id: &str) -> anyhow::Result<Option<String>>;

    /// Cached comparison result for the exact `(query, other)` pair.
    async fn cached_alignment(
        &self,
        query: &str,
        other: &str,
    ) -> anyhow::Result<Option<Alignment>>;

    /// Cache a comparison result that took `elapsed` to compute.
    async fn store_alignment(
        &self,
        query: &str,
        other: &str,
        alignment: &Alignment,
        elapsed: Duration,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotChain {
    chain_id: String,
    internal_id: u64,
    length: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotAlignment {
    query: String,
    other: String,
    qscore: f64,
    rmsd: f64,
    seq_identity: f64,
    aligned: u32,
    /// `;`-separated matrix.
    rotation_stats: String,
    #[serde(default)]
    evaluation_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreSnapshot {
    #[serde(default)]
    chains: Vec<SnapshotChain>,
    #[serde(default)]
    names: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    alignments: Vec<SnapshotAlignment>,
}

#[derive(Debug, Clone)]
struct CachedAlignment {
    alignment: Alignment,
    evaluation_ms: u64,
}

/// [`StructureStore`] held in memory, optionally seeded from a JSON snapshot.
#[derive(Debug, Default)]
pub struct MemoryStore {
    chain_by_internal_id: DashMap<u64, String>,
    chain_lengths: DashMap<String, u32>,
    names: DashMap<String, String>,
    alignments: DashMap<(String, String), CachedAlignment>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded from the JSON snapshot at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read store snapshot {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("parse store snapshot {}", path.display()))
    }

    /// Store seeded from snapshot JSON text.
    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let snapshot: StoreSnapshot = serde_json::from_str(raw)?;
        let store = Self::new();
        for chain in snapshot.chains {
            store.insert_chain(chain.internal_id, &chain.chain_id, chain.length);
        }
        for (entry, name) in snapshot.names {
            store.names.insert(entry, name);
        }
        for cached in snapshot.alignments {
            let alignment = Alignment {
                qscore: cached.qscore,
                rmsd: cached.rmsd,
                seq_identity: cached.seq_identity,
                aligned_length: cached.aligned,
                matrix: AlignmentMatrix::parse_cache_string(&cached.rotation_stats)?,
            };
            store.alignments.insert(
                (cached.query, cached.other),
                CachedAlignment {
                    alignment,
                    evaluation_ms: cached.evaluation_ms,
                },
            );
        }
        Ok(store)
    }

    /// Register an indexed chain.
    pub fn insert_chain(&self, internal_id: u64, chain_id: &str, length: u32) {
        self.chain_by_internal_id
            .insert(internal_id, chain_id.to_string());
        self.chain_lengths.insert(chain_id.to_string(), length);
    }

    /// Register an entry name.
    pub fn insert_name(&self, entry_id: &str, name: &str) {
        self.names.insert(entry_id.to_string(), name.to_string());
    }

    /// Number of cached comparison results.
    pub fn cached_len(&self) -> usize {
        self.alignments.len()
    }

    /// Evaluation time recorded with a cached pair, in milliseconds.
    pub fn cached_evaluation_ms(&self, query: &str, other: &str) -> Option<u64> {
        self.alignments
            .get(&(query.to_string(), other.to_string()))
            .map(|entry| entry.evaluation_ms)
    }
}

#[async_trait]
impl StructureStore for MemoryStore {
    async fn resolve_chain_ids(&self, internal_ids: &[u64]) -> anyhow::Result<Vec<String>> {
        Ok(internal_ids
            .iter()
            .filter_map(|id| self.chain_by_internal_id.get(id).map(|c| c.value().clone()))
            .collect())
    }

    async fn chain_length(&self, chain_id: &str) -> anyhow::Result<Option<u32>> {
        Ok(self.chain_lengths.get(chain_id).map(|len| *len.value()))
    }

    async fn indexed_chains(&self, entry_id: &str) -> anyhow::Result<Vec<ChainInfo>> {
        let prefix = format!("{entry_id}:");
        let mut chains: Vec<ChainInfo> = self
            .chain_lengths
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .map(|entry| ChainInfo {
                chain_id: entry.key().clone(),
                length: *entry.value(),
            })
            .collect();
        chains.sort_by(|a, b| a.chain_id.cmp(&b.chain_id));
        Ok(chains)
    }

    async fn entry_name(&self, entry_id: &str) -> anyhow::Result<Option<String>> {
        Ok(self.names.get(entry_id).map(|name| name.value().clone()))
    }

    async fn cached_alignment(
        &self,
        query: &str,
        other: &str,
    ) -> anyhow::Result<Option<Alignment>> {
        Ok(self
            .alignments
            .get(&(query.to_string(), other.to_string()))
            .map(|entry| entry.alignment))
    }

    async fn store_alignment(
        &self,
        query: &str,
        other: &str,
        alignment: &Alignment,
        elapsed: Duration,
    ) -> anyhow::Result<()> {
        // Insert-or-ignore: the first stored result wins.
        self.alignments
            .entry((query.to_string(), other.to_string()))
            .or_insert(CachedAlignment {
                alignment: *alignment,
                evaluation_ms: elapsed.as_millis() as u64,
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SNAPSHOT: &str = r#"{
        "chains": [
            {"chain_id": "1ABC:B", "internal_id": 11, "length": 140},
            {"chain_id": "1ABC:A", "internal_id": 10, "length": 120},
            {"chain_id": "2XYZ:A", "internal_id": 20, "length": 300}
        ],
        "names": {"1ABC": "Lysozyme"},
        "alignments": [
            {"query": "1ABC:A", "other": "2XYZ:A", "qscore": 0.5, "rmsd": 2.0,
             "seq_identity": 0.3, "aligned": 90, "rotation_stats": "1;0;0;0;0;1;0;0;0;0;1;0",
             "evaluation_ms": 1200}
        ]
    }"#;

    #[tokio::test]
    async fn snapshot_seeds_lookups() {
        let store = MemoryStore::from_json(SNAPSHOT).unwrap();

        let ids = store.resolve_chain_ids(&[20, 99, 10]).await.unwrap();
        assert_eq!(ids, vec!["2XYZ:A".to_string(), "1ABC:A".to_string()]);

        let chains = store.indexed_chains("1ABC").await.unwrap();
        assert_eq!(
            chains.iter().map(|c| c.chain_id.as_str()).collect::<Vec<_>>(),
            vec!["1ABC:A", "1ABC:B"]
        );
        assert_eq!(store.entry_name("1ABC").await.unwrap().as_deref(), Some("Lysozyme"));
        assert_eq!(store.chain_length("2XYZ:A").await.unwrap(), Some(300));
    }

    #[tokio::test]
    async fn cache_is_keyed_by_ordered_pair() {
        let store = MemoryStore::from_json(SNAPSHOT).unwrap();
        assert!(store.cached_alignment("1ABC:A", "2XYZ:A").await.unwrap().is_some());
        assert!(store.cached_alignment("2XYZ:A", "1ABC:A").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn store_alignment_keeps_first_result() {
        let store = MemoryStore::new();
        let first = Alignment {
            qscore: 0.9,
            rmsd: 0.5,
            seq_identity: 0.8,
            aligned_length: 100,
            matrix: AlignmentMatrix::IDENTITY,
        };
        let second = Alignment { qscore: 0.1, ..first };
        store
            .store_alignment("a", "b", &first, Duration::from_millis(40))
            .await
            .unwrap();
        store
            .store_alignment("a", "b", &second, Duration::from_millis(50))
            .await
            .unwrap();

        assert_eq!(store.cached_len(), 1);
        assert_eq!(store.cached_alignment("a", "b").await.unwrap(), Some(first));
        assert_eq!(store.cached_evaluation_ms("a", "b"), Some(40));
    }
}
