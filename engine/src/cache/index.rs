//! Flat similarity index over cached query embeddings
//!
//! Vectors are L2-normalised on insert so cosine similarity is a dot product.
//! The whole index is persisted as one JSON artifact; writes go to a sibling
//! temp file which is then renamed over the previous artifact.

use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

const INDEX_VERSION: u32 = 1;

/// One indexed query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Value-store key of the cached record
    pub key: String,
    /// Query text the embedding was computed from
    pub query: String,
    /// Unit-length embedding
    pub vector: Vec<f32>,
}

/// Closest indexed entry to a probe vector
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub key: String,
    pub query: String,
    /// Cosine distance clamped to `[0, 1]`
    pub distance: f32,
}

impl Neighbor {
    pub fn similarity(&self) -> f32 {
        1.0 - self.distance
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexArtifact {
    version: u32,
    dimension: Option<usize>,
    entries: Vec<IndexEntry>,
}

pub struct SimilarityIndex {
    path: Option<PathBuf>,
    data: RwLock<IndexArtifact>,
}

impl SimilarityIndex {
    /// Index that is never written to disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: RwLock::new(IndexArtifact {
                version: INDEX_VERSION,
                ..Default::default()
            }),
        }
    }

    /// Load the artifact at `path`, or start empty if there is none yet
    pub async fn open(path: &Path) -> Result<Self, EngineError> {
        let artifact = match tokio::fs::read_to_string(path).await {
            Ok(contents) => {
                let artifact: IndexArtifact = serde_json::from_str(&contents).map_err(|e| {
                    EngineError::Index(format!("Corrupt index at {}: {}", path.display(), e))
                })?;
                if let Some(dim) = artifact.dimension {
                    if artifact.entries.iter().any(|e| e.vector.len() != dim) {
                        return Err(EngineError::Index(format!(
                            "Index at {} has entries that are not {}-dimensional",
                            path.display(),
                            dim
                        )));
                    }
                }
                info!(
                    "Loaded similarity index with {} entries from {}",
                    artifact.entries.len(),
                    path.display()
                );
                artifact
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No index at {}, starting empty", path.display());
                IndexArtifact {
                    version: INDEX_VERSION,
                    ..Default::default()
                }
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            data: RwLock::new(artifact),
        })
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.entries.is_empty()
    }

    pub async fn dimension(&self) -> Option<usize> {
        self.data.read().await.dimension
    }

    /// Nearest entry to `vector` (k = 1), or `None` if the index is empty
    pub async fn nearest(&self, vector: &[f32]) -> Result<Option<Neighbor>, EngineError> {
        let probe = normalize(vector)?;
        let data = self.data.read().await;

        if let Some(dim) = data.dimension {
            if dim != probe.len() {
                return Err(EngineError::Index(format!(
                    "Embedding dimension mismatch: index has {}, query has {}",
                    dim,
                    probe.len()
                )));
            }
        }

        let best = data
            .entries
            .iter()
            .map(|entry| (entry, dot(&entry.vector, &probe)))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        Ok(best.map(|(entry, cos)| Neighbor {
            key: entry.key.clone(),
            query: entry.query.clone(),
            distance: (1.0 - cos).clamp(0.0, 1.0),
        }))
    }

    /// Add an entry, replacing any existing entry with the same key
    pub async fn add(
        &self,
        key: impl Into<String>,
        query: impl Into<String>,
        vector: &[f32],
    ) -> Result<(), EngineError> {
        let vector = normalize(vector)?;
        let key = key.into();
        let mut data = self.data.write().await;

        match data.dimension {
            Some(dim) if dim != vector.len() => {
                return Err(EngineError::Index(format!(
                    "Embedding dimension mismatch: index has {}, entry has {}",
                    dim,
                    vector.len()
                )));
            }
            Some(_) => {}
            None => data.dimension = Some(vector.len()),
        }

        let entry = IndexEntry {
            key,
            query: query.into(),
            vector,
        };
        match data.entries.iter_mut().find(|e| e.key == entry.key) {
            Some(existing) => *existing = entry,
            None => data.entries.push(entry),
        }
        Ok(())
    }

    /// Remove the entry for `key`; returns whether one existed
    pub async fn remove(&self, key: &str) -> bool {
        let mut data = self.data.write().await;
        let before = data.entries.len();
        data.entries.retain(|e| e.key != key);
        data.entries.len() != before
    }

    /// Write the index to its artifact path (no-op for in-memory indexes)
    pub async fn persist(&self) -> Result<(), EngineError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let contents = {
            let data = self.data.read().await;
            serde_json::to_string(&*data)
                .map_err(|e| EngineError::Index(format!("Failed to serialize index: {}", e)))?
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, path).await?;

        debug!("Persisted similarity index to {}", path.display());
        Ok(())
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn normalize(vector: &[f32]) -> Result<Vec<f32>, EngineError> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if vector.is_empty() || !norm.is_finite() || norm == 0.0 {
        return Err(EngineError::Embedding(
            "Embedding must be a non-zero, finite vector".to_string(),
        ));
    }
    Ok(vector.iter().map(|x| x / norm).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_nearest_on_empty_index() {
        let index = SimilarityIndex::in_memory();
        assert!(index.nearest(&[1.0, 0.0]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_similarity_is_cosine() {
        let index = SimilarityIndex::in_memory();
        index.add("a", "first", &[2.0, 0.0]).await.unwrap();

        let neighbor = index.nearest(&[0.8, 0.6]).await.unwrap().unwrap();
        assert_eq!(neighbor.key, "a");
        assert!((neighbor.similarity() - 0.8).abs() < 1e-5);

        // Opposite vectors clamp to distance 1
        let neighbor = index.nearest(&[-1.0, 0.0]).await.unwrap().unwrap();
        assert_eq!(neighbor.distance, 1.0);
    }

    #[tokio::test]
    async fn test_nearest_picks_closest() {
        let index = SimilarityIndex::in_memory();
        index.add("x", "x-axis", &[1.0, 0.0]).await.unwrap();
        index.add("y", "y-axis", &[0.0, 1.0]).await.unwrap();

        let neighbor = index.nearest(&[0.1, 0.9]).await.unwrap().unwrap();
        assert_eq!(neighbor.key, "y");
        assert_eq!(neighbor.query, "y-axis");
    }

    #[tokio::test]
    async fn test_add_same_key_replaces() {
        let index = SimilarityIndex::in_memory();
        index.add("k", "old", &[1.0, 0.0]).await.unwrap();
        index.add("k", "new", &[0.0, 1.0]).await.unwrap();

        assert_eq!(index.len().await, 1);
        let neighbor = index.nearest(&[0.0, 1.0]).await.unwrap().unwrap();
        assert_eq!(neighbor.query, "new");
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let index = SimilarityIndex::in_memory();
        index.add("a", "q", &[1.0, 0.0]).await.unwrap();

        assert!(matches!(
            index.add("b", "q", &[1.0, 0.0, 0.0]).await,
            Err(EngineError::Index(_))
        ));
        assert!(matches!(
            index.nearest(&[1.0, 0.0, 0.0]).await,
            Err(EngineError::Index(_))
        ));
    }

    #[tokio::test]
    async fn test_zero_vector_rejected() {
        let index = SimilarityIndex::in_memory();
        assert!(matches!(
            index.add("a", "q", &[0.0, 0.0]).await,
            Err(EngineError::Embedding(_))
        ));
    }

    #[tokio::test]
    async fn test_remove() {
        let index = SimilarityIndex::in_memory();
        index.add("a", "q", &[1.0, 0.0]).await.unwrap();

        assert!(index.remove("a").await);
        assert!(!index.remove("a").await);
        assert!(index.is_empty().await);
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cache_index").join("index.json");

        let index = SimilarityIndex::open(&path).await.unwrap();
        index.add("a", "What is NET_500?", &[3.0, 4.0]).await.unwrap();
        index.persist().await.unwrap();

        let reloaded = SimilarityIndex::open(&path).await.unwrap();
        assert_eq!(reloaded.len().await, 1);
        assert_eq!(reloaded.dimension().await, Some(2));

        let neighbor = reloaded.nearest(&[0.6, 0.8]).await.unwrap().unwrap();
        assert_eq!(neighbor.query, "What is NET_500?");
        assert!(neighbor.similarity() > 0.9999);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_artifact_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(
            SimilarityIndex::open(&path).await,
            Err(EngineError::Index(_))
        ));
    }
}
