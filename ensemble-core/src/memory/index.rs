//! Brute-force cosine index for one scope.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use super::embedding::cosine_similarity;
use super::{MemoryEntry, MemoryError};

const INDEX_FILE: &str = "index.json";

/// All entries of one scope, optionally mirrored to `{dir}/index.json`.
#[derive(Debug, Default)]
pub struct FlatIndex {
    entries: Vec<MemoryEntry>,
    dir: Option<PathBuf>,
}

impl FlatIndex {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the index stored in `dir`, or start an empty one there.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, MemoryError> {
        let dir = dir.into();
        let file = dir.join(INDEX_FILE);
        let entries = match tokio::fs::read_to_string(&file).await {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            entries,
            dir: Some(dir),
        })
    }

    /// Whether an index file exists in `dir`.
    pub async fn exists_in(dir: &Path) -> bool {
        tokio::fs::try_exists(dir.join(INDEX_FILE))
            .await
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[MemoryEntry] {
        &self.entries
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    /// Add an entry, replacing any entry with the same id.
    pub fn upsert(&mut self, entry: MemoryEntry) -> Result<(), MemoryError> {
        if let Some(expected) = self.entries.first().map(|e| e.vector.len()) {
            if expected != entry.vector.len() {
                return Err(MemoryError::DimensionMismatch {
                    expected,
                    actual: entry.vector.len(),
                });
            }
        }
        match self.entries.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
        Ok(())
    }

    /// The `top_k` entries most similar to `vector`, best first, skipping any
    /// below `min_similarity`.
    pub fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        min_similarity: f32,
    ) -> Vec<(&MemoryEntry, f32)> {
        let mut scored: Vec<(&MemoryEntry, f32)> = self
            .entries
            .iter()
            .map(|e| (e, cosine_similarity(vector, &e.vector)))
            .filter(|(_, score)| *score >= min_similarity)
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        scored.truncate(top_k);
        scored
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    /// Remove every entry matching `pred`, returning how many went.
    pub fn remove_where(&mut self, pred: impl Fn(&MemoryEntry) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !pred(e));
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Write the index to disk, if it has a directory.
    pub async fn persist(&self) -> Result<(), MemoryError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        tokio::fs::create_dir_all(dir).await?;
        let json = serde_json::to_string(&self.entries)?;
        let tmp = dir.join(format!("{INDEX_FILE}.tmp"));
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, dir.join(INDEX_FILE)).await?;
        Ok(())
    }
}
