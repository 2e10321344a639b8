//! Scoped memory storage.
//!
//! [`MemoryStore`] keeps one [`FlatIndex`] per [`MemoryScope`], opened lazily
//! on first write or on the first existence check that finds it on disk.
//! Every operation degrades to an empty or negative result when embedding or
//! disk access fails, with one exception: an unconfirmed bulk delete is
//! rejected with [`MemoryError::BulkDeleteRejected`].

use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    EmbeddingProvider, FlatIndex, MemoryEntry, MemoryError, MemoryHit, MemoryMetadata,
    MemoryScope,
};
use crate::config::ConfigSource;

type SharedIndex = Arc<RwLock<FlatIndex>>;

/// Flags for [`MemoryStore::delete_by_filter`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteOptions {
    /// Report what would be deleted without deleting.
    pub dry_run: bool,
    /// Allow deleting more than the bulk-delete threshold.
    pub confirm: bool,
}

impl DeleteOptions {
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            confirm: false,
        }
    }

    pub fn confirmed() -> Self {
        Self {
            dry_run: false,
            confirm: true,
        }
    }
}

/// Outcome of a filtered delete.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteReport {
    pub matched: usize,
    pub deleted: usize,
    pub dry_run: bool,
    /// Matches per scope, for scopes with at least one.
    pub per_scope: Vec<(MemoryScope, usize)>,
}

pub struct MemoryStore {
    embedder: Arc<dyn EmbeddingProvider>,
    config: Arc<dyn ConfigSource>,
    root: Option<PathBuf>,
    indexes: RwLock<HashMap<MemoryScope, SharedIndex>>,
}

impl MemoryStore {
    /// A store that keeps everything in memory.
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, config: Arc<dyn ConfigSource>) -> Self {
        Self {
            embedder,
            config,
            root: None,
            indexes: RwLock::new(HashMap::new()),
        }
    }

    /// Persist each scope under `{root}/{scope}/`.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    fn scope_dir(&self, scope: &MemoryScope) -> Option<PathBuf> {
        self.root.as_ref().map(|root| root.join(scope.to_string()))
    }

    async fn cached(&self, scope: &MemoryScope) -> Option<SharedIndex> {
        self.indexes.read().await.get(scope).cloned()
    }

    /// Fetch the index for `scope`, opening it if needed. With `create`
    /// unset, a scope with nothing on disk yields `None`.
    async fn index(
        &self,
        scope: &MemoryScope,
        create: bool,
    ) -> Result<Option<SharedIndex>, MemoryError> {
        if let Some(index) = self.cached(scope).await {
            return Ok(Some(index));
        }

        let dir = self.scope_dir(scope);
        if !create {
            match &dir {
                Some(dir) if FlatIndex::exists_in(dir).await => {}
                _ => return Ok(None),
            }
        }

        let mut indexes = self.indexes.write().await;
        if let Some(index) = indexes.get(scope) {
            return Ok(Some(index.clone()));
        }
        let index = match dir {
            Some(dir) => FlatIndex::open(dir).await?,
            None => FlatIndex::in_memory(),
        };
        debug!(%scope, entries = index.len(), "Opened memory index");
        let shared = Arc::new(RwLock::new(index));
        indexes.insert(*scope, shared.clone());
        Ok(Some(shared))
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Embed and store `text`. Returns the new id, or `None` on failure.
    pub async fn add(
        &self,
        scope: &MemoryScope,
        text: &str,
        metadata: MemoryMetadata,
    ) -> Option<String> {
        match self.try_add(scope, text, metadata).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(%scope, error = %e, "Failed to store memory");
                None
            }
        }
    }

    async fn try_add(
        &self,
        scope: &MemoryScope,
        text: &str,
        mut metadata: MemoryMetadata,
    ) -> Result<String, MemoryError> {
        let vector = self.embedder.embed(text).await?;
        if metadata.timestamp.is_none() {
            metadata.timestamp = Some(Utc::now().to_rfc3339());
        }
        let entry = MemoryEntry {
            id: Uuid::new_v4().to_string(),
            text: text.to_string(),
            metadata,
            vector,
        };
        let id = entry.id.clone();

        let Some(index) = self.index(scope, true).await? else {
            return Err(MemoryError::InvalidScope(scope.to_string()));
        };
        let mut index = index.write().await;
        index.upsert(entry)?;
        if let Err(e) = index.persist().await {
            index.remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    pub async fn delete_by_id(&self, scope: &MemoryScope, id: &str) -> bool {
        let index = match self.index(scope, false).await {
            Ok(Some(index)) => index,
            Ok(None) => return false,
            Err(e) => {
                warn!(%scope, error = %e, "Memory index unavailable");
                return false;
            }
        };
        let mut index = index.write().await;
        let removed = index.remove(id);
        if removed {
            if let Err(e) = index.persist().await {
                warn!(%scope, error = %e, "Failed to persist memory index");
            }
        }
        removed
    }

    /// Delete memories whose metadata matches every `filter` entry, in one
    /// scope or, when `scope` is `None`, across every known scope.
    ///
    /// Matches are counted across all target scopes before anything is
    /// deleted. A dry run only reports them. Deleting more than
    /// `memoryStore.bulkDeleteThreshold` matches needs `options.confirm`.
    pub async fn delete_by_filter(
        &self,
        filter: &Map<String, Value>,
        scope: Option<&MemoryScope>,
        options: DeleteOptions,
    ) -> Result<DeleteReport, MemoryError> {
        let threshold = self.config.snapshot().await.memory_store.bulk_delete_threshold;
        let scopes = match scope {
            Some(scope) => vec![*scope],
            None => self.list_scopes().await,
        };

        let mut targets = Vec::new();
        let mut report = DeleteReport {
            dry_run: options.dry_run,
            ..DeleteReport::default()
        };
        for scope in scopes {
            let index = match self.index(&scope, false).await {
                Ok(Some(index)) => index,
                Ok(None) => continue,
                Err(e) => {
                    warn!(%scope, error = %e, "Skipping unreadable memory index");
                    continue;
                }
            };
            let matched = index
                .read()
                .await
                .entries()
                .iter()
                .filter(|e| e.metadata.matches_filter(filter))
                .count();
            if matched > 0 {
                report.matched += matched;
                report.per_scope.push((scope, matched));
                targets.push((scope, index));
            }
        }

        if options.dry_run {
            return Ok(report);
        }
        if report.matched > threshold && !options.confirm {
            warn!(
                matched = report.matched,
                threshold, "Rejected unconfirmed bulk memory delete"
            );
            return Err(MemoryError::BulkDeleteRejected {
                matched: report.matched,
                threshold,
            });
        }

        for (scope, index) in targets {
            let mut index = index.write().await;
            let removed = index.remove_where(|e| e.metadata.matches_filter(filter));
            report.deleted += removed;
            if let Err(e) = index.persist().await {
                warn!(%scope, error = %e, "Failed to persist memory index");
            }
        }
        info!(
            matched = report.matched,
            deleted = report.deleted,
            "Deleted memories by filter"
        );
        Ok(report)
    }

    /// Drop every memory in `scope`. Returns whether the scope existed.
    pub async fn clear_scope(&self, scope: &MemoryScope) -> bool {
        let Ok(Some(index)) = self.index(scope, false).await else {
            return false;
        };
        let mut index = index.write().await;
        index.clear();
        if let Err(e) = index.persist().await {
            warn!(%scope, error = %e, "Failed to persist cleared memory index");
        }
        true
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Nearest neighbours of `text` in `scope`, best first. Results below
    /// `memoryStore.minSimilarity` are dropped.
    pub async fn query(&self, scope: &MemoryScope, text: &str, top_k: usize) -> Vec<MemoryHit> {
        let index = match self.index(scope, false).await {
            Ok(Some(index)) => index,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!(%scope, error = %e, "Memory index unavailable");
                return Vec::new();
            }
        };
        let vector = match self.embedder.embed(text).await {
            Ok(v) => v,
            Err(e) => {
                warn!(%scope, error = %e, "Query embedding failed");
                return Vec::new();
            }
        };
        let min_similarity = self.config.snapshot().await.memory_store.min_similarity;

        let index = index.read().await;
        index
            .search(&vector, top_k, min_similarity)
            .into_iter()
            .map(|(entry, score)| MemoryHit {
                id: entry.id.clone(),
                text: entry.text.clone(),
                score,
                scope: *scope,
                metadata: entry.metadata.clone(),
            })
            .collect()
    }

    /// Whether `scope` has an index, loading it if it is only on disk.
    pub async fn scope_exists(&self, scope: &MemoryScope) -> bool {
        matches!(self.index(scope, false).await, Ok(Some(_)))
    }

    pub async fn count(&self, scope: &MemoryScope) -> usize {
        match self.index(scope, false).await {
            Ok(Some(index)) => index.read().await.len(),
            _ => 0,
        }
    }

    /// Copies of every entry in `scope`.
    pub async fn entries(&self, scope: &MemoryScope) -> Vec<MemoryEntry> {
        match self.index(scope, false).await {
            Ok(Some(index)) => index.read().await.entries().to_vec(),
            _ => Vec::new(),
        }
    }

    /// Every scope that is cached or has a directory under the root.
    pub async fn list_scopes(&self) -> Vec<MemoryScope> {
        let mut scopes: BTreeSet<MemoryScope> =
            self.indexes.read().await.keys().copied().collect();

        if let Some(root) = &self.root {
            match tokio::fs::read_dir(root).await {
                Ok(mut dir) => loop {
                    match dir.next_entry().await {
                        Ok(Some(entry)) => {
                            if let Some(scope) = entry
                                .file_name()
                                .to_str()
                                .and_then(|name| name.parse::<MemoryScope>().ok())
                            {
                                scopes.insert(scope);
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "Failed to list memory scopes");
                            break;
                        }
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(root = %root.display(), error = %e, "Failed to list memory scopes"),
            }
        }

        scopes.into_iter().collect()
    }
}
