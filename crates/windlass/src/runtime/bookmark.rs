//! Named suspension points

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::instance::InstanceId;

/// A resumable suspension token
///
/// Keyed by name (within an optional scope) for named bookmarks, by id
/// for anonymous ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bookmark {
    /// Name, when the bookmark is addressable from outside
    pub name: Option<String>,

    /// Manager-assigned id; the key for anonymous bookmarks
    pub id: u64,

    /// Optional scope the bookmark lives in
    pub scope: Option<Uuid>,
}

impl Bookmark {
    /// A named, unscoped bookmark selector for host-side resumption
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            id: 0,
            scope: None,
        }
    }
}

impl std::fmt::Display for Bookmark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "'{name}'"),
            None => write!(f, "#{}", self.id),
        }
    }
}

/// Creation options
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BookmarkOptions {
    /// Non-blocking bookmarks do not hold their owner open
    pub non_blocking: bool,
}

impl BookmarkOptions {
    /// Options for a non-blocking bookmark
    pub fn non_blocking() -> Self {
        Self { non_blocking: true }
    }
}

/// Outcome of a resumption attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookmarkResumptionResult {
    /// The callback work item was scheduled
    Success,

    /// No such bookmark
    NotFound,

    /// The bookmark exists but its scope is not ready yet
    NotReady,
}

/// A bookmark surfaced to the host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookmarkInfo {
    /// The bookmark itself
    pub bookmark: Bookmark,

    /// Display name of the owning activity
    pub owner_display_name: String,
}

/// Errors from bookmark creation
#[derive(Debug, thiserror::Error)]
pub enum BookmarkError {
    /// A bookmark with this name already exists in the scope
    #[error("a bookmark named '{0}' already exists")]
    AlreadyExists(String),
}

/// One registered bookmark
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookmarkRecord {
    /// The bookmark token
    pub bookmark: Bookmark,

    /// Owning instance
    pub owner: InstanceId,

    /// Creation options
    pub options: BookmarkOptions,
}

/// Result of looking up a bookmark for resumption
#[derive(Debug)]
pub enum ResumeLookup {
    /// Found and removed; schedule the callback
    Found(BookmarkRecord),

    /// No such bookmark
    NotFound,

    /// Exists, but its scope has not been granted yet
    NotReady,
}

/// The table of live bookmarks for one workflow instance
#[derive(Debug, Default)]
pub struct BookmarkManager {
    records: Vec<BookmarkRecord>,
    next_id: u64,
    ready_scopes: HashSet<Uuid>,
}

impl BookmarkManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a bookmark for `owner`
    ///
    /// Named bookmarks must be unique within their scope.
    pub fn create(
        &mut self,
        owner: InstanceId,
        name: Option<String>,
        scope: Option<Uuid>,
        options: BookmarkOptions,
    ) -> Result<Bookmark, BookmarkError> {
        if let Some(name) = &name {
            let clash = self
                .records
                .iter()
                .any(|r| r.bookmark.name.as_deref() == Some(name) && r.bookmark.scope == scope);
            if clash {
                return Err(BookmarkError::AlreadyExists(name.clone()));
            }
        }

        self.next_id += 1;
        let bookmark = Bookmark {
            name,
            id: self.next_id,
            scope,
        };
        if let Some(scope) = scope {
            self.ready_scopes.insert(scope);
        }
        self.records.push(BookmarkRecord {
            bookmark: bookmark.clone(),
            owner,
            options,
        });
        Ok(bookmark)
    }

    /// Look up a bookmark for resumption, removing it when found
    pub fn begin_resume(&mut self, selector: &Bookmark) -> ResumeLookup {
        let position = self.records.iter().position(|r| matches(selector, r));
        match position {
            None => ResumeLookup::NotFound,
            Some(index) => {
                let scope = self.records[index].bookmark.scope;
                if let Some(scope) = scope {
                    if !self.ready_scopes.contains(&scope) {
                        return ResumeLookup::NotReady;
                    }
                }
                ResumeLookup::Found(self.records.remove(index))
            }
        }
    }

    /// Remove a bookmark owned by `owner`
    pub fn remove(&mut self, selector: &Bookmark, owner: InstanceId) -> Option<BookmarkRecord> {
        let position = self
            .records
            .iter()
            .position(|r| r.owner == owner && matches(selector, r))?;
        Some(self.records.remove(position))
    }

    /// Remove every bookmark owned by a terminating instance
    pub fn purge_owner(&mut self, owner: InstanceId) -> Vec<BookmarkRecord> {
        let (purged, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.records)
                .into_iter()
                .partition(|r| r.owner == owner);
        self.records = kept;
        purged
    }

    /// All live bookmarks, creation order
    pub fn records(&self) -> &[BookmarkRecord] {
        &self.records
    }

    /// Number of live bookmarks
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no bookmarks are live
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn mark_scope_unready(&mut self, scope: Uuid) {
        self.ready_scopes.remove(&scope);
    }

    /// Snapshot for persistence
    pub fn snapshot(&self) -> BookmarkManagerSnapshot {
        BookmarkManagerSnapshot {
            records: self.records.clone(),
            next_id: self.next_id,
            ready_scopes: self.ready_scopes.iter().copied().collect(),
        }
    }

    /// Rebuild from a snapshot
    pub fn restore(snapshot: BookmarkManagerSnapshot) -> Self {
        Self {
            records: snapshot.records,
            next_id: snapshot.next_id,
            ready_scopes: snapshot.ready_scopes.into_iter().collect(),
        }
    }
}

fn matches(selector: &Bookmark, record: &BookmarkRecord) -> bool {
    match &selector.name {
        Some(name) => {
            record.bookmark.name.as_deref() == Some(name.as_str())
                && record.bookmark.scope == selector.scope
        }
        None => record.bookmark.id == selector.id,
    }
}

/// Serialized form of the bookmark table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookmarkManagerSnapshot {
    /// Live bookmarks
    pub records: Vec<BookmarkRecord>,

    /// Next anonymous id
    pub next_id: u64,

    /// Scopes granted so far
    pub ready_scopes: Vec<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> InstanceId {
        InstanceId::new(1)
    }

    #[test]
    fn test_create_and_resume_named() {
        let mut mgr = BookmarkManager::new();
        mgr.create(owner(), Some("k".into()), None, BookmarkOptions::default())
            .unwrap();

        match mgr.begin_resume(&Bookmark::named("k")) {
            ResumeLookup::Found(record) => assert_eq!(record.owner, owner()),
            other => panic!("expected Found, got {other:?}"),
        }
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_resume_unknown_is_not_found() {
        let mut mgr = BookmarkManager::new();
        assert!(matches!(
            mgr.begin_resume(&Bookmark::named("x")),
            ResumeLookup::NotFound
        ));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut mgr = BookmarkManager::new();
        mgr.create(owner(), Some("k".into()), None, BookmarkOptions::default())
            .unwrap();
        let err = mgr
            .create(owner(), Some("k".into()), None, BookmarkOptions::default())
            .unwrap_err();
        assert!(matches!(err, BookmarkError::AlreadyExists(_)));
    }

    #[test]
    fn test_anonymous_resume_by_id() {
        let mut mgr = BookmarkManager::new();
        let bookmark = mgr
            .create(owner(), None, None, BookmarkOptions::default())
            .unwrap();

        assert!(matches!(
            mgr.begin_resume(&bookmark),
            ResumeLookup::Found(_)
        ));
    }

    #[test]
    fn test_unready_scope() {
        let mut mgr = BookmarkManager::new();
        let scope = Uuid::now_v7();
        let bookmark = mgr
            .create(owner(), Some("scoped".into()), Some(scope), BookmarkOptions::default())
            .unwrap();
        mgr.mark_scope_unready(scope);

        assert!(matches!(mgr.begin_resume(&bookmark), ResumeLookup::NotReady));
        // Still registered after a NotReady attempt.
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn test_purge_owner() {
        let mut mgr = BookmarkManager::new();
        mgr.create(owner(), Some("a".into()), None, BookmarkOptions::default())
            .unwrap();
        mgr.create(InstanceId::new(2), Some("b".into()), None, BookmarkOptions::default())
            .unwrap();

        let purged = mgr.purge_owner(owner());
        assert_eq!(purged.len(), 1);
        assert_eq!(mgr.len(), 1);
        assert_eq!(mgr.records()[0].bookmark.name.as_deref(), Some("b"));
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut mgr = BookmarkManager::new();
        mgr.create(owner(), Some("k".into()), None, BookmarkOptions::default())
            .unwrap();

        let restored = BookmarkManager::restore(mgr.snapshot());
        assert_eq!(restored.len(), 1);

        let mut restored = restored;
        let fresh = restored
            .create(owner(), None, None, BookmarkOptions::default())
            .unwrap();
        assert_eq!(fresh.id, 2);
    }
}
