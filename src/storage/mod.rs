// Storage-level entry model and the CAS layer that sits on top of it.
//
// `StoredEntry` is the only unit of truth the rest of the engine cares
// about: immutable, versioned, and mutated exclusively through
// [`StoredEntryBuilder`] followed by a compare-and-swap against
// [`CoordinationStorage`].

use crate::common::{Key, SessionId};
use crate::error::{CoordinationError, Result};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// ============================================================================
// StoredEntry
// ============================================================================

/// Immutable, CAS-versioned image of one coordinated key.
///
/// Every mutation produces a new `StoredEntry`; nothing here is ever edited
/// in place. See [`StoredEntryBuilder`] for the only way to derive a new
/// image from an existing one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub key: Key,
    pub value: Vec<u8>,
    pub read_locks: BTreeSet<SessionId>,
    pub write_lock: Option<SessionId>,
    pub is_marked_as_deleted: bool,
    pub storage_version: u64,
}

impl StoredEntry {
    /// Start a builder seeded from this image.
    pub fn builder(&self) -> StoredEntryBuilder {
        StoredEntryBuilder {
            key: self.key.clone(),
            value: self.value.clone(),
            read_locks: self.read_locks.clone(),
            write_lock: self.write_lock.clone(),
            is_marked_as_deleted: self.is_marked_as_deleted,
            source_version: self.storage_version,
            changed: false,
        }
    }

    /// Entry with no locks and no record of having ever existed — the seed
    /// for the creation path.
    pub fn fresh(key: Key) -> StoredEntryBuilder {
        StoredEntryBuilder {
            key,
            value: Vec::new(),
            read_locks: BTreeSet::new(),
            write_lock: None,
            is_marked_as_deleted: true,
            source_version: 0,
            changed: false,
        }
    }

    /// `is_marked_as_deleted = true` and no locks is equivalent to "does
    /// not exist" (§3).
    pub fn is_tombstone(&self) -> bool {
        self.is_marked_as_deleted && self.read_locks.is_empty() && self.write_lock.is_none()
    }
}

// ============================================================================
// StoredEntryBuilder
// ============================================================================

/// Builds the next immutable [`StoredEntry`] image, enforcing the
/// pre-conditions in §4.1. Every operation that would violate one fails
/// with [`CoordinationError::InvalidState`] rather than silently no-oping.
pub struct StoredEntryBuilder {
    key: Key,
    value: Vec<u8>,
    read_locks: BTreeSet<SessionId>,
    write_lock: Option<SessionId>,
    is_marked_as_deleted: bool,
    source_version: u64,
    changed: bool,
}

impl StoredEntryBuilder {
    pub fn acquire_write_lock(mut self, session: &SessionId) -> Result<Self> {
        match &self.write_lock {
            None => {
                self.write_lock = Some(session.clone());
                self.changed = true;
            }
            Some(holder) if holder == session => {}
            Some(_) => {
                return Err(CoordinationError::InvalidState(
                    "acquire_write_lock: write_lock held by another session".into(),
                ));
            }
        }
        Ok(self)
    }

    pub fn acquire_read_lock(mut self, session: &SessionId) -> Result<Self> {
        if let Some(holder) = &self.write_lock {
            if holder != session {
                return Err(CoordinationError::InvalidState(
                    "acquire_read_lock: write_lock held by another session".into(),
                ));
            }
        }
        if self.is_marked_as_deleted {
            return Err(CoordinationError::InvalidState(
                "acquire_read_lock: entry is deleted".into(),
            ));
        }
        if self.read_locks.insert(session.clone()) {
            self.changed = true;
        }
        Ok(self)
    }

    pub fn release_write_lock(mut self, session: &SessionId) -> Result<Self> {
        match &self.write_lock {
            None => {}
            Some(holder) if holder == session => {
                self.write_lock = None;
                self.changed = true;
            }
            Some(_) => {
                return Err(CoordinationError::InvalidState(
                    "release_write_lock: write_lock held by another session".into(),
                ));
            }
        }
        Ok(self)
    }

    pub fn release_read_lock(mut self, session: &SessionId) -> Self {
        if self.read_locks.remove(session) {
            self.changed = true;
        }
        self
    }

    pub fn mark_as_deleted(mut self, session: &SessionId) -> Result<Self> {
        if self.write_lock.as_ref() != Some(session) {
            return Err(CoordinationError::InvalidState(
                "mark_as_deleted: caller does not hold the write_lock".into(),
            ));
        }
        if self.read_locks.iter().any(|s| s != session) {
            return Err(CoordinationError::InvalidState(
                "mark_as_deleted: foreign read_locks remain".into(),
            ));
        }
        self.is_marked_as_deleted = true;
        self.read_locks.clear();
        self.changed = true;
        Ok(self)
    }

    pub fn set_value(mut self, session: &SessionId, value: Vec<u8>) -> Result<Self> {
        if self.write_lock.as_ref() != Some(session) {
            return Err(CoordinationError::InvalidState(
                "set_value: caller does not hold the write_lock".into(),
            ));
        }
        if self.is_marked_as_deleted {
            return Err(CoordinationError::InvalidState(
                "set_value: entry is deleted".into(),
            ));
        }
        if self.value != value {
            self.value = value;
            self.changed = true;
        }
        Ok(self)
    }

    /// Creation path: acquires write+read-lock and installs `value`,
    /// clearing the tombstone bit. Only valid starting from a deleted or
    /// absent entry with no foreign locks.
    pub fn create(self, session: &SessionId, value: Vec<u8>) -> Result<Self> {
        if !self.is_marked_as_deleted {
            return Err(CoordinationError::InvalidState(
                "create: entry already exists".into(),
            ));
        }
        if self.write_lock.as_ref().is_some_and(|h| h != session)
            || self.read_locks.iter().any(|s| s != session)
        {
            return Err(CoordinationError::InvalidState(
                "create: foreign locks present on a deleted entry".into(),
            ));
        }
        let mut this = self;
        this.is_marked_as_deleted = false;
        this.value = value;
        this.write_lock = Some(session.clone());
        this.read_locks.insert(session.clone());
        this.changed = true;
        Ok(this)
    }

    /// Produce the next immutable image. `reset` forces `storage_version`
    /// to 1 when a change occurred, the way the creation path stamps a
    /// brand-new entry rather than incrementing whatever version the
    /// tombstone happened to carry; a normal mutation passes `reset =
    /// false` and gets `source_version + 1`. An unchanged builder never
    /// bumps the version, so a no-op CAS (e.g. re-acquiring a read-lock
    /// already held) succeeds trivially against the unmodified prior
    /// image.
    pub fn to_immutable(self, reset: bool) -> StoredEntry {
        let storage_version = if self.changed {
            if reset {
                1
            } else {
                self.source_version + 1
            }
        } else {
            self.source_version
        };

        StoredEntry {
            key: self.key,
            value: self.value,
            read_locks: self.read_locks,
            write_lock: self.write_lock,
            is_marked_as_deleted: self.is_marked_as_deleted,
            storage_version,
        }
    }
}

// ============================================================================
// CoordinationStorage
// ============================================================================

/// Thin CAS layer over the external key/value store (§4.2, §6).
///
/// Implementations only need to provide single-entry compare-and-swap;
/// everything above this trait (locking, waiting, caching) is built purely
/// in terms of `get_entry`/`update_entry`.
#[async_trait]
pub trait CoordinationStorage: Send + Sync {
    /// Current image for `key`, or `None` if absent.
    async fn get_entry(&self, key: &str) -> Result<Option<StoredEntry>>;

    /// Compare-and-swap: if the stored current image equals `expected`
    /// (including both being `None`), install `desired` and return
    /// `expected`. Otherwise return the actual current image untouched.
    async fn update_entry(
        &self,
        desired: Option<StoredEntry>,
        expected: Option<StoredEntry>,
    ) -> Result<Option<StoredEntry>>;
}

/// Wraps a [`CoordinationStorage`] and retries `TransientIO` failures up to
/// `budget` times before giving up and surfacing the error. Every other
/// error kind passes through on the first attempt, matching
/// [`CoordinationError::is_transient`]'s contract that only `TransientIO`
/// is ever worth a second try.
///
/// `budget = 0` disables retrying entirely; the wrapper then behaves as a
/// transparent passthrough.
pub struct RetryingStorage {
    inner: std::sync::Arc<dyn CoordinationStorage>,
    budget: u32,
}

impl RetryingStorage {
    pub fn new(inner: std::sync::Arc<dyn CoordinationStorage>, budget: u32) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self { inner, budget })
    }
}

#[async_trait]
impl CoordinationStorage for RetryingStorage {
    async fn get_entry(&self, key: &str) -> Result<Option<StoredEntry>> {
        let mut attempt = 0;
        loop {
            match self.inner.get_entry(key).await {
                Err(e) if e.is_transient() && attempt < self.budget => {
                    attempt += 1;
                    continue;
                }
                result => return result,
            }
        }
    }

    async fn update_entry(
        &self,
        desired: Option<StoredEntry>,
        expected: Option<StoredEntry>,
    ) -> Result<Option<StoredEntry>> {
        let mut attempt = 0;
        loop {
            match self
                .inner
                .update_entry(desired.clone(), expected.clone())
                .await
            {
                Err(e) if e.is_transient() && attempt < self.budget => {
                    attempt += 1;
                    continue;
                }
                result => return result,
            }
        }
    }
}

/// Reference [`CoordinationStorage`] backed by a sharded concurrent map.
///
/// Suitable for single-process tests and for a coordination service whose
/// durability is delegated entirely to peers (no persistence of its own);
/// production deployments supply their own `CoordinationStorage` backed by
/// a replicated store.
#[derive(Default)]
pub struct InMemoryStorage {
    entries: DashMap<Key, StoredEntry>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

#[async_trait]
impl CoordinationStorage for InMemoryStorage {
    async fn get_entry(&self, key: &str) -> Result<Option<StoredEntry>> {
        Ok(self.entries.get(key).map(|e| e.clone()))
    }

    async fn update_entry(
        &self,
        desired: Option<StoredEntry>,
        expected: Option<StoredEntry>,
    ) -> Result<Option<StoredEntry>> {
        let key = desired
            .as_ref()
            .or(expected.as_ref())
            .map(|e| e.key.clone())
            .ok_or_else(|| {
                CoordinationError::InvalidState(
                    "update_entry: desired and expected cannot both be absent".into(),
                )
            })?;

        // A tombstone (deleted, no locks) is equivalent to absence (§3);
        // this store chooses to represent that by not keeping a row for
        // it at all, so CAS comparisons normalize both sides first.
        let expected_norm = normalize(expected.clone());

        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let current_norm = normalize(Some(occupied.get().clone()));
                if current_norm == expected_norm {
                    match desired {
                        Some(d) if !d.is_tombstone() => {
                            occupied.insert(d);
                        }
                        _ => {
                            occupied.remove();
                        }
                    }
                    Ok(expected)
                } else {
                    Ok(Some(occupied.get().clone()))
                }
            }
            Entry::Vacant(vacant) => {
                if expected_norm.is_none() {
                    if let Some(d) = desired {
                        if !d.is_tombstone() {
                            vacant.insert(d);
                        }
                    }
                    Ok(None)
                } else {
                    // Expected a live entry, found none: CAS mismatch.
                    Ok(None)
                }
            }
        }
    }
}

fn normalize(image: Option<StoredEntry>) -> Option<StoredEntry> {
    image.filter(|e| !e.is_tombstone())
}
