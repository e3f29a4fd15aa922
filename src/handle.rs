use std::collections::HashMap;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;

use crate::collection::{CaptureMode, CollectionAccess, IndexMapping, IndexRange};
use crate::core::HandleId;
use crate::error::CaptureViolation;
use crate::key::Key;
use crate::permission::AccessIntent;

/// Bookkeeping of external holders, implemented by the runtime.
pub(crate) trait Holders: Send + Sync {
    fn retain(&self, id: HandleId);
    fn release(&self, id: HandleId);
}

/// Untyped, reference-counted reference to a handle in the arena.
///
/// Every clone counts as one external holder; the arena entry is reclaimed
/// once no holder and no outstanding use remain.
pub struct HandleRef {
    pub(crate) id: HandleId,
    pub(crate) key: Key,
    owner: Arc<dyn Holders>,
}

impl HandleRef {
    /// The caller must already have counted this holder in the arena.
    pub(crate) fn adopt(id: HandleId, key: Key, owner: Arc<dyn Holders>) -> Self {
        Self { id, key, owner }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn key(&self) -> &Key {
        &self.key
    }
}

impl Clone for HandleRef {
    fn clone(&self) -> Self {
        self.owner.retain(self.id);
        Self {
            id: self.id,
            key: self.key.clone(),
            owner: self.owner.clone(),
        }
    }
}

impl Drop for HandleRef {
    fn drop(&mut self) {
        self.owner.release(self.id);
    }
}

impl Debug for HandleRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HandleRef({:?}, {})", self.id, self.key)
    }
}

/// A type-safe reference to a named piece of data.
///
/// A `Handle<T>` is the durable identity of the data across all of its
/// versions. It does not grant access by itself: tasks declare what they
/// want to do with it through [`Access`]es built from the handle, and the
/// capture protocol derives the dependencies from those declarations.
pub struct Handle<T> {
    pub(crate) inner: HandleRef,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub(crate) fn new(inner: HandleRef) -> Self {
        Self {
            inner,
            _phantom: PhantomData,
        }
    }

    pub fn id(&self) -> HandleId {
        self.inner.id
    }

    pub fn key(&self) -> &Key {
        &self.inner.key
    }

    pub fn handle_ref(&self) -> &HandleRef {
        &self.inner
    }

    pub fn access(&self, intent: AccessIntent) -> Access<'_> {
        Access {
            handle: &self.inner,
            intent,
        }
    }

    pub fn read(&self) -> Access<'_> {
        self.access(AccessIntent::Read)
    }

    pub fn modify(&self) -> Access<'_> {
        self.access(AccessIntent::Modify)
    }

    pub fn schedule_read(&self) -> Access<'_> {
        self.access(AccessIntent::ScheduleRead)
    }

    pub fn schedule_modify(&self) -> Access<'_> {
        self.access(AccessIntent::ScheduleModify)
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self::new(self.inner.clone())
    }
}

impl<T> Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handle<{}>({})", std::any::type_name::<T>(), self.inner.key)
    }
}

/// A collection-typed handle whose elements are indexed over an extent.
///
/// Dereferences to the whole-collection [`Handle`], so plain accesses
/// (`read`, `modify`) address every element at once.
pub struct HandleCollection<T> {
    handle: Handle<T>,
    extent: IndexRange,
}

impl<T> HandleCollection<T> {
    pub(crate) fn new(handle: Handle<T>, extent: IndexRange) -> Self {
        Self { handle, extent }
    }

    pub fn extent(&self) -> &IndexRange {
        &self.extent
    }

    /// One element per task index, task index `i` addressing element `i`.
    pub fn each(&self, intent: AccessIntent) -> CollectionAccess<'_> {
        self.each_mapped(intent, IndexMapping::Identity)
    }

    pub fn each_mapped(&self, intent: AccessIntent, mapping: IndexMapping) -> CollectionAccess<'_> {
        CollectionAccess::Each {
            collection: &self.handle.inner,
            intent,
            mapping,
            mode: CaptureMode::Scatter,
        }
    }

    /// Like [`each`](Self::each), followed by a fan-in of every element into
    /// a single successor version.
    pub fn gather_each(&self, intent: AccessIntent) -> CollectionAccess<'_> {
        CollectionAccess::Each {
            collection: &self.handle.inner,
            intent,
            mapping: IndexMapping::Identity,
            mode: CaptureMode::Gather,
        }
    }
}

impl<T> Deref for HandleCollection<T> {
    type Target = Handle<T>;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl<T> Clone for HandleCollection<T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            extent: self.extent.clone(),
        }
    }
}

impl<T> Debug for HandleCollection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HandleCollection({}, {})", self.handle.key(), self.extent)
    }
}

/// One `(handle, intent)` pair declared by a task-creation call.
#[derive(Debug, Clone, Copy)]
pub struct Access<'a> {
    pub(crate) handle: &'a HandleRef,
    pub(crate) intent: AccessIntent,
}

impl Access<'_> {
    pub fn key(&self) -> &Key {
        &self.handle.key
    }

    pub fn intent(&self) -> AccessIntent {
        self.intent
    }
}

#[derive(Debug)]
pub(crate) struct HandleEntry {
    pub key: Key,
    pub rank: u32,
    pub extent: Option<IndexRange>,
    holders: usize,
    uses: usize,
}

/// Arena of every live handle, indexed by `(rank, key)`.
#[derive(Debug, Default)]
pub(crate) struct HandleArena {
    entries: HashMap<HandleId, HandleEntry>,
    by_key: HashMap<(u32, Key), HandleId>,
    next: u32,
}

impl HandleArena {
    /// Creates an entry with a single holder and no uses.
    pub fn insert(
        &mut self,
        rank: u32,
        key: Key,
        extent: Option<IndexRange>,
    ) -> Result<HandleId, CaptureViolation> {
        if self.by_key.contains_key(&(rank, key.clone())) {
            return Err(CaptureViolation::DuplicateKey { key });
        }

        let id = HandleId(self.next);
        self.next += 1;

        self.by_key.insert((rank, key.clone()), id);
        self.entries.insert(
            id,
            HandleEntry {
                key,
                rank,
                extent,
                holders: 1,
                uses: 0,
            },
        );

        Ok(id)
    }

    pub fn get(&self, id: HandleId) -> Option<&HandleEntry> {
        self.entries.get(&id)
    }

    pub fn lookup(&self, rank: u32, key: &Key) -> Option<HandleId> {
        self.by_key.get(&(rank, key.clone())).copied()
    }

    pub fn retain(&mut self, id: HandleId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.holders += 1;
        }
    }

    pub fn drop_holder(&mut self, id: HandleId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.holders = entry.holders.saturating_sub(1);
        }
        self.reclaim(id);
    }

    pub fn use_added(&mut self, id: HandleId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.uses += 1;
        }
    }

    pub fn use_removed(&mut self, id: HandleId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.uses = entry.uses.saturating_sub(1);
        }
        self.reclaim(id);
    }

    pub fn live(&self, rank: u32) -> usize {
        self.entries.values().filter(|e| e.rank == rank).count()
    }

    fn reclaim(&mut self, id: HandleId) {
        let Some(entry) = self.entries.get(&id) else {
            return;
        };

        if entry.holders == 0 && entry.uses == 0 {
            tracing::debug!("reclaiming handle {} on rank {}", entry.key, entry.rank);
            self.by_key.remove(&(entry.rank, entry.key.clone()));
            self.entries.remove(&id);
        }
    }
}
