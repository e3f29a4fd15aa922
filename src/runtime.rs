//! The calling contexts user code interacts with.
//!
//! A [`Runtime`] owns the backend and every piece of capture bookkeeping
//! behind one lock, so task-creation calls are totally ordered even when
//! contexts of concurrently running tasks are used from several threads.
//! Task bodies are never run here: an executor asks the backend which tasks
//! are ready, [`enters`](Runtime::enter) them, and finishes their contexts.
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::Level;

use crate::backend::{Arm, Backend, GraphBackend, Guard, UseDescriptor, UseRole};
use crate::capture;
use crate::codec::{self, Payload};
use crate::collection::{CollectionAccess, IndexRange, TaskCollection};
use crate::conditional::{self, Branches, ConditionRecord, Conditional};
use crate::config::{Config, Feature};
use crate::core::{CondId, FlowId, HandleId, TaskId, UseId};
use crate::error::{CaptureViolation, WeftError};
use crate::handle::{Access, Handle, HandleArena, HandleCollection, HandleRef, Holders};
use crate::key::Key;
use crate::permission::{AccessIntent, Permission, Permissions};

/// Lifecycle of a task as seen by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Spawned, its body has not started.
    Pending,
    /// Its context is open.
    Running,
    Finished,
    /// Belongs to the branch of a conditional that was not taken.
    Skipped,
}

/// The calling context's current use of a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Live {
    Whole(UseId),
    /// One use per element after a per-element modification.
    Split(BTreeMap<usize, UseId>),
}

impl Live {
    fn uses(&self) -> Vec<UseId> {
        match self {
            Live::Whole(id) => vec![*id],
            Live::Split(split) => split.values().copied().collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct UseRecord {
    pub handle: HandleId,
    pub key: Key,
    pub permissions: Permissions,
    pub in_flow: FlowId,
    pub out_flow: FlowId,
}

#[derive(Debug)]
pub(crate) struct TaskRecord {
    pub name: Arc<str>,
    pub rank: u32,
    pub parent: Option<TaskId>,
    pub state: TaskState,
    pub live: BTreeMap<HandleId, Live>,
    pub released: BTreeSet<HandleId>,
    pub guard: Option<Guard>,
    pub decides: Option<CondId>,
}

#[derive(Debug)]
pub(crate) struct State<B> {
    pub config: Config,
    pub backend: B,
    pub arena: HandleArena,
    pub uses: HashMap<UseId, UseRecord>,
    pub tasks: Vec<TaskRecord>,
    pub conditions: HashMap<CondId, ConditionRecord>,
    next_condition: u32,
}

impl<B: Backend> State<B> {
    fn new(config: Config, backend: B) -> Self {
        Self {
            config,
            backend,
            arena: HandleArena::default(),
            uses: HashMap::new(),
            tasks: Vec::new(),
            conditions: HashMap::new(),
            next_condition: 0,
        }
    }

    pub fn task(&self, task: TaskId) -> Result<&TaskRecord, WeftError> {
        self.tasks
            .get(task.index())
            .ok_or(WeftError::UnknownTask(task))
    }

    /// The task, provided its context is open.
    pub fn running(&self, task: TaskId) -> Result<&TaskRecord, WeftError> {
        let record = self.task(task)?;
        match record.state {
            TaskState::Running => Ok(record),
            state => Err(WeftError::TaskState { task, state }),
        }
    }

    pub fn task_name(&self, task: TaskId) -> Arc<str> {
        match self.tasks.get(task.index()) {
            Some(record) => record.name.clone(),
            None => Arc::from(task.to_string()),
        }
    }

    pub fn key_of(&self, handle: HandleId) -> Key {
        match self.arena.get(handle) {
            Some(entry) => entry.key.clone(),
            None => Key::from(handle.to_string()),
        }
    }

    pub fn live(&self, task: TaskId, handle: HandleId) -> Option<&Live> {
        self.tasks.get(task.index())?.live.get(&handle)
    }

    pub fn set_live(&mut self, task: TaskId, handle: HandleId, live: Live) {
        if let Some(record) = self.tasks.get_mut(task.index()) {
            record.live.insert(handle, live);
        }
    }

    /// The single use `task` holds on `handle`.
    fn whole_use(&self, task: TaskId, handle: &HandleRef) -> Result<UseId, CaptureViolation> {
        match self.live(task, handle.id) {
            Some(Live::Whole(id)) => Ok(*id),
            Some(Live::Split(_)) => Err(CaptureViolation::UnjoinedBranches {
                key: handle.key.clone(),
            }),
            None => Err(CaptureViolation::NotCaptured {
                key: handle.key.clone(),
            }),
        }
    }

    fn new_root(&mut self, rank: u32) -> TaskId {
        let id = TaskId(self.tasks.len() as u32);
        self.tasks.push(TaskRecord {
            name: Arc::from(format!("root@{rank}")),
            rank,
            parent: None,
            state: TaskState::Running,
            live: BTreeMap::new(),
            released: BTreeSet::new(),
            guard: None,
            decides: None,
        });
        id
    }

    pub fn new_task(
        &mut self,
        name: Cow<'static, str>,
        parent: TaskId,
        guard: Option<Guard>,
    ) -> TaskId {
        let id = TaskId(self.tasks.len() as u32);
        let rank = self.tasks.get(parent.index()).map_or(0, |p| p.rank);
        self.tasks.push(TaskRecord {
            name: Arc::from(&*name),
            rank,
            parent: Some(parent),
            state: TaskState::Pending,
            live: BTreeMap::new(),
            released: BTreeSet::new(),
            guard,
            decides: None,
        });
        id
    }

    pub fn new_condition(&mut self) -> CondId {
        let id = CondId(self.next_condition);
        self.next_condition += 1;
        id
    }

    pub fn set_decides(&mut self, task: TaskId, cond: CondId) {
        if let Some(record) = self.tasks.get_mut(task.index()) {
            record.decides = Some(cond);
        }
    }

    pub fn decides(&self, task: TaskId) -> Option<CondId> {
        self.tasks.get(task.index())?.decides
    }

    /// Hands a new use to the backend and counts it against its handle.
    pub fn register(&mut self, handle: HandleId, descriptor: UseDescriptor) -> UseId {
        let record = UseRecord {
            handle,
            key: descriptor.key.clone(),
            permissions: descriptor.permissions,
            in_flow: descriptor.in_flow,
            out_flow: descriptor.out_flow,
        };

        let id = self.backend.register_use(descriptor);
        self.adopt_use(id, record);
        id
    }

    /// Counts a use the backend registered on its own.
    fn adopt_use(&mut self, id: UseId, record: UseRecord) {
        self.arena.use_added(record.handle);
        self.uses.insert(id, record);
    }

    /// Drops the bookkeeping of a use the backend already released.
    fn forget_use(&mut self, id: UseId) {
        if let Some(record) = self.uses.remove(&id) {
            self.arena.use_removed(record.handle);
        }
    }

    /// Releases a use exactly once.
    pub fn retire(&mut self, id: UseId) -> Result<FlowId, WeftError> {
        let out_flow = self.backend.release_use(id)?;
        self.forget_use(id);
        Ok(out_flow)
    }

    /// Fans a split handle back into a single use of `task`.
    pub fn gather(&mut self, task: TaskId, handle: HandleId) -> Result<(), WeftError> {
        let Some(Live::Split(split)) = self.live(task, handle).cloned() else {
            return Ok(());
        };

        let mut flows = Vec::new();
        let mut scheduling = Permission::None;
        let mut out_flow = None;

        for id in split.values() {
            let Some(record) = self.uses.get(id) else {
                continue;
            };
            if !flows.contains(&record.in_flow) {
                flows.push(record.in_flow);
            }
            scheduling = scheduling.max(record.permissions.scheduling);
            out_flow = Some(record.out_flow);
        }

        let Some(out_flow) = out_flow else {
            return Err(CaptureViolation::NotCaptured {
                key: self.key_of(handle),
            }
            .into());
        };

        let key = self.key_of(handle);
        let in_flow = self.backend.make_gather_flow(&key, flows);
        let task_name = self.task_name(task);

        let whole = self.register(
            handle,
            UseDescriptor {
                key,
                task,
                task_name,
                permissions: Permissions {
                    scheduling,
                    immediate: Permission::None,
                },
                in_flow,
                out_flow,
                role: UseRole::Continuation,
                guard: None,
            },
        );
        self.set_live(task, handle, Live::Whole(whole));

        for id in split.into_values() {
            self.retire(id)?;
        }

        Ok(())
    }

    /// Releases the use `task` holds on `handle`, gathering it first if
    /// it is split.
    fn release_handle(&mut self, task: TaskId, handle: &HandleRef) -> Result<(), WeftError> {
        let record = self.task(task)?;
        match record.live.get(&handle.id) {
            Some(_) => {}
            None if record.released.contains(&handle.id) => {
                return Err(CaptureViolation::DoubleRelease {
                    key: handle.key.clone(),
                }
                .into());
            }
            None => {
                return Err(CaptureViolation::NotCaptured {
                    key: handle.key.clone(),
                }
                .into());
            }
        }

        self.gather(task, handle.id)?;

        let id = self.whole_use(task, handle)?;
        self.retire(id)?;

        if let Some(record) = self.tasks.get_mut(task.index()) {
            record.live.remove(&handle.id);
            record.released.insert(handle.id);
        }

        tracing::debug!("{} released {}", task, handle.key);
        Ok(())
    }

    /// Marks a branch task as skipped and abandons its uses.
    pub fn skip(&mut self, task: TaskId) -> Result<(), WeftError> {
        let Some(record) = self.tasks.get_mut(task.index()) else {
            return Err(WeftError::UnknownTask(task));
        };

        record.state = TaskState::Skipped;
        let live = std::mem::take(&mut record.live);

        for id in live.values().flat_map(Live::uses) {
            self.retire(id)?;
        }

        tracing::debug!("skipped {}", task);
        Ok(())
    }

    fn finish(&mut self, task: TaskId) -> Result<(), WeftError> {
        let record = self.running(task)?;

        if let Some(cond) = record.decides
            && self
                .conditions
                .get(&cond)
                .is_none_or(|c| c.decided.is_none())
        {
            return Err(CaptureViolation::UndecidedCondition {
                task: record.name.to_string(),
            }
            .into());
        }

        let split = record
            .live
            .iter()
            .find(|(_, live)| matches!(live, Live::Split(_)))
            .map(|(&handle, _)| handle);

        if let Some(handle) = split {
            return Err(CaptureViolation::MissingRelease {
                key: self.key_of(handle),
            }
            .into());
        }

        let live = match self.tasks.get_mut(task.index()) {
            Some(record) => std::mem::take(&mut record.live),
            None => BTreeMap::new(),
        };

        for id in live.values().flat_map(Live::uses) {
            self.retire(id)?;
        }

        if let Some(record) = self.tasks.get_mut(task.index()) {
            record.released.extend(live.keys());
            record.state = TaskState::Finished;
        }

        tracing::debug!("finished {}", task);
        Ok(())
    }
}

/// A holder count change not yet applied to the arena.
#[derive(Debug, Clone, Copy)]
enum HolderChange {
    Retain(HandleId),
    Release(HandleId),
}

pub(crate) struct Shared<B> {
    state: Mutex<State<B>>,
    /// Queued so handles can be cloned and dropped while `state` is held.
    holders: Mutex<Vec<HolderChange>>,
}

impl<B: Backend> Shared<B> {
    fn lock(&self) -> MutexGuard<'_, State<B>> {
        // Every mutation is validated before it is committed, a panicking
        // holder can't leave a half-applied capture behind.
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let changes = std::mem::take(&mut *self.queue());
        for change in changes {
            match change {
                HolderChange::Retain(id) => state.arena.retain(id),
                HolderChange::Release(id) => state.arena.drop_holder(id),
            }
        }

        state
    }

    fn queue(&self) -> MutexGuard<'_, Vec<HolderChange>> {
        self.holders.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<B: Backend> Holders for Shared<B> {
    fn retain(&self, id: HandleId) {
        self.queue().push(HolderChange::Retain(id));
    }

    fn release(&self, id: HandleId) {
        self.queue().push(HolderChange::Release(id));
    }
}

/// Entry point owning the backend and every calling context.
///
/// ```rust
/// use weft::{Config, Runtime};
///
/// let runtime = Runtime::in_memory(Config::default());
/// let root = runtime.root(0).unwrap();
///
/// let x = root.create_handle::<u32>("x").unwrap();
/// let writer = root.spawn("writer", &[x.modify()]).unwrap();
/// let reader = root.spawn("reader", &[x.read()]).unwrap();
///
/// assert!(runtime.with_backend(|b| b.is_task_ready(writer)));
/// assert!(!runtime.with_backend(|b| b.is_task_ready(reader)));
/// ```
pub struct Runtime<B: Backend = GraphBackend> {
    shared: Arc<Shared<B>>,
}

impl<B: Backend> Clone for Runtime<B> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Runtime<GraphBackend> {
    /// A runtime backed by a [`GraphBackend`] advertising the configured
    /// features.
    pub fn in_memory(config: Config) -> Self {
        let backend = GraphBackend::from_config(&config);
        Self::new(config, backend)
    }
}

impl<B: Backend> Runtime<B> {
    pub fn new(config: Config, backend: B) -> Self {
        tracing::debug!("runtime with {} rank(s)", config.ranks);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::new(config, backend)),
                holders: Mutex::new(Vec::new()),
            }),
        }
    }

    fn context(&self, task: TaskId) -> TaskContext<B> {
        TaskContext {
            shared: self.shared.clone(),
            task,
        }
    }

    /// Opens the top-level context of an execution context.
    pub fn root(&self, rank: u32) -> Result<TaskContext<B>, WeftError> {
        let mut state = self.shared.lock();

        let ranks = state.config.ranks;
        if rank >= ranks {
            return Err(WeftError::UnknownRank { rank, ranks });
        }

        let task = state.new_root(rank);
        Ok(self.context(task))
    }

    /// Opens the context of a spawned task whose body is about to run.
    pub fn enter(&self, task: TaskId) -> Result<TaskContext<B>, WeftError> {
        let mut state = self.shared.lock();

        let record = state.task(task)?;
        if record.state != TaskState::Pending {
            return Err(WeftError::TaskState {
                task,
                state: record.state,
            });
        }

        if let Some(guard) = record.guard
            && state
                .conditions
                .get(&guard.cond)
                .is_none_or(|c| c.decided.is_none())
        {
            return Err(WeftError::BranchUnresolved { task });
        }

        if let Some(record) = state.tasks.get_mut(task.index()) {
            record.state = TaskState::Running;
            tracing::debug!("entered {} ({})", task, record.name);
        }

        Ok(self.context(task))
    }

    pub fn task_state(&self, task: TaskId) -> Option<TaskState> {
        self.shared.lock().task(task).ok().map(|record| record.state)
    }

    pub fn task_name(&self, task: TaskId) -> Option<Arc<str>> {
        self.shared
            .lock()
            .task(task)
            .ok()
            .map(|record| record.name.clone())
    }

    pub fn parent(&self, task: TaskId) -> Option<TaskId> {
        self.shared.lock().task(task).ok()?.parent
    }

    /// Handles still alive in the arena of `rank`.
    pub fn live_handles(&self, rank: u32) -> usize {
        self.shared.lock().arena.live(rank)
    }

    pub fn config(&self) -> Config {
        self.shared.lock().config.clone()
    }

    /// Runs `f` against the backend, e.g. to query readiness.
    ///
    /// `f` runs under the runtime's lock and must not call back into a
    /// context. Cloning and dropping handles inside it is fine.
    pub fn with_backend<R>(&self, f: impl FnOnce(&B) -> R) -> R {
        f(&self.shared.lock().backend)
    }

    /// Reports publications that were not fetched as often as declared and
    /// tasks that never finished.
    ///
    /// With `strict_finalize` disabled these are only logged.
    pub fn finalize(&self) -> Result<(), WeftError> {
        let state = self.shared.lock();

        let under_fetched = state.backend.under_fetched();
        for mismatch in &under_fetched {
            tracing::warn!("{mismatch}");
        }

        let unfinished: Vec<_> = state
            .tasks
            .iter()
            .filter(|t| matches!(t.state, TaskState::Pending | TaskState::Running))
            .map(|t| t.name.to_string())
            .collect();

        if !unfinished.is_empty() {
            tracing::warn!("unfinished tasks: {}", unfinished.join(", "));
        }

        if !state.config.strict_finalize {
            return Ok(());
        }

        if let Some(mismatch) = under_fetched.into_iter().next() {
            return Err(mismatch.into());
        }

        if !unfinished.is_empty() {
            return Err(WeftError::Unfinished {
                count: unfinished.len(),
                names: unfinished.join(", "),
            });
        }

        Ok(())
    }
}

/// The calling context of one task: root scope or a spawned task's body.
///
/// Every task-creation call captures from the uses this context currently
/// holds and continues them forward, so calls on one context are observed
/// in program order.
pub struct TaskContext<B: Backend = GraphBackend> {
    shared: Arc<Shared<B>>,
    task: TaskId,
}

impl<B: Backend> std::fmt::Debug for TaskContext<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaskContext({})", self.task)
    }
}

impl<B: Backend> TaskContext<B> {
    pub fn id(&self) -> TaskId {
        self.task
    }

    fn state(&self) -> MutexGuard<'_, State<B>> {
        self.shared.lock()
    }

    fn holders(&self) -> Arc<dyn Holders> {
        self.shared.clone()
    }

    fn create(&self, key: &Key, extent: Option<IndexRange>) -> Result<HandleId, WeftError> {
        let mut state = self.state();
        let rank = state.running(self.task)?.rank;

        let id = state.arena.insert(rank, key.clone(), extent)?;
        let null = state.backend.make_null_flow(key);
        let next = state.backend.make_next_flow(key, null);
        let task_name = state.task_name(self.task);

        let initial = state.register(
            id,
            UseDescriptor {
                key: key.clone(),
                task: self.task,
                task_name,
                permissions: Permissions::MODIFY_MODIFY,
                in_flow: null,
                out_flow: next,
                role: UseRole::Initial,
                guard: None,
            },
        );
        state.set_live(self.task, id, Live::Whole(initial));

        tracing::debug!("{} created {}", self.task, key);
        Ok(id)
    }

    /// Creates a handle this context holds with `Modify/Modify`.
    pub fn create_handle<T: Payload>(&self, key: impl Into<Key>) -> Result<Handle<T>, WeftError> {
        let key = key.into();
        let id = self.create(&key, None)?;
        Ok(Handle::new(HandleRef::adopt(id, key, self.holders())))
    }

    /// Creates a collection-typed handle indexed over `extent`.
    pub fn create_collection<T: Payload>(
        &self,
        key: impl Into<Key>,
        extent: IndexRange,
    ) -> Result<HandleCollection<T>, WeftError> {
        if !self.state().backend.supports(Feature::Collections) {
            return Err(WeftError::CapabilityMissing(Feature::Collections));
        }

        let key = key.into();
        let id = self.create(&key, Some(extent.clone()))?;
        let handle = Handle::new(HandleRef::adopt(id, key, self.holders()));
        Ok(HandleCollection::new(handle, extent))
    }

    /// Spawns a task declaring `accesses`. Either every access is captured
    /// or the call fails and nothing changes.
    pub fn spawn(
        &self,
        name: impl Into<Cow<'static, str>>,
        accesses: &[Access<'_>],
    ) -> Result<TaskId, WeftError> {
        let name = name.into();
        let span = tracing::span!(Level::DEBUG, "capture", task = %name);
        let _enter = span.enter();

        let mut state = self.state();
        state.running(self.task)?;

        capture::spawn(&mut state, self.task, name, accesses)
            .inspect_err(|err| tracing::warn!("spawn refused: {err}"))
    }

    /// Spawns one task per index of `range`.
    pub fn spawn_collection(
        &self,
        name: impl Into<Cow<'static, str>>,
        range: &IndexRange,
        accesses: &[CollectionAccess<'_>],
    ) -> Result<TaskCollection, WeftError> {
        let name = name.into();
        let span = tracing::span!(Level::DEBUG, "capture", task = %name, range = %range);
        let _enter = span.enter();

        let mut state = self.state();
        state.running(self.task)?;

        capture::spawn_collection(&mut state, self.task, name, range, accesses)
            .inspect_err(|err| tracing::warn!("collection spawn refused: {err}"))
    }

    /// Spawns an if/then/else group.
    pub fn spawn_if(
        &self,
        name: impl Into<Cow<'static, str>>,
        branches: Branches<'_>,
    ) -> Result<Conditional, WeftError> {
        let name = name.into();
        let span = tracing::span!(Level::DEBUG, "capture", task = %name);
        let _enter = span.enter();

        let mut state = self.state();
        state.running(self.task)?;

        conditional::spawn_if(&mut state, self.task, name, branches)
            .inspect_err(|err| tracing::warn!("conditional refused: {err}"))
    }

    /// Reports the outcome of the condition this if-task evaluates.
    pub fn decide(&self, outcome: bool) -> Result<Arm, WeftError> {
        let mut state = self.state();
        state.running(self.task)?;
        conditional::decide(&mut state, self.task, outcome)
    }

    /// Rejoins the per-element versions of a split collection.
    pub fn gather<T>(&self, handle: &Handle<T>) -> Result<(), WeftError> {
        let mut state = self.state();
        state.running(self.task)?;

        if state.live(self.task, handle.id()).is_none() {
            return Err(CaptureViolation::NotCaptured {
                key: handle.key().clone(),
            }
            .into());
        }

        state.gather(self.task, handle.id())
    }

    /// Releases this context's use of `handle`, producing its out-flow.
    pub fn release<T>(&self, handle: &Handle<T>) -> Result<(), WeftError> {
        let mut state = self.state();
        state.running(self.task)?;
        state.release_handle(self.task, handle.handle_ref())
    }

    /// Makes the version this context holds available to `n_fetchers`
    /// future fetches under `version`.
    ///
    /// A split collection publishes every element under its element key,
    /// and only if all of them are readable.
    pub fn publish<T>(
        &self,
        handle: &Handle<T>,
        version: impl Into<Key>,
        n_fetchers: usize,
    ) -> Result<(), WeftError> {
        let version = version.into();
        let mut state = self.state();
        state.running(self.task)?;

        if !state.backend.supports(Feature::Publication) {
            return Err(WeftError::CapabilityMissing(Feature::Publication));
        }

        let live = state
            .live(self.task, handle.id())
            .cloned()
            .ok_or_else(|| CaptureViolation::NotCaptured {
                key: handle.key().clone(),
            })?;

        let mut published = Vec::new();
        for id in live.uses() {
            let record = state
                .uses
                .get(&id)
                .ok_or_else(|| CaptureViolation::NotCaptured {
                    key: handle.key().clone(),
                })?;

            if !record.permissions.can_read() {
                return Err(CaptureViolation::ImmediatePermission {
                    key: record.key.clone(),
                    held: record.permissions,
                    required: Permission::Read,
                }
                .into());
            }

            state.backend.check_publish(&record.key, &version)?;
            published.push((id, record.clone()));
        }

        let task_name = state.task_name(self.task);
        let mut live = live;

        for (id, record) in published {
            let publication = state.backend.publish(id, &version, n_fetchers)?;
            if !publication.retired {
                state.adopt_use(
                    publication.holder,
                    UseRecord {
                        permissions: Permissions::READ_READ,
                        out_flow: record.in_flow,
                        ..record.clone()
                    },
                );
            }

            // The published version must stay as it is until it drains.
            let permissions = record.permissions.after(AccessIntent::Read);
            if permissions != record.permissions {
                let next = state.register(
                    record.handle,
                    UseDescriptor {
                        key: record.key.clone(),
                        task: self.task,
                        task_name: task_name.clone(),
                        permissions,
                        in_flow: record.in_flow,
                        out_flow: record.out_flow,
                        role: UseRole::Continuation,
                        guard: None,
                    },
                );
                match &mut live {
                    Live::Whole(current) => *current = next,
                    Live::Split(split) => {
                        for current in split.values_mut().filter(|current| **current == id) {
                            *current = next;
                        }
                    }
                }
                state.set_live(self.task, record.handle, live.clone());
                state.retire(id)?;
            }

            tracing::info!(
                "{} published {} at version {} for {} fetcher(s)",
                self.task,
                record.key,
                version,
                n_fetchers
            );
        }

        Ok(())
    }

    /// Fetches a published version, creating a read-only handle for it in
    /// this execution context.
    ///
    /// Handles are unique per key within a rank, so the fetch fails with
    /// `DuplicateKey` while the rank still holds a handle named `key`,
    /// whether created locally or fetched before.
    pub fn fetch<T: Payload>(
        &self,
        key: impl Into<Key>,
        version: impl Into<Key>,
    ) -> Result<Handle<T>, WeftError> {
        let key = key.into();
        let version = version.into();

        let id = {
            let mut state = self.state();
            let rank = state.running(self.task)?.rank;

            if !state.backend.supports(Feature::Publication) {
                return Err(WeftError::CapabilityMissing(Feature::Publication));
            }

            if state.arena.lookup(rank, &key).is_some() {
                return Err(CaptureViolation::DuplicateKey { key }.into());
            }

            let task_name = state.task_name(self.task);
            let fetched = state
                .backend
                .fetch(&key, &version, self.task, task_name)
                .inspect_err(|err| tracing::warn!("fetch refused: {err}"))?;

            let id = state.arena.insert(rank, key.clone(), None)?;
            state.adopt_use(
                fetched.id,
                UseRecord {
                    handle: id,
                    key: key.clone(),
                    permissions: Permissions::READ_READ,
                    in_flow: fetched.in_flow,
                    out_flow: fetched.in_flow,
                },
            );
            state.set_live(self.task, id, Live::Whole(fetched.id));

            if let Some(holder) = fetched.retired {
                state.forget_use(holder);
            }

            id
        };

        Ok(Handle::new(HandleRef::adopt(id, key, self.holders())))
    }

    /// Stores `value` as the data this context is modifying.
    pub fn set<T: Payload>(&self, handle: &Handle<T>, value: &T) -> Result<(), WeftError> {
        let bytes = codec::encode(value)?;

        let mut state = self.state();
        state.running(self.task)?;

        let id = state.whole_use(self.task, handle.handle_ref())?;
        if let Some(record) = state.uses.get(&id)
            && !record.permissions.can_modify()
        {
            return Err(CaptureViolation::ImmediatePermission {
                key: handle.key().clone(),
                held: record.permissions,
                required: Permission::Modify,
            }
            .into());
        }

        state.backend.write_value(id, bytes)
    }

    /// Loads the data of the version this context holds.
    pub fn get<T: Payload>(&self, handle: &Handle<T>) -> Result<T, WeftError> {
        let bytes = {
            let state = self.state();
            state.running(self.task)?;

            let id = state.whole_use(self.task, handle.handle_ref())?;
            if let Some(record) = state.uses.get(&id)
                && !record.permissions.can_read()
            {
                return Err(CaptureViolation::ImmediatePermission {
                    key: handle.key().clone(),
                    held: record.permissions,
                    required: Permission::Read,
                }
                .into());
            }

            state.backend.read_value(id)?
        };

        Ok(codec::decode(&bytes)?)
    }

    /// Permissions currently held on `handle`, if it is held as a whole.
    pub fn permissions<T>(&self, handle: &Handle<T>) -> Option<Permissions> {
        let state = self.state();
        let id = state.whole_use(self.task, handle.handle_ref()).ok()?;
        state.uses.get(&id).map(|record| record.permissions)
    }

    /// The use this context currently holds on `handle`.
    pub fn current_use<T>(&self, handle: &Handle<T>) -> Option<UseId> {
        self.state()
            .whole_use(self.task, handle.handle_ref())
            .ok()
    }

    /// Scope exit: releases every use still held and marks the task finished.
    ///
    /// Fails, leaving the context open, when a collection is still split or
    /// when an if-task never decided its condition.
    pub fn finish(&self) -> Result<(), WeftError> {
        self.state()
            .finish(self.task)
            .inspect_err(|err| tracing::warn!("{} can't finish: {err}", self.task))
    }
}
