//! Derivation of new uses and flows when a task is spawned.
//!
//! Every task-creation call goes through two phases. A [`Plan`] is built
//! from the calling context's live uses by simulating the permission
//! transitions of every requested access; any violation aborts the call
//! before the backend sees anything. The plan is then committed: child uses
//! are registered, the calling context's uses are continued forward, and the
//! uses they replace are released.
use std::borrow::Cow;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};

use crate::backend::{Arm, Backend, Guard, UseDescriptor, UseRole};
use crate::collection::{CaptureMode, CollectionAccess, IndexMapping, IndexRange, TaskCollection};
use crate::config::Feature;
use crate::core::{CondId, FlowId, HandleId, TaskId, UseId};
use crate::error::{CaptureViolation, WeftError};
use crate::handle::{Access, HandleRef};
use crate::key::Key;
use crate::permission::{AccessIntent, Permission, Permissions, Refusal};
use crate::runtime::{Live, State};

/// The part of a handle a capture addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Lane {
    Whole,
    Element(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepKind {
    /// Continues the calling context's use forward.
    Advance,
    /// Captured against the pre-branch use, joined afterwards.
    Branch(Arm),
}

#[derive(Debug)]
struct Step {
    slot: usize,
    handle: HandleId,
    lane: Lane,
    /// The element the task sees, which may differ from the lane when
    /// elements share the unsplit version.
    element: Option<usize>,
    intent: AccessIntent,
    kind: StepKind,
}

#[derive(Debug)]
struct Source {
    key: Key,
    live: Live,
    extent: Option<IndexRange>,
    mode: CaptureMode,
}

/// Where a lane currently stands while a plan is committed.
#[derive(Debug, Clone, Copy)]
struct Cursor {
    permissions: Permissions,
    in_flow: FlowId,
    out_flow: FlowId,
}

/// A validated set of captures for one task-creation call.
///
/// `slot`s index the tasks the call creates; they are only allocated once
/// the plan is known to be legal.
#[derive(Debug)]
pub(crate) struct Plan {
    parent: TaskId,
    sources: BTreeMap<HandleId, Source>,
    permissions: BTreeMap<(HandleId, Lane), Permissions>,
    seen: HashSet<(usize, HandleId)>,
    steps: Vec<Step>,
}

impl Plan {
    pub fn new(parent: TaskId) -> Self {
        Self {
            parent,
            sources: BTreeMap::new(),
            permissions: BTreeMap::new(),
            seen: HashSet::new(),
            steps: Vec::new(),
        }
    }

    /// Captures the handle as a whole.
    pub fn whole<B: Backend>(
        &mut self,
        state: &State<B>,
        slot: usize,
        handle: &HandleRef,
        intent: AccessIntent,
        kind: StepKind,
    ) -> Result<(), CaptureViolation> {
        let source = self.source(state, handle)?;
        if matches!(source.live, Live::Split(_)) {
            return Err(CaptureViolation::UnjoinedBranches {
                key: handle.key.clone(),
            });
        }

        self.step(state, slot, handle, (Lane::Whole, None), intent, kind)
    }

    /// Captures the element task index `index` maps to.
    #[allow(clippy::too_many_arguments)]
    pub fn each<B: Backend>(
        &mut self,
        state: &State<B>,
        slot: usize,
        handle: &HandleRef,
        index: usize,
        mapping: &IndexMapping,
        intent: AccessIntent,
        mode: CaptureMode,
    ) -> Result<(), CaptureViolation> {
        let source = self.source(state, handle)?;
        let extent = source.extent.clone().unwrap_or(IndexRange::upto(0));

        let element = match mapping.map(index) {
            Some(element) if extent.contains(element) => element,
            mapped => {
                return Err(CaptureViolation::IndexOutOfRange {
                    key: handle.key.clone(),
                    index: mapped.unwrap_or(index),
                    extent,
                });
            }
        };

        if mode == CaptureMode::Gather {
            source.mode = CaptureMode::Gather;
        }

        // Reads of an unsplit collection share its version, only
        // modifications fan out per element.
        let lane = match (&source.live, intent.modifies()) {
            (Live::Split(_), _) | (_, true) => Lane::Element(element),
            _ => Lane::Whole,
        };

        self.step(state, slot, handle, (lane, Some(element)), intent, StepKind::Advance)
    }

    fn source<B: Backend>(
        &mut self,
        state: &State<B>,
        handle: &HandleRef,
    ) -> Result<&mut Source, CaptureViolation> {
        match self.sources.entry(handle.id) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let live = state
                    .live(self.parent, handle.id)
                    .cloned()
                    .ok_or_else(|| CaptureViolation::NotCaptured {
                        key: handle.key.clone(),
                    })?;

                let extent = state
                    .arena
                    .get(handle.id)
                    .and_then(|entry| entry.extent.clone());

                Ok(entry.insert(Source {
                    key: handle.key.clone(),
                    live,
                    extent,
                    mode: CaptureMode::Scatter,
                }))
            }
        }
    }

    fn step<B: Backend>(
        &mut self,
        state: &State<B>,
        slot: usize,
        handle: &HandleRef,
        (lane, element): (Lane, Option<usize>),
        intent: AccessIntent,
        kind: StepKind,
    ) -> Result<(), CaptureViolation> {
        let key = &handle.key;

        if !self.seen.insert((slot, handle.id)) {
            return Err(CaptureViolation::DuplicateAccess { key: key.clone() });
        }

        let held = match self.permissions.get(&(handle.id, lane)) {
            Some(&held) => held,
            None => self
                .sources
                .get(&handle.id)
                .and_then(|source| source.lane_use(lane))
                .and_then(|id| state.uses.get(&id))
                .map(|record| record.permissions)
                .ok_or_else(|| CaptureViolation::NotCaptured { key: key.clone() })?,
        };

        let next = held
            .capture(intent)
            .map_err(|refusal| refused(refusal, key, held, intent))?;

        let lane_permissions = match kind {
            StepKind::Advance => next,
            StepKind::Branch(_) => held,
        };
        self.permissions.insert((handle.id, lane), lane_permissions);

        self.steps.push(Step {
            slot,
            handle: handle.id,
            lane,
            element,
            intent,
            kind,
        });

        Ok(())
    }

    /// Registers every planned use. `tasks` maps slots to the spawned tasks,
    /// `cond` guards the uses of branch steps.
    pub fn commit<B: Backend>(
        self,
        state: &mut State<B>,
        tasks: &[TaskId],
        cond: Option<CondId>,
    ) -> Result<(), WeftError> {
        let Plan {
            parent,
            sources,
            steps,
            ..
        } = self;

        let mut cursors: BTreeMap<(HandleId, Lane), Cursor> = BTreeMap::new();
        let mut candidates: BTreeMap<(HandleId, Lane), [Option<FlowId>; 2]> = BTreeMap::new();

        for step in &steps {
            let (Some(source), Some(&task)) = (sources.get(&step.handle), tasks.get(step.slot))
            else {
                continue;
            };

            let key = lane_key(&source.key, step.lane);
            let cursor = match cursors.entry((step.handle, step.lane)) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    let record = source
                        .lane_use(step.lane)
                        .and_then(|id| state.uses.get(&id))
                        .ok_or_else(|| CaptureViolation::NotCaptured { key: key.clone() })?;

                    entry.insert(Cursor {
                        permissions: record.permissions,
                        in_flow: record.in_flow,
                        out_flow: record.out_flow,
                    })
                }
            };

            let modifies = step.intent.modifies();
            let in_flow = cursor.in_flow;
            let out_flow = match modifies {
                true => state.backend.make_next_flow(&key, in_flow),
                false => state.backend.make_same_flow(in_flow),
            };

            let guard = match (step.kind, cond) {
                (StepKind::Branch(arm), Some(cond)) => Some(Guard { cond, arm }),
                _ => None,
            };

            let task_name = state.task_name(task);
            let child_key = match step.element {
                Some(element) => source.key.element(element),
                None => key,
            };
            let child = state.register(
                step.handle,
                UseDescriptor {
                    key: child_key,
                    task,
                    task_name,
                    permissions: step.intent.permissions(),
                    in_flow,
                    out_flow,
                    role: UseRole::Captured,
                    guard,
                },
            );
            state.set_live(task, step.handle, Live::Whole(child));

            match step.kind {
                StepKind::Advance => {
                    cursor.permissions = cursor.permissions.after(step.intent);
                    if modifies {
                        cursor.in_flow = out_flow;
                    }
                }
                StepKind::Branch(arm) => {
                    let candidate = match modifies {
                        true => out_flow,
                        false => in_flow,
                    };
                    let slot = match arm {
                        Arm::Then => 0,
                        Arm::Else => 1,
                    };
                    candidates.entry((step.handle, step.lane)).or_default()[slot] =
                        Some(candidate);
                }
            }
        }

        // An arm that left the handle alone contributes the pre-branch version.
        for (lane, [then, otherwise]) in candidates {
            let (Some(cursor), Some(source)) = (cursors.get_mut(&lane), sources.get(&lane.0))
            else {
                continue;
            };

            let then = then.unwrap_or(cursor.in_flow);
            let otherwise = otherwise.unwrap_or(cursor.in_flow);

            match (then == otherwise, cond) {
                (false, Some(cond)) => {
                    let key = lane_key(&source.key, lane.1);
                    cursor.in_flow = state.backend.make_join_flow(&key, cond, then, otherwise);
                    cursor.permissions = Permissions {
                        scheduling: cursor.permissions.scheduling,
                        immediate: Permission::None,
                    };
                }
                _ => cursor.permissions = cursor.permissions.after(AccessIntent::Read),
            }
        }

        for (handle, source) in sources {
            let lanes: BTreeMap<Lane, Cursor> = cursors
                .range((handle, Lane::Whole)..=(handle, Lane::Element(usize::MAX)))
                .map(|(&(_, lane), &cursor)| (lane, cursor))
                .collect();

            if lanes.is_empty() {
                continue;
            }

            continue_source(state, parent, handle, source, lanes)?;
        }

        Ok(())
    }
}

impl Source {
    /// The calling context's use a lane starts from.
    fn lane_use(&self, lane: Lane) -> Option<UseId> {
        match (&self.live, lane) {
            (Live::Whole(id), _) => Some(*id),
            (Live::Split(map), Lane::Element(element)) => map.get(&element).copied(),
            (Live::Split(_), Lane::Whole) => None,
        }
    }
}

/// Replaces the calling context's uses of one handle by their continuations.
fn continue_source<B: Backend>(
    state: &mut State<B>,
    parent: TaskId,
    handle: HandleId,
    source: Source,
    lanes: BTreeMap<Lane, Cursor>,
) -> Result<(), WeftError> {
    let task_name = state.task_name(parent);

    let register = |state: &mut State<B>, key: Key, cursor: Cursor| {
        state.register(
            handle,
            UseDescriptor {
                key,
                task: parent,
                task_name: task_name.clone(),
                permissions: cursor.permissions,
                in_flow: cursor.in_flow,
                out_flow: cursor.out_flow,
                role: UseRole::Continuation,
                guard: None,
            },
        )
    };

    match source.live {
        Live::Whole(id) => {
            if let Some(cursor) = lanes.get(&Lane::Whole) {
                let next = register(state, source.key.clone(), *cursor);
                state.set_live(parent, handle, Live::Whole(next));
                state.retire(id)?;
                return Ok(());
            }

            let Some(record) = state.uses.get(&id) else {
                return Err(CaptureViolation::NotCaptured { key: source.key }.into());
            };

            let untouched = Cursor {
                permissions: record.permissions,
                in_flow: record.in_flow,
                out_flow: record.out_flow,
            };

            let extent = source.extent.clone().unwrap_or(IndexRange::upto(0));
            let elements: BTreeMap<usize, Cursor> = extent
                .indices()
                .into_iter()
                .map(|e| (e, lanes.get(&Lane::Element(e)).copied().unwrap_or(untouched)))
                .collect();

            match source.mode {
                CaptureMode::Scatter => {
                    let mut split = BTreeMap::new();
                    for (element, cursor) in elements {
                        let next = register(state, source.key.element(element), cursor);
                        split.insert(element, next);
                    }
                    state.set_live(parent, handle, Live::Split(split));
                }
                CaptureMode::Gather => {
                    let mut flows: Vec<FlowId> = Vec::new();
                    for cursor in elements.values() {
                        if !flows.contains(&cursor.in_flow) {
                            flows.push(cursor.in_flow);
                        }
                    }

                    let gathered = Cursor {
                        permissions: Permissions {
                            scheduling: untouched.permissions.scheduling,
                            immediate: Permission::None,
                        },
                        in_flow: state.backend.make_gather_flow(&source.key, flows),
                        out_flow: untouched.out_flow,
                    };
                    let next = register(state, source.key.clone(), gathered);
                    state.set_live(parent, handle, Live::Whole(next));
                }
            }

            state.retire(id)?;
        }
        Live::Split(mut split) => {
            let mut retired = Vec::new();
            for (lane, cursor) in lanes {
                let Lane::Element(element) = lane else {
                    continue;
                };
                let next = register(state, source.key.element(element), cursor);
                if let Some(previous) = split.insert(element, next) {
                    retired.push(previous);
                }
            }
            state.set_live(parent, handle, Live::Split(split));

            for id in retired {
                state.retire(id)?;
            }

            if source.mode == CaptureMode::Gather {
                state.gather(parent, handle)?;
            }
        }
    }

    Ok(())
}

fn lane_key(key: &Key, lane: Lane) -> Key {
    match lane {
        Lane::Whole => key.clone(),
        Lane::Element(element) => key.element(element),
    }
}

fn refused(refusal: Refusal, key: &Key, held: Permissions, requested: AccessIntent) -> CaptureViolation {
    let key = key.clone();
    match refusal {
        Refusal::NoScheduling => CaptureViolation::NoSchedulingPermission {
            key,
            held,
            requested,
        },
        Refusal::Escalation => CaptureViolation::Escalation {
            key,
            held,
            requested,
        },
    }
}

/// Spawns one task capturing every access in `accesses`.
pub(crate) fn spawn<B: Backend>(
    state: &mut State<B>,
    parent: TaskId,
    name: Cow<'static, str>,
    accesses: &[Access<'_>],
) -> Result<TaskId, WeftError> {
    let mut plan = Plan::new(parent);
    for access in accesses {
        plan.whole(state, 0, access.handle, access.intent, StepKind::Advance)?;
    }

    let task = state.new_task(name, parent, None);
    plan.commit(state, &[task], None)?;

    tracing::debug!("spawned {} from {}", task, parent);
    Ok(task)
}

/// Spawns one task per index of `range`, running the capture once per index.
pub(crate) fn spawn_collection<B: Backend>(
    state: &mut State<B>,
    parent: TaskId,
    name: Cow<'static, str>,
    range: &IndexRange,
    accesses: &[CollectionAccess<'_>],
) -> Result<TaskCollection, WeftError> {
    if !state.backend.supports(Feature::Collections) {
        return Err(WeftError::CapabilityMissing(Feature::Collections));
    }

    let indices = range.indices();
    let mut plan = Plan::new(parent);

    for (slot, &index) in indices.iter().enumerate() {
        for access in accesses {
            match access {
                CollectionAccess::Each {
                    collection,
                    intent,
                    mapping,
                    mode,
                } => plan.each(state, slot, collection, index, mapping, *intent, *mode)?,
                CollectionAccess::Broadcast { handle, intent } => {
                    plan.whole(state, slot, handle, *intent, StepKind::Advance)?
                }
                CollectionAccess::PerIndex { handles, intent } => {
                    let Some(handle) = handles.get(index) else {
                        return Err(CaptureViolation::IndexOutOfRange {
                            key: handles
                                .last()
                                .map_or_else(|| Key::from(&*name), |h| h.key.clone()),
                            index,
                            extent: IndexRange::upto(handles.len()),
                        }
                        .into());
                    };
                    plan.whole(state, slot, handle, *intent, StepKind::Advance)?
                }
            }
        }
    }

    let tasks: Vec<TaskId> = indices
        .iter()
        .map(|index| state.new_task(format!("{name}[{index}]").into(), parent, None))
        .collect();

    plan.commit(state, &tasks, None)?;

    tracing::debug!("spawned {} task(s) of {} from {}", tasks.len(), name, parent);
    Ok(TaskCollection {
        tasks: indices.into_iter().zip(tasks).collect(),
    })
}
