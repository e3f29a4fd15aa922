use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use petgraph::Graph;
use petgraph::graph::NodeIndex;

use crate::backend::{Arm, Backend, FetchedUse, Guard, PublishedUse, UseDescriptor, UseRole};
use crate::config::{Config, Feature};
use crate::core::{CondId, FlowId, Hash32, TaskId, UseId};
use crate::error::{
    CaptureViolation, PublicationMismatch, SerializationContractViolation, WeftError,
};
use crate::key::Key;
use crate::permission::{Permission, Permissions};
use crate::publish::PublicationRegistry;

/// How a version came to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowKind {
    /// The initial version of a handle.
    Null,
    /// Produced by the use that claims it as its out-flow.
    Next { prev: FlowId },
    /// Mirrors a published version in a fetching context.
    Fetching { source: FlowId },
    /// One of two candidates, chosen when the condition is decided.
    Join {
        cond: CondId,
        then: FlowId,
        otherwise: FlowId,
    },
    /// Fan-in of several versions.
    Gather { sources: Vec<FlowId> },
}

/// The reason one task must wait for another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DependencyKind {
    /// Consumes the version the other task produces.
    Version,
    /// Modifies a version the other task reads.
    AntiDependency,
    /// Consumes a version produced by one arm of a conditional.
    Branch,
    /// Consumes a fan-in the other task contributes to.
    Gather,
    /// Consumes a version the other task published.
    Fetch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UseStatus {
    Live,
    Released,
    /// Released because its branch was not taken; produced nothing.
    Abandoned,
}

/// A registered use as the backend sees it.
#[derive(Debug, Clone)]
pub struct UseNode {
    pub key: Key,
    pub task: TaskId,
    pub permissions: Permissions,
    pub in_flow: FlowId,
    pub out_flow: FlowId,
    pub role: UseRole,
    pub guard: Option<Guard>,
    pub status: UseStatus,
}

#[derive(Debug)]
struct FlowRecord {
    key: Key,
    kind: FlowKind,
    /// The latest registered use claiming this flow as a new out-flow.
    producer: Option<UseId>,
    produced: bool,
    /// In-flow of the producer, set when it released.
    source: Option<FlowId>,
    value: Option<Vec<u8>>,
    /// Element writes made in place on this version, by element key.
    elements: HashMap<Key, Vec<u8>>,
    /// Version label and digest, for flows created by a fetch.
    fetched: Option<(Key, Option<Hash32>)>,
}

#[derive(Debug)]
pub(crate) struct TaskNode {
    pub id: TaskId,
    pub name: Arc<str>,
    /// Uses captured for this task when it was spawned.
    pub captured: Vec<UseId>,
}

/// Reference backend keeping the emitted dependency graph in memory.
///
/// Nodes of the graph are tasks, edges are [`DependencyKind`]s derived from
/// the flows of their captured and fetched uses. Beside the static graph it
/// tracks which versions have been produced, so it can tell whether a task
/// would be allowed to start: every in-flow it reads is available, and for
/// modifications no other outstanding use still consumes the same version.
#[derive(Debug)]
pub struct GraphBackend {
    features: BTreeSet<Feature>,
    flows: Vec<FlowRecord>,
    uses: Vec<UseNode>,
    consumers: HashMap<FlowId, Vec<UseId>>,
    /// Join and fetching flows per flow they may resolve to.
    referrers: HashMap<FlowId, Vec<FlowId>>,
    pub(crate) graph: Graph<TaskNode, DependencyKind>,
    tasks: HashMap<TaskId, NodeIndex>,
    conditions: HashMap<CondId, Arm>,
    registry: PublicationRegistry,
}

impl Default for GraphBackend {
    fn default() -> Self {
        Self::new(Feature::ALL)
    }
}

impl GraphBackend {
    pub fn new(features: impl IntoIterator<Item = Feature>) -> Self {
        Self {
            features: features.into_iter().collect(),
            flows: Vec::new(),
            uses: Vec::new(),
            consumers: HashMap::new(),
            referrers: HashMap::new(),
            graph: Graph::new(),
            tasks: HashMap::new(),
            conditions: HashMap::new(),
            registry: PublicationRegistry::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.features.iter().copied())
    }

    pub fn registry(&self) -> &PublicationRegistry {
        &self.registry
    }

    pub fn use_node(&self, id: UseId) -> Option<&UseNode> {
        self.uses.get(id.index())
    }

    pub fn flow_kind(&self, id: FlowId) -> Option<&FlowKind> {
        self.flows.get(id.index()).map(|flow| &flow.kind)
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of uses ever registered.
    pub fn use_count(&self) -> usize {
        self.uses.len()
    }

    /// Uses captured for `task` when it was spawned.
    pub fn captured_uses(&self, task: TaskId) -> &[UseId] {
        match self.tasks.get(&task) {
            Some(&node) => &self.graph[node].captured,
            None => &[],
        }
    }

    pub fn is_acyclic(&self) -> bool {
        !petgraph::algo::is_cyclic_directed(&self.graph)
    }

    /// Follows fetching and decided join flows to the concrete version.
    ///
    /// Returns `None` while a join is undecided.
    pub fn resolve_flow(&self, id: FlowId) -> Option<FlowId> {
        let mut current = id;
        loop {
            current = match &self.flows.get(current.index())?.kind {
                FlowKind::Null | FlowKind::Next { .. } | FlowKind::Gather { .. } => {
                    return Some(current);
                }
                FlowKind::Fetching { source } => *source,
                FlowKind::Join {
                    cond,
                    then,
                    otherwise,
                } => self.chosen(*cond, *then, *otherwise)?,
            };
        }
    }

    /// Whether the version `id` names has been produced.
    ///
    /// A version is produced once its producer released and the version the
    /// producer consumed is itself available.
    pub fn is_available(&self, id: FlowId) -> bool {
        let mut current = id;
        loop {
            let Some(flow) = self.flows.get(current.index()) else {
                return false;
            };

            current = match &flow.kind {
                FlowKind::Null => return true,
                FlowKind::Next { .. } => match (flow.produced, flow.source) {
                    (true, Some(source)) => source,
                    _ => return false,
                },
                FlowKind::Fetching { source } => *source,
                FlowKind::Join {
                    cond,
                    then,
                    otherwise,
                } => match self.chosen(*cond, *then, *otherwise) {
                    Some(chosen) => chosen,
                    None => return false,
                },
                FlowKind::Gather { sources } => {
                    return sources.iter().all(|s| self.is_available(*s));
                }
            };
        }
    }

    fn chosen(&self, cond: CondId, then: FlowId, otherwise: FlowId) -> Option<FlowId> {
        match self.conditions.get(&cond)? {
            Arm::Then => Some(then),
            Arm::Else => Some(otherwise),
        }
    }

    /// Whether every use captured for `task` may be acted upon now.
    ///
    /// A task that captured nothing is never held back.
    pub fn is_task_ready(&self, task: TaskId) -> bool {
        let Some(&node) = self.tasks.get(&task) else {
            return true;
        };

        self.graph[node]
            .captured
            .iter()
            .all(|&id| self.is_use_ready(id))
    }

    /// Tasks `task` has to wait for, with the reason.
    pub fn dependencies(&self, task: TaskId) -> Vec<(TaskId, DependencyKind)> {
        let Some(&node) = self.tasks.get(&task) else {
            return vec![];
        };

        let mut deps: Vec<_> = self
            .graph
            .edges_directed(node, petgraph::Direction::Incoming)
            .map(|edge| {
                use petgraph::visit::EdgeRef;
                (self.graph[edge.source()].id, *edge.weight())
            })
            .collect();

        deps.sort();
        deps
    }

    /// Tasks that have to wait for `task`.
    pub fn dependents(&self, task: TaskId) -> Vec<TaskId> {
        let Some(&node) = self.tasks.get(&task) else {
            return vec![];
        };

        let mut deps: Vec<_> = self
            .graph
            .neighbors_directed(node, petgraph::Direction::Outgoing)
            .map(|index| self.graph[index].id)
            .collect();

        deps.sort();
        deps
    }

    fn is_use_ready(&self, id: UseId) -> bool {
        let Some(node) = self.uses.get(id.index()) else {
            return false;
        };

        match node.status {
            UseStatus::Released => return true,
            UseStatus::Abandoned => return false,
            UseStatus::Live => {}
        }

        if let Some(guard) = node.guard
            && self.conditions.get(&guard.cond) != Some(&guard.arm)
        {
            return false;
        }

        match node.permissions.immediate {
            Permission::None => true,
            Permission::Read => self.is_available(node.in_flow),
            Permission::Modify => {
                self.is_available(node.in_flow)
                    && self.outstanding_consumers(node.in_flow, id, &node.key) == 0
            }
        }
    }

    /// Live uses other than `except` still consuming the part of the
    /// version `flow` resolves to named by `key`, whichever flow they hold
    /// it through.
    fn outstanding_consumers(&self, flow: FlowId, except: UseId, key: &Key) -> usize {
        let Some(target) = self.resolve_flow(flow) else {
            return 0;
        };

        self.referring(target)
            .into_iter()
            .filter(|&other| self.resolve_flow(other) == Some(target))
            .filter_map(|other| self.consumers.get(&other))
            .flatten()
            .map(|&id| (id, &self.uses[id.index()]))
            .filter(|(id, other)| {
                *id != except && other.status == UseStatus::Live && overlaps(&other.key, key)
            })
            .count()
    }

    /// `flow` and every join or fetching flow that may resolve to it.
    fn referring(&self, flow: FlowId) -> Vec<FlowId> {
        let mut seen = vec![flow];
        let mut queue = vec![flow];

        while let Some(current) = queue.pop() {
            for &next in self.referrers.get(&current).into_iter().flatten() {
                if !seen.contains(&next) {
                    seen.push(next);
                    queue.push(next);
                }
            }
        }

        seen
    }

    /// Flows a modification of `flow` may end up overwriting in place: every
    /// version `flow` may resolve to, plus the fetches of each.
    fn shared_versions(&self, flow: FlowId) -> Vec<FlowId> {
        let mut seen = vec![flow];
        let mut queue = vec![flow];

        while let Some(current) = queue.pop() {
            let down = match self.flows.get(current.index()).map(|f| &f.kind) {
                Some(FlowKind::Fetching { source }) => vec![*source],
                Some(FlowKind::Join {
                    then, otherwise, ..
                }) => vec![*then, *otherwise],
                _ => vec![],
            };
            let fetches = self
                .referrers
                .get(&current)
                .into_iter()
                .flatten()
                .copied()
                .filter(|f| matches!(self.flows[f.index()].kind, FlowKind::Fetching { .. }));

            for next in down.into_iter().chain(fetches) {
                if !seen.contains(&next) {
                    seen.push(next);
                    queue.push(next);
                }
            }
        }

        seen
    }

    fn make_flow(&mut self, key: &Key, kind: FlowKind) -> FlowId {
        let id = FlowId(self.flows.len() as u32);
        tracing::debug!("flow {:?} for {}: {:?}", id, key, kind);
        self.flows.push(FlowRecord {
            key: key.clone(),
            kind,
            producer: None,
            produced: false,
            source: None,
            value: None,
            elements: HashMap::new(),
            fetched: None,
        });
        id
    }

    fn task_node(&mut self, task: TaskId, name: &Arc<str>) -> NodeIndex {
        if let Some(&node) = self.tasks.get(&task) {
            return node;
        }

        let node = self.graph.add_node(TaskNode {
            id: task,
            name: name.clone(),
            captured: Vec::new(),
        });
        self.tasks.insert(task, node);
        node
    }

    /// Uses whose release makes `flow` available, each with the kind of
    /// dependency a consumer of `flow` has on them.
    fn producers(&self, flow: FlowId, kind: DependencyKind) -> Vec<(UseId, DependencyKind)> {
        let Some(record) = self.flows.get(flow.index()) else {
            return vec![];
        };

        match &record.kind {
            FlowKind::Null => vec![],
            FlowKind::Next { .. } => {
                let Some(producer) = record.producer else {
                    return vec![];
                };

                // A continuation only passes on what its own in-flow receives.
                let node = &self.uses[producer.index()];
                let mut all = vec![(producer, kind)];
                if node.role == UseRole::Continuation {
                    all.extend(self.producers(node.in_flow, kind));
                }
                all
            }
            FlowKind::Fetching { source } => self.producers(*source, DependencyKind::Fetch),
            FlowKind::Join { then, otherwise, .. } => {
                let mut all = self.producers(*then, DependencyKind::Branch);
                all.extend(self.producers(*otherwise, DependencyKind::Branch));
                all
            }
            FlowKind::Gather { sources } => sources
                .iter()
                .flat_map(|s| self.producers(*s, DependencyKind::Gather))
                .collect(),
        }
    }

    fn add_dependencies(&mut self, id: UseId, node: NodeIndex) {
        let this = &self.uses[id.index()];
        let task = this.task;
        let in_flow = this.in_flow;

        let mut edges = Vec::new();

        for (producer, kind) in self.producers(in_flow, DependencyKind::Version) {
            edges.push((self.uses[producer.index()].task, kind));
        }

        // Readers registered so far have to let go of the version first,
        // whichever arm of a join it turns out to be.
        if this.permissions.immediate == Permission::Modify {
            let readers = self
                .shared_versions(in_flow)
                .into_iter()
                .filter_map(|flow| self.consumers.get(&flow))
                .flatten();

            for &other in readers {
                let other = &self.uses[other.index()];
                let reader = other.in_flow == other.out_flow;
                let spawned = matches!(other.role, UseRole::Captured | UseRole::Fetched);
                if reader && spawned && overlaps(&other.key, &this.key) {
                    edges.push((other.task, DependencyKind::AntiDependency));
                }
            }
        }

        for (source, kind) in edges {
            if source == task {
                continue;
            }
            if let Some(&from) = self.tasks.get(&source) {
                self.graph.update_edge(from, node, kind);
            }
        }
    }

    /// The bytes of `key` visible at `flow`. A version nobody wrote to shows
    /// the bytes of the version its producer consumed, and an element nobody
    /// wrote to shows the value of the whole collection.
    fn value_of(&self, id: FlowId, key: &Key) -> Option<&Vec<u8>> {
        let mut current = id;
        loop {
            let flow = self.flows.get(current.index())?;
            if let Some(value) = flow.elements.get(key).or(flow.value.as_ref()) {
                return Some(value);
            }

            current = match &flow.kind {
                FlowKind::Next { .. } => flow.source?,
                FlowKind::Fetching { source } => *source,
                FlowKind::Join {
                    cond,
                    then,
                    otherwise,
                } => self.chosen(*cond, *then, *otherwise)?,
                FlowKind::Gather { sources } if is_element(key, &flow.key) => {
                    self.element_source(sources, key)?
                }
                FlowKind::Null | FlowKind::Gather { .. } => return None,
            };
        }
    }

    /// The gathered version carrying `key`: its own element version if it
    /// has one, otherwise the whole version it was left at.
    fn element_source(&self, sources: &[FlowId], key: &Key) -> Option<FlowId> {
        let own = sources
            .iter()
            .find(|s| self.flows[s.index()].key == *key);
        let whole = sources
            .iter()
            .find(|s| is_element(key, &self.flows[s.index()].key));

        own.or(whole).copied()
    }

    fn live_use(&self, id: UseId) -> Result<&UseNode, WeftError> {
        let node = self.uses.get(id.index()).ok_or_else(|| unknown_use(id))?;

        match node.status {
            UseStatus::Live => Ok(node),
            _ => Err(CaptureViolation::DoubleRelease {
                key: node.key.clone(),
            }
            .into()),
        }
    }
}

/// Whether two keys address overlapping data: equal, or one names an
/// element of the other.
fn overlaps(a: &Key, b: &Key) -> bool {
    a.segments()
        .iter()
        .zip(b.segments())
        .all(|(a, b)| a == b)
}

/// Whether `key` names an element of `of`.
fn is_element(key: &Key, of: &Key) -> bool {
    key.segments().len() > of.segments().len() && key.segments().starts_with(of.segments())
}

fn unknown_use(id: UseId) -> WeftError {
    CaptureViolation::NotCaptured {
        key: Key::from(format!("{id:?}")),
    }
    .into()
}

impl Backend for GraphBackend {
    fn supports(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    fn make_null_flow(&mut self, key: &Key) -> FlowId {
        self.make_flow(key, FlowKind::Null)
    }

    fn make_next_flow(&mut self, key: &Key, prev: FlowId) -> FlowId {
        self.make_flow(key, FlowKind::Next { prev })
    }

    fn make_same_flow(&mut self, flow: FlowId) -> FlowId {
        flow
    }

    fn make_fetching_flow(&mut self, key: &Key, source: FlowId) -> FlowId {
        let flow = self.make_flow(key, FlowKind::Fetching { source });
        self.referrers.entry(source).or_default().push(flow);
        flow
    }

    fn make_join_flow(
        &mut self,
        key: &Key,
        cond: CondId,
        then: FlowId,
        otherwise: FlowId,
    ) -> FlowId {
        let flow = self.make_flow(
            key,
            FlowKind::Join {
                cond,
                then,
                otherwise,
            },
        );
        for candidate in [then, otherwise] {
            self.referrers.entry(candidate).or_default().push(flow);
        }
        flow
    }

    fn make_gather_flow(&mut self, key: &Key, sources: Vec<FlowId>) -> FlowId {
        self.make_flow(key, FlowKind::Gather { sources })
    }

    fn register_use(&mut self, descriptor: UseDescriptor) -> UseId {
        let id = UseId(self.uses.len() as u32);
        let UseDescriptor {
            key,
            task,
            task_name,
            permissions,
            in_flow,
            out_flow,
            role,
            guard,
        } = descriptor;

        tracing::debug!(
            "{:?} {:?} on {} for {} ({}): {:?} -> {:?}",
            id,
            role,
            key,
            task_name,
            permissions,
            in_flow,
            out_flow
        );

        if in_flow != out_flow
            && let Some(flow) = self.flows.get_mut(out_flow.index())
        {
            flow.producer = Some(id);
        }

        self.uses.push(UseNode {
            key,
            task,
            permissions,
            in_flow,
            out_flow,
            role,
            guard,
            status: UseStatus::Live,
        });

        let node = self.task_node(task, &task_name);
        if matches!(role, UseRole::Captured | UseRole::Fetched) {
            self.add_dependencies(id, node);
        }
        if role == UseRole::Captured {
            self.graph[node].captured.push(id);
        }

        self.consumers.entry(in_flow).or_default().push(id);
        id
    }

    fn release_use(&mut self, id: UseId) -> Result<FlowId, WeftError> {
        let node = self.live_use(id)?;
        let (in_flow, out_flow, guard) = (node.in_flow, node.out_flow, node.guard);

        let abandoned = guard.is_some_and(|g| {
            self.conditions
                .get(&g.cond)
                .is_some_and(|&arm| arm != g.arm)
        });

        self.uses[id.index()].status = match abandoned {
            true => UseStatus::Abandoned,
            false => UseStatus::Released,
        };

        if abandoned {
            tracing::debug!("{:?} abandoned with its branch", id);
            return Ok(out_flow);
        }

        let produces =
            in_flow != out_flow && self.flows[out_flow.index()].producer == Some(id);

        if produces {
            let flow = &mut self.flows[out_flow.index()];
            flow.produced = true;
            flow.source = Some(in_flow);
            tracing::debug!("{:?} released, {:?} of {} produced", id, out_flow, flow.key);
        }

        Ok(out_flow)
    }

    fn check_publish(&self, key: &Key, version: &Key) -> Result<(), WeftError> {
        Ok(self.registry.check_publish(key, version)?)
    }

    fn publish(
        &mut self,
        id: UseId,
        version: &Key,
        n_fetchers: usize,
    ) -> Result<PublishedUse, WeftError> {
        if !self.supports(Feature::Publication) {
            return Err(WeftError::CapabilityMissing(Feature::Publication));
        }

        let node = self.live_use(id)?;
        if !node.permissions.can_read() {
            return Err(CaptureViolation::ImmediatePermission {
                key: node.key.clone(),
                held: node.permissions,
                required: Permission::Read,
            }
            .into());
        }

        let (key, task, flow) = (node.key.clone(), node.task, node.in_flow);
        self.registry.check_publish(&key, version)?;

        let task_name = match self.tasks.get(&task) {
            Some(&index) => self.graph[index].name.clone(),
            None => Arc::from(task.to_string()),
        };

        let holder = self.register_use(UseDescriptor {
            key: key.clone(),
            task,
            task_name,
            permissions: Permissions::READ_READ,
            in_flow: flow,
            out_flow: flow,
            role: UseRole::Publication,
            guard: None,
        });

        let digest = self.value_of(flow, &key).map(Hash32::hash);
        let retired = self
            .registry
            .publish(key, version.clone(), n_fetchers, flow, holder, digest)?;

        if let Some(holder) = retired {
            self.release_use(holder)?;
        }

        Ok(PublishedUse {
            holder,
            retired: retired.is_some(),
        })
    }

    fn fetch(
        &mut self,
        key: &Key,
        version: &Key,
        task: TaskId,
        task_name: Arc<str>,
    ) -> Result<FetchedUse, WeftError> {
        if !self.supports(Feature::Publication) {
            return Err(WeftError::CapabilityMissing(Feature::Publication));
        }

        let ticket = self.registry.fetch(key, version)?;

        let flow = self.make_fetching_flow(key, ticket.flow);
        self.flows[flow.index()].fetched = Some((version.clone(), ticket.digest));

        let id = self.register_use(UseDescriptor {
            key: key.clone(),
            task,
            task_name,
            permissions: Permissions::READ_READ,
            in_flow: flow,
            out_flow: flow,
            role: UseRole::Fetched,
            guard: None,
        });

        if let Some(holder) = ticket.drained {
            self.release_use(holder)?;
        }

        tracing::info!("fetched {} at version {} as {:?}", key, version, id);

        Ok(FetchedUse {
            id,
            in_flow: flow,
            retired: ticket.drained,
        })
    }

    fn under_fetched(&self) -> Vec<PublicationMismatch> {
        self.registry.under_fetched()
    }

    fn resolve_condition(&mut self, cond: CondId, arm: Arm) {
        tracing::info!("condition {:?} resolved to {:?}", cond, arm);
        self.conditions.insert(cond, arm);
    }

    fn write_value(&mut self, id: UseId, bytes: Vec<u8>) -> Result<(), WeftError> {
        let node = self.live_use(id)?;
        if !node.permissions.can_modify() {
            return Err(CaptureViolation::ImmediatePermission {
                key: node.key.clone(),
                held: node.permissions,
                required: Permission::Modify,
            }
            .into());
        }

        let key = node.key.clone();
        let target = self
            .resolve_flow(node.in_flow)
            .ok_or_else(|| SerializationContractViolation::Empty { key: key.clone() })?;

        let flow = &mut self.flows[target.index()];
        if is_element(&key, &flow.key) {
            flow.elements.insert(key, bytes);
            return Ok(());
        }
        if matches!(flow.kind, FlowKind::Gather { .. }) {
            return Err(SerializationContractViolation::Aggregate { key }.into());
        }

        flow.value = Some(bytes);
        flow.elements.clear();
        Ok(())
    }

    fn read_value(&self, id: UseId) -> Result<Vec<u8>, WeftError> {
        let node = self.live_use(id)?;
        if !node.permissions.can_read() {
            return Err(CaptureViolation::ImmediatePermission {
                key: node.key.clone(),
                held: node.permissions,
                required: Permission::Read,
            }
            .into());
        }

        let key = node.key.clone();
        let empty = || SerializationContractViolation::Empty { key: key.clone() };

        let resolved = self.resolve_flow(node.in_flow).ok_or_else(empty)?;
        let flow = &self.flows[resolved.index()];
        if matches!(flow.kind, FlowKind::Gather { .. }) && !is_element(&key, &flow.key) {
            return Err(SerializationContractViolation::Aggregate { key }.into());
        }

        let bytes = self.value_of(resolved, &key).ok_or_else(empty)?;

        if let Some((version, Some(digest))) = &self.flows[node.in_flow.index()].fetched
            && Hash32::hash(bytes) != *digest
        {
            return Err(SerializationContractViolation::DigestMismatch {
                key,
                version: version.clone(),
            }
            .into());
        }

        Ok(bytes.clone())
    }
}
