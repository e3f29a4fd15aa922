//! The capability set the capture layer calls into.
//!
//! A backend receives every use and flow the capture protocol creates and is
//! responsible for actually ordering and running the tasks they belong to.
//! The capture layer never executes task bodies itself.
mod diagnostics;
mod graph;

use std::sync::Arc;

use crate::config::Feature;
use crate::core::{CondId, FlowId, TaskId, UseId};
use crate::error::{PublicationMismatch, WeftError};
use crate::key::Key;
use crate::permission::Permissions;

pub use crate::backend::graph::{DependencyKind, FlowKind, GraphBackend, UseNode, UseStatus};

/// Why a use was registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UseRole {
    /// The first use of a freshly created handle.
    Initial,
    /// Created for a spawned task by a capture.
    Captured,
    /// The calling context's use after a capture continued it forward.
    Continuation,
    /// Held by a publication until it drains.
    Publication,
    /// Created in the fetching context by a fetch.
    Fetched,
}

/// The two candidate branches of a conditional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arm {
    Then,
    Else,
}

impl Arm {
    pub fn from_outcome(outcome: bool) -> Self {
        match outcome {
            true => Arm::Then,
            false => Arm::Else,
        }
    }
}

/// Marks a use as belonging to one arm of an undecided conditional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guard {
    pub cond: CondId,
    pub arm: Arm,
}

/// Everything a backend needs to know about a new use.
#[derive(Debug, Clone)]
pub struct UseDescriptor {
    pub key: Key,
    pub task: TaskId,
    pub task_name: Arc<str>,
    pub permissions: Permissions,
    pub in_flow: FlowId,
    pub out_flow: FlowId,
    pub role: UseRole,
    pub guard: Option<Guard>,
}

/// The read use a publication keeps alive until it drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishedUse {
    pub holder: UseId,
    /// Set when the publication drained on arrival and the holder is
    /// already released.
    pub retired: bool,
}

/// A use created by the backend on behalf of a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchedUse {
    pub id: UseId,
    pub in_flow: FlowId,
    /// The publication holder released because this fetch drained it.
    pub retired: Option<UseId>,
}

pub trait Backend: Send + 'static {
    /// Whether an optional feature is implemented.
    fn supports(&self, feature: Feature) -> bool;

    /// The initial version of a handle, available immediately.
    fn make_null_flow(&mut self, key: &Key) -> FlowId;

    /// A new version produced from `prev`.
    fn make_next_flow(&mut self, key: &Key, prev: FlowId) -> FlowId;

    /// The version `flow` itself, consumed without producing anything new.
    fn make_same_flow(&mut self, flow: FlowId) -> FlowId;

    /// A version mirroring a published `source` in a fetching context.
    fn make_fetching_flow(&mut self, key: &Key, source: FlowId) -> FlowId;

    /// A version resolved to `then` or `otherwise` once `cond` is decided.
    fn make_join_flow(&mut self, key: &Key, cond: CondId, then: FlowId, otherwise: FlowId)
    -> FlowId;

    /// A version available once every one of `sources` is.
    fn make_gather_flow(&mut self, key: &Key, sources: Vec<FlowId>) -> FlowId;

    fn register_use(&mut self, descriptor: UseDescriptor) -> UseId;

    /// Releases a use exactly once and returns its out-flow.
    fn release_use(&mut self, id: UseId) -> Result<FlowId, WeftError>;

    /// Fails when publishing `key` at `version` would be rejected.
    fn check_publish(&self, key: &Key, version: &Key) -> Result<(), WeftError>;

    /// Publishes the version held by `id`, which must be readable, and
    /// registers the read use holding it for the fetchers.
    fn publish(
        &mut self,
        id: UseId,
        version: &Key,
        n_fetchers: usize,
    ) -> Result<PublishedUse, WeftError>;

    /// Consumes one fetch of a publication and registers a read use for it.
    fn fetch(
        &mut self,
        key: &Key,
        version: &Key,
        task: TaskId,
        task_name: Arc<str>,
    ) -> Result<FetchedUse, WeftError>;

    /// Publications still waiting for some of their declared fetches.
    fn under_fetched(&self) -> Vec<PublicationMismatch>;

    /// Records the runtime outcome of a conditional.
    fn resolve_condition(&mut self, cond: CondId, arm: Arm);

    /// Stores bytes as the data `id` is modifying.
    fn write_value(&mut self, id: UseId, bytes: Vec<u8>) -> Result<(), WeftError>;

    /// Loads the bytes of the version `id` accesses.
    fn read_value(&self, id: UseId) -> Result<Vec<u8>, WeftError>;
}
