use thiserror::Error;

use crate::collection::IndexRange;
use crate::config::Feature;
use crate::core::{CondId, TaskId};
use crate::key::Key;
use crate::permission::{AccessIntent, Permission, Permissions};
use crate::runtime::TaskState;

/// Top-level error returned by every fallible operation of the crate.
#[derive(Debug, Error)]
pub enum WeftError {
    #[error("Capture violation: {0}")]
    Capture(#[from] CaptureViolation),

    #[error("Publication mismatch: {0}")]
    Publication(#[from] PublicationMismatch),

    #[error("Backend does not support feature '{0}'")]
    CapabilityMissing(Feature),

    #[error("Serialization contract violated: {0}")]
    Serialization(#[from] SerializationContractViolation),

    #[error("Couldn't parse configuration.\n{0}")]
    Config(#[from] serde_json::Error),

    #[error("Rank {rank} does not exist, the runtime was configured with {ranks} rank(s)")]
    UnknownRank { rank: u32, ranks: u32 },

    #[error("Task {task} can't be entered in state {state:?}")]
    TaskState { task: TaskId, state: TaskState },

    #[error("Task {task} belongs to a branch whose condition has not been decided")]
    BranchUnresolved { task: TaskId },

    #[error("Condition {0} has already been decided")]
    AlreadyDecided(CondId),

    #[error("Task {task} does not evaluate a condition")]
    NotACondition { task: TaskId },

    #[error("Task {0} does not exist")]
    UnknownTask(TaskId),

    #[error("{count} task(s) never finished: {names}")]
    Unfinished { count: usize, names: String },
}

/// Illegal use of the capture protocol. No graph mutation is committed when
/// one of these is reported.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureViolation {
    #[error("handle '{key}' holds {held}, which grants no permission to schedule a {requested} access")]
    NoSchedulingPermission {
        key: Key,
        held: Permissions,
        requested: AccessIntent,
    },

    #[error("handle '{key}' holds {held}, a {requested} access would escalate it")]
    Escalation {
        key: Key,
        held: Permissions,
        requested: AccessIntent,
    },

    #[error("handle '{key}' holds {held}, but {required} access to the data is required")]
    ImmediatePermission {
        key: Key,
        held: Permissions,
        required: Permission,
    },

    #[error("handle '{key}' has already been released in this context")]
    DoubleRelease { key: Key },

    #[error("handle '{key}' is still split into per-index versions at scope exit")]
    MissingRelease { key: Key },

    #[error("index {index} is outside the extent {extent} of handle '{key}'")]
    IndexOutOfRange {
        key: Key,
        index: usize,
        extent: IndexRange,
    },

    #[error("handle '{key}' is not accessible in this context")]
    NotCaptured { key: Key },

    #[error("handle '{key}' is declared more than once for the same task")]
    DuplicateAccess { key: Key },

    #[error("handle '{key}' is split into per-index versions and must be gathered first")]
    UnjoinedBranches { key: Key },

    #[error("a handle named '{key}' is already live in this execution context")]
    DuplicateKey { key: Key },

    #[error("task '{task}' finished without deciding its condition")]
    UndecidedCondition { task: String },
}

/// Disagreement between publications and the fetches made against them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublicationMismatch {
    #[error("no publication of '{key}' at version '{version}'")]
    NotFound { key: Key, version: Key },

    #[error("publication of '{key}' at version '{version}' was drained by its {n_fetchers} fetch(es)")]
    Drained {
        key: Key,
        version: Key,
        n_fetchers: usize,
    },

    #[error("'{key}' at version '{version}' is already published and still open")]
    DuplicatePublish { key: Key, version: Key },

    #[error("publication of '{key}' at version '{version}' was fetched {fetched} of {declared} time(s)")]
    UnderFetched {
        key: Key,
        version: Key,
        fetched: usize,
        declared: usize,
    },
}

/// A payload failed the contract required to cross the backend boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerializationContractViolation {
    #[error("couldn't encode a value of type {type_name}: {message}")]
    Encode {
        type_name: &'static str,
        message: String,
    },

    #[error("couldn't decode a value of type {type_name}: {message}")]
    Decode {
        type_name: &'static str,
        message: String,
    },

    #[error("no value has been written to '{key}' at this version")]
    Empty { key: Key },

    #[error("'{key}' resolves to several per-index versions, not a single value")]
    Aggregate { key: Key },

    #[error("bytes fetched for '{key}' at version '{version}' differ from the published digest")]
    DigestMismatch { key: Key, version: Key },
}
