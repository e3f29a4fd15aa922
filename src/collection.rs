//! Index ranges and the declarations of data-parallel task collections.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use crate::core::TaskId;
use crate::handle::HandleRef;
use crate::permission::AccessIntent;

/// The indices a task collection runs over, or the extent of a
/// collection-typed handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexRange {
    /// The half-open interval `[start, end)`.
    Interval { start: usize, end: usize },
    /// An explicit set of indices.
    Set(BTreeSet<usize>),
}

impl IndexRange {
    pub fn interval(start: usize, end: usize) -> Self {
        IndexRange::Interval { start, end }
    }

    /// The interval `[0, n)`.
    pub fn upto(n: usize) -> Self {
        Self::interval(0, n)
    }

    pub fn set(indices: impl IntoIterator<Item = usize>) -> Self {
        IndexRange::Set(indices.into_iter().collect())
    }

    pub fn contains(&self, index: usize) -> bool {
        match self {
            IndexRange::Interval { start, end } => (*start..*end).contains(&index),
            IndexRange::Set(set) => set.contains(&index),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            IndexRange::Interval { start, end } => end.saturating_sub(*start),
            IndexRange::Set(set) => set.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Indices in ascending order.
    pub fn indices(&self) -> Vec<usize> {
        match self {
            IndexRange::Interval { start, end } => (*start..*end).collect(),
            IndexRange::Set(set) => set.iter().copied().collect(),
        }
    }
}

impl Display for IndexRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexRange::Interval { start, end } => write!(f, "[{start}, {end})"),
            IndexRange::Set(set) => {
                let items: Vec<_> = set.iter().map(usize::to_string).collect();
                write!(f, "{{{}}}", items.join(", "))
            }
        }
    }
}

/// How a task index selects an element of a collection-typed handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexMapping {
    Identity,
    /// Task `i` addresses element `i + offset`.
    Offset(isize),
    /// Task `i` addresses `map[i]`; indices missing from the map address
    /// nothing and are reported out of range.
    Explicit(BTreeMap<usize, usize>),
}

impl IndexMapping {
    pub fn map(&self, index: usize) -> Option<usize> {
        match self {
            IndexMapping::Identity => Some(index),
            IndexMapping::Offset(offset) => index.checked_add_signed(*offset),
            IndexMapping::Explicit(map) => map.get(&index).copied(),
        }
    }
}

/// Whether a collection capture leaves the per-index versions apart or
/// immediately fans them back into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    Scatter,
    Gather,
}

/// One declaration of a task-collection creation call.
#[derive(Debug, Clone)]
pub enum CollectionAccess<'a> {
    /// Every task index captures its own element of a collection-typed handle.
    Each {
        collection: &'a HandleRef,
        intent: AccessIntent,
        mapping: IndexMapping,
        mode: CaptureMode,
    },
    /// Every task index captures the same plain handle. Modify requests are
    /// chained across indices in ascending order.
    Broadcast {
        handle: &'a HandleRef,
        intent: AccessIntent,
    },
    /// Task index `i` captures `handles[i]`.
    PerIndex {
        handles: Vec<&'a HandleRef>,
        intent: AccessIntent,
    },
}

impl<'a> CollectionAccess<'a> {
    pub fn broadcast<T>(handle: &'a crate::Handle<T>, intent: AccessIntent) -> Self {
        CollectionAccess::Broadcast {
            handle: handle.handle_ref(),
            intent,
        }
    }

    pub fn per_index<T>(handles: &'a [crate::Handle<T>], intent: AccessIntent) -> Self {
        CollectionAccess::PerIndex {
            handles: handles.iter().map(crate::Handle::handle_ref).collect(),
            intent,
        }
    }
}

/// The tasks created by one task-collection capture, one per index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskCollection {
    pub tasks: BTreeMap<usize, TaskId>,
}

impl TaskCollection {
    pub fn task(&self, index: usize) -> Option<TaskId> {
        self.tasks.get(&index).copied()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
