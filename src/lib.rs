#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod backend;
mod capture;
mod codec;
mod collection;
mod conditional;
mod config;
mod core;
mod error;
mod handle;
mod key;
mod permission;
mod publish;
mod runtime;
mod utils;

pub use crate::backend::{
    Arm, Backend, DependencyKind, FetchedUse, FlowKind, GraphBackend, Guard, PublishedUse,
    UseDescriptor, UseNode, UseRole, UseStatus,
};
pub use crate::codec::Payload;
pub use crate::collection::{
    CaptureMode, CollectionAccess, IndexMapping, IndexRange, TaskCollection,
};
pub use crate::conditional::{Branches, Conditional};
pub use crate::config::{Config, Feature};
pub use crate::core::{CondId, FlowId, HandleId, Hash32, TaskId, UseId};
pub use crate::error::*;
pub use crate::handle::{Access, Handle, HandleCollection, HandleRef};
pub use crate::key::{Key, Segment};
pub use crate::permission::{AccessIntent, Permission, Permissions, Refusal};
pub use crate::publish::{FetchTicket, PublicationRecord, PublicationRegistry, PublicationState};
pub use crate::runtime::{Runtime, TaskContext, TaskState};
pub use crate::utils::init_logging;
