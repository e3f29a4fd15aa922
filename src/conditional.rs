//! if/then/else composition.
//!
//! The condition task is captured like any other spawn. Both branches are
//! then captured against the version the condition leaves behind, so the
//! graph is well formed whichever branch runs. Every handle a branch
//! modifies gets a join version, chosen by the backend once the condition
//! task decides.
use std::borrow::Cow;

use crate::backend::{Arm, Backend, Guard};
use crate::capture::{Plan, StepKind};
use crate::config::Feature;
use crate::core::{CondId, TaskId};
use crate::error::WeftError;
use crate::handle::Access;
use crate::runtime::State;

/// The accesses of the three bodies of a conditional.
///
/// Without an `else_branch` the pre-branch version itself is the outcome
/// of a false condition.
#[derive(Debug, Clone, Copy)]
pub struct Branches<'a> {
    pub condition: &'a [Access<'a>],
    pub then_branch: &'a [Access<'a>],
    pub else_branch: Option<&'a [Access<'a>]>,
}

impl<'a> Branches<'a> {
    pub fn new(condition: &'a [Access<'a>], then_branch: &'a [Access<'a>]) -> Self {
        Self {
            condition,
            then_branch,
            else_branch: None,
        }
    }

    pub fn otherwise(mut self, else_branch: &'a [Access<'a>]) -> Self {
        self.else_branch = Some(else_branch);
        self
    }
}

/// The tasks a conditional spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conditional {
    pub id: CondId,
    /// Evaluates the condition and must call
    /// [`TaskContext::decide`](crate::TaskContext::decide).
    pub if_task: TaskId,
    pub then_task: TaskId,
    pub else_task: Option<TaskId>,
}

impl Conditional {
    /// The branch task that runs for `arm`, if there is one.
    pub fn task(&self, arm: Arm) -> Option<TaskId> {
        match arm {
            Arm::Then => Some(self.then_task),
            Arm::Else => self.else_task,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ConditionRecord {
    pub spawned: Conditional,
    pub decided: Option<Arm>,
}

pub(crate) fn spawn_if<B: Backend>(
    state: &mut State<B>,
    parent: TaskId,
    name: Cow<'static, str>,
    branches: Branches<'_>,
) -> Result<Conditional, WeftError> {
    if !state.backend.supports(Feature::Conditional) {
        return Err(WeftError::CapabilityMissing(Feature::Conditional));
    }

    let mut plan = Plan::new(parent);

    for access in branches.condition {
        plan.whole(state, 0, access.handle, access.intent, StepKind::Advance)?;
    }
    for access in branches.then_branch {
        let kind = StepKind::Branch(Arm::Then);
        plan.whole(state, 1, access.handle, access.intent, kind)?;
    }
    for access in branches.else_branch.unwrap_or_default() {
        let kind = StepKind::Branch(Arm::Else);
        plan.whole(state, 2, access.handle, access.intent, kind)?;
    }

    let cond = state.new_condition();
    let guard = |arm| Some(Guard { cond, arm });

    let if_task = state.new_task(format!("{name}?").into(), parent, None);
    let then_task = state.new_task(format!("{name}:then").into(), parent, guard(Arm::Then));
    let else_task = branches
        .else_branch
        .map(|_| state.new_task(format!("{name}:else").into(), parent, guard(Arm::Else)));

    // Without an else body the slot maps nowhere and no step refers to it.
    let mut tasks = vec![if_task, then_task];
    tasks.extend(else_task);

    plan.commit(state, &tasks, Some(cond))?;

    let spawned = Conditional {
        id: cond,
        if_task,
        then_task,
        else_task,
    };

    state.set_decides(if_task, cond);
    state.conditions.insert(
        cond,
        ConditionRecord {
            spawned,
            decided: None,
        },
    );

    tracing::debug!("spawned conditional {} from {}", cond, parent);
    Ok(spawned)
}

/// Resolves the condition `task` evaluates and abandons the branch not taken.
pub(crate) fn decide<B: Backend>(
    state: &mut State<B>,
    task: TaskId,
    outcome: bool,
) -> Result<Arm, WeftError> {
    let cond = state
        .decides(task)
        .ok_or(WeftError::NotACondition { task })?;

    let record = state
        .conditions
        .get_mut(&cond)
        .ok_or(WeftError::NotACondition { task })?;

    if record.decided.is_some() {
        return Err(WeftError::AlreadyDecided(cond));
    }

    let arm = Arm::from_outcome(outcome);
    record.decided = Some(arm);
    let skipped = match arm {
        Arm::Then => record.spawned.else_task,
        Arm::Else => Some(record.spawned.then_task),
    };

    state.backend.resolve_condition(cond, arm);

    if let Some(skipped) = skipped {
        state.skip(skipped)?;
    }

    tracing::info!("condition {} decided {:?} by {}", cond, arm, task);
    Ok(arm)
}
