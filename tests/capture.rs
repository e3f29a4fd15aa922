use weft::{
    AccessIntent, CaptureViolation, Config, DependencyKind, FlowKind, Permissions, Runtime,
    TaskId, TaskState, WeftError,
};

fn ready(runtime: &Runtime, task: TaskId) -> bool {
    runtime.with_backend(|b| b.is_task_ready(task))
}

fn deps(runtime: &Runtime, task: TaskId) -> Vec<(TaskId, DependencyKind)> {
    runtime.with_backend(|b| b.dependencies(task))
}

/// In-flow and out-flow of the single use `task` captured.
fn flows(runtime: &Runtime, task: TaskId) -> (weft::FlowId, weft::FlowId) {
    runtime.with_backend(|b| {
        let uses = b.captured_uses(task);
        assert_eq!(uses.len(), 1);
        let node = b.use_node(uses[0]).unwrap();
        (node.in_flow, node.out_flow)
    })
}

#[test]
fn test_writer_readers_writer() {
    let runtime = Runtime::in_memory(Config::default());
    let root = runtime.root(0).unwrap();
    let x = root.create_handle::<i64>("x").unwrap();

    let a = root.spawn("a", &[x.modify()]).unwrap();
    let b = root.spawn("b", &[x.read()]).unwrap();
    let c = root.spawn("c", &[x.read()]).unwrap();
    let d = root.spawn("d", &[x.modify()]).unwrap();

    let (a_in, a_out) = flows(&runtime, a);
    assert_ne!(a_in, a_out);
    assert!(matches!(
        runtime.with_backend(|b| b.flow_kind(a_in).cloned()),
        Some(FlowKind::Null)
    ));
    assert_eq!(flows(&runtime, b), (a_out, a_out));
    assert_eq!(flows(&runtime, c), (a_out, a_out));
    assert_eq!(flows(&runtime, d).0, a_out);

    assert_eq!(deps(&runtime, b), vec![(a, DependencyKind::Version)]);
    assert_eq!(deps(&runtime, c), vec![(a, DependencyKind::Version)]);
    assert_eq!(
        deps(&runtime, d),
        vec![
            (a, DependencyKind::Version),
            (b, DependencyKind::AntiDependency),
            (c, DependencyKind::AntiDependency),
        ]
    );

    assert!(ready(&runtime, a));
    assert!(!ready(&runtime, b));
    assert!(!ready(&runtime, c));
    assert!(!ready(&runtime, d));

    let task = runtime.enter(a).unwrap();
    task.set(&x, &42).unwrap();
    task.finish().unwrap();

    assert!(ready(&runtime, b));
    assert!(ready(&runtime, c));
    assert!(!ready(&runtime, d));

    let task = runtime.enter(b).unwrap();
    assert_eq!(task.get(&x).unwrap(), 42);
    task.finish().unwrap();
    assert!(!ready(&runtime, d));

    let task = runtime.enter(c).unwrap();
    assert_eq!(task.get(&x).unwrap(), 42);
    task.finish().unwrap();
    assert!(ready(&runtime, d));

    let task = runtime.enter(d).unwrap();
    assert_eq!(task.get(&x).unwrap(), 42);
    task.set(&x, &43).unwrap();
    task.finish().unwrap();

    assert_eq!(runtime.task_state(d), Some(TaskState::Finished));
    assert!(runtime.with_backend(|b| b.is_acyclic()));

    root.finish().unwrap();
    runtime.finalize().unwrap();
}

#[test]
fn test_root_keeps_scheduling_rights() {
    let runtime = Runtime::in_memory(Config::default());
    let root = runtime.root(0).unwrap();
    let x = root.create_handle::<i64>("x").unwrap();
    assert_eq!(root.permissions(&x), Some(Permissions::MODIFY_MODIFY));

    root.spawn("reader", &[x.read()]).unwrap();
    assert_eq!(root.permissions(&x), Some(Permissions::MODIFY_READ));

    root.spawn("writer", &[x.modify()]).unwrap();
    assert_eq!(root.permissions(&x), Some(Permissions::MODIFY_NONE));

    let err = root.get(&x).unwrap_err();
    assert!(matches!(
        err,
        WeftError::Capture(CaptureViolation::ImmediatePermission { .. })
    ));

    // Scheduling is untouched, the context can still spawn.
    root.spawn("writer 2", &[x.modify()]).unwrap();
}

#[test]
fn test_nested_scheduling() {
    let runtime = Runtime::in_memory(Config::default());
    let root = runtime.root(0).unwrap();
    let x = root.create_handle::<i64>("x").unwrap();
    root.set(&x, &1).unwrap();

    let s = root.spawn("s", &[x.schedule_modify()]).unwrap();
    assert!(ready(&runtime, s));

    let outer = runtime.enter(s).unwrap();
    assert_eq!(outer.permissions(&x), Some(Permissions::MODIFY_NONE));
    assert!(matches!(
        outer.get(&x).unwrap_err(),
        WeftError::Capture(CaptureViolation::ImmediatePermission { .. })
    ));

    let w = outer.spawn("w", &[x.modify()]).unwrap();
    assert!(ready(&runtime, w));
    outer.finish().unwrap();

    let r = root.spawn("r", &[x.read()]).unwrap();
    assert_eq!(
        deps(&runtime, r),
        vec![(s, DependencyKind::Version), (w, DependencyKind::Version)]
    );
    assert!(!ready(&runtime, r));

    let inner = runtime.enter(w).unwrap();
    assert_eq!(inner.get(&x).unwrap(), 1);
    inner.set(&x, &2).unwrap();
    inner.finish().unwrap();

    assert!(ready(&runtime, r));
    let reader = runtime.enter(r).unwrap();
    assert_eq!(reader.get(&x).unwrap(), 2);
    reader.finish().unwrap();
}

#[test]
fn test_escalation_is_refused() {
    let runtime = Runtime::in_memory(Config::default());
    let root = runtime.root(0).unwrap();
    let x = root.create_handle::<i64>("x").unwrap();

    let b = root.spawn("b", &[x.read()]).unwrap();
    let task = runtime.enter(b).unwrap();
    let before = task.current_use(&x);

    let err = task.spawn("nested", &[x.modify()]).unwrap_err();
    assert!(matches!(
        err,
        WeftError::Capture(CaptureViolation::Escalation {
            requested: AccessIntent::Modify,
            ..
        })
    ));
    assert_eq!(task.current_use(&x), before);
    assert_eq!(task.permissions(&x), Some(Permissions::READ_READ));

    // Reads may still be delegated.
    task.spawn("nested", &[x.read()]).unwrap();
}

#[test]
fn test_failed_spawn_changes_nothing() {
    let runtime = Runtime::in_memory(Config::default());
    let root = runtime.root(0).unwrap();
    let x = root.create_handle::<i64>("x").unwrap();
    let y = root.create_handle::<i64>("y").unwrap();
    root.release(&y).unwrap();

    let probe = root.spawn("probe", &[]).unwrap();
    let before = root.current_use(&x);
    let uses = runtime.with_backend(|b| b.use_count());

    let err = root.spawn("bad", &[x.read(), y.modify()]).unwrap_err();
    assert!(matches!(
        err,
        WeftError::Capture(CaptureViolation::NotCaptured { .. })
    ));

    let err = root.spawn("dup", &[x.read(), x.modify()]).unwrap_err();
    assert!(matches!(
        err,
        WeftError::Capture(CaptureViolation::DuplicateAccess { .. })
    ));

    assert_eq!(root.current_use(&x), before);
    assert_eq!(runtime.with_backend(|b| b.use_count()), uses);

    let next = root.spawn("next", &[]).unwrap();
    assert_eq!(next.index(), probe.index() + 1);
}

#[test]
fn test_task_without_accesses_is_ready() {
    let runtime = Runtime::in_memory(Config::default());
    let root = runtime.root(0).unwrap();
    let t = root.spawn("idle", &[]).unwrap();
    assert!(ready(&runtime, t));
    assert_eq!(runtime.task_name(t).as_deref(), Some("idle"));
    assert_eq!(runtime.parent(t), Some(root.id()));
}

#[test]
fn test_double_release() {
    let runtime = Runtime::in_memory(Config::default());
    let root = runtime.root(0).unwrap();
    let x = root.create_handle::<i64>("x").unwrap();

    root.release(&x).unwrap();
    let err = root.release(&x).unwrap_err();
    assert!(matches!(
        err,
        WeftError::Capture(CaptureViolation::DoubleRelease { .. })
    ));

    let err = root.spawn("late", &[x.read()]).unwrap_err();
    assert!(matches!(
        err,
        WeftError::Capture(CaptureViolation::NotCaptured { .. })
    ));
}

#[test]
fn test_handle_outside_its_context() {
    let runtime = Runtime::in_memory(Config::default());
    let root = runtime.root(0).unwrap();
    let x = root.create_handle::<i64>("x").unwrap();
    let y = root.create_handle::<i64>("y").unwrap();

    let t = root.spawn("t", &[x.read()]).unwrap();
    let task = runtime.enter(t).unwrap();

    let err = task.spawn("nested", &[y.read()]).unwrap_err();
    assert!(matches!(
        err,
        WeftError::Capture(CaptureViolation::NotCaptured { .. })
    ));
}

#[test]
fn test_duplicate_key_in_one_rank() {
    let runtime = Runtime::in_memory(Config::default().with_ranks(2));
    let first = runtime.root(0).unwrap();
    let second = runtime.root(1).unwrap();

    let _x = first.create_handle::<i64>("x").unwrap();
    let err = first.create_handle::<i64>("x").unwrap_err();
    assert!(matches!(
        err,
        WeftError::Capture(CaptureViolation::DuplicateKey { .. })
    ));

    // Other ranks have their own namespace.
    second.create_handle::<i64>("x").unwrap();
}

#[test]
fn test_enter_rules() {
    let runtime = Runtime::in_memory(Config::default());
    let root = runtime.root(0).unwrap();
    let t = root.spawn("t", &[]).unwrap();

    let task = runtime.enter(t).unwrap();
    assert!(matches!(
        runtime.enter(t).unwrap_err(),
        WeftError::TaskState {
            state: TaskState::Running,
            ..
        }
    ));
    task.finish().unwrap();

    assert!(matches!(
        task.spawn("late", &[]).unwrap_err(),
        WeftError::TaskState {
            state: TaskState::Finished,
            ..
        }
    ));
    assert!(matches!(
        runtime.root(1).unwrap_err(),
        WeftError::UnknownRank { rank: 1, ranks: 1 }
    ));
}

#[test]
fn test_finalize_reports_unfinished() {
    let runtime = Runtime::in_memory(Config::default());
    let root = runtime.root(0).unwrap();
    root.spawn("pending", &[]).unwrap();
    root.finish().unwrap();

    let err = runtime.finalize().unwrap_err();
    assert!(matches!(err, WeftError::Unfinished { count: 1, .. }));

    let lenient = Config {
        strict_finalize: false,
        ..Config::default()
    };
    let runtime = Runtime::in_memory(lenient);
    runtime.root(0).unwrap().spawn("pending", &[]).unwrap();
    runtime.finalize().unwrap();
}

#[test]
fn test_handles_are_reclaimed() {
    let runtime = Runtime::in_memory(Config::default());
    let root = runtime.root(0).unwrap();

    let x = root.create_handle::<i64>("x").unwrap();
    let t = root.spawn("t", &[x.read()]).unwrap();
    assert_eq!(runtime.live_handles(0), 1);

    root.release(&x).unwrap();
    drop(x);
    // The spawned task still holds a use.
    assert_eq!(runtime.live_handles(0), 1);

    runtime.enter(t).unwrap().finish().unwrap();
    assert_eq!(runtime.live_handles(0), 0);
}

#[test]
fn test_handles_change_hands_while_inspecting() {
    let runtime = Runtime::in_memory(Config::default());
    let root = runtime.root(0).unwrap();
    let x = root.create_handle::<i64>("x").unwrap();
    root.release(&x).unwrap();

    let copy = runtime.with_backend(|b| {
        let copy = x.clone();
        drop(x);
        assert_eq!(b.use_count(), 1);
        copy
    });
    assert_eq!(runtime.live_handles(0), 1);

    runtime.with_backend(|_| drop(copy));
    assert_eq!(runtime.live_handles(0), 0);
}

#[test]
fn test_mermaid_rendering() {
    let runtime = Runtime::in_memory(Config::default());
    let root = runtime.root(0).unwrap();
    let x = root.create_handle::<i64>("x").unwrap();
    root.spawn("writer", &[x.modify()]).unwrap();
    root.spawn("reader", &[x.read()]).unwrap();

    let chart = runtime.with_backend(|b| b.render_mermaid());
    assert!(chart.starts_with("graph LR"));
    assert!(chart.contains("writer"));
    assert!(chart.contains("reader"));
}
