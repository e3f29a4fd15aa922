use weft::{
    AccessIntent, CaptureViolation, CollectionAccess, Config, DependencyKind, Feature,
    IndexMapping, IndexRange, Permissions, Runtime, TaskId, WeftError,
};

fn ready(runtime: &Runtime, task: TaskId) -> bool {
    runtime.with_backend(|b| b.is_task_ready(task))
}

fn deps(runtime: &Runtime, task: TaskId) -> Vec<(TaskId, DependencyKind)> {
    runtime.with_backend(|b| b.dependencies(task))
}

#[test]
fn test_scatter_then_gather() {
    let runtime = Runtime::in_memory(Config::default());
    let root = runtime.root(0).unwrap();
    let grid = root
        .create_collection::<Vec<i64>>("grid", IndexRange::upto(3))
        .unwrap();

    let init = root
        .spawn_collection("init", &IndexRange::upto(3), &[grid.each(AccessIntent::Modify)])
        .unwrap();
    assert_eq!(init.len(), 3);
    assert_eq!(
        runtime.task_name(init.task(1).unwrap()).as_deref(),
        Some("init[1]")
    );

    // Held per element now.
    assert_eq!(root.permissions(&grid), None);

    let err = root.spawn("sum", &[grid.read()]).unwrap_err();
    assert!(matches!(
        err,
        WeftError::Capture(CaptureViolation::UnjoinedBranches { .. })
    ));

    let err = root.finish().unwrap_err();
    assert!(matches!(
        err,
        WeftError::Capture(CaptureViolation::MissingRelease { .. })
    ));

    root.gather(&grid).unwrap();
    assert_eq!(root.permissions(&grid), Some(Permissions::MODIFY_NONE));

    let sum = root.spawn("sum", &[grid.read()]).unwrap();
    let expected: Vec<_> = init
        .tasks
        .values()
        .map(|&task| (task, DependencyKind::Gather))
        .collect();
    assert_eq!(deps(&runtime, sum), expected);

    for &task in init.tasks.values() {
        assert!(!ready(&runtime, sum));
        assert!(ready(&runtime, task));
        runtime.enter(task).unwrap().finish().unwrap();
    }
    assert!(ready(&runtime, sum));

    let task = runtime.enter(sum).unwrap();
    assert!(matches!(
        task.get(&grid).unwrap_err(),
        WeftError::Serialization(weft::SerializationContractViolation::Aggregate { .. })
    ));
    task.finish().unwrap();

    root.finish().unwrap();
}

#[test]
fn test_elements_chain_independently() {
    let runtime = Runtime::in_memory(Config::default());
    let root = runtime.root(0).unwrap();
    let grid = root
        .create_collection::<i64>("grid", IndexRange::upto(3))
        .unwrap();
    let range = IndexRange::upto(3);

    let first = root
        .spawn_collection("a", &range, &[grid.each(AccessIntent::Modify)])
        .unwrap();
    let second = root
        .spawn_collection("b", &range, &[grid.each(AccessIntent::Modify)])
        .unwrap();

    for index in range.indices() {
        let a = first.task(index).unwrap();
        let b = second.task(index).unwrap();
        assert_eq!(deps(&runtime, a), vec![]);
        assert_eq!(deps(&runtime, b), vec![(a, DependencyKind::Version)]);
    }

    let (a1, b1) = (first.task(1).unwrap(), second.task(1).unwrap());
    assert!(!ready(&runtime, b1));
    runtime.enter(a1).unwrap().finish().unwrap();
    assert!(ready(&runtime, b1));
    assert!(!ready(&runtime, second.task(0).unwrap()));

    // Releasing a split handle gathers it first.
    root.release(&grid).unwrap();
    root.finish().unwrap();
}

#[test]
fn test_gather_mode_rejoins_at_once() {
    let runtime = Runtime::in_memory(Config::default());
    let root = runtime.root(0).unwrap();
    let grid = root
        .create_collection::<i64>("grid", IndexRange::upto(4))
        .unwrap();

    let fill = root
        .spawn_collection("fill", &IndexRange::upto(4), &[grid.gather_each(AccessIntent::Modify)])
        .unwrap();
    assert_eq!(root.permissions(&grid), Some(Permissions::MODIFY_NONE));

    let reduce = root.spawn("reduce", &[grid.read()]).unwrap();
    let deps = deps(&runtime, reduce);
    assert_eq!(deps.len(), 4);
    assert!(deps.iter().all(|(_, kind)| *kind == DependencyKind::Gather));
    assert!(fill.tasks.values().all(|task| deps.iter().any(|(dep, _)| dep == task)));
}

#[test]
fn test_partial_range_leaves_other_elements() {
    let runtime = Runtime::in_memory(Config::default());
    let root = runtime.root(0).unwrap();
    let grid = root
        .create_collection::<i64>("grid", IndexRange::upto(4))
        .unwrap();

    let edges = root
        .spawn_collection(
            "edges",
            &IndexRange::set([0, 3]),
            &[grid.gather_each(AccessIntent::Modify)],
        )
        .unwrap();
    let reduce = root.spawn("reduce", &[grid.read()]).unwrap();

    let expected: Vec<_> = edges
        .tasks
        .values()
        .map(|&task| (task, DependencyKind::Gather))
        .collect();
    assert_eq!(deps(&runtime, reduce), expected);
}

#[test]
fn test_reads_share_the_unsplit_version() {
    let runtime = Runtime::in_memory(Config::default());
    let root = runtime.root(0).unwrap();
    let grid = root
        .create_collection::<i64>("grid", IndexRange::upto(3))
        .unwrap();

    let view = root
        .spawn_collection("view", &IndexRange::upto(3), &[grid.each(AccessIntent::Read)])
        .unwrap();
    assert_eq!(root.permissions(&grid), Some(Permissions::MODIFY_READ));

    for &task in view.tasks.values() {
        assert_eq!(deps(&runtime, task), vec![]);
        assert!(ready(&runtime, task));
    }

    let w = root.spawn("w", &[grid.modify()]).unwrap();
    let expected: Vec<_> = view
        .tasks
        .values()
        .map(|&task| (task, DependencyKind::AntiDependency))
        .collect();
    assert_eq!(deps(&runtime, w), expected);
}

#[test]
fn test_out_of_range_creates_nothing() {
    let runtime = Runtime::in_memory(Config::default());
    let root = runtime.root(0).unwrap();
    let grid = root
        .create_collection::<i64>("grid", IndexRange::upto(4))
        .unwrap();

    let probe = root.spawn("probe", &[]).unwrap();
    let before = root.current_use(&grid);
    let uses = runtime.with_backend(|b| b.use_count());

    let err = root
        .spawn_collection("stencil", &IndexRange::upto(5), &[grid.each(AccessIntent::Modify)])
        .unwrap_err();
    assert!(matches!(
        err,
        WeftError::Capture(CaptureViolation::IndexOutOfRange { index: 4, .. })
    ));

    let err = root
        .spawn_collection(
            "shifted",
            &IndexRange::upto(4),
            &[grid.each_mapped(AccessIntent::Read, IndexMapping::Offset(1))],
        )
        .unwrap_err();
    assert!(matches!(
        err,
        WeftError::Capture(CaptureViolation::IndexOutOfRange { index: 4, .. })
    ));

    assert_eq!(root.current_use(&grid), before);
    assert_eq!(root.permissions(&grid), Some(Permissions::MODIFY_MODIFY));
    assert_eq!(runtime.with_backend(|b| b.use_count()), uses);

    let next = root.spawn("next", &[]).unwrap();
    assert_eq!(next.index(), probe.index() + 1);
}

#[test]
fn test_broadcast_modify_chains_in_index_order() {
    let runtime = Runtime::in_memory(Config::default());
    let root = runtime.root(0).unwrap();
    let x = root.create_handle::<i64>("x").unwrap();

    let chain = root
        .spawn_collection(
            "chain",
            &IndexRange::upto(3),
            &[CollectionAccess::broadcast(&x, AccessIntent::Modify)],
        )
        .unwrap();
    let (t0, t1, t2) = (
        chain.task(0).unwrap(),
        chain.task(1).unwrap(),
        chain.task(2).unwrap(),
    );

    assert_eq!(deps(&runtime, t0), vec![]);
    assert_eq!(deps(&runtime, t1), vec![(t0, DependencyKind::Version)]);
    assert_eq!(deps(&runtime, t2), vec![(t1, DependencyKind::Version)]);
}

#[test]
fn test_per_index_handles() {
    let runtime = Runtime::in_memory(Config::default());
    let root = runtime.root(0).unwrap();
    let handles = vec![
        root.create_handle::<i64>("a").unwrap(),
        root.create_handle::<i64>("b").unwrap(),
    ];

    let err = root
        .spawn_collection(
            "each",
            &IndexRange::upto(3),
            &[CollectionAccess::per_index(&handles, AccessIntent::Modify)],
        )
        .unwrap_err();
    assert!(matches!(
        err,
        WeftError::Capture(CaptureViolation::IndexOutOfRange { index: 2, .. })
    ));

    let tasks = root
        .spawn_collection(
            "each",
            &IndexRange::upto(2),
            &[CollectionAccess::per_index(&handles, AccessIntent::Modify)],
        )
        .unwrap();
    for &task in tasks.tasks.values() {
        assert_eq!(deps(&runtime, task), vec![]);
        assert!(ready(&runtime, task));
    }
}

#[test]
fn test_split_publish_is_refused() {
    let runtime = Runtime::in_memory(Config::default().with_ranks(2));
    let root = runtime.root(0).unwrap();
    let grid = root
        .create_collection::<i64>("grid", IndexRange::upto(2))
        .unwrap();
    root.spawn_collection("init", &IndexRange::upto(2), &[grid.each(AccessIntent::Modify)])
        .unwrap();

    let err = root.publish(&grid, "v1", 1).unwrap_err();
    assert!(matches!(
        err,
        WeftError::Capture(CaptureViolation::ImmediatePermission { .. })
    ));
    assert_eq!(runtime.with_backend(|b| b.registry().open().count()), 0);
}

#[test]
fn test_collections_capability() {
    let config = Config::default().with_features([Feature::Conditional, Feature::Publication]);
    let runtime = Runtime::in_memory(config);
    let root = runtime.root(0).unwrap();

    let err = root
        .create_collection::<i64>("grid", IndexRange::upto(2))
        .unwrap_err();
    assert!(matches!(err, WeftError::CapabilityMissing(Feature::Collections)));

    let x = root.create_handle::<i64>("x").unwrap();
    let err = root
        .spawn_collection(
            "chain",
            &IndexRange::upto(2),
            &[CollectionAccess::broadcast(&x, AccessIntent::Read)],
        )
        .unwrap_err();
    assert!(matches!(err, WeftError::CapabilityMissing(Feature::Collections)));
}

#[test]
fn test_elements_keep_their_own_values() {
    let runtime = Runtime::in_memory(Config::default());
    let root = runtime.root(0).unwrap();
    let grid = root
        .create_collection::<i64>("grid", IndexRange::upto(2))
        .unwrap();
    let range = IndexRange::upto(2);

    let init = root
        .spawn_collection("init", &range, &[grid.each(AccessIntent::Modify)])
        .unwrap();
    for index in range.indices() {
        let task = runtime.enter(init.task(index).unwrap()).unwrap();
        task.set(&grid, &((index as i64 + 1) * 10)).unwrap();
        task.finish().unwrap();
    }

    let view = root
        .spawn_collection("view", &range, &[grid.each(AccessIntent::Read)])
        .unwrap();
    let values: Vec<i64> = range
        .indices()
        .into_iter()
        .map(|index| {
            let task = runtime.enter(view.task(index).unwrap()).unwrap();
            let value = task.get(&grid).unwrap();
            task.finish().unwrap();
            value
        })
        .collect();
    assert_eq!(values, vec![10, 20]);

    // Elements stay addressable after the collection is gathered.
    root.gather(&grid).unwrap();
    let after = root
        .spawn_collection("after", &range, &[grid.each(AccessIntent::Read)])
        .unwrap();
    for index in range.indices() {
        let task = after.task(index).unwrap();
        assert!(ready(&runtime, task));

        let task = runtime.enter(task).unwrap();
        assert_eq!(task.get(&grid).unwrap(), (index as i64 + 1) * 10);
        task.finish().unwrap();
    }

    root.finish().unwrap();
    runtime.finalize().unwrap();
}

#[test]
fn test_untouched_elements_show_the_collection_value() {
    let runtime = Runtime::in_memory(Config::default());
    let root = runtime.root(0).unwrap();
    let grid = root
        .create_collection::<i64>("grid", IndexRange::upto(3))
        .unwrap();
    root.set(&grid, &7).unwrap();

    let edit = root
        .spawn_collection("edit", &IndexRange::set([1]), &[grid.each(AccessIntent::Modify)])
        .unwrap();
    let task = edit.task(1).unwrap();
    assert!(ready(&runtime, task));

    let task = runtime.enter(task).unwrap();
    assert_eq!(task.get(&grid).unwrap(), 7);
    task.set(&grid, &5).unwrap();
    task.finish().unwrap();

    let range = IndexRange::upto(3);
    let view = root
        .spawn_collection("view", &range, &[grid.each(AccessIntent::Read)])
        .unwrap();
    let values: Vec<i64> = range
        .indices()
        .into_iter()
        .map(|index| {
            let task = runtime.enter(view.task(index).unwrap()).unwrap();
            task.get(&grid).unwrap()
        })
        .collect();
    assert_eq!(values, vec![7, 5, 7]);
}
