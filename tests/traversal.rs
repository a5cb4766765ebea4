//! End-to-end up and down passes through the queue-driven scheduler.

#![cfg(feature = "std")]

use std::sync::Arc;

use lanesched::core::metrics::{LaunchMetrics, PrometheusExporter};
use lanesched::core::{
    BoxId, DependencyAccumulator, DependencyError, DispatchError, NodeCell, OperatorKind,
    Operators, Processor, SchedulerMetrics, Task, UnitOperators,
};
use lanesched::device::{Device, DeviceHeap, KernelError, LaunchError, NdRange};
use lanesched::schedule::{
    expected_tasks, run_traversal, run_traversal_with_metrics, TraversalPlan, TraversalReport,
};

fn run(plan: TraversalPlan, ops: &dyn Operators) -> TraversalReport {
    let device = Device::default();
    let mut heap = DeviceHeap::default();
    let report = run_traversal(&device, &mut heap, plan, ops).unwrap();
    assert_eq!(heap.live_regions(), 0);
    report
}

/// Leaf mass grows with its Morton index, so every node sum is distinct.
struct IndexedMass;

impl Operators for IndexedMass {
    fn p2p(&self, leaf: BoxId) -> f64 {
        leaf.index() as f64
    }

    fn p2m(&self, leaf: BoxId) -> f64 {
        leaf.index() as f64 + 1.0
    }

    fn m2l(&self, _node: BoxId, multipole: f64) -> f64 {
        2.0 * multipole
    }
}

#[test]
fn test_unit_traversal_values() {
    let depth = 3u8;
    let report = run(
        TraversalPlan::default().with_depth(depth).with_groups(4).with_group_size(16),
        &UnitOperators,
    );

    assert!(report.is_complete());
    assert_eq!(report.executed, expected_tasks(depth));

    let subtree = |level: u8| 8f64.powi((depth - level) as i32);
    for linear in 0..BoxId::node_count(depth) {
        let node = BoxId::from_linear(linear).unwrap();
        let snap = report.node(node).unwrap();
        assert_eq!(snap.multipole, subtree(node.level()), "multipole of {node:?}");

        let local: f64 = (0..=node.level()).map(subtree).sum();
        assert_eq!(snap.local, local, "local of {node:?}");

        if node.is_leaf_at(depth) {
            assert_eq!(snap.potential, 1.0 + local);
        } else {
            assert_eq!(snap.potential, 0.0);
        }
    }
}

#[test]
fn test_results_independent_of_group_shape() {
    let depth = 2u8;
    let shapes = [(1, 1), (1, 64), (3, 5), (8, 8), (16, 2)];

    let reports: Vec<TraversalReport> = shapes
        .iter()
        .map(|&(groups, group_size)| {
            run(
                TraversalPlan::default()
                    .with_depth(depth)
                    .with_groups(groups)
                    .with_group_size(group_size),
                &IndexedMass,
            )
        })
        .collect();

    for report in &reports {
        assert!(report.is_complete());
        assert_eq!(report.nodes, reports[0].nodes);
    }
    // 64 leaves with mass 1..=64.
    assert_eq!(reports[0].node(BoxId::ROOT).unwrap().multipole, 2080.0);
}

#[test]
fn test_more_groups_than_leaves() {
    let report = run(
        TraversalPlan::default().with_depth(1).with_groups(16).with_group_size(2),
        &UnitOperators,
    );
    assert!(report.is_complete());
    assert_eq!(report.executed, 42);
}

#[test]
fn test_depth_zero() {
    let report = run(
        TraversalPlan::default().with_depth(0).with_groups(1).with_group_size(4),
        &UnitOperators,
    );
    assert!(report.is_complete());
    assert_eq!(report.node(BoxId::ROOT).unwrap().potential, 2.0);
}

#[test]
fn test_lifecycle_counts_and_export() {
    let device = Device::default();
    let mut heap = DeviceHeap::default();
    let metrics = Arc::new(SchedulerMetrics::new());
    let plan = TraversalPlan::default().with_depth(2).with_groups(2).with_group_size(32);

    let first = run_traversal_with_metrics(&device, &mut heap, plan, &UnitOperators, &metrics)
        .unwrap();
    let second = run_traversal_with_metrics(&device, &mut heap, plan, &UnitOperators, &metrics)
        .unwrap();
    assert_eq!(first.executed, second.executed);

    let snap = metrics.snapshot();
    let expected = 2 * expected_tasks(2);
    assert_eq!(snap.queued, expected);
    assert_eq!(snap.dispatched, expected);
    assert_eq!(snap.completed, expected);
    assert_eq!(snap.rejected_pushes, 0);
    assert_eq!(snap.dependency_violations, 0);
    assert_eq!(snap.executed[OperatorKind::MultipoleToMultipole as usize], 2 * 72);

    let launch: Arc<LaunchMetrics> = device.metrics().clone();
    let output = PrometheusExporter::new(launch, "lanesched")
        .with_scheduler(metrics)
        .render();
    assert!(output.contains("lanesched_launches_total 2"));
    assert!(output.contains("lanesched_executed_total{op=\"l2l\"} 18"));
    assert!(output.contains(&format!(
        "lanesched_tasks_total{{state=\"complete\"}} {expected}"
    )));
}

#[test]
fn test_replayed_task_aborts_launch() {
    let cells: Vec<NodeCell> = (0..BoxId::node_count(1)).map(|_| NodeCell::new()).collect();
    let acc = DependencyAccumulator::new(1, cells).unwrap();
    let processor = Processor::new(&UnitOperators, &acc);
    let leaf = BoxId::new(1, 6).unwrap();

    let result = Device::default().launch(NdRange::linear(2, 2), |_item| {
        processor.execute(Task::new(OperatorKind::ParticleToMultipole, leaf))?;
        Ok(())
    });

    match result {
        Err(LaunchError::Kernel { error, .. }) => assert_eq!(
            error,
            KernelError::Dispatch(DispatchError::Dependency(DependencyError::DoubleCompletion {
                node: leaf
            }))
        ),
        other => panic!("expected a double completion, got {other:?}"),
    }
    assert_eq!(acc.violation(), Some(leaf));
}
