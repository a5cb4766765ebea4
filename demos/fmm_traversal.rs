//! Full up and down pass over an octree with unit leaf masses, then the metrics
//! in Prometheus text format.
//!
//! Run with `cargo run --example fmm_traversal -- [depth] [groups] [group size]`.

use std::sync::Arc;

use tracing::Level;

use lanesched::core::metrics::PrometheusExporter;
use lanesched::core::{BoxId, SchedulerMetrics, UnitOperators};
use lanesched::device::{Device, DeviceHeap};
use lanesched::schedule::{run_traversal_with_metrics, TraversalPlan};

fn main() {
    tracing_subscriber::fmt().with_max_level(Level::DEBUG).init();

    let defaults = TraversalPlan::default();
    let mut args = std::env::args().skip(1);
    let mut next = |fallback: usize| {
        args.next()
            .and_then(|a| a.parse().ok())
            .unwrap_or(fallback)
    };
    let plan = TraversalPlan::default()
        .with_depth(next(defaults.depth as usize).min(u8::MAX as usize) as u8)
        .with_groups(next(defaults.groups))
        .with_group_size(next(defaults.group_size));

    let device = Device::default();
    println!("{}", device.config());

    let mut heap = DeviceHeap::default();
    let metrics = Arc::new(SchedulerMetrics::new());
    let report =
        match run_traversal_with_metrics(&device, &mut heap, plan, &UnitOperators, &metrics) {
            Ok(report) => report,
            Err(e) => {
                eprintln!("traversal failed: {e:?}");
                std::process::exit(1);
            }
        };

    println!(
        "depth {}: {} of {} tasks in {} rounds, complete: {}",
        plan.depth,
        report.executed,
        report.expected,
        report.scheduler.rounds,
        report.is_complete()
    );
    if let Some(root) = report.node(BoxId::ROOT) {
        println!("root multipole {}, root local {}", root.multipole, root.local);
    }

    let exporter =
        PrometheusExporter::new(device.metrics().clone(), "lanesched").with_scheduler(metrics);
    print!("{}", exporter.render());
}
