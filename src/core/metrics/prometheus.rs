//! Prometheus text exposition for launch and scheduler metrics.

use core::fmt::Write;
use std::sync::Arc;

use super::{LatencyHistogram, LaunchMetrics, SchedulerMetrics};
use crate::core::task::OperatorKind;

pub struct PrometheusExporter {
    launch: Arc<LaunchMetrics>,
    scheduler: Option<Arc<SchedulerMetrics>>,
    prefix: &'static str,
}

impl PrometheusExporter {
    pub fn new(launch: Arc<LaunchMetrics>, prefix: &'static str) -> Self {
        Self {
            launch,
            scheduler: None,
            prefix,
        }
    }

    pub fn with_scheduler(mut self, scheduler: Arc<SchedulerMetrics>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn render(&self) -> String {
        let mut out = String::with_capacity(4096);
        // Writing into a String cannot fail.
        let _ = self.render_into(&mut out);
        out
    }

    fn render_into(&self, out: &mut String) -> core::fmt::Result {
        let p = self.prefix;
        let launch = self.launch.snapshot();

        counter(out, p, "launches_total", "Kernel launches", launch.launches)?;
        counter(out, p, "lanes_total", "Lanes run across all launches", launch.lanes)?;
        counter(out, p, "launch_failures_total", "Launches that ended in an error", launch.failures)?;
        counter(out, p, "aborted_lanes_total", "Lanes stopped by a launch abort", launch.aborted_lanes)?;

        let hist = &self.launch.latency;
        writeln!(out, "# HELP {p}_launch_latency_ns Launch wall time histogram")?;
        writeln!(out, "# TYPE {p}_launch_latency_ns histogram")?;
        let mut cumulative = 0u64;
        for (i, count) in hist.snapshot().iter().enumerate() {
            cumulative += count;
            let le = LatencyHistogram::bucket_le(i);
            if le == u64::MAX {
                writeln!(out, "{p}_launch_latency_ns_bucket{{le=\"+Inf\"}} {cumulative}")?;
                break;
            }
            writeln!(out, "{p}_launch_latency_ns_bucket{{le=\"{le}\"}} {cumulative}")?;
        }
        writeln!(out, "{p}_launch_latency_ns_count {}", hist.total())?;
        writeln!(out, "{p}_launch_latency_ns_max {}", launch.max_latency_ns)?;

        let Some(scheduler) = &self.scheduler else {
            return Ok(());
        };
        let s = scheduler.snapshot();

        writeln!(out, "# HELP {p}_tasks_total Tasks by lifecycle state")?;
        writeln!(out, "# TYPE {p}_tasks_total counter")?;
        writeln!(out, "{p}_tasks_total{{state=\"queued\"}} {}", s.queued)?;
        writeln!(out, "{p}_tasks_total{{state=\"dispatched\"}} {}", s.dispatched)?;
        writeln!(out, "{p}_tasks_total{{state=\"complete\"}} {}", s.completed)?;

        writeln!(out, "# HELP {p}_executed_total Completed tasks by operator")?;
        writeln!(out, "# TYPE {p}_executed_total counter")?;
        for op in OperatorKind::ALL {
            writeln!(
                out,
                "{p}_executed_total{{op=\"{}\"}} {}",
                op.short_name(),
                s.executed[op as usize]
            )?;
        }

        counter(out, p, "queue_pushes_total", "Accepted queue pushes", s.pushes)?;
        counter(out, p, "queue_rejected_pushes_total", "Pushes refused by a full queue", s.rejected_pushes)?;
        counter(out, p, "queue_pops_total", "Elements popped", s.pops)?;
        counter(out, p, "rounds_total", "Fill-execute-collect rounds", s.rounds)?;
        counter(out, p, "dependency_violations_total", "Counters driven below zero", s.dependency_violations)
    }
}

fn counter(out: &mut String, prefix: &str, name: &str, help: &str, value: u64) -> core::fmt::Result {
    writeln!(out, "# HELP {prefix}_{name} {help}")?;
    writeln!(out, "# TYPE {prefix}_{name} counter")?;
    writeln!(out, "{prefix}_{name} {value}")
}
