//! Run metrics
//!
//! Per-run progress, aggregate counters and host load, shared between the
//! executor and the metrics server as JSON-serializable snapshots.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

/// Finished runs kept in the snapshot; older ones are dropped
pub const MAX_FINISHED_RUNS: usize = 100;

/// Per-run progress
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunMetrics {
    pub id: String,
    /// `queued`, a pipeline stage name, or a terminal state
    pub stage: String,
    pub clips: usize,
    /// Clips normalized so far, cache hits included
    pub clips_normalized: usize,
    pub cache_hits: usize,
    pub output_path: String,
    pub error: Option<String>,
}

/// Host load at snapshot time
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
}

/// Complete metrics snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    /// Selected video encoder name
    pub encoder: String,
    pub runs: Vec<RunMetrics>,
    pub system: SystemMetrics,
    pub queue_len: usize,
    pub running_runs: usize,
    pub completed_runs: u64,
    pub failed_runs: u64,
    pub cancelled_runs: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl RunMetrics {
    pub fn is_finished(&self) -> bool {
        matches!(self.stage.as_str(), "completed" | "failed" | "cancelled")
    }
}

impl MetricsSnapshot {
    /// Latest run with `id`; an id may recur once its earlier run finished
    pub fn run_mut(&mut self, id: &str) -> Option<&mut RunMetrics> {
        self.runs.iter_mut().rev().find(|r| r.id == id)
    }

    /// Drop the oldest finished runs beyond `keep`; active runs always stay
    pub fn prune_finished(&mut self, keep: usize) {
        let finished = self.runs.iter().filter(|r| r.is_finished()).count();
        let mut excess = finished.saturating_sub(keep);
        self.runs.retain(|r| {
            if excess > 0 && r.is_finished() {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }

    pub fn touch(&mut self) {
        self.timestamp_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
    }
}

/// Shared metrics state for concurrent access across runs
pub type SharedMetrics = Arc<RwLock<MetricsSnapshot>>;

pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(MetricsSnapshot::default()))
}

/// Sample host CPU, memory and load via sysinfo
pub fn collect_system_metrics() -> SystemMetrics {
    use sysinfo::{System, MINIMUM_CPU_UPDATE_INTERVAL};

    // usage is a delta between two refreshes
    let mut sys = System::new();
    sys.refresh_cpu_usage();
    std::thread::sleep(MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let total_memory = sys.total_memory();
    let mem_usage_percent = if total_memory > 0 {
        (sys.used_memory() as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };

    SystemMetrics {
        cpu_usage_percent: sys.global_cpu_usage(),
        mem_usage_percent,
        load_avg_1: System::load_average().one as f32,
    }
}
