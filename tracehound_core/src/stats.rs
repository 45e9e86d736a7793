use crate::bitmap::{MAP_SIZE, count_non_255_bytes};
use crate::state::{FuzzerState, StageKind};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Minimum spacing between two periodic stats writes.
pub const STATS_UPDATE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Serialize, Debug, Clone, Default)]
pub struct StageStats {
    pub finds: u64,
    pub execs: u64,
}

/// Point-in-time view of a fuzzing session.
#[derive(Serialize, Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub run_time_secs: u64,
    pub cycles_done: u64,
    pub cycles_wo_finds: u64,
    pub cur_path: usize,
    pub execs_done: u64,
    pub execs_per_sec: f64,
    pub paths_total: usize,
    pub paths_favored: u32,
    pub paths_found: u64,
    pub paths_imported: u64,
    pub max_depth: u64,
    pub pending_favs: u32,
    pub pending_total: u32,
    pub variable_paths: u32,
    pub paths_with_cov: u32,
    pub unique_crashes: u64,
    pub unique_hangs: u64,
    pub total_crashes: u64,
    pub total_hangs: u64,
    pub useless_at_start: u32,
    /// Share of the map covered so far, percent.
    pub bitmap_cvg: f64,
    pub exec_timeout_ms: u64,
    pub stages: BTreeMap<&'static str, StageStats>,
    pub command_line: String,
}

impl StatsSnapshot {
    pub fn capture(state: &FuzzerState) -> Self {
        let run_time = state.start_time.elapsed();
        let execs = state.counters.total_execs;
        let secs = run_time.as_secs_f64();
        let execs_per_sec = if secs > 0.0 { execs as f64 / secs } else { 0.0 };

        let stages = StageKind::ALL
            .iter()
            .map(|&k| {
                (
                    k.short_name(),
                    StageStats {
                        finds: state.counters.stage_finds[k.index()],
                        execs: state.counters.stage_cycles[k.index()],
                    },
                )
            })
            .collect();

        Self {
            run_time_secs: run_time.as_secs(),
            cycles_done: state.queue_cycle.saturating_sub(1),
            cycles_wo_finds: state.cycles_wo_finds,
            cur_path: state.current_entry,
            execs_done: execs,
            execs_per_sec,
            paths_total: state.queue.len(),
            paths_favored: state.queue.queued_favored,
            paths_found: state.counters.queued_discovered,
            paths_imported: state.counters.queued_imported,
            max_depth: state.queue.max_depth,
            pending_favs: state.queue.pending_favored,
            pending_total: state.queue.pending_not_fuzzed,
            variable_paths: state.queue.queued_variable,
            paths_with_cov: state.queue.queued_with_cov,
            unique_crashes: state.counters.unique_crashes,
            unique_hangs: state.counters.unique_hangs,
            total_crashes: state.counters.total_crashes,
            total_hangs: state.counters.total_hangs,
            useless_at_start: state.counters.useless_at_start,
            bitmap_cvg: count_non_255_bytes(&state.virgin_bits) as f64 * 100.0 / MAP_SIZE as f64,
            exec_timeout_ms: state.exec_tmout.as_millis() as u64,
            stages,
            command_line: state.command_line.clone(),
        }
    }
}

/// Destination for periodic stats snapshots.
pub trait StatsSink {
    fn record(&mut self, snapshot: &StatsSnapshot) -> io::Result<()>;
}

/// Rewrites a JSON file with the latest snapshot.
pub struct JsonStatsSink {
    path: PathBuf,
}

impl JsonStatsSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StatsSink for JsonStatsSink {
    fn record(&mut self, snapshot: &StatsSnapshot) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(snapshot).map_err(io::Error::other)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)
    }
}

#[derive(Debug, Default)]
pub struct NullStatsSink;

impl StatsSink for NullStatsSink {
    fn record(&mut self, _snapshot: &StatsSnapshot) -> io::Result<()> {
        Ok(())
    }
}
