use crate::bitmap::{MAP_SIZE, MINI_SIZE, MiniTrace, Trace, mini_has, minimize_bits};
use rand::Rng;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Probability (percent) of skipping an already-fuzzed or non-favored entry
/// while favored, never-fuzzed entries are pending.
pub const SKIP_TO_NEW_PROB: u32 = 99;
/// Skip probability for a non-favored entry that was already fuzzed.
pub const SKIP_NFAV_OLD_PROB: u32 = 95;
/// Skip probability for a non-favored entry that was never fuzzed.
pub const SKIP_NFAV_NEW_PROB: u32 = 75;

/// Errors raised while reading or persisting queue entries.
#[derive(Error, Debug)]
pub enum QueueError {
    /// The requested entry index does not exist.
    #[error("Queue entry {0} does not exist")]
    EntryNotFound(usize),

    /// Reading or writing an entry or one of its state markers failed.
    #[error("Queue I/O error on {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

impl QueueError {
    fn io(path: &Path, source: io::Error) -> Self {
        QueueError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// One test case in the corpus.
///
/// Entries are created by the dry run or by triage, and then only ever
/// updated in place; they are never removed during a run.
#[derive(Debug, Clone, Default)]
pub struct QueueEntry {
    /// Location of the entry's bytes under `queue/`.
    pub path: PathBuf,
    pub len: usize,

    /// Number of calibration attempts that did not complete.
    pub cal_failed: u8,
    pub trim_done: bool,
    pub was_fuzzed: bool,
    /// Deterministic stages have completed for this entry.
    pub passed_det: bool,
    /// Triggered a tuple no earlier entry had.
    pub has_new_cov: bool,
    pub var_behavior: bool,
    pub favored: bool,
    /// Mirrors the `redundant_edges` marker on disk.
    pub fs_redundant: bool,

    /// Number of tuples hit by the entry's trace.
    pub bitmap_size: u32,
    /// Checksum of the bucketed trace.
    pub exec_cksum: u32,
    /// Mean execution time measured during calibration, microseconds.
    pub exec_us: u64,
    /// Queue cycles that had passed when the entry was found.
    pub handicap: u64,
    pub depth: u64,

    /// Hit/miss summary, kept only while the entry wins at least one tuple.
    pub trace_mini: Option<Box<MiniTrace>>,
    /// Number of tuples this entry currently wins.
    pub tc_ref: u32,
}

impl QueueEntry {
    /// Last path component, used to key the per-entry state markers.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Desirability used to pick tuple winners; lower is better.
    pub fn fav_factor(&self) -> u64 {
        self.exec_us.saturating_mul(self.len as u64)
    }
}

/// Which per-entry marker directory a sentinel file lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    DeterministicDone,
    VariableBehavior,
    RedundantEdges,
}

impl Marker {
    pub fn dir_name(self) -> &'static str {
        match self {
            Marker::DeterministicDone => "deterministic_done",
            Marker::VariableBehavior => "variable_behavior",
            Marker::RedundantEdges => "redundant_edges",
        }
    }
}

/// The append-only corpus plus the per-tuple winner index.
///
/// Entries live in an arena and are addressed by index. `top_rated[t]`
/// holds the index of the cheapest entry seen so far that covers tuple `t`;
/// [`Queue::cull`] derives the favored subset from it.
#[derive(Debug)]
pub struct Queue {
    entries: Vec<QueueEntry>,
    top_rated: Vec<Option<usize>>,
    score_changed: bool,
    state_dir: Option<PathBuf>,

    pub queued_favored: u32,
    pub pending_favored: u32,
    pub pending_not_fuzzed: u32,
    pub queued_variable: u32,
    pub queued_with_cov: u32,
    pub max_depth: u64,
}

impl Queue {
    /// Creates an empty queue. When `state_dir` is set, per-entry markers are
    /// mirrored as zero-byte files in its subdirectories.
    pub fn new(state_dir: Option<PathBuf>) -> Self {
        Self {
            entries: Vec::new(),
            top_rated: vec![None; MAP_SIZE],
            score_changed: false,
            state_dir,
            queued_favored: 0,
            pending_favored: 0,
            pending_not_fuzzed: 0,
            queued_variable: 0,
            queued_with_cov: 0,
            max_depth: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&QueueEntry> {
        self.entries.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut QueueEntry> {
        self.entries.get_mut(idx)
    }

    pub fn entry(&self, idx: usize) -> Result<&QueueEntry, QueueError> {
        self.entries.get(idx).ok_or(QueueError::EntryNotFound(idx))
    }

    pub fn entry_mut(&mut self, idx: usize) -> Result<&mut QueueEntry, QueueError> {
        self.entries
            .get_mut(idx)
            .ok_or(QueueError::EntryNotFound(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    /// Index of the tuple's current winner, if any.
    pub fn winner(&self, tuple: usize) -> Option<usize> {
        self.top_rated.get(tuple).copied().flatten()
    }

    /// Appends a new entry found at `cur_depth` and returns its index.
    pub fn add(&mut self, path: PathBuf, len: usize, passed_det: bool, cur_depth: u64) -> usize {
        let depth = cur_depth + 1;
        self.max_depth = self.max_depth.max(depth);
        self.pending_not_fuzzed += 1;
        self.entries.push(QueueEntry {
            path,
            len,
            passed_det,
            depth,
            ..QueueEntry::default()
        });
        self.entries.len() - 1
    }

    /// Offers entry `idx` as the winner of every tuple hit by `trace`.
    ///
    /// A challenger takes a tuple when it has no winner or when its
    /// `exec_us * len` is strictly lower. Losers that no longer win anything
    /// drop their minimized trace.
    pub fn update_bitmap_score(&mut self, idx: usize, trace: &Trace) {
        let Some(fav_factor) = self.entries.get(idx).map(QueueEntry::fav_factor) else {
            return;
        };

        for (tuple, &hit) in trace.iter().enumerate() {
            if hit == 0 {
                continue;
            }

            if let Some(current) = self.top_rated[tuple] {
                if current == idx || fav_factor >= self.entries[current].fav_factor() {
                    continue;
                }
                let old = &mut self.entries[current];
                old.tc_ref -= 1;
                if old.tc_ref == 0 {
                    old.trace_mini = None;
                }
            }

            self.top_rated[tuple] = Some(idx);
            let entry = &mut self.entries[idx];
            entry.tc_ref += 1;
            if entry.trace_mini.is_none() {
                entry.trace_mini = Some(minimize_bits(trace));
            }
            self.score_changed = true;
        }
    }

    /// Recomputes the favored subset with a greedy set cover over the winner
    /// index. Does nothing unless a winner changed since the last pass.
    ///
    /// Returns `true` when a pass actually ran.
    pub fn cull(&mut self, dumb_mode: bool) -> Result<bool, QueueError> {
        if dumb_mode || !self.score_changed {
            return Ok(false);
        }
        self.score_changed = false;

        // One bit per tuple, set while the tuple is still uncovered.
        let mut uncovered = [0xffu8; MINI_SIZE];
        self.queued_favored = 0;
        self.pending_favored = 0;
        for entry in &mut self.entries {
            entry.favored = false;
        }

        for tuple in 0..MAP_SIZE {
            let Some(winner) = self.top_rated[tuple] else {
                continue;
            };
            if !mini_has(&uncovered, tuple) {
                continue;
            }

            let entry = &mut self.entries[winner];
            if let Some(mini) = &entry.trace_mini {
                for (u, m) in uncovered.iter_mut().zip(mini.iter()) {
                    *u &= !m;
                }
            }
            entry.favored = true;
            self.queued_favored += 1;
            if !entry.was_fuzzed {
                self.pending_favored += 1;
            }
        }

        for idx in 0..self.entries.len() {
            let redundant = !self.entries[idx].favored;
            self.mark_redundant(idx, redundant)?;
        }
        Ok(true)
    }

    /// Decides whether entry `idx` should be passed over in this round.
    ///
    /// While favored, never-fuzzed entries exist, almost everything else is
    /// skipped; otherwise non-favored entries are skipped most of the time,
    /// a bit less often if they have not been fuzzed yet.
    pub fn should_skip<R: Rng>(
        &self,
        idx: usize,
        rng: &mut R,
        queue_cycle: u64,
        dumb_mode: bool,
    ) -> bool {
        let Some(entry) = self.entries.get(idx) else {
            return true;
        };

        if self.pending_favored > 0 {
            if (entry.was_fuzzed || !entry.favored) && rng.random_range(0..100) < SKIP_TO_NEW_PROB
            {
                return true;
            }
        } else if !dumb_mode && !entry.favored && self.entries.len() > 10 {
            let prob = if queue_cycle > 1 && !entry.was_fuzzed {
                SKIP_NFAV_NEW_PROB
            } else {
                SKIP_NFAV_OLD_PROB
            };
            if rng.random_range(0..100) < prob {
                return true;
            }
        }
        false
    }

    /// Records that entry `idx` has been through a full fuzzing round.
    pub fn mark_fuzzed(&mut self, idx: usize) {
        let Some(entry) = self.entries.get_mut(idx) else {
            return;
        };
        if entry.was_fuzzed {
            return;
        }
        entry.was_fuzzed = true;
        self.pending_not_fuzzed = self.pending_not_fuzzed.saturating_sub(1);
        if entry.favored {
            self.pending_favored = self.pending_favored.saturating_sub(1);
        }
    }

    pub fn mark_det_done(&mut self, idx: usize) -> Result<(), QueueError> {
        self.entry_mut(idx)?.passed_det = true;
        self.touch_marker(idx, Marker::DeterministicDone)
    }

    pub fn mark_variable(&mut self, idx: usize) -> Result<(), QueueError> {
        let entry = self.entry_mut(idx)?;
        if entry.var_behavior {
            return Ok(());
        }
        entry.var_behavior = true;
        self.queued_variable += 1;
        self.touch_marker(idx, Marker::VariableBehavior)
    }

    fn mark_redundant(&mut self, idx: usize, redundant: bool) -> Result<(), QueueError> {
        let entry = self.entry_mut(idx)?;
        if entry.fs_redundant == redundant {
            return Ok(());
        }
        entry.fs_redundant = redundant;

        if redundant {
            self.touch_marker(idx, Marker::RedundantEdges)
        } else if let Some(path) = self.marker_path(idx, Marker::RedundantEdges) {
            match fs::remove_file(&path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(QueueError::io(&path, e)),
                _ => Ok(()),
            }
        } else {
            Ok(())
        }
    }

    pub fn marker_path(&self, idx: usize, marker: Marker) -> Option<PathBuf> {
        let dir = self.state_dir.as_ref()?;
        let entry = self.entries.get(idx)?;
        Some(dir.join(marker.dir_name()).join(entry.file_name()))
    }

    pub fn has_marker(&self, idx: usize, marker: Marker) -> bool {
        self.marker_path(idx, marker).is_some_and(|p| p.exists())
    }

    fn touch_marker(&self, idx: usize, marker: Marker) -> Result<(), QueueError> {
        let Some(path) = self.marker_path(idx, marker) else {
            return Ok(());
        };
        if path.exists() {
            return Ok(());
        }
        File::create(&path)
            .map(|_| ())
            .map_err(|e| QueueError::io(&path, e))
    }

    pub fn read_input(&self, idx: usize) -> Result<Vec<u8>, QueueError> {
        let path = &self.entry(idx)?.path;
        fs::read(path).map_err(|e| QueueError::io(path, e))
    }

    /// Replaces the stored bytes of entry `idx` and updates its length.
    pub fn write_input(&mut self, idx: usize, data: &[u8]) -> Result<(), QueueError> {
        let entry = self.entry_mut(idx)?;
        fs::write(&entry.path, data).map_err(|e| QueueError::io(&entry.path, e))?;
        entry.len = data.len();
        Ok(())
    }

    pub fn favored_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.favored)
            .map(|(i, _)| i)
    }
}
