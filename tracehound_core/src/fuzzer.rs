use crate::bitmap::{MAP_SIZE, Novelty, has_new_bits};
use crate::config::{SyncSettings, TracehoundConfig};
use crate::control::RunControl;
use crate::executor::{Executor, ExecutorError, Outcome};
use crate::extras::ExtrasError;
use crate::mutator::MAX_FILE;
use crate::queue::{Marker, QueueError};
use crate::state::{EXEC_TIMEOUT, FuzzerState, OutputLayout};
use crate::stats::{JsonStatsSink, STATS_UPDATE_INTERVAL, StatsSink, StatsSnapshot};
use crate::sync::SyncError;
use log::{info, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Run-level failure. Anything surfacing here ends the session.
#[derive(Error, Debug)]
pub enum FuzzError {
    #[error("Output directory {0:?} already holds a queue; set `resume` to continue that session")]
    OutputInUse(PathBuf),
    #[error("No usable test cases in {0:?}")]
    NoInputs(PathBuf),
    #[error("Test case {path:?} is {len} bytes, over the {max} byte limit")]
    InputTooLarge { path: PathBuf, len: u64, max: usize },
    #[error("Bitmap seed {path:?} is {len} bytes, expected {expected}")]
    BadBitmap {
        path: PathBuf,
        len: usize,
        expected: usize,
    },
    #[error("Test case {0:?} does not crash the target, but crash mode is enabled")]
    SeedDoesNotCrash(PathBuf),
    #[error(
        "Test case {0:?} results in a timeout; raise the timeout or set skip-hangs-in-dry-run"
    )]
    SeedHangs(PathBuf),
    #[error("Test case {path:?} results in a crash{hint}")]
    SeedCrashes { path: PathBuf, hint: String },
    #[error("Unable to execute the target application")]
    TargetExecFailed,
    #[error("No instrumentation detected while running {0:?}")]
    NoInstrumentation(PathBuf),
    #[error("All {0} test cases time out or crash; nothing left to fuzz")]
    AllSeedsFailed(usize),
    #[error("I/O error on {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Extras(#[from] ExtrasError),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl FuzzError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        FuzzError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Drives one fuzzing session: setup, dry run, the queue-cycle loop and
/// shutdown, over any [`Executor`].
pub struct Fuzzer<E: Executor> {
    pub state: FuzzerState,
    pub(crate) executor: E,
    pub(crate) control: RunControl,
    pub(crate) sync: Option<SyncSettings>,
    pub(crate) sync_interval_cnt: u64,
    stats: Box<dyn StatsSink>,
    in_dir: PathBuf,
    last_stats: Instant,
}

impl<E: Executor> Fuzzer<E> {
    pub fn new(config: &TracehoundConfig, executor: E, control: RunControl) -> Self {
        let layout = OutputLayout::new(&config.output.out_dir);
        let mut state = FuzzerState::new(layout, config.fuzzer.clone(), config.scoring.clone());

        state.skip_hangs_in_dry_run = config.target.skip_hangs_in_dry_run;
        state.mem_limit_mb = config.target.mem_limit_mb;
        state.command_line = config.target.command.join(" ");
        if let Some(ms) = config.target.timeout_ms {
            state.exec_tmout = Duration::from_millis(ms);
            state.timeout_given = true;
        }
        state.hang_tmout = state.exec_tmout.max(EXEC_TIMEOUT);

        let stats = Box::new(JsonStatsSink::new(state.layout.stats_file()));
        Self {
            state,
            executor,
            control,
            sync: config.sync.clone(),
            sync_interval_cnt: 0,
            stats,
            in_dir: config.output.in_dir.clone(),
            last_stats: Instant::now(),
        }
    }

    pub fn with_stats_sink(mut self, sink: Box<dyn StatsSink>) -> Self {
        self.stats = sink;
        self
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Runs a whole session until the stop flag or the cycle limit.
    pub fn run(&mut self) -> Result<(), FuzzError> {
        self.setup()?;
        self.perform_dry_run()?;
        self.state.queue.cull(self.state.dumb_mode())?;
        self.tune_timeouts();
        self.update_stats(true)?;
        self.save_auto()?;

        let result = self.fuzz_loop();
        let finished = self.shutdown();
        result.and(finished)
    }

    /// Prepares the output directory and loads the initial queue, the
    /// dictionaries and the optional bitmap seed.
    pub fn setup(&mut self) -> Result<(), FuzzError> {
        let layout = self.state.layout.clone();
        let resume = self.state.settings.resume;
        let in_use = layout.queue_in_use();
        if in_use && !resume {
            return Err(FuzzError::OutputInUse(layout.root().to_path_buf()));
        }
        if in_use {
            for backup in layout
                .back_up_findings()
                .map_err(|e| FuzzError::io(layout.root(), e))?
            {
                info!("findings from the previous session moved to {backup:?}");
            }
            if !self.state.timeout_given {
                self.restore_timeout(&layout.stats_file());
            }
        }
        layout
            .create()
            .map_err(|e| FuzzError::io(layout.root(), e))?;

        if in_use {
            self.state.resuming = true;
            self.resume_queue()?;
        } else {
            self.read_testcases()?;
        }

        if let Some(dir) = self.state.settings.extras_dir.clone() {
            self.state.extras.load_user_dir(&dir)?;
        }
        if self.state.resuming {
            self.state
                .extras
                .load_auto(&layout.auto_extras_dir(), &mut self.state.rng)?;
        }
        if let Some(path) = self.state.settings.bitmap_seed.clone() {
            self.load_bitmap(&path)?;
        }
        Ok(())
    }

    /// Picks up the timeout the previous session settled on, if it left one.
    fn restore_timeout(&mut self, stats_file: &Path) {
        let ms = fs::read(stats_file)
            .ok()
            .and_then(|raw| serde_json::from_slice::<serde_json::Value>(&raw).ok())
            .and_then(|stats| stats.get("exec_timeout_ms")?.as_u64())
            .filter(|&ms| ms > 0);
        match ms {
            Some(ms) => {
                info!("resuming with the previous session's {ms} ms timeout");
                self.state.exec_tmout = Duration::from_millis(ms);
                self.state.hang_tmout = self.state.exec_tmout.max(EXEC_TIMEOUT);
                self.state.timeout_given = true;
            }
            None => warn!("no timeout recorded in {stats_file:?}, calibrating a new one"),
        }
    }

    fn read_testcases(&mut self) -> Result<(), FuzzError> {
        let in_dir = self.in_dir.clone();
        let queue_dir = self.state.layout.queue_dir();
        let det_done = in_dir
            .join(".state")
            .join(Marker::DeterministicDone.dir_name());

        for (name, path, len) in list_inputs(&in_dir)? {
            if len > MAX_FILE as u64 {
                return Err(FuzzError::InputTooLarge {
                    path,
                    len,
                    max: MAX_FILE,
                });
            }
            let dest = queue_dir.join(format!("id:{:06},orig:{name}", self.state.queue.len()));
            fs::copy(&path, &dest).map_err(|e| FuzzError::io(&dest, e))?;

            let passed_det = det_done.join(&name).exists();
            let idx = self.state.queue.add(dest, len as usize, passed_det, 0);
            if passed_det {
                self.state.queue.mark_det_done(idx)?;
            }
        }

        if self.state.queue.is_empty() {
            return Err(FuzzError::NoInputs(in_dir));
        }
        info!("loaded {} test cases from {:?}", self.state.queue.len(), in_dir);
        Ok(())
    }

    /// Adopts `queue/` of an interrupted session in place.
    fn resume_queue(&mut self) -> Result<(), FuzzError> {
        let queue_dir = self.state.layout.queue_dir();
        for (_, path, len) in list_inputs(&queue_dir)? {
            let idx = self.state.queue.add(path, len as usize, false, 0);
            if self.state.queue.has_marker(idx, Marker::DeterministicDone) {
                self.state.queue.entry_mut(idx)?.passed_det = true;
            }
        }
        if self.state.queue.is_empty() {
            return Err(FuzzError::NoInputs(queue_dir));
        }
        info!("resuming with {} queued entries", self.state.queue.len());
        Ok(())
    }

    fn load_bitmap(&mut self, path: &Path) -> Result<(), FuzzError> {
        let data = fs::read(path).map_err(|e| FuzzError::io(path, e))?;
        if data.len() != MAP_SIZE {
            return Err(FuzzError::BadBitmap {
                path: path.to_path_buf(),
                len: data.len(),
                expected: MAP_SIZE,
            });
        }
        self.state.virgin_bits.copy_from_slice(&data);
        self.state.bitmap_changed = true;
        info!("seeded coverage from {path:?}");
        Ok(())
    }

    fn fuzz_loop(&mut self) -> Result<(), FuzzError> {
        let mut prev_queued = 0;
        let mut new_cycle = true;

        loop {
            self.state.queue.cull(self.state.dumb_mode())?;

            if new_cycle {
                new_cycle = false;
                self.state.queue_cycle += 1;
                self.state.current_entry = 0;
                self.state.counters.cur_skipped_paths = 0;

                if self.state.queue.len() == prev_queued {
                    if self.state.use_splicing {
                        self.state.cycles_wo_finds += 1;
                    } else {
                        self.state.use_splicing = true;
                    }
                } else {
                    self.state.cycles_wo_finds = 0;
                }
                prev_queued = self.state.queue.len();

                if let Some(limit) = self.state.settings.cycle_limit {
                    if self.state.queue_cycle > limit {
                        info!("cycle limit of {limit} reached");
                        break;
                    }
                }
                info!(
                    "queue cycle {}: {} entries, {} favored",
                    self.state.queue_cycle,
                    self.state.queue.len(),
                    self.state.queue.queued_favored
                );
                self.update_stats(true)?;

                if self.state.queue_cycle == 1
                    && self.sync.as_ref().is_some_and(|s| s.import_first)
                {
                    self.sync_fuzzers()?;
                }
            }

            let skipped = self.fuzz_one()?;

            if !skipped && !self.control.should_stop() {
                if let Some(interval) = self.sync.as_ref().map(|s| s.interval) {
                    if self.sync_interval_cnt % interval == 0 {
                        self.sync_fuzzers()?;
                    }
                    self.sync_interval_cnt += 1;
                }
            }

            if self.control.should_stop() {
                info!("stop requested");
                break;
            }

            self.state.current_entry += 1;
            if self.state.current_entry >= self.state.queue.len() {
                new_cycle = true;
            }
        }
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), FuzzError> {
        self.write_bitmap()?;
        self.save_auto()?;
        self.update_stats(true)?;
        info!(
            "session over: {} execs, {} entries, {} unique crashes, {} unique hangs",
            self.state.counters.total_execs,
            self.state.queue.len(),
            self.state.counters.unique_crashes,
            self.state.counters.unique_hangs
        );
        Ok(())
    }

    /// Runs the target once and counts the execution.
    pub(crate) fn execute(&mut self, buf: &[u8], timeout: Duration) -> Result<Outcome, FuzzError> {
        self.state.counters.total_execs += 1;
        Ok(self.executor.run_target(buf, timeout)?)
    }

    /// Novelty of the last trace against the general virgin map.
    pub(crate) fn check_new_bits(&mut self) -> Novelty {
        let novelty = has_new_bits(self.executor.trace(), &mut self.state.virgin_bits);
        if novelty != Novelty::None {
            self.state.bitmap_changed = true;
        }
        novelty
    }

    pub(crate) fn stopping(&self) -> bool {
        self.control.should_stop()
    }

    /// Writes a stats snapshot, plus the bitmap and auto tokens, when forced
    /// or when the update interval has elapsed.
    pub(crate) fn update_stats(&mut self, force: bool) -> Result<(), FuzzError> {
        if !force && self.last_stats.elapsed() < STATS_UPDATE_INTERVAL {
            return Ok(());
        }
        self.last_stats = Instant::now();

        if let Err(e) = self.stats.record(&StatsSnapshot::capture(&self.state)) {
            warn!("failed to write stats: {e}");
        }
        if !force {
            self.write_bitmap()?;
            self.save_auto()?;
        }
        Ok(())
    }

    pub(crate) fn write_bitmap(&mut self) -> Result<(), FuzzError> {
        if !self.state.bitmap_changed {
            return Ok(());
        }
        self.state.bitmap_changed = false;
        let path = self.state.layout.bitmap_file();
        fs::write(&path, &self.state.virgin_bits[..]).map_err(|e| FuzzError::io(&path, e))
    }

    fn save_auto(&mut self) -> Result<(), FuzzError> {
        let dir = self.state.layout.auto_extras_dir();
        Ok(self.state.extras.save_auto(&dir)?)
    }
}

/// Non-empty regular files of `dir` not starting with a dot, sorted by name.
fn list_inputs(dir: &Path) -> Result<Vec<(String, PathBuf, u64)>, FuzzError> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| FuzzError::io(dir, e))? {
        let entry = entry.map_err(|e| FuzzError::io(dir, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let path = entry.path();
        let meta = fs::metadata(&path).map_err(|e| FuzzError::io(&path, e))?;
        if !meta.is_file() || meta.len() == 0 {
            continue;
        }
        found.push((name, path, meta.len()));
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(found)
}
