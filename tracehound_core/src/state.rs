use crate::bitmap::{Trace, new_virgin};
use crate::config::{FuzzerSettings, ScoreTuning};
use crate::executor::Outcome;
use crate::extras::Extras;
use crate::queue::{Marker, Queue};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Default per-run timeout, also the cap for auto-calibrated timeouts.
pub const EXEC_TIMEOUT: Duration = Duration::from_millis(1000);

/// Where everything lives under the output directory.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.root.join("queue")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.queue_dir().join(".state")
    }

    pub fn marker_dir(&self, marker: Marker) -> PathBuf {
        self.state_dir().join(marker.dir_name())
    }

    pub fn auto_extras_dir(&self) -> PathBuf {
        self.state_dir().join("auto_extras")
    }

    pub fn crashes_dir(&self) -> PathBuf {
        self.root.join("crashes")
    }

    pub fn hangs_dir(&self) -> PathBuf {
        self.root.join("hangs")
    }

    pub fn synced_dir(&self) -> PathBuf {
        self.root.join(".synced")
    }

    pub fn cur_input(&self) -> PathBuf {
        self.root.join(".cur_input")
    }

    pub fn bitmap_file(&self) -> PathBuf {
        self.root.join("fuzz_bitmap")
    }

    pub fn stats_file(&self) -> PathBuf {
        self.root.join("fuzzer_stats.json")
    }

    /// Whether `queue/` already holds entries from an earlier session.
    pub fn queue_in_use(&self) -> bool {
        fs::read_dir(self.queue_dir()).is_ok_and(|mut entries| {
            entries.any(|e| {
                e.is_ok_and(|e| !e.file_name().to_string_lossy().starts_with('.'))
            })
        })
    }

    /// Moves non-empty `crashes/` and `hangs/` aside to `<name>.<unix-secs>`
    /// so a resumed session numbers its findings from zero without
    /// clobbering the old ones. Returns where each backup went.
    pub fn back_up_findings(&self) -> io::Result<Vec<PathBuf>> {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        let mut moved = Vec::new();
        for dir in [self.crashes_dir(), self.hangs_dir()] {
            let has_files = fs::read_dir(&dir).is_ok_and(|mut entries| entries.next().is_some());
            if !has_files {
                continue;
            }
            let name = dir.file_name().map_or_else(String::new, |n| n.to_string_lossy().into_owned());
            let mut target = self.root.join(format!("{name}.{stamp}"));
            let mut n = 1;
            while target.exists() {
                target = self.root.join(format!("{name}.{stamp}.{n}"));
                n += 1;
            }
            fs::rename(&dir, &target)?;
            moved.push(target);
        }
        Ok(moved)
    }

    pub fn create(&self) -> io::Result<()> {
        for marker in [
            Marker::DeterministicDone,
            Marker::VariableBehavior,
            Marker::RedundantEdges,
        ] {
            fs::create_dir_all(self.marker_dir(marker))?;
        }
        fs::create_dir_all(self.auto_extras_dir())?;
        fs::create_dir_all(self.crashes_dir())?;
        fs::create_dir_all(self.hangs_dir())?;
        fs::create_dir_all(self.synced_dir())?;
        Ok(())
    }
}

/// Mutation stages, in the order a fuzzing round runs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Flip1,
    Flip2,
    Flip4,
    Flip8,
    Flip16,
    Flip32,
    Arith8,
    Arith16,
    Arith32,
    Int8,
    Int16,
    Int32,
    ExtrasUO,
    ExtrasUI,
    ExtrasAO,
    Havoc,
    Splice,
}

pub const STAGE_COUNT: usize = 17;

impl StageKind {
    pub const ALL: [StageKind; STAGE_COUNT] = [
        StageKind::Flip1,
        StageKind::Flip2,
        StageKind::Flip4,
        StageKind::Flip8,
        StageKind::Flip16,
        StageKind::Flip32,
        StageKind::Arith8,
        StageKind::Arith16,
        StageKind::Arith32,
        StageKind::Int8,
        StageKind::Int16,
        StageKind::Int32,
        StageKind::ExtrasUO,
        StageKind::ExtrasUI,
        StageKind::ExtrasAO,
        StageKind::Havoc,
        StageKind::Splice,
    ];

    /// Name used in provenance strings and stats.
    pub fn short_name(self) -> &'static str {
        match self {
            StageKind::Flip1 => "flip1",
            StageKind::Flip2 => "flip2",
            StageKind::Flip4 => "flip4",
            StageKind::Flip8 => "flip8",
            StageKind::Flip16 => "flip16",
            StageKind::Flip32 => "flip32",
            StageKind::Arith8 => "arith8",
            StageKind::Arith16 => "arith16",
            StageKind::Arith32 => "arith32",
            StageKind::Int8 => "int8",
            StageKind::Int16 => "int16",
            StageKind::Int32 => "int32",
            StageKind::ExtrasUO => "ext_UO",
            StageKind::ExtrasUI => "ext_UI",
            StageKind::ExtrasAO => "ext_AO",
            StageKind::Havoc => "havoc",
            StageKind::Splice => "splice",
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StageVal {
    #[default]
    None,
    Le(i64),
    Be(i64),
}

/// What the current candidate is, for naming whatever it turns up.
#[derive(Debug, Clone, Default)]
pub struct StageInfo {
    pub kind: Option<StageKind>,
    pub cur_byte: Option<usize>,
    pub val: StageVal,
    /// Havoc stacking depth of the current candidate.
    pub stack: u32,
    pub splicing_with: Option<usize>,
    /// Peer name and peer-side id while importing.
    pub syncing: Option<(String, u32)>,
    pub cur: u64,
    pub max: u64,
}

impl StageInfo {
    pub fn enter(&mut self, kind: StageKind, max: u64) {
        self.kind = Some(kind);
        self.cur_byte = None;
        self.val = StageVal::None;
        self.stack = 0;
        self.cur = 0;
        self.max = max;
    }

    /// Provenance string embedded in saved file names.
    pub fn describe(&self, current_entry: usize, new_cov: bool) -> String {
        let mut ret = match &self.syncing {
            Some((party, case)) => format!("sync:{party},src:{case:06}"),
            None => {
                let mut s = format!("src:{current_entry:06}");
                if let Some(other) = self.splicing_with {
                    s.push_str(&format!("+{other:06}"));
                }
                let op = self.kind.map_or("calibration", StageKind::short_name);
                s.push_str(&format!(",op:{op}"));
                match self.cur_byte {
                    Some(pos) => {
                        s.push_str(&format!(",pos:{pos}"));
                        match self.val {
                            StageVal::None => {}
                            StageVal::Le(v) => s.push_str(&format!(",val:{v:+}")),
                            StageVal::Be(v) => s.push_str(&format!(",val:be:{v:+}")),
                        }
                    }
                    None => s.push_str(&format!(",rep:{}", self.stack)),
                }
                s
            }
        };
        if new_cov {
            ret.push_str(",+cov");
        }
        ret
    }
}

/// Run-wide counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Counters {
    pub total_execs: u64,
    pub total_crashes: u64,
    pub unique_crashes: u64,
    pub total_hangs: u64,
    pub unique_hangs: u64,
    pub queued_discovered: u64,
    pub queued_imported: u64,
    pub cur_skipped_paths: u64,
    /// Consecutive hangs within the current entry's round.
    pub subseq_hangs: u32,
    pub total_cal_us: u64,
    pub total_cal_cycles: u64,
    pub total_bitmap_size: u64,
    pub total_bitmap_entries: u64,
    pub useless_at_start: u32,
    pub stage_finds: [u64; STAGE_COUNT],
    pub stage_cycles: [u64; STAGE_COUNT],
}

/// Everything the fuzzing loop mutates, in one place.
pub struct FuzzerState {
    pub layout: OutputLayout,
    pub queue: Queue,
    pub extras: Extras,
    pub rng: ChaCha8Rng,

    pub virgin_bits: Box<Trace>,
    pub virgin_hang: Box<Trace>,
    pub virgin_crash: Box<Trace>,
    /// The general virgin map changed since it was last written out.
    pub bitmap_changed: bool,

    pub settings: FuzzerSettings,
    pub tuning: ScoreTuning,
    pub skip_hangs_in_dry_run: bool,

    pub exec_tmout: Duration,
    /// Timeout used to confirm a suspected hang.
    pub hang_tmout: Duration,
    pub timeout_given: bool,
    pub havoc_div: u32,
    pub resuming: bool,

    pub counters: Counters,
    pub stage: StageInfo,
    pub current_entry: usize,
    pub queue_cycle: u64,
    pub cycles_wo_finds: u64,
    pub use_splicing: bool,
    pub cur_depth: u64,

    pub start_time: Instant,
    pub last_path_time: Option<Instant>,
    pub last_crash_time: Option<Instant>,
    pub last_hang_time: Option<Instant>,

    /// For the crash README.
    pub command_line: String,
    pub mem_limit_mb: u64,
}

impl FuzzerState {
    pub fn new(layout: OutputLayout, settings: FuzzerSettings, tuning: ScoreTuning) -> Self {
        let rng = match settings.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_rng(&mut rand::rng()),
        };
        let queue = Queue::new(Some(layout.state_dir()));

        Self {
            layout,
            queue,
            extras: Extras::new(),
            rng,
            virgin_bits: new_virgin(),
            virgin_hang: new_virgin(),
            virgin_crash: new_virgin(),
            bitmap_changed: true,
            settings,
            tuning,
            skip_hangs_in_dry_run: false,
            exec_tmout: EXEC_TIMEOUT,
            hang_tmout: EXEC_TIMEOUT,
            timeout_given: false,
            havoc_div: 1,
            resuming: false,
            counters: Counters::default(),
            stage: StageInfo::default(),
            current_entry: 0,
            queue_cycle: 0,
            cycles_wo_finds: 0,
            use_splicing: false,
            cur_depth: 0,
            start_time: Instant::now(),
            last_path_time: None,
            last_crash_time: None,
            last_hang_time: None,
            command_line: String::new(),
            mem_limit_mb: 0,
        }
    }

    /// The outcome a candidate must have to be considered for the queue.
    pub fn target_fault(&self) -> Outcome {
        if self.settings.crash_mode {
            Outcome::Crash
        } else {
            Outcome::None
        }
    }

    pub fn dumb_mode(&self) -> bool {
        self.settings.dumb_mode
    }

    pub fn avg_exec_us(&self) -> u64 {
        self.counters
            .total_cal_us
            .checked_div(self.counters.total_cal_cycles)
            .unwrap_or(0)
    }

    pub fn avg_bitmap_size(&self) -> u64 {
        self.counters
            .total_bitmap_size
            .checked_div(self.counters.total_bitmap_entries)
            .unwrap_or(0)
    }

    pub fn run_over10m(&self) -> bool {
        self.start_time.elapsed() > Duration::from_secs(600)
    }

    /// Finds so far, used to attribute discoveries to stages.
    pub fn hit_count(&self) -> u64 {
        self.queue.len() as u64 + self.counters.unique_crashes
    }
}
