pub mod bitmap;
pub mod calibrate;
pub mod config;
pub mod control;
pub mod executor;
pub mod extras;
pub mod forkserver;
pub mod fuzzer;
pub mod mutator;
pub mod queue;
pub mod score;
pub mod shmem;
pub mod stages;
pub mod state;
pub mod stats;
pub mod sync;
pub mod target;
pub mod triage;
pub mod watchdog;

pub use config::TracehoundConfig;
pub use control::{RunControl, install_skip_signal};
pub use executor::{Executor, ExecutorError, Outcome, TargetExecutor};
pub use extras::{Extra, Extras, ExtrasError};
pub use fuzzer::{FuzzError, Fuzzer};
pub use mutator::{Havoc, Mutator};
pub use queue::{Queue, QueueEntry, QueueError};
pub use state::{FuzzerState, OutputLayout};
pub use stats::{JsonStatsSink, NullStatsSink, StatsSink, StatsSnapshot};
pub use sync::SyncError;
pub use target::{InputChannel, TargetSpec};
