use tracehound_core::config::{ConfigInputDelivery, SyncSettings, TracehoundConfig};
use tracehound_core::watchdog::Canceller;
use tracehound_core::{Fuzzer, InputChannel, RunControl, TargetExecutor, TargetSpec};

use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Filled in once the executor exists; until then an interrupt only stops.
type CancelSlot = Arc<Mutex<Option<Canceller>>>;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Coverage-guided fuzzer for instrumented binaries", long_about = None)]
struct Cli {
    /// TOML configuration file; flags below override its values.
    #[clap(long, value_parser)]
    config: Option<PathBuf>,
    /// Directory with the initial test cases.
    #[clap(short = 'i', value_parser)]
    in_dir: Option<PathBuf>,
    /// Output directory for the queue, crashes and hangs.
    #[clap(short = 'o', value_parser)]
    out_dir: Option<PathBuf>,
    /// Execution timeout in milliseconds.
    #[clap(short = 't')]
    timeout_ms: Option<u64>,
    /// Memory limit for the target in megabytes, 0 for none.
    #[clap(short = 'm')]
    mem_limit_mb: Option<u64>,
    /// Run without instrumentation.
    #[clap(short = 'n')]
    dumb: bool,
    /// Crash exploration mode.
    #[clap(short = 'C')]
    crash_mode: bool,
    /// Skip the deterministic stages.
    #[clap(short = 'd')]
    skip_deterministic: bool,
    /// Directory of dictionary tokens.
    #[clap(short = 'x', value_parser)]
    extras_dir: Option<PathBuf>,
    /// Saved coverage bitmap to start from.
    #[clap(short = 'B', value_parser)]
    bitmap_seed: Option<PathBuf>,
    /// Run as the main instance of a synchronized group.
    #[clap(short = 'M', conflicts_with = "secondary")]
    main: Option<String>,
    /// Run as a secondary instance of a synchronized group.
    #[clap(short = 'S')]
    secondary: Option<String>,
    #[clap(long)]
    seed: Option<u64>,
    /// Stop after this many queue cycles.
    #[clap(long)]
    cycles: Option<u64>,
    /// Continue the session stored in the output directory.
    #[clap(long)]
    resume: bool,
    /// Target command line; `@@` is replaced by the input file path.
    #[clap(last = true)]
    target: Vec<String>,
}

fn load_config(path: Option<&PathBuf>) -> Result<TracehoundConfig, anyhow::Error> {
    match path {
        Some(config_path) => {
            info!("loading configuration from {config_path:?}");
            TracehoundConfig::load_from_file(config_path)
        }
        None => {
            let default_config_path = PathBuf::from("tracehound.toml");
            if default_config_path.exists() {
                info!("no config file given, loading {default_config_path:?}");
                TracehoundConfig::load_from_file(&default_config_path)
            } else {
                Ok(TracehoundConfig::default())
            }
        }
    }
}

fn apply_overrides(cli: Cli, config: &mut TracehoundConfig) {
    if let Some(dir) = cli.in_dir {
        config.output.in_dir = dir;
    }
    if let Some(dir) = cli.out_dir {
        config.output.out_dir = dir;
    }
    if cli.timeout_ms.is_some() {
        config.target.timeout_ms = cli.timeout_ms;
    }
    if let Some(mb) = cli.mem_limit_mb {
        config.target.mem_limit_mb = mb;
    }
    if cli.extras_dir.is_some() {
        config.fuzzer.extras_dir = cli.extras_dir;
    }
    if cli.bitmap_seed.is_some() {
        config.fuzzer.bitmap_seed = cli.bitmap_seed;
    }
    if cli.seed.is_some() {
        config.fuzzer.seed = cli.seed;
    }
    if cli.cycles.is_some() {
        config.fuzzer.cycle_limit = cli.cycles;
    }
    config.fuzzer.dumb_mode |= cli.dumb;
    config.fuzzer.crash_mode |= cli.crash_mode;
    config.fuzzer.skip_deterministic |= cli.skip_deterministic;
    config.fuzzer.resume |= cli.resume;
    if !cli.target.is_empty() {
        config.target.command = cli.target;
    }

    let sync_id = match (cli.main, cli.secondary) {
        (Some(id), _) => Some(id),
        (None, Some(id)) => {
            config.fuzzer.skip_deterministic = true;
            Some(id)
        }
        (None, None) => None,
    };
    if let Some(sync_id) = sync_id {
        let sync_dir = config.output.out_dir.clone();
        config.output.out_dir = sync_dir.join(&sync_id);
        let previous = config.sync.take();
        config.sync = Some(SyncSettings {
            sync_dir,
            sync_id,
            interval: previous
                .as_ref()
                .map_or_else(tracehound_core::config::default_sync_interval, |s| s.interval),
            import_first: previous.is_some_and(|s| s.import_first),
        });
    }
}

fn interrupt_handler(control: RunControl, slot: CancelSlot) -> impl FnMut() + Send + 'static {
    move || {
        control.request_stop();
        let canceller = slot.lock().ok().and_then(|guard| guard.clone());
        if let Some(canceller) = canceller {
            canceller.cancel();
        }
    }
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;
    apply_overrides(cli, &mut config);
    config.validate()?;

    let out_dir = config.output.out_dir.clone();
    std::fs::create_dir_all(&out_dir)
        .map_err(|e| anyhow::anyhow!("Failed to create output directory {:?}: {}", out_dir, e))?;

    let (input_path, file_delivery) = match &config.target.input_delivery {
        ConfigInputDelivery::File { path: Some(path) } => (path.clone(), true),
        ConfigInputDelivery::File { path: None } => (out_dir.join(".cur_input"), true),
        ConfigInputDelivery::Stdin => (out_dir.join(".cur_input"), false),
    };

    let mut spec = TargetSpec::from_command(
        &config.target.command,
        &input_path,
        config.target.mem_limit_mb,
        config.target.working_dir.clone(),
    )?;
    if file_delivery {
        spec.stdin_input = false;
    }

    let instrumented = !config.fuzzer.dumb_mode;
    if config.target.skip_bin_check {
        warn!("skipping the target binary check");
    } else {
        spec.check_binary(instrumented)?;
    }

    let input = InputChannel::create(&input_path)
        .map_err(|e| anyhow::anyhow!("Failed to create input file {:?}: {}", input_path, e))?;

    let control = RunControl::new();
    tracehound_core::install_skip_signal(&control)?;
    let cancel_slot = CancelSlot::default();
    ctrlc::set_handler(interrupt_handler(control.clone(), cancel_slot.clone()))?;

    // Fork server handshake uses the configured timeout or a generous default.
    let launch_timeout = Duration::from_millis(config.target.timeout_ms.unwrap_or(1000));
    let executor = TargetExecutor::launch(
        spec,
        input,
        instrumented,
        config.target.fork_server,
        launch_timeout,
        control.stop_flag(),
    )?;
    if let Ok(mut slot) = cancel_slot.lock() {
        *slot = Some(executor.canceller());
    }
    if control.should_stop() {
        info!("interrupted while starting the target");
        return Ok(());
    }

    info!("fuzzing {:?}, output in {:?}", config.target.command, out_dir);
    let mut fuzzer = Fuzzer::new(&config, executor, control);
    fuzzer.run()?;
    Ok(())
}
