use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigInputDelivery {
    #[default]
    Stdin,
    File {
        #[serde(default)]
        path: Option<PathBuf>,
    },
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetSettings {
    pub command: Vec<String>,
    #[serde(default)]
    pub input_delivery: ConfigInputDelivery,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub skip_hangs_in_dry_run: bool,
    #[serde(default = "default_mem_limit_mb")]
    pub mem_limit_mb: u64,
    #[serde(default = "default_true")]
    pub fork_server: bool,
    #[serde(default)]
    pub skip_bin_check: bool,
    pub working_dir: Option<PathBuf>,
}

fn default_mem_limit_mb() -> u64 {
    50
}

fn default_true() -> bool {
    true
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            input_delivery: ConfigInputDelivery::default(),
            timeout_ms: None,
            skip_hangs_in_dry_run: false,
            mem_limit_mb: default_mem_limit_mb(),
            fork_server: true,
            skip_bin_check: false,
            working_dir: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default)]
    pub skip_deterministic: bool,
    #[serde(default)]
    pub dumb_mode: bool,
    #[serde(default)]
    pub crash_mode: bool,
    #[serde(default)]
    pub skip_crashes: bool,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_hang_limit")]
    pub hang_limit: u32,
    #[serde(default = "default_keep_unique_hangs")]
    pub keep_unique_hangs: u64,
    #[serde(default = "default_keep_unique_crashes")]
    pub keep_unique_crashes: u64,
    #[serde(default)]
    pub cycle_limit: Option<u64>,
    #[serde(default)]
    pub extras_dir: Option<PathBuf>,
    #[serde(default)]
    pub bitmap_seed: Option<PathBuf>,
    #[serde(default)]
    pub resume: bool,
}

pub fn default_hang_limit() -> u32 {
    250
}
pub fn default_keep_unique_hangs() -> u64 {
    500
}
pub fn default_keep_unique_crashes() -> u64 {
    5000
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            skip_deterministic: false,
            dumb_mode: false,
            crash_mode: false,
            skip_crashes: false,
            seed: None,
            hang_limit: default_hang_limit(),
            keep_unique_hangs: default_keep_unique_hangs(),
            keep_unique_crashes: default_keep_unique_crashes(),
            cycle_limit: None,
            extras_dir: None,
            bitmap_seed: None,
            resume: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct OutputSettings {
    pub in_dir: PathBuf,
    pub out_dir: PathBuf,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SyncSettings {
    pub sync_dir: PathBuf,
    pub sync_id: String,
    #[serde(default = "default_sync_interval")]
    pub interval: u64,
    #[serde(default)]
    pub import_first: bool,
}

pub fn default_sync_interval() -> u64 {
    5
}

/// Thresholds of the performance score.
///
/// The values are empirical. Ratios compare an entry against the running
/// averages; `*_boost` and `*_cut` fields are the resulting multipliers.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields, default)]
pub struct ScoreTuning {
    /// Slow-side exec time ratios paired with the absolute score they force,
    /// checked from slowest to least slow.
    pub slow_bands: Vec<(f64, u32)>,
    /// Fast-side divisors paired with the absolute score they force,
    /// checked from fastest to least fast.
    pub fast_bands: Vec<(f64, u32)>,
    /// Coverage ratios that boost an entry with a larger-than-average map.
    pub wide_bands: Vec<(f64, f64)>,
    /// Coverage divisors that cut an entry with a smaller-than-average map.
    pub narrow_bands: Vec<(f64, f64)>,
    /// Upper bounds (inclusive) of depth bands and their multiplier.
    pub depth_bands: Vec<(u32, u32)>,
    pub deepest_mult: u32,
    pub handicap_big_mult: u32,
    pub handicap_small_mult: u32,
    pub max_mult: u32,
}

impl Default for ScoreTuning {
    fn default() -> Self {
        Self {
            slow_bands: vec![(0.1, 10), (0.25, 25), (0.5, 50), (0.75, 75)],
            fast_bands: vec![(4.0, 300), (3.0, 200), (2.0, 150)],
            wide_bands: vec![(0.3, 3.0), (0.5, 2.0), (0.75, 1.5)],
            narrow_bands: vec![(3.0, 0.25), (2.0, 0.5), (1.5, 0.75)],
            depth_bands: vec![(3, 1), (7, 2), (13, 4), (25, 6)],
            deepest_mult: 8,
            handicap_big_mult: 4,
            handicap_small_mult: 2,
            max_mult: 16,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TracehoundConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    pub target: TargetSettings,
    pub output: OutputSettings,
    #[serde(default)]
    pub sync: Option<SyncSettings>,
    #[serde(default)]
    pub scoring: ScoreTuning,
}

impl TracehoundConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: TracehoundConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.target.command.is_empty() {
            anyhow::bail!("target command is empty");
        }
        if self.output.in_dir.as_os_str().is_empty() || self.output.out_dir.as_os_str().is_empty() {
            anyhow::bail!("both an input and an output directory are required");
        }
        if self.output.in_dir == self.output.out_dir {
            anyhow::bail!("input and output directories must differ");
        }
        if self.scoring.max_mult == 0 {
            anyhow::bail!("scoring.max-mult must be at least 1");
        }
        if self.target.timeout_ms == Some(0) {
            anyhow::bail!("target.timeout-ms must be positive");
        }
        if let Some(sync) = &self.sync {
            if sync.sync_id.is_empty() || sync.sync_id.contains('/') {
                anyhow::bail!("sync id {:?} is not a valid directory name", sync.sync_id);
            }
            if sync.interval == 0 {
                anyhow::bail!("sync.interval must be at least 1");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [target]
        command = ["./app", "@@"]

        [output]
        in-dir = "seeds"
        out-dir = "findings"
    "#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: TracehoundConfig = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.target.mem_limit_mb, 50);
        assert!(config.target.fork_server);
        assert_eq!(config.target.timeout_ms, None);
        assert_eq!(config.target.input_delivery, ConfigInputDelivery::Stdin);
        assert_eq!(config.fuzzer.hang_limit, 250);
        assert_eq!(config.scoring, ScoreTuning::default());
        assert!(config.sync.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn full_config_parses() {
        let text = r#"
            [fuzzer]
            skip-deterministic = true
            crash-mode = true
            seed = 42
            cycle-limit = 3

            [target]
            command = ["./app"]
            input-delivery = { file = { path = "/tmp/cur" } }
            timeout-ms = 200
            mem-limit-mb = 0
            fork-server = false

            [output]
            in-dir = "in"
            out-dir = "out"

            [sync]
            sync-dir = "sync"
            sync-id = "worker1"

            [scoring]
            max-mult = 8
        "#;
        let config: TracehoundConfig = toml::from_str(text).unwrap();
        assert!(config.fuzzer.skip_deterministic);
        assert_eq!(config.fuzzer.seed, Some(42));
        assert_eq!(
            config.target.input_delivery,
            ConfigInputDelivery::File {
                path: Some(PathBuf::from("/tmp/cur"))
            }
        );
        assert_eq!(config.sync.as_ref().unwrap().interval, 5);
        assert_eq!(config.scoring.max_mult, 8);
        assert_eq!(config.scoring.deepest_mult, 8);
        config.validate().unwrap();
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let text = format!("{MINIMAL}\nbogus = 1\n");
        assert!(toml::from_str::<TracehoundConfig>(&text).is_err());
    }

    #[test]
    fn validate_rejects_same_in_and_out_dir() {
        let mut config: TracehoundConfig = toml::from_str(MINIMAL).unwrap();
        config.output.out_dir = config.output.in_dir.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_from_file_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = TracehoundConfig::load_from_file(&dir.path().join("nope.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
