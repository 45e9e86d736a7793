use crate::executor::ExecutorError;
use log::{info, warn};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

pub const FILE_PLACEHOLDER: &str = "@@";

const PERSIST_SIG: &[u8] = b"##SIG_AFL_PERSISTENT##";
const DEFER_SIG: &[u8] = b"##SIG_AFL_DEFER_FORKSRV##";
const ELF_MAGIC: &[u8] = b"\x7fELF";

pub const ASAN_OPTIONS: &str =
    "abort_on_error=1:detect_leaks=0:symbolize=0:allocator_may_return_null=1";
pub const MSAN_OPTIONS: &str = "exit_code=86:symbolize=0:abort_on_error=1:\
allocator_may_return_null=1:msan_track_origins=0";
pub const MSAN_ERROR: i32 = 86;

/// Properties detected by scanning the target binary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BinaryTraits {
    pub instrumented: bool,
    pub persistent: bool,
    pub deferred: bool,
    pub uses_asan: bool,
}

/// Everything needed to launch the target.
#[derive(Debug, Clone)]
pub struct TargetSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub mem_limit_mb: u64,
    pub working_dir: Option<PathBuf>,
    pub stdin_input: bool,
    pub traits: BinaryTraits,
}

impl TargetSpec {
    /// Builds a spec from a raw command line, substituting the input path for
    /// every `@@`. Without a placeholder the target reads stdin.
    pub fn from_command(
        command: &[String],
        input_path: &Path,
        mem_limit_mb: u64,
        working_dir: Option<PathBuf>,
    ) -> Result<Self, ExecutorError> {
        let (program, rest) = command
            .split_first()
            .ok_or_else(|| ExecutorError::BadBinary("empty target command".into()))?;

        let path_str = input_path.to_string_lossy();
        let mut uses_file = false;
        let args = rest
            .iter()
            .map(|arg| {
                if arg.contains(FILE_PLACEHOLDER) {
                    uses_file = true;
                    arg.replace(FILE_PLACEHOLDER, &path_str)
                } else {
                    arg.clone()
                }
            })
            .collect();

        Ok(Self {
            program: PathBuf::from(program),
            args,
            env: vec![
                ("ASAN_OPTIONS".into(), ASAN_OPTIONS.into()),
                ("MSAN_OPTIONS".into(), MSAN_OPTIONS.into()),
            ],
            mem_limit_mb,
            working_dir,
            stdin_input: !uses_file,
            traits: BinaryTraits::default(),
        })
    }

    pub fn set_env(&mut self, key: &str, value: &str) {
        self.env.retain(|(k, _)| k != key);
        self.env.push((key.to_string(), value.to_string()));
    }

    /// Resolves the program through `PATH` when it has no slash and checks
    /// that it is a plausible, optionally instrumented executable.
    pub fn check_binary(&mut self, instrumented: bool) -> Result<BinaryTraits, ExecutorError> {
        let resolved = resolve_program(&self.program)?;
        let meta = std::fs::metadata(&resolved)?;
        if !meta.is_file() || meta.permissions().mode() & 0o111 == 0 || meta.len() < 4 {
            return Err(ExecutorError::BadBinary(format!(
                "program '{}' is not an executable file",
                resolved.display()
            )));
        }

        let data = std::fs::read(&resolved)?;
        let traits = scan_binary(&data, instrumented)
            .map_err(|msg| ExecutorError::BadBinary(format!("{}: {msg}", resolved.display())))?;

        if traits.persistent {
            info!("persistent mode binary detected");
            self.set_env("AFL_PERSISTENT", "1");
        }
        if traits.deferred {
            info!("deferred fork server binary detected");
            self.set_env("__AFL_DEFER_FORKSRV", "1");
        }

        self.program = resolved;
        self.traits = traits;
        Ok(traits)
    }
}

fn resolve_program(program: &Path) -> Result<PathBuf, ExecutorError> {
    if program.components().count() > 1 || program.is_absolute() {
        return Ok(program.to_path_buf());
    }
    let paths = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| {
            ExecutorError::BadBinary(format!(
                "program '{}' not found or not executable",
                program.display()
            ))
        })
}

pub fn scan_binary(data: &[u8], instrumented: bool) -> Result<BinaryTraits, String> {
    if data.starts_with(b"#!") {
        return Err("target looks like a shell script; point the fuzzer at the real binary".into());
    }
    if !data.starts_with(ELF_MAGIC) {
        return Err("program is not an ELF binary".into());
    }

    let traits = BinaryTraits {
        instrumented: contains(data, crate::shmem::SHM_ENV_VAR.as_bytes()),
        persistent: contains(data, PERSIST_SIG),
        deferred: contains(data, DEFER_SIG),
        uses_asan: contains(data, b"libasan.so") || contains(data, b"__msan_init"),
    };

    if instrumented && !traits.instrumented {
        return Err("binary is not instrumented; rebuild it or enable dumb mode".into());
    }
    if !instrumented && traits.instrumented {
        warn!("binary is instrumented but dumb mode is enabled");
    }
    Ok(traits)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// The reusable file every test case is written to before a run.
///
/// The same handle doubles as the target's stdin, so it is rewound after
/// each write.
#[derive(Debug)]
pub struct InputChannel {
    path: PathBuf,
    file: File,
}

impl InputChannel {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_input(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(data)?;
        self.file.set_len(data.len() as u64)?;
        self.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    pub fn stdin_handle(&self) -> std::io::Result<File> {
        self.file.try_clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_is_replaced_in_every_argument() {
        let cmd: Vec<String> = ["./app", "-i", "@@", "--in=@@"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let spec = TargetSpec::from_command(&cmd, Path::new("/tmp/x/.cur"), 50, None).unwrap();
        assert_eq!(spec.args, vec!["-i", "/tmp/x/.cur", "--in=/tmp/x/.cur"]);
        assert!(!spec.stdin_input);
    }

    #[test]
    fn no_placeholder_means_stdin() {
        let cmd = vec!["./app".to_string()];
        let spec = TargetSpec::from_command(&cmd, Path::new("/tmp/cur"), 0, None).unwrap();
        assert!(spec.stdin_input);
        assert!(spec.env.iter().any(|(k, _)| k == "ASAN_OPTIONS"));
    }

    #[test]
    fn scan_rejects_scripts_and_non_elf() {
        assert!(scan_binary(b"#!/bin/sh\necho", false).is_err());
        assert!(scan_binary(b"MZ\x90\x00", false).is_err());
    }

    #[test]
    fn scan_detects_markers() {
        let mut blob = b"\x7fELF....".to_vec();
        blob.extend_from_slice(b"__AFL_SHM_ID\0##SIG_AFL_PERSISTENT##\0libasan.so");
        let traits = scan_binary(&blob, true).unwrap();
        assert!(traits.instrumented);
        assert!(traits.persistent);
        assert!(!traits.deferred);
        assert!(traits.uses_asan);
    }

    #[test]
    fn scan_requires_instrumentation_unless_dumb() {
        let blob = b"\x7fELF plain binary".to_vec();
        assert!(scan_binary(&blob, true).is_err());
        assert!(scan_binary(&blob, false).is_ok());
    }

    #[test]
    fn system_shell_passes_dumb_mode_check() {
        let mut spec = TargetSpec::from_command(
            &["sh".to_string()],
            Path::new("/tmp/unused"),
            0,
            None,
        )
        .unwrap();
        let traits = spec.check_binary(false);
        // Some systems ship sh as a script wrapper; only check resolution.
        if let Ok(traits) = traits {
            assert!(!traits.persistent);
            assert!(spec.program.is_absolute());
        }
    }

    #[test]
    fn input_channel_truncates_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let mut chan = InputChannel::create(&dir.path().join(".cur_input")).unwrap();
        chan.write_input(b"longer input").unwrap();
        chan.write_input(b"short").unwrap();
        assert_eq!(std::fs::read(chan.path()).unwrap(), b"short");
    }
}
