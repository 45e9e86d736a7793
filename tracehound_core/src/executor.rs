use crate::bitmap::{Trace, classify_counts};
use crate::forkserver::{ForkServer, configure_child};
use crate::shmem::{SHM_ENV_VAR, SharedTrace, ShmemError, barrier};
use crate::target::{InputChannel, MSAN_ERROR, TargetSpec};
use crate::watchdog::{Canceller, Watchdog};
use log::debug;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Value a wrapper may leave in the first trace word when `exec` failed.
pub const EXEC_FAIL_SIG: u32 = 0xfee1_dead;

/// Classification of one execution, as seen by the rest of the fuzzer.
///
/// `NoInstrumentation` and `NoNewBits` are only produced by calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    None,
    Hang,
    Crash,
    Error,
    NoInstrumentation,
    NoNewBits,
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Exited(i32),
    Signaled(i32),
    ExecFailed,
}

impl ExitKind {
    pub fn from_wait_status(status: i32) -> Self {
        if libc::WIFSIGNALED(status) {
            ExitKind::Signaled(libc::WTERMSIG(status))
        } else {
            ExitKind::Exited(libc::WEXITSTATUS(status))
        }
    }
}

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("I/O error while driving the target: {0}")]
    Io(#[from] io::Error),
    #[error("failed to launch {program:?}: {source}")]
    Spawn { program: PathBuf, source: io::Error },
    #[error("timeout while initializing the fork server (waited {0:?})")]
    HandshakeTimeout(Duration),
    #[error("{0}")]
    ForkServerStartup(String),
    #[error("lost contact with the fork server: {0}")]
    ForkServerLost(String),
    #[error("bad target binary: {0}")]
    BadBinary(String),
    #[error(transparent)]
    Shmem(#[from] ShmemError),
}

/// A child obtained from a supervisor, waiting to be reaped.
#[derive(Debug)]
pub struct RunHandle {
    pid: i32,
    child: Option<Child>,
}

impl RunHandle {
    pub fn forked(pid: i32) -> Self {
        Self { pid, child: None }
    }

    fn spawned(child: Child) -> Self {
        Self {
            pid: child.id() as i32,
            child: Some(child),
        }
    }

    fn failed() -> Self {
        Self { pid: 0, child: None }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }
}

/// Source of child processes for the target.
pub trait ProcessSupervisor {
    /// Starts any long-lived helper. A no-op for per-run spawning.
    fn start_persistent(&mut self) -> Result<(), ExecutorError>;
    /// Launches one run over the input already written to the channel.
    fn request_run(&mut self, prev_timed_out: bool) -> Result<RunHandle, ExecutorError>;
    /// Blocks until the child from `handle` is gone.
    fn await_result(&mut self, handle: &mut RunHandle) -> Result<ExitKind, ExecutorError>;
    fn kill(&mut self, handle: &RunHandle);
    fn is_persistent(&self) -> bool;
}

/// Spawns a fresh process for every run.
pub struct DirectSupervisor {
    spec: TargetSpec,
    stdin: Option<File>,
}

impl DirectSupervisor {
    pub fn new(spec: TargetSpec, input: &InputChannel) -> io::Result<Self> {
        let stdin = if spec.stdin_input {
            Some(input.stdin_handle()?)
        } else {
            None
        };
        Ok(Self { spec, stdin })
    }
}

impl ProcessSupervisor for DirectSupervisor {
    fn start_persistent(&mut self) -> Result<(), ExecutorError> {
        Ok(())
    }

    fn request_run(&mut self, _prev_timed_out: bool) -> Result<RunHandle, ExecutorError> {
        let mut cmd = Command::new(&self.spec.program);
        configure_child(&mut cmd, &self.spec);
        match &self.stdin {
            Some(file) => cmd.stdin(Stdio::from(file.try_clone()?)),
            None => cmd.stdin(Stdio::null()),
        };

        match cmd.spawn() {
            Ok(child) => Ok(RunHandle::spawned(child)),
            Err(e) => {
                debug!("failed to spawn {:?}: {e}", self.spec.program);
                Ok(RunHandle::failed())
            }
        }
    }

    fn await_result(&mut self, handle: &mut RunHandle) -> Result<ExitKind, ExecutorError> {
        let Some(mut child) = handle.child.take() else {
            return Ok(ExitKind::ExecFailed);
        };
        let status = child.wait()?;
        use std::os::unix::process::ExitStatusExt;
        Ok(match (status.code(), status.signal()) {
            (_, Some(sig)) => ExitKind::Signaled(sig),
            (Some(code), None) => ExitKind::Exited(code),
            (None, None) => ExitKind::Exited(0),
        })
    }

    fn kill(&mut self, handle: &RunHandle) {
        if handle.pid() > 0 {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(handle.pid()),
                nix::sys::signal::Signal::SIGKILL,
            );
        }
    }

    fn is_persistent(&self) -> bool {
        false
    }
}

/// What the fuzzing stages need from an execution backend.
pub trait Executor {
    /// Writes `input`, runs the target once and returns the bucketed result.
    fn run_target(&mut self, input: &[u8], timeout: Duration) -> Result<Outcome, ExecutorError>;
    fn trace(&self) -> &Trace;
    fn trace_mut(&mut self) -> &mut Trace;
    /// Signal that killed the last crashing run, 0 when it exited.
    fn kill_signal(&self) -> i32;
}

/// Shared memory + input channel + supervisor + timer, wired together.
pub struct TargetExecutor {
    shm: SharedTrace,
    input: InputChannel,
    supervisor: Box<dyn ProcessSupervisor>,
    watchdog: Watchdog,
    stop: Arc<AtomicBool>,
    persistent: bool,
    uses_asan: bool,
    prev_timed_out: bool,
    kill_signal: i32,
}

impl TargetExecutor {
    /// Sets up shared memory and picks the supervision mode. The fork server,
    /// when requested, is started immediately.
    pub fn launch(
        mut spec: TargetSpec,
        input: InputChannel,
        instrumented: bool,
        fork_server: bool,
        exec_timeout: Duration,
        stop: Arc<AtomicBool>,
    ) -> Result<Self, ExecutorError> {
        let shm = SharedTrace::new()?;
        if instrumented {
            spec.set_env(SHM_ENV_VAR, &shm.id_string());
        }
        let uses_asan = spec.traits.uses_asan;

        let mut supervisor: Box<dyn ProcessSupervisor> = if fork_server {
            Box::new(ForkServer::new(spec, &input, exec_timeout)?)
        } else {
            Box::new(DirectSupervisor::new(spec, &input)?)
        };
        supervisor.start_persistent()?;
        let persistent = supervisor.is_persistent();

        Ok(Self {
            shm,
            input,
            supervisor,
            watchdog: Watchdog::spawn()?,
            stop,
            persistent,
            uses_asan,
            prev_timed_out: false,
            kill_signal: 0,
        })
    }

    /// Handle for the stop path to kill an in-flight child.
    pub fn canceller(&self) -> Canceller {
        self.watchdog.canceller()
    }

    fn classify(&mut self, exit: ExitKind, timed_out: bool, first_word: u32) -> Outcome {
        let stopping = self.stop.load(Ordering::Relaxed);
        match exit {
            ExitKind::Signaled(sig) if !stopping => {
                self.kill_signal = sig;
                if timed_out && sig == libc::SIGKILL {
                    Outcome::Hang
                } else {
                    Outcome::Crash
                }
            }
            ExitKind::Exited(code) if self.uses_asan && code == MSAN_ERROR => {
                self.kill_signal = 0;
                Outcome::Crash
            }
            ExitKind::ExecFailed => Outcome::Error,
            _ if !self.persistent && first_word == EXEC_FAIL_SIG => Outcome::Error,
            _ => Outcome::None,
        }
    }
}

impl Executor for TargetExecutor {
    fn run_target(&mut self, input: &[u8], timeout: Duration) -> Result<Outcome, ExecutorError> {
        self.input.write_input(input)?;
        self.shm.clear();

        let mut handle = self.supervisor.request_run(self.prev_timed_out)?;
        self.watchdog.arm(handle.pid(), timeout);
        let exit = match self.supervisor.await_result(&mut handle) {
            Ok(exit) => exit,
            Err(e) => {
                self.watchdog.disarm();
                self.supervisor.kill(&handle);
                return Err(e);
            }
        };
        let timed_out = self.watchdog.disarm();
        self.prev_timed_out = timed_out;

        barrier();
        let t = self.shm.trace();
        let first_word = u32::from_ne_bytes([t[0], t[1], t[2], t[3]]);
        classify_counts(self.shm.trace_mut());

        Ok(self.classify(exit, timed_out, first_word))
    }

    fn trace(&self) -> &Trace {
        self.shm.trace()
    }

    fn trace_mut(&mut self) -> &mut Trace {
        self.shm.trace_mut()
    }

    fn kill_signal(&self) -> i32 {
        self.kill_signal
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use crate::bitmap::{MAP_SIZE, new_trace};

    type TraceFn = Box<dyn FnMut(&[u8], &mut Trace) -> Outcome>;

    /// Deterministic in-process stand-in for a target: a closure fills the
    /// trace from the input bytes and picks the outcome.
    pub struct MockExecutor {
        trace: Box<Trace>,
        behavior: TraceFn,
        pub runs: usize,
        pub kill_signal: i32,
    }

    impl MockExecutor {
        pub fn new(behavior: impl FnMut(&[u8], &mut Trace) -> Outcome + 'static) -> Self {
            Self {
                trace: new_trace(),
                behavior: Box::new(behavior),
                runs: 0,
                kill_signal: 11,
            }
        }

        /// Every distinct byte value at every position lights one tuple;
        /// a leading `!` crashes, a leading `~` hangs.
        pub fn byte_edges() -> Self {
            Self::new(|input, trace| {
                for (i, &b) in input.iter().enumerate().take(256) {
                    let slot = &mut trace[(i * 251 + b as usize) % MAP_SIZE];
                    *slot = slot.saturating_add(1);
                }
                match input.first() {
                    Some(b'!') => Outcome::Crash,
                    Some(b'~') => Outcome::Hang,
                    _ => Outcome::None,
                }
            })
        }
    }

    impl Executor for MockExecutor {
        fn run_target(&mut self, input: &[u8], _timeout: Duration) -> Result<Outcome, ExecutorError> {
            self.runs += 1;
            self.trace.fill(0);
            let outcome = (self.behavior)(input, &mut self.trace);
            classify_counts(&mut self.trace);
            Ok(outcome)
        }

        fn trace(&self) -> &Trace {
            &self.trace
        }

        fn trace_mut(&mut self) -> &mut Trace {
            &mut self.trace
        }

        fn kill_signal(&self) -> i32 {
            self.kill_signal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_executor(script: &str, dir: &std::path::Path) -> TargetExecutor {
        let input = InputChannel::create(&dir.join(".cur_input")).unwrap();
        let cmd: Vec<String> = ["/bin/sh", "-c", script]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let spec = TargetSpec::from_command(&cmd, input.path(), 0, None).unwrap();
        TargetExecutor::launch(
            spec,
            input,
            false,
            false,
            Duration::from_secs(1),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap()
    }

    #[test]
    fn clean_exit_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut exec = shell_executor("cat > /dev/null; exit 0", dir.path());
        let outcome = exec.run_target(b"hello", Duration::from_secs(2)).unwrap();
        assert_eq!(outcome, Outcome::None);
    }

    #[test]
    fn fatal_signal_is_crash() {
        let dir = tempfile::tempdir().unwrap();
        let mut exec = shell_executor("kill -SEGV $$", dir.path());
        let outcome = exec.run_target(b"", Duration::from_secs(2)).unwrap();
        assert_eq!(outcome, Outcome::Crash);
        assert_eq!(exec.kill_signal(), libc::SIGSEGV);
    }

    #[test]
    fn overstaying_child_is_hang_not_crash() {
        let dir = tempfile::tempdir().unwrap();
        let mut exec = shell_executor("sleep 5", dir.path());
        let outcome = exec.run_target(b"", Duration::from_millis(100)).unwrap();
        assert_eq!(outcome, Outcome::Hang);
    }

    #[test]
    fn stdin_receives_the_written_input() {
        let dir = tempfile::tempdir().unwrap();
        let mut exec = shell_executor("read line; [ \"$line\" = BAD ] && kill -ABRT $$; exit 0", dir.path());
        assert_eq!(exec.run_target(b"GOOD\n", Duration::from_secs(2)).unwrap(), Outcome::None);
        assert_eq!(exec.run_target(b"BAD\n", Duration::from_secs(2)).unwrap(), Outcome::Crash);
        assert_eq!(exec.kill_signal(), libc::SIGABRT);
    }

    #[test]
    fn missing_program_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = InputChannel::create(&dir.path().join(".cur_input")).unwrap();
        let cmd = vec!["/nonexistent/definitely_not_here".to_string()];
        let spec = TargetSpec::from_command(&cmd, input.path(), 0, None).unwrap();
        let mut exec = TargetExecutor::launch(
            spec,
            input,
            false,
            false,
            Duration::from_secs(1),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        assert_eq!(exec.run_target(b"x", Duration::from_secs(1)).unwrap(), Outcome::Error);
    }

    #[test]
    fn wait_status_decoding() {
        assert_eq!(ExitKind::from_wait_status(0), ExitKind::Exited(0));
        assert_eq!(ExitKind::from_wait_status(3 << 8), ExitKind::Exited(3));
        assert_eq!(ExitKind::from_wait_status(libc::SIGSEGV), ExitKind::Signaled(libc::SIGSEGV));
    }
}
