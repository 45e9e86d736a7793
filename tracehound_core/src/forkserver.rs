//! Persistent fork server supervision.
//!
//! The instrumented target stops right before `main` and waits on
//! [`FORKSRV_FD`] for a 4-byte request; for each one it forks a worker,
//! replies with the worker pid on `FORKSRV_FD + 1`, and later sends the
//! worker's wait status over the same pipe.

use crate::executor::{ExecutorError, ExitKind, ProcessSupervisor, RunHandle};
use crate::target::{InputChannel, TargetSpec};
use log::{debug, info};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

pub const FORKSRV_FD: RawFd = 198;

/// Multiplier applied to the run timeout while waiting for the handshake.
pub const FORK_WAIT_MULT: u32 = 10;

pub struct ForkServer {
    spec: TargetSpec,
    stdin: Option<File>,
    handshake_timeout: Duration,
    child: Option<Child>,
    ctl: Option<File>,
    st: Option<File>,
}

impl ForkServer {
    pub fn new(spec: TargetSpec, input: &InputChannel, exec_timeout: Duration) -> io::Result<Self> {
        let stdin = if spec.stdin_input {
            Some(input.stdin_handle()?)
        } else {
            None
        };
        Ok(Self {
            spec,
            stdin,
            handshake_timeout: exec_timeout * FORK_WAIT_MULT,
            child: None,
            ctl: None,
            st: None,
        })
    }

    fn read_i32(&mut self) -> io::Result<i32> {
        let st = self
            .st
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "fork server not started"))?;
        let mut buf = [0u8; 4];
        st.read_exact(&mut buf)?;
        Ok(i32::from_ne_bytes(buf))
    }

    fn write_u32(&mut self, value: u32) -> io::Result<()> {
        let ctl = self
            .ctl
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "fork server not started"))?;
        ctl.write_all(&value.to_ne_bytes())
    }

    /// Explains why the server died before saying hello.
    fn diagnose_startup(&mut self) -> String {
        let traits = self.spec.traits;
        let mem = self.spec.mem_limit_mb;
        let status = self.child.as_mut().and_then(|c| c.wait().ok());

        match status.and_then(|s| s.signal()) {
            Some(sig) if traits.uses_asan && mem > 0 => format!(
                "fork server crashed with signal {sig}; ASAN binaries need a much larger \
                 address space than the {mem} MB memory limit allows, disable the limit"
            ),
            Some(sig) if mem > 0 => format!(
                "fork server crashed with signal {sig}; the target may be broken, or the \
                 {mem} MB memory limit may be too low for it to start"
            ),
            Some(sig) => format!("fork server crashed with signal {sig} before the handshake"),
            None if traits.deferred => "fork server handshake failed; the deferred \
                 initialization hook was never reached"
                .to_string(),
            None => format!(
                "fork server handshake failed; the target exited early (memory limit {mem} MB, \
                 check that it is instrumented and starts correctly)"
            ),
        }
    }

    fn shutdown(&mut self) {
        self.ctl = None;
        self.st = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

fn wait_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    loop {
        let rc = unsafe { libc::poll(&mut pfd, 1, ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(rc > 0);
    }
}

pub(crate) fn configure_child(cmd: &mut Command, spec: &TargetSpec) {
    cmd.args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }

    let mem_limit_mb = spec.mem_limit_mb;
    let limits = move || {
        if mem_limit_mb > 0 {
            let bytes = (mem_limit_mb << 20) as libc::rlim_t;
            let limit = libc::rlimit {
                rlim_cur: bytes,
                rlim_max: bytes,
            };
            unsafe { libc::setrlimit(libc::RLIMIT_AS, &limit) };
        }
        let no_core = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        unsafe {
            libc::setrlimit(libc::RLIMIT_CORE, &no_core);
            libc::setsid();
        }
        Ok(())
    };
    unsafe {
        cmd.pre_exec(limits);
    }
}

/// Pipes are close-on-exec so unrelated children never hold our ends open;
/// the target only sees the `dup2` copies.
fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

impl ProcessSupervisor for ForkServer {
    fn start_persistent(&mut self) -> Result<(), ExecutorError> {
        info!("spinning up the fork server");

        let (ctl_read, ctl_write) = cloexec_pipe()?;
        let (st_read, st_write) = cloexec_pipe()?;

        let mut cmd = Command::new(&self.spec.program);
        configure_child(&mut cmd, &self.spec);
        cmd.env("LD_BIND_NOW", "1");
        match &self.stdin {
            Some(file) => cmd.stdin(Stdio::from(file.try_clone()?)),
            None => cmd.stdin(Stdio::null()),
        };

        let fds = [
            ctl_read.as_raw_fd(),
            ctl_write.as_raw_fd(),
            st_read.as_raw_fd(),
            st_write.as_raw_fd(),
        ];
        let wire_pipes = move || {
            unsafe {
                if libc::dup2(fds[0], FORKSRV_FD) < 0 || libc::dup2(fds[3], FORKSRV_FD + 1) < 0 {
                    return Err(io::Error::last_os_error());
                }
                for fd in fds {
                    libc::close(fd);
                }
            }
            Ok(())
        };
        unsafe {
            cmd.pre_exec(wire_pipes);
        }

        let child = cmd.spawn().map_err(|source| ExecutorError::Spawn {
            program: self.spec.program.clone(),
            source,
        })?;
        drop(ctl_read);
        drop(st_write);

        self.child = Some(child);
        self.ctl = Some(File::from(ctl_write));
        let st = File::from(st_read);
        let st_fd = st.as_raw_fd();
        self.st = Some(st);

        if !wait_readable(st_fd, self.handshake_timeout)? {
            self.shutdown();
            return Err(ExecutorError::HandshakeTimeout(self.handshake_timeout));
        }

        match self.read_i32() {
            Ok(_) => {
                info!("all right - fork server is up");
                Ok(())
            }
            Err(_) => {
                let reason = self.diagnose_startup();
                self.shutdown();
                Err(ExecutorError::ForkServerStartup(reason))
            }
        }
    }

    fn request_run(&mut self, prev_timed_out: bool) -> Result<RunHandle, ExecutorError> {
        self.write_u32(u32::from(prev_timed_out)).map_err(|e| {
            ExecutorError::ForkServerLost(format!("unable to request a new process: {e}"))
        })?;
        let pid = self.read_i32().map_err(|e| {
            ExecutorError::ForkServerLost(format!("unable to receive a child pid: {e}"))
        })?;
        if pid <= 0 {
            return Err(ExecutorError::ForkServerLost(format!(
                "fork server is misbehaving (reported pid {pid})"
            )));
        }
        debug!("fork server spawned child {pid}");
        Ok(RunHandle::forked(pid))
    }

    fn await_result(&mut self, _handle: &mut RunHandle) -> Result<ExitKind, ExecutorError> {
        let status = self.read_i32().map_err(|e| {
            ExecutorError::ForkServerLost(format!("unable to read the child status: {e}"))
        })?;
        Ok(ExitKind::from_wait_status(status))
    }

    fn kill(&mut self, handle: &RunHandle) {
        if handle.pid() > 0 {
            let _ = kill(Pid::from_raw(handle.pid()), Signal::SIGKILL);
        }
    }

    fn is_persistent(&self) -> bool {
        true
    }
}

impl Drop for ForkServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
