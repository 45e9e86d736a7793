//! Wall-clock timer that kills the running child when it overstays.
//!
//! The fuzzing thread blocks in `waitpid` or on the fork server's status
//! pipe; this helper thread owns the deadline and delivers `SIGKILL` when it
//! passes. Disarming is a rendezvous, so once [`Watchdog::disarm`] returns
//! the timer can no longer fire for that run.

use log::{debug, warn};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

enum Command {
    Arm { pid: i32, timeout: Duration },
    Disarm,
    Abort,
    Shutdown,
}

enum Armed {
    Idle,
    Waiting { pid: i32, deadline: Instant },
    Fired,
}

pub struct Watchdog {
    tx: Sender<Command>,
    ack: Receiver<bool>,
    handle: Option<JoinHandle<()>>,
}

/// Cloneable handle that kills whatever child is currently armed.
#[derive(Clone)]
pub struct Canceller {
    tx: Sender<Command>,
}

impl Canceller {
    pub fn cancel(&self) {
        let _ = self.tx.send(Command::Abort);
    }
}

impl Watchdog {
    pub fn spawn() -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let (ack_tx, ack) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("tracehound-watchdog".into())
            .spawn(move || run(rx, ack_tx))?;
        Ok(Self {
            tx,
            ack,
            handle: Some(handle),
        })
    }

    pub fn arm(&self, pid: i32, timeout: Duration) {
        let _ = self.tx.send(Command::Arm { pid, timeout });
    }

    /// Stops the timer and reports whether it fired during this run.
    pub fn disarm(&self) -> bool {
        if self.tx.send(Command::Disarm).is_err() {
            return false;
        }
        self.ack.recv().unwrap_or(false)
    }

    pub fn canceller(&self) -> Canceller {
        Canceller {
            tx: self.tx.clone(),
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(rx: Receiver<Command>, ack: Sender<bool>) {
    let mut state = Armed::Idle;
    loop {
        let msg = match state {
            Armed::Waiting { deadline, .. } => {
                rx.recv_timeout(deadline.saturating_duration_since(Instant::now()))
            }
            _ => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match msg {
            Ok(Command::Arm { pid, timeout }) => {
                state = Armed::Waiting {
                    pid,
                    deadline: Instant::now() + timeout,
                };
            }
            Ok(Command::Disarm) => {
                let fired = matches!(state, Armed::Fired);
                state = Armed::Idle;
                if ack.send(fired).is_err() {
                    break;
                }
            }
            Ok(Command::Abort) => {
                if let Armed::Waiting { pid, .. } = state {
                    debug!("stop requested, killing child {pid}");
                    sigkill(pid);
                }
            }
            Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                if let Armed::Waiting { pid, .. } = state {
                    sigkill(pid);
                    state = Armed::Fired;
                }
            }
        }
    }
}

fn sigkill(pid: i32) {
    if pid <= 0 {
        return;
    }
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
        if e != nix::errno::Errno::ESRCH {
            warn!("failed to kill child {pid}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as Proc;

    #[test]
    fn kills_child_after_deadline() {
        let mut child = Proc::new("/bin/sh")
            .args(["-c", "sleep 5"])
            .spawn()
            .expect("spawn sleep");
        let dog = Watchdog::spawn().unwrap();
        dog.arm(child.id() as i32, Duration::from_millis(50));

        let status = child.wait().unwrap();
        assert!(dog.disarm(), "timer should report that it fired");
        assert!(!status.success());
    }

    #[test]
    fn disarm_before_deadline_reports_no_timeout() {
        let mut child = Proc::new("/bin/sh").args(["-c", "exit 0"]).spawn().unwrap();
        let dog = Watchdog::spawn().unwrap();
        dog.arm(child.id() as i32, Duration::from_secs(5));

        let status = child.wait().unwrap();
        assert!(!dog.disarm());
        assert!(status.success());
    }

    #[test]
    fn canceller_kills_armed_child_immediately() {
        let mut child = Proc::new("/bin/sh")
            .args(["-c", "sleep 5"])
            .spawn()
            .unwrap();
        let dog = Watchdog::spawn().unwrap();
        let started = Instant::now();
        dog.arm(child.id() as i32, Duration::from_secs(30));
        dog.canceller().cancel();

        child.wait().unwrap();
        assert!(!dog.disarm());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
