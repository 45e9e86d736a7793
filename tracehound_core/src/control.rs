//! Cooperative stop and skip requests.
//!
//! The fuzzing loop polls these flags at stage and execution boundaries.
//! The CLI sets `stop` from its interrupt handler; `SIGUSR1` sets `skip`
//! once [`install_skip_signal`] has been called.

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

#[derive(Debug, Clone, Default)]
pub struct RunControl {
    stop: Arc<AtomicBool>,
    skip: Arc<AtomicBool>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared stop flag, handed to the executor so it can tell a child
    /// killed on shutdown from a real crash.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub fn request_skip(&self) {
        self.skip.store(true, Ordering::SeqCst);
    }

    /// Consumes a pending skip request.
    pub fn take_skip(&self) -> bool {
        self.skip.swap(false, Ordering::SeqCst)
    }
}

static SKIP_TARGET: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn on_skip_signal(_: libc::c_int) {
    if let Some(flag) = SKIP_TARGET.get() {
        flag.store(true, Ordering::SeqCst);
    }
}

/// Routes `SIGUSR1` to `control`'s skip flag. Only the first call binds a
/// flag; later calls just reinstall the handler.
pub fn install_skip_signal(control: &RunControl) -> Result<(), nix::Error> {
    let _ = SKIP_TARGET.set(Arc::clone(&control.skip));
    let action = SigAction::new(
        SigHandler::Handler(on_skip_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGUSR1, &action) }?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_is_consumed_once() {
        let control = RunControl::new();
        assert!(!control.take_skip());
        control.request_skip();
        assert!(control.take_skip());
        assert!(!control.take_skip());
    }

    #[test]
    fn stop_is_visible_through_shared_flag() {
        let control = RunControl::new();
        let flag = control.stop_flag();
        control.clone().request_stop();
        assert!(flag.load(Ordering::SeqCst));
        assert!(control.should_stop());
    }
}
