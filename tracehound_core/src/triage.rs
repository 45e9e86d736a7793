use crate::bitmap::{Novelty, has_new_bits, hash_trace, simplify_trace};
use crate::executor::{Executor, Outcome};
use crate::fuzzer::{FuzzError, Fuzzer};
use log::{info, warn};
use std::fs;
use std::time::Instant;

impl<E: Executor> Fuzzer<E> {
    /// Runs one candidate and files it. Returns `true` when the caller
    /// should abandon the current entry: on stop, on a skip request, or
    /// after too many consecutive hangs.
    pub(crate) fn common_fuzz_stuff(&mut self, buf: &[u8]) -> Result<bool, FuzzError> {
        let fault = self.execute(buf, self.state.exec_tmout)?;
        if self.stopping() {
            return Ok(true);
        }

        if fault == Outcome::Hang {
            let subseq = self.state.counters.subseq_hangs;
            self.state.counters.subseq_hangs += 1;
            if subseq > self.state.settings.hang_limit {
                self.state.counters.cur_skipped_paths += 1;
                return Ok(true);
            }
        } else {
            self.state.counters.subseq_hangs = 0;
        }

        if self.control.take_skip() {
            info!("skipping entry {} on request", self.state.current_entry);
            self.state.counters.cur_skipped_paths += 1;
            return Ok(true);
        }

        if self.save_if_interesting(buf, fault)? {
            self.state.counters.queued_discovered += 1;
        }
        self.update_stats(false)?;
        Ok(false)
    }

    /// Decides whether the last execution of `buf` is worth keeping, and
    /// stores it in the queue, `hangs/` or `crashes/` accordingly.
    ///
    /// Returns `true` only when a new queue entry was created.
    pub(crate) fn save_if_interesting(&mut self, buf: &[u8], fault: Outcome) -> Result<bool, FuzzError> {
        let mut keeping = false;

        if fault == self.state.target_fault() {
            let novelty = self.check_new_bits();
            if novelty == Novelty::None {
                if self.state.settings.crash_mode {
                    self.state.counters.total_crashes += 1;
                }
                return Ok(false);
            }
            self.add_discovery(buf, novelty)?;
            keeping = true;
        }

        let as_crash = match fault {
            Outcome::Hang => self.triage_hang(buf)?,
            Outcome::Crash => true,
            Outcome::Error => return Err(FuzzError::TargetExecFailed),
            _ => false,
        };
        if as_crash {
            self.triage_crash(buf)?;
        }
        Ok(keeping)
    }

    fn add_discovery(&mut self, buf: &[u8], novelty: Novelty) -> Result<(), FuzzError> {
        let new_cov = novelty == Novelty::NewTuple;
        let name = format!(
            "id:{:06},{}",
            self.state.queue.len(),
            self.state.stage.describe(self.state.current_entry, new_cov)
        );
        let path = self.state.layout.queue_dir().join(name);
        let idx = self
            .state
            .queue
            .add(path.clone(), buf.len(), false, self.state.cur_depth);
        self.state.last_path_time = Some(Instant::now());

        let cksum = hash_trace(self.executor.trace());
        let entry = self.state.queue.entry_mut(idx)?;
        entry.exec_cksum = cksum;
        if new_cov {
            entry.has_new_cov = true;
            self.state.queue.queued_with_cov += 1;
        }

        let handicap = self.state.queue_cycle.saturating_sub(1);
        if self.calibrate_case(idx, buf, handicap, false)? == Outcome::Error {
            return Err(FuzzError::TargetExecFailed);
        }
        fs::write(&path, buf).map_err(|e| FuzzError::io(&path, e))
    }

    /// Files a timeout. Returns `true` when re-running it under the longer
    /// hang timeout turned it into a crash.
    fn triage_hang(&mut self, buf: &[u8]) -> Result<bool, FuzzError> {
        self.state.counters.total_hangs += 1;
        if self.state.counters.unique_hangs >= self.state.settings.keep_unique_hangs {
            return Ok(false);
        }

        if !self.state.dumb_mode() {
            simplify_trace(self.executor.trace_mut());
            if has_new_bits(self.executor.trace(), &mut self.state.virgin_hang) == Novelty::None {
                return Ok(false);
            }
        }

        if self.state.exec_tmout < self.state.hang_tmout {
            let confirmed = self.execute(buf, self.state.hang_tmout)?;
            if !self.stopping() && confirmed == Outcome::Crash {
                return Ok(true);
            }
            if self.stopping() || confirmed != Outcome::Hang {
                return Ok(false);
            }
        }

        let name = format!(
            "id:{:06},{}",
            self.state.counters.unique_hangs,
            self.state.stage.describe(self.state.current_entry, false)
        );
        let path = self.state.layout.hangs_dir().join(name);
        fs::write(&path, buf).map_err(|e| FuzzError::io(&path, e))?;

        self.state.counters.unique_hangs += 1;
        self.state.last_hang_time = Some(Instant::now());
        info!("new unique hang saved as {path:?}");
        Ok(false)
    }

    fn triage_crash(&mut self, buf: &[u8]) -> Result<(), FuzzError> {
        self.state.counters.total_crashes += 1;
        if self.state.counters.unique_crashes >= self.state.settings.keep_unique_crashes {
            return Ok(());
        }

        if !self.state.dumb_mode() {
            simplify_trace(self.executor.trace_mut());
            if has_new_bits(self.executor.trace(), &mut self.state.virgin_crash) == Novelty::None {
                return Ok(());
            }
        }

        if self.state.counters.unique_crashes == 0 {
            self.write_crash_readme();
        }

        let name = format!(
            "id:{:06},sig:{:02},{}",
            self.state.counters.unique_crashes,
            self.executor.kill_signal(),
            self.state.stage.describe(self.state.current_entry, false)
        );
        let path = self.state.layout.crashes_dir().join(name);
        fs::write(&path, buf).map_err(|e| FuzzError::io(&path, e))?;

        self.state.counters.unique_crashes += 1;
        self.state.last_crash_time = Some(Instant::now());
        info!("new unique crash saved as {path:?}");
        Ok(())
    }

    fn write_crash_readme(&self) {
        let path = self.state.layout.crashes_dir().join("README.txt");
        let mem_limit = if self.state.mem_limit_mb > 0 {
            format!("{} MB", self.state.mem_limit_mb)
        } else {
            "none".to_string()
        };
        let text = format!(
            "Command line used to find the crashes in this directory:\n\n\
             {}\n\n\
             Memory limit: {mem_limit}\n\n\
             A crash that does not reproduce outside the fuzzer is often caused by a\n\
             different memory limit; run the target under the same limit, for example\n\
             with `ulimit -Sv`, before digging deeper.\n\n\
             File names record where each input came from and which signal killed\n\
             the target.\n",
            self.state.command_line
        );
        if let Err(e) = fs::write(&path, text) {
            warn!("could not write {path:?}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::mock::MockExecutor;
    use crate::fuzzer::tests::{mock_fuzzer, mock_fuzzer_with};
    use crate::state::{StageKind, StageVal};
    use std::path::Path;

    fn files_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| !n.starts_with('.') && n != "README.txt")
            .collect();
        names.sort();
        names
    }

    #[test]
    fn novel_candidate_joins_the_queue() {
        let (_dir, mut fuzzer) = mock_fuzzer(&[b"seed"], |_| {});
        fuzzer.setup().unwrap();
        fuzzer.perform_dry_run().unwrap();
        fuzzer.state.stage.enter(StageKind::Arith8, 1);
        fuzzer.state.stage.cur_byte = Some(2);
        fuzzer.state.stage.val = StageVal::Le(-3);
        fuzzer.state.cur_depth = 1;

        assert!(!fuzzer.common_fuzz_stuff(b"sebd").unwrap());
        assert_eq!(fuzzer.state.queue.len(), 2);
        assert_eq!(fuzzer.state.counters.queued_discovered, 1);

        let entry = fuzzer.state.queue.get(1).unwrap();
        assert_eq!(
            entry.file_name(),
            "id:000001,src:000000,op:arith8,pos:2,val:-3,+cov"
        );
        assert_eq!(entry.depth, 2);
        assert!(entry.has_new_cov);
        assert_eq!(entry.cal_failed, 0);
        assert_eq!(fuzzer.state.queue.read_input(1).unwrap(), b"sebd");

        // Same behavior again is not interesting.
        assert!(!fuzzer.common_fuzz_stuff(b"sebd").unwrap());
        assert_eq!(fuzzer.state.queue.len(), 2);
    }

    #[test]
    fn repeated_crash_counts_but_is_not_unique() {
        let (_dir, mut fuzzer) = mock_fuzzer(&[b"seed"], |_| {});
        fuzzer.setup().unwrap();
        fuzzer.state.stage.enter(StageKind::Havoc, 1);
        fuzzer.state.stage.stack = 4;

        fuzzer.common_fuzz_stuff(b"!crash").unwrap();
        fuzzer.common_fuzz_stuff(b"!crash").unwrap();
        assert_eq!(fuzzer.state.counters.total_crashes, 2);
        assert_eq!(fuzzer.state.counters.unique_crashes, 1);

        let crashes = fuzzer.state.layout.crashes_dir();
        assert_eq!(
            files_in(&crashes),
            vec!["id:000000,sig:11,src:000000,op:havoc,rep:4".to_string()]
        );
        let readme = fs::read_to_string(crashes.join("README.txt")).unwrap();
        assert!(readme.contains("./target"));
        assert!(readme.contains("50 MB"));
    }

    #[test]
    fn crash_along_a_new_path_is_unique() {
        let (_dir, mut fuzzer) = mock_fuzzer(&[b"seed"], |_| {});
        fuzzer.setup().unwrap();
        fuzzer.state.stage.enter(StageKind::Havoc, 1);
        fuzzer.common_fuzz_stuff(b"!a").unwrap();
        fuzzer.common_fuzz_stuff(b"!ab").unwrap();
        assert_eq!(fuzzer.state.counters.unique_crashes, 2);
    }

    #[test]
    fn confirmed_hang_is_saved() {
        let (_dir, mut fuzzer) = mock_fuzzer(&[b"seed"], |_| {});
        fuzzer.setup().unwrap();
        fuzzer.state.stage.enter(StageKind::Flip1, 1);
        fuzzer.state.stage.cur_byte = Some(0);

        fuzzer.common_fuzz_stuff(b"~zz").unwrap();
        assert_eq!(fuzzer.state.counters.total_hangs, 1);
        assert_eq!(fuzzer.state.counters.unique_hangs, 1);
        assert_eq!(
            files_in(&fuzzer.state.layout.hangs_dir()),
            vec!["id:000000,src:000000,op:flip1,pos:0".to_string()]
        );
        // The original run plus the confirmation run.
        assert_eq!(fuzzer.executor().runs, 2);
    }

    #[test]
    fn hang_that_completes_on_retry_is_dropped() {
        let mut n = 0;
        let exec = MockExecutor::new(move |_, trace| {
            n += 1;
            trace[0] = 1;
            if n == 1 { Outcome::Hang } else { Outcome::None }
        });
        let (_dir, mut fuzzer) = mock_fuzzer_with(exec, &[b"seed"], |_| {});
        fuzzer.setup().unwrap();
        let tmout = fuzzer.state.exec_tmout;
        assert_eq!(fuzzer.execute(b"x", tmout).unwrap(), Outcome::Hang);
        let kept = fuzzer.save_if_interesting(b"x", Outcome::Hang).unwrap();
        assert!(!kept);
        assert_eq!(fuzzer.state.counters.unique_hangs, 0);
        assert!(files_in(&fuzzer.state.layout.hangs_dir()).is_empty());
    }

    #[test]
    fn hang_that_crashes_on_retry_is_a_crash() {
        let exec = MockExecutor::new(|_, trace| {
            trace[7] = 1;
            Outcome::Crash
        });
        let (_dir, mut fuzzer) = mock_fuzzer_with(exec, &[b"seed"], |_| {});
        fuzzer.setup().unwrap();
        fuzzer.save_if_interesting(b"x", Outcome::Hang).unwrap();
        assert_eq!(fuzzer.state.counters.total_hangs, 1);
        assert_eq!(fuzzer.state.counters.unique_hangs, 0);
        assert_eq!(fuzzer.state.counters.unique_crashes, 1);
    }

    #[test]
    fn unique_hang_cap_is_respected() {
        let (_dir, mut fuzzer) = mock_fuzzer(&[b"seed"], |c| c.fuzzer.keep_unique_hangs = 1);
        fuzzer.setup().unwrap();
        fuzzer.common_fuzz_stuff(b"~a").unwrap();
        fuzzer.common_fuzz_stuff(b"~ab").unwrap();
        assert_eq!(fuzzer.state.counters.total_hangs, 2);
        assert_eq!(fuzzer.state.counters.unique_hangs, 1);
    }

    #[test]
    fn consecutive_hangs_abandon_the_entry() {
        let (_dir, mut fuzzer) = mock_fuzzer(&[b"seed"], |c| c.fuzzer.hang_limit = 1);
        fuzzer.setup().unwrap();
        assert!(!fuzzer.common_fuzz_stuff(b"~a").unwrap());
        assert!(!fuzzer.common_fuzz_stuff(b"~a").unwrap());
        assert!(fuzzer.common_fuzz_stuff(b"~a").unwrap());
        assert_eq!(fuzzer.state.counters.cur_skipped_paths, 1);

        assert!(!fuzzer.common_fuzz_stuff(b"ok").unwrap());
        assert_eq!(fuzzer.state.counters.subseq_hangs, 0);
    }

    #[test]
    fn skip_request_abandons_once() {
        let (_dir, mut fuzzer) = mock_fuzzer(&[b"seed"], |_| {});
        fuzzer.setup().unwrap();
        fuzzer.control.request_skip();
        assert!(fuzzer.common_fuzz_stuff(b"abc").unwrap());
        assert!(!fuzzer.common_fuzz_stuff(b"abc").unwrap());
    }

    #[test]
    fn crash_mode_queues_new_crashes() {
        let (_dir, mut fuzzer) = mock_fuzzer(&[b"!seed"], |c| c.fuzzer.crash_mode = true);
        fuzzer.setup().unwrap();
        fuzzer.perform_dry_run().unwrap();

        assert!(!fuzzer.common_fuzz_stuff(b"all fine").unwrap());
        assert_eq!(fuzzer.state.queue.len(), 1);

        fuzzer.state.stage.enter(StageKind::Havoc, 1);
        fuzzer.common_fuzz_stuff(b"!other").unwrap();
        assert_eq!(fuzzer.state.queue.len(), 2);
        assert_eq!(fuzzer.state.counters.unique_crashes, 1);

        // No new coverage: only the raw counter moves.
        let before = fuzzer.state.counters.total_crashes;
        fuzzer.common_fuzz_stuff(b"!other").unwrap();
        assert_eq!(fuzzer.state.counters.total_crashes, before + 1);
        assert_eq!(fuzzer.state.queue.len(), 2);
    }

    #[test]
    fn sync_provenance_names_the_peer() {
        let (_dir, mut fuzzer) = mock_fuzzer(&[b"seed"], |_| {});
        fuzzer.setup().unwrap();
        fuzzer.state.stage.syncing = Some(("worker2".into(), 17));
        let tmout = fuzzer.state.exec_tmout;
        fuzzer.execute(b"zz", tmout).unwrap();
        assert!(fuzzer.save_if_interesting(b"zz", Outcome::None).unwrap());
        let entry = fuzzer.state.queue.get(1).unwrap();
        assert_eq!(entry.file_name(), "id:000001,sync:worker2,src:000017,+cov");
    }
}
