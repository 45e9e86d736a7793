use crate::bitmap::{Novelty, count_bytes, hash_trace, new_trace};
use crate::executor::{Executor, Outcome};
use crate::fuzzer::{FuzzError, Fuzzer};
use crate::state::EXEC_TIMEOUT;
use log::{info, warn};
use std::time::{Duration, Instant};

pub const CAL_CYCLES: u32 = 8;
/// Cycles used once an entry's trace turns out to vary between runs.
pub const CAL_CYCLES_LONG: u32 = 40;
/// Calibration attempts before an entry is given up on.
pub const CAL_CHANCES: u8 = 3;
pub const CAL_TMOUT_PERC: u32 = 125;
pub const CAL_TMOUT_ADD: Duration = Duration::from_millis(50);
/// Granularity of auto-calibrated timeouts, milliseconds.
pub const EXEC_TM_ROUND: u64 = 20;

pub const TRIM_MIN_BYTES: usize = 4;
pub const TRIM_START_STEPS: usize = 16;
pub const TRIM_END_STEPS: usize = 1024;

impl<E: Executor> Fuzzer<E> {
    /// Runs entry `idx` (with contents `buf`) several times to learn its
    /// checksum, speed and coverage, and offers it to the winner index.
    ///
    /// Returns the outcome of the last run, `NoInstrumentation` when the very
    /// first run left the map empty, or `NoNewBits` when a fresh entry adds no
    /// coverage at all.
    pub(crate) fn calibrate_case(
        &mut self,
        idx: usize,
        buf: &[u8],
        handicap: u64,
        from_queue: bool,
    ) -> Result<Outcome, FuzzError> {
        let target_fault = self.state.target_fault();
        let dumb = self.state.dumb_mode();
        let exec_tmout = self.state.exec_tmout;
        let use_tmout = if !from_queue || self.state.resuming {
            (exec_tmout + CAL_TMOUT_ADD).max(exec_tmout * CAL_TMOUT_PERC / 100)
        } else {
            exec_tmout
        };

        let entry = self.state.queue.entry_mut(idx)?;
        let first_run = entry.exec_cksum == 0;
        let mut exec_cksum = entry.exec_cksum;
        entry.cal_failed = entry.cal_failed.saturating_add(1);

        let mut stage_max = CAL_CYCLES;
        let mut new_bits = Novelty::None;
        let mut var_detected = false;
        let mut fault = Outcome::None;
        let start = Instant::now();

        let mut cycle = 0;
        while cycle < stage_max {
            fault = self.execute(buf, use_tmout)?;
            if self.stopping() || fault != target_fault {
                break;
            }
            if !dumb && cycle == 0 && count_bytes(self.executor.trace()) == 0 {
                fault = Outcome::NoInstrumentation;
                break;
            }

            let cksum = hash_trace(self.executor.trace());
            if cksum != exec_cksum {
                new_bits = new_bits.max(self.check_new_bits());
                if exec_cksum != 0 {
                    var_detected = true;
                    stage_max = CAL_CYCLES_LONG;
                } else {
                    exec_cksum = cksum;
                }
            }
            cycle += 1;
        }

        self.state.queue.entry_mut(idx)?.exec_cksum = exec_cksum;

        if cycle == stage_max {
            let elapsed_us = start.elapsed().as_micros() as u64;
            let bitmap_size = count_bytes(self.executor.trace());
            self.state.counters.total_cal_us += elapsed_us;
            self.state.counters.total_cal_cycles += u64::from(stage_max);
            self.state.counters.total_bitmap_size += u64::from(bitmap_size);
            self.state.counters.total_bitmap_entries += 1;

            let entry = self.state.queue.entry_mut(idx)?;
            entry.exec_us = elapsed_us / u64::from(stage_max);
            entry.bitmap_size = bitmap_size;
            entry.handicap = handicap;
            entry.cal_failed = 0;
            self.state.queue.update_bitmap_score(idx, self.executor.trace());

            if !dumb && first_run && fault == Outcome::None && new_bits == Novelty::None {
                fault = Outcome::NoNewBits;
            }
        }

        if new_bits == Novelty::NewTuple {
            let entry = self.state.queue.entry_mut(idx)?;
            if !entry.has_new_cov {
                entry.has_new_cov = true;
                self.state.queue.queued_with_cov += 1;
            }
        }
        if var_detected {
            self.state.queue.mark_variable(idx)?;
        }
        Ok(fault)
    }

    /// Calibrates every initial entry and rejects a corpus the target
    /// cannot be fuzzed with.
    pub(crate) fn perform_dry_run(&mut self) -> Result<(), FuzzError> {
        let crash_mode = self.state.settings.crash_mode;
        let skip_crashes = self.state.settings.skip_crashes;
        let mut cal_failures = 0;

        for idx in 0..self.state.queue.len() {
            let buf = self.state.queue.read_input(idx)?;
            let path = self.state.queue.entry(idx)?.path.clone();
            let name = self.state.queue.entry(idx)?.file_name();
            info!("attempting dry run with '{name}'");

            let res = self.calibrate_case(idx, &buf, 0, true)?;
            if self.stopping() {
                return Ok(());
            }

            match res {
                Outcome::None => {
                    if crash_mode {
                        return Err(FuzzError::SeedDoesNotCrash(path));
                    }
                    let entry = self.state.queue.entry(idx)?;
                    info!(
                        "len = {}, map size = {}, exec speed = {} us",
                        entry.len, entry.bitmap_size, entry.exec_us
                    );
                }
                Outcome::Hang => {
                    if !self.state.skip_hangs_in_dry_run {
                        return Err(FuzzError::SeedHangs(path));
                    }
                    warn!("'{name}' times out, skipping it");
                    self.state.queue.entry_mut(idx)?.cal_failed = CAL_CHANCES;
                    cal_failures += 1;
                }
                Outcome::Crash => {
                    if crash_mode {
                        info!("'{name}' crashes the target as expected");
                    } else if skip_crashes {
                        warn!("'{name}' crashes the target, skipping it");
                        self.state.queue.entry_mut(idx)?.cal_failed = CAL_CHANCES;
                        cal_failures += 1;
                    } else {
                        let hint = if self.state.mem_limit_mb > 0 {
                            format!(
                                " (a memory limit of {} MB may be too low for this target)",
                                self.state.mem_limit_mb
                            )
                        } else {
                            String::new()
                        };
                        return Err(FuzzError::SeedCrashes { path, hint });
                    }
                }
                Outcome::Error => return Err(FuzzError::TargetExecFailed),
                Outcome::NoInstrumentation => return Err(FuzzError::NoInstrumentation(path)),
                Outcome::NoNewBits => {
                    self.state.counters.useless_at_start += 1;
                    warn!("no new instrumentation output, '{name}' may be useless");
                }
            }

            if self.state.queue.entry(idx)?.var_behavior {
                warn!("instrumentation output varies across runs of '{name}'");
            }
        }

        let total = self.state.queue.len();
        if cal_failures > 0 {
            if cal_failures == total {
                return Err(FuzzError::AllSeedsFailed(total));
            }
            warn!("skipped {cal_failures} test cases");
            if cal_failures * 5 > total {
                warn!("high percentage of rejected test cases, check the settings");
            }
        }
        info!("all test cases processed");
        Ok(())
    }

    /// Derives the havoc divisor and, unless one was configured, the
    /// execution timeout from the dry run measurements.
    pub(crate) fn tune_timeouts(&mut self) {
        let avg_us = self.state.avg_exec_us();
        self.state.havoc_div = match avg_us {
            us if us > 50_000 => 10,
            us if us > 20_000 => 5,
            us if us > 10_000 => 2,
            _ => 1,
        };
        if avg_us > 10_000 {
            warn!("the target is slow: {} ms per run", avg_us / 1000);
        }

        if self.state.timeout_given {
            return;
        }

        let max_us = self.state.queue.iter().map(|e| e.exec_us).max().unwrap_or(0);
        let mut tmout_ms = if avg_us > 50_000 {
            avg_us * 2 / 1000
        } else if avg_us > 10_000 {
            avg_us * 3 / 1000
        } else {
            avg_us * 5 / 1000
        };
        tmout_ms = tmout_ms.max(max_us / 1000);
        tmout_ms = (tmout_ms + EXEC_TM_ROUND) / EXEC_TM_ROUND * EXEC_TM_ROUND;
        tmout_ms = tmout_ms.min(EXEC_TIMEOUT.as_millis() as u64);

        self.state.exec_tmout = Duration::from_millis(tmout_ms);
        self.state.hang_tmout = self.state.exec_tmout.max(EXEC_TIMEOUT);
        self.state.timeout_given = true;
        info!("no timeout configured, using {tmout_ms} ms");
    }

    /// Removes chunks of `in_buf` that do not affect the trace checksum and
    /// persists the shorter entry when anything was removed.
    pub(crate) fn trim_case(&mut self, idx: usize, in_buf: &mut Vec<u8>) -> Result<Outcome, FuzzError> {
        if in_buf.len() < 5 {
            return Ok(Outcome::None);
        }

        let exec_cksum = self.state.queue.entry(idx)?.exec_cksum;
        let exec_tmout = self.state.exec_tmout;
        let mut len_p2 = in_buf.len().next_power_of_two();
        let mut remove_len = (len_p2 / TRIM_START_STEPS).max(TRIM_MIN_BYTES);
        let mut clean_trace = None;
        let mut fault = Outcome::None;

        while remove_len >= (len_p2 / TRIM_END_STEPS).max(TRIM_MIN_BYTES) {
            let mut remove_pos = remove_len;

            while remove_pos < in_buf.len() {
                let trim_avail = remove_len.min(in_buf.len() - remove_pos);
                let mut candidate = Vec::with_capacity(in_buf.len() - trim_avail);
                candidate.extend_from_slice(&in_buf[..remove_pos]);
                candidate.extend_from_slice(&in_buf[remove_pos + trim_avail..]);

                fault = self.execute(&candidate, exec_tmout)?;
                if self.stopping() || fault == Outcome::Error {
                    return Ok(fault);
                }

                if hash_trace(self.executor.trace()) == exec_cksum {
                    *in_buf = candidate;
                    len_p2 = in_buf.len().next_power_of_two();
                    if clean_trace.is_none() {
                        let mut t = new_trace();
                        t.copy_from_slice(self.executor.trace());
                        clean_trace = Some(t);
                    }
                } else {
                    remove_pos += remove_len;
                }
            }
            remove_len >>= 1;
        }

        if let Some(clean) = clean_trace {
            self.state.queue.write_input(idx, in_buf)?;
            self.executor.trace_mut().copy_from_slice(&clean[..]);
            self.state.queue.update_bitmap_score(idx, self.executor.trace());
        }
        Ok(fault)
    }
}
