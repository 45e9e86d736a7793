//! One fuzzing round over a queue entry.
//!
//! Deterministic stages walk the input with bit flips, arithmetic,
//! interesting values and dictionary tokens; the effector map built during
//! the byte-flip pass lets the later, more expensive stages skip regions
//! that never influenced the trace. Havoc and splicing follow.

use crate::bitmap::hash_trace;
use crate::calibrate::CAL_CHANCES;
use crate::executor::{Executor, Outcome};
use crate::extras::{MAX_AUTO_EXTRA, MAX_DET_EXTRAS, MIN_AUTO_EXTRA, USE_AUTO_EXTRAS};
use crate::fuzzer::{FuzzError, Fuzzer};
use crate::mutator::{
    ARITH_MAX, Havoc, INTERESTING_8, INTERESTING_16, INTERESTING_32, MAX_FILE, Mutator,
    could_be_arith, could_be_bitflip, could_be_interest, flip_bit, locate_diffs, read_u16,
    read_u32, write_u16, write_u32,
};
use crate::score::calculate_score;
use crate::state::{StageKind, StageVal};
use rand::Rng;

pub const HAVOC_CYCLES: u32 = 256;
pub const HAVOC_MIN: u32 = 16;
pub const SPLICE_CYCLES: u32 = 15;
pub const SPLICE_HAVOC: u32 = 32;

/// Effector map blocks are `1 << EFF_MAP_SCALE2` bytes.
pub const EFF_MAP_SCALE2: usize = 3;
/// Shorter inputs mark every block as effective without hashing.
pub const EFF_MIN_LEN: usize = 128;
/// Above this share of effective blocks, the whole map is marked.
pub const EFF_MAX_PERC: usize = 90;

fn eff_apos(pos: usize) -> usize {
    pos >> EFF_MAP_SCALE2
}

fn eff_alen(len: usize) -> usize {
    (len + (1 << EFF_MAP_SCALE2) - 1) >> EFF_MAP_SCALE2
}

/// Whether any block overlapping `pos..pos + len` is effective.
fn eff_span(eff_map: &[u8], pos: usize, len: usize) -> bool {
    eff_map[eff_apos(pos)..=eff_apos(pos + len - 1)].contains(&1)
}

impl<E: Executor> Fuzzer<E> {
    /// Fuzzes the current entry. Returns `true` when the entry was skipped
    /// or abandoned part-way.
    pub(crate) fn fuzz_one(&mut self) -> Result<bool, FuzzError> {
        let idx = self.state.current_entry;
        let dumb = self.state.dumb_mode();
        if self
            .state
            .queue
            .should_skip(idx, &mut self.state.rng, self.state.queue_cycle, dumb)
        {
            return Ok(true);
        }

        let result = self.fuzz_entry(idx);
        self.state.stage.splicing_with = None;
        let abandoned = result?;

        let entry = self.state.queue.entry(idx)?;
        if !self.stopping() && entry.cal_failed == 0 && !entry.was_fuzzed {
            self.state.queue.mark_fuzzed(idx);
        }
        Ok(abandoned)
    }

    fn fuzz_entry(&mut self, idx: usize) -> Result<bool, FuzzError> {
        self.state.counters.subseq_hangs = 0;
        self.state.stage.syncing = None;
        self.state.cur_depth = self.state.queue.entry(idx)?.depth;
        let mut in_buf = self.state.queue.read_input(idx)?;

        let cal_failed = self.state.queue.entry(idx)?.cal_failed;
        if cal_failed > 0 {
            let mut res = Outcome::Hang;
            if cal_failed < CAL_CHANCES {
                let handicap = self.state.queue_cycle.saturating_sub(1);
                res = self.calibrate_case(idx, &in_buf, handicap, false)?;
                if res == Outcome::Error {
                    return Err(FuzzError::TargetExecFailed);
                }
            }
            let usable = res == self.state.target_fault() || res == Outcome::NoNewBits;
            if self.stopping() || !usable {
                self.state.counters.cur_skipped_paths += 1;
                return Ok(true);
            }
        }

        if !self.state.dumb_mode() && !self.state.queue.entry(idx)?.trim_done {
            if self.trim_case(idx, &mut in_buf)? == Outcome::Error {
                return Err(FuzzError::TargetExecFailed);
            }
            if self.stopping() {
                self.state.counters.cur_skipped_paths += 1;
                return Ok(true);
            }
            self.state.queue.entry_mut(idx)?.trim_done = true;
        }

        let avg_exec_us = self.state.avg_exec_us();
        let avg_bitmap_size = self.state.avg_bitmap_size();
        let perf = calculate_score(
            self.state.queue.entry_mut(idx)?,
            avg_exec_us,
            avg_bitmap_size,
            &self.state.tuning,
        );

        let entry = self.state.queue.entry(idx)?;
        let run_det =
            !(self.state.settings.skip_deterministic || entry.was_fuzzed || entry.passed_det);
        if run_det {
            if self.deterministic_stages(idx, &in_buf)? {
                return Ok(true);
            }
            self.state.queue.mark_det_done(idx)?;
        }

        self.random_stages(idx, &in_buf, perf)
    }

    fn begin_stage(&mut self, kind: StageKind, max: u64) -> u64 {
        self.state.stage.enter(kind, max);
        self.state.hit_count()
    }

    fn finish_stage(&mut self, orig_hit_cnt: u64) {
        if let Some(kind) = self.state.stage.kind {
            let finds = self.state.hit_count() - orig_hit_cnt;
            self.state.counters.stage_finds[kind.index()] += finds;
            self.state.counters.stage_cycles[kind.index()] += self.state.stage.cur;
        }
    }

    fn run_candidate(&mut self, buf: &[u8]) -> Result<bool, FuzzError> {
        self.state.stage.cur += 1;
        self.common_fuzz_stuff(buf)
    }

    /// Returns `true` when the entry should be abandoned.
    fn deterministic_stages(&mut self, idx: usize, in_buf: &[u8]) -> Result<bool, FuzzError> {
        let len = in_buf.len();
        let mut out = in_buf.to_vec();
        let exec_cksum = self.state.queue.entry(idx)?.exec_cksum;
        let dumb = self.state.dumb_mode();

        // Walking single bits, mining dictionary tokens on the side: a run
        // of bytes whose flipped low bits all change the trace the same way
        // is likely a token the target compares against.
        let orig_hit_cnt = self.begin_stage(StageKind::Flip1, (len << 3) as u64);
        let mut prev_cksum = exec_cksum;
        let mut a_collect = [0u8; MAX_AUTO_EXTRA];
        let mut a_len = 0;
        for cur in 0..len << 3 {
            self.state.stage.cur_byte = Some(cur >> 3);
            flip_bit(&mut out, cur);
            if self.run_candidate(&out)? {
                return Ok(true);
            }
            flip_bit(&mut out, cur);

            if !dumb && (cur & 7) == 7 {
                let cksum = hash_trace(self.executor.trace());
                if cur == (len << 3) - 1 && cksum == prev_cksum {
                    if a_len < MAX_AUTO_EXTRA {
                        a_collect[a_len] = out[cur >> 3];
                    }
                    a_len += 1;
                    if (MIN_AUTO_EXTRA..=MAX_AUTO_EXTRA).contains(&a_len) {
                        self.state
                            .extras
                            .maybe_add_auto(&a_collect[..a_len], &mut self.state.rng);
                    }
                } else if cksum != prev_cksum {
                    if (MIN_AUTO_EXTRA..=MAX_AUTO_EXTRA).contains(&a_len) {
                        self.state
                            .extras
                            .maybe_add_auto(&a_collect[..a_len], &mut self.state.rng);
                    }
                    a_len = 0;
                    prev_cksum = cksum;
                }

                if cksum != exec_cksum {
                    if a_len < MAX_AUTO_EXTRA {
                        a_collect[a_len] = out[cur >> 3];
                    }
                    a_len += 1;
                }
            }
        }
        self.finish_stage(orig_hit_cnt);

        for (kind, width) in [(StageKind::Flip2, 2), (StageKind::Flip4, 4)] {
            let stage_max = (len << 3) - (width - 1);
            let orig_hit_cnt = self.begin_stage(kind, stage_max as u64);
            for cur in 0..stage_max {
                self.state.stage.cur_byte = Some(cur >> 3);
                for bit in cur..cur + width {
                    flip_bit(&mut out, bit);
                }
                if self.run_candidate(&out)? {
                    return Ok(true);
                }
                for bit in cur..cur + width {
                    flip_bit(&mut out, bit);
                }
            }
            self.finish_stage(orig_hit_cnt);
        }

        // Whole-byte flips double as the probe that builds the effector map.
        let alen = eff_alen(len);
        let mut eff_map = vec![0u8; alen];
        eff_map[0] = 1;
        let mut eff_cnt = 1;
        if eff_apos(len - 1) != 0 {
            eff_map[eff_apos(len - 1)] = 1;
            eff_cnt += 1;
        }

        let orig_hit_cnt = self.begin_stage(StageKind::Flip8, len as u64);
        for cur in 0..len {
            self.state.stage.cur_byte = Some(cur);
            out[cur] ^= 0xff;
            if self.run_candidate(&out)? {
                return Ok(true);
            }
            if eff_map[eff_apos(cur)] == 0 {
                let cksum = if !dumb && len >= EFF_MIN_LEN {
                    hash_trace(self.executor.trace())
                } else {
                    !exec_cksum
                };
                if cksum != exec_cksum {
                    eff_map[eff_apos(cur)] = 1;
                    eff_cnt += 1;
                }
            }
            out[cur] ^= 0xff;
        }
        if eff_cnt != alen && eff_cnt * 100 / alen > EFF_MAX_PERC {
            eff_map.fill(1);
        }
        self.finish_stage(orig_hit_cnt);

        if len >= 2 {
            let orig_hit_cnt = self.begin_stage(StageKind::Flip16, (len - 1) as u64);
            for i in 0..len - 1 {
                if eff_map[eff_apos(i)] == 0 && eff_map[eff_apos(i + 1)] == 0 {
                    continue;
                }
                self.state.stage.cur_byte = Some(i);
                out[i] ^= 0xff;
                out[i + 1] ^= 0xff;
                if self.run_candidate(&out)? {
                    return Ok(true);
                }
                out[i] ^= 0xff;
                out[i + 1] ^= 0xff;
            }
            self.finish_stage(orig_hit_cnt);
        }

        if len >= 4 {
            let orig_hit_cnt = self.begin_stage(StageKind::Flip32, (len - 3) as u64);
            for i in 0..len - 3 {
                if !eff_span(&eff_map, i, 4) {
                    continue;
                }
                self.state.stage.cur_byte = Some(i);
                for b in &mut out[i..i + 4] {
                    *b ^= 0xff;
                }
                if self.run_candidate(&out)? {
                    return Ok(true);
                }
                for b in &mut out[i..i + 4] {
                    *b ^= 0xff;
                }
            }
            self.finish_stage(orig_hit_cnt);
        }

        if self.arith_stages(&mut out, &eff_map)? || self.interest_stages(&mut out, &eff_map)? {
            return Ok(true);
        }
        self.extras_stages(&mut out, in_buf, &eff_map)
    }

    fn arith_stages(&mut self, out: &mut [u8], eff_map: &[u8]) -> Result<bool, FuzzError> {
        let len = out.len();
        let arith_max = ARITH_MAX as u8;

        let orig_hit_cnt = self.begin_stage(StageKind::Arith8, 2 * len as u64 * u64::from(ARITH_MAX));
        for i in 0..len {
            if eff_map[eff_apos(i)] == 0 {
                continue;
            }
            let orig = out[i];
            self.state.stage.cur_byte = Some(i);
            for j in 1..=arith_max {
                let up = orig.wrapping_add(j);
                if !could_be_bitflip(u32::from(orig ^ up)) {
                    self.state.stage.val = StageVal::Le(i64::from(j));
                    out[i] = up;
                    if self.run_candidate(out)? {
                        return Ok(true);
                    }
                }
                let down = orig.wrapping_sub(j);
                if !could_be_bitflip(u32::from(orig ^ down)) {
                    self.state.stage.val = StageVal::Le(-i64::from(j));
                    out[i] = down;
                    if self.run_candidate(out)? {
                        return Ok(true);
                    }
                }
                out[i] = orig;
            }
        }
        self.finish_stage(orig_hit_cnt);

        if len >= 2 {
            let orig_hit_cnt =
                self.begin_stage(StageKind::Arith16, 4 * (len as u64 - 1) * u64::from(ARITH_MAX));
            for i in 0..len - 1 {
                if !eff_span(eff_map, i, 2) {
                    continue;
                }
                let orig = read_u16(out, i);
                self.state.stage.cur_byte = Some(i);
                for j in 1..=u16::from(arith_max) {
                    let candidates = [
                        (
                            (orig & 0xff) + j > 0xff,
                            orig.wrapping_add(j),
                            StageVal::Le(i64::from(j)),
                        ),
                        (
                            (orig & 0xff) < j,
                            orig.wrapping_sub(j),
                            StageVal::Le(-i64::from(j)),
                        ),
                        (
                            (orig >> 8) + j > 0xff,
                            orig.swap_bytes().wrapping_add(j).swap_bytes(),
                            StageVal::Be(i64::from(j)),
                        ),
                        (
                            (orig >> 8) < j,
                            orig.swap_bytes().wrapping_sub(j).swap_bytes(),
                            StageVal::Be(-i64::from(j)),
                        ),
                    ];
                    for (carries, new, val) in candidates {
                        if carries && !could_be_bitflip(u32::from(orig ^ new)) {
                            self.state.stage.val = val;
                            write_u16(out, i, new);
                            if self.run_candidate(out)? {
                                return Ok(true);
                            }
                        }
                    }
                    write_u16(out, i, orig);
                }
            }
            self.finish_stage(orig_hit_cnt);
        }

        if len >= 4 {
            let orig_hit_cnt =
                self.begin_stage(StageKind::Arith32, 4 * (len as u64 - 3) * u64::from(ARITH_MAX));
            for i in 0..len - 3 {
                if !eff_span(eff_map, i, 4) {
                    continue;
                }
                let orig = read_u32(out, i);
                let swapped = orig.swap_bytes();
                self.state.stage.cur_byte = Some(i);
                for j in 1..=u32::from(arith_max) {
                    let candidates = [
                        (
                            (orig & 0xffff) + j > 0xffff,
                            orig.wrapping_add(j),
                            StageVal::Le(i64::from(j)),
                        ),
                        (
                            (orig & 0xffff) < j,
                            orig.wrapping_sub(j),
                            StageVal::Le(-i64::from(j)),
                        ),
                        (
                            (swapped & 0xffff) + j > 0xffff,
                            swapped.wrapping_add(j).swap_bytes(),
                            StageVal::Be(i64::from(j)),
                        ),
                        (
                            (swapped & 0xffff) < j,
                            swapped.wrapping_sub(j).swap_bytes(),
                            StageVal::Be(-i64::from(j)),
                        ),
                    ];
                    for (carries, new, val) in candidates {
                        if carries && !could_be_bitflip(orig ^ new) {
                            self.state.stage.val = val;
                            write_u32(out, i, new);
                            if self.run_candidate(out)? {
                                return Ok(true);
                            }
                        }
                    }
                    write_u32(out, i, orig);
                }
            }
            self.finish_stage(orig_hit_cnt);
        }

        Ok(false)
    }

    fn interest_stages(&mut self, out: &mut [u8], eff_map: &[u8]) -> Result<bool, FuzzError> {
        let len = out.len();

        let orig_hit_cnt =
            self.begin_stage(StageKind::Int8, (len * INTERESTING_8.len()) as u64);
        for i in 0..len {
            if eff_map[eff_apos(i)] == 0 {
                continue;
            }
            let orig = out[i];
            self.state.stage.cur_byte = Some(i);
            for v in INTERESTING_8 {
                let new = v as u8;
                if could_be_bitflip(u32::from(orig ^ new))
                    || could_be_arith(u32::from(orig), u32::from(new), 1)
                {
                    continue;
                }
                self.state.stage.val = StageVal::Le(i64::from(v));
                out[i] = new;
                if self.run_candidate(out)? {
                    return Ok(true);
                }
                out[i] = orig;
            }
        }
        self.finish_stage(orig_hit_cnt);

        if len >= 2 {
            let orig_hit_cnt =
                self.begin_stage(StageKind::Int16, 2 * (len as u64 - 1) * INTERESTING_16.len() as u64);
            for i in 0..len - 1 {
                if !eff_span(eff_map, i, 2) {
                    continue;
                }
                let orig = read_u16(out, i);
                self.state.stage.cur_byte = Some(i);
                for v in INTERESTING_16 {
                    let le = v as u16;
                    let be = le.swap_bytes();
                    let (o, n_le, n_be) = (u32::from(orig), u32::from(le), u32::from(be));

                    if !could_be_bitflip(o ^ n_le)
                        && !could_be_arith(o, n_le, 2)
                        && !could_be_interest(o, n_le, 2, false)
                    {
                        self.state.stage.val = StageVal::Le(i64::from(v));
                        write_u16(out, i, le);
                        if self.run_candidate(out)? {
                            return Ok(true);
                        }
                    }
                    if le != be
                        && !could_be_bitflip(o ^ n_be)
                        && !could_be_arith(o, n_be, 2)
                        && !could_be_interest(o, n_be, 2, true)
                    {
                        self.state.stage.val = StageVal::Be(i64::from(v));
                        write_u16(out, i, be);
                        if self.run_candidate(out)? {
                            return Ok(true);
                        }
                    }
                }
                write_u16(out, i, orig);
            }
            self.finish_stage(orig_hit_cnt);
        }

        if len >= 4 {
            let orig_hit_cnt =
                self.begin_stage(StageKind::Int32, 2 * (len as u64 - 3) * INTERESTING_32.len() as u64);
            for i in 0..len - 3 {
                if !eff_span(eff_map, i, 4) {
                    continue;
                }
                let orig = read_u32(out, i);
                self.state.stage.cur_byte = Some(i);
                for v in INTERESTING_32 {
                    let le = v as u32;
                    let be = le.swap_bytes();

                    if !could_be_bitflip(orig ^ le)
                        && !could_be_arith(orig, le, 4)
                        && !could_be_interest(orig, le, 4, false)
                    {
                        self.state.stage.val = StageVal::Le(i64::from(v));
                        write_u32(out, i, le);
                        if self.run_candidate(out)? {
                            return Ok(true);
                        }
                    }
                    if le != be
                        && !could_be_bitflip(orig ^ be)
                        && !could_be_arith(orig, be, 4)
                        && !could_be_interest(orig, be, 4, true)
                    {
                        self.state.stage.val = StageVal::Be(i64::from(v));
                        write_u32(out, i, be);
                        if self.run_candidate(out)? {
                            return Ok(true);
                        }
                    }
                }
                write_u32(out, i, orig);
            }
            self.finish_stage(orig_hit_cnt);
        }

        Ok(false)
    }

    fn extras_stages(&mut self, out: &mut [u8], in_buf: &[u8], eff_map: &[u8]) -> Result<bool, FuzzError> {
        let len = out.len();
        let user: Vec<Vec<u8>> = self.state.extras.user.iter().map(|e| e.data.clone()).collect();

        if !user.is_empty() {
            let user_cnt = user.len();

            let orig_hit_cnt = self.begin_stage(StageKind::ExtrasUO, (user_cnt * len) as u64);
            for i in 0..len {
                self.state.stage.cur_byte = Some(i);
                let mut last_len = 0;
                for token in &user {
                    let sampled_out = user_cnt > MAX_DET_EXTRAS
                        && self.state.rng.random_range(0..user_cnt) >= MAX_DET_EXTRAS;
                    if sampled_out
                        || token.len() > len - i
                        || out[i..i + token.len()] == token[..]
                        || !eff_span(eff_map, i, token.len())
                    {
                        continue;
                    }
                    last_len = token.len();
                    out[i..i + last_len].copy_from_slice(token);
                    if self.run_candidate(out)? {
                        return Ok(true);
                    }
                }
                out[i..i + last_len].copy_from_slice(&in_buf[i..i + last_len]);
            }
            self.finish_stage(orig_hit_cnt);

            let orig_hit_cnt = self.begin_stage(StageKind::ExtrasUI, (user_cnt * len) as u64);
            let mut ex_tmp = Vec::with_capacity(len + crate::extras::MAX_DICT_FILE);
            for i in 0..len {
                self.state.stage.cur_byte = Some(i);
                for token in &user {
                    if len + token.len() > MAX_FILE {
                        continue;
                    }
                    ex_tmp.clear();
                    ex_tmp.extend_from_slice(&out[..i]);
                    ex_tmp.extend_from_slice(token);
                    ex_tmp.extend_from_slice(&out[i..]);
                    if self.run_candidate(&ex_tmp)? {
                        return Ok(true);
                    }
                }
            }
            self.finish_stage(orig_hit_cnt);
        }

        let auto: Vec<Vec<u8>> = self
            .state
            .extras
            .auto_in_use()
            .iter()
            .map(|e| e.data.clone())
            .collect();
        if !auto.is_empty() {
            let orig_hit_cnt =
                self.begin_stage(StageKind::ExtrasAO, (auto.len().min(USE_AUTO_EXTRAS) * len) as u64);
            for i in 0..len {
                self.state.stage.cur_byte = Some(i);
                let mut last_len = 0;
                for token in &auto {
                    if token.len() > len - i
                        || out[i..i + token.len()] == token[..]
                        || !eff_span(eff_map, i, token.len())
                    {
                        continue;
                    }
                    last_len = token.len();
                    out[i..i + last_len].copy_from_slice(token);
                    if self.run_candidate(out)? {
                        return Ok(true);
                    }
                }
                out[i..i + last_len].copy_from_slice(&in_buf[i..i + last_len]);
            }
            self.finish_stage(orig_hit_cnt);
        }

        Ok(false)
    }

    /// Havoc on the entry itself, then on splices with other entries.
    fn random_stages(&mut self, idx: usize, in_buf: &[u8], perf: u32) -> Result<bool, FuzzError> {
        let orig_perf = perf;
        let mut perf = perf;
        let mut splice_cycle = 0;
        let mut base = in_buf.to_vec();

        loop {
            let splicing = self.state.stage.splicing_with.is_some();
            if self.havoc_stage(&base, &mut perf, orig_perf, splicing)? {
                return Ok(true);
            }

            let spliced = loop {
                if !(self.state.use_splicing
                    && splice_cycle < SPLICE_CYCLES
                    && self.state.queue.len() > 1
                    && in_buf.len() > 1)
                {
                    break None;
                }
                splice_cycle += 1;
                if let Some(found) = self.try_splice(idx, in_buf)? {
                    break Some(found);
                }
            };

            match spliced {
                Some((buf, with)) => {
                    base = buf;
                    self.state.stage.splicing_with = Some(with);
                }
                None => return Ok(false),
            }
        }
    }

    fn havoc_stage(
        &mut self,
        base: &[u8],
        perf: &mut u32,
        orig_perf: u32,
        splicing: bool,
    ) -> Result<bool, FuzzError> {
        let havoc_div = self.state.havoc_div.max(1);
        let (kind, cycles) = if splicing {
            (StageKind::Splice, SPLICE_HAVOC * orig_perf / havoc_div / 100)
        } else {
            (StageKind::Havoc, HAVOC_CYCLES * *perf / havoc_div / 100)
        };
        let mut stage_max = cycles.max(HAVOC_MIN);
        let perf_cap = self.state.tuning.max_mult.saturating_mul(100);

        let orig_hit_cnt = self.begin_stage(kind, u64::from(stage_max));
        let mut havoc = Havoc::new(self.state.queue_cycle, self.state.run_over10m());
        let mut havoc_queued = self.state.queue.len();
        let mut out = Vec::with_capacity(base.len() * 2);

        let mut cur = 0;
        while cur < stage_max {
            out.clear();
            out.extend_from_slice(base);
            let stack = havoc.mutate(&mut out, &mut self.state.rng, &self.state.extras);
            self.state.stage.stack = stack;

            if self.run_candidate(&out)? {
                return Ok(true);
            }

            // A find makes this entry worth more cycles.
            if self.state.queue.len() != havoc_queued {
                if *perf <= perf_cap {
                    stage_max *= 2;
                    *perf *= 2;
                }
                havoc_queued = self.state.queue.len();
            }
            cur += 1;
        }
        self.state.stage.max = u64::from(stage_max);
        self.finish_stage(orig_hit_cnt);
        Ok(false)
    }

    /// Crosses `in_buf` with a random other entry at a point between their
    /// first and last differing bytes.
    fn try_splice(&mut self, idx: usize, in_buf: &[u8]) -> Result<Option<(Vec<u8>, usize)>, FuzzError> {
        let queued = self.state.queue.len();
        let mut tid = loop {
            let tid = self.state.rng.random_range(0..queued);
            if tid != idx {
                break tid;
            }
        };
        while tid < queued && (tid == idx || self.state.queue.entry(tid)?.len < 2) {
            tid += 1;
        }
        if tid == queued {
            return Ok(None);
        }

        let target = self.state.queue.read_input(tid)?;
        let (f_diff, l_diff) = match locate_diffs(in_buf, &target) {
            Some((f, l)) if l >= 2 && f != l => (f, l),
            _ => return Ok(None),
        };

        let split_at = f_diff + self.state.rng.random_range(0..l_diff - f_diff);
        let mut spliced = Vec::with_capacity(target.len());
        spliced.extend_from_slice(&in_buf[..split_at]);
        spliced.extend_from_slice(&target[split_at..]);
        Ok(Some((spliced, tid)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::mock::MockExecutor;
    use crate::extras::Extra;
    use crate::fuzzer::tests::{mock_fuzzer, mock_fuzzer_with};
    use crate::queue::Marker;

    #[test]
    fn effector_helpers() {
        assert_eq!(eff_alen(1), 1);
        assert_eq!(eff_alen(8), 1);
        assert_eq!(eff_alen(9), 2);
        let map = [1, 0, 0, 1];
        assert!(eff_span(&map, 0, 1));
        assert!(!eff_span(&map, 8, 16));
        assert!(eff_span(&map, 14, 12));
    }

    #[test]
    fn deterministic_round_mines_tokens() {
        let exec = MockExecutor::new(|input, trace| {
            trace[0] = 1;
            if input.get(2..7) == Some(&b"MAGIC"[..]) {
                trace[1] = 1;
            }
            Outcome::None
        });
        let (_dir, mut fuzzer) = mock_fuzzer_with(exec, &[b"xxMAGICxx"], |_| {});
        fuzzer.setup().unwrap();
        fuzzer.perform_dry_run().unwrap();

        assert!(!fuzzer.fuzz_one().unwrap());

        assert!(fuzzer.state.extras.auto.iter().any(|e| e.data == b"MAGIC"));
        let entry = fuzzer.state.queue.get(0).unwrap();
        assert!(entry.trim_done);
        assert!(entry.passed_det);
        assert!(entry.was_fuzzed);
        assert!(fuzzer.state.queue.has_marker(0, Marker::DeterministicDone));

        let cycles = &fuzzer.state.counters.stage_cycles;
        assert_eq!(cycles[StageKind::Flip1.index()], entry.len as u64 * 8);
        assert_eq!(cycles[StageKind::Flip2.index()], entry.len as u64 * 8 - 1);
        assert_eq!(cycles[StageKind::Flip8.index()], entry.len as u64);
        assert!(cycles[StageKind::ExtrasAO.index()] > 0);
        assert_eq!(cycles[StageKind::Havoc.index()], u64::from(HAVOC_CYCLES));
    }

    #[test]
    fn effector_map_prunes_inert_regions() {
        let exec = MockExecutor::new(|input, trace| {
            trace[usize::from(input[0])] = 1;
            trace[300] = 1;
            Outcome::None
        });
        let seed = vec![b'A'; 256];
        let (_dir, mut fuzzer) = mock_fuzzer_with(exec, &[&seed], |_| {});
        fuzzer.setup().unwrap();
        fuzzer.perform_dry_run().unwrap();
        fuzzer.state.queue.get_mut(0).unwrap().trim_done = true;

        fuzzer.fuzz_one().unwrap();

        // Only the first and last 8-byte blocks stay effective.
        let arith8 = fuzzer.state.counters.stage_cycles[StageKind::Arith8.index()];
        assert!(arith8 > 0);
        assert!(arith8 <= 16 * 2 * u64::from(ARITH_MAX), "arith8 ran {arith8} times");
        let flip8 = fuzzer.state.counters.stage_cycles[StageKind::Flip8.index()];
        assert_eq!(flip8, 256);
    }

    #[test]
    fn user_tokens_are_overwritten_in_place() {
        let exec = MockExecutor::new(|input, trace| {
            trace[0] = 1;
            if input.starts_with(b"GET") {
                trace[1] = 1;
            }
            Outcome::None
        });
        let (_dir, mut fuzzer) = mock_fuzzer_with(exec, &[b"xxxx"], |_| {});
        fuzzer.setup().unwrap();
        fuzzer.state.extras.user.push(Extra {
            data: b"GET".to_vec(),
            hit_cnt: 0,
        });
        fuzzer.perform_dry_run().unwrap();
        fuzzer.fuzz_one().unwrap();

        let found = fuzzer
            .state
            .queue
            .iter()
            .map(|e| e.file_name())
            .find(|n| n.contains("op:ext_UO"))
            .unwrap();
        assert_eq!(found, "id:000001,src:000000,op:ext_UO,pos:0,+cov");
        assert_eq!(fuzzer.state.queue.read_input(1).unwrap(), b"GETx");
        assert_eq!(fuzzer.state.counters.stage_finds[StageKind::ExtrasUO.index()], 1);
    }

    #[test]
    fn skip_deterministic_goes_straight_to_havoc() {
        let (_dir, mut fuzzer) = mock_fuzzer(&[b"abcdef"], |c| c.fuzzer.skip_deterministic = true);
        fuzzer.setup().unwrap();
        fuzzer.perform_dry_run().unwrap();
        fuzzer.fuzz_one().unwrap();

        let cycles = &fuzzer.state.counters.stage_cycles;
        assert_eq!(cycles[StageKind::Flip1.index()], 0);
        assert!(cycles[StageKind::Havoc.index()] >= u64::from(HAVOC_MIN));
        assert!(!fuzzer.state.queue.get(0).unwrap().passed_det);
        assert!(fuzzer.state.queue.get(0).unwrap().was_fuzzed);
    }

    #[test]
    fn failed_calibration_skips_the_entry() {
        let (_dir, mut fuzzer) = mock_fuzzer(&[b"~hang", b"fine"], |c| {
            c.target.skip_hangs_in_dry_run = true;
        });
        fuzzer.setup().unwrap();
        fuzzer.perform_dry_run().unwrap();

        fuzzer.state.current_entry = 0;
        assert!(fuzzer.fuzz_one().unwrap());
        assert_eq!(fuzzer.state.counters.cur_skipped_paths, 1);
        assert!(!fuzzer.state.queue.get(0).unwrap().was_fuzzed);
    }

    #[test]
    fn splice_crosses_at_a_differing_byte() {
        let (_dir, mut fuzzer) = mock_fuzzer(&[b"aaaaaaaa", b"aaaabbbb"], |_| {});
        fuzzer.setup().unwrap();

        let (buf, with) = fuzzer.try_splice(0, b"aaaaaaaa").unwrap().unwrap();
        assert_eq!(with, 1);
        assert_eq!(buf.len(), 8);
        assert!(buf.starts_with(b"aaaa"));
        assert!(buf.ends_with(b"b"));
        assert_ne!(buf, b"aaaaaaaa");
    }

    #[test]
    fn splice_needs_a_real_difference() {
        let (_dir, mut fuzzer) = mock_fuzzer(&[b"same bytes", b"same bytes"], |_| {});
        fuzzer.setup().unwrap();
        assert!(fuzzer.try_splice(0, b"same bytes").unwrap().is_none());
    }

    #[test]
    fn abandoned_round_is_reported_as_skipped() {
        let (_dir, mut fuzzer) = mock_fuzzer(&[b"abcdef"], |_| {});
        fuzzer.setup().unwrap();
        fuzzer.perform_dry_run().unwrap();
        fuzzer.control.request_skip();
        assert!(fuzzer.fuzz_one().unwrap());
        assert_eq!(fuzzer.state.counters.cur_skipped_paths, 1);
        // Not stopping and calibrated, so the round still counts as fuzzed.
        assert!(fuzzer.state.queue.get(0).unwrap().was_fuzzed);
    }
}
