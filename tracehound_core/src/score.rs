use crate::config::ScoreTuning;
use crate::queue::QueueEntry;

/// Lowest score any entry can receive.
pub const MIN_SCORE: u32 = 10;

/// Effort multiplier for one fuzzing round of `entry`, in percent.
///
/// Cheap, wide and deep entries get more havoc cycles than average ones.
/// Each call consumes part of the entry's handicap.
pub fn calculate_score(
    entry: &mut QueueEntry,
    avg_exec_us: u64,
    avg_bitmap_size: u64,
    tuning: &ScoreTuning,
) -> u32 {
    let exec_us = entry.exec_us as f64;
    let avg_exec = avg_exec_us as f64;

    let mut score = tuning
        .slow_bands
        .iter()
        .find(|(ratio, _)| exec_us * ratio > avg_exec)
        .or_else(|| {
            tuning
                .fast_bands
                .iter()
                .find(|(div, _)| exec_us * div < avg_exec)
        })
        .map_or(100.0, |&(_, s)| f64::from(s));

    let bitmap = f64::from(entry.bitmap_size);
    let avg_bitmap = avg_bitmap_size as f64;
    let coverage_mult = tuning
        .wide_bands
        .iter()
        .find(|(ratio, _)| bitmap * ratio > avg_bitmap)
        .or_else(|| {
            tuning
                .narrow_bands
                .iter()
                .find(|(div, _)| bitmap * div < avg_bitmap)
        })
        .map_or(1.0, |&(_, m)| m);
    score *= coverage_mult;

    if entry.handicap >= 4 {
        score *= f64::from(tuning.handicap_big_mult);
        entry.handicap -= 4;
    } else if entry.handicap > 0 {
        score *= f64::from(tuning.handicap_small_mult);
        entry.handicap -= 1;
    }

    let depth_mult = tuning
        .depth_bands
        .iter()
        .find(|&&(upper, _)| entry.depth <= u64::from(upper))
        .map_or(tuning.deepest_mult, |&(_, m)| m);
    score *= f64::from(depth_mult);

    let cap = tuning.max_mult.saturating_mul(100).max(MIN_SCORE);
    (score as u32).clamp(MIN_SCORE, cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn entry(exec_us: u64, bitmap_size: u32, handicap: u64, depth: u64) -> QueueEntry {
        QueueEntry {
            exec_us,
            bitmap_size,
            handicap,
            depth,
            ..QueueEntry::default()
        }
    }

    #[test]
    fn average_entry_scores_100() {
        let mut e = entry(1000, 500, 0, 1);
        assert_eq!(calculate_score(&mut e, 1000, 500, &ScoreTuning::default()), 100);
    }

    #[test]
    fn fast_entry_is_boosted_slow_entry_is_cut() {
        let tuning = ScoreTuning::default();
        assert_eq!(calculate_score(&mut entry(200, 500, 0, 1), 1000, 500, &tuning), 300);
        assert_eq!(calculate_score(&mut entry(20_000, 500, 0, 1), 1000, 500, &tuning), 10);
        assert_eq!(calculate_score(&mut entry(1500, 500, 0, 1), 1000, 500, &tuning), 75);
    }

    #[test]
    fn coverage_scales_the_score() {
        let tuning = ScoreTuning::default();
        assert_eq!(calculate_score(&mut entry(1000, 2000, 0, 1), 1000, 500, &tuning), 300);
        assert_eq!(calculate_score(&mut entry(1000, 100, 0, 1), 1000, 500, &tuning), 25);
    }

    #[test]
    fn handicap_is_consumed() {
        let tuning = ScoreTuning::default();
        let mut e = entry(1000, 500, 5, 1);
        assert_eq!(calculate_score(&mut e, 1000, 500, &tuning), 400);
        assert_eq!(e.handicap, 1);
        assert_eq!(calculate_score(&mut e, 1000, 500, &tuning), 200);
        assert_eq!(e.handicap, 0);
        assert_eq!(calculate_score(&mut e, 1000, 500, &tuning), 100);
    }

    #[test]
    fn depth_bands_apply() {
        let tuning = ScoreTuning::default();
        let score = |d| calculate_score(&mut entry(1000, 500, 0, d), 1000, 500, &tuning);
        assert_eq!(score(3), 100);
        assert_eq!(score(5), 200);
        assert_eq!(score(10), 400);
        assert_eq!(score(20), 600);
        assert_eq!(score(40), 800);
    }

    #[test]
    fn score_stays_within_bounds() {
        let tuning = ScoreTuning::default();
        let mut rng = ChaCha8Rng::seed_from_u64(77);
        for _ in 0..5000 {
            let mut e = entry(
                rng.random_range(0..1_000_000),
                rng.random_range(0..65536),
                rng.random_range(0..64),
                rng.random_range(0..100),
            );
            let s = calculate_score(
                &mut e,
                rng.random_range(1..1_000_000),
                rng.random_range(1..65536),
                &tuning,
            );
            assert!((MIN_SCORE..=tuning.max_mult * 100).contains(&s), "score {s}");
        }
    }
}
