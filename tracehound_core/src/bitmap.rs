//! Coverage bitmap model.
//!
//! The instrumented target bumps one byte per control-flow edge in a shared
//! trace of [`MAP_SIZE`] bytes. Everything in this module operates on that
//! fixed-size array: bucketing raw hit counts, comparing a trace against a
//! virgin map, and the small statistics helpers used for reporting.
//!
//! The hot paths ([`classify_counts`], [`has_new_bits`]) walk the map in
//! 64-bit words and skip all-zero words. Scalar versions are kept alongside
//! and the tests check both produce identical results.

pub const MAP_SIZE_POW2: usize = 16;
pub const MAP_SIZE: usize = 1 << MAP_SIZE_POW2;
pub const MINI_SIZE: usize = MAP_SIZE >> 3;

const HASH_CONST: u32 = 0xa5b3_5705;
const WORD: usize = std::mem::size_of::<u64>();

pub type Trace = [u8; MAP_SIZE];
pub type MiniTrace = [u8; MINI_SIZE];

/// Result of comparing a trace against a virgin map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Novelty {
    None,
    CountOnly,
    NewTuple,
}

const fn build_count_class() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = match i {
            0 => 0,
            1 => 1,
            2 => 2,
            3 => 4,
            4..=7 => 8,
            8..=15 => 16,
            16..=31 => 32,
            32..=127 => 64,
            _ => 128,
        };
        i += 1;
    }
    table
}

const fn build_simplify() -> [u8; 256] {
    let mut table = [128u8; 256];
    table[0] = 1;
    table
}

static COUNT_CLASS: [u8; 256] = build_count_class();
static SIMPLIFY: [u8; 256] = build_simplify();

/// Allocates a zeroed trace on the heap.
pub fn new_trace() -> Box<Trace> {
    filled(0)
}

/// Allocates a virgin map with every bit set ("nothing seen yet").
pub fn new_virgin() -> Box<Trace> {
    filled(0xff)
}

fn filled(byte: u8) -> Box<Trace> {
    let boxed: Box<[u8]> = vec![byte; MAP_SIZE].into_boxed_slice();
    match boxed.try_into() {
        Ok(map) => map,
        Err(_) => unreachable!("vector was allocated with MAP_SIZE elements"),
    }
}

/// Quantizes raw hit counts into the eight buckets, in place.
pub fn classify_counts(trace: &mut Trace) {
    for chunk in trace.chunks_exact_mut(WORD) {
        let word = u64::from_ne_bytes([
            chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
        ]);
        if word == 0 {
            continue;
        }
        for byte in chunk.iter_mut() {
            *byte = COUNT_CLASS[*byte as usize];
        }
    }
}

pub fn classify_counts_scalar(trace: &mut Trace) {
    for byte in trace.iter_mut() {
        *byte = COUNT_CLASS[*byte as usize];
    }
}

/// Collapses a trace to hit/miss, mapping misses to 1 and hits to 128.
///
/// Used before crash and hang deduplication, where only the set of
/// reached tuples matters.
pub fn simplify_trace(trace: &mut Trace) {
    for byte in trace.iter_mut() {
        *byte = SIMPLIFY[*byte as usize];
    }
}

/// Compares `trace` against `virgin`, clearing every bit of `virgin` that
/// the trace touches.
///
/// Returns [`Novelty::NewTuple`] when some tuple was never seen before and
/// [`Novelty::CountOnly`] when only hit-count buckets changed.
pub fn has_new_bits(trace: &Trace, virgin: &mut Trace) -> Novelty {
    let mut ret = Novelty::None;

    for (cur, vir) in trace.chunks_exact(WORD).zip(virgin.chunks_exact_mut(WORD)) {
        let c = read_word(cur);
        if c == 0 {
            continue;
        }
        let v = read_word(vir);
        if c & v == 0 {
            continue;
        }

        if ret < Novelty::NewTuple {
            let fresh = cur
                .iter()
                .zip(vir.iter())
                .any(|(&cb, &vb)| cb != 0 && vb == 0xff);
            ret = if fresh { Novelty::NewTuple } else { ret.max(Novelty::CountOnly) };
        }

        vir.copy_from_slice(&(v & !c).to_ne_bytes());
    }

    ret
}

pub fn has_new_bits_scalar(trace: &Trace, virgin: &mut Trace) -> Novelty {
    let mut ret = Novelty::None;
    for (&c, v) in trace.iter().zip(virgin.iter_mut()) {
        if c & *v == 0 {
            continue;
        }
        if *v == 0xff {
            ret = Novelty::NewTuple;
        } else if ret == Novelty::None {
            ret = Novelty::CountOnly;
        }
        *v &= !c;
    }
    ret
}

fn read_word(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; WORD];
    buf.copy_from_slice(bytes);
    u64::from_ne_bytes(buf)
}

/// Number of set bits in the map.
pub fn count_bits(map: &Trace) -> u32 {
    map.iter().map(|b| b.count_ones()).sum()
}

/// Number of non-zero bytes, i.e. tuples hit by a trace.
pub fn count_bytes(map: &Trace) -> u32 {
    map.iter().filter(|&&b| b != 0).count() as u32
}

/// Number of bytes that are not 0xff; on a virgin map this is the number of
/// tuples seen so far.
pub fn count_non_255_bytes(map: &Trace) -> u32 {
    map.iter().filter(|&&b| b != 0xff).count() as u32
}

/// Builds the one-bit-per-tuple summary stored on queue entries.
pub fn minimize_bits(trace: &Trace) -> Box<MiniTrace> {
    let boxed: Box<[u8]> = vec![0u8; MINI_SIZE].into_boxed_slice();
    let mut mini: Box<MiniTrace> = match boxed.try_into() {
        Ok(m) => m,
        Err(_) => unreachable!("vector was allocated with MINI_SIZE elements"),
    };
    for (i, &b) in trace.iter().enumerate() {
        if b != 0 {
            mini[i >> 3] |= 1 << (i & 7);
        }
    }
    mini
}

#[inline]
pub fn mini_has(mini: &MiniTrace, tuple: usize) -> bool {
    mini[tuple >> 3] & (1 << (tuple & 7)) != 0
}

/// 32-bit checksum of a bucketed trace.
pub fn hash_trace(trace: &Trace) -> u32 {
    hash32(trace, HASH_CONST)
}

/// Murmur-style hash over whole 64-bit words; trailing bytes are ignored.
pub fn hash32(data: &[u8], seed: u32) -> u32 {
    let mut h1 = u64::from(seed ^ data.len() as u32);

    for chunk in data.chunks_exact(WORD) {
        let mut k1 = read_word(chunk);
        k1 = k1.wrapping_mul(0x87c3_7b91_1142_53d5);
        k1 = k1.rotate_left(31);
        k1 = k1.wrapping_mul(0x4cf5_ad43_2745_937f);

        h1 ^= k1;
        h1 = h1.rotate_left(27);
        h1 = h1.wrapping_mul(5).wrapping_add(0x52dc_e729);
    }

    h1 ^= h1 >> 33;
    h1 = h1.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h1 ^= h1 >> 33;
    h1 = h1.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h1 ^= h1 >> 33;

    h1 as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn random_trace(rng: &mut ChaCha8Rng, density: u32) -> Box<Trace> {
        let mut t = new_trace();
        for byte in t.iter_mut() {
            if rng.random_range(0..100) < density {
                *byte = rng.random();
            }
        }
        t
    }

    #[test]
    fn count_classes_match_bucket_boundaries() {
        let expected = [
            (0u8, 0u8),
            (1, 1),
            (2, 2),
            (3, 4),
            (4, 8),
            (7, 8),
            (8, 16),
            (15, 16),
            (16, 32),
            (31, 32),
            (32, 64),
            (127, 64),
            (128, 128),
            (255, 128),
        ];
        for (raw, bucket) in expected {
            assert_eq!(COUNT_CLASS[raw as usize], bucket, "raw count {raw}");
        }
    }

    #[test]
    fn classify_is_idempotent() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..4 {
            let mut t = random_trace(&mut rng, 20);
            classify_counts(&mut t);
            let once = t.clone();
            classify_counts(&mut t);
            assert_eq!(&once[..], &t[..]);
        }
    }

    #[test]
    fn word_and_scalar_classification_agree() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let mut a = random_trace(&mut rng, 5);
        let mut b = a.clone();
        classify_counts(&mut a);
        classify_counts_scalar(&mut b);
        assert_eq!(&a[..], &b[..]);
    }

    #[test]
    fn word_and_scalar_novelty_agree() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut virgin_word = new_virgin();
        let mut virgin_scalar = new_virgin();
        for _ in 0..16 {
            let mut t = random_trace(&mut rng, 2);
            classify_counts(&mut t);
            let w = has_new_bits(&t, &mut virgin_word);
            let s = has_new_bits_scalar(&t, &mut virgin_scalar);
            assert_eq!(w, s);
            assert_eq!(&virgin_word[..], &virgin_scalar[..]);
        }
    }

    #[test]
    fn identical_trace_reports_novelty_once() {
        let mut virgin = new_virgin();
        let mut t = new_trace();
        t[10] = 1;
        t[4000] = 3;
        classify_counts(&mut t);

        assert_eq!(has_new_bits(&t, &mut virgin), Novelty::NewTuple);
        assert_eq!(has_new_bits(&t, &mut virgin), Novelty::None);
    }

    #[test]
    fn changed_bucket_is_count_only() {
        let mut virgin = new_virgin();
        let mut t = new_trace();
        t[42] = 1;
        assert_eq!(has_new_bits(&t, &mut virgin), Novelty::NewTuple);

        t[42] = 2;
        assert_eq!(has_new_bits(&t, &mut virgin), Novelty::CountOnly);
        assert_eq!(has_new_bits(&t, &mut virgin), Novelty::None);
    }

    #[test]
    fn virgin_bits_never_resurrect() {
        let mut rng = ChaCha8Rng::seed_from_u64(99);
        let mut virgin = new_virgin();
        let mut seen = count_non_255_bytes(&virgin);
        for _ in 0..8 {
            let mut t = random_trace(&mut rng, 1);
            classify_counts(&mut t);
            let before = virgin.clone();
            has_new_bits(&t, &mut virgin);
            for (b, a) in before.iter().zip(virgin.iter()) {
                assert_eq!(a & !b, 0, "a cleared virgin bit came back");
            }
            let now = count_non_255_bytes(&virgin);
            assert!(now >= seen);
            seen = now;
        }
    }

    #[test]
    fn simplify_collapses_to_two_values() {
        let mut t = new_trace();
        t[0] = 5;
        t[1] = 128;
        simplify_trace(&mut t);
        assert_eq!(t[0], 128);
        assert_eq!(t[1], 128);
        assert_eq!(t[2], 1);
    }

    #[test]
    fn minimize_keeps_hit_positions_only() {
        let mut t = new_trace();
        t[0] = 1;
        t[9] = 64;
        t[MAP_SIZE - 1] = 2;
        let mini = minimize_bits(&t);
        assert!(mini_has(&mini, 0));
        assert!(mini_has(&mini, 9));
        assert!(mini_has(&mini, MAP_SIZE - 1));
        assert!(!mini_has(&mini, 1));
        assert_eq!(mini.iter().map(|b| b.count_ones()).sum::<u32>(), 3);
    }

    #[test]
    fn counting_helpers() {
        let mut t = new_trace();
        t[1] = 0b1011;
        t[2] = 0xff;
        assert_eq!(count_bits(&t), 11);
        assert_eq!(count_bytes(&t), 2);
        assert_eq!(count_non_255_bytes(&t), MAP_SIZE as u32 - 1);
    }

    #[test]
    fn hash_distinguishes_traces() {
        let mut a = new_trace();
        let b = new_trace();
        assert_eq!(hash_trace(&a), hash_trace(&b));
        a[777] = 1;
        assert_ne!(hash_trace(&a), hash_trace(&b));
    }
}
