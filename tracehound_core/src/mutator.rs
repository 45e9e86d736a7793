use crate::extras::Extras;
use rand::Rng;

/// Largest input the mutation stages will produce.
pub const MAX_FILE: usize = 1024 * 1024;
/// Largest delta tried by the arithmetic stages.
pub const ARITH_MAX: u32 = 35;

pub const HAVOC_BLK_SMALL: usize = 32;
pub const HAVOC_BLK_MEDIUM: usize = 128;
pub const HAVOC_BLK_LARGE: usize = 1500;
pub const HAVOC_BLK_XL: usize = 32768;
/// Havoc stacks between 2 and `1 << HAVOC_STACK_POW2` operations per trial.
pub const HAVOC_STACK_POW2: u32 = 7;

pub const INTERESTING_8: [i8; 9] = [-128, -1, 0, 1, 16, 32, 64, 100, 127];

pub const INTERESTING_16: [i16; 19] = [
    -128, -1, 0, 1, 16, 32, 64, 100, 127, //
    -32768, -129, 128, 255, 256, 512, 1000, 1024, 4096, 32767,
];

pub const INTERESTING_32: [i32; 27] = [
    -128,
    -1,
    0,
    1,
    16,
    32,
    64,
    100,
    127,
    -32768,
    -129,
    128,
    255,
    256,
    512,
    1000,
    1024,
    4096,
    32767,
    -2147483648,
    -100663046,
    -32769,
    32768,
    65535,
    65536,
    100663045,
    2147483647,
];

/// Whether `xor_val` (old ^ new) is a pattern the walking bit or byte flips
/// already produce: 1, 2 or 4 adjacent bits anywhere, or 1, 2 or 4 whole
/// bytes at a byte boundary.
pub fn could_be_bitflip(mut xor_val: u32) -> bool {
    if xor_val == 0 {
        return true;
    }

    let sh = xor_val.trailing_zeros();
    xor_val >>= sh;

    if matches!(xor_val, 1 | 3 | 15) {
        return true;
    }
    if sh & 7 != 0 {
        return false;
    }
    matches!(xor_val, 0xff | 0xffff | 0xffff_ffff)
}

/// Whether `new_val` is reachable from `old_val` by the arithmetic stages,
/// looking at `blen`-byte values in both byte orders.
pub fn could_be_arith(mut old_val: u32, mut new_val: u32, blen: u8) -> bool {
    if old_val == new_val {
        return true;
    }

    let within = |d: u32| d <= ARITH_MAX;

    let mut diffs = 0;
    let (mut ov, mut nv) = (0u32, 0u32);
    for i in 0..u32::from(blen) {
        let a = (old_val >> (8 * i)) as u8;
        let b = (new_val >> (8 * i)) as u8;
        if a != b {
            diffs += 1;
            ov = u32::from(a);
            nv = u32::from(b);
        }
    }
    if diffs == 1
        && (within(u32::from((ov as u8).wrapping_sub(nv as u8)))
            || within(u32::from((nv as u8).wrapping_sub(ov as u8))))
    {
        return true;
    }

    if blen == 1 {
        return false;
    }

    diffs = 0;
    for i in 0..u32::from(blen / 2) {
        let a = (old_val >> (16 * i)) as u16;
        let b = (new_val >> (16 * i)) as u16;
        if a != b {
            diffs += 1;
            ov = u32::from(a);
            nv = u32::from(b);
        }
    }
    if diffs == 1 {
        let (o, n) = (ov as u16, nv as u16);
        if within(u32::from(o.wrapping_sub(n))) || within(u32::from(n.wrapping_sub(o))) {
            return true;
        }
        let (o, n) = (o.swap_bytes(), n.swap_bytes());
        if within(u32::from(o.wrapping_sub(n))) || within(u32::from(n.wrapping_sub(o))) {
            return true;
        }
    }

    if blen == 4 {
        if within(old_val.wrapping_sub(new_val)) || within(new_val.wrapping_sub(old_val)) {
            return true;
        }
        old_val = old_val.swap_bytes();
        new_val = new_val.swap_bytes();
        if within(old_val.wrapping_sub(new_val)) || within(new_val.wrapping_sub(old_val)) {
            return true;
        }
    }

    false
}

/// Whether `new_val` is reachable by an interesting-value substitution of
/// a shorter width, or of the same width in little-endian order when
/// `check_le` is set (used while testing big-endian candidates).
pub fn could_be_interest(old_val: u32, new_val: u32, blen: u8, check_le: bool) -> bool {
    if old_val == new_val {
        return true;
    }

    for i in 0..u32::from(blen) {
        for &v in &INTERESTING_8 {
            let tval = (old_val & !(0xffu32 << (i * 8))) | (u32::from(v as u8) << (i * 8));
            if new_val == tval {
                return true;
            }
        }
    }

    if blen == 2 && !check_le {
        return false;
    }

    for i in 0..u32::from(blen).saturating_sub(1) {
        for &v in &INTERESTING_16 {
            let mask = !(0xffffu32.wrapping_shl(i * 8));
            let tval = (old_val & mask) | (u32::from(v as u16) << (i * 8));
            if new_val == tval {
                return true;
            }
            if blen > 2 {
                let tval = (old_val & mask) | (u32::from((v as u16).swap_bytes()) << (i * 8));
                if new_val == tval {
                    return true;
                }
            }
        }
    }

    if blen == 4 && check_le && INTERESTING_32.iter().any(|&v| new_val == v as u32) {
        return true;
    }

    false
}

pub fn read_u16(buf: &[u8], pos: usize) -> u16 {
    u16::from_le_bytes([buf[pos], buf[pos + 1]])
}

pub fn write_u16(buf: &mut [u8], pos: usize, v: u16) {
    buf[pos..pos + 2].copy_from_slice(&v.to_le_bytes());
}

pub fn read_u32(buf: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]])
}

pub fn write_u32(buf: &mut [u8], pos: usize, v: u32) {
    buf[pos..pos + 4].copy_from_slice(&v.to_le_bytes());
}

/// Flips bit `bit` counting from the most significant bit of byte 0.
pub fn flip_bit(buf: &mut [u8], bit: usize) {
    buf[bit >> 3] ^= 128 >> (bit & 7);
}

/// First and last offsets at which `a` and `b` differ, over their common
/// prefix length.
pub fn locate_diffs(a: &[u8], b: &[u8]) -> Option<(usize, usize)> {
    let mut first = None;
    let mut last = None;
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        if x != y {
            first.get_or_insert(i);
            last = Some(i);
        }
    }
    first.zip(last)
}

/// Transforms a byte buffer in place.
///
/// Implementations may grow or shrink the buffer; they never leave it empty
/// unless it started empty.
pub trait Mutator<R: Rng + ?Sized> {
    /// Applies one round of mutation and returns how many elementary edits
    /// were stacked.
    fn mutate(&mut self, buf: &mut Vec<u8>, rng: &mut R, extras: &Extras) -> u32;
}

/// Random stacked edits: the havoc stage's elementary operations.
///
/// Block sizes grow with the number of completed queue cycles, and the
/// largest blocks only appear once the run has been going for ten minutes.
#[derive(Debug, Clone, Copy)]
pub struct Havoc {
    pub queue_cycle: u64,
    pub run_over10m: bool,
}

/// Number of base operations; two dictionary operations follow when tokens
/// exist.
pub const HAVOC_BASE_OPS: u32 = 15;

impl Havoc {
    pub fn new(queue_cycle: u64, run_over10m: bool) -> Self {
        Self {
            queue_cycle,
            run_over10m,
        }
    }

    /// Picks a block length no larger than `limit` (which must be positive).
    pub fn choose_block_len<R: Rng + ?Sized>(&self, rng: &mut R, limit: usize) -> usize {
        let rlim = if self.run_over10m {
            self.queue_cycle.clamp(1, 3)
        } else {
            1
        };

        let (mut min, max) = match rng.random_range(0..rlim) {
            0 => (1, HAVOC_BLK_SMALL),
            1 => (HAVOC_BLK_SMALL, HAVOC_BLK_MEDIUM),
            _ if rng.random_range(0..10) != 0 => (HAVOC_BLK_MEDIUM, HAVOC_BLK_LARGE),
            _ => (HAVOC_BLK_LARGE, HAVOC_BLK_XL),
        };

        if min >= limit {
            min = 1;
        }
        min + rng.random_range(0..=max.min(limit) - min)
    }

    pub fn stack_depth<R: Rng + ?Sized>(rng: &mut R) -> u32 {
        1 << (1 + rng.random_range(0..HAVOC_STACK_POW2))
    }

    /// Applies elementary operation `op` to `buf`. Operations whose length
    /// preconditions do not hold leave the buffer untouched.
    pub fn apply<R: Rng + ?Sized>(&self, op: u32, buf: &mut Vec<u8>, rng: &mut R, extras: &Extras) {
        let len = buf.len();
        if len == 0 {
            return;
        }

        match op {
            0 => flip_bit(buf, rng.random_range(0..len << 3)),
            1 => {
                let v = INTERESTING_8[rng.random_range(0..INTERESTING_8.len())];
                buf[rng.random_range(0..len)] = v as u8;
            }
            2 if len >= 2 => {
                let v = INTERESTING_16[rng.random_range(0..INTERESTING_16.len())] as u16;
                let pos = rng.random_range(0..len - 1);
                let v = if rng.random_bool(0.5) { v } else { v.swap_bytes() };
                write_u16(buf, pos, v);
            }
            3 if len >= 4 => {
                let v = INTERESTING_32[rng.random_range(0..INTERESTING_32.len())] as u32;
                let pos = rng.random_range(0..len - 3);
                let v = if rng.random_bool(0.5) { v } else { v.swap_bytes() };
                write_u32(buf, pos, v);
            }
            4 | 5 => {
                let pos = rng.random_range(0..len);
                let delta = 1 + rng.random_range(0..ARITH_MAX) as u8;
                buf[pos] = if op == 4 {
                    buf[pos].wrapping_sub(delta)
                } else {
                    buf[pos].wrapping_add(delta)
                };
            }
            6 | 7 if len >= 2 => {
                let pos = rng.random_range(0..len - 1);
                let delta = 1 + rng.random_range(0..ARITH_MAX) as u16;
                let swap = !rng.random_bool(0.5);
                let mut v = read_u16(buf, pos);
                if swap {
                    v = v.swap_bytes();
                }
                v = if op == 6 {
                    v.wrapping_sub(delta)
                } else {
                    v.wrapping_add(delta)
                };
                write_u16(buf, pos, if swap { v.swap_bytes() } else { v });
            }
            8 | 9 if len >= 4 => {
                let pos = rng.random_range(0..len - 3);
                let delta = 1 + rng.random_range(0..ARITH_MAX);
                let swap = !rng.random_bool(0.5);
                let mut v = read_u32(buf, pos);
                if swap {
                    v = v.swap_bytes();
                }
                v = if op == 8 {
                    v.wrapping_sub(delta)
                } else {
                    v.wrapping_add(delta)
                };
                write_u32(buf, pos, if swap { v.swap_bytes() } else { v });
            }
            10 => {
                let pos = rng.random_range(0..len);
                buf[pos] ^= 1 + rng.random_range(0..255u32) as u8;
            }
            // Deletion is twice as likely as the other block operations.
            11 | 12 if len >= 2 => {
                let del_len = self.choose_block_len(rng, len - 1);
                let del_from = rng.random_range(0..=len - del_len);
                buf.drain(del_from..del_from + del_len);
            }
            // Clone a chunk (75%) or insert a run of one random byte (25%).
            13 if len + HAVOC_BLK_LARGE < MAX_FILE => {
                let clone_len = self.choose_block_len(rng, len);
                let clone_from = rng.random_range(0..=len - clone_len);
                let clone_to = rng.random_range(0..len);
                let block: Vec<u8> = if rng.random_range(0..4) != 0 {
                    buf[clone_from..clone_from + clone_len].to_vec()
                } else {
                    vec![rng.random::<u8>(); clone_len]
                };
                buf.splice(clone_to..clone_to, block);
            }
            14 if len >= 2 => {
                let copy_len = self.choose_block_len(rng, len - 1);
                let copy_from = rng.random_range(0..=len - copy_len);
                let copy_to = rng.random_range(0..=len - copy_len);
                if rng.random_range(0..4) != 0 {
                    if copy_from != copy_to {
                        buf.copy_within(copy_from..copy_from + copy_len, copy_to);
                    }
                } else {
                    buf[copy_to..copy_to + copy_len].fill(rng.random::<u8>());
                }
            }
            15 => {
                if let Some(token) = pick_token(extras, rng) {
                    if token.len() <= len {
                        let at = rng.random_range(0..=len - token.len());
                        buf[at..at + token.len()].copy_from_slice(token);
                    }
                }
            }
            16 => {
                if let Some(token) = pick_token(extras, rng) {
                    if len + token.len() < MAX_FILE {
                        let at = rng.random_range(0..=len);
                        buf.splice(at..at, token.iter().copied());
                    }
                }
            }
            _ => {}
        }
    }

    /// Number of operations to choose from, given the dictionary state.
    pub fn op_count(extras: &Extras) -> u32 {
        if extras.is_empty() {
            HAVOC_BASE_OPS
        } else {
            HAVOC_BASE_OPS + 2
        }
    }
}

/// Auto tokens are preferred half of the time when both kinds exist.
fn pick_token<'a, R: Rng + ?Sized>(extras: &'a Extras, rng: &mut R) -> Option<&'a [u8]> {
    let use_auto = extras.user.is_empty() || (!extras.auto.is_empty() && rng.random_bool(0.5));
    let pool = if use_auto { &extras.auto } else { &extras.user };
    if pool.is_empty() {
        return None;
    }
    Some(&pool[rng.random_range(0..pool.len())].data)
}

impl<R: Rng + ?Sized> Mutator<R> for Havoc {
    fn mutate(&mut self, buf: &mut Vec<u8>, rng: &mut R, extras: &Extras) -> u32 {
        let stack = Self::stack_depth(rng);
        let ops = Self::op_count(extras);
        for _ in 0..stack {
            let op = rng.random_range(0..ops);
            self.apply(op, buf, rng, extras);
        }
        stack
    }
}
