//! Bucket geometry of the five-level wheel.
//!
//! Level 0 resolves single ticks over 256 buckets; each of the four levels
//! above it has 64 buckets spanning 64 times the range of the level below.
//! Indices are taken from the bits of a timer's absolute expiry, so a bucket
//! never has to be rescanned until the counter reaches it.

/// Absolute or relative time in wheel ticks.
pub type Tick = u64;

pub const NEAR_BITS: u32 = 8;
pub const FAR_BITS: u32 = 6;
pub const NEAR_BUCKETS: usize = 1 << NEAR_BITS;
pub const FAR_BUCKETS: usize = 1 << FAR_BITS;
pub const NEAR_MASK: Tick = NEAR_BUCKETS as Tick - 1;
pub const FAR_MASK: Tick = FAR_BUCKETS as Tick - 1;
pub const LEVELS: usize = 5;

/// Largest distance a timer can be placed at; anything further is clamped.
pub const HORIZON: Tick = 0xFFFF_FFFF;

/// Bit offset of the bucket index for `level`.
pub const fn shift(level: usize) -> u32 {
    if level == 0 {
        0
    } else {
        NEAR_BITS + FAR_BITS * (level as u32 - 1)
    }
}

/// Exclusive upper bound of the distances held by `level`.
pub const fn span(level: usize) -> Tick {
    1 << (NEAR_BITS + FAR_BITS * level as u32)
}

const _: () = assert!(shift(LEVELS - 1) + FAR_BITS == 32);
const _: () = assert!(span(LEVELS - 2) < HORIZON);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub level: usize,
    pub bucket: usize,
}

impl Slot {
    pub const fn new(level: usize, bucket: usize) -> Self {
        Self { level, bucket }
    }
}

/// Head of an intrusive FIFO list threaded through the timer slab.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    pub head: Option<usize>,
    pub tail: Option<usize>,
    pub len: usize,
}

pub struct Levels {
    levels: [Vec<Bucket>; LEVELS],
}

impl Levels {
    pub fn new() -> Self {
        let levels = std::array::from_fn(|level| {
            let size = if level == 0 { NEAR_BUCKETS } else { FAR_BUCKETS };
            vec![Bucket::default(); size]
        });
        Self { levels }
    }

    pub fn bucket(&self, slot: Slot) -> &Bucket {
        &self.levels[slot.level][slot.bucket]
    }

    pub fn bucket_mut(&mut self, slot: Slot) -> &mut Bucket {
        &mut self.levels[slot.level][slot.bucket]
    }

    /// Detach the bucket at `slot`, leaving an empty one in its place.
    pub fn take(&mut self, slot: Slot) -> Bucket {
        std::mem::take(self.bucket_mut(slot))
    }

    #[cfg(test)]
    pub fn bucket_count(&self, level: usize) -> usize {
        self.levels[level].len()
    }
}

/// Index of the bucket at `level` the counter `now` currently points to.
pub fn cursor(now: Tick, level: usize) -> usize {
    let mask = if level == 0 { NEAR_MASK } else { FAR_MASK };
    ((now >> shift(level)) & mask) as usize
}

/// Pick the bucket for a timer expiring at `expiry` while the counter reads
/// `now`.
///
/// The distance is computed with wrapping arithmetic and read as signed, so a
/// timer that is already due lands in the bucket the next tick processes.
pub fn placement(now: Tick, expiry: Tick) -> Slot {
    let mut idx = expiry.wrapping_sub(now);

    if (idx as i64) < 0 {
        return Slot::new(0, cursor(now, 0));
    }

    for level in 0..LEVELS - 1 {
        if idx < span(level) {
            return Slot::new(level, cursor(expiry, level));
        }
    }

    let mut expiry = expiry;
    if idx > HORIZON {
        idx = HORIZON;
        expiry = now.wrapping_add(idx);
    }

    Slot::new(LEVELS - 1, cursor(expiry, LEVELS - 1))
}
