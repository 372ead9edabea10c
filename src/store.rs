use crate::{
    timer::{Callback, TimerHandle, TimerId, TimerNode},
    wheel::{self, Bucket, LEVELS, Levels, Slot, Tick},
};
use slab::Slab;

/// A timer detached from its bucket by [`Store::advance`], ready to be run
/// outside the wheel lock.
pub(crate) struct Expired {
    pub(crate) key: usize,
    pub(crate) id: TimerId,
    pub(crate) expiry: Tick,
    pub(crate) period: Tick,
    pub(crate) epoch: u64,
    pub(crate) callback: Callback,
}

impl Expired {
    pub(crate) fn is_periodic(&self) -> bool {
        self.period > 0
    }
}

/// Timer arena plus the bucket levels, all guarded by the wheel lock.
pub(crate) struct Store {
    now: Tick,
    timers: Slab<TimerNode>,
    levels: Levels,
}

impl Store {
    pub(crate) fn new() -> Self {
        Self::starting_at(0)
    }

    pub(crate) fn starting_at(now: Tick) -> Self {
        Self {
            now,
            timers: Slab::new(),
            levels: Levels::new(),
        }
    }

    pub(crate) fn now(&self) -> Tick {
        self.now
    }

    pub(crate) fn len(&self) -> usize {
        self.timers.len()
    }

    pub(crate) fn insert(&mut self, node: TimerNode) -> TimerHandle {
        let id = node.id;
        let key = self.timers.insert(node);
        self.link(key);
        TimerHandle { key, id }
    }

    /// Cancel the timer behind `handle`. A handle to a timer that already
    /// fired or was cancelled is a no-op.
    pub(crate) fn remove(&mut self, handle: &TimerHandle) -> bool {
        if self.get(handle).is_none() {
            return false;
        }

        self.unlink(handle.key);
        self.timers.remove(handle.key);
        true
    }

    pub(crate) fn reset(&mut self, handle: &TimerHandle, expiry: Tick, period: Tick) -> bool {
        if self.get(handle).is_none() {
            return false;
        }

        self.unlink(handle.key);
        let node = &mut self.timers[handle.key];
        node.expiry = expiry;
        node.period = period;
        self.link(handle.key);
        true
    }

    pub(crate) fn expiry(&self, handle: &TimerHandle) -> Option<Tick> {
        self.get(handle).map(|node| node.expiry)
    }

    pub(crate) fn contains(&self, handle: &TimerHandle) -> bool {
        self.get(handle).is_some()
    }

    #[cfg(test)]
    pub(crate) fn slot(&self, handle: &TimerHandle) -> Option<Slot> {
        self.get(handle).and_then(|node| node.slot)
    }

    #[cfg(test)]
    pub(crate) fn bucket_len(&self, slot: Slot) -> usize {
        self.levels.bucket(slot).len
    }

    /// Run one tick: cascade when level 0 wraps, bump the counter and detach
    /// the due bucket.
    ///
    /// One-shot timers are freed here; periodic timers stay in the arena
    /// unlinked until [`Store::requeue`] puts them back.
    pub(crate) fn advance(&mut self) -> Vec<Expired> {
        let index = wheel::cursor(self.now, 0);

        if index == 0 {
            for level in 1..LEVELS {
                let cursor = wheel::cursor(self.now, level);
                self.cascade(level, cursor);
                if cursor != 0 {
                    break;
                }
            }
        }

        self.now = self.now.wrapping_add(1);

        let mut bucket = self.levels.take(Slot::new(0, index));
        let mut expired = Vec::with_capacity(bucket.len);

        while let Some(key) = bucket.head {
            let node = &mut self.timers[key];
            bucket.head = node.next.take();
            node.prev = None;
            node.slot = None;

            if node.is_periodic() {
                expired.push(Expired {
                    key,
                    id: node.id,
                    expiry: node.expiry,
                    period: node.period,
                    epoch: node.epoch,
                    callback: node.callback.clone(),
                });
            } else {
                let node = self.timers.remove(key);
                expired.push(Expired {
                    key,
                    id: node.id,
                    expiry: node.expiry,
                    period: 0,
                    epoch: node.epoch,
                    callback: node.callback,
                });
            }
        }

        expired
    }

    /// Re-arm a periodic timer after its callback ran. The next expiry is
    /// anchored to the one that fired so dispatch latency does not drift the
    /// schedule.
    ///
    /// Returns `false` when the timer was cancelled or rescheduled while in
    /// flight.
    pub(crate) fn requeue(&mut self, expired: &Expired) -> bool {
        let Some(node) = self.timers.get_mut(expired.key) else {
            return false;
        };

        if node.id != expired.id || node.epoch != expired.epoch || node.slot.is_some() {
            return false;
        }

        node.expiry = expired.expiry.wrapping_add(node.period);
        self.link(expired.key);
        true
    }

    fn get(&self, handle: &TimerHandle) -> Option<&TimerNode> {
        self.timers
            .get(handle.key)
            .filter(|node| node.id == handle.id)
    }

    /// Redistribute every timer in a coarse bucket using the current counter.
    fn cascade(&mut self, level: usize, index: usize) -> usize {
        let mut bucket = self.levels.take(Slot::new(level, index));
        let moved = bucket.len;

        while let Some(key) = bucket.head {
            let node = &mut self.timers[key];
            bucket.head = node.next.take();
            node.prev = None;
            node.slot = None;
            self.link(key);
        }

        if moved > 0 {
            tracing::trace!(level, index, moved, now = self.now, "cascaded bucket");
        }

        moved
    }

    /// Append the node to the tail of the bucket its expiry maps to.
    fn link(&mut self, key: usize) {
        let node = &self.timers[key];
        debug_assert!(node.slot.is_none());

        let slot = wheel::placement(self.now, node.expiry);
        let bucket = self.levels.bucket_mut(slot);
        let tail = bucket.tail;

        match tail {
            Some(tail) => self.timers[tail].next = Some(key),
            None => bucket.head = Some(key),
        }
        bucket.tail = Some(key);
        bucket.len += 1;

        let node = &mut self.timers[key];
        node.prev = tail;
        node.next = None;
        node.slot = Some(slot);
        node.epoch = node.epoch.wrapping_add(1);
    }

    /// Unlink the node from its recorded bucket. A node claiming a bucket
    /// that does not link it means the bookkeeping is corrupt; that is fatal.
    fn unlink(&mut self, key: usize) {
        let node = &self.timers[key];
        let Some(slot) = node.slot else {
            // In flight: detached by a tick and not yet requeued.
            return;
        };
        let (id, prev, next) = (node.id, node.prev, node.next);

        let bucket = *self.levels.bucket(slot);
        let linked_from_prev = match prev {
            Some(prev) => self.timers.get(prev).and_then(|n| n.next) == Some(key),
            None => bucket.head == Some(key),
        };
        let linked_from_next = match next {
            Some(next) => self.timers.get(next).and_then(|n| n.prev) == Some(key),
            None => bucket.tail == Some(key),
        };

        if !linked_from_prev || !linked_from_next || bucket.len == 0 {
            tracing::error!(timer = %id, ?slot, "timer missing from its recorded bucket");
            panic!("timer {id} is not linked in its recorded bucket {slot:?}");
        }

        match prev {
            Some(prev) => self.timers[prev].next = next,
            None => self.levels.bucket_mut(slot).head = next,
        }
        match next {
            Some(next) => self.timers[next].prev = prev,
            None => self.levels.bucket_mut(slot).tail = prev,
        }
        let bucket: &mut Bucket = self.levels.bucket_mut(slot);
        bucket.len -= 1;

        let node = &mut self.timers[key];
        node.prev = None;
        node.next = None;
        node.slot = None;
    }
}
