use crate::wheel::{Slot, Tick};
use chrono::{DateTime, Utc};
use std::{fmt, sync::Arc};
use uuid::Uuid;

/// Action run when a timer fires. It receives the wall-clock time of the tick
/// that expired it; any payload is captured by the closure.
pub type Callback = Arc<dyn Fn(DateTime<Utc>) + Send + Sync>;

/// A Universally Unique Identifier (UUID) for Timers.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct TimerId(pub Uuid);

impl TimerId {
    pub fn new() -> Self {
        TimerId(Uuid::new_v4())
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TimerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Stable reference to a scheduled timer.
///
/// The slab key locates the timer in O(1); the id guards against the key
/// having been recycled for another timer after this one fired or was
/// cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    pub(crate) key: usize,
    pub(crate) id: TimerId,
}

impl TimerHandle {
    pub fn id(&self) -> TimerId {
        self.id
    }
}

pub(crate) struct TimerNode {
    pub(crate) id: TimerId,
    pub(crate) expiry: Tick,
    pub(crate) period: Tick,
    pub(crate) callback: Callback,
    pub(crate) prev: Option<usize>,
    pub(crate) next: Option<usize>,
    /// Bucket currently holding the node, `None` while a periodic timer is
    /// being dispatched.
    pub(crate) slot: Option<Slot>,
    pub(crate) epoch: u64,
}

impl TimerNode {
    pub(crate) fn new(expiry: Tick, period: Tick, callback: Callback) -> Self {
        Self {
            id: TimerId::new(),
            expiry,
            period,
            callback,
            prev: None,
            next: None,
            slot: None,
            epoch: 0,
        }
    }

    pub(crate) fn is_periodic(&self) -> bool {
        self.period > 0
    }
}

impl fmt::Debug for TimerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerNode")
            .field("id", &self.id)
            .field("expiry", &self.expiry)
            .field("period", &self.period)
            .field("slot", &self.slot)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}
