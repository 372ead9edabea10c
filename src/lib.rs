//! Hierarchical timing wheel.
//!
//! Timers are kept in five levels of buckets (256 single-tick buckets, then
//! four levels of 64 buckets, each 64 times coarser) so scheduling,
//! cancelling and ticking are all O(1) amortized. Coarse buckets cascade into
//! finer ones as their timers come due, and expired timers run on a
//! dispatch thread so slow callbacks never hold up the wheel.
//!
//! ```no_run
//! use std::time::Duration;
//! use tickwheel::Wheel;
//!
//! let wheel = Wheel::new(Duration::from_millis(10)).unwrap();
//!
//! let handle = wheel.schedule_once(Duration::from_secs(2), |now| {
//!     println!("connection timed out at {now}");
//! });
//! wheel.cancel(&handle);
//!
//! let ticker = wheel.new_ticker(Duration::from_millis(500));
//! ticker.recv();
//! wheel.stop();
//! ```

mod clock;
mod config;
mod dispatch;
mod error;
mod handle;
mod service;
mod store;
mod timer;
mod wheel;

pub use clock::{Clock, SystemClock};
pub use config::{DEFAULT_THREAD_NAME, Drive, WheelConfig};
pub use dispatch::PanicHook;
pub use error::WheelError;
pub use handle::{Ticker, Timer};
pub use service::Wheel;
pub use timer::{Callback, TimerHandle, TimerId};
pub use wheel::{HORIZON, Tick};

use chrono::{DateTime, Utc};
use std::{
    sync::{OnceLock, mpsc::Receiver},
    time::Duration,
};

/// Resolution of the process-wide wheel behind the free functions.
pub const DEFAULT_RESOLUTION: Duration = Duration::from_millis(500);

static DEFAULT_WHEEL: OnceLock<Wheel> = OnceLock::new();

/// Process-wide wheel with a [`DEFAULT_RESOLUTION`] tick, started on first
/// use.
pub fn default_wheel() -> &'static Wheel {
    DEFAULT_WHEEL.get_or_init(|| {
        Wheel::new(DEFAULT_RESOLUTION).expect("failed to start the default timing wheel")
    })
}

pub fn after(delay: Duration) -> Receiver<DateTime<Utc>> {
    default_wheel().after(delay)
}

pub fn sleep(delay: Duration) {
    default_wheel().sleep(delay)
}

pub fn tick(interval: Duration) -> Receiver<DateTime<Utc>> {
    default_wheel().tick(interval)
}

pub fn new_timer(delay: Duration) -> Timer {
    default_wheel().new_timer(delay)
}

pub fn new_ticker(interval: Duration) -> Ticker {
    default_wheel().new_ticker(interval)
}

pub fn after_func<F>(delay: Duration, f: F) -> Timer
where
    F: Fn() + Send + Sync + 'static,
{
    default_wheel().after_func(delay, f)
}

pub fn tick_func<F>(interval: Duration, f: F) -> Ticker
where
    F: Fn() + Send + Sync + 'static,
{
    default_wheel().tick_func(interval, f)
}
