//! Channel and closure handles built on top of [`Wheel`] timers.
//!
//! Channel handles deliver into a single-slot buffer: when the receiver has
//! not taken the previous signal, or has gone away, the new one is dropped
//! rather than queued.

use crate::{
    dispatch,
    service::{WeakWheel, Wheel},
    timer::{Callback, TimerHandle},
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::{
    sync::{
        Arc, OnceLock,
        mpsc::{self, Receiver, RecvError, TrySendError},
    },
    time::Duration,
};

fn channel_callback() -> (Callback, Receiver<DateTime<Utc>>) {
    let (sender, receiver) = mpsc::sync_channel(1);
    let callback: Callback = Arc::new(move |now: DateTime<Utc>| {
        let _ = sender.try_send(now);
    });
    (callback, receiver)
}

/// Like [`channel_callback`], but the timer cancels itself once the receiver
/// is gone. The handle is filled in after scheduling.
fn owned_channel_callback(
    wheel: WeakWheel,
) -> (Callback, Arc<OnceLock<TimerHandle>>, Receiver<DateTime<Utc>>) {
    let (sender, receiver) = mpsc::sync_channel(1);
    let registered: Arc<OnceLock<TimerHandle>> = Arc::default();
    let callback: Callback = {
        let registered = Arc::clone(&registered);
        Arc::new(move |now: DateTime<Utc>| {
            if let Err(TrySendError::Disconnected(_)) = sender.try_send(now) {
                if let (Some(wheel), Some(handle)) = (wheel.upgrade(), registered.get()) {
                    if wheel.cancel(handle) {
                        tracing::debug!(timer = %handle.id(), "tick receiver dropped, timer cancelled");
                    }
                }
            }
        })
    };
    (callback, registered, receiver)
}

/// A one-shot timer.
pub struct Timer {
    wheel: Wheel,
    handle: Mutex<TimerHandle>,
    callback: Callback,
    receiver: Option<Receiver<DateTime<Utc>>>,
}

impl Timer {
    fn start(
        wheel: &Wheel,
        delay: Duration,
        callback: Callback,
        receiver: Option<Receiver<DateTime<Utc>>>,
    ) -> Self {
        let handle = wheel.schedule_callback(delay, Duration::ZERO, callback.clone());
        Self {
            wheel: wheel.clone(),
            handle: Mutex::new(handle),
            callback,
            receiver,
        }
    }

    /// Delivery channel; `None` for timers created with
    /// [`Wheel::after_func`].
    pub fn receiver(&self) -> Option<&Receiver<DateTime<Utc>>> {
        self.receiver.as_ref()
    }

    /// Block until the timer fires. Returns `None` if the timer has no
    /// channel.
    pub fn recv(&self) -> Option<Result<DateTime<Utc>, RecvError>> {
        self.receiver.as_ref().map(Receiver::recv)
    }

    pub fn handle(&self) -> TimerHandle {
        *self.handle.lock()
    }

    /// Prevent the timer from firing. Returns `false` if it already fired or
    /// was stopped.
    pub fn stop(&self) -> bool {
        self.wheel.cancel(&self.handle.lock())
    }

    /// Make the timer fire `delay` from now. Returns `true` if the timer was
    /// still pending; otherwise it is armed again.
    pub fn reset(&self, delay: Duration) -> bool {
        let mut handle = self.handle.lock();
        if self.wheel.reschedule(&handle, delay, Duration::ZERO) {
            return true;
        }
        *handle = self
            .wheel
            .schedule_callback(delay, Duration::ZERO, self.callback.clone());
        false
    }
}

/// A periodic timer.
pub struct Ticker {
    wheel: Wheel,
    handle: Mutex<TimerHandle>,
    callback: Callback,
    receiver: Option<Receiver<DateTime<Utc>>>,
}

impl Ticker {
    fn start(
        wheel: &Wheel,
        interval: Duration,
        callback: Callback,
        receiver: Option<Receiver<DateTime<Utc>>>,
    ) -> Self {
        let handle = wheel.schedule_callback(interval, interval, callback.clone());
        Self {
            wheel: wheel.clone(),
            handle: Mutex::new(handle),
            callback,
            receiver,
        }
    }

    pub fn receiver(&self) -> Option<&Receiver<DateTime<Utc>>> {
        self.receiver.as_ref()
    }

    pub fn recv(&self) -> Option<Result<DateTime<Utc>, RecvError>> {
        self.receiver.as_ref().map(Receiver::recv)
    }

    pub fn handle(&self) -> TimerHandle {
        *self.handle.lock()
    }

    pub fn stop(&self) -> bool {
        self.wheel.cancel(&self.handle.lock())
    }

    /// Restart the ticker with a new interval, first tick `interval` from now.
    pub fn reset(&self, interval: Duration) -> bool {
        let mut handle = self.handle.lock();
        if self.wheel.reschedule(&handle, interval, interval) {
            return true;
        }
        *handle = self
            .wheel
            .schedule_callback(interval, interval, self.callback.clone());
        false
    }
}

impl Wheel {
    pub fn new_timer(&self, delay: Duration) -> Timer {
        let (callback, receiver) = channel_callback();
        Timer::start(self, delay, callback, Some(receiver))
    }

    pub fn new_ticker(&self, interval: Duration) -> Ticker {
        let (callback, receiver) = channel_callback();
        Ticker::start(self, interval, callback, Some(receiver))
    }

    /// Channel that receives the time once `delay` has passed.
    pub fn after(&self, delay: Duration) -> Receiver<DateTime<Utc>> {
        let (callback, receiver) = channel_callback();
        self.schedule_callback(delay, Duration::ZERO, callback);
        receiver
    }

    /// Block the current thread for at least `delay`, rounded to ticks.
    pub fn sleep(&self, delay: Duration) {
        let _ = self.after(delay).recv();
    }

    /// Channel that receives the time every `interval`. There is no handle to
    /// stop it with; the timer is cancelled on the first firing after the
    /// receiver is dropped. Use [`Wheel::new_ticker`] for explicit control.
    pub fn tick(&self, interval: Duration) -> Receiver<DateTime<Utc>> {
        let (callback, registered, receiver) = owned_channel_callback(self.downgrade());
        let handle = self.schedule_callback(interval, interval, callback);
        let _ = registered.set(handle);
        receiver
    }

    /// Run `f` on its own thread once `delay` has passed.
    pub fn after_func<F>(&self, delay: Duration, f: F) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        let callback = dispatch::detached(format!("{}-func", self.thread_name()), f);
        Timer::start(self, delay, callback, None)
    }

    /// Run `f` on its own thread every `interval`.
    pub fn tick_func<F>(&self, interval: Duration, f: F) -> Ticker
    where
        F: Fn() + Send + Sync + 'static,
    {
        let callback = dispatch::detached(format!("{}-func", self.thread_name()), f);
        Ticker::start(self, interval, callback, None)
    }
}
