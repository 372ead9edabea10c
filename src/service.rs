use crate::{
    clock::Clock,
    config::{Drive, WheelConfig},
    dispatch::{self, PanicHook},
    error::WheelError,
    store::{Expired, Store},
    timer::{Callback, TimerHandle, TimerNode},
    wheel::Tick,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::{
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
    },
    thread,
    time::{Duration, Instant},
};

/// Hierarchical timing wheel.
///
/// Cloning is cheap and every clone drives the same wheel. Timers fire on
/// their own dispatch thread, never on the ticking thread, so a slow callback
/// delays neither later ticks nor other callers.
#[derive(Clone)]
pub struct Wheel {
    shared: Arc<Shared>,
}

/// Non-owning reference to a [`Wheel`], held by callbacks stored inside it.
pub(crate) struct WeakWheel {
    shared: Weak<Shared>,
}

impl WeakWheel {
    pub(crate) fn upgrade(&self) -> Option<Wheel> {
        self.shared.upgrade().map(|shared| Wheel { shared })
    }
}

struct Shared {
    store: Mutex<Store>,
    tick: Duration,
    clock: Arc<dyn Clock>,
    on_panic: Option<PanicHook>,
    thread_name: String,
    stopped: AtomicBool,
    quit: Mutex<Option<Sender<()>>>,
}

impl Wheel {
    pub fn new(tick: Duration) -> Result<Self, WheelError> {
        Self::with_config(WheelConfig::new(tick))
    }

    pub fn with_config(config: WheelConfig) -> Result<Self, WheelError> {
        config.validate()?;

        let (quit_sender, quit_receiver) = mpsc::channel();
        let shared = Arc::new(Shared {
            store: Mutex::new(Store::new()),
            tick: config.tick,
            clock: config.clock,
            on_panic: config.on_panic,
            thread_name: config.thread_name,
            stopped: AtomicBool::new(false),
            quit: Mutex::new(Some(quit_sender)),
        });

        if config.drive == Drive::Background {
            let weak = Arc::downgrade(&shared);
            let tick = shared.tick;
            thread::Builder::new()
                .name(shared.thread_name.clone())
                .spawn(move || run(weak, tick, quit_receiver))?;
        }

        tracing::debug!(tick = ?shared.tick, drive = ?config.drive, "timing wheel started");
        Ok(Self { shared })
    }

    /// Schedule `callback` after `delay`, then every `period` if it is
    /// non-zero. A non-zero period shorter than the resolution repeats every
    /// tick.
    pub fn schedule<F>(&self, delay: Duration, period: Duration, callback: F) -> TimerHandle
    where
        F: Fn(DateTime<Utc>) + Send + Sync + 'static,
    {
        self.schedule_callback(delay, period, Arc::new(callback))
    }

    pub fn schedule_once<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: Fn(DateTime<Utc>) + Send + Sync + 'static,
    {
        self.schedule(delay, Duration::ZERO, callback)
    }

    pub fn schedule_repeating<F>(&self, interval: Duration, callback: F) -> TimerHandle
    where
        F: Fn(DateTime<Utc>) + Send + Sync + 'static,
    {
        self.schedule(interval, interval, callback)
    }

    pub(crate) fn schedule_callback(
        &self,
        delay: Duration,
        period: Duration,
        callback: Callback,
    ) -> TimerHandle {
        let delay = self.ticks(delay);
        let period = self.period_ticks(period);

        let mut store = self.shared.store.lock();
        let node = TimerNode::new(store.now().wrapping_add(delay), period, callback);
        store.insert(node)
    }

    /// Cancel a timer. Returns `false` if it already fired or was cancelled.
    ///
    /// A cancel racing with the tick that expires the timer may lose, in
    /// which case the callback still runs once.
    pub fn cancel(&self, handle: &TimerHandle) -> bool {
        self.shared.store.lock().remove(handle)
    }

    /// Move a pending timer so it expires `delay` from now, repeating every
    /// `period`. Returns `false` if the timer is no longer pending.
    pub fn reschedule(&self, handle: &TimerHandle, delay: Duration, period: Duration) -> bool {
        let delay = self.ticks(delay);
        let period = self.period_ticks(period);

        let mut store = self.shared.store.lock();
        let expiry = store.now().wrapping_add(delay);
        store.reset(handle, expiry, period)
    }

    /// Absolute tick the timer expires at, if it is still scheduled.
    pub fn expiry(&self, handle: &TimerHandle) -> Option<Tick> {
        self.shared.store.lock().expiry(handle)
    }

    pub fn is_active(&self, handle: &TimerHandle) -> bool {
        self.shared.store.lock().contains(handle)
    }

    pub fn len(&self) -> usize {
        self.shared.store.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current value of the tick counter.
    pub fn now(&self) -> Tick {
        self.shared.store.lock().now()
    }

    pub fn resolution(&self) -> Duration {
        self.shared.tick
    }

    /// Run a single tick and return the number of timers it expired.
    ///
    /// Background wheels call this from their own thread; manual wheels
    /// rely on the owner to call it once per resolution.
    pub fn advance(&self) -> usize {
        self.shared.on_tick()
    }

    /// Halt ticking. Timers still pending are abandoned, and callbacks already
    /// handed to dispatch may finish after this returns.
    pub fn stop(&self) {
        if !self.shared.stopped.swap(true, Ordering::AcqRel) {
            drop(self.shared.quit.lock().take());
            tracing::debug!(now = self.now(), pending = self.len(), "timing wheel stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn downgrade(&self) -> WeakWheel {
        WeakWheel {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub(crate) fn thread_name(&self) -> &str {
        &self.shared.thread_name
    }

    fn ticks(&self, duration: Duration) -> Tick {
        let ticks = duration.as_nanos() / self.shared.tick.as_nanos();
        // Keep the distance positive when read as signed by the placement.
        ticks.min(i64::MAX as u128) as Tick
    }

    fn period_ticks(&self, period: Duration) -> Tick {
        if period.is_zero() {
            0
        } else {
            self.ticks(period).max(1)
        }
    }
}

impl fmt::Debug for Wheel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let store = self.shared.store.lock();
        f.debug_struct("Wheel")
            .field("tick", &self.shared.tick)
            .field("now", &store.now())
            .field("timers", &store.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl Shared {
    fn on_tick(self: &Arc<Self>) -> usize {
        if self.stopped.load(Ordering::Acquire) {
            return 0;
        }

        let (batch, now) = {
            let mut store = self.store.lock();
            let batch = store.advance();
            (batch, store.now())
        };

        let expired = batch.len();
        if expired > 0 {
            tracing::trace!(tick = now, expired, "dispatching expired timers");
            let shared = Arc::clone(self);
            let name = format!("{}-dispatch", self.thread_name);
            dispatch::spawn(name, move || shared.run_batch(batch));
        }

        expired
    }

    fn run_batch(&self, batch: Vec<Expired>) {
        let now = self.clock.now();
        for expired in batch {
            dispatch::invoke(expired.id, &expired.callback, now, self.on_panic.as_ref());
            if expired.is_periodic() {
                self.store.lock().requeue(&expired);
            }
        }
    }
}

fn run(shared: Weak<Shared>, tick: Duration, quit: Receiver<()>) {
    let mut deadline = Instant::now() + tick;

    loop {
        let wait = deadline.saturating_duration_since(Instant::now());
        match quit.recv_timeout(wait) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        let Some(wheel) = shared.upgrade() else {
            break;
        };
        wheel.on_tick();
        drop(wheel);

        deadline += tick;
        let now = Instant::now();
        if now >= deadline {
            tracing::warn!(behind = ?(now - deadline), "wheel tick overran, skipping missed ticks");
            deadline = now + tick;
        }
    }

    tracing::debug!("wheel thread exiting");
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::clock::tests::FakeClock;
    use std::sync::mpsc::{Receiver, channel};
    use test_case::test_case;

    pub const TICK: Duration = Duration::from_millis(10);
    pub const WAIT: Duration = Duration::from_secs(5);

    pub fn manual_wheel() -> Wheel {
        Wheel::with_config(WheelConfig::new(TICK).manual()).unwrap()
    }

    /// Poll until `condition` holds, failing the test after [`WAIT`].
    pub fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn signal_on_fire(wheel: &Wheel, delay: Duration) -> (TimerHandle, Receiver<DateTime<Utc>>) {
        let (tx, rx) = channel();
        let tx = Mutex::new(tx);
        let handle = wheel.schedule_once(delay, move |now| {
            let _ = tx.lock().send(now);
        });
        (handle, rx)
    }

    #[test]
    fn zero_tick_rejected() {
        assert!(matches!(
            Wheel::new(Duration::ZERO),
            Err(WheelError::ZeroTick)
        ));
    }

    #[test_case(Duration::ZERO, 0; "zero")]
    #[test_case(Duration::from_millis(9), 0; "below_resolution")]
    #[test_case(Duration::from_millis(50), 5; "exact")]
    #[test_case(Duration::from_millis(59), 5; "rounded_down")]
    #[test_case(Duration::MAX, i64::MAX as u64; "saturated")]
    fn durations_round_down_to_ticks(delay: Duration, expected: Tick) {
        assert_eq!(expected, manual_wheel().ticks(delay));
    }

    #[test]
    fn one_shot_fires_with_clock_time() {
        let start = DateTime::from_timestamp(0, 0).unwrap();
        let clock = Arc::new(FakeClock::new(start));
        let wheel =
            Wheel::with_config(WheelConfig::new(TICK).manual().clock(clock.clone())).unwrap();
        let (handle, rx) = signal_on_fire(&wheel, Duration::from_millis(50));

        for _ in 0..5 {
            assert_eq!(0, wheel.advance());
        }
        clock.advance(chrono::TimeDelta::milliseconds(60));
        assert_eq!(1, wheel.advance());

        let fired_at = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(start + chrono::TimeDelta::milliseconds(60), fired_at);
        assert!(!wheel.is_active(&handle));
        assert!(wheel.is_empty());
    }

    #[test]
    fn short_and_long_delays_fire_on_their_ticks() {
        let wheel = manual_wheel();
        let (_, a) = signal_on_fire(&wheel, Duration::from_millis(50));
        let (b_handle, b) = signal_on_fire(&wheel, Duration::from_millis(2000));

        let mut fired = Vec::new();
        for tick in 0..=200 {
            if wheel.advance() > 0 {
                fired.push(tick);
            }
            if tick < 200 {
                assert!(wheel.is_active(&b_handle));
            }
        }

        assert_eq!(vec![5, 200], fired);
        a.recv_timeout(WAIT).unwrap();
        b.recv_timeout(WAIT).unwrap();
    }

    #[test]
    fn cancel_before_fire_has_no_effect() {
        let wheel = manual_wheel();
        let (handle, rx) = signal_on_fire(&wheel, Duration::from_millis(30));

        assert!(wheel.cancel(&handle));
        assert!(!wheel.cancel(&handle));

        for _ in 0..10 {
            assert_eq!(0, wheel.advance());
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn cancel_after_fire_is_noop() {
        let wheel = manual_wheel();
        let (handle, rx) = signal_on_fire(&wheel, Duration::ZERO);

        assert_eq!(1, wheel.advance());
        rx.recv_timeout(WAIT).unwrap();
        assert!(!wheel.cancel(&handle));
    }

    #[test]
    fn repeating_timer_fires_every_interval() {
        let wheel = manual_wheel();
        let (tx, rx) = channel();
        let tx = Mutex::new(tx);
        let handle = wheel.schedule_repeating(Duration::from_millis(30), move |_| {
            let _ = tx.lock().send(());
        });

        let mut fired = Vec::new();
        for tick in 0..=12 {
            if wheel.advance() > 0 {
                fired.push(tick);
                rx.recv_timeout(WAIT).unwrap();
                let next = tick + 3;
                wait_until(|| wheel.expiry(&handle) == Some(next));
            }
        }
        assert_eq!(vec![3, 6, 9, 12], fired);

        assert!(wheel.cancel(&handle));
        for _ in 0..6 {
            assert_eq!(0, wheel.advance());
        }
    }

    #[test]
    fn repeating_below_resolution_ticks_every_tick() {
        let wheel = manual_wheel();
        let handle = wheel.schedule_repeating(Duration::from_millis(1), |_| {});

        assert_eq!(Some(0), wheel.expiry(&handle));
        assert_eq!(1, wheel.advance());
        wait_until(|| wheel.expiry(&handle) == Some(1));
        assert_eq!(1, wheel.advance());
    }

    #[test]
    fn reschedule_uses_current_counter() {
        let wheel = manual_wheel();
        let (handle, _rx) = signal_on_fire(&wheel, Duration::from_millis(100));

        for _ in 0..7 {
            wheel.advance();
        }

        assert!(wheel.reschedule(&handle, Duration::from_millis(40), Duration::ZERO));
        assert_eq!(Some(wheel.now() + 4), wheel.expiry(&handle));
    }

    #[test]
    fn reschedule_fired_timer_fails() {
        let wheel = manual_wheel();
        let (handle, _rx) = signal_on_fire(&wheel, Duration::ZERO);

        wheel.advance();
        assert!(!wheel.reschedule(&handle, TICK, Duration::ZERO));
    }

    #[test]
    fn panicking_callback_is_contained() {
        let reported = Arc::new(Mutex::new(Vec::new()));
        let config = WheelConfig::new(TICK).manual().on_panic({
            let reported = Arc::clone(&reported);
            move |id, message| reported.lock().push((id, message.to_owned()))
        });
        let wheel = Wheel::with_config(config).unwrap();

        let bad = wheel.schedule_repeating(TICK, |_| panic!("callback failed"));
        let (_, good) = signal_on_fire(&wheel, TICK);

        assert_eq!(0, wheel.advance());
        assert_eq!(2, wheel.advance());

        good.recv_timeout(WAIT).unwrap();
        wait_until(|| wheel.expiry(&bad) == Some(2));
        assert_eq!(
            vec![(bad.id(), "callback failed".to_owned())],
            *reported.lock()
        );
    }

    #[test]
    fn stopped_wheel_does_not_tick() {
        let wheel = manual_wheel();
        let (handle, rx) = signal_on_fire(&wheel, Duration::ZERO);

        wheel.stop();
        wheel.stop();

        assert!(wheel.is_stopped());
        assert_eq!(0, wheel.advance());
        assert_eq!(0, wheel.now());
        assert!(wheel.is_active(&handle));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn background_wheel_fires_in_real_time() {
        let wheel = Wheel::new(Duration::from_millis(2)).unwrap();
        let started = Instant::now();
        let (_, rx) = signal_on_fire(&wheel, Duration::from_millis(20));

        rx.recv_timeout(WAIT).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(18));
        wheel.stop();
    }
}
