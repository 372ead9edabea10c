use crate::{
    clock::{Clock, SystemClock},
    dispatch::PanicHook,
    error::WheelError,
    timer::TimerId,
};
use std::{fmt, sync::Arc, time::Duration};

pub const DEFAULT_THREAD_NAME: &str = "tickwheel";

/// Who advances the wheel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Drive {
    /// A dedicated thread ticks once per resolution.
    #[default]
    Background,
    /// The owner calls [`Wheel::advance`](crate::Wheel::advance) itself.
    Manual,
}

#[derive(Clone)]
pub struct WheelConfig {
    pub tick: Duration,
    pub drive: Drive,
    pub thread_name: String,
    pub clock: Arc<dyn Clock>,
    pub on_panic: Option<PanicHook>,
}

impl WheelConfig {
    pub fn new(tick: Duration) -> Self {
        Self {
            tick,
            drive: Drive::default(),
            thread_name: DEFAULT_THREAD_NAME.to_owned(),
            clock: Arc::new(SystemClock),
            on_panic: None,
        }
    }

    #[must_use]
    pub fn drive(mut self, drive: Drive) -> Self {
        self.drive = drive;
        self
    }

    #[must_use]
    pub fn manual(self) -> Self {
        self.drive(Drive::Manual)
    }

    /// Name of the tick thread; dispatch threads get a `-dispatch` suffix.
    #[must_use]
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Called with the timer id and message whenever a callback panics.
    #[must_use]
    pub fn on_panic<F>(mut self, hook: F) -> Self
    where
        F: Fn(TimerId, &str) + Send + Sync + 'static,
    {
        self.on_panic = Some(Arc::new(hook));
        self
    }

    pub fn validate(&self) -> Result<(), WheelError> {
        if self.tick.is_zero() {
            return Err(WheelError::ZeroTick);
        }
        if self.thread_name.is_empty() {
            return Err(WheelError::EmptyThreadName);
        }
        Ok(())
    }
}

impl fmt::Debug for WheelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WheelConfig")
            .field("tick", &self.tick)
            .field("drive", &self.drive)
            .field("thread_name", &self.thread_name)
            .field("on_panic", &self.on_panic.is_some())
            .finish_non_exhaustive()
    }
}
