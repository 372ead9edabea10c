use crate::timer::{Callback, TimerId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::{
    any::Any,
    io,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread,
};

/// Receives the id of a timer whose callback panicked and the panic message.
pub type PanicHook = Arc<dyn Fn(TimerId, &str) + Send + Sync>;

/// Run `callback`, containing any panic so the rest of the batch still runs.
///
/// Returns `false` if the callback panicked.
pub(crate) fn invoke(
    id: TimerId,
    callback: &Callback,
    now: DateTime<Utc>,
    hook: Option<&PanicHook>,
) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(|| callback(now))) {
        Ok(()) => true,
        Err(payload) => {
            let message = panic_message(&*payload);
            tracing::error!(timer = %id, %message, "timer callback panicked");
            if let Some(hook) = hook {
                hook(id, &message);
            }
            false
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Run `job` on a new named thread. If the thread cannot be created the job
/// runs on the caller's thread instead, so no expired timer is lost.
pub(crate) fn spawn<F>(name: String, job: F)
where
    F: FnOnce() + Send + 'static,
{
    let slot = Arc::new(Mutex::new(Some(job)));
    let spawned = Arc::clone(&slot);

    let result = thread::Builder::new().name(name).spawn(move || {
        if let Some(job) = spawned.lock().take() {
            job();
        }
    });

    if let Err(err) = result {
        run_inline(&err, &slot);
    }
}

fn run_inline<F: FnOnce()>(err: &io::Error, slot: &Mutex<Option<F>>) {
    tracing::error!(error = %err, "failed to spawn dispatch thread, running inline");
    if let Some(job) = slot.lock().take() {
        job();
    }
}

/// Wrap a plain closure so that each firing runs it on its own thread.
pub(crate) fn detached<F>(name: String, f: F) -> Callback
where
    F: Fn() + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |_: DateTime<Utc>| {
        let f = Arc::clone(&f);
        spawn(name.clone(), move || {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| f())) {
                let message = panic_message(&*payload);
                tracing::error!(%message, "detached timer function panicked");
            }
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc,
        },
        time::Duration,
    };

    #[test]
    fn invoke_contains_panic_and_reports_it() {
        let reported = Arc::new(Mutex::new(Vec::new()));
        let hook: PanicHook = {
            let reported = Arc::clone(&reported);
            Arc::new(move |id: TimerId, message: &str| {
                reported.lock().push((id, message.to_owned()))
            })
        };
        let callback: Callback = Arc::new(|_: DateTime<Utc>| panic!("boom"));
        let id = TimerId::new();

        assert!(!invoke(id, &callback, Utc::now(), Some(&hook)));
        assert_eq!(vec![(id, "boom".to_owned())], *reported.lock());
    }

    #[test]
    fn invoke_passes_timestamp() {
        let seen = Arc::new(Mutex::new(None));
        let callback: Callback = {
            let seen = Arc::clone(&seen);
            Arc::new(move |now: DateTime<Utc>| *seen.lock() = Some(now))
        };
        let now = DateTime::from_timestamp(0, 0).unwrap();

        assert!(invoke(TimerId::new(), &callback, now, None));
        assert_eq!(Some(now), *seen.lock());
    }

    #[test]
    fn panic_message_formats() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let other: Box<dyn Any + Send> = Box::new(7_u32);
        assert_eq!("owned", panic_message(&*owned));
        assert_eq!("non-string panic payload", panic_message(&*other));
    }

    #[test]
    fn spawn_runs_on_named_thread() {
        let (tx, rx) = mpsc::channel();
        spawn("dispatch-test".to_owned(), move || {
            let _ = tx.send(thread::current().name().map(str::to_owned));
        });

        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(Some("dispatch-test".to_owned()), name);
    }

    #[test]
    fn failed_spawn_runs_job_on_caller() {
        let ran_on = Arc::new(Mutex::new(None));
        let slot = Mutex::new(Some({
            let ran_on = Arc::clone(&ran_on);
            move || *ran_on.lock() = Some(thread::current().id())
        }));

        run_inline(&io::Error::other("thread limit reached"), &slot);

        assert_eq!(Some(thread::current().id()), *ran_on.lock());
        assert!(slot.lock().is_none());
    }

    #[test]
    fn detached_runs_every_firing() {
        let count = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        let callback = {
            let count = Arc::clone(&count);
            let tx = Mutex::new(tx);
            detached("detached-test".to_owned(), move || {
                count.fetch_add(1, Ordering::SeqCst);
                let _ = tx.lock().send(());
            })
        };

        callback(Utc::now());
        callback(Utc::now());

        for _ in 0..2 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(2, count.load(Ordering::SeqCst));
    }
}
