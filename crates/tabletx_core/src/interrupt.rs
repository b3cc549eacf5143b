//! Cooperative thread interruption.
//!
//! Every thread has an interrupt flag. Another thread can set it through an
//! [`InterruptHandle`]; blocking waits in this crate (retry backoff, handoff
//! queue `offer`/`poll`) wake up promptly and fail with
//! [`TxError::Interrupted`]. Detecting an interrupt never clears the flag, so
//! outer callers can observe it too. Use [`take`] to clear it.

use crate::error::{TxError, TxResult};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

type Waker = Arc<dyn Fn() + Send + Sync>;

struct InterruptFlag {
    interrupted: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

thread_local! {
    static FLAG: Arc<InterruptFlag> = Arc::new(InterruptFlag {
        interrupted: AtomicBool::new(false),
        waker: Mutex::new(None),
    });
}

fn flag() -> Arc<InterruptFlag> {
    FLAG.with(Arc::clone)
}

/// Handle for interrupting a specific thread from anywhere.
#[derive(Clone)]
pub struct InterruptHandle {
    flag: Arc<InterruptFlag>,
}

impl InterruptHandle {
    /// Sets the thread's interrupt flag and wakes it if it is blocked.
    pub fn interrupt(&self) {
        self.flag.interrupted.store(true, Ordering::SeqCst);
        let waker = self.flag.waker.lock().clone();
        if let Some(wake) = waker {
            wake();
        }
    }

    /// Returns true if the thread's interrupt flag is set.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.flag.interrupted.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for InterruptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptHandle")
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

/// Returns a handle for interrupting the calling thread.
pub fn current() -> InterruptHandle {
    InterruptHandle { flag: flag() }
}

/// Returns true if the calling thread has been interrupted.
pub fn is_interrupted() -> bool {
    FLAG.with(|f| f.interrupted.load(Ordering::SeqCst))
}

/// Clears the calling thread's interrupt flag, returning its previous value.
pub fn take() -> bool {
    FLAG.with(|f| f.interrupted.swap(false, Ordering::SeqCst))
}

/// Sets the calling thread's interrupt flag.
pub fn restore() {
    FLAG.with(|f| f.interrupted.store(true, Ordering::SeqCst));
}

/// Fails with `Interrupted` if the calling thread has been interrupted.
pub fn check() -> TxResult<()> {
    if is_interrupted() {
        Err(TxError::Interrupted)
    } else {
        Ok(())
    }
}

/// Sleeps for `duration` unless interrupted first.
pub fn sleep(duration: Duration) -> TxResult<()> {
    check()?;
    if duration.is_zero() {
        return Ok(());
    }

    let signal = Arc::new((Mutex::new(()), Condvar::new()));
    let wake_signal = Arc::clone(&signal);
    let _registration = on_interrupt(Arc::new(move || {
        let _lock = wake_signal.0.lock();
        wake_signal.1.notify_all();
    }));

    let deadline = Instant::now().checked_add(duration);
    let mut lock = signal.0.lock();
    loop {
        check()?;
        match deadline {
            Some(deadline) => {
                if signal.1.wait_until(&mut lock, deadline).timed_out() {
                    break;
                }
            }
            None => signal.1.wait(&mut lock),
        }
    }
    drop(lock);
    check()
}

/// Installs `waker` to be called when the current thread is interrupted.
///
/// The previous waker is restored when the returned guard is dropped. The
/// guard must not be dropped while holding a lock the waker takes.
pub(crate) fn on_interrupt(waker: Waker) -> WakerRegistration {
    let flag = flag();
    let previous = flag.waker.lock().replace(waker);
    WakerRegistration { flag, previous }
}

pub(crate) struct WakerRegistration {
    flag: Arc<InterruptFlag>,
    previous: Option<Waker>,
}

impl Drop for WakerRegistration {
    fn drop(&mut self) {
        *self.flag.waker.lock() = self.previous.take();
    }
}
