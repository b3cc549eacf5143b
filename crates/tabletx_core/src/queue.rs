//! Deadline-bounded single-producer/single-consumer handoff queue.
//!
//! Moves rows from a stream producer (usually a backend I/O thread) to the
//! synchronous consumer iterating a scan. The whole stream shares one
//! absolute deadline fixed when the queue is created.
//!
//! The two halves are not `Clone` and their blocking methods take
//! `&mut self`, so there is exactly one producer and one consumer.
//!
//! ```text
//! producer: offer(v) ... offer(v) supplier_done(cb)
//! consumer: poll() -> Some(v) ... poll() -> None   (cb has run, queue closed)
//! ```

use crate::error::{TxError, TxResult};
use crate::interrupt;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

type DoneCallback = Box<dyn FnOnce() -> TxResult<()> + Send>;

enum Slot<V> {
    Value(V),
    Done(DoneCallback),
}

struct State<V> {
    buf: VecDeque<Slot<V>>,
    closed: bool,
    /// Values pushed so far; used as rendezvous tickets.
    enqueued: u64,
    dequeued: u64,
    producer_gone: bool,
}

struct Shared<V> {
    capacity: usize,
    deadline: Option<Instant>,
    state: Mutex<State<V>>,
    changed: Condvar,
}

impl<V> Shared<V> {
    /// Blocks until notified or the deadline passes. Returns true on timeout.
    fn wait(&self, state: &mut MutexGuard<'_, State<V>>) -> bool {
        match self.deadline {
            Some(deadline) => self.changed.wait_until(state, deadline).timed_out(),
            None => {
                self.changed.wait(state);
                false
            }
        }
    }

    fn past_deadline(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Creates a queue whose deadline is `timeout` from now.
///
/// `capacity == 0` makes every `offer` a rendezvous that returns only once
/// the consumer has taken the value.
pub fn handoff_queue<V: Send>(
    capacity: usize,
    timeout: Duration,
) -> (QueueProducer<V>, QueueConsumer<V>) {
    handoff_queue_with_deadline(capacity, Instant::now().checked_add(timeout))
}

/// Creates a queue with an absolute deadline. `None` never expires.
pub fn handoff_queue_with_deadline<V: Send>(
    capacity: usize,
    deadline: Option<Instant>,
) -> (QueueProducer<V>, QueueConsumer<V>) {
    let shared = Arc::new(Shared {
        capacity,
        deadline,
        state: Mutex::new(State {
            buf: VecDeque::with_capacity(capacity.min(1024)),
            closed: false,
            enqueued: 0,
            dequeued: 0,
            producer_gone: false,
        }),
        changed: Condvar::new(),
    });
    (
        QueueProducer {
            shared: Arc::clone(&shared),
            finished: false,
        },
        QueueConsumer { shared },
    )
}

fn wake_on_interrupt<V: Send + 'static>(
    shared: &Arc<Shared<V>>,
) -> interrupt::WakerRegistration {
    let shared = Arc::clone(shared);
    interrupt::on_interrupt(Arc::new(move || {
        let _state = shared.state.lock();
        shared.changed.notify_all();
    }))
}

/// Sending half of a handoff queue.
pub struct QueueProducer<V> {
    shared: Arc<Shared<V>>,
    finished: bool,
}

impl<V: Send + 'static> QueueProducer<V> {
    /// Hands `value` to the consumer.
    ///
    /// Returns `Ok(false)` without blocking if the consumer has closed the
    /// queue. Fails with `DeadlineExceeded` if the value could not be handed
    /// over in time, or `Interrupted` if this thread is interrupted.
    pub fn offer(&mut self, value: V) -> TxResult<bool> {
        let _waker = wake_on_interrupt(&self.shared);
        let shared = &self.shared;
        let mut state = shared.state.lock();

        if shared.capacity > 0 {
            loop {
                if state.closed {
                    return Ok(false);
                }
                if state.buf.len() < shared.capacity {
                    state.buf.push_back(Slot::Value(value));
                    state.enqueued += 1;
                    shared.changed.notify_all();
                    return Ok(true);
                }
                interrupt::check()?;
                if shared.wait(&mut state) && state.buf.len() >= shared.capacity && !state.closed {
                    return Err(TxError::deadline_exceeded("stream deadline exceeded on offer"));
                }
            }
        }

        if state.closed {
            return Ok(false);
        }
        if shared.past_deadline() {
            return Err(TxError::deadline_exceeded("stream deadline exceeded on offer"));
        }
        state.buf.push_back(Slot::Value(value));
        state.enqueued += 1;
        let ticket = state.enqueued;
        shared.changed.notify_all();

        loop {
            if state.closed {
                return Ok(false);
            }
            if state.dequeued >= ticket {
                return Ok(true);
            }
            let failure = if interrupt::is_interrupted() {
                Some(TxError::Interrupted)
            } else if shared.wait(&mut state) && state.dequeued < ticket && !state.closed {
                Some(TxError::deadline_exceeded("stream deadline exceeded on offer"))
            } else {
                None
            };
            if let Some(err) = failure {
                // Single producer: the untaken value is the last slot.
                state.buf.pop_back();
                state.enqueued -= 1;
                return Err(err);
            }
        }
    }

    /// Signals the end of the stream.
    ///
    /// When the consumer reaches the marker it runs `status` (which may
    /// surface a terminal error), then the queue closes. The marker is never
    /// subject to capacity and does not wait for the consumer. Does nothing
    /// if the queue is already closed.
    pub fn supplier_done<F>(&mut self, status: F)
    where
        F: FnOnce() -> TxResult<()> + Send + 'static,
    {
        self.finished = true;
        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }
        state.buf.push_back(Slot::Done(Box::new(status)));
        self.shared.changed.notify_all();
    }

    /// Returns true once the consumer has closed the queue.
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }
}

impl<V> Drop for QueueProducer<V> {
    fn drop(&mut self) {
        if !self.finished {
            self.shared.state.lock().producer_gone = true;
            self.shared.changed.notify_all();
        }
    }
}

/// Receiving half of a handoff queue.
pub struct QueueConsumer<V> {
    shared: Arc<Shared<V>>,
}

impl<V: Send + 'static> QueueConsumer<V> {
    /// Takes the next value.
    ///
    /// Returns `Ok(None)` once the end-of-stream marker is reached (after
    /// running its status callback) or if the queue is closed. Values
    /// already buffered are returned even past the deadline; an empty queue
    /// past the deadline fails with `DeadlineExceeded`.
    pub fn poll(&mut self) -> TxResult<Option<V>> {
        let _waker = wake_on_interrupt(&self.shared);
        let shared = &self.shared;
        let mut state = shared.state.lock();

        loop {
            if state.closed {
                return Ok(None);
            }
            if let Some(slot) = state.buf.pop_front() {
                state.dequeued += 1;
                shared.changed.notify_all();
                match slot {
                    Slot::Value(v) => return Ok(Some(v)),
                    Slot::Done(status) => {
                        state.closed = true;
                        state.buf.clear();
                        drop(state);
                        status()?;
                        return Ok(None);
                    }
                }
            }
            if state.producer_gone {
                state.closed = true;
                if shared.past_deadline() {
                    return Err(TxError::deadline_exceeded("stream deadline exceeded on poll"));
                }
                return Err(TxError::repository(
                    "stream producer stopped without signalling completion",
                ));
            }
            interrupt::check()?;
            if shared.wait(&mut state) && state.buf.is_empty() && !state.closed {
                return Err(TxError::deadline_exceeded("stream deadline exceeded on poll"));
            }
        }
    }

    /// Closes the queue and discards buffered values. Idempotent.
    pub fn close(&mut self) {
        let mut state = self.shared.state.lock();
        if !state.closed {
            state.closed = true;
            state.buf.clear();
            self.shared.changed.notify_all();
        }
    }

    /// Returns true once the queue is closed.
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Absolute deadline of the stream.
    pub fn deadline(&self) -> Option<Instant> {
        self.shared.deadline
    }
}

impl<V> Drop for QueueConsumer<V> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        state.buf.clear();
        self.shared.changed.notify_all();
    }
}
