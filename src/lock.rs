//! ## Transaction Lock
//!
//! A ticket lock that admits one protocol operation at a time in FIFO
//! arrival order. Waiters that give up (cancellation, deadline) hand
//! their ticket back so the queue keeps moving. Re-entrant acquisition
//! from the thread already holding the lock is refused instead of
//! deadlocking.
//!

use std::collections::HashSet;
use std::sync::{Condvar, Mutex};
use std::thread::ThreadId;
use std::time::Duration;

use crate::cancel::{CancelToken, Deadline};
use crate::error::MtpError;

/// How often a parked waiter rechecks its cancellation signal.
const WAIT_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct TicketState {
    next: u64,
    serving: u64,
    holder: Option<ThreadId>,
    abandoned: HashSet<u64>,
}

impl TicketState {
    /// Skip over tickets whose waiters gave up.
    fn advance_past_abandoned(&mut self) {
        while self.abandoned.remove(&self.serving) {
            self.serving += 1;
        }
    }
}

#[derive(Debug)]
pub struct TransactionLock {
    state: Mutex<TicketState>,
    cv: Condvar,
}

impl TransactionLock {
    pub fn new() -> TransactionLock {
        TransactionLock {
            state: Mutex::new(TicketState {
                next: 0,
                serving: 0,
                holder: None,
                abandoned: HashSet::new(),
            }),
            cv: Condvar::new(),
        }
    }

    /// ### Acquire
    ///
    /// Join the FIFO queue and block until served, cancelled or past
    /// the deadline. The guard releases on every exit path.
    ///
    pub fn acquire(
        &self,
        cancel: &CancelToken,
        deadline: &Deadline,
    ) -> Result<TransactionGuard<'_>, MtpError> {
        let me = std::thread::current().id();
        let mut state = self.state.lock().unwrap();
        if state.holder == Some(me) {
            return Err(MtpError::SessionBusy);
        }
        let ticket = state.next;
        state.next += 1;

        while state.serving != ticket {
            if cancel.is_cancelled() || deadline.expired() {
                state.abandoned.insert(ticket);
                // unblock the queue if it is now our turn to be skipped
                state.advance_past_abandoned();
                self.cv.notify_all();
                return Err(if cancel.is_cancelled() {
                    MtpError::Cancelled
                } else {
                    MtpError::Timeout
                });
            }
            let (next_state, _) = self.cv.wait_timeout(state, WAIT_SLICE).unwrap();
            state = next_state;
        }

        state.holder = Some(me);
        Ok(TransactionGuard { lock: self })
    }
}

impl Default for TransactionLock {
    fn default() -> TransactionLock {
        TransactionLock::new()
    }
}

/// Releases the transaction lock on drop.
#[derive(Debug)]
pub struct TransactionGuard<'a> {
    lock: &'a TransactionLock,
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock().unwrap();
        state.holder = None;
        state.serving += 1;
        state.advance_past_abandoned();
        self.lock.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn waiters_are_served_in_arrival_order() {
        let lock = Arc::new(TransactionLock::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = lock
            .acquire(&CancelToken::new(), &Deadline::unbounded())
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..4 {
            let lock = lock.clone();
            let order = order.clone();
            handles.push(std::thread::spawn(move || {
                let _guard = lock
                    .acquire(&CancelToken::new(), &Deadline::unbounded())
                    .unwrap();
                order.lock().unwrap().push(i);
            }));
            // stagger arrivals so ticket order matches spawn order
            std::thread::sleep(Duration::from_millis(30));
        }

        drop(first);
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn second_caller_starts_after_first_returns() {
        let lock = Arc::new(TransactionLock::new());
        let guard = lock
            .acquire(&CancelToken::new(), &Deadline::unbounded())
            .unwrap();

        let lock2 = lock.clone();
        let handle = std::thread::spawn(move || {
            let started = Instant::now();
            let _guard = lock2
                .acquire(&CancelToken::new(), &Deadline::unbounded())
                .unwrap();
            started.elapsed()
        });

        std::thread::sleep(Duration::from_millis(50));
        drop(guard);
        let waited = handle.join().unwrap();
        assert!(waited >= Duration::from_millis(40));
    }

    #[test]
    fn reentrant_acquire_reports_session_busy() {
        let lock = TransactionLock::new();
        let _guard = lock
            .acquire(&CancelToken::new(), &Deadline::unbounded())
            .unwrap();
        let err = lock
            .acquire(&CancelToken::new(), &Deadline::unbounded())
            .unwrap_err();
        assert!(matches!(err, MtpError::SessionBusy));
    }

    #[test]
    fn cancelled_waiter_does_not_block_the_queue() {
        let lock = Arc::new(TransactionLock::new());
        let guard = lock
            .acquire(&CancelToken::new(), &Deadline::unbounded())
            .unwrap();

        // a waiter that gives up while parked
        let cancel = CancelToken::new();
        let lock2 = lock.clone();
        let cancel2 = cancel.clone();
        let quitter = std::thread::spawn(move || {
            lock2.acquire(&cancel2, &Deadline::unbounded()).err()
        });
        std::thread::sleep(Duration::from_millis(30));
        cancel.cancel();
        assert!(matches!(quitter.join().unwrap(), Some(MtpError::Cancelled)));

        // a later waiter must still get through
        let lock3 = lock.clone();
        let late = std::thread::spawn(move || {
            lock3
                .acquire(&CancelToken::new(), &Deadline::unbounded())
                .is_ok()
        });
        std::thread::sleep(Duration::from_millis(30));
        drop(guard);
        assert!(late.join().unwrap());
    }

    #[test]
    fn deadline_expiry_surfaces_timeout() {
        let lock = TransactionLock::new();
        let _guard = lock
            .acquire(&CancelToken::new(), &Deadline::unbounded())
            .unwrap();
        let err = std::thread::scope(|s| {
            s.spawn(|| {
                lock.acquire(
                    &CancelToken::new(),
                    &Deadline::after(Duration::from_millis(30)),
                )
                .unwrap_err()
            })
            .join()
            .unwrap()
        });
        assert!(matches!(err, MtpError::Timeout));
    }
}
