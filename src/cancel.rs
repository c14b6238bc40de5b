//! ## Cancellation
//!
//! Cooperative cancellation tokens and nested deadline budgets.
//!
//! Every public session operation carries a [`CancelToken`] and a
//! [`Deadline`]. Both are checkpointed at each suspension point
//! (transport I/O, lock acquisition, pool-buffer acquisition).
//!

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::TransportError;

/// ### CancelToken
///
/// A clonable flag shared between a caller and the operations it
/// spawned. Firing the token makes the next checkpoint fail fast.
///
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Checkpoint: error out if the token has fired.
    pub fn check(&self) -> Result<(), TransportError> {
        if self.is_cancelled() {
            Err(TransportError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// ### Deadline
///
/// An absolute wall-clock cap. The smallest applicable bound wins when
/// budgets nest, so `min_with` narrows and never widens.
///
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    expires_at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Deadline {
        Deadline {
            expires_at: Instant::now() + budget,
        }
    }

    /// A deadline far enough out to never fire in practice.
    pub fn unbounded() -> Deadline {
        Deadline::after(Duration::from_secs(86_400))
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Time left, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// Narrow this deadline by an additional budget from now.
    pub fn min_with(&self, budget: Duration) -> Deadline {
        let other = Instant::now() + budget;
        Deadline {
            expires_at: self.expires_at.min(other),
        }
    }

    /// Budget for one I/O call under this deadline, capped by `phase_budget`.
    pub fn io_budget(&self, phase_budget: Duration) -> Duration {
        self.remaining().min(phase_budget)
    }
}
