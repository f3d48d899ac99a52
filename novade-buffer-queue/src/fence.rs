//! Completion fences.
//!
//! A [`Fence`] answers one question: "is the work that was in flight on this buffer
//! done yet?". The queue hands fences across the producer/consumer boundary without
//! ever looking inside them; it only copies them around under its lock and lets the
//! endpoints wait on them after the lock has been released.
//!
//! Two flavours exist:
//! - the **sentinel** ([`Fence::signaled`], also `Fence::default()`), used whenever no
//!   hardware work is attached to a buffer. It is always signaled and waiting on it
//!   never blocks.
//! - **timeline points** created by a [`SyncTimeline`], a software stand-in for a
//!   kernel sync timeline. A point signals once its timeline has advanced to (or past)
//!   the point's value, or fails if the timeline is put into the error state.
//!
//! [`Fence::merge`] combines two fences into one that signals only once both have.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// Result of waiting on (or polling) a fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FenceStatus {
    /// The guarded work has completed.
    Signaled,
    /// The guarded work is still in flight (the wait timed out).
    Active,
    /// The guarded work failed; the buffer contents are undefined.
    Error,
}

/// Failure of [`Fence::wait_ready`].
///
/// Kept apart from the queue's error type so callers can tell "the queue rejected the
/// call" from "the buffer is yours but the hardware reported a problem".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FenceError {
    #[error("Fence {name:?} did not signal within {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("Fence {name:?} signaled an error")]
    Failed { name: String },
}

fn next_fence_id() -> u64 {
    static NEXT_FENCE_ID: AtomicU64 = AtomicU64::new(1);
    NEXT_FENCE_ID.fetch_add(1, Ordering::Relaxed)
}

fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    // An unrepresentable deadline is as good as waiting forever.
    timeout.and_then(|t| Instant::now().checked_add(t))
}

#[derive(Debug, Default)]
struct TimelineState {
    value: u64,
    failed: bool,
}

#[derive(Debug, Default)]
struct TimelineShared {
    state: Mutex<TimelineState>,
    advanced: Condvar,
}

impl TimelineShared {
    fn point_status(state: &TimelineState, point: u64) -> FenceStatus {
        if state.value >= point {
            FenceStatus::Signaled
        } else if state.failed {
            FenceStatus::Error
        } else {
            FenceStatus::Active
        }
    }

    fn wait_point(&self, point: u64, deadline: Option<Instant>) -> FenceStatus {
        let mut state = self.state.lock();
        loop {
            let status = Self::point_status(&state, point);
            if status != FenceStatus::Active {
                return status;
            }
            match deadline {
                None => self.advanced.wait(&mut state),
                Some(deadline) => {
                    if self.advanced.wait_until(&mut state, deadline).timed_out() {
                        return Self::point_status(&state, point);
                    }
                }
            }
        }
    }
}

enum FenceKind {
    Point { timeline: Arc<TimelineShared>, point: u64 },
    Merged { first: Fence, second: Fence },
}

struct FenceInner {
    id: u64,
    name: String,
    kind: FenceKind,
}

/// Opaque, cheaply clonable completion signal.
///
/// Clones refer to the same underlying primitive and compare equal; two independently
/// created fences never do. All sentinels compare equal to each other.
#[derive(Clone, Default)]
pub struct Fence {
    inner: Option<Arc<FenceInner>>,
}

impl Fence {
    /// The always-signaled sentinel.
    pub fn signaled() -> Self {
        Self { inner: None }
    }

    /// `true` if this fence is backed by real work, `false` for the sentinel.
    pub fn is_valid(&self) -> bool {
        self.inner.is_some()
    }

    /// Identifier shared by all clones of this fence, `None` for the sentinel.
    pub fn id(&self) -> Option<u64> {
        self.inner.as_ref().map(|inner| inner.id)
    }

    /// Debug name given at creation, empty for the sentinel.
    pub fn name(&self) -> &str {
        self.inner.as_ref().map_or("", |inner| inner.name.as_str())
    }

    /// Waits for the fence.
    ///
    /// `None` blocks until the fence leaves the active state. `Some(Duration::ZERO)`
    /// polls. When the timeout elapses first, [`FenceStatus::Active`] is returned.
    pub fn wait(&self, timeout: Option<Duration>) -> FenceStatus {
        self.wait_until(deadline_after(timeout))
    }

    /// Non-blocking status query.
    pub fn status(&self) -> FenceStatus {
        self.wait(Some(Duration::ZERO))
    }

    /// Waits like [`Fence::wait`] but folds the outcome into a `Result`.
    ///
    /// # Errors
    /// [`FenceError::Timeout`] if the fence is still active after `timeout`,
    /// [`FenceError::Failed`] if it signaled an error.
    pub fn wait_ready(&self, timeout: Duration) -> Result<(), FenceError> {
        match self.wait(Some(timeout)) {
            FenceStatus::Signaled => Ok(()),
            FenceStatus::Active => Err(FenceError::Timeout { name: self.name().to_string(), timeout }),
            FenceStatus::Error => Err(FenceError::Failed { name: self.name().to_string() }),
        }
    }

    fn wait_until(&self, deadline: Option<Instant>) -> FenceStatus {
        let Some(inner) = &self.inner else {
            return FenceStatus::Signaled;
        };
        match &inner.kind {
            FenceKind::Point { timeline, point } => timeline.wait_point(*point, deadline),
            FenceKind::Merged { first, second } => match first.wait_until(deadline) {
                FenceStatus::Signaled => second.wait_until(deadline),
                FenceStatus::Error => FenceStatus::Error,
                FenceStatus::Active => {
                    // Still report an error from the other half without blocking on it.
                    if second.status() == FenceStatus::Error {
                        FenceStatus::Error
                    } else {
                        FenceStatus::Active
                    }
                }
            },
        }
    }

    /// Combines two fences into one that signals only after both have signaled.
    ///
    /// The sentinel acts as the identity: merging with it returns the other operand
    /// unchanged. Only when both operands are real is a new primitive created.
    pub fn merge(name: &str, first: &Fence, second: &Fence) -> Fence {
        match (first.is_valid(), second.is_valid()) {
            (false, false) => Fence::signaled(),
            (true, false) => first.clone(),
            (false, true) => second.clone(),
            (true, true) => {
                if first == second {
                    return first.clone();
                }
                Fence {
                    inner: Some(Arc::new(FenceInner {
                        id: next_fence_id(),
                        name: name.to_string(),
                        kind: FenceKind::Merged { first: first.clone(), second: second.clone() },
                    })),
                }
            }
        }
    }
}

impl PartialEq for Fence {
    fn eq(&self, other: &Self) -> bool {
        match (&self.inner, &other.inner) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for Fence {}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            None => f.write_str("Fence(signaled)"),
            Some(inner) => f
                .debug_struct("Fence")
                .field("id", &inner.id)
                .field("name", &inner.name)
                .field("status", &self.status())
                .finish(),
        }
    }
}

impl fmt::Display for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            None => f.write_str("-1"),
            Some(inner) => write!(f, "{}", inner.id),
        }
    }
}

/// Software synchronization timeline.
///
/// The timeline holds a counter that only moves forward. Fences created for a point
/// `p` signal once the counter reaches `p`. Putting the timeline into the error state
/// makes every point not yet reached report [`FenceStatus::Error`].
#[derive(Debug, Default)]
pub struct SyncTimeline {
    shared: Arc<TimelineShared>,
    last_point: AtomicU64,
}

impl SyncTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current counter value.
    pub fn value(&self) -> u64 {
        self.shared.state.lock().value
    }

    /// Creates a fence that signals when the counter reaches `point`.
    pub fn create_fence(&self, name: &str, point: u64) -> Fence {
        self.last_point.fetch_max(point, Ordering::SeqCst);
        Fence {
            inner: Some(Arc::new(FenceInner {
                id: next_fence_id(),
                name: name.to_string(),
                kind: FenceKind::Point { timeline: Arc::clone(&self.shared), point },
            })),
        }
    }

    /// Creates a fence for the point right after the highest one handed out so far.
    pub fn next_fence(&self, name: &str) -> Fence {
        let point = self.last_point.fetch_add(1, Ordering::SeqCst) + 1;
        self.create_fence(name, point)
    }

    /// Advances the counter by `step` and wakes all waiters.
    pub fn increase(&self, step: u64) {
        let mut state = self.shared.state.lock();
        state.value = state.value.saturating_add(step);
        tracing::trace!(value = state.value, "Sync timeline advanced");
        drop(state);
        self.shared.advanced.notify_all();
    }

    /// Fails every point the counter has not reached yet.
    pub fn fail(&self) {
        self.shared.state.lock().failed = true;
        tracing::warn!("Sync timeline entered the error state");
        self.shared.advanced.notify_all();
    }
}
