//! Cooperative cancellation for blocking terminal reads.
//!
//! A [`CancellationToken`] is shared between the thread performing a read and
//! any thread that may want to abort that read. Cancelling is sticky: once a
//! token has been cancelled, it stays cancelled. Clones share the same state.
//!
//! Readers don't poll the token. Instead, they [`register`](CancellationToken::register)
//! a callback for the duration of a blocking wait, and the callback wakes up
//! the wait through the reader's cancellation channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::{Duration, Instant};

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Callbacks {
    next_id: u64,
    entries: Vec<(u64, Callback)>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    callbacks: Mutex<Callbacks>,
}

impl Inner {
    fn callbacks(&self) -> MutexGuard<'_, Callbacks> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A token for cancelling terminal operations.
///
/// # Example
///
/// ```
/// # use rawtty::CancellationToken;
/// let token = CancellationToken::new();
/// let clone = token.clone();
/// assert!(!token.is_cancelled());
///
/// clone.cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    /// Create a new token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new token that is cancelled after the given duration.
    pub fn with_timeout(timeout: Duration) -> Self {
        let token = Self::new();
        token.cancel_after(timeout);
        token
    }

    /// Determine whether this token has been cancelled.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Cancel this token.
    ///
    /// This method runs all registered callbacks on the calling thread. It is
    /// idempotent, with only the first invocation running callbacks.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }

        let entries = std::mem::take(&mut self.inner.callbacks().entries);
        for (_, callback) in entries {
            callback();
        }
    }

    /// Cancel this token after the given duration.
    ///
    /// All timeouts share one background thread, which is started on first
    /// use and only holds weak references to tokens. Dropping every clone of
    /// a token hence discards its pending timeout.
    pub fn cancel_after(&self, timeout: Duration) {
        // A deadline beyond the clock's range never arrives.
        if let Some(deadline) = Instant::now().checked_add(timeout) {
            timer().schedule(deadline, Arc::downgrade(&self.inner));
        }
    }

    /// Register a callback to run upon cancellation.
    ///
    /// If the token already has been cancelled, the callback runs right away.
    /// Otherwise, it runs on the thread calling [`CancellationToken::cancel`],
    /// unless the returned registration has been dropped before.
    pub fn register<F>(&self, callback: F) -> Registration
    where
        F: FnOnce() + Send + 'static,
    {
        let mut callbacks = self.inner.callbacks();
        // cancel() sets the flag before taking the lock, so checking under the
        // lock cannot miss a concurrent cancellation.
        if self.is_cancelled() {
            drop(callbacks);
            callback();
            return Registration {
                inner: Weak::new(),
                id: 0,
            };
        }

        callbacks.next_id += 1;
        let id = callbacks.next_id;
        callbacks.entries.push((id, Box::new(callback)));

        Registration {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("callbacks", &self.inner.callbacks().entries.len())
            .finish()
    }
}

/// A callback registration.
///
/// Dropping the registration removes the callback again.
#[derive(Debug)]
#[must_use = "dropping the registration removes the callback"]
pub struct Registration {
    inner: Weak<Inner>,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.callbacks().entries.retain(|(id, _)| *id != self.id);
        }
    }
}

// ----------------------------------------------------------------------------------------------------------

struct Timer {
    deadlines: Mutex<Vec<(Instant, Weak<Inner>)>>,
    wakeup: Condvar,
}

fn timer() -> &'static Timer {
    static TIMER: OnceLock<Timer> = OnceLock::new();

    TIMER.get_or_init(|| {
        // The thread blocks in timer() until initialization completes.
        if let Err(error) = std::thread::Builder::new()
            .name("rawtty-timer".into())
            .spawn(|| timer().run())
        {
            tracing::error!(%error, "could not start timer thread");
        }

        Timer {
            deadlines: Mutex::new(Vec::new()),
            wakeup: Condvar::new(),
        }
    })
}

impl Timer {
    fn deadlines(&self) -> MutexGuard<'_, Vec<(Instant, Weak<Inner>)>> {
        self.deadlines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule(&self, deadline: Instant, inner: Weak<Inner>) {
        self.deadlines().push((deadline, inner));
        self.wakeup.notify_one();
    }

    fn run(&self) {
        let mut deadlines = self.deadlines();
        loop {
            let now = Instant::now();
            deadlines.retain(|(_, inner)| inner.strong_count() > 0);

            let mut due = Vec::new();
            deadlines.retain(|(deadline, inner)| {
                if *deadline <= now {
                    due.push(inner.clone());
                    false
                } else {
                    true
                }
            });

            if !due.is_empty() {
                // Callbacks may schedule more timeouts.
                drop(deadlines);
                for inner in due {
                    if let Some(inner) = inner.upgrade() {
                        CancellationToken { inner }.cancel();
                    }
                }
                deadlines = self.deadlines();
                continue;
            }

            deadlines = match deadlines.iter().map(|(deadline, _)| *deadline).min() {
                None => self
                    .wakeup
                    .wait(deadlines)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(next) => {
                    self.wakeup
                        .wait_timeout(deadlines, next.saturating_duration_since(now))
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }
}
