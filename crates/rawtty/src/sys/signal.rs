use std::io::Result;
use std::ptr::{from_mut, from_ref, null_mut};
use std::sync::atomic::{AtomicBool, Ordering};

use super::util::IntoResult;

const SIGNAL_COUNT: usize = 65;

static FIRED: [AtomicBool; SIGNAL_COUNT] = [const { AtomicBool::new(false) }; SIGNAL_COUNT];

extern "C" fn record(signal: libc::c_int) {
    // Only async-signal-safe operations here.
    if let Some(flag) = usize::try_from(signal).ok().and_then(|n| FIRED.get(n)) {
        flag.store(true, Ordering::SeqCst);
    }
}

/// A scoped handler that records a signal instead of acting on it.
///
/// While the guard is alive, delivery of the signal merely sets a flag, which
/// [`SignalGuard::fired`] reports. Dropping the guard reinstates the previous
/// disposition. The handler is installed without `SA_RESTART`, so that a
/// system call raising the signal returns `EINTR` instead of being restarted
/// and raising the signal again.
///
/// If the signal is ignored when the guard is created, the guard leaves the
/// disposition alone: The kernel doesn't deliver ignored job control signals
/// and lets the guarded operation proceed.
///
/// Dispositions are process-wide. Guards for the same signal must not be
/// nested or overlap across threads.
pub struct SignalGuard {
    signal: libc::c_int,
    previous: Option<libc::sigaction>,
}

impl SignalGuard {
    /// Start recording the signal.
    pub fn new(signal: libc::c_int) -> Result<Self> {
        let index = usize::try_from(signal)
            .ok()
            .filter(|n| *n < SIGNAL_COUNT)
            .ok_or_else(|| std::io::Error::from_raw_os_error(libc::EINVAL))?;
        FIRED[index].store(false, Ordering::SeqCst);

        // SAFETY: An all-zero sigaction is a valid value for the C struct.
        let mut previous: libc::sigaction = unsafe { std::mem::zeroed() };
        // SAFETY: Querying the disposition only writes to `previous`.
        unsafe { libc::sigaction(signal, null_mut(), from_mut(&mut previous)) }.into_result()?;
        if previous.sa_sigaction == libc::SIG_IGN {
            return Ok(Self {
                signal,
                previous: None,
            });
        }

        // SAFETY: See above.
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_sigaction = record as extern "C" fn(libc::c_int) as libc::sighandler_t;
        action.sa_flags = 0;
        // SAFETY: The mask is a valid, exclusively borrowed sigset_t.
        unsafe { libc::sigemptyset(from_mut(&mut action.sa_mask)) };
        // SAFETY: `record` only performs an atomic store.
        unsafe { libc::sigaction(signal, from_ref(&action), from_mut(&mut previous)) }
            .into_result()?;

        Ok(Self {
            signal,
            previous: Some(previous),
        })
    }

    /// Get the guarded signal.
    pub fn signal(&self) -> libc::c_int {
        self.signal
    }

    /// Determine whether the signal was delivered since the guard was created.
    pub fn fired(&self) -> bool {
        self.previous.is_some()
            && usize::try_from(self.signal)
                .ok()
                .and_then(|n| FIRED.get(n))
                .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }
}

impl std::fmt::Debug for SignalGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalGuard")
            .field("signal", &self.signal)
            .field("active", &self.previous.is_some())
            .field("fired", &self.fired())
            .finish()
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.as_ref() {
            // SAFETY: `previous` was filled in by sigaction() and hence is valid.
            let _ = unsafe { libc::sigaction(self.signal, from_ref(previous), null_mut()) };
        }
    }
}

#[cfg(test)]
mod test {
    use super::SignalGuard;
    use serial_test::serial;

    #[test]
    #[serial(signals)]
    fn test_guard_records_signal() -> std::io::Result<()> {
        let guard = SignalGuard::new(libc::SIGUSR1)?;
        assert!(!guard.fired());

        // SAFETY: The guard's handler is installed for SIGUSR1.
        assert_eq!(unsafe { libc::raise(libc::SIGUSR1) }, 0);
        assert!(guard.fired());
        Ok(())
    }

    #[test]
    #[serial(signals)]
    fn test_guard_restores_previous_handler() -> std::io::Result<()> {
        // SAFETY: Ignoring SIGUSR2 is harmless for the test process.
        let original = unsafe { libc::signal(libc::SIGUSR2, libc::SIG_IGN) };

        {
            let guard = SignalGuard::new(libc::SIGUSR2)?;
            // Ignored signals are left alone.
            // SAFETY: SIGUSR2 is ignored.
            assert_eq!(unsafe { libc::raise(libc::SIGUSR2) }, 0);
            assert!(!guard.fired());
        }

        // SAFETY: Restores the disposition found above.
        let current = unsafe { libc::signal(libc::SIGUSR2, original) };
        assert_eq!(current, libc::SIG_IGN);
        Ok(())
    }

    #[test]
    fn test_invalid_signal() {
        assert!(SignalGuard::new(-1).is_err());
        assert!(SignalGuard::new(1_000).is_err());
    }
}
