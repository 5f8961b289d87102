//! Platform primitives for terminal control.
//!
//! This module isolates all system calls behind the [`Platform`] and
//! [`CancellationChannel`] traits. Exactly one implementation, [`Native`], is
//! compiled for each target family: Unix with termios, `poll`, and a self-pipe
//! for cancellation, or Windows with console modes, `WaitForMultipleObjects`,
//! and a manual-reset event for cancellation. The rest of the crate is generic
//! over the platform, with [`Native`] as the default, so that tests can
//! substitute a recording double.

use std::fmt::Debug;
use std::io::Result;

use crate::cancel::CancellationToken;
use crate::opt::Mode;

#[cfg(target_family = "unix")]
pub(crate) type RawHandle = std::os::fd::RawFd;
#[cfg(target_family = "windows")]
pub(crate) type RawHandle = std::os::windows::io::RawHandle;

mod util;
#[cfg(target_family = "unix")]
mod signal;
#[cfg(target_family = "unix")]
mod unix;
#[cfg(target_family = "windows")]
mod windows;

#[cfg(target_family = "unix")]
pub use self::unix::{Handle, Native, PipeChannel, Settings};
#[cfg(target_family = "windows")]
pub use self::windows::{EventChannel, Handle, Native, Settings};

#[cfg(target_family = "unix")]
pub use self::signal::SignalGuard;

// ----------------------------------------------------------------------------------------------------------

/// One of the three standard streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stream {
    Input,
    Output,
    Error,
}

impl Stream {
    /// Get the stream's logical name.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Input => "standard input",
            Self::Output => "standard output",
            Self::Error => "standard error",
        }
    }
}

/// A terminal's size in columns and rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Size {
    pub columns: u16,
    pub rows: u16,
}

impl Size {
    /// Create a new size.
    pub const fn new(columns: u16, rows: u16) -> Self {
        Self { columns, rows }
    }
}

impl From<Size> for (u16, u16) {
    fn from(value: Size) -> Self {
        (value.columns, value.rows)
    }
}

/// The reason for writing terminal settings.
///
/// The reason determines when the update takes effect and, on Unix, whether
/// the update is guarded against `SIGTTOU` for background process groups.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Entering raw mode; applies immediately.
    EnterRaw,
    /// Leaving raw mode; applies after flushing pending I/O and tolerates
    /// running in the background.
    LeaveRaw,
    /// Reapplying the current settings, e.g., after regaining the foreground;
    /// applies immediately.
    Refresh,
    /// Restoring the original settings during shutdown; behaves like
    /// [`Transition::LeaveRaw`].
    Restore,
}

impl Transition {
    /// Determine the transition for switching to the given mode.
    pub const fn to(mode: Mode) -> Self {
        match mode {
            Mode::Raw => Self::EnterRaw,
            Mode::Cooked => Self::LeaveRaw,
        }
    }

    /// Determine whether this transition leaves raw mode.
    pub const fn is_leaving(&self) -> bool {
        matches!(self, Self::LeaveRaw | Self::Restore)
    }
}

/// The outcome of writing terminal settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    /// The settings are in effect.
    Done,
    /// The process is in a background process group and the update was
    /// abandoned. The foreground process restores cooked mode on its own.
    Deferred,
}

/// The outcome of waiting for a handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The handle is ready for reading (or has hung up or failed, which the
    /// next read reports).
    Ready,
    /// The wait was cancelled.
    Cancelled,
}

// ----------------------------------------------------------------------------------------------------------

/// A platform's terminal primitives.
///
/// Implementations wrap system calls one-to-one. They neither retry after
/// `EINTR` when reading or writing, nor interpret end-of-stream conditions.
/// That is the job of [`Reader`](crate::Reader) and [`Writer`](crate::Writer).
/// The one exception is [`Platform::write_settings`], which must retry
/// interrupted calls itself, since only the platform knows whether an
/// interruption was caused by the signal guard.
pub trait Platform: Send + Sync + Sized + 'static {
    /// A borrowed, raw handle.
    type Handle: Copy + Debug + Send + Sync + 'static;

    /// An owned handle, which is closed on drop.
    type OwnedHandle: Debug + Send + Sync + 'static;

    /// A snapshot of the terminal's settings.
    type Settings: Clone + Debug + Send + 'static;

    /// The cancellation channel for waits on handles.
    type Channel: CancellationChannel<Handle = Self::Handle>;

    /// Get the handle for the standard stream.
    fn standard(&self, stream: Stream) -> Self::Handle;

    /// Get the raw handle for an owned handle.
    fn borrow(&self, handle: &Self::OwnedHandle) -> Self::Handle;

    /// Determine whether the handle is open and usable for reading or writing.
    /// This method never fails.
    fn is_valid(&self, handle: Self::Handle, for_writing: bool) -> bool;

    /// Determine whether the handle is connected to a terminal device.
    fn is_interactive(&self, handle: Self::Handle) -> bool;

    /// Get the size of the controlling terminal.
    fn size(&self) -> Option<Size>;

    /// Read the settings of the controlling terminal.
    fn read_settings(&self) -> Result<Self::Settings>;

    /// Normalize freshly captured settings before they become the original.
    fn prepare(&self, settings: Self::Settings) -> Self::Settings;

    /// Derive the settings for the mode from the original settings.
    fn configure(&self, original: &Self::Settings, mode: Mode) -> Self::Settings;

    /// Write the settings of the controlling terminal.
    fn write_settings(&self, settings: &Self::Settings, transition: Transition) -> Result<Applied>;

    /// Open the named terminal device for reading and writing.
    fn open(&self, name: &str) -> Result<Self::OwnedHandle>;

    /// Read from the handle with a single system call.
    fn read(&self, handle: Self::Handle, buffer: &mut [u8]) -> Result<usize>;

    /// Write to the handle with a single system call.
    fn write(&self, handle: Self::Handle, buffer: &[u8]) -> Result<usize>;

    /// Block until the handle accepts more output.
    fn wait_writable(&self, handle: Self::Handle) -> Result<()>;

    /// Create a new cancellation channel.
    fn channel(&self) -> Result<Self::Channel>;
}

/// A cross-thread wake-up for waits on handles.
///
/// Signalling is latched: A signal sent while no wait is outstanding makes the
/// next wait return [`Outcome::Cancelled`] right away. When a handle becomes
/// ready at the same time as the channel is signalled, cancellation wins.
pub trait CancellationChannel: Debug + Send + Sync + 'static {
    /// The handle type waited on.
    type Handle: Copy;

    /// The platform object the channel waits on.
    type Waitable: Copy + Debug;

    /// Get the waitable object underlying this channel.
    fn arm(&self) -> Self::Waitable;

    /// Signal cancellation. This method is safe to call from any thread.
    fn signal_cancel(&self);

    /// Clear a latched cancellation signal.
    fn reset(&self);

    /// Wait until the handle is ready for reading or the token is cancelled.
    ///
    /// The token's cancellation is forwarded to [`signal_cancel`](Self::signal_cancel)
    /// for the duration of the wait. After a cancelled wait, the channel is
    /// [`reset`](Self::reset) again, so that it can be reused with a fresh
    /// token.
    fn wait_for(&self, handle: Self::Handle, token: &CancellationToken) -> Result<Outcome>;
}
