//! Module to isolate unsafe libc operations.
//!
//! This module abstracts over the underlying libc invocations for managing the
//! terminal configuration, reading from and writing to descriptors, and waiting
//! on descriptors with cancellation. They are safe, as long as the file
//! descriptors are valid.

use std::ffi::c_void;
use std::fs::OpenOptions;
use std::io::{stderr, stdin, stdout, Error, ErrorKind, Result};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::ptr::{from_mut, from_ref};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::signal::SignalGuard;
use super::util::{retry_interrupted, FlagList, IntoResult};
use super::{
    Applied, CancellationChannel, Outcome, Platform, RawHandle, Size, Stream, Transition,
};
use crate::cancel::CancellationToken;
use crate::opt::{Mode, Options};

/// A raw file descriptor.
pub type Handle = RawHandle;

/// The default terminal device.
const DEVICE: &str = "/dev/tty";

// ----------------------------------------------------------------------------------------------------------

#[derive(Debug)]
enum TerminalHandle {
    Owned(OwnedFd),
    StdIo(RawHandle),
}

impl TerminalHandle {
    fn handle(&self) -> RawHandle {
        match self {
            Self::Owned(handle) => handle.as_raw_fd(),
            Self::StdIo(handle) => *handle,
        }
    }
}

/// The Unix terminal primitives.
///
/// Terminal settings and size are read from and written to the first standard
/// stream that is connected to a terminal. If all three standard streams have
/// been redirected, this platform falls back on the terminal device, usually
/// `/dev/tty`. If that fails, too, the process has no controlling terminal and
/// mode changes fail with `ENOTTY`.
#[derive(Debug)]
pub struct Native {
    terminal: Option<TerminalHandle>,
}

impl Native {
    /// Locate the controlling terminal.
    pub fn new(options: &Options) -> Self {
        let terminal = [stdin().as_raw_fd(), stdout().as_raw_fd(), stderr().as_raw_fd()]
            .into_iter()
            // SAFETY: isatty() accepts any integer.
            .find(|fd| unsafe { libc::isatty(*fd) } == 1)
            .map(TerminalHandle::StdIo)
            .or_else(|| {
                let name = options.device().unwrap_or(DEVICE);
                match open_device(name) {
                    Ok(fd) => Some(TerminalHandle::Owned(fd)),
                    Err(error) => {
                        tracing::debug!(device = name, %error, "no controlling terminal");
                        None
                    }
                }
            });

        Self { terminal }
    }

    fn terminal(&self) -> Result<RawHandle> {
        self.terminal
            .as_ref()
            .map(TerminalHandle::handle)
            .ok_or_else(|| Error::from_raw_os_error(libc::ENOTTY))
    }
}

fn open_device(name: &str) -> Result<OwnedFd> {
    // The standard library adds O_CLOEXEC.
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY)
        .open(name)?
        .into())
}

fn normalize(state: &mut libc::termios) {
    state.c_iflag &= !(libc::IGNBRK
        | libc::BRKINT
        | libc::IGNPAR
        | libc::PARMRK
        | libc::INPCK
        | libc::ISTRIP
        | libc::INLCR
        | libc::IGNCR
        | libc::IXANY
        | libc::IXOFF);
    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios"
    ))]
    {
        state.c_iflag |= libc::IUTF8;
    }

    state.c_cflag &= !(libc::CSIZE | libc::PARENB);
    state.c_cflag |= libc::CS8 | libc::CREAD;

    state.c_lflag &= !libc::ECHONL;
    state.c_lflag |= libc::ECHOE | libc::ECHOK;
}

impl Platform for Native {
    type Handle = Handle;
    type OwnedHandle = OwnedFd;
    type Settings = Settings;
    type Channel = PipeChannel;

    fn standard(&self, stream: Stream) -> Handle {
        match stream {
            Stream::Input => stdin().as_raw_fd(),
            Stream::Output => stdout().as_raw_fd(),
            Stream::Error => stderr().as_raw_fd(),
        }
    }

    fn borrow(&self, handle: &OwnedFd) -> Handle {
        handle.as_raw_fd()
    }

    fn is_valid(&self, handle: Handle, for_writing: bool) -> bool {
        // SAFETY: F_GETFL only inspects the descriptor and fails with EBADF
        // for closed descriptors.
        let flags = unsafe { libc::fcntl(handle, libc::F_GETFL) };
        if flags == -1 {
            return false;
        }

        let access = flags & libc::O_ACCMODE;
        access == libc::O_RDWR
            || access == if for_writing { libc::O_WRONLY } else { libc::O_RDONLY }
    }

    fn is_interactive(&self, handle: Handle) -> bool {
        // SAFETY: isatty() accepts any integer.
        unsafe { libc::isatty(handle) == 1 }
    }

    fn size(&self) -> Option<Size> {
        let handle = self.terminal().ok()?;
        // SAFETY: An all-zero winsize is a valid value.
        let mut size: libc::winsize = unsafe { std::mem::zeroed() };
        // SAFETY: TIOCGWINSZ writes a winsize into the exclusively borrowed struct.
        unsafe { libc::ioctl(handle, libc::TIOCGWINSZ, from_mut(&mut size)) }
            .into_result()
            .ok()?;

        if size.ws_col == 0 && size.ws_row == 0 {
            None
        } else {
            Some(Size::new(size.ws_col, size.ws_row))
        }
    }

    fn read_settings(&self) -> Result<Settings> {
        let handle = self.terminal()?;
        let mut state = std::mem::MaybeUninit::uninit();
        // SAFETY: tcgetattr() initializes the struct upon success.
        unsafe { libc::tcgetattr(handle, state.as_mut_ptr()) }.into_result()?;
        Ok(Settings {
            // SAFETY: tcgetattr() succeeded and hence initialized the struct.
            state: unsafe { state.assume_init() },
        })
    }

    fn prepare(&self, mut settings: Settings) -> Settings {
        // Reads rely on blocking for at least one byte without timeout.
        settings.state.c_cc[libc::VMIN] = 1;
        settings.state.c_cc[libc::VTIME] = 0;
        settings
    }

    fn configure(&self, original: &Settings, mode: Mode) -> Settings {
        let mut state = original.state;
        normalize(&mut state);

        match mode {
            Mode::Raw => {
                state.c_iflag &= !(libc::ICRNL | libc::IXON);
                state.c_lflag &= !(libc::ISIG | libc::ICANON | libc::ECHO | libc::IEXTEN);
                state.c_cc[libc::VMIN] = 1;
                state.c_cc[libc::VTIME] = 0;
            }
            Mode::Cooked => {
                state.c_lflag |= libc::ISIG | libc::ICANON | libc::ECHO;
            }
        }

        Settings { state }
    }

    fn write_settings(&self, settings: &Settings, transition: Transition) -> Result<Applied> {
        let handle = self.terminal()?;

        // A background process group gets SIGTTOU for tcsetattr(). By default,
        // that stops the process. The guard turns the signal into EINTR.
        let (action, guard) = if transition.is_leaving() {
            (libc::TCSAFLUSH, Some(SignalGuard::new(libc::SIGTTOU)?))
        } else {
            (libc::TCSANOW, None)
        };

        loop {
            // SAFETY: The settings were read by tcgetattr() and then modified.
            match unsafe { libc::tcsetattr(handle, action, from_ref(&settings.state)) }.into_result()
            {
                Ok(_) => return Ok(Applied::Done),
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {
                    if guard.as_ref().is_some_and(SignalGuard::fired) {
                        return Ok(Applied::Deferred);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn open(&self, name: &str) -> Result<OwnedFd> {
        open_device(name)
    }

    fn read(&self, handle: Handle, buffer: &mut [u8]) -> Result<usize> {
        // SAFETY: The buffer is valid for its length.
        unsafe {
            libc::read(
                handle,
                buffer.as_mut_ptr() as *mut c_void,
                buffer.len() as libc::size_t,
            )
        }
        .into_result()
    }

    fn write(&self, handle: Handle, buffer: &[u8]) -> Result<usize> {
        // SAFETY: The buffer is valid for its length.
        unsafe {
            libc::write(
                handle,
                buffer.as_ptr() as *const c_void,
                buffer.len() as libc::size_t,
            )
        }
        .into_result()
    }

    fn wait_writable(&self, handle: Handle) -> Result<()> {
        let mut fds = [libc::pollfd {
            fd: handle,
            events: libc::POLLOUT,
            revents: 0,
        }];

        retry_interrupted(|| {
            // SAFETY: The array is valid for its length.
            unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) }.into_result()
        })?;
        Ok(())
    }

    fn channel(&self) -> Result<PipeChannel> {
        PipeChannel::new()
    }
}

// ----------------------------------------------------------------------------------------------------------

/// The terminal attributes.
///
/// By wrapping the underlying libc type, this struct enables a meaningful
/// debug representation.
#[derive(Clone, Copy)]
pub struct Settings {
    state: libc::termios,
}

impl Settings {
    /// Determine whether the settings disable canonical input, echo, and
    /// signals.
    pub fn is_raw(&self) -> bool {
        self.state.c_lflag & (libc::ISIG | libc::ICANON | libc::ECHO) == 0
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let input = FlagList::of(
            self.state.c_iflag,
            &[
                ("BRKINT", libc::BRKINT),
                ("ICRNL", libc::ICRNL),
                ("IGNBRK", libc::IGNBRK),
                ("IGNCR", libc::IGNCR),
                ("INLCR", libc::INLCR),
                ("INPCK", libc::INPCK),
                ("ISTRIP", libc::ISTRIP),
                ("IXANY", libc::IXANY),
                ("IXOFF", libc::IXOFF),
                ("IXON", libc::IXON),
            ],
        );

        let output = FlagList::of(
            self.state.c_oflag,
            &[
                ("OPOST", libc::OPOST),
                ("ONLCR", libc::ONLCR),
                ("OCRNL", libc::OCRNL),
                ("ONOCR", libc::ONOCR),
                ("ONLRET", libc::ONLRET),
            ],
        );

        let local = FlagList::of(
            self.state.c_lflag,
            &[
                ("ECHO", libc::ECHO),
                ("ECHOE", libc::ECHOE),
                ("ECHOK", libc::ECHOK),
                ("ECHONL", libc::ECHONL),
                ("ICANON", libc::ICANON),
                ("IEXTEN", libc::IEXTEN),
                ("ISIG", libc::ISIG),
                ("NOFLSH", libc::NOFLSH),
            ],
        );

        f.debug_struct("Settings")
            .field("input", &input)
            .field("output", &output)
            .field("local", &local)
            .field("vmin", &self.state.c_cc[libc::VMIN])
            .field("vtime", &self.state.c_cc[libc::VTIME])
            .finish()
    }
}

// ----------------------------------------------------------------------------------------------------------

#[derive(Debug)]
struct Pipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl Pipe {
    fn new() -> Result<Self> {
        let mut fds: [RawHandle; 2] = [-1; 2];
        // SAFETY: The array has room for two descriptors.
        unsafe { libc::pipe(fds.as_mut_ptr()) }.into_result()?;
        // SAFETY: pipe() succeeded and returned two descriptors nobody else owns.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        for fd in [read.as_raw_fd(), write.as_raw_fd()] {
            // SAFETY: The descriptors are valid for the duration of the calls.
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFD).into_result()?;
                libc::fcntl(fd, libc::F_SETFD, flags as libc::c_int | libc::FD_CLOEXEC)
                    .into_result()?;
                let flags = libc::fcntl(fd, libc::F_GETFL).into_result()?;
                libc::fcntl(fd, libc::F_SETFL, flags as libc::c_int | libc::O_NONBLOCK)
                    .into_result()?;
            }
        }

        Ok(Self { read, write })
    }

    fn signal(&self) {
        let byte = 1_u8;
        // A full pipe already is signalled, so EAGAIN is fine.
        let _ = retry_interrupted(|| {
            // SAFETY: The byte is valid for one byte.
            unsafe { libc::write(self.write.as_raw_fd(), from_ref(&byte).cast(), 1) }
                .into_result()
        });
    }

    fn drain(&self) {
        let mut buffer = [0_u8; 32];
        loop {
            let result = retry_interrupted(|| {
                // SAFETY: The buffer is valid for its length.
                unsafe {
                    libc::read(
                        self.read.as_raw_fd(),
                        buffer.as_mut_ptr() as *mut c_void,
                        buffer.len(),
                    )
                }
                .into_result()
            });

            match result {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            }
        }
    }
}

/// A cancellation channel based on the self-pipe trick.
///
/// Waiting polls the target descriptor and the pipe's read end in the same
/// system call. Cancelling writes a byte into the pipe's write end, which
/// wakes up the poll. Both ends are non-blocking and close-on-exec.
///
/// A byte in the pipe only wakes up the wait. The outcome is cancelled only if
/// the token has been cancelled or [`signal_cancel`](CancellationChannel::signal_cancel)
/// latched a request. Bytes written by the callback of an earlier token are
/// drained and ignored.
#[derive(Debug)]
pub struct PipeChannel {
    pipe: Arc<Pipe>,
    latched: AtomicBool,
}

impl PipeChannel {
    /// Create a new channel.
    pub fn new() -> Result<Self> {
        Ok(Self {
            pipe: Arc::new(Pipe::new()?),
            latched: AtomicBool::new(false),
        })
    }
}

impl CancellationChannel for PipeChannel {
    type Handle = Handle;
    type Waitable = RawHandle;

    fn arm(&self) -> RawHandle {
        self.pipe.read.as_raw_fd()
    }

    fn signal_cancel(&self) {
        self.latched.store(true, Ordering::SeqCst);
        self.pipe.signal();
    }

    fn reset(&self) {
        self.latched.store(false, Ordering::SeqCst);
        self.pipe.drain();
    }

    fn wait_for(&self, handle: Handle, token: &CancellationToken) -> Result<Outcome> {
        if token.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }

        let pipe = Arc::clone(&self.pipe);
        let registration = token.register(move || pipe.signal());

        // The pipe comes first, so that it wins ties.
        let mut fds = [
            libc::pollfd {
                fd: self.pipe.read.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: handle,
                events: libc::POLLIN,
                revents: 0,
            },
        ];

        loop {
            retry_interrupted(|| {
                // SAFETY: The array is valid for its length.
                unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) }
                    .into_result()
            })?;

            if fds[0].revents != 0 {
                self.pipe.drain();
                if token.is_cancelled() || self.latched.swap(false, Ordering::SeqCst) {
                    drop(registration);
                    self.reset();
                    return Ok(Outcome::Cancelled);
                }
                tracing::trace!("ignoring stale wake-up");
            }

            if fds[1].revents != 0 {
                return Ok(Outcome::Ready);
            }
        }
    }
}

// ----------------------------------------------------------------------------------------------------------
