//! Module to isolate unsafe Windows operations.
//!
//! This module abstracts over the underlying Windows API invocations for
//! managing console modes, reading from and writing to handles, and waiting on
//! console input with cancellation. They are safe, as long as the handles are
//! valid.

use std::fs::OpenOptions;
use std::io::{stderr, stdin, stdout, Error, ErrorKind, Result};
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};
use std::ptr::{from_mut, null, null_mut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use windows_sys::Win32::Foundation;
use windows_sys::Win32::Globalization;
use windows_sys::Win32::Storage::FileSystem;
use windows_sys::Win32::System::Console::{self, CONSOLE_MODE as ConsoleMode};
use windows_sys::Win32::System::Threading;

use super::util::{FlagList, IntoResult};
use super::{Applied, CancellationChannel, Outcome, Platform, RawHandle, Size, Stream, Transition};
use crate::cancel::CancellationToken;
use crate::opt::{Mode, Options};

/// A raw Windows handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Handle(pub RawHandle);

// SAFETY: Windows HANDLE is defined as a *mut c_void but most instances are
// thread-safe. In fact, Rust's standard library [implements `Send` and
// `Sync`](https://github.com/rust-lang/rust/blob/8e37e151835d96d6a7415e93e6876561485a3354/library/std/src/os/windows/io/handle.rs#L111),
// for wrapped handles, too. Also, reads through a handle are gated by a mutex.
unsafe impl Send for Handle {}
// SAFETY: See above.
unsafe impl Sync for Handle {}

const INPUT_DEVICE: &str = "CONIN$";
const OUTPUT_DEVICE: &str = "CONOUT$";

// ----------------------------------------------------------------------------------------------------------

#[derive(Debug)]
enum ConsoleHandle {
    Owned(OwnedHandle),
    StdIo(Handle),
}

impl ConsoleHandle {
    fn handle(&self) -> Handle {
        match self {
            Self::Owned(handle) => Handle(handle.as_raw_handle()),
            Self::StdIo(handle) => *handle,
        }
    }
}

fn is_console(handle: Handle) -> bool {
    let mut mode = 0;
    // SAFETY: GetConsoleMode() fails for handles other than console handles.
    unsafe { Console::GetConsoleMode(handle.0, from_mut(&mut mode)) } != 0
}

fn open_device(name: &str) -> Result<OwnedHandle> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .open(name)?
        .into())
}

fn locate(candidates: &[Handle], device: &str) -> Option<ConsoleHandle> {
    candidates
        .iter()
        .copied()
        .find(|handle| is_console(*handle))
        .map(ConsoleHandle::StdIo)
        .or_else(|| match open_device(device) {
            Ok(handle) => Some(ConsoleHandle::Owned(handle)),
            Err(error) => {
                tracing::debug!(device, %error, "no console");
                None
            }
        })
}

/// The Windows console primitives.
///
/// Console modes are split between the console input buffer and the active
/// screen buffer. This platform uses standard input for the former and
/// standard output or error for the latter, falling back on `CONIN$` and
/// `CONOUT$` if the standard streams have been redirected.
#[derive(Debug)]
pub struct Native {
    input: Option<ConsoleHandle>,
    output: Option<ConsoleHandle>,
}

impl Native {
    /// Locate the console.
    pub fn new(options: &Options) -> Self {
        let input = locate(
            &[Handle(stdin().as_raw_handle())],
            options.device().unwrap_or(INPUT_DEVICE),
        );
        let output = locate(
            &[Handle(stdout().as_raw_handle()), Handle(stderr().as_raw_handle())],
            options.device().unwrap_or(OUTPUT_DEVICE),
        );

        Self { input, output }
    }

    fn console(&self) -> Result<(Handle, Handle)> {
        match (self.input.as_ref(), self.output.as_ref()) {
            (Some(input), Some(output)) => Ok((input.handle(), output.handle())),
            _ => Err(Error::from_raw_os_error(
                Foundation::ERROR_INVALID_HANDLE as i32,
            )),
        }
    }

    fn read_mode(handle: Handle) -> Result<ConsoleMode> {
        let mut mode = 0;
        // SAFETY: The mode is an exclusively borrowed u32.
        unsafe { Console::GetConsoleMode(handle.0, from_mut(&mut mode)) }.into_result()?;
        Ok(mode)
    }

    fn write_mode(handle: Handle, mode: ConsoleMode) -> Result<()> {
        // SAFETY: SetConsoleMode() validates the handle.
        unsafe { Console::SetConsoleMode(handle.0, mode) }.into_result()?;
        Ok(())
    }
}

impl Platform for Native {
    type Handle = Handle;
    type OwnedHandle = OwnedHandle;
    type Settings = Settings;
    type Channel = EventChannel;

    fn standard(&self, stream: Stream) -> Handle {
        match stream {
            Stream::Input => Handle(stdin().as_raw_handle()),
            Stream::Output => Handle(stdout().as_raw_handle()),
            Stream::Error => Handle(stderr().as_raw_handle()),
        }
    }

    fn borrow(&self, handle: &OwnedHandle) -> Handle {
        Handle(handle.as_raw_handle())
    }

    fn is_valid(&self, handle: Handle, _: bool) -> bool {
        if handle.0.is_null() || handle.0 == Foundation::INVALID_HANDLE_VALUE {
            return false;
        }

        // SAFETY: GetFileType() reports FILE_TYPE_UNKNOWN for invalid handles.
        let kind = unsafe { FileSystem::GetFileType(handle.0) };
        kind != FileSystem::FILE_TYPE_UNKNOWN || Error::last_os_error().raw_os_error() == Some(0)
    }

    fn is_interactive(&self, handle: Handle) -> bool {
        is_console(handle)
    }

    fn size(&self) -> Option<Size> {
        let (_, output) = self.console().ok()?;
        // SAFETY: An all-zero CONSOLE_SCREEN_BUFFER_INFO is a valid value.
        let mut info = unsafe { std::mem::zeroed::<Console::CONSOLE_SCREEN_BUFFER_INFO>() };
        // SAFETY: The info is exclusively borrowed.
        unsafe { Console::GetConsoleScreenBufferInfo(output.0, from_mut(&mut info)) }
            .into_result()
            .ok()?;

        let window = info.srWindow;
        let columns = u16::try_from(window.Right - window.Left + 1).ok()?;
        let rows = u16::try_from(window.Bottom - window.Top + 1).ok()?;
        Some(Size::new(columns, rows))
    }

    fn read_settings(&self) -> Result<Settings> {
        let (input, output) = self.console()?;

        // SAFETY: Querying code pages has no preconditions.
        Ok(Settings {
            input_mode: Self::read_mode(input)?,
            input_encoding: unsafe { Console::GetConsoleCP() }.into_result()?,
            output_mode: Self::read_mode(output)?,
            output_encoding: unsafe { Console::GetConsoleOutputCP() }.into_result()?,
        })
    }

    fn prepare(&self, settings: Settings) -> Settings {
        settings
    }

    fn configure(&self, original: &Settings, mode: Mode) -> Settings {
        let mut input_mode = (original.input_mode | Console::ENABLE_VIRTUAL_TERMINAL_INPUT)
            & !(Console::ENABLE_MOUSE_INPUT | Console::ENABLE_WINDOW_INPUT);
        let cooked = Console::ENABLE_ECHO_INPUT
            | Console::ENABLE_LINE_INPUT
            | Console::ENABLE_PROCESSED_INPUT;

        match mode {
            Mode::Raw => input_mode &= !cooked,
            Mode::Cooked => input_mode |= cooked,
        }

        let output_mode = original.output_mode
            | Console::ENABLE_PROCESSED_OUTPUT
            | Console::ENABLE_VIRTUAL_TERMINAL_PROCESSING;

        Settings {
            input_mode,
            input_encoding: Globalization::CP_UTF8,
            output_mode,
            output_encoding: Globalization::CP_UTF8,
        }
    }

    fn write_settings(&self, settings: &Settings, transition: Transition) -> Result<Applied> {
        let (input, output) = self.console()?;
        tracing::trace!(?transition, ?settings, "writing console modes");

        // Always try all four updates, even if one of them fails.
        let result1 = Self::write_mode(input, settings.input_mode);
        // SAFETY: Setting code pages has no preconditions.
        let result2 = unsafe { Console::SetConsoleCP(settings.input_encoding) }.into_result();
        let result3 = Self::write_mode(output, settings.output_mode);
        // SAFETY: See above.
        let result4 =
            unsafe { Console::SetConsoleOutputCP(settings.output_encoding) }.into_result();

        result1.and(result2).and(result3).and(result4)?;
        Ok(Applied::Done)
    }

    fn open(&self, name: &str) -> Result<OwnedHandle> {
        open_device(name)
    }

    fn read(&self, handle: Handle, buffer: &mut [u8]) -> Result<usize> {
        let mut did_read: u32 = 0;
        // SAFETY: The buffer is valid for its length, which is clamped to u32.
        unsafe {
            FileSystem::ReadFile(
                handle.0,
                buffer.as_mut_ptr(),
                u32::try_from(buffer.len()).unwrap_or(u32::MAX),
                from_mut(&mut did_read),
                null_mut(),
            )
        }
        .into_result()?;
        Ok(did_read as usize)
    }

    fn write(&self, handle: Handle, buffer: &[u8]) -> Result<usize> {
        let mut did_write: u32 = 0;
        // SAFETY: The buffer is valid for its length, which is clamped to u32.
        unsafe {
            FileSystem::WriteFile(
                handle.0,
                buffer.as_ptr(),
                u32::try_from(buffer.len()).unwrap_or(u32::MAX),
                from_mut(&mut did_write),
                null_mut(),
            )
        }
        .into_result()?;
        Ok(did_write as usize)
    }

    fn wait_writable(&self, _: Handle) -> Result<()> {
        // Anonymous pipes and consoles don't support non-blocking writes.
        Ok(())
    }

    fn channel(&self) -> Result<EventChannel> {
        EventChannel::new()
    }
}

// ----------------------------------------------------------------------------------------------------------

/// The console modes and code pages.
#[derive(Clone, Copy)]
pub struct Settings {
    input_mode: ConsoleMode,
    input_encoding: u32,
    output_mode: ConsoleMode,
    output_encoding: u32,
}

impl Settings {
    /// Determine whether the settings disable line input, echo, and
    /// control-c processing.
    pub fn is_raw(&self) -> bool {
        self.input_mode
            & (Console::ENABLE_ECHO_INPUT
                | Console::ENABLE_LINE_INPUT
                | Console::ENABLE_PROCESSED_INPUT)
            == 0
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let input = FlagList::of(
            self.input_mode,
            &[
                ("ENABLE_ECHO_INPUT", Console::ENABLE_ECHO_INPUT),
                ("ENABLE_INSERT_MODE", Console::ENABLE_INSERT_MODE),
                ("ENABLE_LINE_INPUT", Console::ENABLE_LINE_INPUT),
                ("ENABLE_MOUSE_INPUT", Console::ENABLE_MOUSE_INPUT),
                ("ENABLE_PROCESSED_INPUT", Console::ENABLE_PROCESSED_INPUT),
                ("ENABLE_QUICK_EDIT_MODE", Console::ENABLE_QUICK_EDIT_MODE),
                ("ENABLE_WINDOW_INPUT", Console::ENABLE_WINDOW_INPUT),
                ("ENABLE_VIRTUAL_TERMINAL_INPUT", Console::ENABLE_VIRTUAL_TERMINAL_INPUT),
            ],
        );

        let output = FlagList::of(
            self.output_mode,
            &[
                ("ENABLE_PROCESSED_OUTPUT", Console::ENABLE_PROCESSED_OUTPUT),
                ("ENABLE_WRAP_AT_EOL_OUTPUT", Console::ENABLE_WRAP_AT_EOL_OUTPUT),
                ("ENABLE_VIRTUAL_TERMINAL_PROCESSING", Console::ENABLE_VIRTUAL_TERMINAL_PROCESSING),
                ("DISABLE_NEWLINE_AUTO_RETURN", Console::DISABLE_NEWLINE_AUTO_RETURN),
                ("ENABLE_LVB_GRID_WORLDWIDE", Console::ENABLE_LVB_GRID_WORLDWIDE),
            ],
        );

        f.debug_struct("Settings")
            .field("input_mode", &input)
            .field("input_encoding", &self.input_encoding)
            .field("output_mode", &output)
            .field("output_encoding", &self.output_encoding)
            .finish()
    }
}

// ----------------------------------------------------------------------------------------------------------

#[derive(Debug)]
struct Event(OwnedHandle);

impl Event {
    fn new() -> Result<Self> {
        // SAFETY: Manual reset, initially not signalled, and unnamed.
        let handle = unsafe { Threading::CreateEventW(null(), 1, 0, null()) };
        if handle.is_null() {
            return Err(Error::last_os_error());
        }

        // SAFETY: CreateEventW() returned a fresh handle nobody else owns.
        Ok(Self(unsafe { OwnedHandle::from_raw_handle(handle) }))
    }

    fn raw(&self) -> RawHandle {
        self.0.as_raw_handle()
    }

    fn set(&self) {
        // SAFETY: The event handle is owned and hence valid.
        let _ = unsafe { Threading::SetEvent(self.raw()) };
    }

    fn reset(&self) {
        // SAFETY: The event handle is owned and hence valid.
        let _ = unsafe { Threading::ResetEvent(self.raw()) };
    }

    fn is_set(&self) -> bool {
        // SAFETY: A zero timeout only polls the owned event.
        unsafe { Threading::WaitForSingleObject(self.raw(), 0) } == Foundation::WAIT_OBJECT_0
    }
}

/// Determine whether the console has key presses to read.
///
/// Console input handles are signalled for mouse, focus, and window events,
/// too. This function discards such records, so that a subsequent read
/// doesn't block.
fn has_key_input(handle: Handle) -> Result<bool> {
    let mut count: u32 = 0;
    // SAFETY: The count is exclusively borrowed.
    unsafe { Console::GetNumberOfConsoleInputEvents(handle.0, from_mut(&mut count)) }
        .into_result()?;
    if count == 0 {
        return Ok(false);
    }

    let mut records =
        // SAFETY: An all-zero INPUT_RECORD is a valid value.
        vec![unsafe { std::mem::zeroed::<Console::INPUT_RECORD>() }; count as usize];
    let mut did_peek: u32 = 0;
    // SAFETY: The records are valid for `count` entries.
    unsafe {
        Console::PeekConsoleInputW(
            handle.0,
            records.as_mut_ptr(),
            count,
            from_mut(&mut did_peek),
        )
    }
    .into_result()?;

    let ready = records[..did_peek as usize].iter().any(|record| {
        u32::from(record.EventType) == Console::KEY_EVENT
            // SAFETY: The event type determines the union variant.
            && unsafe { record.Event.KeyEvent.bKeyDown } != 0
    });

    if !ready {
        let mut did_discard: u32 = 0;
        // SAFETY: Only the records just peeked are consumed.
        unsafe {
            Console::ReadConsoleInputW(
                handle.0,
                records.as_mut_ptr(),
                did_peek,
                from_mut(&mut did_discard),
            )
        }
        .into_result()?;
    }

    Ok(ready)
}

/// A cancellation channel based on a manual-reset event.
///
/// Waiting waits on the event and the console input handle in one call, with
/// the event first, so that cancellation wins ties. Cancelling sets the event.
/// Handles other than console input cannot be waited on; for them, the
/// channel only checks for cancellation before returning
/// [`Outcome::Ready`].
///
/// A set event only wakes up the wait. The outcome is cancelled only if the
/// token has been cancelled or [`signal_cancel`](CancellationChannel::signal_cancel)
/// latched a request. An event set by the callback of an earlier token is
/// reset and ignored.
#[derive(Debug)]
pub struct EventChannel {
    event: Arc<Event>,
    latched: AtomicBool,
}

impl EventChannel {
    /// Create a new channel.
    pub fn new() -> Result<Self> {
        Ok(Self {
            event: Arc::new(Event::new()?),
            latched: AtomicBool::new(false),
        })
    }

    fn is_requested(&self, token: &CancellationToken) -> bool {
        token.is_cancelled() || self.latched.swap(false, Ordering::SeqCst)
    }
}

impl CancellationChannel for EventChannel {
    type Handle = Handle;
    type Waitable = Handle;

    fn arm(&self) -> Handle {
        Handle(self.event.raw())
    }

    fn signal_cancel(&self) {
        self.latched.store(true, Ordering::SeqCst);
        self.event.set();
    }

    fn reset(&self) {
        self.latched.store(false, Ordering::SeqCst);
        self.event.reset();
    }

    fn wait_for(&self, handle: Handle, token: &CancellationToken) -> Result<Outcome> {
        if token.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }

        if !is_console(handle) {
            if self.event.is_set() {
                self.event.reset();
                if self.is_requested(token) {
                    self.reset();
                    return Ok(Outcome::Cancelled);
                }
            }
            return Ok(Outcome::Ready);
        }

        let event = Arc::clone(&self.event);
        let registration = token.register(move || event.set());
        let handles = [self.event.raw(), handle.0];

        loop {
            // SAFETY: Both handles stay open for the duration of the wait.
            let status = unsafe {
                Threading::WaitForMultipleObjects(
                    handles.len() as u32,
                    handles.as_ptr(),
                    0,
                    Threading::INFINITE,
                )
            };

            if status == Foundation::WAIT_OBJECT_0 {
                self.event.reset();
                if self.is_requested(token) {
                    drop(registration);
                    self.reset();
                    return Ok(Outcome::Cancelled);
                }
                tracing::trace!("ignoring stale wake-up");
            } else if status == Foundation::WAIT_OBJECT_0 + 1 {
                if has_key_input(handle)? {
                    return Ok(Outcome::Ready);
                }
            } else if status == Foundation::WAIT_FAILED {
                return Err(Error::last_os_error());
            } else {
                return Err(ErrorKind::Other.into());
            }
        }
    }
}

// ----------------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::{EventChannel, Native, Settings};
    use crate::cancel::CancellationToken;
    use crate::opt::{Mode, Options};
    use crate::sys::{CancellationChannel, Outcome, Platform};
    use windows_sys::Win32::Globalization;
    use windows_sys::Win32::System::Console;

    fn settings() -> Settings {
        Settings {
            input_mode: Console::ENABLE_ECHO_INPUT
                | Console::ENABLE_LINE_INPUT
                | Console::ENABLE_PROCESSED_INPUT
                | Console::ENABLE_MOUSE_INPUT,
            input_encoding: 437,
            output_mode: Console::ENABLE_WRAP_AT_EOL_OUTPUT,
            output_encoding: 437,
        }
    }

    #[test]
    fn test_configure_raw_and_cooked() {
        let native = Native::new(&Options::default());
        let original = native.prepare(settings());
        assert!(!original.is_raw());

        let raw = native.configure(&original, Mode::Raw);
        assert!(raw.is_raw());
        assert_eq!(raw.input_mode & Console::ENABLE_MOUSE_INPUT, 0);
        assert_ne!(raw.input_mode & Console::ENABLE_VIRTUAL_TERMINAL_INPUT, 0);
        assert_ne!(raw.output_mode & Console::ENABLE_VIRTUAL_TERMINAL_PROCESSING, 0);
        assert_eq!(raw.input_encoding, Globalization::CP_UTF8);
        assert_eq!(raw.output_encoding, Globalization::CP_UTF8);

        let cooked = native.configure(&original, Mode::Cooked);
        assert!(!cooked.is_raw());
    }

    #[test]
    fn test_settings_debug() {
        let text = format!("{:?}", settings());
        assert!(text.contains("ENABLE_LINE_INPUT"));
        assert!(!text.contains("ENABLE_VIRTUAL_TERMINAL_INPUT"));
    }

    #[test]
    fn test_latched_signal() -> std::io::Result<()> {
        let channel = EventChannel::new()?;
        let handle = channel.arm();
        let token = CancellationToken::new();

        channel.signal_cancel();
        assert_eq!(channel.wait_for(handle, &token)?, Outcome::Cancelled);
        assert_eq!(channel.wait_for(handle, &token)?, Outcome::Ready);
        Ok(())
    }

    #[test]
    fn test_stale_wake_up_is_ignored() -> std::io::Result<()> {
        let channel = EventChannel::new()?;
        let handle = channel.arm();

        // A late callback of an earlier token only sets the event.
        channel.event.set();
        let token = CancellationToken::new();
        assert_eq!(channel.wait_for(handle, &token)?, Outcome::Ready);
        assert!(!channel.event.is_set());

        token.cancel();
        assert_eq!(channel.wait_for(handle, &token)?, Outcome::Cancelled);
        Ok(())
    }
}
