use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::err::{Error, Result};
use crate::opt::{Mode, Options};
use crate::sys::{Applied, Native, Platform, Size, Transition};

#[derive(Debug)]
struct State<S> {
    original: Option<S>,
    current: Option<S>,
    mode: Mode,
    changed: bool,
}

/// A terminal driver.
///
/// The driver owns the process-wide terminal state, i.e., the original settings
/// captured the first time they could be read, the settings most recently
/// applied, and whether the terminal is in raw or cooked mode. Since the mode
/// is a property of the terminal device, there should be only one driver per
/// process. Share it through an [`Arc`](std::sync::Arc) with all readers and
/// writers.
///
/// Dropping the driver restores the original settings, if the driver changed
/// them and [`Options::restore_on_drop`] is set. Alternatively, call
/// [`Driver::restore_settings`] before exit.
///
/// Mode changes from several threads are applied one at a time, with the last
/// request winning. Other processes attached to the same terminal may still
/// change its settings behind the driver's back.
pub struct Driver<P: Platform = Native> {
    platform: P,
    options: Options,
    state: Mutex<State<P::Settings>>,
}

impl Driver<Native> {
    /// Create a new driver for the native platform.
    pub fn new(options: Options) -> Self {
        Self::with_platform(Native::new(&options), options)
    }
}

impl<P: Platform> Driver<P> {
    /// Create a new driver for the given platform.
    pub fn with_platform(platform: P, options: Options) -> Self {
        let this = Self {
            platform,
            options,
            state: Mutex::new(State {
                original: None,
                current: None,
                mode: Mode::Cooked,
                changed: false,
            }),
        };

        // Capturing may fail without a terminal; set_raw_mode() tries again.
        let _ = this.capture(&mut this.lock());
        this
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, State<P::Settings>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn capture(&self, state: &mut State<P::Settings>) -> std::io::Result<P::Settings> {
        if let Some(original) = state.original.as_ref() {
            return Ok(original.clone());
        }

        let original = self.platform.prepare(self.platform.read_settings()?);
        tracing::debug!(settings = ?original, "captured original terminal settings");
        state.original = Some(original.clone());
        Ok(original)
    }

    /// Get the platform.
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Get the options.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Get the terminal mode last requested.
    pub fn mode(&self) -> Mode {
        self.lock().mode
    }

    /// Determine whether raw mode was last requested.
    pub fn is_raw_mode(&self) -> bool {
        self.mode().is_raw()
    }

    /// Get the original terminal settings, if they could be captured.
    pub fn original_settings(&self) -> Option<P::Settings> {
        self.lock().original.clone()
    }

    /// Determine whether the handle is open and usable. This method never
    /// fails; closed or dangling handles simply are not valid.
    pub fn is_handle_valid(&self, handle: P::Handle, for_writing: bool) -> bool {
        self.platform.is_valid(handle, for_writing)
    }

    /// Determine whether the handle is connected to a terminal.
    pub fn is_handle_interactive(&self, handle: P::Handle) -> bool {
        self.platform.is_interactive(handle)
    }

    /// Get the terminal's size in columns and rows.
    ///
    /// This method returns `None` if the process has no terminal or the
    /// terminal's size cannot be determined.
    pub fn size(&self) -> Option<Size> {
        self.platform.size()
    }

    /// Switch the terminal between raw and cooked mode.
    ///
    /// Requesting the current mode again is a no-op that succeeds without any
    /// system calls. If the process is running in a background process group
    /// while leaving raw mode, the update is abandoned without error; the
    /// settings are retained and [`Driver::refresh_settings`] reapplies them
    /// after the process regained the foreground.
    ///
    /// # Errors
    ///
    /// This method fails if the terminal settings cannot be read or written,
    /// including when the process has no terminal at all. Callers should treat
    /// the error as raw mode being unsupported in this environment.
    pub fn set_raw_mode(&self, enabled: bool) -> Result<()> {
        let target = Mode::from(enabled);
        let mut state = self.lock();
        if state.mode == target {
            return Ok(());
        }

        let original = self.capture(&mut state).map_err(Error::mode_change)?;
        let settings = self.platform.configure(&original, target);

        match self.platform.write_settings(&settings, Transition::to(target)) {
            Ok(applied) => {
                if applied == Applied::Deferred {
                    tracing::warn!(mode = ?target, "running in background, deferring terminal update");
                } else {
                    tracing::debug!(mode = ?target, "switched terminal mode");
                }

                state.current = Some(settings);
                state.mode = target;
                state.changed = true;
                Ok(())
            }
            Err(error) => {
                tracing::debug!(mode = ?target, %error, "could not switch terminal mode");
                Err(Error::mode_change(error))
            }
        }
    }

    /// Reapply the settings last applied.
    ///
    /// Call this method after the process regained the terminal, e.g., upon
    /// receiving `SIGCONT`. Failures are ignored since the terminal may have
    /// been detached.
    pub fn refresh_settings(&self) {
        let state = self.lock();
        if let Some(settings) = state.current.as_ref() {
            if let Err(error) = self.platform.write_settings(settings, Transition::Refresh) {
                tracing::debug!(%error, "could not refresh terminal settings");
            }
        }
    }

    /// Restore the original terminal settings.
    ///
    /// This method is best-effort and swallows errors, since the terminal may
    /// be gone by the time a process shuts down.
    pub fn restore_settings(&self) {
        let mut state = self.lock();
        let Some(original) = state.original.clone() else {
            return;
        };

        match self.platform.write_settings(&original, Transition::Restore) {
            Ok(_) => {
                tracing::debug!("restored original terminal settings");
                state.current = Some(original);
                state.mode = Mode::Cooked;
            }
            Err(error) => {
                tracing::warn!(%error, "could not restore original terminal settings");
            }
        }
    }

    /// Open the named terminal device for reading and writing.
    ///
    /// The device does not become the controlling terminal and its handle is
    /// not inherited by child processes.
    ///
    /// # Errors
    ///
    /// This method fails if the device cannot be opened.
    pub fn open_terminal_handle(&self, name: &str) -> Result<P::OwnedHandle> {
        self.platform.open(name).map_err(|e| Error::open(name, e))
    }

    /// Create a new cancellation channel.
    ///
    /// # Errors
    ///
    /// This method fails if the operating system refuses to create the pipe or
    /// event backing the channel.
    pub fn create_cancellation_channel(&self) -> Result<P::Channel> {
        self.platform.channel().map_err(Error::channel)
    }
}

impl<P: Platform> std::fmt::Debug for Driver<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("options", &self.options)
            .field("state", &*self.lock())
            .finish()
    }
}

impl<P: Platform> Drop for Driver<P> {
    fn drop(&mut self) {
        let changed = self.lock().changed;
        if changed && self.options.restore_on_drop() {
            self.restore_settings();
        }
    }
}
