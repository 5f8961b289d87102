//! Helper module with the options for driving terminals.
//!
//! This module provides the options for a terminal driver and the
//! corresponding builder.
//!
//!
//! # Example
//!
//! ```
//! # use rawtty::opt::{Mode, Options};
//! let options = Options::builder()
//!     .mode(Mode::Raw)
//!     .restore_on_drop(false)
//!     .build();
//!
//! assert_eq!(options.mode(), Mode::Raw);
//! assert!(!options.restore_on_drop());
//! ```

/// A terminal input mode.
///
/// The mode is a property of the terminal device, not of a file descriptor or
/// handle. Switching modes hence affects every reader and writer of that
/// terminal, including those in other processes.
///
///   * __Cooked mode__ is the usual mode of operation. The terminal edits the
///     input line by line, echoes typed characters, and turns key presses such
///     as control-c into signals.
///
///   * __Raw mode__ delivers bytes as they are typed, without line editing,
///     echo, or signal generation. Reads block until at least one byte is
///     available.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Mode {
    /// Line editing, echo, and signals.
    #[default]
    Cooked,
    /// Byte at a time without echo or signals.
    Raw,
}

impl Mode {
    /// Determine whether this mode is raw mode.
    pub const fn is_raw(&self) -> bool {
        matches!(self, Self::Raw)
    }
}

impl From<bool> for Mode {
    fn from(raw: bool) -> Self {
        if raw {
            Self::Raw
        } else {
            Self::Cooked
        }
    }
}

#[derive(Clone, Debug)]
struct OptionData {
    device: Option<String>,
    mode: Mode,
    restore_on_drop: bool,
}

impl OptionData {
    pub const fn new() -> Self {
        Self {
            device: None,
            mode: Mode::Cooked,
            restore_on_drop: true,
        }
    }
}

/// A builder of options objects.
#[derive(Debug)]
pub struct OptionBuilder(OptionData);

impl OptionBuilder {
    /// Set the name of the terminal device.
    ///
    /// The device is only opened if none of the standard streams is connected
    /// to a terminal. Without an explicit name, the driver uses `/dev/tty` on
    /// Unix and `CONIN$` as well as `CONOUT$` on Windows.
    pub fn device(&mut self, name: impl Into<String>) -> &mut Self {
        self.0.device = Some(name.into());
        self
    }

    /// Set the mode applied when opening a terminal.
    pub fn mode(&mut self, mode: Mode) -> &mut Self {
        self.0.mode = mode;
        self
    }

    /// Set whether dropping the last driver reference restores the original
    /// terminal settings.
    pub fn restore_on_drop(&mut self, restore: bool) -> &mut Self {
        self.0.restore_on_drop = restore;
        self
    }

    /// Instantiate the options.
    pub fn build(&self) -> Options {
        Options(self.0.clone())
    }
}

/// An options object.
#[derive(Clone, Debug)]
pub struct Options(OptionData);

impl Default for Options {
    fn default() -> Self {
        Options(OptionData::new())
    }
}

impl Options {
    /// Create a new builder with the default option values.
    pub fn builder() -> OptionBuilder {
        OptionBuilder(OptionData::new())
    }

    /// Instantiate the default options but with raw mode.
    pub fn raw() -> Options {
        Self::builder().mode(Mode::Raw).build()
    }

    /// Get the explicitly configured device name.
    pub fn device(&self) -> Option<&str> {
        self.0.device.as_deref()
    }

    /// Get the mode applied when opening a terminal.
    pub fn mode(&self) -> Mode {
        self.0.mode
    }

    /// Determine whether dropping the driver restores the original settings.
    pub fn restore_on_drop(&self) -> bool {
        self.0.restore_on_drop
    }
}

#[cfg(test)]
mod test {
    use super::{Mode, Options};

    #[test]
    fn test_defaults() {
        let options = Options::default();
        assert_eq!(options.device(), None);
        assert_eq!(options.mode(), Mode::Cooked);
        assert!(options.restore_on_drop());
        assert!(Options::raw().mode().is_raw());
    }

    #[test]
    fn test_builder() {
        let options = Options::builder()
            .device("/dev/ttys004")
            .restore_on_drop(false)
            .build();
        assert_eq!(options.device(), Some("/dev/ttys004"));
        assert!(!options.restore_on_drop());
        assert_eq!(Mode::from(true), Mode::Raw);
        assert_eq!(Mode::from(false), Mode::Cooked);
    }
}
