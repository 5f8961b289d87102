//! Helper module with this crate's error type.
//!
//! Terminal errors complement I/O errors by recording what the crate was trying
//! to do when the operating system objected, including the logical name of the
//! stream involved. Cancellation is an error of its own, so that callers can
//! tell a user or timeout cancellation apart from a failing device. Errors
//! seamlessly convert to I/O errors.
//!
//! Conditions that are normal for redirected streams, such as a closed pipe or
//! a handle that isn't a terminal, are not errors. They surface as `false`,
//! `None`, or a zero byte count instead.

/// The enumeration of error kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The operation was cancelled through its cancellation token.
    Cancelled,
    /// The terminal could not be switched between raw and cooked mode.
    ModeChange,
    /// A terminal device could not be opened.
    Open,
    /// Reading from a stream failed.
    Read,
    /// Writing to a stream failed.
    Write,
    /// A cancellation channel could not be created or waited on.
    Channel,
}

impl ErrorKind {
    /// Turn the error kind to an error message.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cancelled => "terminal operation was cancelled",
            Self::ModeChange => "could not change raw mode setting",
            Self::Open => "could not open terminal device",
            Self::Read => "could not read from terminal stream",
            Self::Write => "could not write to terminal stream",
            Self::Channel => "could not use cancellation channel",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A terminal error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The operation was cancelled.
    #[error("terminal operation was cancelled")]
    Cancelled,

    /// The terminal rejected a mode change.
    #[error("could not change raw mode setting: {source}")]
    ModeChange {
        #[source]
        source: std::io::Error,
    },

    /// The named device could not be opened.
    #[error("could not open {name}: {source}")]
    Open {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// Reading from the named stream failed.
    #[error("could not read from {name}: {source}")]
    Read {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// Writing to the named stream failed.
    #[error("could not write to {name}: {source}")]
    Write {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// The cancellation channel failed.
    #[error("could not use cancellation channel: {source}")]
    Channel {
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Create a new mode change error.
    pub fn mode_change(source: std::io::Error) -> Self {
        Self::ModeChange { source }
    }

    /// Create a new open error.
    pub fn open(name: impl Into<String>, source: std::io::Error) -> Self {
        Self::Open {
            name: name.into(),
            source,
        }
    }

    /// Create a new read error.
    pub fn read(name: impl Into<String>, source: std::io::Error) -> Self {
        Self::Read {
            name: name.into(),
            source,
        }
    }

    /// Create a new write error.
    pub fn write(name: impl Into<String>, source: std::io::Error) -> Self {
        Self::Write {
            name: name.into(),
            source,
        }
    }

    /// Create a new channel error.
    pub fn channel(source: std::io::Error) -> Self {
        Self::Channel { source }
    }

    /// Get the error kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Cancelled => ErrorKind::Cancelled,
            Self::ModeChange { .. } => ErrorKind::ModeChange,
            Self::Open { .. } => ErrorKind::Open,
            Self::Read { .. } => ErrorKind::Read,
            Self::Write { .. } => ErrorKind::Write,
            Self::Channel { .. } => ErrorKind::Channel,
        }
    }

    /// Determine whether this error is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Get the underlying I/O error, if any.
    pub fn io_error(&self) -> Option<&std::io::Error> {
        match self {
            Self::Cancelled => None,
            Self::ModeChange { source }
            | Self::Open { source, .. }
            | Self::Read { source, .. }
            | Self::Write { source, .. }
            | Self::Channel { source } => Some(source),
        }
    }

    /// Get the operating system's error code, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        self.io_error().and_then(std::io::Error::raw_os_error)
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        let kind = match value.io_error() {
            Some(source) => source.kind(),
            None => std::io::ErrorKind::Other,
        };
        Self::new(kind, value)
    }
}

/// A specialized result type for terminal operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod test {
    use super::{Error, ErrorKind};

    #[test]
    fn test_kinds_and_codes() {
        let error = Error::read("stdin", std::io::Error::from_raw_os_error(5));
        assert_eq!(error.kind(), ErrorKind::Read);
        assert_eq!(error.raw_os_error(), Some(5));
        assert!(error.to_string().starts_with("could not read from stdin: "));

        let cancelled = Error::Cancelled;
        assert!(cancelled.is_cancelled());
        assert_eq!(cancelled.raw_os_error(), None);
        assert_eq!(cancelled.kind().as_str(), "terminal operation was cancelled");
    }

    #[test]
    fn test_into_io_error() {
        let error: std::io::Error =
            Error::open("/dev/nope", std::io::ErrorKind::NotFound.into()).into();
        assert_eq!(error.kind(), std::io::ErrorKind::NotFound);

        let error: std::io::Error = Error::Cancelled.into();
        assert_eq!(error.kind(), std::io::ErrorKind::Other);
        let inner = error
            .get_ref()
            .and_then(|e| e.downcast_ref::<Error>())
            .map(Error::kind);
        assert_eq!(inner, Some(ErrorKind::Cancelled));
    }
}
