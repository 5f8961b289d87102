use std::io::ErrorKind;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::cancel::CancellationToken;
use crate::driver::Driver;
use crate::err::{Error, Result};
use crate::sys::{CancellationChannel, Native, Outcome, Platform};

/// A lock serializing reads from the same handle.
///
/// Clones share the same mutex. All readers of one handle should use clones of
/// one lock, so that concurrent reads cannot interleave their bytes. A lock
/// poisoned by a panicking reader is recovered, since it guards no data.
#[derive(Clone, Debug, Default)]
pub struct ReadLock {
    inner: Arc<Mutex<()>>,
}

impl ReadLock {
    /// Create a new lock.
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire(&self) -> MutexGuard<'_, ()> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A cancellable reader.
///
/// A reader blocks until its handle has data or the caller's cancellation
/// token fires, whichever comes first. When both happen at the same time,
/// cancellation wins. Reads retry after interruption by signals, fall back on
/// waiting when a non-blocking handle has no data, and report broken pipes as
/// end-of-stream.
///
/// Validity and interactivity are determined once, when the reader is
/// created. Reads from an invalid handle return zero bytes, which makes a
/// missing standard input look like an empty one.
pub struct Reader<P: Platform = Native> {
    driver: Arc<Driver<P>>,
    name: String,
    handle: P::Handle,
    lock: ReadLock,
    channel: P::Channel,
    valid: bool,
    interactive: bool,
}

impl<P: Platform> Reader<P> {
    /// Create a new reader for the handle.
    ///
    /// The name identifies the handle in errors. The lock should be shared
    /// with all other readers of the same handle.
    ///
    /// # Errors
    ///
    /// This method fails if the cancellation channel cannot be created.
    pub fn new(
        driver: Arc<Driver<P>>,
        name: impl Into<String>,
        handle: P::Handle,
        lock: ReadLock,
    ) -> Result<Self> {
        let channel = driver.create_cancellation_channel()?;
        let valid = driver.is_handle_valid(handle, false);
        let interactive = valid && driver.is_handle_interactive(handle);

        Ok(Self {
            driver,
            name: name.into(),
            handle,
            lock,
            channel,
            valid,
            interactive,
        })
    }

    /// Get the handle's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the handle.
    pub fn handle(&self) -> P::Handle {
        self.handle
    }

    /// Determine whether the handle was usable for reading upon creation.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Determine whether the handle was connected to a terminal upon creation.
    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    /// Get the lock serializing reads from the handle.
    pub fn lock(&self) -> &ReadLock {
        &self.lock
    }

    /// Get the driver.
    pub fn driver(&self) -> &Arc<Driver<P>> {
        &self.driver
    }

    /// Read into the buffer.
    ///
    /// This method returns the number of bytes read, which may be less than
    /// the buffer's length. Zero bytes signal end-of-stream, an empty buffer,
    /// or an invalid handle.
    ///
    /// # Errors
    ///
    /// This method fails with [`Error::Cancelled`] if the token was cancelled
    /// before data became available, and with [`Error::Read`] if the system
    /// call failed for any other reason than interruption, absent data, or a
    /// broken pipe.
    pub fn read(&self, buffer: &mut [u8], token: &CancellationToken) -> Result<usize> {
        if buffer.is_empty() || !self.valid {
            return Ok(0);
        }

        let _guard = self.lock.acquire();
        loop {
            if self.channel.wait_for(self.handle, token).map_err(Error::channel)?
                == Outcome::Cancelled
            {
                tracing::debug!(name = %self.name, "read was cancelled");
                return Err(Error::Cancelled);
            }

            let result = loop {
                match self.driver.platform().read(self.handle, buffer) {
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                    result => break result,
                }
            };

            match result {
                Ok(count) => {
                    tracing::trace!(name = %self.name, count, "read bytes");
                    return Ok(count);
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(ref e) if e.kind() == ErrorKind::BrokenPipe || e.raw_os_error() == Some(0) => {
                    tracing::trace!(name = %self.name, "read hit broken pipe");
                    return Ok(0);
                }
                Err(e) => return Err(Error::read(self.name.as_str(), e)),
            }
        }
    }

    /// Read a single byte.
    ///
    /// This method returns `None` at end-of-stream.
    ///
    /// # Errors
    ///
    /// See [`Reader::read`].
    pub fn read_byte(&self, token: &CancellationToken) -> Result<Option<u8>> {
        let mut buffer = [0_u8; 1];
        let count = self.read(&mut buffer, token)?;
        Ok((count == 1).then_some(buffer[0]))
    }
}

impl<P: Platform> std::fmt::Debug for Reader<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("name", &self.name)
            .field("handle", &self.handle)
            .field("channel", &self.channel)
            .field("valid", &self.valid)
            .field("interactive", &self.interactive)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::{ReadLock, Reader};
    use crate::cancel::CancellationToken;
    use crate::driver::Driver;
    use crate::err::ErrorKind;
    use crate::mock::{Call, Mock};
    use crate::opt::Options;
    use std::io::{Error, ErrorKind as IoErrorKind};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn reader(handle: i32) -> Reader<Mock> {
        let driver = Arc::new(Driver::with_platform(Mock::new(), Options::default()));
        Reader::new(driver, "mock input", handle, ReadLock::new()).unwrap()
    }

    fn mock(reader: &Reader<Mock>) -> &Mock {
        reader.driver().platform()
    }

    #[test]
    fn test_metadata() {
        let reader = reader(0);
        assert_eq!(reader.name(), "mock input");
        assert_eq!(reader.handle(), 0);
        assert!(reader.is_valid());
        assert!(reader.is_interactive());

        let reader = self::reader(-1);
        assert!(!reader.is_valid());
        assert!(!reader.is_interactive());
    }

    #[test]
    fn test_nothing_to_read() {
        let reader = reader(0);
        let token = CancellationToken::new();
        assert_eq!(reader.read(&mut [], &token).unwrap(), 0);
        assert_eq!(mock(&reader).count(Call::Wait), 0);
        assert_eq!(mock(&reader).count(Call::Read), 0);

        let reader = self::reader(-1);
        let mut buffer = [0; 8];
        assert_eq!(reader.read(&mut buffer, &token).unwrap(), 0);
        assert_eq!(mock(&reader).count(Call::Read), 0);
    }

    #[test]
    fn test_cancelled_before_read() {
        let reader = reader(0);
        mock(&reader).push_input(b"data");
        let token = CancellationToken::new();
        token.cancel();

        let mut buffer = [0; 8];
        let error = reader.read(&mut buffer, &token).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Cancelled);
        assert_eq!(mock(&reader).count(Call::Read), 0);

        // The reader remains usable with a fresh token.
        let token = CancellationToken::new();
        assert_eq!(reader.read(&mut buffer, &token).unwrap(), 4);
        assert_eq!(&buffer[..4], b"data");
    }

    #[test]
    fn test_retry_and_fall_back() {
        let reader = reader(0);
        let mock = mock(&reader);
        mock.push_read_error(Error::from(IoErrorKind::Interrupted));
        mock.push_read_error(Error::from(IoErrorKind::Interrupted));
        mock.push_read_error(Error::from(IoErrorKind::WouldBlock));
        mock.push_input(b"abc");

        let mut buffer = [0; 2];
        let token = CancellationToken::new();
        assert_eq!(reader.read(&mut buffer, &token).unwrap(), 2);
        assert_eq!(&buffer, b"ab");
        assert_eq!(reader.read_byte(&token).unwrap(), Some(b'c'));
        assert_eq!(mock.count(Call::Read), 5);
    }

    #[test]
    fn test_end_of_stream() {
        let reader = reader(0);
        let mock = mock(&reader);
        let token = CancellationToken::new();

        mock.push_read_error(Error::from(IoErrorKind::BrokenPipe));
        assert_eq!(reader.read_byte(&token).unwrap(), None);

        mock.push_read_error(Error::from_raw_os_error(0));
        assert_eq!(reader.read_byte(&token).unwrap(), None);

        mock.push_input(b"");
        assert_eq!(reader.read_byte(&token).unwrap(), None);
    }

    #[test]
    fn test_failed_read() {
        let reader = reader(0);
        mock(&reader).push_read_error(Error::from_raw_os_error(5));

        let error = reader.read_byte(&CancellationToken::new()).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Read);
        assert_eq!(error.raw_os_error(), Some(5));
        assert!(error.to_string().contains("mock input"));
    }

    #[test]
    fn test_cancel_while_blocked() {
        let reader = reader(0);
        let token = CancellationToken::with_timeout(Duration::from_millis(20));

        let start = Instant::now();
        let error = reader.read_byte(&token).unwrap_err();
        assert!(error.is_cancelled());
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_reads_are_serialized() {
        let driver = Arc::new(Driver::with_platform(Mock::new(), Options::default()));
        let lock = ReadLock::new();
        let readers: Vec<_> = (0..2)
            .map(|_| Reader::new(driver.clone(), "shared", 0, lock.clone()).unwrap())
            .collect();
        for _ in 0..20 {
            driver.platform().push_input(b"x");
        }

        std::thread::scope(|scope| {
            for reader in readers.iter() {
                scope.spawn(move || {
                    let token = CancellationToken::new();
                    for _ in 0..10 {
                        assert_eq!(reader.read_byte(&token).unwrap(), Some(b'x'));
                    }
                });
            }
        });

        assert_eq!(driver.platform().overlaps(), 0);
    }
}
