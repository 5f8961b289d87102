use std::io::ErrorKind;
use std::sync::Arc;

use crate::driver::Driver;
use crate::err::{Error, Result};
use crate::sys::{Native, Platform};

/// A writer that keeps going.
///
/// Writes retry after interruption by signals and wait for the handle when it
/// would block. Writing to a broken pipe or an invalid handle silently
/// discards the bytes, as if writing to `/dev/null`. That way, a process whose
/// output is piped into an exited consumer can still shut down in an orderly
/// fashion.
pub struct Writer<P: Platform = Native> {
    driver: Arc<Driver<P>>,
    name: String,
    handle: P::Handle,
    valid: bool,
    interactive: bool,
}

impl<P: Platform> Writer<P> {
    /// Create a new writer for the handle.
    pub fn new(driver: Arc<Driver<P>>, name: impl Into<String>, handle: P::Handle) -> Self {
        let valid = driver.is_handle_valid(handle, true);
        let interactive = valid && driver.is_handle_interactive(handle);

        Self {
            driver,
            name: name.into(),
            handle,
            valid,
            interactive,
        }
    }

    /// Get the handle's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the handle.
    pub fn handle(&self) -> P::Handle {
        self.handle
    }

    /// Determine whether the handle was usable for writing upon creation.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Determine whether the handle was connected to a terminal upon creation.
    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    /// Write the entire buffer.
    ///
    /// # Errors
    ///
    /// This method fails with [`Error::Write`] if the system call fails for
    /// any other reason than interruption, a full buffer, or a broken pipe.
    pub fn write(&self, mut buffer: &[u8]) -> Result<()> {
        if !self.valid {
            return Ok(());
        }

        let platform = self.driver.platform();
        while !buffer.is_empty() {
            match platform.write(self.handle, buffer) {
                Ok(0) => {
                    return Err(Error::write(
                        self.name.as_str(),
                        std::io::Error::from(ErrorKind::WriteZero),
                    ))
                }
                Ok(count) => buffer = &buffer[count..],
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => platform
                    .wait_writable(self.handle)
                    .map_err(|e| Error::write(self.name.as_str(), e))?,
                Err(ref e) if e.kind() == ErrorKind::BrokenPipe => {
                    tracing::debug!(name = %self.name, "discarding output to broken pipe");
                    return Ok(());
                }
                Err(e) => return Err(Error::write(self.name.as_str(), e)),
            }
        }

        Ok(())
    }
}

impl<P: Platform> std::io::Write for Writer<P> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Writer::write(self, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<P: Platform> std::io::Write for &Writer<P> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Writer::write(self, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<P: Platform> std::fmt::Debug for Writer<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer")
            .field("name", &self.name)
            .field("handle", &self.handle)
            .field("valid", &self.valid)
            .field("interactive", &self.interactive)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::Writer;
    use crate::driver::Driver;
    use crate::err::ErrorKind;
    use crate::mock::{Call, Mock};
    use crate::opt::Options;
    use std::io::{Error, ErrorKind as IoErrorKind, Write};
    use std::sync::Arc;

    fn writer(handle: i32) -> Writer<Mock> {
        let driver = Arc::new(Driver::with_platform(Mock::new(), Options::default()));
        Writer::new(driver, "mock output", handle)
    }

    #[test]
    fn test_partial_writes() {
        let writer = writer(1);
        let mock = writer.driver.platform().clone();
        mock.push_write_outcome(Ok(2));
        mock.push_write_outcome(Err(Error::from(IoErrorKind::Interrupted)));
        mock.push_write_outcome(Err(Error::from(IoErrorKind::WouldBlock)));

        writer.write(b"hello").unwrap();
        assert_eq!(mock.output(), b"hello");
        assert_eq!(mock.count(Call::Write), 4);
        assert_eq!(mock.count(Call::WaitWritable), 1);
    }

    #[test]
    fn test_discarded_output() {
        let writer = writer(1);
        let mock = writer.driver.platform().clone();
        mock.push_write_outcome(Err(Error::from(IoErrorKind::BrokenPipe)));
        writer.write(b"gone").unwrap();
        assert!(mock.output().is_empty());

        let writer = self::writer(-1);
        assert!(!writer.is_valid());
        writer.write(b"gone").unwrap();
        assert_eq!(writer.driver.platform().count(Call::Write), 0);
    }

    #[test]
    fn test_failed_write() {
        let writer = writer(1);
        writer
            .driver
            .platform()
            .push_write_outcome(Err(Error::from_raw_os_error(5)));

        let error = writer.write(b"oops").unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Write);
        assert!(error.to_string().contains("mock output"));
    }

    #[test]
    fn test_io_write() -> std::io::Result<()> {
        let mut writer = writer(2);
        write!(writer, "{}-{}", 4, 2)?;
        writer.flush()?;
        assert_eq!(writer.driver.platform().output(), b"4-2");
        Ok(())
    }
}
