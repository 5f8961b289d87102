use std::sync::Arc;

use crate::cancel::CancellationToken;
use crate::driver::Driver;
use crate::err::Result;
use crate::opt::Options;
use crate::read::{ReadLock, Reader};
use crate::sys::{Native, Platform, Size, Stream};
use crate::write::Writer;

/// A process's terminal.
///
/// This type bundles the terminal driver with a reader for standard input as
/// well as writers for standard output and error. If the options ask for raw
/// mode, opening the terminal also switches to raw mode. Dropping the last
/// reference to the driver restores the original settings.
///
/// Since the driver is shared, additional readers and writers for the same
/// terminal can be created with [`Reader::new`] and [`Writer::new`] or, for a
/// separately opened device, with [`Terminal::open_device`].
pub struct Terminal<P: Platform = Native> {
    driver: Arc<Driver<P>>,
    input: Reader<P>,
    output: Writer<P>,
    error: Writer<P>,
}

impl Terminal<Native> {
    /// Open the terminal with the default options.
    ///
    /// # Errors
    ///
    /// See [`Terminal::with_driver`].
    pub fn open() -> Result<Self> {
        Self::with_options(Options::default())
    }

    /// Open the terminal with the given options.
    ///
    /// # Errors
    ///
    /// See [`Terminal::with_driver`].
    pub fn with_options(options: Options) -> Result<Self> {
        Self::with_driver(Arc::new(Driver::new(options)))
    }
}

impl<P: Platform> Terminal<P> {
    /// Open the terminal with the given driver.
    ///
    /// # Errors
    ///
    /// This method fails if the cancellation channel for standard input cannot
    /// be created or the driver's options ask for raw mode and the terminal
    /// cannot be switched to raw mode.
    pub fn with_driver(driver: Arc<Driver<P>>) -> Result<Self> {
        let platform = driver.platform();
        let input = Reader::new(
            driver.clone(),
            Stream::Input.name(),
            platform.standard(Stream::Input),
            ReadLock::new(),
        )?;
        let output = Writer::new(
            driver.clone(),
            Stream::Output.name(),
            platform.standard(Stream::Output),
        );
        let error = Writer::new(
            driver.clone(),
            Stream::Error.name(),
            platform.standard(Stream::Error),
        );

        if driver.options().mode().is_raw() {
            driver.set_raw_mode(true)?;
        }

        Ok(Self {
            driver,
            input,
            output,
            error,
        })
    }

    /// Get the driver.
    pub fn driver(&self) -> &Arc<Driver<P>> {
        &self.driver
    }

    /// Get the reader for standard input.
    pub fn input(&self) -> &Reader<P> {
        &self.input
    }

    /// Get the writer for standard output.
    pub fn output(&self) -> &Writer<P> {
        &self.output
    }

    /// Get the writer for standard error.
    pub fn error(&self) -> &Writer<P> {
        &self.error
    }

    /// Switch to raw mode.
    ///
    /// # Errors
    ///
    /// See [`Driver::set_raw_mode`].
    pub fn enable_raw_mode(&self) -> Result<()> {
        self.driver.set_raw_mode(true)
    }

    /// Switch back to cooked mode.
    ///
    /// # Errors
    ///
    /// See [`Driver::set_raw_mode`].
    pub fn disable_raw_mode(&self) -> Result<()> {
        self.driver.set_raw_mode(false)
    }

    /// Determine whether the terminal is in raw mode.
    pub fn is_raw_mode(&self) -> bool {
        self.driver.is_raw_mode()
    }

    /// Get the terminal's size.
    pub fn size(&self) -> Option<Size> {
        self.driver.size()
    }

    /// Read from standard input.
    ///
    /// # Errors
    ///
    /// See [`Reader::read`].
    pub fn read(&self, buffer: &mut [u8], token: &CancellationToken) -> Result<usize> {
        self.input.read(buffer, token)
    }

    /// Read one byte from standard input, returning `None` at end-of-stream.
    ///
    /// # Errors
    ///
    /// See [`Reader::read`].
    pub fn read_raw(&self, token: &CancellationToken) -> Result<Option<u8>> {
        self.input.read_byte(token)
    }

    /// Open the named terminal device for reading and writing.
    ///
    /// # Errors
    ///
    /// This method fails if the device cannot be opened or its cancellation
    /// channel cannot be created.
    pub fn open_device(&self, name: &str) -> Result<Device<P>> {
        Device::open(self.driver.clone(), name)
    }
}

impl<P: Platform> std::fmt::Debug for Terminal<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Terminal")
            .field("driver", &self.driver)
            .field("input", &self.input)
            .field("output", &self.output)
            .field("error", &self.error)
            .finish()
    }
}

/// An opened terminal device.
///
/// The device owns its handle, which is closed when the device is dropped.
/// Its reader and writer share the handle.
pub struct Device<P: Platform = Native> {
    reader: Reader<P>,
    writer: Writer<P>,
    // Dropped last.
    handle: P::OwnedHandle,
}

impl<P: Platform> Device<P> {
    /// Open the named device.
    ///
    /// # Errors
    ///
    /// This method fails if the device cannot be opened or its cancellation
    /// channel cannot be created.
    pub fn open(driver: Arc<Driver<P>>, name: &str) -> Result<Self> {
        let handle = driver.open_terminal_handle(name)?;
        let raw = driver.platform().borrow(&handle);
        let reader = Reader::new(driver.clone(), name, raw, ReadLock::new())?;
        let writer = Writer::new(driver, name, raw);

        Ok(Self {
            reader,
            writer,
            handle,
        })
    }

    /// Get the device's name.
    pub fn name(&self) -> &str {
        self.reader.name()
    }

    /// Get the owned handle.
    pub fn handle(&self) -> &P::OwnedHandle {
        &self.handle
    }

    /// Get the device's reader.
    pub fn reader(&self) -> &Reader<P> {
        &self.reader
    }

    /// Get the device's writer.
    pub fn writer(&self) -> &Writer<P> {
        &self.writer
    }

    /// Create another reader for this device, sharing the lock of the
    /// device's own reader.
    ///
    /// # Errors
    ///
    /// This method fails if the cancellation channel cannot be created.
    pub fn new_reader(&self) -> Result<Reader<P>> {
        Reader::new(
            self.reader.driver().clone(),
            self.name(),
            self.reader.handle(),
            self.lock().clone(),
        )
    }

    /// Get the lock serializing reads from this device.
    pub fn lock(&self) -> &ReadLock {
        self.reader.lock()
    }

    /// Read from the device.
    ///
    /// # Errors
    ///
    /// See [`Reader::read`].
    pub fn read(&self, buffer: &mut [u8], token: &CancellationToken) -> Result<usize> {
        self.reader.read(buffer, token)
    }

    /// Write the entire buffer to the device.
    ///
    /// # Errors
    ///
    /// See [`Writer::write`].
    pub fn write(&self, buffer: &[u8]) -> Result<()> {
        self.writer.write(buffer)
    }
}

impl<P: Platform> std::fmt::Debug for Device<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("handle", &self.handle)
            .field("reader", &self.reader)
            .field("writer", &self.writer)
            .finish()
    }
}
