//! A recording platform for tests.
//!
//! The mock never touches the operating system. It counts calls, records the
//! settings and transitions written, replays scripted read and write results,
//! and detects overlapping reads.

use std::collections::{HashSet, VecDeque};
use std::io::{Error, ErrorKind, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::cancel::CancellationToken;
use crate::opt::Mode;
use crate::sys::{Applied, CancellationChannel, Outcome, Platform, Size, Stream, Transition};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The mock's system calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Call {
    ReadSettings,
    WriteSettings,
    Read,
    Write,
    WaitWritable,
    Wait,
}

const CALL_COUNT: usize = 6;

/// The mock's terminal settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct MockSettings {
    pub raw: bool,
    pub prepared: bool,
    pub normalized: bool,
}

impl MockSettings {
    pub fn original() -> Self {
        Self {
            raw: false,
            prepared: false,
            normalized: false,
        }
    }

    pub fn prepared(self) -> Self {
        Self {
            prepared: true,
            ..self
        }
    }

    pub fn normalized(self) -> Self {
        Self {
            normalized: true,
            ..self
        }
    }
}

/// An owned mock handle.
#[derive(Debug)]
pub(crate) struct MockOwned(pub i32);

#[derive(Debug, Default)]
struct State {
    calls: [AtomicUsize; CALL_COUNT],
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    defer: AtomicBool,
    not_interactive: AtomicBool,
    size: Mutex<Option<Size>>,
    applied: Mutex<Option<MockSettings>>,
    transitions: Mutex<Vec<Transition>>,
    closed: Mutex<HashSet<i32>>,
    input: Mutex<VecDeque<Result<Vec<u8>>>>,
    outcomes: Mutex<VecDeque<Result<usize>>>,
    output: Mutex<Vec<u8>>,
    reading: AtomicBool,
    overlaps: AtomicUsize,
    next_handle: AtomicUsize,
}

/// A recording platform. Clones share the same state.
#[derive(Clone, Debug)]
pub(crate) struct Mock {
    state: Arc<State>,
}

impl Mock {
    /// The OS error reported when there is no terminal.
    pub const NOT_A_TERMINAL: i32 = 25;

    pub fn new() -> Self {
        let state = State::default();
        *lock(&state.size) = Some(Size::new(80, 24));
        state.next_handle.store(10, Ordering::SeqCst);
        Self {
            state: Arc::new(state),
        }
    }

    fn record(&self, call: Call) {
        self.state.calls[call as usize].fetch_add(1, Ordering::SeqCst);
    }

    pub fn count(&self, call: Call) -> usize {
        self.state.calls[call as usize].load(Ordering::SeqCst)
    }

    pub fn fail_reads(&self, fail: bool) {
        self.state.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn defer_leaving(&self, defer: bool) {
        self.state.defer.store(defer, Ordering::SeqCst);
    }

    pub fn set_interactive(&self, interactive: bool) {
        self.state.not_interactive.store(!interactive, Ordering::SeqCst);
    }

    pub fn set_size(&self, size: Option<Size>) {
        *lock(&self.state.size) = size;
    }

    pub fn close(&self, handle: i32) {
        lock(&self.state.closed).insert(handle);
    }

    pub fn applied(&self) -> Option<MockSettings> {
        *lock(&self.state.applied)
    }

    pub fn transitions(&self) -> Vec<Transition> {
        lock(&self.state.transitions).clone()
    }

    /// Queue bytes for the next read.
    pub fn push_input(&self, bytes: &[u8]) {
        lock(&self.state.input).push_back(Ok(bytes.to_vec()));
    }

    /// Queue an error for the next read.
    pub fn push_read_error(&self, error: Error) {
        lock(&self.state.input).push_back(Err(error));
    }

    /// Queue the outcome of the next write.
    pub fn push_write_outcome(&self, outcome: Result<usize>) {
        lock(&self.state.outcomes).push_back(outcome);
    }

    pub fn output(&self) -> Vec<u8> {
        lock(&self.state.output).clone()
    }

    pub fn overlaps(&self) -> usize {
        self.state.overlaps.load(Ordering::SeqCst)
    }

    fn has_input(&self) -> bool {
        !lock(&self.state.input).is_empty()
    }
}

impl Platform for Mock {
    type Handle = i32;
    type OwnedHandle = MockOwned;
    type Settings = MockSettings;
    type Channel = MockChannel;

    fn standard(&self, stream: Stream) -> i32 {
        match stream {
            Stream::Input => 0,
            Stream::Output => 1,
            Stream::Error => 2,
        }
    }

    fn borrow(&self, handle: &MockOwned) -> i32 {
        handle.0
    }

    fn is_valid(&self, handle: i32, _for_writing: bool) -> bool {
        0 <= handle && !lock(&self.state.closed).contains(&handle)
    }

    fn is_interactive(&self, handle: i32) -> bool {
        self.is_valid(handle, false) && !self.state.not_interactive.load(Ordering::SeqCst)
    }

    fn size(&self) -> Option<Size> {
        *lock(&self.state.size)
    }

    fn read_settings(&self) -> Result<MockSettings> {
        self.record(Call::ReadSettings);
        if self.state.fail_reads.load(Ordering::SeqCst) {
            Err(Error::from_raw_os_error(Self::NOT_A_TERMINAL))
        } else {
            Ok(MockSettings::original())
        }
    }

    fn prepare(&self, settings: MockSettings) -> MockSettings {
        settings.prepared()
    }

    fn configure(&self, original: &MockSettings, mode: Mode) -> MockSettings {
        MockSettings {
            raw: mode.is_raw(),
            ..original.normalized()
        }
    }

    fn write_settings(&self, settings: &MockSettings, transition: Transition) -> Result<Applied> {
        self.record(Call::WriteSettings);
        if self.state.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::from_raw_os_error(Self::NOT_A_TERMINAL));
        }

        lock(&self.state.transitions).push(transition);
        if transition.is_leaving() && self.state.defer.load(Ordering::SeqCst) {
            return Ok(Applied::Deferred);
        }

        *lock(&self.state.applied) = Some(*settings);
        Ok(Applied::Done)
    }

    fn open(&self, name: &str) -> Result<MockOwned> {
        if name.contains("missing") {
            return Err(Error::from(ErrorKind::NotFound));
        }

        let handle = self.state.next_handle.fetch_add(1, Ordering::SeqCst);
        Ok(MockOwned(handle as i32))
    }

    fn read(&self, handle: i32, buffer: &mut [u8]) -> Result<usize> {
        self.record(Call::Read);
        if !self.is_valid(handle, false) {
            return Err(Error::from(ErrorKind::InvalidInput));
        }

        if self.state.reading.swap(true, Ordering::SeqCst) {
            self.state.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        // Widen the window for overlapping reads.
        std::thread::sleep(Duration::from_millis(2));

        let next = lock(&self.state.input).pop_front();
        let result = match next {
            None => Err(Error::from(ErrorKind::WouldBlock)),
            Some(Err(error)) => Err(error),
            Some(Ok(mut bytes)) => {
                let count = bytes.len().min(buffer.len());
                buffer[..count].copy_from_slice(&bytes[..count]);
                if count < bytes.len() {
                    bytes.drain(..count);
                    lock(&self.state.input).push_front(Ok(bytes));
                }
                Ok(count)
            }
        };

        self.state.reading.store(false, Ordering::SeqCst);
        result
    }

    fn write(&self, handle: i32, buffer: &[u8]) -> Result<usize> {
        self.record(Call::Write);
        if !self.is_valid(handle, true) {
            return Err(Error::from(ErrorKind::InvalidInput));
        }

        let count = match lock(&self.state.outcomes).pop_front() {
            None => buffer.len(),
            Some(Ok(count)) => count.min(buffer.len()),
            Some(Err(error)) => return Err(error),
        };

        lock(&self.state.output).extend_from_slice(&buffer[..count]);
        Ok(count)
    }

    fn wait_writable(&self, _handle: i32) -> Result<()> {
        self.record(Call::WaitWritable);
        Ok(())
    }

    fn channel(&self) -> Result<MockChannel> {
        Ok(MockChannel {
            mock: self.clone(),
            signalled: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// A polling cancellation channel for the mock.
///
/// Waits are ready as soon as input has been queued and cancelled as soon as
/// the channel has been signalled, with cancellation winning ties.
#[derive(Debug)]
pub(crate) struct MockChannel {
    mock: Mock,
    signalled: Arc<AtomicBool>,
}

impl CancellationChannel for MockChannel {
    type Handle = i32;
    type Waitable = ();

    fn arm(&self) {}

    fn signal_cancel(&self) {
        self.signalled.store(true, Ordering::SeqCst);
    }

    fn reset(&self) {
        self.signalled.store(false, Ordering::SeqCst);
    }

    fn wait_for(&self, _handle: i32, token: &CancellationToken) -> Result<Outcome> {
        self.mock.record(Call::Wait);
        let signalled = Arc::clone(&self.signalled);
        let _registration = token.register(move || signalled.store(true, Ordering::SeqCst));

        loop {
            if self.signalled.load(Ordering::SeqCst) {
                self.reset();
                return Ok(Outcome::Cancelled);
            } else if self.mock.has_input() {
                return Ok(Outcome::Ready);
            }

            std::thread::sleep(Duration::from_millis(1));
        }
    }
}
