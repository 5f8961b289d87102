//! # Raw 🌸 Tty
//!
//! This crate provides **cross-platform raw mode and cancellable reads** for
//! terminals. Besides [`tracing`](https://crates.io/crates/tracing) and
//! [`thiserror`](https://crates.io/crates/thiserror), its only dependency is
//! the low-level crate enabling system calls, i.e.,
//! [`libc`](https://crates.io/crates/libc) on Unix and
//! [`windows-sys`](https://crates.io/crates/windows-sys) on Windows.
//!
//! Using it is easy:
//!
//!   * Open a [`Terminal`], optionally in raw mode.
//!   * Read from standard input with a [`CancellationToken`], which another
//!     thread or a timer may cancel at any point.
//!   * Write to standard output or error through their [`Writer`]s.
//!
//! A [`Driver`] owns the process-wide terminal state. It captures the original
//! settings once, switches between raw and cooked mode on request, and
//! restores the original settings when dropped. If the process is running in
//! the background when leaving raw mode, the driver doesn't get stopped by
//! `SIGTTOU`. It leaves the terminal alone instead.
//!
//! A [`Reader`] waits on its handle and a cancellation channel at the same
//! time, with cancellation winning ties. On Unix, the channel is a self-pipe
//! polled together with the handle. On Windows, it is a manual-reset event
//! waited on together with the console input handle. Reads retry after
//! interruption by signals and treat broken pipes as end-of-stream.
//!
//!
//! # Example
//!
//! ```
//! # use std::time::Duration;
//! # use rawtty::{CancellationToken, Terminal};
//! # use rawtty::err::ErrorKind;
//! # fn run() -> rawtty::err::Result<()> {
//! let tty = Terminal::open()?;
//!
//! // Give up waiting for a key press after 0.1s.
//! let token = CancellationToken::with_timeout(Duration::from_millis(100));
//! match tty.read_raw(&token) {
//!     Ok(Some(byte)) => println!("read 0x{:02x}", byte),
//!     Ok(None) => println!("end of input"),
//!     Err(err) if err.kind() == ErrorKind::Cancelled => println!("timed out"),
//!     Err(err) => return Err(err),
//! }
//! # Ok(())
//! # }
//! # // Without a usable standard input, there is nothing to test.
//! # match run() {
//! #     Ok(()) => (),
//! #     Err(err) if err.kind() == ErrorKind::Read || err.kind() == ErrorKind::Channel => (),
//! #     Err(err) => return Err(err.into()),
//! # };
//! # Ok::<(), std::io::Error>(())
//! ```
//!
//!
//! # Windows
//!
//! On Windows, only console input handles support cancelling a blocked read.
//! For pipes and files, a cancelled token is honored before each read, but a
//! read that already is in progress runs to completion.

mod cancel;
mod driver;
pub mod err;
pub mod opt;
mod read;
pub mod sys;
mod term;
mod write;

#[cfg(test)]
mod mock;

pub use cancel::{CancellationToken, Registration};
pub use driver::Driver;
pub use opt::{Mode, Options};
pub use read::{ReadLock, Reader};
pub use sys::{Size, Stream};
pub use term::{Device, Terminal};
pub use write::Writer;
