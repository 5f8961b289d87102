/// # cancel: Reading Raw Bytes Until Cancelled
///
/// This example switches the terminal into raw mode and keeps printing the
/// bytes read from standard input as hexadecimal numbers. After five seconds
/// without input, the read is cancelled and the example restores cooked mode.
/// Typing `q` exits right away. Set `RUST_LOG=rawtty=debug` to see the
/// library's events on standard error.
use std::io::Write;
use std::time::Duration;

use rawtty::err::ErrorKind;
use rawtty::{CancellationToken, Terminal};
use tracing_subscriber::EnvFilter;

fn run() -> std::io::Result<()> {
    let tty = Terminal::open()?;
    let mut output = tty.output();

    tty.enable_raw_mode()?;
    write!(output, "press keys, ‹q› to quit, or wait 5s\r\n")?;

    loop {
        let token = CancellationToken::with_timeout(Duration::from_secs(5));
        match tty.read_raw(&token) {
            Ok(Some(b'q')) => break,
            Ok(Some(byte)) => write!(output, "0x{:02x}\r\n", byte)?,
            Ok(None) => {
                write!(output, "End of input.\r\n")?;
                break;
            }
            Err(err) if err.kind() == ErrorKind::Cancelled => {
                write!(output, "Cancelled.\r\n")?;
                break;
            }
            Err(err) => {
                let _ = tty.disable_raw_mode();
                return Err(err.into());
            }
        }
    }

    tty.disable_raw_mode()?;
    Ok(())
}

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    run()?;
    Ok(())
}
