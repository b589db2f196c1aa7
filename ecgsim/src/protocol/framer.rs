//! Byte-at-a-time response framing.
//!
//! The device has no length prefix or line discipline worth relying on, so a
//! reply is simply "everything received until the expected token shows up".

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::Command;

/// Sleep between polls while nothing is waiting.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Write one command to the device.
pub fn send_command<P: Port + ?Sized>(port: &mut P, command: &Command) -> Result<()> {
    if !port.is_open() {
        return Err(Error::NotOpen);
    }
    port.write_all_bytes(&command.encode())?;
    debug!(">>> {command}");
    Ok(())
}

/// Collect a reply from `port`.
///
/// With `wait_for`, bytes accumulate until the text contains that token, and
/// the text so far is returned. Without it, the call returns as soon as the
/// first byte arrives, which can hand back a truncated reply.
///
/// When `max_wait` runs out, whatever was received is returned, or `None` if
/// nothing was. The deadline counts from the start of the call. Bytes that are
/// not valid UTF-8 are dropped.
pub fn read_response<P: Port + ?Sized>(
    port: &mut P,
    wait_for: Option<&str>,
    max_wait: Duration,
) -> Result<Option<String>> {
    if !port.is_open() {
        return Err(Error::NotOpen);
    }

    let start = Instant::now();
    let mut pending = Vec::new();
    let mut response = String::new();

    loop {
        if let Some(byte) = port.read_byte()? {
            pending.push(byte);
            drain_utf8_ignoring_invalid(&mut pending, &mut response);

            match wait_for {
                Some(token) if response.contains(token) => {
                    debug!("<<< {response:?}");
                    return Ok(Some(response));
                },
                Some(_) => {},
                None => {
                    debug!("<<< {response:?}");
                    return Ok(Some(response));
                },
            }
        } else {
            thread::sleep(POLL_INTERVAL);
        }

        if start.elapsed() > max_wait {
            return Ok(finish_on_timeout(response));
        }
    }
}

/// [`read_response`] using the connection's own default timeout.
pub fn read_response_default<P: Port + ?Sized>(
    port: &mut P,
    wait_for: Option<&str>,
) -> Result<Option<String>> {
    let max_wait = port.timeout();
    read_response(port, wait_for, max_wait)
}

fn finish_on_timeout(response: String) -> Option<String> {
    if response.is_empty() {
        debug!("<<< timeout (no response)");
        None
    } else {
        debug!("<<< {response:?} (timed out)");
        Some(response)
    }
}

/// Move decodable text from `buffer` into `out`.
///
/// Invalid sequences are skipped. An incomplete trailing sequence stays in
/// `buffer` until more bytes arrive.
fn drain_utf8_ignoring_invalid(buffer: &mut Vec<u8>, out: &mut String) {
    loop {
        match std::str::from_utf8(buffer) {
            Ok(valid) => {
                out.push_str(valid);
                buffer.clear();
                return;
            },
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                if let Ok(valid) = std::str::from_utf8(&buffer[..valid_up_to]) {
                    out.push_str(valid);
                }

                match err.error_len() {
                    Some(invalid_len) => {
                        trace!("dropping {invalid_len} undecodable byte(s)");
                        let drain_to = (valid_up_to + invalid_len).min(buffer.len());
                        buffer.drain(..drain_to);
                    },
                    None => {
                        buffer.drain(..valid_up_to);
                        return;
                    },
                }
            },
        }
    }
}
