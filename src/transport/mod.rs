//! Transport Module
//!
//! Thin shims over OS sockets: the client-side [`Link`] (tokio or std
//! TCP/UDP), the server-side [`PeerHandle`] and the bind helpers.

pub mod link;
pub mod peer;

pub(crate) use link::{Link, LinkOptions};
pub(crate) use peer::{bind_datagram_socket, bind_stream_listener, PeerHandle};

use std::io::{self, Write};
use std::thread;
use std::time::Duration;

/// Largest payload a UDP datagram can carry
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Pause between retries of a write that would block
pub const WOULD_BLOCK_BACKOFF: Duration = Duration::from_millis(1);

/// Retries for blocking client writes that still report `WouldBlock`
pub(crate) const CLIENT_WRITE_RETRY_LIMIT: u32 = 1000;

/// Read timeout used to make blocking datagram reads observe `close()`
pub(crate) const DATAGRAM_POLL_TICK: Duration = Duration::from_millis(200);

pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

pub(crate) fn peer_closed() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer")
}

/// Write the whole buffer, retrying `WouldBlock` up to `retry_limit` times
pub(crate) fn write_fully<W: Write>(writer: &mut W, data: &[u8], retry_limit: u32) -> io::Result<()> {
    let mut written = 0;
    let mut stalls = 0;

    while written < data.len() {
        match writer.write(&data[written..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "peer stopped accepting data",
                ))
            }
            Ok(n) => {
                written += n;
                stalls = 0;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                stalls += 1;
                if stalls > retry_limit {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("write still blocked after {} retries", retry_limit),
                    ));
                }
                thread::sleep(WOULD_BLOCK_BACKOFF);
            }
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

/// Send one datagram, retrying `WouldBlock` up to `retry_limit` times
pub(crate) fn send_datagram<F>(mut send: F, len: usize, retry_limit: u32) -> io::Result<()>
where
    F: FnMut() -> io::Result<usize>,
{
    let mut stalls = 0;

    loop {
        match send() {
            Ok(n) if n == len => return Ok(()),
            Ok(n) => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("datagram truncated: sent {} of {} bytes", n, len),
                ))
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                stalls += 1;
                if stalls > retry_limit {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("datagram send still blocked after {} retries", retry_limit),
                    ));
                }
                thread::sleep(WOULD_BLOCK_BACKOFF);
            }
            Err(e) => return Err(e),
        }
    }
}
