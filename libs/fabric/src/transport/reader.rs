//! The single reader behind a raw ICMP transport.
//!
//! Reads every inbound datagram, discards what is not a reply to one of our
//! probes, and hands the rest to the pending table by the sequence number
//! carried in the reply itself.

use std::io::{self, ErrorKind, Read};
use std::sync::Arc;

use socket2::Socket;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, trace};

use crate::codec::{self, IcmpKind};
use crate::pending::{Capture, PendingTable};

/// What became of one inbound datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Malformed,
    /// Not a kind that answers a probe (for example our own echo request looped back)
    Ignored(IcmpKind),
    /// Answers someone else's probe
    Foreign,
    /// Ours, but nobody is waiting for that sequence any more
    Unmatched(u16),
    Delivered(u16),
}

pub(crate) async fn run(
    socket: Arc<AsyncFd<Socket>>,
    pending: Arc<PendingTable>,
    identifier: u16,
    buffer_size: usize,
    fatal: watch::Sender<Option<Arc<io::Error>>>,
) {
    let mut buf = vec![0u8; buffer_size];
    loop {
        match recv(&socket, &mut buf).await {
            Ok(len) => {
                let received_at = Instant::now();
                dispatch(&buf[..len], received_at, identifier, &pending);
            }
            Err(e) => {
                error!(error = %e, "ICMP socket read failed, transport is shutting down");
                pending.close();
                fatal.send_replace(Some(Arc::new(e)));
                return;
            }
        }
    }
}

async fn recv(socket: &AsyncFd<Socket>, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        // A socket error alone never makes the socket readable
        let mut guard = socket.ready(Interest::READABLE | Interest::ERROR).await?;
        match guard.try_io(|inner| {
            let mut sock: &Socket = inner.get_ref();
            sock.read(buf)
        }) {
            Ok(Err(e)) if e.kind() == ErrorKind::Interrupted => continue,
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}

/// Classify one datagram and deliver it if an attempt is waiting for it
pub(crate) fn dispatch(
    datagram: &[u8],
    received_at: Instant,
    identifier: u16,
    pending: &PendingTable,
) -> Outcome {
    let message = match codec::parse(datagram) {
        Ok(message) => message,
        Err(e) => {
            debug!(error = %e, "discarding malformed packet");
            return Outcome::Malformed;
        }
    };

    if !answers_probe(message.kind) {
        trace!(kind = ?message.kind, source = %message.source, "ignoring non-reply packet");
        return Outcome::Ignored(message.kind);
    }

    let echo = match message.echo {
        Some(echo) if echo.identifier == identifier => echo,
        _ => {
            trace!(source = %message.source, "ignoring packet for another process");
            return Outcome::Foreign;
        }
    };

    let capture = Capture {
        received_at,
        source: message.source,
        kind: message.kind,
        code: message.code,
        ttl: message.ttl,
        size: message.size,
    };

    if pending.deliver(echo.sequence, capture) {
        Outcome::Delivered(echo.sequence)
    } else {
        debug!(
            sequence = echo.sequence,
            source = %message.source,
            "no attempt waiting for reply, dropping"
        );
        Outcome::Unmatched(echo.sequence)
    }
}

fn answers_probe(kind: IcmpKind) -> bool {
    !matches!(kind, IcmpKind::Echo | IcmpKind::Other(_))
}
