//! Pending table: outstanding sequence numbers and their one-shot reply slots.
//!
//! Senders register an entry before writing to the socket; the reader removes
//! it when a matching reply arrives. A [`ReplyHandle`] that is dropped before
//! its reply arrives (timeout, abandoned attempt) removes its own entry, so a
//! late packet reusing the same sequence number can never be misdelivered.

use std::collections::HashMap;
use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::codec::IcmpKind;
use crate::error::{Error, Result};

/// What the reader captured for one matched packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    pub received_at: Instant,
    pub source: Ipv4Addr,
    pub kind: IcmpKind,
    pub code: u8,
    pub ttl: u8,
    pub size: usize,
}

struct Entry {
    token: u64,
    slot: oneshot::Sender<Capture>,
}

struct Inner {
    next_sequence: u16,
    next_token: u64,
    entries: HashMap<u16, Entry>,
    closed: bool,
}

/// Outstanding attempts keyed by sequence number
pub struct PendingTable {
    inner: Mutex<Inner>,
}

impl PendingTable {
    pub fn new() -> Arc<Self> {
        Self::starting_at(0)
    }

    /// Create a table whose first allocated sequence number is `sequence`
    pub fn starting_at(sequence: u16) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                next_sequence: sequence,
                next_token: 0,
                entries: HashMap::new(),
                closed: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every critical section leaves the map consistent, so a poisoned lock is still usable
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate a fresh sequence number and register a slot for its reply
    ///
    /// Sequence numbers increase monotonically and wrap at `u16::MAX`,
    /// skipping any number that is still outstanding.
    pub fn register(self: &Arc<Self>) -> Result<(u16, ReplyHandle)> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(Error::TransportClosed);
        }
        if inner.entries.len() > usize::from(u16::MAX) {
            return Err(Error::SequenceExhausted);
        }

        let mut sequence = inner.next_sequence;
        while inner.entries.contains_key(&sequence) {
            sequence = sequence.wrapping_add(1);
        }
        inner.next_sequence = sequence.wrapping_add(1);

        let token = inner.next_token;
        inner.next_token += 1;

        let (slot, rx) = oneshot::channel();
        inner.entries.insert(sequence, Entry { token, slot });

        let handle = ReplyHandle {
            sequence,
            token,
            rx,
            table: Arc::clone(self),
        };
        Ok((sequence, handle))
    }

    /// Hand `capture` to the attempt waiting on `sequence`
    ///
    /// Returns false when nothing is waiting (timed out, duplicate or spoofed reply).
    pub fn deliver(&self, sequence: u16, capture: Capture) -> bool {
        let entry = self.lock().entries.remove(&sequence);
        match entry {
            Some(entry) => entry.slot.send(capture).is_ok(),
            None => false,
        }
    }

    /// Fail every outstanding slot and refuse new registrations
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.entries.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of outstanding entries
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, sequence: u16) -> bool {
        self.lock().entries.contains_key(&sequence)
    }

    fn remove(&self, sequence: u16, token: u64) {
        let mut inner = self.lock();
        if inner.entries.get(&sequence).is_some_and(|e| e.token == token) {
            inner.entries.remove(&sequence);
        }
    }
}

/// Awaits the reply for one registered sequence number
///
/// Resolves to the capture, or [`Error::TransportClosed`] if the table was
/// closed first. Dropping the handle unregisters the entry.
pub struct ReplyHandle {
    sequence: u16,
    token: u64,
    rx: oneshot::Receiver<Capture>,
    table: Arc<PendingTable>,
}

impl ReplyHandle {
    pub fn sequence(&self) -> u16 {
        self.sequence
    }
}

impl Future for ReplyHandle {
    type Output = Result<Capture>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map_err(|_| Error::TransportClosed)
    }
}

impl Drop for ReplyHandle {
    fn drop(&mut self) {
        self.table.remove(self.sequence, self.token);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use super::*;

    fn capture() -> Capture {
        Capture {
            received_at: Instant::now(),
            source: Ipv4Addr::LOCALHOST,
            kind: IcmpKind::EchoReply,
            code: 0,
            ttl: 64,
            size: 64,
        }
    }

    #[tokio::test]
    async fn delivers_to_matching_handle_once() {
        let table = PendingTable::new();
        let (seq, handle) = table.register().unwrap();

        assert!(table.deliver(seq, capture()));
        assert!(!table.deliver(seq, capture()), "second delivery must be dropped");
        assert!(table.is_empty());

        let got = handle.await.unwrap();
        assert_eq!(got.kind, IcmpKind::EchoReply);
    }

    #[tokio::test]
    async fn unknown_sequence_is_dropped() {
        let table = PendingTable::new();
        let (_seq, _handle) = table.register().unwrap();
        assert!(!table.deliver(999, capture()));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn timed_out_handle_removes_entry() {
        let table = PendingTable::new();
        let (seq, handle) = table.register().unwrap();

        let result = tokio::time::timeout(Duration::from_millis(10), handle).await;
        assert!(result.is_err());
        assert!(!table.contains(seq));
        assert!(!table.deliver(seq, capture()));
    }

    #[test]
    fn sequences_unique_while_outstanding() {
        let table = PendingTable::new();
        let handles: Vec<_> = (0..1000).map(|_| table.register().unwrap()).collect();
        let unique: HashSet<u16> = handles.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(unique.len(), handles.len());
    }

    #[test]
    fn sequence_wraps_and_skips_outstanding() {
        let table = PendingTable::starting_at(u16::MAX);
        let (first, _a) = table.register().unwrap();
        let (second, _b) = table.register().unwrap();
        assert_eq!(first, u16::MAX);
        assert_eq!(second, 0);

        // Rewind onto MAX and 0, both still outstanding
        table.lock().next_sequence = u16::MAX;
        let (third, _c) = table.register().unwrap();
        assert_eq!(third, 1);
    }

    #[test]
    fn stale_handle_does_not_remove_recycled_sequence() {
        let table = PendingTable::starting_at(5);
        let (seq, stale) = table.register().unwrap();

        // Reply arrives, entry consumed, then the same number is handed out again
        assert!(table.deliver(seq, capture()));
        table.lock().next_sequence = seq;
        let (recycled, _fresh) = table.register().unwrap();
        assert_eq!(recycled, seq);

        drop(stale);
        assert!(table.contains(seq));
    }

    #[tokio::test]
    async fn close_fails_waiting_handles() {
        let table = PendingTable::new();
        let (_seq, handle) = table.register().unwrap();

        table.close();
        assert!(matches!(handle.await, Err(Error::TransportClosed)));
        assert!(matches!(table.register(), Err(Error::TransportClosed)));
    }
}
