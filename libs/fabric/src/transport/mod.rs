use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::Result;
use crate::pending::ReplyHandle;
use crate::request::Request;

pub mod icmp;
pub(crate) mod reader;

pub use self::icmp::{IcmpTransport, IcmpTransportBuilder};

/// A probe that has left the socket and is waiting for its reply
pub struct Dispatched {
    pub sequence: u16,
    pub sent_at: Instant,
    pub reply: ReplyHandle,
}

/// Transport trait for sending echo requests and awaiting their replies
///
/// One transport is shared by every in-flight attempt, so all methods take `&self`.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Send one echo request toward `request.host`
    ///
    /// The reply slot is registered before the packet is written, so a reply
    /// arriving immediately after the write cannot be missed.
    async fn send(&self, request: &Request) -> Result<Dispatched>;

    /// Signal that fires if the transport dies after startup
    fn fatal(&self) -> FatalSignal {
        FatalSignal::never()
    }

    /// Stop the transport, failing every attempt still waiting for a reply
    async fn close(&self) -> Result<()>;
}

type FatalSlot = Option<Arc<std::io::Error>>;

/// Observes the unrecoverable socket failure of a transport, if one happens
#[derive(Debug, Clone)]
pub struct FatalSignal {
    rx: watch::Receiver<FatalSlot>,
}

impl FatalSignal {
    pub(crate) fn channel() -> (watch::Sender<FatalSlot>, Self) {
        let (tx, rx) = watch::channel(None);
        (tx, Self { rx })
    }

    /// A signal for transports that cannot fail
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(None);
        Self { rx }
    }

    /// The failure, if the transport has already died
    pub fn get(&self) -> Option<Arc<std::io::Error>> {
        self.rx.borrow().clone()
    }

    pub fn is_fatal(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Wait for the transport to die
    ///
    /// Resolves to `None` once the transport is gone without having failed.
    pub async fn wait(&mut self) -> Option<Arc<std::io::Error>> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(slot) => (*slot).clone(),
            Err(_) => None,
        }
    }
}
