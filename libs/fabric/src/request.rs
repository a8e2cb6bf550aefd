use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use sonar_core::Config;
use tokio::time::Instant;

use crate::codec::IcmpKind;
use crate::coordinator::Coordinator;
use crate::error::{Error, ProbeError, Result};
use crate::pending::Capture;
use crate::transport::{IcmpTransport, Transport};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// A probing job: one host, probed up to `config.count` times
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    pub id: u64,
    pub host: String,
    pub config: Config,
    pub user_data: HashMap<String, String>,
    /// Attempts dispatched so far
    pub sent: u64,
}

impl Request {
    /// True once every attempt allowed by `config.count` has been dispatched
    pub fn is_finished(&self) -> bool {
        u64::try_from(self.config.count).is_ok_and(|count| self.sent >= count)
    }
}

/// What came back for an attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    pub rtt: Duration,
    pub source: Ipv4Addr,
    pub kind: IcmpKind,
    pub code: u8,
    pub ttl: u8,
    pub size: usize,
}

impl Reply {
    pub(crate) fn from_capture(capture: Capture, sent_at: Instant) -> Self {
        Self {
            rtt: capture.received_at.saturating_duration_since(sent_at),
            source: capture.source,
            kind: capture.kind,
            code: capture.code,
            ttl: capture.ttl,
            size: capture.size,
        }
    }
}

/// Outcome of exactly one attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    /// The request as it was when the attempt was dispatched
    pub request: Request,
    /// Absent when the attempt failed before a sequence number was assigned
    pub sequence: Option<u16>,
    pub error: Option<ProbeError>,
    pub reply: Option<Reply>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.reply.as_ref().map(|reply| reply.rtt)
    }
}

/// Builds requests carrying a copy of one config
#[derive(Debug, Clone)]
pub struct RequestFactory {
    config: Config,
}

impl RequestFactory {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Create a request with a fresh id, unique and ascending for the life of the process
    pub fn new_request(&self, host: impl Into<String>, user_data: HashMap<String, String>) -> Request {
        Request {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            host: host.into(),
            config: self.config.clone(),
            user_data,
            sent: 0,
        }
    }
}

/// Probe one host over a fresh raw socket and collect every response
///
/// Opens the transport, submits a single request, and returns once its last
/// attempt has completed. `config.count` must not be negative.
pub async fn ping(host: &str, config: Config) -> Result<Vec<Response>> {
    if config.is_unbounded() {
        return Err(Error::Custom(
            "one-off ping needs a bounded count".to_string(),
        ));
    }
    config.validate()?;

    let transport = IcmpTransport::builder().config(&config).bind().await?;
    let coordinator = Coordinator::new(config, transport);
    let (requests, mut responses) = coordinator.start();

    requests
        .send(coordinator.new_request(host, HashMap::new()))
        .await
        .map_err(|_| Error::TransportClosed)?;
    drop(requests);

    let mut collected = Vec::new();
    while let Some(response) = responses.recv().await {
        collected.push(response);
    }

    coordinator.transport().close().await?;
    Ok(collected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_ascending() {
        let factory = RequestFactory::new(Config::default());
        let a = factory.new_request("192.0.2.1", HashMap::new());
        let b = factory.new_request("192.0.2.2", HashMap::new());
        assert!(b.id > a.id);
        assert_eq!(a.sent, 0);
        assert_eq!(a.config, Config::default());
    }

    #[test]
    fn finished_tracks_count() {
        let factory = RequestFactory::new(Config {
            count: 2,
            ..Config::default()
        });
        let mut request = factory.new_request("192.0.2.1", HashMap::new());
        assert!(!request.is_finished());
        request.sent = 2;
        assert!(request.is_finished());
    }

    #[test]
    fn unbounded_request_never_finishes() {
        let factory = RequestFactory::new(Config {
            count: -1,
            ..Config::default()
        });
        let mut request = factory.new_request("192.0.2.1", HashMap::new());
        request.sent = u64::MAX;
        assert!(!request.is_finished());
    }

    #[test]
    fn zero_count_is_finished_before_any_attempt() {
        let factory = RequestFactory::new(Config {
            count: 0,
            ..Config::default()
        });
        assert!(factory.new_request("192.0.2.1", HashMap::new()).is_finished());
    }
}
