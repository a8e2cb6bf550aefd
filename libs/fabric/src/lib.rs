//! Sonar Fabric - Concurrent ICMP probing engine
//!
//! Provides a raw-socket ICMP transport with reply demultiplexing and a
//! coordinator that turns submitted requests into paced, timed attempts,
//! emitting exactly one response per attempt.
//!
//! # Example
//!
//! ```no_run
//! use std::collections::HashMap;
//! use sonar_core::Config;
//! use sonar_fabric::Coordinator;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // One-off probe
//! let responses = sonar_fabric::ping("192.0.2.1", Config::default()).await?;
//! println!("{} responses", responses.len());
//!
//! // Or keep a coordinator running and stream requests into it
//! let coordinator = Coordinator::icmp(Config::default()).await?;
//! let (requests, mut responses) = coordinator.start();
//! requests.send(coordinator.new_request("192.0.2.1", HashMap::new())).await?;
//! drop(requests);
//! while let Some(response) = responses.recv().await {
//!     println!("seq={:?} rtt={:?} error={:?}", response.sequence, response.rtt(), response.error);
//! }
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod coordinator;
pub mod error;
pub mod pending;
pub mod request;
pub mod transport;

// Re-exports for convenience
pub use coordinator::{Coordinator, RequestSink, ResponseStream};
pub use error::{Error, ProbeError, Result};
pub use pending::{Capture, PendingTable, ReplyHandle};
pub use request::{ping, Reply, Request, RequestFactory, Response};
pub use transport::{Dispatched, FatalSignal, IcmpTransport, Transport};
