use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use sonar_core::Config;
use tokio::io::unix::AsyncFd;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::codec;
use crate::error::{Error, Result};
use crate::pending::PendingTable;
use crate::request::Request;
use crate::transport::{reader, Dispatched, FatalSignal, Transport};

/// Largest datagram the reader accepts by default
const DEFAULT_RECEIVE_BUFFER: usize = 65_535;

/// Raw-socket ICMPv4 transport
///
/// Owns one raw socket shared by every sender, plus a single background
/// reader task that demultiplexes replies through the pending table.
/// Opening the socket needs `CAP_NET_RAW` (or root) on Linux.
pub struct IcmpTransport {
    socket: Arc<AsyncFd<Socket>>,
    pending: Arc<PendingTable>,
    identifier: u16,
    fatal: FatalSignal,
    reader: JoinHandle<()>,
}

impl IcmpTransport {
    /// Bind a transport with the default identifier and IP options
    pub async fn bind() -> Result<Self> {
        Self::builder().bind().await
    }

    /// Create a builder for configuring the transport
    pub fn builder() -> IcmpTransportBuilder {
        IcmpTransportBuilder::new()
    }

    /// Identifier stamped on every echo request; replies carrying another one are ignored
    pub fn identifier(&self) -> u16 {
        self.identifier
    }

    /// Number of attempts currently waiting for a reply
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    async fn write(&self, packet: &[u8], destination: Ipv4Addr) -> Result<Instant> {
        let addr = SockAddr::from(SocketAddr::new(IpAddr::V4(destination), 0));
        loop {
            let mut guard = self.socket.writable().await?;
            let sent_at = Instant::now();
            match guard.try_io(|inner| inner.get_ref().send_to(packet, &addr)) {
                Ok(result) => {
                    result?;
                    return Ok(sent_at);
                }
                Err(_would_block) => continue,
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for IcmpTransport {
    async fn send(&self, request: &Request) -> Result<Dispatched> {
        if self.fatal.is_fatal() {
            return Err(Error::TransportClosed);
        }

        let destination = resolve(&request.host).await?;
        let (sequence, reply) = self.pending.register()?;
        let packet =
            codec::encode_echo_request(self.identifier, sequence, request.config.packet_size)?;

        // On failure `reply` is dropped here, which unregisters the sequence
        let sent_at = self.write(&packet, destination).await?;
        debug!(
            request = request.id,
            host = %request.host,
            %destination,
            sequence,
            "echo request sent"
        );

        Ok(Dispatched {
            sequence,
            sent_at,
            reply,
        })
    }

    fn fatal(&self) -> FatalSignal {
        self.fatal.clone()
    }

    async fn close(&self) -> Result<()> {
        self.reader.abort();
        self.pending.close();
        Ok(())
    }
}

impl Drop for IcmpTransport {
    fn drop(&mut self) {
        self.reader.abort();
        self.pending.close();
    }
}

/// Builder for configuring the ICMP transport
#[derive(Default)]
pub struct IcmpTransportBuilder {
    identifier: Option<u16>,
    time_to_live: Option<u8>,
    type_of_service: Option<u8>,
    receive_buffer: Option<usize>,
}

impl IcmpTransportBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the echo identifier (defaults to the low 16 bits of the process id)
    pub fn identifier(mut self, identifier: u16) -> Self {
        self.identifier = Some(identifier);
        self
    }

    /// Set the TTL of outgoing probes
    pub fn time_to_live(mut self, ttl: u8) -> Self {
        self.time_to_live = Some(ttl);
        self
    }

    /// Set the type-of-service byte of outgoing probes
    pub fn type_of_service(mut self, tos: u8) -> Self {
        self.type_of_service = Some(tos);
        self
    }

    /// Take TTL and TOS from a probe config
    pub fn config(self, config: &Config) -> Self {
        self.time_to_live(config.time_to_live)
            .type_of_service(config.type_of_service)
    }

    /// Set the size of the reader's receive buffer
    pub fn receive_buffer(mut self, size: usize) -> Self {
        self.receive_buffer = Some(size);
        self
    }

    /// Open the raw socket and start the reader
    ///
    /// Fails with [`Error::Startup`] when the socket cannot be opened or
    /// configured, typically for lack of privilege.
    pub async fn bind(self) -> Result<IcmpTransport> {
        let identifier = self.identifier.unwrap_or_else(process_identifier);
        let defaults = Config::default();
        let ttl = self.time_to_live.unwrap_or(defaults.time_to_live);
        let tos = self.type_of_service.unwrap_or(defaults.type_of_service);

        let socket = open_socket(ttl, tos).map_err(Error::Startup)?;
        // SAFETY: the `Socket` owns its descriptor, which stays open and
        // unchanged for as long as the `AsyncFd` holds it.
        let socket = unsafe { AsyncFd::register(socket) }
            .map_err(|e| Error::Startup(e.into()))?;
        let socket = Arc::new(socket);
        let pending = PendingTable::new();
        let (fatal_tx, fatal) = FatalSignal::channel();

        let reader = tokio::spawn(reader::run(
            Arc::clone(&socket),
            Arc::clone(&pending),
            identifier,
            self.receive_buffer.unwrap_or(DEFAULT_RECEIVE_BUFFER),
            fatal_tx,
        ));

        info!(identifier, ttl, tos, "ICMP transport bound");

        Ok(IcmpTransport {
            socket,
            pending,
            identifier,
            fatal,
            reader,
        })
    }
}

fn open_socket(ttl: u8, tos: u8) -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
    socket.set_nonblocking(true)?;
    socket.set_ttl(u32::from(ttl))?;
    socket.set_tos(u32::from(tos))?;
    Ok(socket)
}

fn process_identifier() -> u16 {
    (std::process::id() & 0xffff) as u16
}

/// Resolve a host to its first IPv4 address
async fn resolve(host: &str) -> Result<Ipv4Addr> {
    if let Ok(addr) = host.parse::<Ipv4Addr>() {
        return Ok(addr);
    }

    let addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| Error::Resolve(format!("{}: {}", host, e)))?;

    addrs
        .filter_map(|addr| match addr.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| Error::Resolve(format!("{}: no IPv4 address", host)))
}
