//! Request coordinator: turns submitted jobs into timed attempts.
//!
//! Every accepted request gets its own task running its attempts one after
//! another. Each job task holds a clone of the response sender, so the
//! response stream closes by itself once the submission sink is closed and
//! the last job task has finished.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sonar_core::Config;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::codec::IcmpKind;
use crate::error::{ProbeError, Result};
use crate::request::{Reply, Request, RequestFactory, Response};
use crate::transport::{FatalSignal, IcmpTransport, Transport};

/// Accepts requests until dropped
pub type RequestSink = mpsc::Sender<Request>;

/// Yields one response per attempt; ends once all work is done
pub type ResponseStream = mpsc::Receiver<Response>;

const DEFAULT_SUBMISSION_BUFFER: usize = 16;
const DEFAULT_RESPONSE_BUFFER: usize = 1;

/// Schedules attempts for submitted requests over one shared transport
pub struct Coordinator<T> {
    transport: Arc<T>,
    factory: RequestFactory,
    outstanding: Arc<AtomicUsize>,
    submission_buffer: usize,
    response_buffer: usize,
}

impl Coordinator<IcmpTransport> {
    /// Open a raw ICMP transport configured from `config` and coordinate over it
    ///
    /// Fails if the config is invalid or the raw socket cannot be opened.
    pub async fn icmp(config: Config) -> Result<Self> {
        config.validate()?;
        let transport = IcmpTransport::builder().config(&config).bind().await?;
        Ok(Self::new(config, transport))
    }
}

impl<T: Transport + 'static> Coordinator<T> {
    pub fn new(config: Config, transport: T) -> Self {
        Self {
            transport: Arc::new(transport),
            factory: RequestFactory::new(config),
            outstanding: Arc::new(AtomicUsize::new(0)),
            submission_buffer: DEFAULT_SUBMISSION_BUFFER,
            response_buffer: DEFAULT_RESPONSE_BUFFER,
        }
    }

    /// Set how many responses may wait unread before attempts block on emitting
    pub fn response_buffer(mut self, size: usize) -> Self {
        self.response_buffer = size.max(1);
        self
    }

    /// Set how many submitted requests may queue before the sink applies backpressure
    pub fn submission_buffer(mut self, size: usize) -> Self {
        self.submission_buffer = size.max(1);
        self
    }

    /// Create a request carrying a copy of this coordinator's config
    pub fn new_request(
        &self,
        host: impl Into<String>,
        user_data: HashMap<String, String>,
    ) -> Request {
        self.factory.new_request(host, user_data)
    }

    pub fn config(&self) -> &Config {
        self.factory.config()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Fires if the underlying transport dies
    pub fn fatal(&self) -> FatalSignal {
        self.transport.fatal()
    }

    /// Requests accepted whose final attempt has not completed yet
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Start coordinating
    ///
    /// Returns the submission sink and the response stream. Dropping the sink
    /// stops unbounded requests before their next attempt; bounded requests
    /// run to completion. The stream ends after the last response.
    pub fn start(&self) -> (RequestSink, ResponseStream) {
        let (request_tx, request_rx) = mpsc::channel(self.submission_buffer);
        let (response_tx, response_rx) = mpsc::channel(self.response_buffer);

        tokio::spawn(accept(
            request_rx,
            response_tx,
            Arc::clone(&self.transport),
            Arc::clone(&self.outstanding),
        ));

        (request_tx, response_rx)
    }
}

/// Counts a job as outstanding for as long as it is alive
struct JobGuard(Arc<AtomicUsize>);

impl JobGuard {
    fn acquire(outstanding: &Arc<AtomicUsize>) -> Self {
        outstanding.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(outstanding))
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn accept<T: Transport + 'static>(
    mut requests: mpsc::Receiver<Request>,
    responses: mpsc::Sender<Response>,
    transport: Arc<T>,
    outstanding: Arc<AtomicUsize>,
) {
    let (closed_tx, closed_rx) = watch::channel(false);

    while let Some(request) = requests.recv().await {
        if request.config.count == 0 {
            debug!(request = request.id, host = %request.host, "count is zero, retiring request");
            continue;
        }

        debug!(request = request.id, host = %request.host, count = request.config.count, "request accepted");
        let guard = JobGuard::acquire(&outstanding);
        tokio::spawn(run_job(
            request,
            Arc::clone(&transport),
            responses.clone(),
            closed_rx.clone(),
            guard,
        ));
    }

    debug!("submission sink closed");
    closed_tx.send_replace(true);
}

async fn run_job<T: Transport + ?Sized>(
    mut request: Request,
    transport: Arc<T>,
    responses: mpsc::Sender<Response>,
    mut closed: watch::Receiver<bool>,
    _guard: JobGuard,
) {
    let unbounded = request.config.is_unbounded();
    loop {
        request.sent += 1;
        let started = Instant::now();
        let response = attempt(&*transport, &request).await;
        let transport_closed = response.error == Some(ProbeError::TransportClosed);

        if responses.send(response).await.is_err() {
            debug!(request = request.id, "response stream dropped, stopping request");
            return;
        }
        if request.is_finished() {
            break;
        }
        if transport_closed {
            warn!(request = request.id, "transport closed, abandoning request");
            return;
        }

        let next = started + request.config.interval;
        if unbounded {
            if *closed.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(next) => {}
                _ = closed.wait_for(|closed| *closed) => break,
            }
        } else {
            tokio::time::sleep_until(next).await;
        }
    }

    debug!(request = request.id, sent = request.sent, "request complete");
}

/// Run one send/await-reply cycle and describe its outcome
async fn attempt<T: Transport + ?Sized>(transport: &T, request: &Request) -> Response {
    let dispatched = match transport.send(request).await {
        Ok(dispatched) => dispatched,
        Err(e) => {
            warn!(request = request.id, host = %request.host, error = %e, "could not send echo request");
            return Response {
                request: request.clone(),
                sequence: None,
                error: Some(e.into()),
                reply: None,
            };
        }
    };

    let sequence = dispatched.sequence;
    let (error, reply) = match tokio::time::timeout(request.config.timeout, dispatched.reply).await {
        Err(_elapsed) => (Some(ProbeError::Timeout), None),
        Ok(Err(e)) => (Some(e.into()), None),
        Ok(Ok(capture)) => {
            let reply = Reply::from_capture(capture, dispatched.sent_at);
            (classify(reply.kind), Some(reply))
        }
    };

    if tracing::enabled!(tracing::Level::DEBUG) {
        debug!(
            request = request.id,
            sequence,
            rtt = ?reply.as_ref().map(|r| r.rtt),
            error = ?error,
            "attempt finished"
        );
    }

    Response {
        request: request.clone(),
        sequence: Some(sequence),
        error,
        reply,
    }
}

fn classify(kind: IcmpKind) -> Option<ProbeError> {
    match kind {
        IcmpKind::Echo | IcmpKind::EchoReply => None,
        IcmpKind::DestinationUnreachable => Some(ProbeError::DestinationUnreachable),
        IcmpKind::TimeExceeded => Some(ProbeError::TimeExceeded),
        IcmpKind::ParameterProblem => Some(ProbeError::ParameterProblem),
        IcmpKind::Redirect => Some(ProbeError::Redirect),
        other => Some(ProbeError::UnrecognizedType(other.type_number())),
    }
}
