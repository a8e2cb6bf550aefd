use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use sonar_core::Config;
use sonar_fabric::{Coordinator, ProbeError, Request, RequestSink, Response};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod stats;

use stats::{millis, HostStats};

#[derive(Parser, Debug)]
#[command(name = "sonar", version, about = "Probe hosts with ICMP echo requests")]
struct Args {
    /// Hosts to probe
    #[arg(required = true)]
    hosts: Vec<String>,

    /// TOML config file; flags override its values
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Probes per host, negative to probe until interrupted
    #[arg(short = 'c', long, allow_negative_numbers = true)]
    count: Option<i64>,

    /// Milliseconds between probes to the same host
    #[arg(short = 'i', long, value_name = "MS")]
    interval: Option<u64>,

    /// Milliseconds to wait for each reply
    #[arg(short = 'W', long, value_name = "MS")]
    timeout: Option<u64>,

    /// Payload size in bytes
    #[arg(short = 's', long)]
    size: Option<usize>,

    /// Time to live of outgoing probes
    #[arg(short = 't', long)]
    ttl: Option<u8>,

    /// Type-of-service byte of outgoing probes
    #[arg(short = 'Q', long)]
    tos: Option<u8>,

    /// Print one JSON object per response
    #[arg(long)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn build_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("could not load config from {}", path.display()))?,
            None => Config::default(),
        };

        if let Some(count) = self.count {
            config.count = count;
        }
        if let Some(ms) = self.interval {
            config.interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.timeout {
            config.timeout = Duration::from_millis(ms);
        }
        if let Some(size) = self.size {
            config.packet_size = size;
        }
        if let Some(ttl) = self.ttl {
            config.time_to_live = ttl;
        }
        if let Some(tos) = self.tos {
            config.type_of_service = tos;
        }

        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = args.build_config()?;
    let coordinator = Coordinator::icmp(config.clone())
        .await
        .context("could not start ICMP transport (raw sockets need root or CAP_NET_RAW)")?;
    let (requests, mut responses) = coordinator.start();

    let batch: Vec<Request> = args
        .hosts
        .iter()
        .enumerate()
        .map(|(index, host)| {
            let mut user_data = HashMap::new();
            user_data.insert("index".to_string(), index.to_string());
            coordinator.new_request(host.clone(), user_data)
        })
        .collect();
    tokio::spawn(submit(requests, batch, config.is_unbounded()));

    let mut stats = vec![HostStats::default(); args.hosts.len()];
    let mut fatal = coordinator.fatal();
    loop {
        tokio::select! {
            response = responses.recv() => {
                let Some(response) = response else { break };
                if args.json {
                    println!("{}", serde_json::to_string(&response)?);
                } else {
                    println!("{}", describe(&response));
                }
                if let Some(host) = host_index(&response).and_then(|i| stats.get_mut(i)) {
                    host.record(&response);
                }
            }
            Some(err) = fatal.wait() => bail!("ICMP transport failed: {}", err),
        }
    }

    if !args.json {
        for (host, host_stats) in args.hosts.iter().zip(&stats) {
            println!("--- {} ---", host);
            println!("{}", host_stats);
        }
    }
    Ok(())
}

/// Feed the batch into the coordinator, then close the sink
///
/// Unbounded runs keep the sink open until Ctrl-C so that in-flight probes
/// finish and the summary still prints.
async fn submit(requests: RequestSink, batch: Vec<Request>, until_interrupted: bool) {
    for request in batch {
        if requests.send(request).await.is_err() {
            return;
        }
    }
    if until_interrupted {
        wait_for_interrupt(tokio::signal::ctrl_c()).await;
        info!("interrupted, waiting for in-flight probes");
    }
}

/// Resolve once `signal` fires; never resolve if the handler cannot be installed
async fn wait_for_interrupt(signal: impl Future<Output = io::Result<()>>) {
    if let Err(e) = signal.await {
        warn!(error = %e, "could not listen for Ctrl-C, probing until killed");
        std::future::pending::<()>().await;
    }
}

fn host_index(response: &Response) -> Option<usize> {
    response.request.user_data.get("index")?.parse().ok()
}

fn describe(response: &Response) -> String {
    let host = &response.request.host;
    let seq = response
        .sequence
        .map_or_else(|| "-".to_string(), |seq| seq.to_string());

    match (&response.error, &response.reply) {
        (None, Some(reply)) => format!(
            "{} bytes from {}: icmp_seq={} ttl={} time={:.3} ms",
            reply.size,
            reply.source,
            seq,
            reply.ttl,
            millis(reply.rtt)
        ),
        (Some(ProbeError::Timeout), _) => {
            format!("Request timeout for {} icmp_seq={}", host, seq)
        }
        (Some(err), Some(reply)) => {
            format!("From {} icmp_seq={} {}", reply.source, seq, err)
        }
        (Some(err), None) => format!("{}: icmp_seq={} {}", host, seq, err),
        (None, None) => format!("{}: icmp_seq={} no reply", host, seq),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn interrupt_resolves_when_signal_fires() {
        let waited = tokio::time::timeout(
            Duration::from_secs(1),
            wait_for_interrupt(async { Ok(()) }),
        )
        .await;
        assert!(waited.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_signal_handler_keeps_waiting() {
        let waited = tokio::time::timeout(
            Duration::from_secs(60),
            wait_for_interrupt(async { Err(io::Error::other("no signal driver")) }),
        )
        .await;
        assert!(waited.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn sink_stays_open_when_signal_handler_fails() {
        let (requests, mut received) = tokio::sync::mpsc::channel::<Request>(1);
        tokio::spawn(async move {
            let _sink = requests;
            wait_for_interrupt(async { Err(io::Error::other("no signal driver")) }).await;
        });

        let closed = tokio::time::timeout(Duration::from_secs(60), received.recv()).await;
        assert!(closed.is_err(), "sink closed although no interrupt arrived");
    }
}
