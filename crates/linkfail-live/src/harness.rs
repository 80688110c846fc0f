//! Live validation harness.
//!
//! The harness plays the coordinator for an externally launched cluster.
//! Each round it:
//!
//! 1. accepts one line channel per node and waits until every node has
//!    said `hello` and then `ready`,
//! 2. accepts the client and drives it with `request <id>` lines, waiting
//!    up to the reply timeout for `reply <id>` each time,
//! 3. sends `done` to every peer and closes the channels.
//!
//! Nothing here touches the simulation core beyond sharing its
//! [`ShutdownSignal`] type.

use std::collections::BTreeSet;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use linkfail_sim::ShutdownSignal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::channel::{DONE, LineChannel};
use crate::error::{LiveError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Line Protocol
// ============================================================================

/// A line received from a node or the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerLine {
    Hello,
    Ready,
    Reply(u64),
    Other(String),
}

impl PeerLine {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        match line {
            "hello" => return PeerLine::Hello,
            "ready" => return PeerLine::Ready,
            _ => {}
        }
        line.strip_prefix("reply ")
            .and_then(|id| id.trim().parse().ok())
            .map_or_else(|| PeerLine::Other(line.to_string()), PeerLine::Reply)
    }
}

/// The line asking the client to issue request `id`.
pub fn request_line(id: u64) -> String {
    format!("request {id}")
}

// ============================================================================
// Configuration and Report
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    pub node_addr: SocketAddr,
    pub client_addr: SocketAddr,
    pub nodes: usize,
    /// Requests per round.
    pub requests: u64,
    /// Time allowed for all nodes and the client to connect and report ready.
    pub ready_timeout: Duration,
    /// Time allowed for each reply.
    pub reply_timeout: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            node_addr: SocketAddr::from(([127, 0, 0, 1], 9437)),
            client_addr: SocketAddr::from(([127, 0, 0, 1], 9438)),
            nodes: 4,
            requests: 100,
            ready_timeout: Duration::from_secs(30),
            reply_timeout: Duration::from_secs(5),
        }
    }
}

/// What happened in one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundReport {
    pub round: u32,
    pub nodes_ready: usize,
    pub requests_planned: u64,
    pub requests_sent: u64,
    pub replies: u64,
    pub timed_out: u64,
    pub mean_latency_ms: f64,
    pub elapsed_ms: u64,
}

impl RoundReport {
    /// Every planned request got its reply.
    pub fn is_complete(&self) -> bool {
        self.replies == self.requests_planned
    }
}

// ============================================================================
// Harness
// ============================================================================

#[derive(Debug)]
pub struct LiveHarness {
    config: HarnessConfig,
    node_listener: TcpListener,
    client_listener: TcpListener,
    signal: ShutdownSignal,
}

impl LiveHarness {
    /// Binds the node and client listeners. Port 0 picks a free port.
    pub fn bind(config: HarnessConfig) -> Result<Self> {
        let node_listener = TcpListener::bind(config.node_addr)?;
        let client_listener = TcpListener::bind(config.client_addr)?;
        node_listener.set_nonblocking(true)?;
        client_listener.set_nonblocking(true)?;
        info!(
            nodes = %node_listener.local_addr()?,
            client = %client_listener.local_addr()?,
            "harness listening"
        );
        Ok(Self {
            config,
            node_listener,
            client_listener,
            signal: ShutdownSignal::new(),
        })
    }

    /// Aborts waits and the request loop once `signal` fires.
    pub fn with_shutdown(mut self, signal: ShutdownSignal) -> Self {
        self.signal = signal;
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn node_addr(&self) -> Result<SocketAddr> {
        Ok(self.node_listener.local_addr()?)
    }

    pub fn client_addr(&self) -> Result<SocketAddr> {
        Ok(self.client_listener.local_addr()?)
    }

    /// Runs one round against freshly connected peers.
    pub fn run_round(&self, round: u32) -> Result<RoundReport> {
        let start = Instant::now();
        let deadline = start + self.config.ready_timeout;

        let (node_tx, node_rx) = mpsc::channel();
        let mut nodes = Vec::with_capacity(self.config.nodes);
        while nodes.len() < self.config.nodes {
            let stream = self.accept_before(&self.node_listener, deadline, "node connections")?;
            let index = nodes.len();
            let mut channel = LineChannel::from_stream(stream, ShutdownSignal::new())?;
            let tx = node_tx.clone();
            channel.on_line(move |line| {
                let _ = tx.send((index, PeerLine::parse(line)));
            })?;
            debug!(round, node = index, peer = %channel.peer(), "node connected");
            nodes.push(channel);
        }
        let nodes_ready = self.await_ready(&node_rx, deadline)?;
        info!(round, nodes = nodes_ready, "all nodes ready");

        let stream = self.accept_before(&self.client_listener, deadline, "the client")?;
        let (client_tx, client_rx) = mpsc::channel();
        let mut client = LineChannel::from_stream(stream, ShutdownSignal::new())?;
        client.on_line(move |line| {
            let _ = client_tx.send(PeerLine::parse(line));
        })?;

        let mut report = RoundReport {
            round,
            nodes_ready,
            requests_planned: self.config.requests,
            requests_sent: 0,
            replies: 0,
            timed_out: 0,
            mean_latency_ms: 0.0,
            elapsed_ms: 0,
        };
        let latency_total = self.drive_client(&mut client, &client_rx, &mut report);
        if report.replies > 0 {
            report.mean_latency_ms = latency_total.as_secs_f64() * 1_000.0 / report.replies as f64;
        }

        for channel in nodes.iter_mut().chain(std::iter::once(&mut client)) {
            if let Err(error) = channel.send_line(DONE) {
                warn!(peer = %channel.peer(), error = %error, "could not send done");
            }
            channel.close();
        }

        report.elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            round,
            sent = report.requests_sent,
            replies = report.replies,
            timed_out = report.timed_out,
            "round finished"
        );
        Ok(report)
    }

    fn accept_before(&self, listener: &TcpListener, deadline: Instant, what: &str) -> Result<TcpStream> {
        loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false)?;
                    return Ok(stream);
                }
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                    self.check_wait(deadline, what)?;
                    thread::sleep(POLL_INTERVAL);
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    fn check_wait(&self, deadline: Instant, what: &str) -> Result<()> {
        if self.signal.is_triggered() {
            return Err(LiveError::Cancelled);
        }
        if Instant::now() >= deadline {
            return Err(LiveError::Timeout {
                what: what.to_string(),
                elapsed: self.config.ready_timeout,
            });
        }
        Ok(())
    }

    fn await_ready(&self, lines: &Receiver<(usize, PeerLine)>, deadline: Instant) -> Result<usize> {
        let mut ready = BTreeSet::new();
        while ready.len() < self.config.nodes {
            match lines.recv_timeout(POLL_INTERVAL) {
                Ok((node, PeerLine::Hello)) => debug!(node, "node said hello"),
                Ok((node, PeerLine::Ready)) => {
                    ready.insert(node);
                }
                Ok((node, other)) => debug!(node, line = ?other, "ignoring node line"),
                Err(RecvTimeoutError::Timeout) => {
                    self.check_wait(deadline, &format!("{} of {} nodes ready", ready.len(), self.config.nodes))?;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(LiveError::Closed("node readers stopped".to_string()));
                }
            }
        }
        Ok(ready.len())
    }

    /// Sends the round's requests one at a time. Returns the summed latency
    /// of the answered ones.
    fn drive_client(&self, client: &mut LineChannel, replies: &Receiver<PeerLine>, report: &mut RoundReport) -> Duration {
        let mut latency_total = Duration::ZERO;
        'requests: for id in 1..=self.config.requests {
            if self.signal.is_triggered() || client.signal().is_triggered() {
                warn!(request = id, "stopping requests early");
                break;
            }
            if let Err(error) = client.send_line(&request_line(id)) {
                warn!(request = id, error = %error, "client unreachable");
                break;
            }
            report.requests_sent += 1;

            let sent_at = Instant::now();
            let deadline = sent_at + self.config.reply_timeout;
            loop {
                match replies.recv_timeout(POLL_INTERVAL) {
                    Ok(PeerLine::Reply(reply)) if reply == id => {
                        latency_total += sent_at.elapsed();
                        report.replies += 1;
                        break;
                    }
                    Ok(other) => debug!(request = id, line = ?other, "ignoring client line"),
                    Err(RecvTimeoutError::Timeout) => {
                        if Instant::now() >= deadline {
                            warn!(request = id, "no reply before timeout");
                            report.timed_out += 1;
                            break;
                        }
                        if self.signal.is_triggered() || client.signal().is_triggered() {
                            break 'requests;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break 'requests,
                }
            }
        }
        latency_total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("hello" => PeerLine::Hello; "hello")]
    #[test_case(" ready " => PeerLine::Ready; "ready with spaces")]
    #[test_case("reply 17" => PeerLine::Reply(17); "reply")]
    #[test_case("reply x" => PeerLine::Other("reply x".to_string()); "bad reply id")]
    #[test_case("status ok" => PeerLine::Other("status ok".to_string()); "unknown")]
    fn parse_lines(line: &str) -> PeerLine {
        PeerLine::parse(line)
    }

    #[test]
    fn request_lines_carry_the_id() {
        assert_eq!(request_line(3), "request 3");
    }

    #[test]
    fn report_completion() {
        let mut report = RoundReport {
            round: 1,
            nodes_ready: 4,
            requests_planned: 2,
            requests_sent: 2,
            replies: 2,
            timed_out: 0,
            mean_latency_ms: 0.5,
            elapsed_ms: 10,
        };
        assert!(report.is_complete());
        report.replies = 1;
        report.timed_out = 1;
        assert!(!report.is_complete());
    }
}
