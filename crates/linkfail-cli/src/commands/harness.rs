//! `linkfail harness`: coordinate a live cluster over line channels.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use linkfail_live::{HarnessConfig, LiveHarness};

use crate::style::{self, colors::SemanticStyle};

#[derive(Args, Debug, Clone)]
pub struct HarnessArgs {
    /// Address both listeners bind to.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: IpAddr,

    /// Port the nodes connect to.
    #[arg(long, default_value_t = 9437)]
    pub node_port: u16,

    /// Port the client connects to.
    #[arg(long, default_value_t = 9438)]
    pub client_port: u16,

    /// Nodes expected per round.
    #[arg(short, long, default_value_t = 4)]
    pub nodes: usize,

    #[arg(long, default_value_t = 1)]
    pub rounds: u32,

    /// Requests per round.
    #[arg(short, long, default_value_t = 100)]
    pub requests: u64,

    #[arg(long, default_value_t = 30_000)]
    pub ready_timeout_ms: u64,

    #[arg(long, default_value_t = 5_000)]
    pub reply_timeout_ms: u64,
}

impl HarnessArgs {
    fn config(&self) -> HarnessConfig {
        HarnessConfig {
            node_addr: SocketAddr::new(self.host, self.node_port),
            client_addr: SocketAddr::new(self.host, self.client_port),
            nodes: self.nodes,
            requests: self.requests,
            ready_timeout: Duration::from_millis(self.ready_timeout_ms),
            reply_timeout: Duration::from_millis(self.reply_timeout_ms),
        }
    }
}

pub fn run(args: &HarnessArgs, json: bool) -> Result<()> {
    let harness = LiveHarness::bind(args.config()).context("binding harness listeners")?;
    if !json {
        style::print_labeled("nodes connect to", &harness.node_addr()?.to_string().code());
        style::print_labeled("client connects to", &harness.client_addr()?.to_string().code());
    }

    let mut rounds = Vec::new();
    for round in 1..=args.rounds {
        let report = harness
            .run_round(round)
            .with_context(|| format!("round {round} failed"))?;
        if !json {
            if report.is_complete() {
                style::print_success(&format!("Successful round {round}"));
            } else {
                style::print_warn(&format!(
                    "Round {round}: {} of {} replies",
                    report.replies, report.requests_planned
                ));
            }
        }
        rounds.push(report);
    }

    if json {
        style::print_json(&rounds)?;
    } else {
        println!("{}", style::round_table(&rounds));
    }

    let incomplete = rounds.iter().filter(|r| !r.is_complete()).count();
    if incomplete > 0 {
        anyhow::bail!("{incomplete} round(s) missed replies");
    }
    Ok(())
}
