//! `holo-bench`: start cluster members and run benchmark workloads.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use holo_bench::config::{self, BenchArgs};
use holo_bench::harness;
use holo_bench::node::{join_members, spawn_members};
use holo_bench::{BenchmarkDriver, WorkloadKind};

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "holo-bench")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run cluster members until Ctrl-C.
    Node(NodeArgs),
    /// Set up one workload and measure it.
    Run(RunArgs),
    /// Print the node options.
    Usage,
}

/// Arguments for `node`.
#[derive(Parser, Debug, Clone)]
struct NodeArgs {
    #[command(flatten)]
    bench: BenchArgs,

    /// Members started in this process. Clusters do not span processes, so
    /// this is usually equal to --nodes.
    #[arg(long, default_value_t = 1)]
    local_members: usize,
}

/// Arguments for `run`.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    #[command(flatten)]
    bench: BenchArgs,

    #[arg(long, value_enum)]
    workload: WorkloadKind,

    /// Worker threads calling the workload.
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Measurement duration.
    #[arg(long, default_value = "10s")]
    duration: humantime::Duration,

    /// Extra in-process members started next to the driver. Defaults to
    /// `nodes - 1` for embedded drivers and 0 in client mode.
    #[arg(long)]
    local_peers: Option<usize>,

    /// Write the run summary as JSON to this path.
    #[arg(long)]
    out: Option<PathBuf>,
}

/// Parse CLI args, initialize logging, and run the requested subcommand.
fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Node(args) => run_node(args),
        Command::Run(args) => run_bench(args),
        Command::Usage => {
            print!("{}", config::usage());
            Ok(())
        }
    }
}

fn run_node(args: NodeArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.local_members > 0, "--local-members must be > 0");
    let config = args.bench.into_config()?;
    if args.local_members < config.nodes {
        tracing::warn!(
            local_members = args.local_members,
            nodes = config.nodes,
            "fewer local members than --nodes; startup waits for members that must join this process"
        );
    }
    let mut nodes = join_members(spawn_members(&config, args.local_members)?)?;
    for node in &nodes {
        match node.endpoint_addr() {
            Some(addr) => tracing::info!(%addr, "member serving"),
            None => tracing::info!("member running without endpoint"),
        }
    }

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?
        .block_on(tokio::signal::ctrl_c())
        .context("wait for ctrl-c")?;

    tracing::info!("shutting down");
    for node in &mut nodes {
        node.stop();
    }
    Ok(())
}

fn run_bench(args: RunArgs) -> anyhow::Result<()> {
    let config = args.bench.into_config()?;
    let peers = args.local_peers.unwrap_or(if config.client_mode {
        0
    } else {
        config.nodes - 1
    });
    let pending = spawn_members(&config, peers)?;

    let mut driver = BenchmarkDriver::new(args.workload);
    // Remote clients need the peers' endpoints up; embedded drivers are
    // part of the convergence the peers wait for.
    let mut members = if config.client_mode {
        let members = join_members(pending)?;
        driver.set_up(config.clone())?;
        members
    } else {
        driver.set_up(config.clone())?;
        join_members(pending)?
    };

    let duration: Duration = args.duration.into();
    let summary = harness::measure(&driver, args.threads, duration, config.seed)?;
    driver.tear_down()?;
    for member in &mut members {
        member.stop();
    }

    match &args.out {
        Some(path) => {
            harness::write_summary(path, &summary).context("write summary")?;
            eprintln!("wrote summary: {}", path.display());
        }
        None => println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("serialize summary")?
        ),
    }
    Ok(())
}
