//! Command line driver for the virtraft simulator.
//!
//! Runs a fuzz simulation (or replays a command script from stdin) and prints the run
//! statistics. A safety violation prints the failure and aborts the process.
//!
//! Ctrl+C logs the per-replica diagnostics table at the next tick; a second Ctrl+C stops.

use std::io;
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::bail;
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use virtraft::{FaultConfig, FsmKind, PeriodConfig, SimConfig, SimError, Simulation};

/// Deterministic consensus cluster simulator
#[derive(Parser, Debug)]
#[command(name = "virtraft", author, version, about, long_about = None)]
struct Cli {
    /// Number of replica slots
    #[arg(short = 'n', long, default_value_t = 3)]
    servers: usize,

    /// Percent of messages silently dropped
    #[arg(long, default_value_t = 0)]
    drop_rate: u8,

    /// Percent chance of delivering one more copy of a message
    #[arg(long, default_value_t = 0)]
    dupe_rate: u8,

    /// Percent of ticks that propose a client entry
    #[arg(long, default_value_t = 100)]
    client_rate: u8,

    /// Percent chance per replica per tick of toggling its membership
    #[arg(long, default_value_t = 0)]
    membership_rate: u8,

    /// Percent chance per replica per tick of toggling its partition
    #[arg(long, default_value_t = 0)]
    partition_rate: u8,

    #[arg(short, long, default_value_t = 0)]
    seed: u64,

    /// Stop after this many ticks, run until interrupted otherwise
    #[arg(short, long)]
    iterations: Option<u64>,

    /// Advance clocks by the fixed period instead of a random amount
    #[arg(long)]
    no_random_period: bool,

    /// Replicated state machine: accumulator or kv
    #[arg(long, default_value = "accumulator")]
    fsm: FsmKind,

    /// Read commands from stdin instead of fuzzing
    #[arg(long)]
    script: bool,

    /// Only log warnings and errors
    #[arg(short, long, conflicts_with = "debug")]
    quiet: bool,

    /// Print statistics and diagnostics as TSV
    #[arg(long, conflicts_with = "json")]
    tsv: bool,

    /// Print statistics as JSON
    #[arg(long)]
    json: bool,

    /// Log every engine step
    #[arg(short, long)]
    debug: bool,
}

impl Cli {
    fn config(&self) -> anyhow::Result<SimConfig> {
        for (name, rate) in [
            ("drop-rate", self.drop_rate),
            ("dupe-rate", self.dupe_rate),
            ("client-rate", self.client_rate),
            ("membership-rate", self.membership_rate),
            ("partition-rate", self.partition_rate),
        ] {
            if rate > 100 {
                bail!("--{name} must be a percentage, got {rate}");
            }
        }
        if self.dupe_rate == 100 {
            bail!("--dupe-rate must be below 100");
        }
        if self.servers == 0 {
            bail!("--servers must be at least 1");
        }
        if self.script && self.servers > 10 {
            bail!("script commands address at most 10 replicas, got --servers {}", self.servers);
        }

        let config = SimConfig {
            nodes: self.servers,
            seed: self.seed,
            iterations: self.iterations,
            faults: FaultConfig {
                drop_rate: self.drop_rate,
                dupe_rate: self.dupe_rate,
                partition_rate: self.partition_rate,
            },
            client_rate: self.client_rate,
            membership_rate: self.membership_rate,
            period: PeriodConfig {
                random: !self.no_random_period,
                ..PeriodConfig::default()
            },
            fsm: self.fsm,
            ..SimConfig::default()
        };
        config.validate()?;
        Ok(config)
    }

    fn filter(&self) -> tracing_subscriber::EnvFilter {
        if self.debug {
            return tracing_subscriber::EnvFilter::new("virtraft=debug,virtraft_raft=debug");
        }
        if self.quiet {
            return tracing_subscriber::EnvFilter::new("warn");
        }
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "virtraft=info".into())
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(cli.filter())
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let config = cli.config()?;
    let mut sim = Simulation::builder().config(config).build()?;

    let dump = sim.dump_handle();
    let interrupts = Arc::new(AtomicUsize::new(0));
    ctrlc::set_handler(move || {
        if interrupts.fetch_add(1, Ordering::SeqCst) == 0 {
            dump.request();
        } else {
            process::exit(130);
        }
    })?;

    if !(cli.quiet || cli.json || cli.tsv) {
        println!("Starting with {} nodes", cli.servers);
    }

    let outcome = if cli.script {
        sim.run_script(io::stdin().lock()).map(|_| ())
    } else {
        sim.run_configured()
    };

    match outcome {
        Ok(()) => {}
        Err(SimError::Violation(failure)) => {
            tracing::error!(violation = %failure.violation, "aborting");
            eprintln!("{failure}");
            process::abort();
        }
        Err(err) => return Err(err.into()),
    }

    let stats = sim.stats();
    if cli.json {
        println!("{}", stats.to_json()?);
    } else if cli.tsv {
        print!("{}", stats.render_tsv());
        print!("{}", sim.diagnostics().render_tsv());
    } else if !cli.quiet {
        print!("{}", stats.render_plain());
        print!("{}", sim.diagnostics());
    }

    Ok(())
}
