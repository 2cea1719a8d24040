use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};

use netgauge::comm::{CommunicationWorker, Credentials, TcpServer};
use netgauge::config::Config;
use netgauge::report::{describe, render_failure, render_json, render_table};
use netgauge::{
    nlog, Event, EventBus, EventKind, Result, TestLifecycleState, TestOrchestrator, TestPhase,
};

/// netgauge - run network performance tests against a test server
#[derive(Parser, Debug)]
#[command(name = "netgauge")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    NETGAUGE_DEBUG=1     Enable debug logging (alternative to --debug)\n    NETGAUGE_LOG=LEVEL   Log level: error, warn, info, debug, trace")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.netgauge/netgauge.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Use this config file instead of ~/.netgauge/netgauge.toml
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run one test and print the results
    Run {
        /// Server address (host:port), overrides the config file
        #[arg(long)]
        server: Option<String>,

        /// Print the results record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the effective configuration
    Config {
        /// Write the default configuration if no file exists
        #[arg(long)]
        init: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    netgauge::log::init_with_debug(cli.debug);

    let config_path = match cli.config {
        Some(path) => path,
        None => Config::config_path()?,
    };

    match cli.command {
        Command::Run { server, json } => {
            let mut config = Config::load_from(&config_path)?;
            if let Some(server) = server {
                config.server = server;
            }
            if !run_test(config, json)? {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Config { init } => show_config(&config_path, init),
    }
}

fn show_config(path: &std::path::Path, init: bool) -> Result<()> {
    if init && !path.exists() {
        Config::default().save_to(path)?;
        println!("Wrote default configuration to {}", path.display());
    }
    let config = Config::load_from(path)?;
    println!("# {}", path.display());
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

/// Upper bound on one server call: two exchanges plus the probes.
fn call_timeout(config: &Config) -> Duration {
    config.exchange_timeout() * 4 + config.probe.throughput_window()
}

/// Run a single test. Returns false when the run failed.
fn run_test(config: Config, json: bool) -> Result<bool> {
    nlog!("Run command: server={} json={}", config.server, json);

    let lifecycle = Arc::new(TestLifecycleState::new());
    let bus = Arc::new(EventBus::new());
    let orchestrator = TestOrchestrator::new(lifecycle.clone(), bus.clone());

    let credentials = Credentials::new(
        config.username.clone().unwrap_or_default(),
        config.token.clone().unwrap_or_default(),
    );
    let deadline = call_timeout(&config) * 2;
    let mut worker = CommunicationWorker::new(TcpServer::from_config(&config), credentials)
        .with_call_timeout(call_timeout(&config));
    orchestrator.set_communicator(worker.start()?);

    let subscription = bus.subscribe(&EventKind::ALL);
    eprintln!("Testing against {}", config.server);

    // Re-query state on becoming active; nothing guarantees we saw earlier events.
    let outcome = match lifecycle.state() {
        TestPhase::Idle => {
            orchestrator.start_test()?;
            wait_for_outcome(&subscription, deadline)
        }
        TestPhase::Completed => lifecycle.latest_results().map(Event::TestCompleted),
        _ => wait_for_outcome(&subscription, deadline),
    };

    let succeeded = match outcome {
        Some(Event::TestCompleted(record)) => {
            if json {
                println!("{}", render_json(&record)?);
            } else {
                print!("{}", render_table(&record));
            }
            // Give the upload a chance to be acknowledged before shutting down.
            if let Some(event) = subscription.recv_timeout(config.exchange_timeout()) {
                eprintln!("{}", describe(&event));
            }
            orchestrator.acknowledge_results();
            true
        }
        Some(Event::TestFailed { reason }) => {
            eprint!("{}", render_failure(&reason));
            false
        }
        _ => {
            eprint!("{}", render_failure("no result before the deadline"));
            false
        }
    };

    bus.unsubscribe(subscription);
    worker.stop();
    Ok(succeeded)
}

/// Print progress until the run completes or fails.
fn wait_for_outcome(subscription: &netgauge::Subscription, deadline: Duration) -> Option<Event> {
    let started = Instant::now();
    while let Some(remaining) = deadline.checked_sub(started.elapsed()) {
        match subscription.recv_timeout(remaining)? {
            event @ (Event::TestCompleted(_) | Event::TestFailed { .. }) => return Some(event),
            event => eprintln!("{}", describe(&event)),
        }
    }
    None
}
