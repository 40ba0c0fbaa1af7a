use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ndproxyd::config;
use ndproxyd::daemon;
use ndproxyd::netlink::Oracle;
use ndproxyd::reactor::Reactor;
use ndproxyd::signals;

/// IPv6 Neighbor Discovery proxy daemon.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Configuration file.
    #[arg(short, long, default_value = "/etc/ndproxyd.conf")]
    config: PathBuf,

    /// Detach from the terminal and run in the background.
    #[arg(short, long)]
    daemon: bool,

    /// Write the daemon PID to this file.
    #[arg(short = 'p', value_name = "FILE")]
    pidfile: Option<PathBuf>,

    /// Increase verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    info!(
        config = %cli.config.display(),
        proxies = config.proxies.len(),
        "configuration loaded"
    );

    let oracle = Oracle::load().context("loading netlink caches")?;

    let mut reactor = Reactor::new(oracle);
    reactor.configure(&config)?;

    if cli.daemon {
        daemon::daemonize().context("daemonizing")?;
    }
    if let Some(path) = &cli.pidfile {
        daemon::write_pidfile(path)
            .with_context(|| format!("writing pid to {}", path.display()))?;
    }

    signals::install();
    reactor.run()?;
    reactor.shutdown();
    info!("bye");
    Ok(())
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
