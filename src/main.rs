// SiteLab: Coordinate Multi-Site Emulated Networks and Aggregate their Logs
// Copyright (C) 2022-2025 Tibor Schneider <sctibor@ethz.ch> and Roland Schmid <roschmi@ethz.ch>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.


use std::{
    collections::HashSet,
    future::Future,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
};

use clap::{Parser, Subcommand};
use site_lab::{
    config::HoldMode, registry::local_addresses, relay, Config, ConfigError, Coordinator,
    NetnsEmulator, Registry, RunSummary, SiteLabError, SshRunner,
};

const USAGE: &str = "Usage: site-lab <registry> [launch] [--config <file>]";

/// Run one site of an emulated network spanning several servers, and collect the output of all
/// sites on the root.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, args_conflicts_with_subcommands = true)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
    /// Registry file, with one `<server> <subnet> <workers>` entry per line.
    registry: Option<PathBuf>,
    /// If given (with any value), the root site launches all other sites.
    launch: Option<String>,
    /// Configuration file (TOML).
    #[clap(long, short = 'c')]
    config: Option<PathBuf>,
    /// Keep the network running for this many seconds instead of waiting for Ctrl-C.
    #[clap(long)]
    hold_secs: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read lines from stdin and send each one as a UDP datagram to the target.
    RelaySend { target: SocketAddr },
}

#[tokio::main]
async fn main() {
    pretty_env_logger::init();
    if let Some(code) = run_cli(Args::parse(), local_addresses).await {
        std::process::exit(code);
    }
}

/// Execute the command line. Returns the exit code if the process must not exit normally.
async fn run_cli<F, Fut>(args: Args, addresses: F) -> Option<i32>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<HashSet<IpAddr>, ConfigError>>,
{
    if let Some(Command::RelaySend { target }) = args.command {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        return match relay::send_lines(stdin, target).await {
            Ok(n) => {
                log::debug!("sent {n} lines to {target}");
                None
            }
            Err(e) => {
                log::error!("{e}");
                Some(1)
            }
        };
    }

    let Some(registry) = args.registry else {
        eprintln!("{USAGE}");
        return Some(-1);
    };

    let launch = args.launch.is_some();
    match run(registry, args.config, args.hold_secs, launch, addresses).await {
        Ok(summary) => {
            let failed = summary.launches.iter().filter(|r| !r.is_success()).count();
            if !summary.launches.is_empty() {
                log::info!(
                    "{} of {} remote sites launched",
                    summary.launches.len() - failed,
                    summary.launches.len()
                );
            }
            None
        }
        Err(e) => {
            log::error!("{e}");
            e.is_fatal().then_some(1)
        }
    }
}

async fn run<F, Fut>(
    registry_path: PathBuf,
    config_path: Option<PathBuf>,
    hold_secs: Option<u64>,
    launch: bool,
    addresses: F,
) -> Result<RunSummary, SiteLabError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<HashSet<IpAddr>, ConfigError>>,
{
    let mut config = match &config_path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(secs) = hold_secs {
        config.run.hold = HoldMode::WaitSecs(secs);
    }
    let registry = Registry::load(&registry_path)?;
    let addresses = addresses().await?;

    let emulator = NetnsEmulator::new(&config.emulation);
    let runner = SshRunner::new(&config.remote);
    Coordinator::new(config, registry, registry_path, emulator, runner)
        .config_path(config_path)
        .run(&addresses, launch)
        .await
}
