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


//! The lifecycle of one process. The [`Coordinator`] resolves the registry, runs the local site
//! (if this machine hosts one), and launches all other sites when running on the root.

use std::{
    collections::HashSet,
    io::IsTerminal,
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
    sync::Arc,
};

use crate::{
    config::{Config, HoldMode},
    emulation::Emulator,
    registry::{LocalSite, Registry, RemoteSite},
    relay,
    remote::{fan_out, LaunchPlan, LaunchReport, RemoteRunner},
    routes::{apply_routes, retract_routes, route_entries, RouteError},
    topology::{Topology, TopologyError, TopologyPlan},
    SiteLabError,
};

/// Everything needed to run this machine's part of the lab.
#[derive(Debug)]
pub struct Coordinator<E, R> {
    config: Arc<Config>,
    registry: Registry,
    registry_path: PathBuf,
    config_path: Option<PathBuf>,
    program: PathBuf,
    log_filter: Option<String>,
    interactive: bool,
    emulator: E,
    runner: Arc<R>,
}

/// Outcome of running the local site.
#[derive(Debug, Default)]
pub struct SiteReport {
    /// Number of routes towards other sites that were installed.
    pub routes_applied: usize,
    /// Routes that could not be installed or removed.
    pub route_errors: Vec<RouteError>,
}

/// Outcome of a whole run.
#[derive(Debug)]
pub struct RunSummary {
    /// The site hosted on this machine, if any.
    pub local: Option<LocalSite>,
    /// Result of running the local site. `None` if this machine hosts no site.
    pub site: Option<Result<SiteReport, SiteLabError>>,
    /// One report per launched remote site. Empty unless this process launched the others.
    pub launches: Vec<LaunchReport>,
}

impl<E, R> Coordinator<E, R>
where
    E: Emulator + 'static,
    R: RemoteRunner + 'static,
{
    pub fn new(
        config: Config,
        registry: Registry,
        registry_path: impl Into<PathBuf>,
        emulator: E,
        runner: R,
    ) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            registry_path: registry_path.into(),
            config_path: None,
            program: std::env::current_exe()
                .unwrap_or_else(|_| PathBuf::from(env!("CARGO_PKG_NAME"))),
            log_filter: std::env::var("RUST_LOG").ok(),
            interactive: std::io::stdin().is_terminal(),
            emulator,
            runner: Arc::new(runner),
        }
    }

    /// The configuration file, which is copied to the remote servers.
    pub fn config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    /// The executable copied to the remote servers. Defaults to the running program.
    pub fn program(mut self, path: impl Into<PathBuf>) -> Self {
        self.program = path.into();
        self
    }

    /// The log filter passed to the remote processes. Defaults to `RUST_LOG`.
    pub fn log_filter(mut self, filter: Option<String>) -> Self {
        self.log_filter = filter;
        self
    }

    /// Whether an operator can stop the network with Ctrl-C. Defaults to whether standard input
    /// is a terminal.
    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    /// Run this machine's part of the lab. `local_addresses` identify the local site, and
    /// `launch` asks the root to start all other sites.
    ///
    /// Only an ambiguous registry makes this function fail. Failures of the local site and of the
    /// launches are reported in the [`RunSummary`].
    pub async fn run(
        self,
        local_addresses: &HashSet<IpAddr>,
        launch: bool,
    ) -> Result<RunSummary, SiteLabError> {
        let (local, remotes) = self.registry.resolve(local_addresses)?;
        let is_root = local.as_ref().is_some_and(LocalSite::is_root);

        match &local {
            Some(site) => log::info!(
                "[{}] hosting site {} ({}){}",
                site.spec.server,
                site.index,
                site.spec.subnet,
                if is_root { ", the root" } else { "" }
            ),
            None => log::info!("This machine does not host any site of the registry"),
        }
        let launch = match (launch, is_root) {
            (true, false) => {
                log::warn!("Only the root site launches the other sites. Ignoring the request.");
                false
            }
            (launch, _) => launch,
        };

        if launch {
            // the relay of the root must not mix lines of earlier runs into this one.
            if let Err(e) = relay::reset_log(&self.config.relay.log_path).await {
                log::error!("{e}");
            }
        }

        let local_task = local.clone().map(|site| {
            let root_gateway = (!site.is_root()).then(|| self.registry.root().gateway());
            tokio::spawn(run_site(
                self.emulator,
                site,
                remotes.clone(),
                root_gateway,
                self.config.clone(),
                self.config.run.effective_hold(self.interactive),
            ))
        });

        let launches = if launch && !remotes.is_empty() {
            let plan = LaunchPlan::new(
                &self.program,
                &self.registry_path,
                self.config_path.as_deref(),
                &self.config,
                self.log_filter.as_deref(),
            );
            fan_out(
                self.runner.clone(),
                &remotes,
                Arc::new(plan),
                &self.config.remote,
            )
            .await
        } else {
            Vec::new()
        };

        let site = match local_task {
            Some(task) => Some(task.await.unwrap_or_else(|e| Err(e.into()))),
            None => None,
        };
        if let Some(Err(e)) = &site {
            log::error!("{e}");
        }

        tokio::time::sleep(self.config.run.exit_grace()).await;
        Ok(RunSummary {
            local,
            site,
            launches,
        })
    }
}

/// Build, start and run the local site, keep it up during the hold period, and tear it down
/// again.
async fn run_site<E: Emulator>(
    emulator: E,
    site: LocalSite,
    remotes: Vec<RemoteSite>,
    root_gateway: Option<Ipv4Addr>,
    config: Arc<Config>,
    hold_mode: HoldMode,
) -> Result<SiteReport, SiteLabError> {
    let plan = TopologyPlan::new(&site.spec, root_gateway, &config).map_err(TopologyError::from)?;
    let mut topo = Topology::build(emulator, plan, config.clone()).await?;
    topo.start().await?;

    let (entries, mut route_errors) = route_entries(&remotes, config.routes.via);
    for e in route_errors.iter() {
        log::warn!("{e}");
    }
    let applied = apply_routes(topo.emulator(), topo.gateway_name(), &entries).await;
    let routes_applied = applied.len();

    hold(hold_mode).await;
    log::info!(
        "[{}] tearing down in {}s",
        site.spec.server,
        config.run.settle_secs
    );
    tokio::time::sleep(config.run.settle()).await;

    route_errors.extend(retract_routes(topo.emulator(), applied).await);
    topo.stop().await?;
    log::info!("[{}] site stopped", site.spec.server);

    Ok(SiteReport {
        routes_applied,
        route_errors,
    })
}

/// Keep the network running.
async fn hold(mode: HoldMode) {
    match mode {
        HoldMode::UntilSignal => {
            log::info!("The network is running. Press Ctrl-C to stop it.");
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Cannot wait for Ctrl-C: {e}");
            }
        }
        HoldMode::WaitSecs(secs) => {
            log::info!("The network is running for {secs}s.");
            tokio::time::sleep(std::time::Duration::from_secs(secs)).await;
        }
    }
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use tempfile::TempDir;

    use super::*;
    use crate::{emulation::mock::MockEmulator, remote::mock::MockRunner};

    const REGISTRY: &str = "192.168.0.1 10.1.0.0/16 2\n\
                            192.168.0.2 10.2.0.0/16 1\n\
                            192.168.0.3 10.3.0.0/16 1\n";

    fn config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.relay.port = 0;
        config.relay.bind = Ipv4Addr::LOCALHOST.into();
        config.relay.log_path = dir.join("stdout.gw");
        config.run.hold = HoldMode::WaitSecs(0);
        config.run.settle_secs = 0;
        config.run.exit_grace_secs = 0;
        config
    }

    fn coordinator(
        dir: &TempDir,
        emulator: MockEmulator,
    ) -> Coordinator<MockEmulator, MockRunner> {
        Coordinator::new(
            config(dir.path()),
            REGISTRY.parse().unwrap(),
            "list",
            emulator,
            MockRunner::default(),
        )
        .program("/usr/bin/site-lab")
        .log_filter(None)
        .interactive(false)
    }

    fn addrs(ip: &str) -> HashSet<IpAddr> {
        HashSet::from([ip.parse().unwrap(), "127.0.0.1".parse().unwrap()])
    }

    #[tokio::test]
    async fn root_runs_and_launches() {
        let dir = tempfile::tempdir().unwrap();
        let emu = MockEmulator::new();
        let coordinator = coordinator(&dir, emu.clone());
        let runner = coordinator.runner.clone();

        let summary = coordinator.run(&addrs("192.168.0.1"), true).await.unwrap();
        assert_eq!(summary.local.as_ref().map(|l| l.index), Some(0));

        let report = summary.site.unwrap().unwrap();
        assert_eq!(report.routes_applied, 2);
        assert!(report.route_errors.is_empty());

        assert_eq!(
            summary
                .launches
                .iter()
                .map(|r| (r.server.as_str(), r.is_success()))
                .collect::<Vec<_>>(),
            vec![("192.168.0.2", true), ("192.168.0.3", true)]
        );
        assert!(runner
            .state()
            .executions
            .iter()
            .all(|(_, cmd, _)| cmd == "./site-lab list --hold-secs 0"));

        let state = emu.state();
        assert_eq!(state.nodes.len(), 3);
        assert_eq!(state.spawned.len(), 2);
        assert!(state.commands.contains(&(
            "h0".to_string(),
            "ip route add 10.2.0.0/16 via 10.2.0.1".to_string()
        )));
        assert!(state.routes.is_empty());
        assert!(!state.running);

        let log = std::fs::read_to_string(dir.path().join("stdout.gw")).unwrap();
        assert!(log.starts_with("Starting log at "));
    }

    #[tokio::test]
    async fn non_root_does_not_launch() {
        let dir = tempfile::tempdir().unwrap();
        let emu = MockEmulator::new();
        let coordinator = coordinator(&dir, emu.clone());
        let runner = coordinator.runner.clone();

        let summary = coordinator.run(&addrs("192.168.0.2"), true).await.unwrap();
        assert_eq!(summary.local.as_ref().map(|l| l.index), Some(1));
        assert!(summary.launches.is_empty());
        assert!(runner.state().copies.is_empty());
        assert_eq!(summary.site.unwrap().unwrap().routes_applied, 2);
        // the log is only reset by the root
        assert!(!dir.path().join("stdout.gw").exists());

        let state = emu.state();
        assert_eq!(state.nodes.len(), 2);
        assert!(state.commands.contains(&(
            "h0".to_string(),
            "ip route add 10.1.0.0/16 via 10.1.0.1".to_string()
        )));
    }

    #[tokio::test]
    async fn not_a_participant() {
        let dir = tempfile::tempdir().unwrap();
        let emu = MockEmulator::new();
        let summary = coordinator(&dir, emu.clone())
            .run(&addrs("192.168.0.99"), false)
            .await
            .unwrap();
        assert!(summary.local.is_none());
        assert!(summary.site.is_none());
        assert!(summary.launches.is_empty());
        assert!(emu.state().nodes.is_empty());
    }

    #[tokio::test]
    async fn ambiguous_registry_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let emu = MockEmulator::new();
        let mut addresses = addrs("192.168.0.1");
        addresses.insert("192.168.0.2".parse().unwrap());
        let err = coordinator(&dir, emu.clone())
            .run(&addresses, true)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(emu.state().nodes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unattended_site_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.relay.port = 0;
        config.relay.bind = Ipv4Addr::LOCALHOST.into();
        config.relay.log_path = dir.path().join("stdout.gw");
        assert_eq!(config.run.hold, HoldMode::UntilSignal);

        let emu = MockEmulator::new();
        let coordinator = Coordinator::new(
            config,
            REGISTRY.parse().unwrap(),
            "list",
            emu.clone(),
            MockRunner::default(),
        )
        .interactive(false);

        let day = std::time::Duration::from_secs(24 * 3600);
        let summary = tokio::time::timeout(day, coordinator.run(&addrs("192.168.0.2"), false))
            .await
            .expect("the site must stop without Ctrl-C")
            .unwrap();
        assert_eq!(summary.site.unwrap().unwrap().routes_applied, 2);

        let state = emu.state();
        assert!(state.routes.is_empty());
        assert!(!state.running);
        assert_eq!(state.stops, 1);
    }

    #[tokio::test]
    async fn failed_site_does_not_stop_launches() {
        let dir = tempfile::tempdir().unwrap();
        let emu = MockEmulator::new();
        emu.state().fail_start = true;
        let summary = coordinator(&dir, emu.clone())
            .run(&addrs("192.168.0.1"), true)
            .await
            .unwrap();
        assert!(matches!(
            summary.site,
            Some(Err(SiteLabError::Topology(TopologyError::Start(_))))
        ));
        assert_eq!(summary.launches.len(), 2);
        assert!(summary.launches.iter().all(LaunchReport::is_success));
    }
}
