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


//! Launch the other sites from the root. Every remote server receives a copy of the program, the
//! registry, and the config file, and then runs the program detached, so that it builds its own
//! site.
//!
//! The launches run concurrently, bounded by `remote.max-parallel`, and each launch is bounded by
//! `remote.launch-timeout-secs`. A failing site never prevents the others from being launched;
//! the outcome of every site is returned as a [`LaunchReport`].

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{sync::Semaphore, task::JoinSet, time::Instant};

use crate::{
    cmd::shell_quote,
    config::{Config, RemoteConfig, WorkloadMode},
    registry::RemoteSite,
};

#[cfg(test)]
pub(crate) mod mock;
mod ssh;
pub use ssh::SshRunner;

/// Access to the remote servers.
#[async_trait]
pub trait RemoteRunner: Send + Sync {
    /// Copy `files` to `server`.
    async fn copy(&self, files: &[PathBuf], server: &str) -> Result<(), RemoteLaunchError>;

    /// Start `command_line` on `server` without waiting for it to finish. If `elevated` is set,
    /// the command runs as root.
    async fn execute_detached(
        &self,
        server: &str,
        command_line: &str,
        elevated: bool,
    ) -> Result<(), RemoteLaunchError>;
}

/// What is copied to every remote server, and how the program is started there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub artifacts: Vec<PathBuf>,
    pub command_line: String,
    pub elevated: bool,
}

impl LaunchPlan {
    /// Prepare the launch of `program` with the `registry` (and the `config_file`, if any). In
    /// `real` workload mode, the workload binary is copied as well. The `log_filter` is passed to
    /// the remote program as `RUST_LOG`. The remote sites always hold for a fixed time.
    pub fn new(
        program: &Path,
        registry: &Path,
        config_file: Option<&Path>,
        config: &Config,
        log_filter: Option<&str>,
    ) -> Self {
        let mut artifacts = vec![program.to_path_buf(), registry.to_path_buf()];
        artifacts.extend(config_file.map(Path::to_path_buf));
        if config.workload.mode == WorkloadMode::Real {
            artifacts.push(config.workload.binary.clone());
        }
        artifacts.extend(config.remote.artifacts.iter().cloned());
        let mut seen = HashSet::new();
        artifacts.retain(|p| seen.insert(p.clone()));

        let mut command_line = String::new();
        if let Some(filter) = log_filter {
            command_line.push_str(&format!("env RUST_LOG={} ", shell_quote(filter)));
        }
        command_line.push_str(&format!(
            "./{} {}",
            shell_quote(remote_name(program)),
            shell_quote(remote_name(registry))
        ));
        if let Some(cfg) = config_file {
            command_line.push_str(&format!(" --config {}", shell_quote(remote_name(cfg))));
        }
        // nobody can press Ctrl-C on a detached site
        command_line.push_str(&format!(" --hold-secs {}", config.run.remote_hold_secs()));

        Self {
            artifacts,
            command_line,
            elevated: config.remote.elevated,
        }
    }
}

/// Name of a copied file on the remote server.
fn remote_name(path: &Path) -> String {
    path.file_name()
        .unwrap_or(path.as_os_str())
        .to_string_lossy()
        .into_owned()
}

/// Outcome of launching a single site.
#[derive(Debug)]
pub struct LaunchReport {
    /// Position of the site in the registry.
    pub index: usize,
    pub server: String,
    pub result: Result<(), RemoteLaunchError>,
    pub elapsed: Duration,
}

impl LaunchReport {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Launch all `sites` (the root is skipped) and wait for all launches to finish or time out.
/// The reports are sorted by the registry index.
pub async fn fan_out<R: RemoteRunner + 'static>(
    runner: Arc<R>,
    sites: &[RemoteSite],
    plan: Arc<LaunchPlan>,
    config: &RemoteConfig,
) -> Vec<LaunchReport> {
    let permits = Arc::new(Semaphore::new(config.max_parallel.max(1)));
    let timeout = config.launch_timeout();
    let sites = sites.iter().filter(|s| !s.is_root()).collect::<Vec<_>>();
    log::info!(
        "Launching {} remote sites ({} at a time)",
        sites.len(),
        config.max_parallel.max(1)
    );

    let mut tasks = JoinSet::new();
    for site in sites.iter() {
        let index = site.index;
        let server = site.spec.server.clone();
        let runner = runner.clone();
        let plan = plan.clone();
        let permits = permits.clone();
        tasks.spawn(async move {
            let _permit = permits.acquire_owned().await.ok();
            let start = Instant::now();
            let result = match tokio::time::timeout(timeout, launch(&*runner, &server, &plan)).await
            {
                Ok(result) => result,
                Err(_) => Err(RemoteLaunchError::Timeout(server.clone(), timeout)),
            };
            LaunchReport {
                index,
                server,
                result,
                elapsed: start.elapsed(),
            }
        });
    }

    let mut reports = Vec::with_capacity(sites.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(report) => reports.push(report),
            Err(e) => log::error!("A launch task failed: {e}"),
        }
    }
    // a panicked task must still produce a report for its site
    for site in sites.iter() {
        if !reports.iter().any(|r| r.index == site.index) {
            reports.push(LaunchReport {
                index: site.index,
                server: site.spec.server.clone(),
                result: Err(RemoteLaunchError::Aborted(site.spec.server.clone())),
                elapsed: Duration::ZERO,
            });
        }
    }
    reports.sort_by_key(|r| r.index);

    for report in reports.iter() {
        match &report.result {
            Ok(()) => log::info!(
                "[{}] launched in {:.1}s",
                report.server,
                report.elapsed.as_secs_f64()
            ),
            Err(e) => log::error!("{e}"),
        }
    }
    reports
}

/// Copy the artifacts to `server` and start the program there. The program is not started if the
/// copy fails.
async fn launch<R: RemoteRunner + ?Sized>(
    runner: &R,
    server: &str,
    plan: &LaunchPlan,
) -> Result<(), RemoteLaunchError> {
    log::debug!("[{server}] copying {} files", plan.artifacts.len());
    runner.copy(&plan.artifacts, server).await?;
    log::debug!("[{server}] {}", plan.command_line);
    runner
        .execute_detached(server, &plan.command_line, plan.elevated)
        .await
}

/// Errors while launching a remote site.
#[derive(Debug, Error)]
pub enum RemoteLaunchError {
    /// The ssh or scp process could not be started.
    #[error("[{0}] Cannot run {1}: {2}")]
    Spawn(String, String, #[source] std::io::Error),
    /// Copying the artifacts failed.
    #[error("[{0}] Cannot copy the artifacts: {1}")]
    Copy(String, String),
    /// Starting the program failed.
    #[error("[{0}] Cannot start the program: {1}")]
    Execute(String, String),
    /// The launch did not finish in time.
    #[error("[{0}] The launch did not finish within {1:?}")]
    Timeout(String, Duration),
    /// The launch task was aborted.
    #[error("[{0}] The launch was aborted")]
    Aborted(String),
}

#[cfg(test)]
mod test {
    use super::mock::MockRunner;
    use super::*;
    use crate::registry::SiteSpec;

    fn site(index: usize, server: &str) -> RemoteSite {
        RemoteSite {
            index,
            spec: SiteSpec {
                server: server.to_string(),
                subnet: format!("10.{}.0.0/16", index + 1).parse().unwrap(),
                workers: 2,
            },
        }
    }

    fn plan() -> Arc<LaunchPlan> {
        Arc::new(LaunchPlan::new(
            Path::new("/usr/bin/site-lab"),
            Path::new("/tmp/run/list"),
            None,
            &Config::default(),
            None,
        ))
    }

    #[test]
    fn launch_plan() {
        let mut config = Config::default();
        config.workload.mode = WorkloadMode::Real;
        config.remote.artifacts = vec![PathBuf::from("extra.toml"), PathBuf::from("list")];
        let plan = LaunchPlan::new(
            Path::new("target/release/site-lab"),
            Path::new("list"),
            Some(Path::new("/etc/site lab.toml")),
            &config,
            Some("info"),
        );
        assert_eq!(
            plan.artifacts,
            vec![
                PathBuf::from("target/release/site-lab"),
                PathBuf::from("list"),
                PathBuf::from("/etc/site lab.toml"),
                PathBuf::from("./cothority"),
                PathBuf::from("extra.toml"),
            ]
        );
        assert_eq!(
            plan.command_line,
            "env RUST_LOG=info ./site-lab list --config 'site lab.toml' --hold-secs 300"
        );
        assert!(plan.elevated);
    }

    #[tokio::test]
    async fn all_sites_launched() {
        let runner = Arc::new(MockRunner::default());
        let sites = vec![site(1, "s1"), site(2, "s2"), site(3, "s3")];
        let reports = fan_out(runner.clone(), &sites, plan(), &RemoteConfig::default()).await;
        assert_eq!(reports.iter().map(|r| r.index).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(reports.iter().all(LaunchReport::is_success));

        let state = runner.state();
        assert_eq!(state.copies.len(), 3);
        assert_eq!(state.executions.len(), 3);
        assert!(state
            .executions
            .iter()
            .all(|(_, cmd, elevated)| cmd == "./site-lab list --hold-secs 300" && *elevated));
    }

    #[tokio::test]
    async fn root_is_skipped() {
        let runner = Arc::new(MockRunner::default());
        let sites = vec![site(0, "root"), site(1, "s1")];
        let reports = fan_out(runner.clone(), &sites, plan(), &RemoteConfig::default()).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].server, "s1");
    }

    #[tokio::test]
    async fn failures_are_isolated() {
        let runner = Arc::new(MockRunner::default());
        runner.state().fail_copy.insert("s1".to_string());
        runner.state().fail_execute.insert("s3".to_string());
        let sites = vec![site(1, "s1"), site(2, "s2"), site(3, "s3")];
        let reports = fan_out(runner.clone(), &sites, plan(), &RemoteConfig::default()).await;

        assert!(matches!(&reports[0].result, Err(RemoteLaunchError::Copy(s, _)) if s == "s1"));
        assert!(reports[1].is_success());
        assert!(matches!(&reports[2].result, Err(RemoteLaunchError::Execute(s, _)) if s == "s3"));

        // no execution after a failed copy
        let state = runner.state();
        assert_eq!(state.copies.len(), 3);
        let executed = state
            .executions
            .iter()
            .map(|(s, _, _)| s.as_str())
            .collect::<HashSet<_>>();
        assert_eq!(executed, HashSet::from(["s2", "s3"]));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_site_times_out() {
        let runner = Arc::new(MockRunner::default());
        runner.state().hang.insert("s2".to_string());
        let config = RemoteConfig {
            launch_timeout_secs: 10,
            max_parallel: 1,
            ..Default::default()
        };
        let sites = vec![site(1, "s1"), site(2, "s2"), site(3, "s3")];
        let reports = fan_out(runner.clone(), &sites, plan(), &config).await;

        assert!(reports[0].is_success());
        assert!(matches!(
            &reports[1].result,
            Err(RemoteLaunchError::Timeout(s, d)) if s == "s2" && *d == Duration::from_secs(10)
        ));
        assert!(reports[2].is_success());
    }
}
