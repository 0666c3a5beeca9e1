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


//! Run configuration. Every component receives the [`Config`] explicitly; there are no global
//! switches. The configuration can be loaded from a TOML file, and every field has a default.

use std::{
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::ConfigError;

/// Configuration of a single run of the site lab.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// UDP log relay
    pub relay: RelayConfig,
    /// Process started on each worker node
    pub workload: WorkloadConfig,
    /// Static routes towards the other sites
    pub routes: RouteConfig,
    /// Lifecycle timing of the local site
    pub run: RunConfig,
    /// Launching the program on the other sites
    pub remote: RemoteConfig,
    /// Settings of the namespace emulator
    pub emulation: EmulationConfig,
}

impl Config {
    /// Read the configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Unreadable(path.to_path_buf(), e))?;
        Self::parse(&content)
    }

    /// Parse the configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Program used on the worker nodes to send their output to the gateway. Falls back to the
    /// running executable.
    pub fn relay_sender(&self) -> PathBuf {
        self.relay
            .sender
            .clone()
            .or_else(|| std::env::current_exe().ok())
            .unwrap_or_else(|| PathBuf::from(env!("CARGO_PKG_NAME")))
    }
}

/// Configuration of the UDP relay tree.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct RelayConfig {
    /// The single UDP port used by every gateway and worker of every site.
    pub port: u16,
    /// File on the gateway to which all received log lines are appended.
    pub log_path: PathBuf,
    /// Address on which the gateway listens for log datagrams.
    pub bind: IpAddr,
    /// How often the forwarder checks the log file for new lines.
    pub poll_millis: u64,
    /// Executable providing the `relay-send` subcommand on worker nodes.
    pub sender: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            log_path: PathBuf::from("/tmp/stdout.gw"),
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            poll_millis: 100,
            sender: None,
        }
    }
}

impl RelayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_millis.max(1))
    }
}

/// What to run on the worker nodes.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum WorkloadMode {
    /// Start the workload binary.
    Real,
    /// Only ping the gateway (a dummy run to check reachability).
    #[default]
    Probe,
}

/// Configuration of the workload started on each worker.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct WorkloadConfig {
    pub mode: WorkloadMode,
    /// Debug level passed to the workload with `-debug`.
    pub debug_level: u8,
    /// Path to the workload executable, as seen from the worker node.
    pub binary: PathBuf,
    /// Name of the workload, passed with `-simul`.
    pub name: String,
    /// Port the workload binds to on its worker address.
    pub port: u16,
    /// Directory entered before starting the workload.
    pub workdir: Option<PathBuf>,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            mode: WorkloadMode::default(),
            debug_level: 3,
            binary: PathBuf::from("./cothority"),
            name: String::from("CoSimul"),
            port: 2000,
            workdir: None,
        }
    }
}

/// Next hop used for the static routes towards other sites.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RouteVia {
    /// The gateway (`.1`) address of the remote subnet.
    #[default]
    Gateway,
    /// The address of the physical server hosting the remote subnet.
    Server,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct RouteConfig {
    pub via: RouteVia,
}

/// How long the local topology stays up.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum HoldMode {
    /// Keep the network running until the operator presses Ctrl-C. Without a terminal (e.g., on
    /// a remotely launched site), `run.unattended-hold-secs` is used instead.
    #[default]
    UntilSignal,
    /// Keep the network running for a fixed number of seconds.
    WaitSecs(u64),
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct RunConfig {
    pub hold: HoldMode,
    /// Delay between the end of the hold period and the retraction of the routes.
    pub settle_secs: u64,
    /// Delay after the local site is torn down, before the process exits.
    pub exit_grace_secs: u64,
    /// Hold period replacing `until-signal` when nobody can press Ctrl-C.
    pub unattended_hold_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            hold: HoldMode::default(),
            settle_secs: 5,
            exit_grace_secs: 1,
            unattended_hold_secs: 300,
        }
    }
}

impl RunConfig {
    /// The hold period of this process. Waiting for Ctrl-C requires an `interactive` terminal.
    pub fn effective_hold(&self, interactive: bool) -> HoldMode {
        match self.hold {
            HoldMode::UntilSignal if !interactive => HoldMode::WaitSecs(self.unattended_hold_secs),
            hold => hold,
        }
    }

    /// Number of seconds a remotely launched site keeps its network running.
    pub fn remote_hold_secs(&self) -> u64 {
        match self.hold {
            HoldMode::WaitSecs(secs) => secs,
            HoldMode::UntilSignal => self.unattended_hold_secs,
        }
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn exit_grace(&self) -> Duration {
        Duration::from_secs(self.exit_grace_secs)
    }
}

/// Configuration of the remote launches performed by the root.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct RemoteConfig {
    /// Command used to log into the remote servers.
    pub ssh: String,
    /// Command used to copy the artifacts to the remote servers.
    pub scp: String,
    /// Run the remote program with `sudo` (required for namespaces and forwarding).
    pub elevated: bool,
    /// Maximum number of sites launched at the same time.
    pub max_parallel: usize,
    /// Time allowed for copying and launching a single site.
    pub launch_timeout_secs: u64,
    /// Additional files copied next to the program.
    pub artifacts: Vec<PathBuf>,
    /// Remote directory (relative to the login directory) receiving the artifacts.
    pub directory: Option<String>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            ssh: String::from("ssh"),
            scp: String::from("scp"),
            elevated: true,
            max_parallel: 4,
            launch_timeout_secs: 30,
            artifacts: Vec::new(),
            directory: None,
        }
    }
}

impl RemoteConfig {
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct EmulationConfig {
    /// Prefix of the network namespaces created for the worker nodes.
    pub namespace_prefix: String,
}

impl Default for EmulationConfig {
    fn default() -> Self {
        Self {
            namespace_prefix: String::from("sl"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = Config::parse("").unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.relay.port, 5000);
        assert_eq!(cfg.relay.log_path, PathBuf::from("/tmp/stdout.gw"));
        assert_eq!(cfg.workload.mode, WorkloadMode::Probe);
        assert_eq!(cfg.workload.debug_level, 3);
        assert_eq!(cfg.run.hold, HoldMode::UntilSignal);
    }

    #[test]
    fn parse_full_config() {
        let cfg = Config::parse(
            r#"
[relay]
port = 6000
log-path = "/var/log/site.gw"

[workload]
mode = "real"
debug-level = 1
name = "Sign"

[routes]
via = "server"

[run]
hold = { wait-secs = 60 }
settle-secs = 0

[remote]
max-parallel = 2
artifacts = ["cothority", "app.toml"]
"#,
        )
        .unwrap();

        assert_eq!(cfg.relay.port, 6000);
        assert_eq!(cfg.relay.log_path, PathBuf::from("/var/log/site.gw"));
        assert_eq!(cfg.workload.mode, WorkloadMode::Real);
        assert_eq!(cfg.workload.debug_level, 1);
        assert_eq!(cfg.workload.name, "Sign");
        assert_eq!(cfg.workload.port, 2000);
        assert_eq!(cfg.routes.via, RouteVia::Server);
        assert_eq!(cfg.run.hold, HoldMode::WaitSecs(60));
        assert_eq!(cfg.run.settle(), Duration::ZERO);
        assert_eq!(cfg.remote.max_parallel, 2);
        assert_eq!(cfg.remote.artifacts.len(), 2);
        assert!(cfg.remote.elevated);
    }

    #[test]
    fn hold_without_terminal() {
        let mut run = RunConfig::default();
        assert_eq!(run.effective_hold(true), HoldMode::UntilSignal);
        assert_eq!(run.effective_hold(false), HoldMode::WaitSecs(300));
        assert_eq!(run.remote_hold_secs(), 300);

        run.hold = HoldMode::WaitSecs(20);
        assert_eq!(run.effective_hold(true), HoldMode::WaitSecs(20));
        assert_eq!(run.effective_hold(false), HoldMode::WaitSecs(20));
        assert_eq!(run.remote_hold_secs(), 20);
    }

    #[test]
    fn unknown_field_is_rejected() {
        assert!(matches!(
            Config::parse("[relay]\nprot = 5000\n"),
            Err(ConfigError::Toml(_))
        ));
    }
}
