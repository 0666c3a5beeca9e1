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


#![deny(missing_debug_implementations)]

//! # SiteLab
//!
//! SiteLab runs an emulated network that spans several physical servers. Each server listed in
//! the registry file hosts exactly one subnet: a gateway node on the `.1` address and a number of
//! worker nodes on the following addresses. Every worker runs a workload process, and its output
//! is relayed over UDP to the local gateway, which in turn forwards it to the gateway of the root
//! server (the first entry of the registry). The root thus collects the output of all sites in a
//! single log file.
//!
//! The same program runs on every server. The process on the root server additionally copies
//! itself to all other servers and starts them remotely (see [`remote`]).
//!
//! ## Main Concepts
//!
//! - [`registry`] parses the registry file and figures out which entry describes this machine.
//! - [`addressing`] derives the gateway and worker addresses of a subnet.
//! - [`topology`] builds the local network (switch, gateway, workers) on an [`emulation::Emulator`]
//!   and starts or stops it.
//! - [`node`] contains the behavior of the gateway and the worker nodes.
//! - [`relay`] implements the UDP log relay (collector, forwarder and sender).
//! - [`routes`] adds and removes the static routes towards all other sites.
//! - [`lab`] ties everything together into the lifecycle of one process.

use std::path::PathBuf;

use thiserror::Error;

pub mod addressing;
pub mod cmd;
pub mod config;
pub mod emulation;
pub mod lab;
pub mod node;
pub mod registry;
pub mod relay;
pub mod remote;
pub mod routes;
pub mod topology;

pub use addressing::{derive_addresses, AddressError, SubnetAddresses};
pub use cmd::{CmdError, CmdHandle};
pub use config::Config;
pub use emulation::{EmulationError, Emulator, NetnsEmulator, NodeSpec};
pub use lab::{Coordinator, RunSummary};
pub use registry::{LocalSite, Registry, RemoteSite, SiteSpec};
pub use relay::{RelayError, RelayHandle};
pub use remote::{LaunchReport, RemoteLaunchError, RemoteRunner, SshRunner};
pub use routes::{AppliedRoutes, RouteEntry, RouteError};
pub use topology::{Topology, TopologyError, TopologyPlan};

/// Error of an invalid registry or configuration. This is the only error that aborts the
/// process, and it is always raised before the network is touched.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file could not be read.
    #[error("Cannot read {0}: {1}")]
    Unreadable(PathBuf, #[source] std::io::Error),
    /// A registry line does not consist of exactly three fields.
    #[error("Line {line}: expected `<server> <subnet> <count>`, found {found} fields")]
    FieldCount { line: usize, found: usize },
    /// The subnet of a registry line cannot be parsed.
    #[error("Line {line}: invalid IPv4 subnet `{value}`")]
    InvalidSubnet { line: usize, value: String },
    /// The worker count of a registry line cannot be parsed.
    #[error("Line {line}: invalid number of workers `{value}`")]
    InvalidCount { line: usize, value: String },
    /// The addresses of a registry line cannot be derived.
    #[error("Line {line}: {error}")]
    Address { line: usize, error: AddressError },
    /// The registry does not contain any site.
    #[error("The registry does not contain any site")]
    EmptyRegistry,
    /// Two registry entries describe the same physical server.
    #[error("Entries {first} and {second} both match a local address")]
    AmbiguousLocalSite { first: usize, second: usize },
    /// Two registry entries use overlapping subnets.
    #[error("Line {second_line}: subnet {second_net} overlaps {first_net} (line {first_line})")]
    OverlappingSubnets {
        first_line: usize,
        first_net: ipnet::Ipv4Net,
        second_line: usize,
        second_net: ipnet::Ipv4Net,
    },
    /// The addresses of the local interfaces cannot be listed.
    #[error("Cannot list the local addresses: {0}")]
    LocalAddresses(String),
    /// The configuration file is invalid.
    #[error("Invalid configuration: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Main error type of the site lab.
#[derive(Debug, Error)]
pub enum SiteLabError {
    /// Invalid registry or configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    /// The local network could not be built, started or stopped.
    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),
    /// A static route could not be added or removed.
    #[error("Route error: {0}")]
    Route(#[from] RouteError),
    /// A remote site could not be launched.
    #[error("Remote launch error: {0}")]
    RemoteLaunch(#[from] RemoteLaunchError),
    /// The log relay failed.
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),
    /// The task running the local site panicked.
    #[error("The local site task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl SiteLabError {
    /// Only configuration errors abort the process. All other errors are logged, and the run
    /// continues in a degraded state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}
