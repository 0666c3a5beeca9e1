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


//! The registry lists all sites participating in a run, one per line:
//!
//! ```text
//! <server address> <subnet> <number of workers>
//! ```
//!
//! The first entry is the root. Every process reads the same registry and decides on its own which
//! entry describes the machine it is running on.

use std::{
    collections::HashSet,
    fmt::Display,
    net::{IpAddr, Ipv4Addr},
    path::Path,
};

use ipnet::Ipv4Net;
use itertools::Itertools;
use tokio::process::Command;

use crate::{
    addressing::{derive_addresses, gateway_address, SubnetAddresses},
    ConfigError,
};

/// Index of the root site in the registry.
pub const ROOT_INDEX: usize = 0;

/// One line of the registry: a physical server hosting one subnet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SiteSpec {
    /// Address of the physical server (used to match the local machine and to log in).
    pub server: String,
    /// Subnet emulated on that server.
    pub subnet: Ipv4Net,
    /// Number of worker nodes in the subnet.
    pub workers: usize,
}

impl SiteSpec {
    /// All addresses of this site.
    pub fn addresses(&self) -> SubnetAddresses {
        // the registry only accepts sites whose addresses can be derived.
        derive_addresses(self.subnet, self.workers).unwrap_or_else(|_| SubnetAddresses {
            network: self.subnet.trunc(),
            gateway: self.gateway(),
            workers: Vec::new(),
        })
    }

    /// Address of the gateway of this site.
    pub fn gateway(&self) -> Ipv4Addr {
        gateway_address(self.subnet).unwrap_or_else(|_| self.subnet.network())
    }

    /// The server address, if it is an IP address.
    pub fn server_ip(&self) -> Option<IpAddr> {
        self.server.parse().ok()
    }
}

impl Display for SiteSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.server, self.subnet, self.workers)
    }
}

/// The site hosted on this machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSite {
    /// Position of the site in the registry.
    pub index: usize,
    pub spec: SiteSpec,
}

impl LocalSite {
    /// Whether this machine is the root of the run.
    pub fn is_root(&self) -> bool {
        self.index == ROOT_INDEX
    }
}

/// A site hosted on another machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSite {
    /// Position of the site in the registry.
    pub index: usize,
    pub spec: SiteSpec,
}

impl RemoteSite {
    pub fn is_root(&self) -> bool {
        self.index == ROOT_INDEX
    }
}

/// Parsed registry file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registry {
    entries: Vec<SiteSpec>,
}

impl Registry {
    /// Read and parse the registry file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Unreadable(path.to_path_buf(), e))?;
        content.parse()
    }

    /// Create a registry from a list of sites. Errors refer to the position of the site in the
    /// list, counting from one.
    pub fn new(entries: Vec<SiteSpec>) -> Result<Self, ConfigError> {
        let lines = (1..=entries.len()).collect();
        Self::with_lines(entries, lines)
    }

    /// Validate `entries`, where `lines[i]` is the line of the registry file describing entry
    /// `i`.
    fn with_lines(entries: Vec<SiteSpec>, lines: Vec<usize>) -> Result<Self, ConfigError> {
        if entries.is_empty() {
            return Err(ConfigError::EmptyRegistry);
        }
        for (site, line) in entries.iter().zip(lines.iter()) {
            derive_addresses(site.subnet, site.workers)
                .map_err(|error| ConfigError::Address { line: *line, error })?;
        }
        for ((a, la), (b, lb)) in entries.iter().zip(lines.iter()).tuple_combinations() {
            if a.subnet.contains(&b.subnet.network()) || b.subnet.contains(&a.subnet.network()) {
                return Err(ConfigError::OverlappingSubnets {
                    first_line: *la,
                    first_net: a.subnet,
                    second_line: *lb,
                    second_net: b.subnet,
                });
            }
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[SiteSpec] {
        &self.entries
    }

    /// The root site (the first entry).
    pub fn root(&self) -> &SiteSpec {
        &self.entries[ROOT_INDEX]
    }

    /// Split the registry into the site hosted on this machine (if any) and all other sites.
    pub fn resolve(
        &self,
        local_addresses: &HashSet<IpAddr>,
    ) -> Result<(Option<LocalSite>, Vec<RemoteSite>), ConfigError> {
        resolve(&self.entries, local_addresses)
    }
}

impl std::str::FromStr for Registry {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut entries = Vec::new();
        let mut lines = Vec::new();
        for (idx, line) in s.lines().enumerate() {
            let line_nr = idx + 1;
            let fields = line.split_whitespace().collect::<Vec<_>>();
            match fields.as_slice() {
                [] => continue,
                [server, subnet, count] => {
                    let subnet: Ipv4Net = subnet.parse().map_err(|_| ConfigError::InvalidSubnet {
                        line: line_nr,
                        value: subnet.to_string(),
                    })?;
                    let workers: usize = count.parse().map_err(|_| ConfigError::InvalidCount {
                        line: line_nr,
                        value: count.to_string(),
                    })?;
                    entries.push(SiteSpec {
                        server: server.to_string(),
                        subnet,
                        workers,
                    });
                    lines.push(line_nr);
                }
                _ => {
                    return Err(ConfigError::FieldCount {
                        line: line_nr,
                        found: fields.len(),
                    })
                }
            }
        }
        Self::with_lines(entries, lines)
    }
}

/// Find the entry whose server address is bound to a local interface. All other entries become
/// remote sites, keeping their order and registry index. At most one entry may match.
pub fn resolve(
    entries: &[SiteSpec],
    local_addresses: &HashSet<IpAddr>,
) -> Result<(Option<LocalSite>, Vec<RemoteSite>), ConfigError> {
    let mut local: Option<LocalSite> = None;
    let mut remote = Vec::new();

    for (index, spec) in entries.iter().enumerate() {
        let is_local = spec
            .server_ip()
            .map(|ip| local_addresses.contains(&ip))
            .unwrap_or(false);
        if !is_local {
            remote.push(RemoteSite {
                index,
                spec: spec.clone(),
            });
        } else if let Some(first) = local.as_ref() {
            return Err(ConfigError::AmbiguousLocalSite {
                first: first.index,
                second: index,
            });
        } else {
            local = Some(LocalSite {
                index,
                spec: spec.clone(),
            });
        }
    }

    Ok((local, remote))
}

/// List all addresses bound to the interfaces of this machine, using `ip -o addr show`.
pub async fn local_addresses() -> Result<HashSet<IpAddr>, ConfigError> {
    let output = Command::new("ip")
        .args(["-o", "addr", "show"])
        .output()
        .await
        .map_err(|e| ConfigError::LocalAddresses(e.to_string()))?;
    if !output.status.success() {
        return Err(ConfigError::LocalAddresses(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    let addrs = parse_ip_addr_output(&String::from_utf8_lossy(&output.stdout));
    log::debug!(
        "Local addresses: {}",
        addrs.iter().sorted().map(|a| a.to_string()).join(", ")
    );
    Ok(addrs)
}

/// Extract every address following an `inet` or `inet6` keyword in the output of `ip addr`.
pub fn parse_ip_addr_output(output: &str) -> HashSet<IpAddr> {
    output
        .lines()
        .flat_map(|line| line.split_whitespace().tuple_windows::<(&str, &str)>())
        .filter(|(kw, _)| *kw == "inet" || *kw == "inet6")
        .filter_map(|(_, addr)| addr.split('/').next()?.parse().ok())
        .collect()
}
