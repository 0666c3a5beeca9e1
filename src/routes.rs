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


//! Static routes between the sites. Every gateway needs a route towards the subnet of every other
//! site, pointing to that site's gateway (or server).

use std::{fmt::Display, net::Ipv4Addr};

use ipnet::Ipv4Net;
use thiserror::Error;

use crate::{
    config::RouteVia,
    emulation::{EmulationError, Emulator},
    registry::RemoteSite,
};

/// A static route installed on the local gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteEntry {
    pub destination: Ipv4Net,
    pub via: Ipv4Addr,
}

impl RouteEntry {
    fn add_cmd(&self) -> String {
        format!("ip route add {} via {}", self.destination, self.via)
    }

    fn del_cmd(&self) -> String {
        format!("ip route del {} via {}", self.destination, self.via)
    }
}

impl Display for RouteEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} via {}", self.destination, self.via)
    }
}

/// Compute the routes towards all `remotes`. Sites whose next hop cannot be determined are
/// reported and skipped.
pub fn route_entries(remotes: &[RemoteSite], via: RouteVia) -> (Vec<RouteEntry>, Vec<RouteError>) {
    let mut entries = Vec::with_capacity(remotes.len());
    let mut errors = Vec::new();
    for remote in remotes {
        let next_hop = match via {
            RouteVia::Gateway => Some(remote.spec.gateway()),
            RouteVia::Server => match remote.spec.server_ip() {
                Some(std::net::IpAddr::V4(ip)) => Some(ip),
                _ => None,
            },
        };
        match next_hop {
            Some(via) => entries.push(RouteEntry {
                destination: remote.spec.subnet.trunc(),
                via,
            }),
            None => errors.push(RouteError::NoNextHop(remote.spec.server.clone())),
        }
    }
    (entries, errors)
}

/// The routes that were actually installed, and must be retracted later.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[must_use = "applied routes must be retracted"]
pub struct AppliedRoutes {
    node: String,
    routes: Vec<RouteEntry>,
}

impl AppliedRoutes {
    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn routes(&self) -> &[RouteEntry] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Install all `routes` on `node`. Each route is independent: a failing route is logged and the
/// remaining ones are still installed.
pub async fn apply_routes<E: Emulator + ?Sized>(
    emulator: &E,
    node: &str,
    routes: &[RouteEntry],
) -> AppliedRoutes {
    let mut applied = AppliedRoutes {
        node: node.to_string(),
        routes: Vec::with_capacity(routes.len()),
    };
    for route in routes {
        match emulator.node_cmd(node, &route.add_cmd()).await {
            Ok(_) => {
                log::debug!("[{node}] added route {route}");
                applied.routes.push(*route);
            }
            Err(e) => log::warn!("{}", RouteError::Apply(*route, e)),
        }
    }
    log::info!(
        "[{node}] installed {} of {} routes",
        applied.routes.len(),
        routes.len()
    );
    applied
}

/// Remove exactly the routes that were installed by [`apply_routes`]. Returns the routes that
/// could not be removed.
pub async fn retract_routes<E: Emulator + ?Sized>(
    emulator: &E,
    applied: AppliedRoutes,
) -> Vec<RouteError> {
    let node = applied.node;
    let mut errors = Vec::new();
    for route in applied.routes {
        match emulator.node_cmd(&node, &route.del_cmd()).await {
            Ok(_) => log::debug!("[{node}] removed route {route}"),
            Err(e) => {
                let e = RouteError::Retract(route, e);
                log::warn!("{e}");
                errors.push(e);
            }
        }
    }
    errors
}

/// A route towards another site could not be changed.
#[derive(Debug, Error)]
pub enum RouteError {
    /// The next hop of a site is not an IPv4 address.
    #[error("[{0}] Cannot determine the next hop: the server is not an IPv4 address")]
    NoNextHop(String),
    /// Adding the route failed.
    #[error("Cannot add the route {0}: {1}")]
    Apply(RouteEntry, #[source] EmulationError),
    /// Removing the route failed.
    #[error("Cannot remove the route {0}: {1}")]
    Retract(RouteEntry, #[source] EmulationError),
}
