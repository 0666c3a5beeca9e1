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


//! Build the local network of a site: one switch `s0`, the gateway `h0`, and the workers `h1` to
//! `hN`. The [`TopologyPlan`] describes the network, and the [`Topology`] creates it on an
//! [`Emulator`] and manages its lifecycle.

use std::{fmt::Display, net::Ipv4Addr, sync::Arc};

use ipnet::Ipv4Net;
use itertools::Itertools;
use thiserror::Error;

use crate::{
    addressing::{derive_addresses, AddressError},
    config::Config,
    emulation::{EmulationError, Emulator, NodeSpec},
    node::{GatewayNode, WorkerNode},
    registry::SiteSpec,
};

/// Name of the single switch of a site.
pub const SWITCH_NAME: &str = "s0";
/// Name of the gateway node of a site.
pub const GATEWAY_NAME: &str = "h0";

/// The gateway node of a site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayPlan {
    pub name: String,
    /// Gateway address (`.1`) with the prefix length of the subnet.
    pub address: Ipv4Net,
    /// Gateway of the root site, to which the log is forwarded. `None` on the root itself.
    pub relay_to: Option<Ipv4Addr>,
}

/// A worker node of a site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPlan {
    pub name: String,
    /// Worker address with the prefix length of the subnet.
    pub address: Ipv4Net,
    /// Address of the local gateway, used as default route and as log relay.
    pub gateway: Ipv4Addr,
}

/// Kind of a hop in the relay tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayKind {
    /// From a worker to the gateway of its subnet.
    WorkerToGateway,
    /// From the gateway of a site to the gateway of the root.
    GatewayToRoot,
}

/// One hop of the UDP relay tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayLink {
    pub kind: RelayKind,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub port: u16,
}

impl Display for RelayLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}:{}", self.source, self.destination, self.port)
    }
}

/// Description of the local network of a site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyPlan {
    pub switch: String,
    pub gateway: GatewayPlan,
    pub workers: Vec<WorkerPlan>,
    pub relay_port: u16,
}

impl TopologyPlan {
    /// Plan the network of `site`. If `root_gateway` is given, the gateway forwards its log
    /// there.
    pub fn new(
        site: &SiteSpec,
        root_gateway: Option<Ipv4Addr>,
        config: &Config,
    ) -> Result<Self, AddressError> {
        let addrs = derive_addresses(site.subnet, site.workers)?;
        let gateway = GatewayPlan {
            name: GATEWAY_NAME.to_string(),
            address: addrs.gateway_net(),
            relay_to: root_gateway,
        };
        let workers = addrs
            .worker_nets()
            .enumerate()
            .map(|(i, address)| WorkerPlan {
                name: format!("h{}", i + 1),
                address,
                gateway: addrs.gateway,
            })
            .collect();
        Ok(Self {
            switch: SWITCH_NAME.to_string(),
            gateway,
            workers,
            relay_port: config.relay.port,
        })
    }

    /// All nodes of the network, gateway first.
    pub fn nodes(&self) -> Vec<NodeSpec> {
        // the gateway shares the network stack of the server, so that it can route between the
        // emulated subnet and the physical network.
        std::iter::once(NodeSpec {
            name: self.gateway.name.clone(),
            address: self.gateway.address,
            default_route: None,
            in_namespace: false,
        })
        .chain(self.workers.iter().map(|w| NodeSpec {
            name: w.name.clone(),
            address: w.address,
            default_route: Some(w.gateway),
            in_namespace: true,
        }))
        .collect()
    }

    /// All hops of the relay tree that start in this site.
    pub fn relay_links(&self) -> Vec<RelayLink> {
        let gateway = self.gateway.address.addr();
        self.workers
            .iter()
            .map(|w| RelayLink {
                kind: RelayKind::WorkerToGateway,
                source: w.address.addr(),
                destination: gateway,
                port: self.relay_port,
            })
            .chain(self.gateway.relay_to.map(|root| RelayLink {
                kind: RelayKind::GatewayToRoot,
                source: gateway,
                destination: root,
                port: self.relay_port,
            }))
            .collect()
    }
}

/// Handle to the emulated network of the local site.
#[derive(Debug)]
pub struct Topology<E> {
    emulator: E,
    plan: TopologyPlan,
    config: Arc<Config>,
    gateway: Option<GatewayNode>,
    workers: Vec<WorkerNode>,
    running: bool,
}

impl<E: Emulator> Topology<E> {
    /// Add the switch, all nodes and all links of `plan` to the emulator. The network is not
    /// started yet.
    pub async fn build(
        mut emulator: E,
        plan: TopologyPlan,
        config: Arc<Config>,
    ) -> Result<Self, TopologyError> {
        log::debug!(
            "[{}] building switch {} with {} workers",
            plan.gateway.name,
            plan.switch,
            plan.workers.len()
        );
        emulator
            .add_switch(&plan.switch)
            .await
            .map_err(TopologyError::Build)?;
        for node in plan.nodes() {
            let name = node.name.clone();
            emulator.add_node(node).await.map_err(TopologyError::Build)?;
            emulator
                .add_link(&name, &plan.switch)
                .await
                .map_err(TopologyError::Build)?;
        }
        Ok(Self {
            emulator,
            plan,
            config,
            gateway: None,
            workers: Vec::new(),
            running: false,
        })
    }

    pub fn plan(&self) -> &TopologyPlan {
        &self.plan
    }

    pub fn emulator(&self) -> &E {
        &self.emulator
    }

    pub fn gateway_name(&self) -> &str {
        &self.plan.gateway.name
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Start the network, and configure the gateway and all workers.
    pub async fn start(&mut self) -> Result<(), TopologyError> {
        if self.running {
            return Ok(());
        }
        if let Err(e) = self.emulator.start().await {
            // remove whatever was created before the failure
            if let Err(cleanup) = self.emulator.stop().await {
                log::warn!("[{}] cannot clean up the network: {cleanup}", self.plan.gateway.name);
            }
            return Err(TopologyError::Start(e));
        }
        self.running = true;

        log::info!(
            "[{}] relay tree: {}",
            self.plan.gateway.name,
            self.plan.relay_links().iter().join(", ")
        );

        self.gateway =
            Some(GatewayNode::configure(&self.emulator, &self.plan.gateway, &self.config).await);
        for worker in self.plan.workers.iter() {
            self.workers
                .push(WorkerNode::configure(&self.emulator, worker, &self.config).await);
        }
        Ok(())
    }

    /// Terminate all nodes and stop the network. The nodes are terminated even if stopping the
    /// network fails.
    pub async fn stop(&mut self) -> Result<(), TopologyError> {
        for worker in self.workers.drain(..) {
            worker.terminate().await;
        }
        if let Some(gateway) = self.gateway.take() {
            gateway.terminate(&self.emulator).await;
        }
        if !self.running {
            return Ok(());
        }
        self.running = false;
        self.emulator.stop().await.map_err(TopologyError::Stop)
    }
}

/// Errors while building, starting or stopping the local network.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// The addresses of the site cannot be derived.
    #[error("Cannot derive the addresses of the site: {0}")]
    Address(#[from] AddressError),
    /// The emulator rejected the topology.
    #[error("Cannot build the topology: {0}")]
    Build(#[source] EmulationError),
    /// The network could not be started.
    #[error("Cannot start the network: {0}")]
    Start(#[source] EmulationError),
    /// The network could not be stopped.
    #[error("Cannot stop the network: {0}")]
    Stop(#[source] EmulationError),
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::emulation::mock::MockEmulator;

    fn site(subnet: &str, workers: usize) -> SiteSpec {
        SiteSpec {
            server: "192.168.0.10".to_string(),
            subnet: subnet.parse().unwrap(),
            workers,
        }
    }

    fn config() -> Arc<Config> {
        let mut config = Config::default();
        // do not collide with a real relay on the test machine
        config.relay.port = 0;
        config.relay.bind = Ipv4Addr::LOCALHOST.into();
        Arc::new(config)
    }

    #[test]
    fn plan_root_site() {
        let plan = TopologyPlan::new(&site("10.5.0.0/16", 3), None, &Config::default()).unwrap();
        assert_eq!(plan.switch, "s0");
        assert_eq!(plan.gateway.name, "h0");
        assert_eq!(plan.gateway.address, "10.5.0.1/16".parse::<Ipv4Net>().unwrap());
        assert_eq!(plan.gateway.relay_to, None);
        assert_eq!(
            plan.workers
                .iter()
                .map(|w| (w.name.as_str(), w.address.to_string()))
                .collect::<Vec<_>>(),
            vec![
                ("h1", "10.5.0.2/16".to_string()),
                ("h2", "10.5.0.3/16".to_string()),
                ("h3", "10.5.0.4/16".to_string()),
            ]
        );
        assert!(plan
            .relay_links()
            .iter()
            .all(|l| l.kind == RelayKind::WorkerToGateway
                && l.destination == Ipv4Addr::new(10, 5, 0, 1)
                && l.port == 5000));
        assert_eq!(plan.relay_links().len(), 3);
    }

    #[test]
    fn plan_non_root_site() {
        let root_gw = Ipv4Addr::new(10, 1, 0, 1);
        let plan = TopologyPlan::new(&site("10.2.0.0/16", 1), Some(root_gw), &Config::default())
            .unwrap();
        assert_eq!(
            plan.relay_links(),
            vec![
                RelayLink {
                    kind: RelayKind::WorkerToGateway,
                    source: Ipv4Addr::new(10, 2, 0, 2),
                    destination: Ipv4Addr::new(10, 2, 0, 1),
                    port: 5000,
                },
                RelayLink {
                    kind: RelayKind::GatewayToRoot,
                    source: Ipv4Addr::new(10, 2, 0, 1),
                    destination: root_gw,
                    port: 5000,
                },
            ]
        );
        let nodes = plan.nodes();
        assert!(!nodes[0].in_namespace);
        assert_eq!(nodes[1].default_route, Some(Ipv4Addr::new(10, 2, 0, 1)));
        assert!(nodes[1].in_namespace);
    }

    #[tokio::test]
    async fn build_without_workers() {
        let emu = MockEmulator::new();
        let plan = TopologyPlan::new(&site("10.5.0.0/16", 0), None, &Config::default()).unwrap();
        let topo = Topology::build(emu.clone(), plan, config()).await.unwrap();
        assert!(!topo.is_running());

        let state = emu.state();
        assert_eq!(state.switches, vec!["s0".to_string()]);
        assert_eq!(state.nodes.len(), 1);
        assert_eq!(state.nodes[0].name, "h0");
        assert_eq!(state.links, vec![("h0".to_string(), "s0".to_string())]);
    }

    #[tokio::test]
    async fn start_and_stop() {
        let emu = MockEmulator::new();
        let plan = TopologyPlan::new(&site("10.5.0.0/16", 2), None, &Config::default()).unwrap();
        let mut topo = Topology::build(emu.clone(), plan, config()).await.unwrap();
        assert_eq!(emu.state().links.len(), 3);

        topo.start().await.unwrap();
        assert!(topo.is_running());
        {
            let state = emu.state();
            assert!(state.running);
            assert_eq!(state.spawned.len(), 2);
            assert!(state
                .commands
                .contains(&("h0".to_string(), "sysctl -w net.ipv4.ip_forward=1".to_string())));
        }

        topo.stop().await.unwrap();
        assert!(!topo.is_running());
        let state = emu.state();
        assert!(!state.running);
        assert_eq!(state.stops, 1);
        assert!(state
            .commands
            .contains(&("h0".to_string(), "sysctl -w net.ipv4.ip_forward=0".to_string())));
    }

    #[tokio::test]
    async fn failed_start_cleans_up() {
        let emu = MockEmulator::new();
        emu.state().fail_start = true;
        let plan = TopologyPlan::new(&site("10.5.0.0/16", 1), None, &Config::default()).unwrap();
        let mut topo = Topology::build(emu.clone(), plan, config()).await.unwrap();
        assert!(matches!(topo.start().await, Err(TopologyError::Start(_))));
        assert!(!topo.is_running());
        assert_eq!(emu.state().stops, 1);
        assert!(emu.state().spawned.is_empty());
    }

    #[tokio::test]
    async fn failed_cleanup_keeps_start_error() {
        let emu = MockEmulator::new();
        emu.state().fail_start = true;
        emu.state().fail_stop = true;
        let plan = TopologyPlan::new(&site("10.5.0.0/16", 1), None, &Config::default()).unwrap();
        let mut topo = Topology::build(emu.clone(), plan, config()).await.unwrap();
        match topo.start().await {
            Err(TopologyError::Start(EmulationError::CommandFailed { cmd, .. })) => {
                assert_eq!(cmd, "start")
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(emu.state().stops, 1);
        // nothing is running, so stopping again does not touch the emulator
        topo.stop().await.unwrap();
        assert_eq!(emu.state().stops, 1);
    }
}
