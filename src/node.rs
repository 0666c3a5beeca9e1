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


//! Behavior of the gateway and worker nodes once the network is running.

use std::net::SocketAddr;

use crate::{
    cmd::{shell_quote, CmdHandle},
    config::{Config, WorkloadMode},
    emulation::Emulator,
    relay::{self, RelayError, RelayHandle},
    topology::{GatewayPlan, WorkerPlan},
};

const FORWARDING_ON: &str = "sysctl -w net.ipv4.ip_forward=1";
const FORWARDING_OFF: &str = "sysctl -w net.ipv4.ip_forward=0";

/// The running gateway of a site. It forwards packets between the emulated subnet and the other
/// sites, collects the output of the workers, and (on non-root sites) forwards the collected log
/// to the root gateway.
#[derive(Debug)]
pub struct GatewayNode {
    name: String,
    forwarding: bool,
    collector: Option<RelayHandle>,
    forwarder: Option<RelayHandle>,
}

impl GatewayNode {
    /// Enable IP forwarding and start the relay. A failing relay is reported but does not stop
    /// the site.
    pub async fn configure<E: Emulator + ?Sized>(
        emulator: &E,
        plan: &GatewayPlan,
        config: &Config,
    ) -> Self {
        let name = plan.name.clone();
        let forwarding = match emulator.node_cmd(&name, FORWARDING_ON).await {
            Ok(_) => true,
            Err(e) => {
                log::warn!("[{name}] Cannot enable IP forwarding: {e}");
                false
            }
        };

        let port = config.relay.port;
        let collector = relay::start_collector(
            format!("{name}/collector"),
            SocketAddr::new(config.relay.bind, port),
            &config.relay.log_path,
        )
        .await
        .map_err(|e| log::error!("[{name}] {e}"))
        .ok();

        let forwarder = match plan.relay_to {
            Some(root) => relay::start_forwarder(
                format!("{name}/forwarder"),
                &config.relay.log_path,
                SocketAddr::new(root.into(), port),
                config.relay.poll_interval(),
            )
            .await
            .map_err(|e| log::error!("[{name}] {e}"))
            .ok(),
            None => None,
        };

        log::info!(
            "[{name}] gateway {} ready{}",
            plan.address,
            plan.relay_to
                .map(|r| format!(", forwarding the log to {r}"))
                .unwrap_or_default()
        );

        Self {
            name,
            forwarding,
            collector,
            forwarder,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the relay is fully running.
    pub fn relay_running(&self) -> bool {
        self.collector.as_ref().is_some_and(|c| !c.is_finished())
            && self.forwarder.as_ref().map_or(true, |f| !f.is_finished())
    }

    /// Stop the relay and disable forwarding again.
    pub async fn terminate<E: Emulator + ?Sized>(self, emulator: &E) {
        for handle in [self.forwarder, self.collector].into_iter().flatten() {
            if let Err(e) = handle.stop().await {
                log::warn!("[{}] {e}", self.name);
            }
        }
        if self.forwarding {
            if let Err(e) = emulator.node_cmd(&self.name, FORWARDING_OFF).await {
                log::warn!("[{}] Cannot disable IP forwarding: {e}", self.name);
            }
        }
    }
}

/// A worker node running its workload, with the output piped to the gateway.
#[derive(Debug)]
pub struct WorkerNode {
    name: String,
    workload: Option<CmdHandle>,
}

impl WorkerNode {
    /// Start the workload of the worker. If it cannot be started, the error is reported and the
    /// worker stays idle.
    pub async fn configure<E: Emulator + ?Sized>(
        emulator: &E,
        plan: &WorkerPlan,
        config: &Config,
    ) -> Self {
        let cmd = worker_command(plan, config);
        log::debug!("[{}] {cmd}", plan.name);
        let workload = emulator
            .spawn(&plan.name, "workload", &cmd)
            .map_err(|e| log::error!("{}", RelayError::Worker(plan.name.clone(), e)))
            .ok();
        Self {
            name: plan.name.clone(),
            workload,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_started(&self) -> bool {
        self.workload.is_some()
    }

    pub async fn terminate(self) {
        if let Some(workload) = self.workload {
            if let Err(e) = workload.stop().await {
                log::warn!("[{}] {e}", self.name);
            }
        }
    }
}

/// Shell pipeline executed on a worker: the workload (or a ping of the gateway in probe mode),
/// with all output sent line by line to the gateway.
pub fn worker_command(plan: &WorkerPlan, config: &Config) -> String {
    let sender = format!(
        "{} relay-send {}:{}",
        shell_quote(config.relay_sender().to_string_lossy()),
        plan.gateway,
        config.relay.port
    );
    let w = &config.workload;
    match w.mode {
        WorkloadMode::Probe => format!("ping -c 2 {} 2>&1 | {sender}", plan.gateway),
        WorkloadMode::Real => {
            let run = format!(
                "( pwd; {} -debug {} -address {}:{} -simul {} ) 2>&1 | {sender}",
                shell_quote(w.binary.to_string_lossy()),
                w.debug_level,
                plan.address.addr(),
                w.port,
                shell_quote(&w.name),
            );
            match &w.workdir {
                Some(dir) => format!("cd {} && {run}", shell_quote(dir.to_string_lossy())),
                None => run,
            }
        }
    }
}
