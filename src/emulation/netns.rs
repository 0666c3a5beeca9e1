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


//! Emulator based on Linux network namespaces. Switches are Linux bridges, every node in a
//! namespace gets its own network namespace, and links are veth pairs with one end attached to
//! the bridge. All commands are executed with `ip`, so the process needs root privileges.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use itertools::Itertools;
use tokio::process::Command;

use super::{EmulationError, Emulator, NodeSpec};
use crate::{cmd::CmdHandle, config::EmulationConfig};

/// Something created while starting the network that must be removed when stopping it.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Resource {
    Bridge(String),
    Namespace(String),
    Link(String),
}

impl Resource {
    fn remove_args(&self) -> Vec<String> {
        match self {
            Resource::Bridge(name) | Resource::Link(name) => {
                vec!["link".into(), "del".into(), name.clone()]
            }
            Resource::Namespace(name) => vec!["netns".into(), "del".into(), name.clone()],
        }
    }
}

/// A single `ip` invocation performed while starting the network.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Step {
    /// Namespace in which the command is executed.
    namespace: Option<String>,
    args: Vec<String>,
    /// Resource created by this step.
    creates: Option<Resource>,
}

impl Step {
    fn new<S: AsRef<str>>(args: impl IntoIterator<Item = S>) -> Self {
        Self {
            namespace: None,
            args: args.into_iter().map(|s| s.as_ref().to_string()).collect(),
            creates: None,
        }
    }

    fn within(mut self, namespace: Option<&String>) -> Self {
        self.namespace = namespace.cloned();
        self
    }

    fn creates(mut self, resource: Resource) -> Self {
        self.creates = Some(resource);
        self
    }

    fn argv(&self) -> Vec<String> {
        match &self.namespace {
            Some(ns) => ["netns", "exec", ns.as_str(), "ip"]
                .into_iter()
                .map(String::from)
                .chain(self.args.iter().cloned())
                .collect(),
            None => self.args.clone(),
        }
    }
}

/// Emulator creating bridges, namespaces and veth pairs on the local machine.
#[derive(Debug)]
pub struct NetnsEmulator {
    prefix: String,
    switches: Vec<String>,
    nodes: BTreeMap<String, NodeSpec>,
    /// Links as `(switch, node)` in the order they were added.
    links: Vec<(String, String)>,
    running: bool,
    created: Vec<Resource>,
}

impl NetnsEmulator {
    pub fn new(config: &EmulationConfig) -> Self {
        Self {
            prefix: config.namespace_prefix.clone(),
            switches: Vec::new(),
            nodes: BTreeMap::new(),
            links: Vec::new(),
            running: false,
            created: Vec::new(),
        }
    }

    /// Name of the namespace of `node`, or `None` if the node lives in the root namespace.
    fn namespace(&self, node: &NodeSpec) -> Option<String> {
        node.in_namespace
            .then(|| format!("{}-{}", self.prefix, node.name))
    }

    fn node(&self, name: &str) -> Result<&NodeSpec, EmulationError> {
        self.nodes
            .get(name)
            .ok_or_else(|| EmulationError::UnknownNode(name.to_string()))
    }

    fn exists(&self, name: &str) -> bool {
        self.nodes.contains_key(name) || self.switches.iter().any(|s| s == name)
    }

    /// Compute all `ip` commands required to create the network.
    fn start_plan(&self) -> Vec<Step> {
        let mut steps = Vec::new();

        for switch in self.switches.iter() {
            steps.push(
                Step::new(["link", "add", switch.as_str(), "type", "bridge"])
                    .creates(Resource::Bridge(switch.clone())),
            );
            steps.push(Step::new(["link", "set", switch.as_str(), "up"]));
        }

        for node in self.nodes.values() {
            if let Some(ns) = self.namespace(node) {
                steps.push(
                    Step::new(["netns", "add", ns.as_str()])
                        .creates(Resource::Namespace(ns.clone())),
                );
                steps.push(Step::new(["link", "set", "lo", "up"]).within(Some(&ns)));
            }
        }

        let mut switch_ports: HashMap<&str, usize> = HashMap::new();
        let mut node_ifaces: HashMap<&str, usize> = HashMap::new();
        for (switch, node_name) in self.links.iter() {
            let Some(node) = self.nodes.get(node_name) else {
                continue;
            };
            let ns = self.namespace(node);
            let port = switch_ports.entry(switch).or_insert(0);
            *port += 1;
            let iface_idx = node_ifaces.entry(node_name).or_insert(0);
            let switch_iface = format!("{switch}-eth{port}");
            let node_iface = format!("{node_name}-eth{iface_idx}");

            steps.push(
                Step::new([
                    "link",
                    "add",
                    node_iface.as_str(),
                    "type",
                    "veth",
                    "peer",
                    "name",
                    switch_iface.as_str(),
                ])
                .creates(Resource::Link(switch_iface.clone())),
            );
            steps.push(Step::new([
                "link",
                "set",
                switch_iface.as_str(),
                "master",
                switch.as_str(),
            ]));
            steps.push(Step::new(["link", "set", switch_iface.as_str(), "up"]));
            if let Some(ns) = ns.as_ref() {
                steps.push(Step::new(["link", "set", node_iface.as_str(), "netns", ns.as_str()]));
            }
            // only the first interface of a node carries its address
            if *iface_idx == 0 {
                let addr = node.address.to_string();
                steps.push(
                    Step::new(["addr", "add", addr.as_str(), "dev", node_iface.as_str()])
                        .within(ns.as_ref()),
                );
            }
            steps.push(
                Step::new(["link", "set", node_iface.as_str(), "up"]).within(ns.as_ref()),
            );
            *iface_idx += 1;
        }

        for node in self.nodes.values() {
            if let Some(gw) = node.default_route {
                let ns = self.namespace(node);
                steps.push(
                    Step::new(["route", "replace", "default", "via", gw.to_string().as_str()])
                        .within(ns.as_ref()),
                );
            }
        }

        steps
    }

    /// Remove all created resources in reverse order. Returns the first error.
    async fn cleanup(&mut self) -> Result<(), EmulationError> {
        let mut first_err = None;
        while let Some(resource) = self.created.pop() {
            if let Err(e) = ip(&resource.remove_args()).await {
                log::warn!("[emulator] cannot remove {resource:?}: {e}");
                first_err.get_or_insert(e);
            }
        }
        first_err.map(Err).unwrap_or(Ok(()))
    }
}

#[async_trait]
impl Emulator for NetnsEmulator {
    async fn add_switch(&mut self, name: &str) -> Result<(), EmulationError> {
        if self.running {
            return Err(EmulationError::AlreadyRunning);
        }
        if self.exists(name) {
            return Err(EmulationError::Duplicate(name.to_string()));
        }
        self.switches.push(name.to_string());
        Ok(())
    }

    async fn add_node(&mut self, node: NodeSpec) -> Result<(), EmulationError> {
        if self.running {
            return Err(EmulationError::AlreadyRunning);
        }
        if self.exists(&node.name) {
            return Err(EmulationError::Duplicate(node.name));
        }
        self.nodes.insert(node.name.clone(), node);
        Ok(())
    }

    async fn add_link(&mut self, a: &str, b: &str) -> Result<(), EmulationError> {
        if self.running {
            return Err(EmulationError::AlreadyRunning);
        }
        let is_switch = |x: &str| self.switches.iter().any(|s| s == x);
        let link = match (is_switch(a), is_switch(b)) {
            (true, false) if self.nodes.contains_key(b) => (a.to_string(), b.to_string()),
            (false, true) if self.nodes.contains_key(a) => (b.to_string(), a.to_string()),
            _ => return Err(EmulationError::UnsupportedLink(a.to_string(), b.to_string())),
        };
        self.links.push(link);
        Ok(())
    }

    async fn start(&mut self) -> Result<(), EmulationError> {
        if self.running {
            return Err(EmulationError::AlreadyRunning);
        }
        log::info!(
            "[emulator] starting {} switches and {} nodes",
            self.switches.len(),
            self.nodes.len()
        );
        for step in self.start_plan() {
            if let Err(e) = ip(&step.argv()).await {
                log::error!("[emulator] cannot start the network: {e}");
                let _ = self.cleanup().await;
                return Err(e);
            }
            if let Some(resource) = step.creates {
                self.created.push(resource);
            }
        }
        self.running = true;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), EmulationError> {
        log::info!("[emulator] stopping the network");
        self.running = false;
        self.cleanup().await
    }

    async fn node_cmd(&self, node: &str, cmd: &str) -> Result<String, EmulationError> {
        let node = self.node(node)?;
        let mut argv = Vec::new();
        if let Some(ns) = self.namespace(node) {
            argv.extend(["ip".to_string(), "netns".into(), "exec".into(), ns]);
        }
        argv.extend(["sh".to_string(), "-c".into(), cmd.to_string()]);
        run(&node.name, &argv).await
    }

    fn spawn(&self, node: &str, name: &str, cmd: &str) -> Result<CmdHandle, EmulationError> {
        let node = self.node(node)?;
        let command = match self.namespace(node) {
            Some(ns) => {
                let mut c = Command::new("ip");
                c.args(["netns", "exec", ns.as_str(), "sh", "-c", cmd]);
                c
            }
            None => {
                let mut c = Command::new("sh");
                c.args(["-c", cmd]);
                c
            }
        };
        Ok(CmdHandle::spawn(format!("{}/{name}", node.name), command)?)
    }
}

impl Drop for NetnsEmulator {
    fn drop(&mut self) {
        // the network was not stopped properly; remove what we can synchronously.
        while let Some(resource) = self.created.pop() {
            log::trace!("[emulator] remove {resource:?} (drop)");
            let _ = std::process::Command::new("ip")
                .args(resource.remove_args())
                .output();
        }
    }
}

async fn ip(args: &[String]) -> Result<String, EmulationError> {
    let argv = std::iter::once("ip".to_string())
        .chain(args.iter().cloned())
        .collect_vec();
    run("emulator", &argv).await
}

/// Execute `argv` and return its standard output.
async fn run(label: &str, argv: &[String]) -> Result<String, EmulationError> {
    let cmd = argv.join(" ");
    let Some((program, args)) = argv.split_first() else {
        return Ok(String::new());
    };
    log::trace!("[{label}] {cmd}");
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| EmulationError::Io(label.to_string(), cmd.clone(), e))?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(EmulationError::CommandFailed {
            node: label.to_string(),
            cmd,
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}
