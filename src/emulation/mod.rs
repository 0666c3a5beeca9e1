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


//! Interface to the network-emulation engine. The lab only needs a handful of primitives: create
//! switches, nodes and links, start and stop the network, and execute commands on a node. The
//! [`NetnsEmulator`] implements them with Linux network namespaces.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use thiserror::Error;

use crate::cmd::{CmdError, CmdHandle};

#[cfg(test)]
pub(crate) mod mock;
mod netns;

pub use netns::NetnsEmulator;

/// Description of a node in the emulated network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    /// Name of the node (e.g., `h0`).
    pub name: String,
    /// Address of the node, including the prefix length of its subnet.
    pub address: Ipv4Net,
    /// Next hop of the default route, if any.
    pub default_route: Option<Ipv4Addr>,
    /// Whether the node gets its own network namespace. Nodes outside of a namespace share the
    /// network stack of the physical server.
    pub in_namespace: bool,
}

/// Primitives of a network-emulation engine.
#[async_trait]
pub trait Emulator: Send + Sync {
    /// Add a switch to the (not yet started) network.
    async fn add_switch(&mut self, name: &str) -> Result<(), EmulationError>;

    /// Add a node to the (not yet started) network.
    async fn add_node(&mut self, node: NodeSpec) -> Result<(), EmulationError>;

    /// Connect a node with a switch.
    async fn add_link(&mut self, a: &str, b: &str) -> Result<(), EmulationError>;

    /// Create all switches, nodes and links.
    async fn start(&mut self) -> Result<(), EmulationError>;

    /// Remove everything created by [`Emulator::start`]. This is best-effort: it removes as much
    /// as possible, and reports the first error.
    async fn stop(&mut self) -> Result<(), EmulationError>;

    /// Execute a shell command on a node and return its standard output. Fails if the command
    /// exits with a non-zero status.
    async fn node_cmd(&self, node: &str, cmd: &str) -> Result<String, EmulationError>;

    /// Start a long-running shell command on a node. The returned handle owns the process.
    fn spawn(&self, node: &str, name: &str, cmd: &str) -> Result<CmdHandle, EmulationError>;
}

/// Errors of the emulation engine.
#[derive(Debug, Error)]
pub enum EmulationError {
    /// The node does not exist.
    #[error("Unknown node {0}")]
    UnknownNode(String),
    /// A node or switch with the same name exists already.
    #[error("A node or switch named {0} exists already")]
    Duplicate(String),
    /// Links can only connect a node with a switch.
    #[error("Cannot link {0} with {1}: a link must connect a node with a switch")]
    UnsupportedLink(String, String),
    /// The network cannot be changed while it is running.
    #[error("The network is already running")]
    AlreadyRunning,
    /// A command exited with a non-zero status.
    #[error("[{node}] `{cmd}` exited with status {status}: {stderr}")]
    CommandFailed {
        node: String,
        cmd: String,
        status: i32,
        stderr: String,
    },
    /// A command could not be executed.
    #[error("[{0}] Cannot execute `{1}`: {2}")]
    Io(String, String, #[source] std::io::Error),
    /// A long-running process could not be started.
    #[error("{0}")]
    Cmd(#[from] CmdError),
}
