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


//! In-memory emulator used in tests. It records every call and keeps a route table per node, so
//! that route changes can be checked.

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;

use super::{EmulationError, Emulator, NodeSpec};
use crate::cmd::CmdHandle;

/// Shared state of the mock. Clones of a [`MockEmulator`] observe the same state.
#[derive(Debug, Default)]
pub(crate) struct MockState {
    pub switches: Vec<String>,
    pub nodes: Vec<NodeSpec>,
    pub links: Vec<(String, String)>,
    pub running: bool,
    pub starts: usize,
    pub stops: usize,
    /// Every command as `(node, cmd)`.
    pub commands: Vec<(String, String)>,
    /// Every spawned process as `(node, name, cmd)`.
    pub spawned: Vec<(String, String, String)>,
    /// Routes as `(node, destination, via)`.
    pub routes: BTreeSet<(String, String, String)>,
    /// Commands containing one of these strings fail.
    pub fail_on: Vec<String>,
    /// Make `start` fail.
    pub fail_start: bool,
    /// Make `stop` fail.
    pub fail_stop: bool,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct MockEmulator {
    pub state: Arc<Mutex<MockState>>,
}

impl MockEmulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    fn failed(node: &str, cmd: &str, stderr: &str) -> EmulationError {
        EmulationError::CommandFailed {
            node: node.to_string(),
            cmd: cmd.to_string(),
            status: 2,
            stderr: stderr.to_string(),
        }
    }
}

#[async_trait]
impl Emulator for MockEmulator {
    async fn add_switch(&mut self, name: &str) -> Result<(), EmulationError> {
        self.state().switches.push(name.to_string());
        Ok(())
    }

    async fn add_node(&mut self, node: NodeSpec) -> Result<(), EmulationError> {
        self.state().nodes.push(node);
        Ok(())
    }

    async fn add_link(&mut self, a: &str, b: &str) -> Result<(), EmulationError> {
        self.state().links.push((a.to_string(), b.to_string()));
        Ok(())
    }

    async fn start(&mut self) -> Result<(), EmulationError> {
        let mut state = self.state();
        state.starts += 1;
        if state.fail_start {
            return Err(Self::failed("emulator", "start", "start failed"));
        }
        state.running = true;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), EmulationError> {
        let mut state = self.state();
        state.stops += 1;
        state.running = false;
        if state.fail_stop {
            return Err(Self::failed("emulator", "stop", "stop failed"));
        }
        Ok(())
    }

    async fn node_cmd(&self, node: &str, cmd: &str) -> Result<String, EmulationError> {
        let mut state = self.state();
        state.commands.push((node.to_string(), cmd.to_string()));
        if !state.nodes.iter().any(|n| n.name == node) {
            return Err(EmulationError::UnknownNode(node.to_string()));
        }
        if state.fail_on.iter().any(|f| cmd.contains(f.as_str())) {
            return Err(Self::failed(node, cmd, "injected failure"));
        }

        let words = cmd.split_whitespace().collect::<Vec<_>>();
        if let ["ip", "route", action, dst, "via", via] = words.as_slice() {
            let route = (node.to_string(), dst.to_string(), via.to_string());
            match *action {
                "add" if !state.routes.insert(route.clone()) => {
                    return Err(Self::failed(node, cmd, "RTNETLINK answers: File exists"));
                }
                "del" if !state.routes.remove(&route) => {
                    return Err(Self::failed(node, cmd, "RTNETLINK answers: No such process"));
                }
                _ => {}
            }
        }
        Ok(String::new())
    }

    fn spawn(&self, node: &str, name: &str, cmd: &str) -> Result<CmdHandle, EmulationError> {
        let mut state = self.state();
        state
            .spawned
            .push((node.to_string(), name.to_string(), cmd.to_string()));
        if state.fail_on.iter().any(|f| cmd.contains(f.as_str())) {
            return Err(Self::failed(node, cmd, "injected failure"));
        }
        Ok(CmdHandle::shell(format!("{node}/{name}"), "sleep 1")?)
    }
}
