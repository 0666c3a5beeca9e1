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


//! Remote runner used in tests. It records all copies and executions, and fails or hangs for
//! selected servers.

use std::{
    collections::HashSet,
    path::PathBuf,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;

use super::{RemoteLaunchError, RemoteRunner};

#[derive(Debug, Default)]
pub(crate) struct MockRunnerState {
    /// Every copy as `(server, files)`.
    pub copies: Vec<(String, Vec<PathBuf>)>,
    /// Every execution as `(server, command_line, elevated)`.
    pub executions: Vec<(String, String, bool)>,
    pub fail_copy: HashSet<String>,
    pub fail_execute: HashSet<String>,
    /// Servers on which the copy never finishes.
    pub hang: HashSet<String>,
}

#[derive(Debug, Default)]
pub(crate) struct MockRunner {
    state: Mutex<MockRunnerState>,
}

impl MockRunner {
    pub fn state(&self) -> MutexGuard<'_, MockRunnerState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl RemoteRunner for MockRunner {
    async fn copy(&self, files: &[PathBuf], server: &str) -> Result<(), RemoteLaunchError> {
        let hang = {
            let mut state = self.state();
            state.copies.push((server.to_string(), files.to_vec()));
            if state.fail_copy.contains(server) {
                return Err(RemoteLaunchError::Copy(
                    server.to_string(),
                    "Permission denied".to_string(),
                ));
            }
            state.hang.contains(server)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn execute_detached(
        &self,
        server: &str,
        command_line: &str,
        elevated: bool,
    ) -> Result<(), RemoteLaunchError> {
        let mut state = self.state();
        state
            .executions
            .push((server.to_string(), command_line.to_string(), elevated));
        if state.fail_execute.contains(server) {
            return Err(RemoteLaunchError::Execute(
                server.to_string(),
                "exit status 1".to_string(),
            ));
        }
        Ok(())
    }
}
