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


//! Handle to a long-running child process. The process is started in its own process group, so
//! that stopping the handle terminates the whole pipeline it started, and nothing else.

use std::{
    process::Stdio,
    time::{Duration, Instant},
};

use thiserror::Error;
use tokio::{process::Child, process::Command, time::timeout};

const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Handle to a process group started by the lab. Dropping the handle kills the group.
#[derive(Debug)]
pub struct CmdHandle {
    /// Human-readable name, used for logging.
    name: String,
    /// The command line, used for logging.
    cmd: String,
    child: Option<Child>,
    /// Process group of the child (equal to the pid of the group leader).
    pgid: Option<u32>,
    started: Instant,
}

impl CmdHandle {
    /// Spawn `command` in a new process group. Standard input and output are not connected.
    pub fn spawn(name: impl Into<String>, mut command: Command) -> Result<Self, CmdError> {
        let name = name.into();
        let cmd = format!("{:?}", command.as_std());
        command
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let child = command
            .spawn()
            .map_err(|e| CmdError::Spawn(name.clone(), cmd.clone(), e))?;
        let pgid = child.id();
        log::debug!("[{name}] started {cmd} (pid {pgid:?})");
        Ok(Self {
            name,
            cmd,
            child: Some(child),
            pgid,
            started: Instant::now(),
        })
    }

    /// Spawn a shell command line with `sh -c`.
    pub fn shell(name: impl Into<String>, cmd: impl AsRef<str>) -> Result<Self, CmdError> {
        let mut command = Command::new("sh");
        command.arg("-c").arg(cmd.as_ref());
        Self::spawn(name, command)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Process id of the group leader, if it is still running.
    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    /// Check whether the process is still running.
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut().map(|c| c.try_wait()) {
            Some(Ok(None)) => true,
            Some(Ok(Some(_))) | Some(Err(_)) | None => false,
        }
    }

    /// Terminate the process group: first with `SIGTERM`, then with `SIGKILL` if it does not exit
    /// in time. A process that already exited is not an error.
    pub async fn stop(mut self) -> Result<(), CmdError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        if let Ok(Some(status)) = child.try_wait() {
            log::debug!(
                "[{}] already exited with {status} after {:.1}s",
                self.name,
                self.started.elapsed().as_secs_f64()
            );
            // the leader is gone, but the rest of the pipeline may still be alive.
            if let Some(pgid) = self.pgid.take() {
                signal_group(pgid, libc::SIGKILL);
            }
            return Ok(());
        }

        let Some(pid) = self.pgid.take() else {
            return Ok(());
        };
        log::debug!("[{}] stopping {}", self.name, self.cmd);
        signal_group(pid, libc::SIGTERM);

        match timeout(STOP_TIMEOUT, child.wait()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(CmdError::Stop(self.name.clone(), e)),
            Err(_) => {
                log::warn!("[{}] did not terminate, killing it", self.name);
                signal_group(pid, libc::SIGKILL);
                child
                    .kill()
                    .await
                    .map_err(|e| CmdError::Stop(self.name.clone(), e))?;
            }
        }
        // remaining members of the pipeline
        signal_group(pid, libc::SIGKILL);
        Ok(())
    }
}

impl Drop for CmdHandle {
    fn drop(&mut self) {
        if let (Some(pgid), Some(_)) = (self.pgid, self.child.as_ref()) {
            log::trace!("[{}] kill process group {pgid} (drop)", self.name);
            signal_group(pgid, libc::SIGKILL);
        }
    }
}

/// Send `signal` to the process group `pgid`. Groups that no longer exist are ignored.
fn signal_group(pgid: u32, signal: libc::c_int) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: `killpg` has no memory-safety preconditions.
    let ret = unsafe { libc::killpg(pgid, signal) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            log::debug!("killpg({pgid}, {signal}) failed: {err}");
        }
    }
}

/// Quote `s` for use in a POSIX shell command line.
pub fn shell_quote(s: impl AsRef<str>) -> String {
    let s = s.as_ref();
    let safe = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@%+,".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// Error of a child process.
#[derive(Debug, Error)]
pub enum CmdError {
    /// The process could not be started.
    #[error("[{0}] Cannot start `{1}`: {2}")]
    Spawn(String, String, #[source] std::io::Error),
    /// The process could not be stopped.
    #[error("[{0}] Cannot stop the process: {1}")]
    Stop(String, #[source] std::io::Error),
}
