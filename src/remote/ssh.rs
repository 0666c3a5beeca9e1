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


//! Remote runner based on the `ssh` and `scp` command line tools. Authentication must work without
//! interaction (keys or an agent), as the commands run in batch mode.

use std::{path::PathBuf, process::Stdio};

use async_trait::async_trait;
use tokio::process::Command;

use super::{RemoteLaunchError, RemoteRunner};
use crate::{cmd::shell_quote, config::RemoteConfig};

/// File on the remote server receiving the output of the detached program.
pub const REMOTE_OUTPUT: &str = "site-lab.out";

/// Runs commands on remote servers using `ssh`, and copies files using `scp`.
#[derive(Debug, Clone)]
pub struct SshRunner {
    ssh: Vec<String>,
    scp: Vec<String>,
    directory: Option<String>,
}

impl SshRunner {
    pub fn new(config: &RemoteConfig) -> Self {
        let words = |s: &str| s.split_whitespace().map(String::from).collect::<Vec<_>>();
        Self {
            ssh: words(&config.ssh),
            scp: words(&config.scp),
            directory: config.directory.clone().filter(|d| !d.is_empty()),
        }
    }

    /// Target of `scp` on `server`.
    fn destination(&self, server: &str) -> String {
        match &self.directory {
            Some(dir) => format!("{server}:{dir}/"),
            None => format!("{server}:"),
        }
    }

    /// The command executed by the remote shell to start `command_line` in the background.
    pub fn detached_command(&self, command_line: &str, elevated: bool) -> String {
        let cd = self
            .directory
            .as_ref()
            .map(|d| format!("cd {} && ", shell_quote(d)))
            .unwrap_or_default();
        let sudo = if elevated { "sudo -n " } else { "" };
        format!("{cd}nohup {sudo}{command_line} > {REMOTE_OUTPUT} 2>&1 < /dev/null &")
    }

    fn command(words: &[String], tool: &str, server: &str) -> Result<Command, RemoteLaunchError> {
        let (program, args) = words.split_first().ok_or_else(|| {
            RemoteLaunchError::Spawn(
                server.to_string(),
                tool.to_string(),
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
            )
        })?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }

    /// Run `ssh server cmd` and wait for it to finish.
    async fn ssh(&self, server: &str, cmd: &str) -> Result<(), RemoteLaunchError> {
        let mut ssh = Self::command(&self.ssh, "ssh", server)?;
        ssh.args(["-q", "-o", "BatchMode=yes", server, cmd]);
        let output = ssh
            .output()
            .await
            .map_err(|e| RemoteLaunchError::Spawn(server.to_string(), "ssh".to_string(), e))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(RemoteLaunchError::Execute(
                server.to_string(),
                failure(output.status, &output.stderr),
            ))
        }
    }
}

fn failure(status: std::process::ExitStatus, stderr: &[u8]) -> String {
    let stderr = String::from_utf8_lossy(stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {stderr}")
    }
}

#[async_trait]
impl RemoteRunner for SshRunner {
    async fn copy(&self, files: &[PathBuf], server: &str) -> Result<(), RemoteLaunchError> {
        if let Some(dir) = &self.directory {
            self.ssh(server, &format!("mkdir -p {}", shell_quote(dir)))
                .await
                .map_err(|e| match e {
                    RemoteLaunchError::Execute(s, msg) => RemoteLaunchError::Copy(s, msg),
                    e => e,
                })?;
        }

        let mut scp = Self::command(&self.scp, "scp", server)?;
        scp.arg("-q").args(files).arg(self.destination(server));
        let output = scp
            .output()
            .await
            .map_err(|e| RemoteLaunchError::Spawn(server.to_string(), "scp".to_string(), e))?;
        if output.status.success() {
            log::debug!("[{server}] copied {} files", files.len());
            Ok(())
        } else {
            Err(RemoteLaunchError::Copy(
                server.to_string(),
                failure(output.status, &output.stderr),
            ))
        }
    }

    async fn execute_detached(
        &self,
        server: &str,
        command_line: &str,
        elevated: bool,
    ) -> Result<(), RemoteLaunchError> {
        self.ssh(server, &self.detached_command(command_line, elevated))
            .await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn runner(ssh: &str, scp: &str, directory: Option<&str>) -> SshRunner {
        SshRunner::new(&RemoteConfig {
            ssh: ssh.to_string(),
            scp: scp.to_string(),
            directory: directory.map(String::from),
            ..Default::default()
        })
    }

    #[test]
    fn detached_command() {
        let r = runner("ssh", "scp", None);
        assert_eq!(
            r.detached_command("./site-lab list", true),
            "nohup sudo -n ./site-lab list > site-lab.out 2>&1 < /dev/null &"
        );
        assert_eq!(r.destination("10.0.0.2"), "10.0.0.2:");

        let r = runner("ssh -p 2222", "scp", Some("lab run"));
        assert_eq!(
            r.detached_command("./site-lab list", false),
            "cd 'lab run' && nohup ./site-lab list > site-lab.out 2>&1 < /dev/null &"
        );
        assert_eq!(r.destination("10.0.0.2"), "10.0.0.2:lab run/");
        assert_eq!(r.ssh, vec!["ssh".to_string(), "-p".to_string(), "2222".to_string()]);
    }

    #[tokio::test]
    async fn tool_status() {
        // `true` and `false` ignore their arguments, standing in for a reachable and an
        // unreachable server.
        let files = [PathBuf::from("list")];
        let ok = runner("true", "true", Some("lab"));
        ok.copy(&files, "s1").await.unwrap();
        ok.execute_detached("s1", "./site-lab list", true)
            .await
            .unwrap();

        let broken = runner("true", "false", None);
        assert!(matches!(
            broken.copy(&files, "s1").await,
            Err(RemoteLaunchError::Copy(s, _)) if s == "s1"
        ));
        let broken = runner("false", "true", Some("lab"));
        assert!(matches!(
            broken.copy(&files, "s1").await,
            Err(RemoteLaunchError::Copy(..))
        ));
        assert!(matches!(
            broken.execute_detached("s1", "./site-lab list", true).await,
            Err(RemoteLaunchError::Execute(..))
        ));
    }

    #[tokio::test]
    async fn missing_tool() {
        let r = runner("/nonexistent/ssh", "", None);
        assert!(matches!(
            r.execute_detached("s1", "x", false).await,
            Err(RemoteLaunchError::Spawn(_, tool, _)) if tool == "ssh"
        ));
        assert!(matches!(
            r.copy(&[], "s1").await,
            Err(RemoteLaunchError::Spawn(_, tool, _)) if tool == "scp"
        ));
    }
}
