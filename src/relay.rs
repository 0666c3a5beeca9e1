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


//! The UDP log relay. Workers send their output line by line to the gateway of their subnet
//! ([`send_lines`]). The gateway appends everything it receives to its log file
//! ([`start_collector`]), and, on all sites except the root, forwards every new line of that file
//! to the gateway of the root ([`start_forwarder`]).

use std::{
    io::{ErrorKind, SeekFrom},
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use thiserror::Error;
use time::{macros::format_description, OffsetDateTime};
use tokio::{
    fs::OpenOptions,
    io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    net::UdpSocket,
    task::JoinHandle,
};

use crate::emulation::EmulationError;

/// Largest payload of a single UDP datagram.
pub const MAX_DATAGRAM: usize = 65_507;

/// Handle to a relay task. Dropping the handle stops the task.
#[derive(Debug)]
pub struct RelayHandle {
    name: String,
    local_addr: Option<SocketAddr>,
    task: JoinHandle<Result<(), RelayError>>,
}

impl RelayHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address of the socket used by the relay.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Whether the relay task has terminated (e.g., because of an error).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the relay task. If the task already terminated with an error, that error is returned.
    pub async fn stop(mut self) -> Result<(), RelayError> {
        self.task.abort();
        match (&mut self.task).await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(RelayError::Task(self.name.clone(), e.to_string())),
        }
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Listen on `bind` and append every received datagram to `log_path`. The file is opened for
/// every datagram, so it can be reset while the collector is running.
pub async fn start_collector(
    name: impl Into<String>,
    bind: SocketAddr,
    log_path: impl Into<PathBuf>,
) -> Result<RelayHandle, RelayError> {
    let name = name.into();
    let log_path = log_path.into();
    let socket = UdpSocket::bind(bind)
        .await
        .map_err(|e| RelayError::Bind(bind, e))?;
    let local_addr = socket.local_addr().ok();
    log::debug!(
        "[{name}] collecting log datagrams on {} into {}",
        local_addr.unwrap_or(bind),
        log_path.display()
    );
    let task_name = name.clone();
    let task = tokio::spawn(async move { collect(&task_name, socket, &log_path).await });
    Ok(RelayHandle {
        name,
        local_addr,
        task,
    })
}

async fn collect(name: &str, socket: UdpSocket, log_path: &Path) -> Result<(), RelayError> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from) = socket
            .recv_from(&mut buf)
            .await
            .map_err(RelayError::Receive)?;
        log::trace!("[{name}] {len} bytes from {from}");
        if let Err(e) = append(log_path, &buf[..len]).await {
            log::warn!("[{name}] {e}");
        }
    }
}

async fn append(path: &Path, data: &[u8]) -> Result<(), RelayError> {
    let err = |e| RelayError::Log(path.to_path_buf(), e);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(err)?;
    file.write_all(data).await.map_err(err)?;
    file.flush().await.map_err(err)
}

/// Follow `log_path` and send every line appended to it as a datagram to `target`. Lines already
/// in the file when the forwarder starts are skipped.
pub async fn start_forwarder(
    name: impl Into<String>,
    log_path: impl Into<PathBuf>,
    target: SocketAddr,
    poll: Duration,
) -> Result<RelayHandle, RelayError> {
    let name = name.into();
    let socket = unbound_socket(target).await?;
    let local_addr = socket.local_addr().ok();
    let tail = LogTail::at_end(log_path.into()).await;
    log::debug!(
        "[{name}] forwarding new lines of {} to {target}",
        tail.path.display()
    );
    let task_name = name.clone();
    let task = tokio::spawn(async move { forward(&task_name, socket, tail, target, poll).await });
    Ok(RelayHandle {
        name,
        local_addr,
        task,
    })
}

async fn forward(
    name: &str,
    socket: UdpSocket,
    mut tail: LogTail,
    target: SocketAddr,
    poll: Duration,
) -> Result<(), RelayError> {
    let mut interval = tokio::time::interval(poll);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut failing = false;
    loop {
        interval.tick().await;
        let lines = match tail.poll_lines().await {
            Ok(lines) => lines,
            Err(e) => {
                log::warn!("[{name}] {e}");
                continue;
            }
        };
        for line in lines {
            match send(&socket, &line, target).await {
                Ok(()) if failing => {
                    log::info!("[{name}] forwarding to {target} works again");
                    failing = false;
                }
                Ok(()) => {}
                // the routes towards the root may not be installed yet.
                Err(e) if !failing => {
                    log::warn!("[{name}] {e}");
                    failing = true;
                }
                Err(_) => {}
            }
        }
    }
}

/// Reads the lines appended to a file since the last call.
#[derive(Debug)]
pub struct LogTail {
    path: PathBuf,
    offset: u64,
    partial: Vec<u8>,
}

impl LogTail {
    /// Start following `path` from its beginning.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            partial: Vec::new(),
        }
    }

    /// Start following `path` from its current end.
    pub async fn at_end(path: impl Into<PathBuf>) -> Self {
        let mut tail = Self::new(path);
        tail.offset = tokio::fs::metadata(&tail.path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        tail
    }

    /// Return all complete lines (including their newline) appended since the last call. If the
    /// file shrank, it is read again from the beginning.
    pub async fn poll_lines(&mut self) -> Result<Vec<Vec<u8>>, RelayError> {
        let err = |e| RelayError::Log(self.path.clone(), e);
        let len = match tokio::fs::metadata(&self.path).await {
            Ok(m) => m.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(err(e)),
        };
        if len < self.offset {
            log::debug!("{} was truncated, reading it from the start", self.path.display());
            self.offset = 0;
            self.partial.clear();
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        let mut file = tokio::fs::File::open(&self.path).await.map_err(err)?;
        file.seek(SeekFrom::Start(self.offset)).await.map_err(err)?;
        let mut buf = Vec::new();
        let read = file
            .take(len - self.offset)
            .read_to_end(&mut buf)
            .await
            .map_err(err)?;
        self.offset += read as u64;
        self.partial.extend_from_slice(&buf);

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            lines.push(self.partial.drain(..=pos).collect());
        }
        Ok(lines)
    }
}

/// Read `reader` line by line, and send every line as a datagram to `target`. Returns the number
/// of lines sent once the input is exhausted.
pub async fn send_lines<R>(mut reader: R, target: SocketAddr) -> Result<usize, RelayError>
where
    R: AsyncBufRead + Unpin,
{
    let socket = unbound_socket(target).await?;
    let mut line = Vec::new();
    let mut count = 0;
    loop {
        line.clear();
        let read = reader
            .read_until(b'\n', &mut line)
            .await
            .map_err(RelayError::Input)?;
        if read == 0 {
            return Ok(count);
        }
        if let Err(e) = send(&socket, &line, target).await {
            log::warn!("{e}");
        } else {
            count += 1;
        }
    }
}

async fn send(socket: &UdpSocket, data: &[u8], target: SocketAddr) -> Result<(), RelayError> {
    for chunk in data.chunks(MAX_DATAGRAM) {
        socket
            .send_to(chunk, target)
            .await
            .map_err(|e| RelayError::Send(target, e))?;
    }
    Ok(())
}

async fn unbound_socket(target: SocketAddr) -> Result<UdpSocket, RelayError> {
    let bind: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    UdpSocket::bind(bind)
        .await
        .map_err(|e| RelayError::Bind(bind, e))
}

/// Empty the log file and write the header line of a new run.
pub async fn reset_log(path: impl AsRef<Path>) -> Result<(), RelayError> {
    let path = path.as_ref();
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    let stamp = now
        .format(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second]"
        ))
        .unwrap_or_else(|_| now.to_string());
    tokio::fs::write(path, format!("Starting log at {stamp}.\n"))
        .await
        .map_err(|e| RelayError::Log(path.to_path_buf(), e))?;
    log::info!("Reset the log at {}", path.display());
    Ok(())
}

/// Errors of the log relay.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The UDP socket could not be created.
    #[error("Cannot bind a UDP socket on {0}: {1}")]
    Bind(SocketAddr, #[source] std::io::Error),
    /// Receiving a datagram failed.
    #[error("Cannot receive log datagrams: {0}")]
    Receive(#[source] std::io::Error),
    /// Sending a datagram failed.
    #[error("Cannot send log lines to {0}: {1}")]
    Send(SocketAddr, #[source] std::io::Error),
    /// The log file could not be accessed.
    #[error("Cannot access the log file {0}: {1}")]
    Log(PathBuf, #[source] std::io::Error),
    /// Reading the lines to send failed.
    #[error("Cannot read the input: {0}")]
    Input(#[source] std::io::Error),
    /// The relay task panicked.
    #[error("[{0}] The relay task failed: {1}")]
    Task(String, String),
    /// The worker pipeline sending the output to the gateway could not be started.
    #[error("[{0}] Cannot start the relay sender: {1}")]
    Worker(String, #[source] EmulationError),
}
