//! Coordinator link.
//!
//! The coordinator is the cluster's topology authority. A link announces a
//! role, then receives topology snapshots pushed as newline-delimited JSON
//! objects. The newest complete snapshot is held as *unacknowledged* until
//! the consumer adopts it and calls [`CoordLink::acknowledge`].

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use thiserror::Error;
use tracing::debug;

use crate::topology::TopologySnapshot;

/// Role announced by client links at construction.
pub const ANNOUNCE_CLIENT: &str = "client";

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("coordinator connect failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("coordinator link lost: {0}")]
    Disconnect(String),
    #[error("coordinator shut down")]
    Shutdown,
    #[error("coordinator protocol violation: {0}")]
    Logic(String),
}

/// Access to the coordinator's topology feed.
///
/// `step` drives the link: it waits up to `timeout` (`None` blocks until
/// an event) and folds up to `max_events` received snapshots into the
/// unacknowledged slot. `readiness_fd` exposes a pollable handle so the
/// multiplexer can wait on the link and its channels in one readiness set.
pub trait CoordLink {
    fn set_announce(&mut self, role: &str);
    fn connect(&mut self) -> Result<(), LinkError>;
    fn step(&mut self, max_events: usize, timeout: Option<Duration>) -> Result<(), LinkError>;
    fn connected(&self) -> bool;
    fn readiness_fd(&self) -> Option<BorrowedFd<'_>>;
    fn unacknowledged(&self) -> bool;
    fn snapshot(&self) -> &TopologySnapshot;
    fn acknowledge(&mut self);
}

/// Production link: TCP to the coordinator endpoint.
pub struct TcpCoordLink {
    addr: SocketAddr,
    announce: String,
    stream: Option<TcpStream>,
    rxbuf: Vec<u8>,
    current: TopologySnapshot,
    unacked: bool,
}

impl TcpCoordLink {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            announce: ANNOUNCE_CLIENT.to_string(),
            stream: None,
            rxbuf: Vec::new(),
            current: TopologySnapshot::default(),
            unacked: false,
        }
    }
}

impl CoordLink for TcpCoordLink {
    fn set_announce(&mut self, role: &str) {
        self.announce = role.to_string();
    }

    fn connect(&mut self) -> Result<(), LinkError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let mut stream = TcpStream::connect(self.addr).map_err(LinkError::Connect)?;
        stream
            .write_all(format!("{}\n", self.announce).as_bytes())
            .map_err(LinkError::Connect)?;
        stream.set_nonblocking(true).map_err(LinkError::Connect)?;
        debug!(coordinator = %self.addr, role = %self.announce, "coordinator link up");
        self.rxbuf.clear();
        self.stream = Some(stream);
        Ok(())
    }

    fn step(&mut self, max_events: usize, timeout: Option<Duration>) -> Result<(), LinkError> {
        let ready = {
            let Some(stream) = self.stream.as_ref() else {
                return Err(LinkError::Disconnect("link is down".to_string()));
            };
            let poll_timeout = match timeout {
                None => PollTimeout::NONE,
                Some(d) => PollTimeout::from(u16::try_from(d.as_millis()).unwrap_or(u16::MAX)),
            };
            let mut pfds = [PollFd::new(stream.as_fd(), PollFlags::POLLIN)];
            poll(&mut pfds, poll_timeout)
                .map_err(|err| LinkError::Logic(format!("coordinator wait failed: {err}")))?
                > 0
        };
        if !ready {
            return Ok(());
        }

        let mut lost: Option<LinkError> = None;
        {
            let Some(stream) = self.stream.as_mut() else {
                return Err(LinkError::Disconnect("link is down".to_string()));
            };
            let mut chunk = [0u8; 4096];
            loop {
                match stream.read(&mut chunk) {
                    Ok(0) => {
                        lost = Some(LinkError::Disconnect(
                            "coordinator closed the feed".to_string(),
                        ));
                        break;
                    }
                    Ok(n) => {
                        self.rxbuf.extend_from_slice(&chunk[..n]);
                        if n < chunk.len() {
                            break;
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        lost = Some(LinkError::Disconnect(format!(
                            "coordinator read failed: {err}"
                        )));
                        break;
                    }
                }
            }
        }

        // Fold out whatever complete snapshots arrived before reporting a
        // lost link, so a final push before shutdown is not dropped.
        let mut events = 0;
        while events < max_events {
            let Some(nl) = self.rxbuf.iter().position(|&b| b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.rxbuf.drain(..=nl).collect();
            let line = &line[..line.len() - 1];
            if line.is_empty() {
                continue;
            }
            let snap: TopologySnapshot = serde_json::from_slice(line).map_err(|err| {
                LinkError::Logic(format!("undecodable topology snapshot: {err}"))
            })?;
            debug!(version = snap.version, "coordinator pushed topology");
            self.current = snap;
            self.unacked = true;
            events += 1;
        }

        if let Some(err) = lost {
            self.stream = None;
            return Err(err);
        }
        Ok(())
    }

    fn connected(&self) -> bool {
        self.stream.is_some()
    }

    fn readiness_fd(&self) -> Option<BorrowedFd<'_>> {
        self.stream.as_ref().map(|s| s.as_fd())
    }

    fn unacknowledged(&self) -> bool {
        self.unacked
    }

    fn snapshot(&self) -> &TopologySnapshot {
        &self.current
    }

    fn acknowledge(&mut self) {
        self.unacked = false;
    }
}
