//! Shared fixtures: a scripted coordinator link and stub-node helpers.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use lattice_client::coord::{CoordLink, LinkError};
use lattice_client::frame::{self, FrameHeader, MessageType, NET_SUCCESS};
use lattice_client::topology::{InstanceDef, RegionDef, SpaceDef, TopologySnapshot};
use lattice_client::types::EntityId;
use lattice_client::wire::{put_u16, put_value_list};

/// Inbound version advertised for the stub node in test topologies.
pub const INBOUND_VERSION: u16 = 7;

/// The single region head every test topology routes to.
pub fn head_entity() -> EntityId {
    EntityId {
        space: 1,
        subspace: 0,
        prefix: 0,
        mask: 0,
        number: 0,
    }
}

/// The client identity the stub node assigns in its replies.
pub fn client_entity() -> EntityId {
    EntityId {
        space: 500,
        subspace: 0,
        prefix: 0,
        mask: 0,
        number: 1,
    }
}

/// One space `"s"` with the given dimensions, one region covering the
/// whole hash range, one instance at `addr`.
pub fn one_node_topology(
    version: u64,
    addr: SocketAddr,
    inbound_version: u16,
    dimensions: &[&str],
) -> TopologySnapshot {
    TopologySnapshot {
        version,
        spaces: vec![SpaceDef {
            id: 1,
            name: "s".to_string(),
            dimensions: dimensions.iter().map(|d| d.to_string()).collect(),
        }],
        regions: vec![RegionDef {
            space: 1,
            subspace: 0,
            prefix: 0,
            mask: 0,
            head: head_entity(),
        }],
        instances: vec![InstanceDef {
            entity: head_entity(),
            addr,
            inbound_version,
        }],
    }
}

struct ScriptState {
    queued: VecDeque<TopologySnapshot>,
}

/// Test-side handle: queue a snapshot and wake the link's readiness
/// descriptor, the way the real coordinator feed would.
pub struct ScriptHandle {
    state: Rc<RefCell<ScriptState>>,
    wake_tx: UnixStream,
}

impl ScriptHandle {
    pub fn push(&self, snapshot: TopologySnapshot) {
        self.state.borrow_mut().queued.push_back(snapshot);
        (&self.wake_tx).write_all(&[1]).unwrap();
    }
}

/// Scripted in-process coordinator link. Snapshots queued through the
/// handle become unacknowledged on the next `step`, one wake byte each,
/// so the readiness descriptor behaves like the TCP feed's.
pub struct ScriptLink {
    state: Rc<RefCell<ScriptState>>,
    wake_rx: UnixStream,
    current: TopologySnapshot,
    unacked: bool,
    connected: bool,
}

pub fn script_link() -> (ScriptLink, ScriptHandle) {
    let (wake_rx, wake_tx) = UnixStream::pair().unwrap();
    wake_rx.set_nonblocking(true).unwrap();
    let state = Rc::new(RefCell::new(ScriptState {
        queued: VecDeque::new(),
    }));
    (
        ScriptLink {
            state: Rc::clone(&state),
            wake_rx,
            current: TopologySnapshot::default(),
            unacked: false,
            connected: false,
        },
        ScriptHandle { state, wake_tx },
    )
}

impl ScriptLink {
    fn consume_one(&mut self) {
        if let Some(snapshot) = self.state.borrow_mut().queued.pop_front() {
            self.current = snapshot;
            self.unacked = true;
        }
    }
}

impl CoordLink for ScriptLink {
    fn set_announce(&mut self, _role: &str) {}

    fn connect(&mut self) -> Result<(), LinkError> {
        self.connected = true;
        Ok(())
    }

    fn step(&mut self, max_events: usize, timeout: Option<Duration>) -> Result<(), LinkError> {
        if !self.connected {
            return Err(LinkError::Disconnect("scripted link is down".to_string()));
        }

        if timeout.is_none() && self.state.borrow().queued.is_empty() {
            // Block for the next wake byte like the TCP link would.
            self.wake_rx.set_nonblocking(false).unwrap();
            let mut byte = [0u8; 1];
            let n = (&self.wake_rx).read(&mut byte).unwrap();
            self.wake_rx.set_nonblocking(true).unwrap();
            if n == 0 {
                return Err(LinkError::Disconnect("scripted feed closed".to_string()));
            }
            self.consume_one();
            return Ok(());
        }

        let mut events = 0;
        while events < max_events {
            let mut byte = [0u8; 1];
            match (&self.wake_rx).read(&mut byte) {
                Ok(0) => {
                    return Err(LinkError::Disconnect("scripted feed closed".to_string()));
                }
                Ok(_) => {
                    self.consume_one();
                    events += 1;
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(LinkError::Disconnect(err.to_string())),
            }
        }
        Ok(())
    }

    fn connected(&self) -> bool {
        self.connected
    }

    fn readiness_fd(&self) -> Option<BorrowedFd<'_>> {
        Some(self.wake_rx.as_fd())
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

/// Read one complete request frame off a stub node's accepted stream.
pub fn read_request(stream: &mut TcpStream) -> (FrameHeader, Bytes) {
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix).unwrap();
    let size = u32::from_be_bytes(prefix) as usize;
    let mut full = vec![0u8; size];
    full[..4].copy_from_slice(&prefix);
    stream.read_exact(&mut full[4..]).unwrap();
    frame::decode_request(&full).unwrap()
}

/// Answer a request the way a storage node does: `from` echoes the entity
/// the request addressed, `to` assigns the client its identity.
pub fn send_reply(stream: &mut TcpStream, request: &FrameHeader, msg_type: MessageType, body: &[u8]) {
    let reply = frame::encode_reply(
        msg_type,
        INBOUND_VERSION,
        &request.to,
        &client_entity(),
        request.nonce,
        body,
    );
    stream.write_all(&reply).unwrap();
}

/// RESP_GET success body carrying `values`.
pub fn get_hit_body(values: &[&str]) -> Vec<u8> {
    let values: Vec<Bytes> = values
        .iter()
        .map(|v| Bytes::from(v.to_string()))
        .collect();
    let mut body = Vec::new();
    put_u16(&mut body, NET_SUCCESS);
    put_value_list(&mut body, &values);
    body
}

/// Reply body carrying a bare network result code.
pub fn code_body(code: u16) -> Vec<u8> {
    let mut body = Vec::new();
    put_u16(&mut body, code);
    body
}
