//! Per-node channels.
//!
//! A channel owns exactly one connected TCP stream to one storage
//! instance. All pending operations destined for that instance share the
//! channel; shared ownership keeps it alive until the last holder retires,
//! even after the multiplexer has evicted it from its channel table.

use std::cell::Cell;
use std::io;
use std::net::{Shutdown, TcpStream};

use tracing::debug;

use crate::types::{EntityId, Instance};

pub struct Channel {
    instance: Instance,
    stream: TcpStream,
    /// This client's entity identity on this channel, as assigned by the
    /// node. Starts as the client sentinel and is adopted at most once.
    id: Cell<EntityId>,
    next_nonce: Cell<u32>,
    failed: Cell<bool>,
}

impl Channel {
    /// Connect to the instance's inbound endpoint. Failures leave no
    /// channel behind; the caller records nothing.
    pub fn open(instance: Instance) -> io::Result<Self> {
        let stream = TcpStream::connect(instance.addr)?;
        debug!(instance = %instance, "channel opened");
        Ok(Self {
            instance,
            stream,
            id: Cell::new(EntityId::client()),
            next_nonce: Cell::new(1),
            failed: Cell::new(false),
        })
    }

    pub fn instance(&self) -> Instance {
        self.instance
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn id(&self) -> EntityId {
        self.id.get()
    }

    /// Adopt the identity a node assigned us, once. Later frames must
    /// carry the same identity, so subsequent calls are no-ops.
    pub fn learn_id(&self, assigned: EntityId) -> bool {
        if self.id.get().is_client() && !assigned.is_client() {
            debug!(instance = %self.instance, id = %assigned, "channel identity learned");
            self.id.set(assigned);
            true
        } else {
            false
        }
    }

    /// Hand out the next correlation nonce. Nonces are per-channel and
    /// never reused while the channel lives.
    pub fn assign_nonce(&self) -> u32 {
        let nonce = self.next_nonce.get();
        self.next_nonce.set(nonce.wrapping_add(1));
        nonce
    }

    pub fn is_failed(&self) -> bool {
        self.failed.get()
    }

    /// Mark the channel dead and tear the socket down. Pendings that still
    /// hold the channel observe the flag and retire with a disconnect.
    pub fn fail(&self) {
        if !self.failed.replace(true) {
            debug!(instance = %self.instance, "channel failed");
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }
}
