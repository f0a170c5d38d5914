//! Cluster identity atoms.
//!
//! SpaceId: handle for a named space
//! EntityId: logical actor address (replica head or client)
//! Instance: physical node incarnation (endpoint + version)
//! RegionId: shard range under a subspace
//! Status: client-visible operation outcome

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Space number reserved for client-side entities. A channel starts out
/// addressing itself with this sentinel until the server assigns it a
/// concrete identity.
pub const CLIENT_SPACE: u32 = u32::MAX;

/// Opaque handle for a named space under a topology snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpaceId(u32);

impl SpaceId {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address of a logical actor in the cluster protocol.
///
/// Serializes to a fixed 16-byte big-endian layout in field declaration
/// order; both request and reply frames carry two of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId {
    pub space: u32,
    pub subspace: u16,
    pub prefix: u8,
    pub mask: u64,
    pub number: u8,
}

impl EntityId {
    pub const SERIALIZED_LEN: usize = 16;

    /// The reserved "this client, identity not yet learned" value.
    pub fn client() -> Self {
        Self {
            space: CLIENT_SPACE,
            subspace: 0,
            prefix: 0,
            mask: 0,
            number: 0,
        }
    }

    pub fn is_client(&self) -> bool {
        self.space == CLIENT_SPACE
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.space.to_be_bytes());
        buf.extend_from_slice(&self.subspace.to_be_bytes());
        buf.push(self.prefix);
        buf.extend_from_slice(&self.mask.to_be_bytes());
        buf.push(self.number);
    }

    pub fn decode(raw: &[u8; Self::SERIALIZED_LEN]) -> Self {
        Self {
            space: u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
            subspace: u16::from_be_bytes([raw[4], raw[5]]),
            prefix: raw[6],
            mask: u64::from_be_bytes([
                raw[7], raw[8], raw[9], raw[10], raw[11], raw[12], raw[13], raw[14],
            ]),
            number: raw[15],
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_client() {
            write!(f, "client")
        } else {
            write!(
                f,
                "{}:{}:{}/{:#018x}.{}",
                self.space, self.subspace, self.prefix, self.mask, self.number
            )
        }
    }
}

/// A physical node incarnation. Two instances with the same endpoint but
/// different versions are distinct nodes as far as routing is concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instance {
    pub addr: SocketAddr,
    pub inbound_version: u16,
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{}", self.addr, self.inbound_version)
    }
}

/// A shard range: the keys of `space`/`subspace` whose hash starts with the
/// top `prefix` bits of `mask`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RegionId {
    pub space: SpaceId,
    pub subspace: u16,
    pub prefix: u8,
    pub mask: u64,
}

impl RegionId {
    /// The zero-width region owning exactly one key hash under subspace 0.
    /// Routing resolves the head of this region to find the node
    /// responsible for a key.
    pub fn point_leader(space: SpaceId, key_hash: u64) -> Self {
        Self {
            space,
            subspace: 0,
            prefix: 64,
            mask: key_hash,
        }
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}/{:#018x}",
            self.space, self.subspace, self.prefix, self.mask
        )
    }
}

/// Outcome of a single operation, delivered to its continuation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// Operation applied; for get, values returned.
    Success,
    /// Key absent.
    NotFound,
    /// Payload does not match the space schema.
    WrongArity,
    /// Space name unknown under the current topology.
    NotASpace,
    /// Update names an attribute not in the schema.
    BadDimension,
    /// Cannot reach or maintain the coordinator link.
    CoordFail,
    /// Server returned an error, or the reply was undecodable or of an
    /// unexpected type.
    ServerError,
    /// Channel failure before a reply was received.
    Disconnect,
    /// Cannot open a channel to the destination instance.
    ConnectFail,
    /// Topology changed and the destination is no longer authoritative;
    /// retry against the new topology.
    Reconfigure,
    /// Programmer or environment contract violated.
    LogicError,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::NotFound => "not-found",
            Status::WrongArity => "wrong-arity",
            Status::NotASpace => "not-a-space",
            Status::BadDimension => "bad-dimension",
            Status::CoordFail => "coord-fail",
            Status::ServerError => "server-error",
            Status::Disconnect => "disconnect",
            Status::ConnectFail => "connect-fail",
            Status::Reconfigure => "reconfigure",
            Status::LogicError => "logic-error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
