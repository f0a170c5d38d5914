#![forbid(unsafe_code)]

//! Client for the Lattice sharded key-value store.
//!
//! The entry point is [`Client`]: it discovers the cluster topology through
//! a coordinator link, routes each operation to the storage node responsible
//! for its key, and multiplexes many in-flight operations over one TCP
//! channel per node. Operations are submitted with a continuation and
//! driven to completion by [`Client::flush`].

pub mod channel;
pub mod client;
pub mod config;
pub mod coord;
mod error;
pub mod frame;
pub mod hash;
pub mod pending;
pub mod topology;
pub mod types;
pub mod wire;

pub use client::Client;
pub use config::ClientConfig;
pub use coord::{CoordLink, LinkError, TcpCoordLink};
pub use error::ClientError;
pub use topology::TopologySnapshot;
pub use types::{EntityId, Instance, RegionId, SpaceId, Status};

pub type Result<T> = std::result::Result<T, ClientError>;
