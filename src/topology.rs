//! Cluster topology snapshots.
//!
//! A snapshot is the coordinator's immutable view of the cluster at a point
//! in time: which spaces exist, which region heads own which hash prefixes,
//! and which physical instance hosts each head. The client replaces its
//! snapshot wholesale whenever the coordinator pushes a new one; lookups
//! against a fixed snapshot are deterministic.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::types::{EntityId, Instance, RegionId, SpaceId};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpaceDef {
    pub id: u32,
    pub name: String,
    /// Ordered attribute names; position 0 is the key.
    pub dimensions: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegionDef {
    pub space: u32,
    pub subspace: u16,
    /// Number of leading hash bits this region pins. 0 covers every key.
    pub prefix: u8,
    pub mask: u64,
    pub head: EntityId,
}

impl RegionDef {
    fn covers(&self, point: u64) -> bool {
        if self.prefix == 0 {
            return true;
        }
        if self.prefix >= 64 {
            return self.mask == point;
        }
        let shift = 64 - u32::from(self.prefix);
        point >> shift == self.mask >> shift
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstanceDef {
    pub entity: EntityId,
    pub addr: SocketAddr,
    pub inbound_version: u16,
}

/// One coordinator-issued view of the cluster.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologySnapshot {
    pub version: u64,
    pub spaces: Vec<SpaceDef>,
    pub regions: Vec<RegionDef>,
    pub instances: Vec<InstanceDef>,
}

impl TopologySnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Resolve a space by name. `None` is the "unknown space" outcome.
    pub fn space_id(&self, name: &str) -> Option<SpaceId> {
        self.spaces
            .iter()
            .find(|s| s.name == name)
            .map(|s| SpaceId::new(s.id))
    }

    /// Ordered attribute names of a space; position 0 is the key.
    pub fn dimensions(&self, space: SpaceId) -> Option<&[String]> {
        self.spaces
            .iter()
            .find(|s| s.id == space.as_u32())
            .map(|s| s.dimensions.as_slice())
    }

    /// The entity heading the configured region that covers `region`'s
    /// point. Routing always asks with a point-leader region (prefix 64).
    pub fn head_of(&self, region: RegionId) -> Option<EntityId> {
        self.regions
            .iter()
            .find(|r| {
                r.space == region.space.as_u32()
                    && r.subspace == region.subspace
                    && r.covers(region.mask)
            })
            .map(|r| r.head)
    }

    /// The instance currently hosting `entity`; `None` means no node is
    /// responsible right now.
    pub fn instance_for(&self, entity: &EntityId) -> Option<Instance> {
        self.instances
            .iter()
            .find(|i| i.entity == *entity)
            .map(|i| Instance {
                addr: i.addr,
                inbound_version: i.inbound_version,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(space: u32, prefix: u8, mask: u64, number: u8) -> EntityId {
        EntityId {
            space,
            subspace: 0,
            prefix,
            mask,
            number,
        }
    }

    fn two_region_snapshot() -> TopologySnapshot {
        TopologySnapshot {
            version: 3,
            spaces: vec![SpaceDef {
                id: 1,
                name: "kv".to_string(),
                dimensions: vec!["key".to_string(), "value".to_string()],
            }],
            regions: vec![
                RegionDef {
                    space: 1,
                    subspace: 0,
                    prefix: 1,
                    mask: 0,
                    head: head(1, 1, 0, 0),
                },
                RegionDef {
                    space: 1,
                    subspace: 0,
                    prefix: 1,
                    mask: 1 << 63,
                    head: head(1, 1, 1 << 63, 0),
                },
            ],
            instances: vec![InstanceDef {
                entity: head(1, 1, 0, 0),
                addr: "10.0.0.5:2012".parse().unwrap(),
                inbound_version: 2,
            }],
        }
    }

    #[test]
    fn space_lookup_by_name() {
        let snap = two_region_snapshot();
        assert_eq!(snap.space_id("kv"), Some(SpaceId::new(1)));
        assert_eq!(snap.space_id("nope"), None);
        assert_eq!(
            snap.dimensions(SpaceId::new(1)).unwrap(),
            &["key".to_string(), "value".to_string()]
        );
    }

    #[test]
    fn head_of_selects_covering_prefix() {
        let snap = two_region_snapshot();
        let low = snap
            .head_of(RegionId::point_leader(SpaceId::new(1), 0x0123))
            .unwrap();
        assert_eq!(low.mask, 0);

        let high = snap
            .head_of(RegionId::point_leader(SpaceId::new(1), u64::MAX))
            .unwrap();
        assert_eq!(high.mask, 1 << 63);

        assert_eq!(
            snap.head_of(RegionId::point_leader(SpaceId::new(9), 0)),
            None
        );
    }

    #[test]
    fn instance_for_missing_entity_is_none() {
        let snap = two_region_snapshot();
        assert_eq!(
            snap.instance_for(&head(1, 1, 0, 0)).unwrap(),
            Instance {
                addr: "10.0.0.5:2012".parse().unwrap(),
                inbound_version: 2,
            }
        );
        assert_eq!(snap.instance_for(&head(1, 1, 1 << 63, 0)), None);
    }

    #[test]
    fn snapshot_roundtrips_through_json() {
        let snap = two_region_snapshot();
        let line = serde_json::to_string(&snap).unwrap();
        let back: TopologySnapshot = serde_json::from_str(&line).unwrap();
        assert_eq!(back.version, 3);
        assert_eq!(back.spaces.len(), 1);
        assert_eq!(back.regions.len(), 2);
        assert_eq!(back.instances.len(), 1);
    }
}
