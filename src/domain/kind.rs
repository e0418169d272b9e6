// Copyright (c) 2025 - Cowboy AI, Inc.
//! Entity Kind Taxonomy
//!
//! Every provisionable (or verifiable) thing in a topology has a kind.
//! References between entities are always resolved against an expected
//! kind, so the kind is part of every key.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The bounded set of entity kinds the provisioner understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Authenticated account + region pair
    AccountContext,
    /// Isolated virtual network ("VPC")
    Segment,
    /// Sub-range of a segment
    Subnet,
    /// Routing entries for a segment
    RouteTable,
    /// One destination → target entry of a route table
    RouteEntry,
    /// Binding of a subnet to a route table
    RouteTableAssociation,
    /// Egress gateway attached to a segment
    InternetGateway,
    /// Cross-account/region link between two segments
    PeeringConnection,
    /// Ingress/egress policy attached to a segment
    SecurityRule,
    /// Pre-existing key material in one region
    KeyPair,
    /// Provisioned virtual machine
    Instance,
    /// DNS zone
    DnsZone,
}

impl EntityKind {
    /// All kinds, in declaration order
    pub const ALL: [EntityKind; 12] = [
        EntityKind::AccountContext,
        EntityKind::Segment,
        EntityKind::Subnet,
        EntityKind::RouteTable,
        EntityKind::RouteEntry,
        EntityKind::RouteTableAssociation,
        EntityKind::InternetGateway,
        EntityKind::PeeringConnection,
        EntityKind::SecurityRule,
        EntityKind::KeyPair,
        EntityKind::Instance,
        EntityKind::DnsZone,
    ];

    /// Stable snake_case name used in keys and snapshots
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::AccountContext => "account_context",
            EntityKind::Segment => "segment",
            EntityKind::Subnet => "subnet",
            EntityKind::RouteTable => "route_table",
            EntityKind::RouteEntry => "route_entry",
            EntityKind::RouteTableAssociation => "route_table_association",
            EntityKind::InternetGateway => "internet_gateway",
            EntityKind::PeeringConnection => "peering_connection",
            EntityKind::SecurityRule => "security_rule",
            EntityKind::KeyPair => "key_pair",
            EntityKind::Instance => "instance",
            EntityKind::DnsZone => "dns_zone",
        }
    }

    /// Whether the provisioner creates remote objects of this kind
    ///
    /// Account contexts are loaded, key pairs are only verified.
    pub fn is_provisioned(&self) -> bool {
        !matches!(self, EntityKind::AccountContext | EntityKind::KeyPair)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown entity kind: {s}"))
    }
}

/// (kind, logical name) identity of an entity
///
/// Rendered as `kind/name`, which is also the snapshot key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub name: String,
}

impl EntityKey {
    pub fn new(kind: EntityKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    /// Key of the derived entry node for one route in a table
    pub fn route_entry(table: &str, destination: &str) -> Self {
        Self::new(EntityKind::RouteEntry, format!("{table}:{destination}"))
    }

    /// Key of the check that key pair `key_pair` exists in `context`
    pub fn key_pair_check(key_pair: &str, context: &str) -> Self {
        Self::new(EntityKind::KeyPair, format!("{key_pair}@{context}"))
    }

    /// Key of the derived association node binding a subnet to a table
    pub fn association(table: &str, subnet: &str) -> Self {
        Self::new(EntityKind::RouteTableAssociation, format!("{table}:{subnet}"))
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

impl FromStr for EntityKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, name) = s
            .split_once('/')
            .ok_or_else(|| format!("entity key must be kind/name: {s}"))?;
        if name.is_empty() {
            return Err(format!("entity key has an empty name: {s}"));
        }
        Ok(Self::new(kind.parse()?, name))
    }
}
