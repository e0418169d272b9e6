// Copyright (c) 2025 - Cowboy AI, Inc.
//! Topology Model
//!
//! The parsed, declarative entity set the provisioner realizes. Entities
//! are plain data: references to other entities are logical names, and
//! resolution against the expected kind happens in the graph builder.
//! CIDR fields stay as supplied text so that malformed blocks surface as
//! validation errors instead of load failures.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::account::AccountContext;
use super::kind::{EntityKey, EntityKind};
use super::network::CidrBlock;

/// Isolated virtual network owned by one account context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSegment {
    pub name: String,
    /// Owning account context
    pub context: String,
    pub cidr: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Sub-range of a segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub name: String,
    pub segment: String,
    pub cidr: String,
    pub availability_zone: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Forwarding target of a route entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteTarget {
    /// Cross-account peering connection
    Peering(String),
    /// Network interface of a compute instance
    Instance(String),
    /// Internet gateway of the segment
    Gateway(String),
}

impl RouteTarget {
    /// Kind the target name must resolve to
    pub fn kind(&self) -> EntityKind {
        match self {
            RouteTarget::Peering(_) => EntityKind::PeeringConnection,
            RouteTarget::Instance(_) => EntityKind::Instance,
            RouteTarget::Gateway(_) => EntityKind::InternetGateway,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            RouteTarget::Peering(name) | RouteTarget::Instance(name) | RouteTarget::Gateway(name) => {
                name
            }
        }
    }

    /// Targets allowed to claim addresses inside the segment's own block
    pub fn may_override_local_route(&self) -> bool {
        matches!(self, RouteTarget::Peering(_) | RouteTarget::Instance(_))
    }
}

/// One destination → target entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub destination: String,
    pub target: RouteTarget,
}

/// Ordered routing entries for one segment, plus subnet associations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTable {
    pub name: String,
    pub segment: String,
    #[serde(default)]
    pub routes: Vec<RouteEntry>,
    /// Subnets bound to this table
    #[serde(default)]
    pub associations: Vec<String>,
}

/// Egress gateway attached to a segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternetGateway {
    pub name: String,
    pub segment: String,
}

/// Who drives the accept side of a peering connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptanceMode {
    /// The provisioner accepts on the accepter's context
    #[default]
    Managed,
    /// Acceptance happens out of band; routes wait for an observed Active state
    External,
}

/// Cross-account/region link between two segments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeeringConnection {
    pub name: String,
    /// Segment on the requesting side
    pub requester: String,
    /// Segment on the accepting side
    pub accepter: String,
    #[serde(default)]
    pub acceptance: AcceptanceMode,
}

/// Traffic direction of a security rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleDirection {
    Ingress,
    Egress,
}

/// IP protocol of a security rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    All,
}

/// Source (ingress) or destination (egress) of a security rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RulePeer {
    Cidr(String),
    /// Another rule set, by name
    RuleSet(String),
}

/// Ingress/egress policy attached to a segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityRule {
    pub name: String,
    pub segment: String,
    pub direction: RuleDirection,
    pub protocol: Protocol,
    pub from_port: u16,
    pub to_port: u16,
    pub peer: RulePeer,
}

/// Named key material expected to exist in one region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPairRef {
    pub name: String,
    /// Provider-side key name
    pub key_name: String,
    pub region: String,
}

/// Provisioned virtual machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeInstance {
    pub name: String,
    pub subnet: String,
    #[serde(default)]
    pub security_rules: Vec<String>,
    pub key_pair: String,
    pub instance_type: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// One record of a DNS zone
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ZoneRecord {
    pub name: String,
    pub record_type: String,
    pub value: String,
}

impl ZoneRecord {
    pub fn new(
        name: impl Into<String>,
        record_type: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            record_type: record_type.into(),
            value: value.into(),
        }
    }

    /// Whether the provider manages this record for the zone `domain`
    ///
    /// SOA and NS records at the zone apex are created with the zone and
    /// cannot be removed independently of it.
    pub fn is_system_managed(&self, domain: &str) -> bool {
        let apex = self.name.trim_end_matches('.') == domain.trim_end_matches('.')
            || self.name == "@";
        apex && matches!(self.record_type.as_str(), "SOA" | "NS")
    }
}

/// DNS zone owned by one account context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsZone {
    pub name: String,
    pub context: String,
    pub domain: String,
    /// Private zones are associated with a segment
    #[serde(default)]
    pub segment: Option<String>,
    #[serde(default)]
    pub records: Vec<ZoneRecord>,
}

/// Implicit in-segment route contributed by every segment
///
/// Traffic for the segment's own block always stays local, so the fact is
/// produced explicitly instead of being special-cased by its consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalRoute {
    pub segment: String,
    pub cidr: CidrBlock,
}

/// The complete desired entity set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub contexts: Vec<AccountContext>,
    #[serde(default)]
    pub segments: Vec<NetworkSegment>,
    #[serde(default)]
    pub subnets: Vec<Subnet>,
    #[serde(default)]
    pub route_tables: Vec<RouteTable>,
    #[serde(default)]
    pub gateways: Vec<InternetGateway>,
    #[serde(default)]
    pub peerings: Vec<PeeringConnection>,
    #[serde(default)]
    pub security_rules: Vec<SecurityRule>,
    #[serde(default)]
    pub key_pairs: Vec<KeyPairRef>,
    #[serde(default)]
    pub instances: Vec<ComputeInstance>,
    #[serde(default)]
    pub dns_zones: Vec<DnsZone>,
}

impl Topology {
    pub fn context(&self, name: &str) -> Option<&AccountContext> {
        self.contexts.iter().find(|c| c.name == name)
    }

    pub fn segment(&self, name: &str) -> Option<&NetworkSegment> {
        self.segments.iter().find(|s| s.name == name)
    }

    pub fn subnet(&self, name: &str) -> Option<&Subnet> {
        self.subnets.iter().find(|s| s.name == name)
    }

    pub fn key_pair(&self, name: &str) -> Option<&KeyPairRef> {
        self.key_pairs.iter().find(|k| k.name == name)
    }

    pub fn subnets_of<'a>(&'a self, segment: &'a str) -> impl Iterator<Item = &'a Subnet> + 'a {
        self.subnets.iter().filter(move |s| s.segment == segment)
    }

    /// Account context a segment belongs to
    pub fn segment_context(&self, segment: &str) -> Option<&AccountContext> {
        self.segment(segment).and_then(|s| self.context(&s.context))
    }

    /// Account context an instance is launched in (through subnet → segment)
    pub fn instance_context(&self, instance: &ComputeInstance) -> Option<&AccountContext> {
        self.subnet(&instance.subnet)
            .and_then(|subnet| self.segment_context(&subnet.segment))
    }

    /// Local route facts, one per segment with a well-formed block
    pub fn local_routes(&self) -> Vec<LocalRoute> {
        self.segments
            .iter()
            .filter_map(|segment| {
                CidrBlock::new(&segment.cidr).ok().map(|cidr| LocalRoute {
                    segment: segment.name.clone(),
                    cidr,
                })
            })
            .collect()
    }

    /// Every declared (kind, name) pair, in declaration order
    ///
    /// Derived entities (route entries, associations) are not declared
    /// and cannot be referenced by name.
    pub fn declared_keys(&self) -> Vec<EntityKey> {
        let mut keys = Vec::new();
        let mut push = |kind: EntityKind, name: &str| keys.push(EntityKey::new(kind, name));
        self.contexts.iter().for_each(|e| push(EntityKind::AccountContext, &e.name));
        self.segments.iter().for_each(|e| push(EntityKind::Segment, &e.name));
        self.subnets.iter().for_each(|e| push(EntityKind::Subnet, &e.name));
        self.route_tables.iter().for_each(|e| push(EntityKind::RouteTable, &e.name));
        self.gateways.iter().for_each(|e| push(EntityKind::InternetGateway, &e.name));
        self.peerings.iter().for_each(|e| push(EntityKind::PeeringConnection, &e.name));
        self.security_rules.iter().for_each(|e| push(EntityKind::SecurityRule, &e.name));
        self.key_pairs.iter().for_each(|e| push(EntityKind::KeyPair, &e.name));
        self.instances.iter().for_each(|e| push(EntityKind::Instance, &e.name));
        self.dns_zones.iter().for_each(|e| push(EntityKind::DnsZone, &e.name));
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_route_target_serde_shape() {
        let entry: RouteEntry = serde_json::from_value(json!({
            "destination": "10.1.0.0/16",
            "target": { "peering": "pcx-a-b" }
        }))
        .unwrap();
        assert_eq!(entry.target, RouteTarget::Peering("pcx-a-b".into()));
        assert_eq!(entry.target.kind(), EntityKind::PeeringConnection);
        assert!(entry.target.may_override_local_route());
        assert!(!RouteTarget::Gateway("igw".into()).may_override_local_route());
    }

    #[test]
    fn test_acceptance_defaults_to_managed() {
        let peering: PeeringConnection = serde_json::from_value(json!({
            "name": "pcx", "requester": "a", "accepter": "b"
        }))
        .unwrap();
        assert_eq!(peering.acceptance, AcceptanceMode::Managed);
    }

    #[test]
    fn test_system_managed_records() {
        assert!(ZoneRecord::new("corp.internal.", "SOA", "ns1").is_system_managed("corp.internal"));
        assert!(ZoneRecord::new("@", "NS", "ns1").is_system_managed("corp.internal"));
        assert!(!ZoneRecord::new("db.corp.internal", "NS", "ns1").is_system_managed("corp.internal"));
        assert!(!ZoneRecord::new("corp.internal", "A", "10.0.0.5").is_system_managed("corp.internal"));
    }

    #[test]
    fn test_local_routes_skip_malformed_segments() {
        let topology = Topology {
            segments: vec![
                NetworkSegment {
                    name: "good".into(),
                    context: "a".into(),
                    cidr: "10.0.0.0/16".into(),
                    tags: BTreeMap::new(),
                },
                NetworkSegment {
                    name: "bad".into(),
                    context: "a".into(),
                    cidr: "10.0.0.0/99".into(),
                    tags: BTreeMap::new(),
                },
            ],
            ..Topology::default()
        };
        let routes = topology.local_routes();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].segment, "good");
    }
}
