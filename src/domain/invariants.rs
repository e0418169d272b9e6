// Copyright (c) 2025 - Cowboy AI, Inc.
//! Pure Validation Functions - Routing and CIDR Invariants
//!
//! The pre-flight gate between graph build and execution. Every function
//! here is pure: no I/O, deterministic, and it reports every violation it
//! finds rather than stopping at the first one.
//!
//! # Invariant Categories
//!
//! 1. **Address Invariants**: blocks are well formed, subnets nest inside
//!    their segment, siblings are disjoint, peered segments are disjoint
//! 2. **Routing Invariants**: destinations are well formed, unique within a
//!    table, and never shadow the implicit local route unless the target
//!    is a peering connection or an instance interface
//! 3. **Placement Invariants**: key pairs live in the launching region

use crate::domain::kind::{EntityKey, EntityKind};
use crate::domain::network::{CidrBlock, NetworkError};
use crate::domain::topology::{
    ComputeInstance, PeeringConnection, RouteTable, RulePeer, SecurityRule, Topology,
};
use std::collections::HashMap;

/// Validation result with detailed error information
pub type ValidationResult = Result<(), ValidationError>;

/// A single invariant violation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// A CIDR field did not parse
    #[error("{entity}: {field} '{value}' is not a valid CIDR block: {reason}")]
    MalformedCidr {
        entity: EntityKey,
        field: String,
        value: String,
        reason: NetworkError,
    },

    /// Subnet block escapes its parent segment
    #[error("subnet {subnet} ({subnet_cidr}) is not inside segment {segment} ({segment_cidr})")]
    SubnetOutsideSegment {
        subnet: String,
        subnet_cidr: CidrBlock,
        segment: String,
        segment_cidr: CidrBlock,
    },

    /// Two subnets of one segment share addresses
    #[error("subnets {first} and {second} of segment {segment} overlap")]
    SiblingSubnetOverlap {
        segment: String,
        first: String,
        second: String,
    },

    /// Route destination is equal to or more specific than the local block
    #[error(
        "route table {table}: destination {destination} is equal to or more specific than \
         segment CIDR {segment_cidr}; only peering or instance targets may claim local addresses"
    )]
    LocalRouteConflict {
        table: String,
        destination: CidrBlock,
        segment_cidr: CidrBlock,
        target: EntityKey,
    },

    /// Same destination appears twice in one table
    #[error("route table {table}: duplicate destination {destination}")]
    DuplicateRoute { table: String, destination: CidrBlock },

    /// Key pair is not available in the launching region
    #[error(
        "instance {instance}: key pair {key_pair} lives in {key_region}, \
         but the instance launches in {context_region}"
    )]
    KeyPairRegionMismatch {
        instance: String,
        key_pair: String,
        key_region: String,
        context_region: String,
    },

    /// Peered segments must not share addresses
    #[error("peering {peering}: requester {requester_cidr} overlaps accepter {accepter_cidr}")]
    PeeredCidrOverlap {
        peering: String,
        requester_cidr: CidrBlock,
        accepter_cidr: CidrBlock,
    },

    /// A segment cannot peer with itself
    #[error("peering {peering}: requester and accepter are the same segment")]
    SelfPeering { peering: String },

    /// Port range runs backwards
    #[error("security rule {rule}: port range {from_port}-{to_port} is inverted")]
    InvalidPortRange {
        rule: String,
        from_port: u16,
        to_port: u16,
    },
}

/// All violations found in one validation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, thiserror::Error)]
#[error("topology failed validation with {} error(s): {}", .errors.len(), summarize(.errors))]
pub struct ValidationReport {
    pub errors: Vec<ValidationError>,
}

impl ValidationReport {
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    fn extend(&mut self, errors: impl IntoIterator<Item = ValidationError>) {
        self.errors.extend(errors);
    }
}

fn summarize(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Validate the whole topology
///
/// References that do not resolve are skipped here; the graph builder has
/// already rejected them before this gate runs.
pub fn validate_topology(topology: &Topology) -> Result<(), ValidationReport> {
    let mut report = ValidationReport::default();

    report.extend(validate_segment_addressing(topology));

    let segment_cidrs: HashMap<&str, CidrBlock> = topology
        .local_routes()
        .into_iter()
        .filter_map(|route| {
            topology
                .segment(&route.segment)
                .map(|segment| (segment.name.as_str(), route.cidr))
        })
        .collect();

    for table in &topology.route_tables {
        report.extend(validate_route_table(
            table,
            segment_cidrs.get(table.segment.as_str()).copied(),
        ));
    }

    for peering in &topology.peerings {
        report.extend(validate_peering(
            peering,
            segment_cidrs.get(peering.requester.as_str()).copied(),
            segment_cidrs.get(peering.accepter.as_str()).copied(),
        ));
    }

    for rule in &topology.security_rules {
        report.extend(validate_security_rule(rule));
    }

    for instance in &topology.instances {
        if let Err(error) = validate_key_pair_region(topology, instance) {
            report.errors.push(error);
        }
    }

    if report.is_empty() {
        Ok(())
    } else {
        Err(report)
    }
}

/// Segment blocks parse; subnets nest inside their segment; siblings are disjoint
pub fn validate_segment_addressing(topology: &Topology) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    for segment in &topology.segments {
        let segment_key = EntityKey::new(EntityKind::Segment, &segment.name);
        let segment_cidr = match parse_field(&segment_key, "cidr", &segment.cidr) {
            Ok(cidr) => Some(cidr),
            Err(error) => {
                errors.push(error);
                None
            }
        };

        let mut siblings: Vec<(&str, CidrBlock)> = Vec::new();
        for subnet in topology.subnets_of(&segment.name) {
            let subnet_key = EntityKey::new(EntityKind::Subnet, &subnet.name);
            let subnet_cidr = match parse_field(&subnet_key, "cidr", &subnet.cidr) {
                Ok(cidr) => cidr,
                Err(error) => {
                    errors.push(error);
                    continue;
                }
            };

            if let Some(segment_cidr) = segment_cidr {
                if !segment_cidr.contains(&subnet_cidr) {
                    errors.push(ValidationError::SubnetOutsideSegment {
                        subnet: subnet.name.clone(),
                        subnet_cidr,
                        segment: segment.name.clone(),
                        segment_cidr,
                    });
                }
            }

            for (sibling, sibling_cidr) in &siblings {
                if sibling_cidr.overlaps(&subnet_cidr) {
                    errors.push(ValidationError::SiblingSubnetOverlap {
                        segment: segment.name.clone(),
                        first: (*sibling).to_string(),
                        second: subnet.name.clone(),
                    });
                }
            }
            siblings.push((subnet.name.as_str(), subnet_cidr));
        }
    }

    errors
}

/// Check every entry of one route table
///
/// # Rules
/// - Destination must be a well-formed, non-empty block
/// - Destination must not fall inside the segment's own block unless the
///   target may override the local route
/// - A destination appears at most once per table
pub fn validate_route_table(
    table: &RouteTable,
    segment_cidr: Option<CidrBlock>,
) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let table_key = EntityKey::new(EntityKind::RouteTable, &table.name);
    let mut seen: Vec<CidrBlock> = Vec::new();

    for (index, route) in table.routes.iter().enumerate() {
        let field = format!("routes[{index}].destination");
        let destination = match parse_field(&table_key, &field, &route.destination) {
            Ok(cidr) => cidr,
            Err(error) => {
                errors.push(error);
                continue;
            }
        };

        if let Some(local) = segment_cidr {
            if local.contains(&destination) && !route.target.may_override_local_route() {
                errors.push(ValidationError::LocalRouteConflict {
                    table: table.name.clone(),
                    destination,
                    segment_cidr: local,
                    target: EntityKey::new(route.target.kind(), route.target.name()),
                });
            }
        }

        if seen.contains(&destination) {
            errors.push(ValidationError::DuplicateRoute {
                table: table.name.clone(),
                destination,
            });
        } else {
            seen.push(destination);
        }
    }

    errors
}

/// Peered segments must be distinct and address-disjoint
pub fn validate_peering(
    peering: &PeeringConnection,
    requester_cidr: Option<CidrBlock>,
    accepter_cidr: Option<CidrBlock>,
) -> Vec<ValidationError> {
    if peering.requester == peering.accepter {
        return vec![ValidationError::SelfPeering {
            peering: peering.name.clone(),
        }];
    }

    match (requester_cidr, accepter_cidr) {
        (Some(requester_cidr), Some(accepter_cidr)) if requester_cidr.overlaps(&accepter_cidr) => {
            vec![ValidationError::PeeredCidrOverlap {
                peering: peering.name.clone(),
                requester_cidr,
                accepter_cidr,
            }]
        }
        _ => Vec::new(),
    }
}

/// Port ranges run forward; CIDR peers parse
pub fn validate_security_rule(rule: &SecurityRule) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if rule.from_port > rule.to_port {
        errors.push(ValidationError::InvalidPortRange {
            rule: rule.name.clone(),
            from_port: rule.from_port,
            to_port: rule.to_port,
        });
    }

    if let RulePeer::Cidr(cidr) = &rule.peer {
        let key = EntityKey::new(EntityKind::SecurityRule, &rule.name);
        if let Err(error) = parse_field(&key, "peer", cidr) {
            errors.push(error);
        }
    }

    errors
}

/// Key pair region must equal the region of the launching context
pub fn validate_key_pair_region(topology: &Topology, instance: &ComputeInstance) -> ValidationResult {
    let (Some(key_pair), Some(context)) = (
        topology.key_pair(&instance.key_pair),
        topology.instance_context(instance),
    ) else {
        return Ok(());
    };

    if key_pair.region != context.region {
        return Err(ValidationError::KeyPairRegionMismatch {
            instance: instance.name.clone(),
            key_pair: key_pair.name.clone(),
            key_region: key_pair.region.clone(),
            context_region: context.region.clone(),
        });
    }
    Ok(())
}

fn parse_field(entity: &EntityKey, field: &str, value: &str) -> Result<CidrBlock, ValidationError> {
    CidrBlock::new(value).map_err(|reason| ValidationError::MalformedCidr {
        entity: entity.clone(),
        field: field.to_string(),
        value: value.to_string(),
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::account::AccountContext;
    use crate::domain::topology::{
        KeyPairRef, NetworkSegment, Protocol, RouteEntry, RouteTarget, RuleDirection, Subnet,
    };
    use std::collections::BTreeMap;
    use test_case::test_case;

    fn cidr(s: &str) -> CidrBlock {
        CidrBlock::new(s).unwrap()
    }

    fn table(routes: Vec<(&str, RouteTarget)>) -> RouteTable {
        RouteTable {
            name: "rt-a".into(),
            segment: "vpc-a".into(),
            routes: routes
                .into_iter()
                .map(|(destination, target)| RouteEntry {
                    destination: destination.into(),
                    target,
                })
                .collect(),
            associations: Vec::new(),
        }
    }

    fn segment(name: &str, cidr: &str) -> NetworkSegment {
        NetworkSegment {
            name: name.into(),
            context: "a".into(),
            cidr: cidr.into(),
            tags: BTreeMap::new(),
        }
    }

    fn subnet(name: &str, segment: &str, cidr: &str) -> Subnet {
        Subnet {
            name: name.into(),
            segment: segment.into(),
            cidr: cidr.into(),
            availability_zone: "us-east-1a".into(),
            tags: BTreeMap::new(),
        }
    }

    #[test_case("10.1.0.0/16", RouteTarget::Gateway("igw".into()), true ; "gateway equal to local block")]
    #[test_case("10.1.4.0/24", RouteTarget::Gateway("igw".into()), true ; "gateway inside local block")]
    #[test_case("10.1.0.0/16", RouteTarget::Peering("pcx".into()), false ; "peering may claim local block")]
    #[test_case("10.1.9.9/32", RouteTarget::Instance("nat".into()), false ; "instance interface may claim local block")]
    #[test_case("0.0.0.0/0", RouteTarget::Gateway("igw".into()), false ; "default route is wider than local")]
    #[test_case("10.2.0.0/16", RouteTarget::Gateway("igw".into()), false ; "foreign block")]
    fn test_local_route_rule(destination: &str, target: RouteTarget, rejected: bool) {
        let errors = validate_route_table(&table(vec![(destination, target)]), Some(cidr("10.1.0.0/16")));
        assert_eq!(
            errors
                .iter()
                .any(|e| matches!(e, ValidationError::LocalRouteConflict { .. })),
            rejected,
            "{errors:?}"
        );
    }

    #[test]
    fn test_malformed_and_empty_destinations() {
        let errors = validate_route_table(
            &table(vec![
                ("", RouteTarget::Gateway("igw".into())),
                ("vpc-0abc", RouteTarget::Gateway("igw".into())),
            ]),
            Some(cidr("10.1.0.0/16")),
        );
        assert_eq!(errors.len(), 2);
        assert!(matches!(
            &errors[0],
            ValidationError::MalformedCidr { reason: NetworkError::EmptyCidr, field, .. }
                if field == "routes[0].destination"
        ));
        assert!(matches!(&errors[1], ValidationError::MalformedCidr { .. }));
    }

    #[test]
    fn test_duplicate_destination_after_normalization() {
        let errors = validate_route_table(
            &table(vec![
                ("10.9.0.0/16", RouteTarget::Peering("pcx".into())),
                ("10.9.3.3/16", RouteTarget::Gateway("igw".into())),
            ]),
            Some(cidr("10.1.0.0/16")),
        );
        assert_eq!(
            errors,
            vec![ValidationError::DuplicateRoute {
                table: "rt-a".into(),
                destination: cidr("10.9.0.0/16"),
            }]
        );
    }

    #[test]
    fn test_subnet_nesting_and_sibling_overlap() {
        let topology = Topology {
            segments: vec![segment("vpc-a", "10.0.0.0/16")],
            subnets: vec![
                subnet("s1", "vpc-a", "10.0.1.0/24"),
                subnet("s2", "vpc-a", "10.0.1.128/25"),
                subnet("s3", "vpc-a", "10.5.0.0/24"),
            ],
            ..Topology::default()
        };

        let errors = validate_segment_addressing(&topology);
        assert_eq!(errors.len(), 2);
        assert!(errors.contains(&ValidationError::SiblingSubnetOverlap {
            segment: "vpc-a".into(),
            first: "s1".into(),
            second: "s2".into(),
        }));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::SubnetOutsideSegment { subnet, .. } if subnet == "s3")));
    }

    #[test]
    fn test_peering_rules() {
        let peering = PeeringConnection {
            name: "pcx".into(),
            requester: "vpc-a".into(),
            accepter: "vpc-b".into(),
            acceptance: Default::default(),
        };
        assert!(validate_peering(&peering, Some(cidr("10.0.0.0/16")), Some(cidr("10.1.0.0/16"))).is_empty());
        assert!(matches!(
            validate_peering(&peering, Some(cidr("10.0.0.0/8")), Some(cidr("10.1.0.0/16")))[..],
            [ValidationError::PeeredCidrOverlap { .. }]
        ));

        let selfish = PeeringConnection {
            accepter: "vpc-a".into(),
            ..peering
        };
        assert!(matches!(
            validate_peering(&selfish, None, None)[..],
            [ValidationError::SelfPeering { .. }]
        ));
    }

    #[test]
    fn test_security_rule_checks() {
        let rule = SecurityRule {
            name: "ssh".into(),
            segment: "vpc-a".into(),
            direction: RuleDirection::Ingress,
            protocol: Protocol::Tcp,
            from_port: 23,
            to_port: 22,
            peer: RulePeer::Cidr("10.1.0.0/160".into()),
        };
        let errors = validate_security_rule(&rule);
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_key_pair_region_mismatch() {
        let topology = Topology {
            contexts: vec![AccountContext::new("a", "111111111111", "us-east-1")],
            segments: vec![segment("vpc-a", "10.0.0.0/16")],
            subnets: vec![subnet("s1", "vpc-a", "10.0.1.0/24")],
            key_pairs: vec![KeyPairRef {
                name: "deploy".into(),
                key_name: "deploy".into(),
                region: "us-west-2".into(),
            }],
            instances: vec![ComputeInstance {
                name: "bastion".into(),
                subnet: "s1".into(),
                security_rules: Vec::new(),
                key_pair: "deploy".into(),
                instance_type: "t3.micro".into(),
                tags: BTreeMap::new(),
            }],
            ..Topology::default()
        };

        let report = validate_topology(&topology).unwrap_err();
        assert_eq!(
            report.errors,
            vec![ValidationError::KeyPairRegionMismatch {
                instance: "bastion".into(),
                key_pair: "deploy".into(),
                key_region: "us-west-2".into(),
                context_region: "us-east-1".into(),
            }]
        );
        assert!(report.to_string().contains("1 error(s)"));
    }
}
