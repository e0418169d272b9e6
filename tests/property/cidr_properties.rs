// Copyright (c) 2025 - Cowboy AI, Inc.
//! Property-Based Tests for CIDR and Routing Invariants
//!
//! Subnets carved out of a segment must nest inside it and stay disjoint
//! from their siblings; a route can only claim in-segment addresses when it
//! points at a peering connection or an instance.

use cim_network_provisioner::domain::invariants::{
    validate_route_table, validate_segment_addressing, ValidationError,
};
use cim_network_provisioner::domain::{
    CidrBlock, NetworkSegment, RouteEntry, RouteTable, RouteTarget, Subnet, Topology,
};
use proptest::prelude::*;
use std::net::Ipv4Addr;

// ============================================================================
// Generators
// ============================================================================

/// A /16 segment under 10.0.0.0/8
fn segment_octet() -> impl Strategy<Value = u8> {
    any::<u8>()
}

fn segment_cidr(second: u8) -> String {
    format!("10.{second}.0.0/16")
}

/// Aligned block of `prefix` bits at position `index` inside 10.`second`.0.0/16
fn block(second: u8, prefix: u8, index: u32) -> String {
    let size = 1u32 << (32 - prefix);
    let count = 1u32 << (prefix - 16);
    let base = u32::from(Ipv4Addr::new(10, second, 0, 0));
    let address = Ipv4Addr::from(base + (index % count) * size);
    format!("{address}/{prefix}")
}

fn plan(second: u8, subnets: Vec<String>) -> Topology {
    Topology {
        segments: vec![NetworkSegment {
            name: "vpc".to_string(),
            context: "a".to_string(),
            cidr: segment_cidr(second),
            tags: Default::default(),
        }],
        subnets: subnets
            .into_iter()
            .enumerate()
            .map(|(index, cidr)| Subnet {
                name: format!("sub-{index}"),
                segment: "vpc".to_string(),
                cidr,
                availability_zone: "us-east-1a".to_string(),
                tags: Default::default(),
            })
            .collect(),
        ..Topology::default()
    }
}

fn table(destination: String, target: RouteTarget) -> RouteTable {
    RouteTable {
        name: "rt".to_string(),
        segment: "vpc".to_string(),
        routes: vec![RouteEntry { destination, target }],
        associations: Vec::new(),
    }
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    /// Distinct aligned blocks of one prefix length always validate
    #[test]
    fn prop_aligned_subnets_nest_and_stay_disjoint(
        second in segment_octet(),
        prefix in 17u8..=28,
        first in any::<u32>(),
        step in 1u32..64,
    ) {
        let count = 1u32 << (prefix - 16);
        prop_assume!(count > 1);
        let a = first % count;
        let b = (a + step % (count - 1) + 1) % count;
        prop_assume!(a != b);

        let topology = plan(second, vec![block(second, prefix, a), block(second, prefix, b)]);
        prop_assert!(validate_segment_addressing(&topology).is_empty());
    }

    /// A block and any block nested inside it are reported as overlapping siblings
    #[test]
    fn prop_nested_siblings_are_rejected(
        second in segment_octet(),
        outer_prefix in 17u8..=24,
        extra in 1u8..=4,
        index in any::<u32>(),
    ) {
        let outer = block(second, outer_prefix, index);
        let outer_block = CidrBlock::new(&outer).unwrap();
        let inner = CidrBlock::from_parts(outer_block.network(), outer_prefix + extra).unwrap();

        let topology = plan(second, vec![outer, inner.to_string()]);
        let errors = validate_segment_addressing(&topology);
        prop_assert_eq!(errors.len(), 1);
        let is_overlap = matches!(errors[0], ValidationError::SiblingSubnetOverlap { .. });
        prop_assert!(is_overlap);
    }

    /// Blocks outside the segment never validate
    #[test]
    fn prop_foreign_subnet_is_outside_segment(
        second in segment_octet(),
        other in segment_octet(),
        prefix in 17u8..=28,
        index in any::<u32>(),
    ) {
        prop_assume!(second != other);
        let mut topology = plan(second, Vec::new());
        topology.subnets = plan(other, vec![block(other, prefix, index)]).subnets;

        let errors = validate_segment_addressing(&topology);
        let outside = errors
            .iter()
            .any(|e| matches!(e, ValidationError::SubnetOutsideSegment { .. }));
        prop_assert!(outside);
    }

    /// In-segment destinations need a peering or instance target
    #[test]
    fn prop_local_route_only_overridable_by_peering_or_instance(
        second in segment_octet(),
        prefix in 16u8..=32,
        index in any::<u32>(),
    ) {
        let destination = if prefix == 16 { segment_cidr(second) } else { block(second, prefix, index) };
        let local = CidrBlock::new(segment_cidr(second)).ok();

        let gateway = validate_route_table(&table(destination.clone(), RouteTarget::Gateway("igw".into())), local);
        let conflict = matches!(gateway.as_slice(), [ValidationError::LocalRouteConflict { .. }]);
        prop_assert!(conflict);

        for target in [RouteTarget::Peering("pcx".into()), RouteTarget::Instance("nva".into())] {
            prop_assert!(validate_route_table(&table(destination.clone(), target), local).is_empty());
        }
    }

    /// Host bits never change which addresses a block describes
    #[test]
    fn prop_canonical_form_ignores_host_bits(address in any::<u32>(), prefix in 0u8..=32) {
        let raw = CidrBlock::new(format!("{}/{prefix}", Ipv4Addr::from(address))).unwrap();
        let canonical = CidrBlock::new(raw.to_string()).unwrap();
        prop_assert_eq!(raw, canonical);
        prop_assert!(raw.contains(&canonical) && canonical.contains(&raw));
    }

    /// Overlap is symmetric and implied by containment
    #[test]
    fn prop_overlap_is_symmetric(
        a in any::<u32>(), a_prefix in 0u8..=32,
        b in any::<u32>(), b_prefix in 0u8..=32,
    ) {
        let x = CidrBlock::new(format!("{}/{a_prefix}", Ipv4Addr::from(a))).unwrap();
        let y = CidrBlock::new(format!("{}/{b_prefix}", Ipv4Addr::from(b))).unwrap();
        prop_assert_eq!(x.overlaps(&y), y.overlaps(&x));
        if x.contains(&y) {
            prop_assert!(x.overlaps(&y));
        }
    }
}
