// Copyright (c) 2025 - Cowboy AI, Inc.
//! Network Provisioning Domain Models
//!
//! The declarative side of the provisioner: what a topology is made of and
//! which invariants it must satisfy before anything is sent to a provider.
//!
//! # Value Objects with Invariants
//!
//! - [`CidrBlock`] - canonical IPv4/IPv6 address block
//! - [`EntityKey`] - (kind, name) identity of every entity
//!
//! # Entities
//!
//! - [`AccountContext`] - authenticated account + region pair
//! - [`Topology`] - segments, subnets, route tables, gateways, peerings,
//!   security rules, key pairs, instances and DNS zones
//!
//! # Validation
//!
//! [`invariants::validate_topology`] is the pre-flight gate; it collects
//! every violation into a [`ValidationReport`].

pub mod account;
pub mod invariants;
pub mod kind;
pub mod network;
pub mod topology;

pub use account::AccountContext;
pub use invariants::{validate_topology, ValidationError, ValidationReport, ValidationResult};
pub use kind::{EntityKey, EntityKind};
pub use network::{CidrBlock, NetworkError};
pub use topology::{
    AcceptanceMode, ComputeInstance, DnsZone, InternetGateway, KeyPairRef, NetworkSegment,
    PeeringConnection, Protocol, RouteEntry, RouteTable, RouteTarget, RuleDirection, RulePeer,
    SecurityRule, Subnet, Topology, ZoneRecord,
};
