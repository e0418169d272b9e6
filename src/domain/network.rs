// Copyright (c) 2025 - Cowboy AI, Inc.
//! Network Value Objects with Validation Invariants
//!
//! [`CidrBlock`] is the only address value object the provisioner needs.
//! It is always held in canonical form (host bits cleared), so equality
//! between two blocks is equality of the address ranges they describe.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use thiserror::Error;

/// Network validation error
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("CIDR block is empty")]
    EmptyCidr,

    #[error("Invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("Invalid CIDR notation: {0}")]
    InvalidCidr(String),

    #[error("Invalid prefix length: {0} (must be 0-32 for IPv4, 0-128 for IPv6)")]
    InvalidPrefixLength(u8),
}

/// CIDR block value object
///
/// Represents a contiguous IPv4 or IPv6 range as `network/prefix`.
/// Invariants:
/// - Prefix length within range for the address family
/// - Canonical representation (host bits are zero)
///
/// # Examples
///
/// ```rust
/// use cim_network_provisioner::domain::CidrBlock;
///
/// let vpc = CidrBlock::new("10.0.0.0/16").unwrap();
/// let subnet = CidrBlock::new("10.0.1.0/24").unwrap();
/// assert!(vpc.contains(&subnet));
/// assert_eq!(CidrBlock::new("10.0.7.9/16").unwrap(), vpc);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CidrBlock {
    network: IpAddr,
    prefix_length: u8,
}

impl CidrBlock {
    /// Parse a CIDR block, clearing any host bits
    ///
    /// # Invariants
    /// - Prefix is mandatory
    /// - Prefix length 0-32 for IPv4, 0-128 for IPv6
    pub fn new(cidr: impl AsRef<str>) -> Result<Self, NetworkError> {
        let cidr = cidr.as_ref().trim();
        if cidr.is_empty() {
            return Err(NetworkError::EmptyCidr);
        }

        let (addr_str, prefix_str) = cidr
            .split_once('/')
            .ok_or_else(|| NetworkError::InvalidCidr(cidr.to_string()))?;

        let address = IpAddr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidIpAddress(addr_str.to_string()))?;

        let prefix_length = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidCidr(cidr.to_string()))?;

        Self::from_parts(address, prefix_length)
    }

    /// Create from an address and prefix, normalizing to the network address
    pub fn from_parts(address: IpAddr, prefix_length: u8) -> Result<Self, NetworkError> {
        let width = family_width(&address);
        if prefix_length > width {
            return Err(NetworkError::InvalidPrefixLength(prefix_length));
        }

        let bits = mask_bits(address_bits(&address), prefix_length, width);
        let network = match address {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::from(bits as u32)),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::from(bits)),
        };

        Ok(Self {
            network,
            prefix_length,
        })
    }

    /// Network address (host bits cleared)
    pub fn network(&self) -> IpAddr {
        self.network
    }

    /// Prefix length
    pub fn prefix_length(&self) -> u8 {
        self.prefix_length
    }

    /// Check if this is an IPv4 block
    pub fn is_ipv4(&self) -> bool {
        matches!(self.network, IpAddr::V4(_))
    }

    /// Whether `other` lies entirely within this block
    ///
    /// A block contains itself. Blocks of different families never
    /// contain each other.
    pub fn contains(&self, other: &CidrBlock) -> bool {
        if self.is_ipv4() != other.is_ipv4() || other.prefix_length < self.prefix_length {
            return false;
        }
        let width = family_width(&self.network);
        mask_bits(address_bits(&other.network), self.prefix_length, width)
            == address_bits(&self.network)
    }

    /// Whether the two blocks share at least one address
    pub fn overlaps(&self, other: &CidrBlock) -> bool {
        self.contains(other) || other.contains(self)
    }
}

impl fmt::Display for CidrBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_length)
    }
}

impl FromStr for CidrBlock {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Serialize for CidrBlock {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CidrBlock {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::new(&raw).map_err(serde::de::Error::custom)
    }
}

fn family_width(address: &IpAddr) -> u8 {
    match address {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn address_bits(address: &IpAddr) -> u128 {
    match address {
        IpAddr::V4(v4) => u128::from(u32::from(*v4)),
        IpAddr::V6(v6) => u128::from(*v6),
    }
}

/// Keep the top `prefix` bits of a `width`-bit address
fn mask_bits(bits: u128, prefix: u8, width: u8) -> u128 {
    if prefix == 0 {
        return 0;
    }
    let host_bits = u32::from(width - prefix);
    let family_mask = if width == 128 {
        u128::MAX
    } else {
        (1u128 << width) - 1
    };
    let network_mask = if host_bits == 0 {
        family_mask
    } else {
        (family_mask >> host_bits) << host_bits
    };
    bits & network_mask
}
