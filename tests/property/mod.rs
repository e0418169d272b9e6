// Copyright (c) 2025 - Cowboy AI, Inc.
//! Property-Based Tests Module
//!
//! This module contains property-based tests using proptest to verify the
//! address and routing invariants the pre-flight validator enforces.

mod cidr_properties;
