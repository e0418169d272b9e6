// Copyright (c) 2025 - Cowboy AI, Inc.
//! Typed Symbol Table
//!
//! All reference resolution goes through a lookup keyed by (kind, name).
//! A name that exists only under a different kind is a type error, never a
//! silent coercion.

use std::collections::BTreeMap;

use super::GraphError;
use crate::domain::kind::{EntityKey, EntityKind};

/// (kind, name) → declaration index, plus a name → kinds index for diagnostics
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: BTreeMap<EntityKey, usize>,
    by_name: BTreeMap<String, Vec<EntityKind>>,
}

impl SymbolTable {
    /// Build from declared keys, rejecting duplicate (kind, name) pairs
    pub fn from_keys(keys: impl IntoIterator<Item = EntityKey>) -> Result<Self, GraphError> {
        let mut table = Self::default();
        for (index, key) in keys.into_iter().enumerate() {
            if table.symbols.contains_key(&key) {
                return Err(GraphError::DuplicateSymbol { key });
            }
            table
                .by_name
                .entry(key.name.clone())
                .or_default()
                .push(key.kind);
            table.symbols.insert(key, index);
        }
        Ok(table)
    }

    /// Resolve `name`, referenced by `from.field`, as an entity of kind `expected`
    pub fn resolve(
        &self,
        from: &EntityKey,
        field: &str,
        name: &str,
        expected: EntityKind,
    ) -> Result<EntityKey, GraphError> {
        let key = EntityKey::new(expected, name);
        if self.symbols.contains_key(&key) {
            return Ok(key);
        }

        match self.by_name.get(name).and_then(|kinds| kinds.first()) {
            Some(found) => Err(GraphError::TypeMismatch {
                from: from.clone(),
                field: field.to_string(),
                name: name.to_string(),
                expected,
                found: *found,
            }),
            None => Err(GraphError::UnresolvedReference {
                from: from.clone(),
                field: field.to_string(),
                name: name.to_string(),
                expected,
            }),
        }
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.symbols.contains_key(key)
    }

    /// Kinds declared under `name`, in declaration order
    pub fn kinds_named(&self, name: &str) -> &[EntityKind] {
        self.by_name.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> SymbolTable {
        SymbolTable::from_keys([
            EntityKey::new(EntityKind::Segment, "vpc-a"),
            EntityKey::new(EntityKind::RouteTable, "rt-a"),
            EntityKey::new(EntityKind::PeeringConnection, "pcx-a-b"),
        ])
        .unwrap()
    }

    #[test]
    fn test_resolves_expected_kind() {
        let from = EntityKey::new(EntityKind::Subnet, "sub-a");
        let key = table()
            .resolve(&from, "segment", "vpc-a", EntityKind::Segment)
            .unwrap();
        assert_eq!(key, EntityKey::new(EntityKind::Segment, "vpc-a"));
    }

    #[test]
    fn test_wrong_kind_is_type_mismatch() {
        let from = EntityKey::new(EntityKind::RouteTable, "rt-b");
        let err = table()
            .resolve(&from, "routes[0].target", "vpc-a", EntityKind::PeeringConnection)
            .unwrap_err();
        assert_eq!(
            err,
            GraphError::TypeMismatch {
                from,
                field: "routes[0].target".into(),
                name: "vpc-a".into(),
                expected: EntityKind::PeeringConnection,
                found: EntityKind::Segment,
            }
        );
    }

    #[test]
    fn test_missing_name_is_unresolved() {
        let from = EntityKey::new(EntityKind::RouteTable, "rt-a");
        let err = table()
            .resolve(&from, "routes[0].target", "pcx-a-bb", EntityKind::PeeringConnection)
            .unwrap_err();
        assert!(matches!(
            err,
            GraphError::UnresolvedReference { ref field, ref name, .. }
                if field == "routes[0].target" && name == "pcx-a-bb"
        ));
    }

    #[test]
    fn test_duplicate_symbol_rejected() {
        let err = SymbolTable::from_keys([
            EntityKey::new(EntityKind::Subnet, "sub-a"),
            EntityKey::new(EntityKind::Subnet, "sub-a"),
        ])
        .unwrap_err();
        assert!(matches!(err, GraphError::DuplicateSymbol { .. }));
    }

    #[test]
    fn test_same_name_under_different_kinds_is_allowed() {
        let table = SymbolTable::from_keys([
            EntityKey::new(EntityKind::AccountContext, "a"),
            EntityKey::new(EntityKind::Segment, "a"),
        ])
        .unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.kinds_named("a"),
            &[EntityKind::AccountContext, EntityKind::Segment]
        );
    }
}
