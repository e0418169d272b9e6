// Copyright (c) 2025 - Cowboy AI, Inc.
//! Graph Builder
//!
//! Turns a [`Topology`] into a [`DependencyGraph`]. Entities are visited
//! kind by kind so that every reference points at a node that already
//! exists; edges are added as references resolve.
//!
//! # Edges
//!
//! ```text
//! subnet, route table, gateway, security rule ──► segment
//! security rule ──► referenced rule set
//! peering (create) ──► requester segment, accepter segment
//! peering (accept) ──► peering (create)          [managed acceptance]
//! route entry ──► route table, target             [peering target = accept node]
//! association ──► route table, subnet
//! instance ──► subnet, security rules, key pair (verify)
//! dns zone ──► segment                            [when associated]
//! ```

use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::debug;

use super::{DependencyGraph, GraphError, NodeId, NodeKey, ResourceSpec, Step, SymbolTable};
use crate::domain::kind::{EntityKey, EntityKind};
use crate::domain::network::CidrBlock;
use crate::domain::topology::{AcceptanceMode, RulePeer, RouteTarget, Topology};
use crate::state_machine::peering::PeeringState;

/// Last known handshake state per peering name, read from the snapshot
pub type KnownPeeringStates = BTreeMap<String, PeeringState>;

/// Build the dependency graph for `topology`
///
/// # Errors
/// - `DuplicateSymbol` for a (kind, name) declared twice
/// - `TypeMismatch` / `UnresolvedReference` for a bad reference field
/// - `PrematureRoute` for a route over an externally accepted peering
///   that is not known to be active
/// - `CyclicDependency` with the shortest offending cycle
pub fn build_graph(
    topology: &Topology,
    known: &KnownPeeringStates,
) -> Result<DependencyGraph, GraphError> {
    let symbols = SymbolTable::from_keys(topology.declared_keys())?;
    let builder = GraphBuilder {
        topology,
        known,
        symbols,
        graph: DependencyGraph::new(),
    };
    builder.build()
}

struct GraphBuilder<'a> {
    topology: &'a Topology,
    known: &'a KnownPeeringStates,
    symbols: SymbolTable,
    graph: DependencyGraph,
}

impl GraphBuilder<'_> {
    fn build(mut self) -> Result<DependencyGraph, GraphError> {
        self.add_segments()?;
        self.add_segment_children()?;
        let tables = self.add_route_tables()?;
        self.add_peerings()?;
        self.add_security_rules()?;
        self.add_instances()?;
        self.add_routes_and_associations(&tables)?;
        self.add_dns_zones()?;

        // Full cycle detection pass
        self.graph.topological_order()?;

        debug!(
            nodes = self.graph.len(),
            symbols = self.symbols.len(),
            "Dependency graph built"
        );
        Ok(self.graph)
    }

    /// Resolve a reference and return the node that realizes it
    fn resolve_node(
        &self,
        from: &EntityKey,
        field: &str,
        name: &str,
        kind: EntityKind,
        step: Step,
    ) -> Result<(EntityKey, NodeId), GraphError> {
        let key = self.symbols.resolve(from, field, name, kind)?;
        let id = self
            .graph
            .find(&NodeKey::new(key.clone(), step))
            .ok_or_else(|| GraphError::UnresolvedReference {
                from: from.clone(),
                field: field.to_string(),
                name: name.to_string(),
                expected: kind,
            })?;
        Ok((key, id))
    }

    fn context_of(&self, id: NodeId) -> String {
        self.graph.node(id).context.clone()
    }

    fn add_segments(&mut self) -> Result<(), GraphError> {
        for segment in &self.topology.segments {
            let from = EntityKey::new(EntityKind::Segment, &segment.name);
            let context =
                self.symbols
                    .resolve(&from, "context", &segment.context, EntityKind::AccountContext)?;
            let spec = ResourceSpec::default()
                .reference("context", context)
                .attribute("cidr", normalized(&segment.cidr))
                .attribute("tags", json!(segment.tags));
            self.graph
                .add_node(NodeKey::provision(from), &segment.context, spec)?;
        }
        Ok(())
    }

    /// Subnets and gateways hang directly off a segment
    fn add_segment_children(&mut self) -> Result<(), GraphError> {
        for subnet in &self.topology.subnets {
            let from = EntityKey::new(EntityKind::Subnet, &subnet.name);
            let (segment, segment_id) =
                self.resolve_node(&from, "segment", &subnet.segment, EntityKind::Segment, Step::Provision)?;
            let spec = ResourceSpec::default()
                .reference("segment", segment)
                .attribute("cidr", normalized(&subnet.cidr))
                .attribute("availability_zone", subnet.availability_zone.as_str())
                .attribute("tags", json!(subnet.tags));
            let id = self
                .graph
                .add_node(NodeKey::provision(from), self.context_of(segment_id), spec)?;
            self.graph.add_edge(id, segment_id);
        }

        for gateway in &self.topology.gateways {
            let from = EntityKey::new(EntityKind::InternetGateway, &gateway.name);
            let (segment, segment_id) =
                self.resolve_node(&from, "segment", &gateway.segment, EntityKind::Segment, Step::Provision)?;
            let spec = ResourceSpec::default().reference("segment", segment);
            let id = self
                .graph
                .add_node(NodeKey::provision(from), self.context_of(segment_id), spec)?;
            self.graph.add_edge(id, segment_id);
        }
        Ok(())
    }

    fn add_route_tables(&mut self) -> Result<Vec<NodeId>, GraphError> {
        let mut ids = Vec::with_capacity(self.topology.route_tables.len());
        for table in &self.topology.route_tables {
            let from = EntityKey::new(EntityKind::RouteTable, &table.name);
            let (segment, segment_id) =
                self.resolve_node(&from, "segment", &table.segment, EntityKind::Segment, Step::Provision)?;
            let spec = ResourceSpec::default().reference("segment", segment);
            let id = self
                .graph
                .add_node(NodeKey::provision(from), self.context_of(segment_id), spec)?;
            self.graph.add_edge(id, segment_id);
            ids.push(id);
        }
        Ok(ids)
    }

    /// Create node on the requester context, accept node on the accepter context
    fn add_peerings(&mut self) -> Result<(), GraphError> {
        for peering in &self.topology.peerings {
            let from = EntityKey::new(EntityKind::PeeringConnection, &peering.name);
            let (requester, requester_id) = self.resolve_node(
                &from,
                "requester",
                &peering.requester,
                EntityKind::Segment,
                Step::Provision,
            )?;
            let (accepter, accepter_id) = self.resolve_node(
                &from,
                "accepter",
                &peering.accepter,
                EntityKind::Segment,
                Step::Provision,
            )?;
            let requester_context = self.context_of(requester_id);
            let accepter_context = self.context_of(accepter_id);

            let mut spec = ResourceSpec::default()
                .reference("requester", requester)
                .reference("accepter", accepter)
                .attribute("requester_context", requester_context.as_str())
                .attribute("accepter_context", accepter_context.as_str());
            if let Some(peer) = self.topology.context(&accepter_context) {
                spec = spec
                    .attribute("peer_account", peer.account_id.as_str())
                    .attribute("peer_region", peer.region.as_str());
            }

            let create = self.graph.add_node(
                NodeKey::provision(from.clone()),
                requester_context,
                spec.clone(),
            )?;
            self.graph.add_edge(create, requester_id);
            self.graph.add_edge(create, accepter_id);

            if peering.acceptance == AcceptanceMode::Managed {
                let accept = self.graph.add_node(
                    NodeKey::new(from, Step::Accept),
                    accepter_context,
                    spec,
                )?;
                self.graph.add_edge(accept, create);
            }
        }
        Ok(())
    }

    /// Rules first, then rule-set edges once every rule has a node
    fn add_security_rules(&mut self) -> Result<(), GraphError> {
        let mut rule_set_edges = Vec::new();

        for rule in &self.topology.security_rules {
            let from = EntityKey::new(EntityKind::SecurityRule, &rule.name);
            let (segment, segment_id) =
                self.resolve_node(&from, "segment", &rule.segment, EntityKind::Segment, Step::Provision)?;

            let mut spec = ResourceSpec::default()
                .reference("segment", segment)
                .attribute("direction", json!(rule.direction))
                .attribute("protocol", json!(rule.protocol))
                .attribute("from_port", rule.from_port)
                .attribute("to_port", rule.to_port);
            match &rule.peer {
                RulePeer::Cidr(cidr) => spec = spec.attribute("peer_cidr", normalized(cidr)),
                RulePeer::RuleSet(name) => {
                    let peer = self
                        .symbols
                        .resolve(&from, "peer", name, EntityKind::SecurityRule)?;
                    spec = spec.reference("peer_rule_set", peer.clone());
                    rule_set_edges.push((from.clone(), peer));
                }
            }

            let id = self
                .graph
                .add_node(NodeKey::provision(from), self.context_of(segment_id), spec)?;
            self.graph.add_edge(id, segment_id);
        }

        for (rule, peer) in rule_set_edges {
            let (_, rule_id) =
                self.resolve_node(&rule, "name", &rule.name, EntityKind::SecurityRule, Step::Provision)?;
            let (_, peer_id) =
                self.resolve_node(&rule, "peer", &peer.name, EntityKind::SecurityRule, Step::Provision)?;
            self.graph.add_edge(rule_id, peer_id);
        }
        Ok(())
    }

    /// Instances, plus one key-pair verify node per (key pair, context)
    ///
    /// Key material is scoped to an account, so every context launching
    /// with a key pair checks it on its own.
    fn add_instances(&mut self) -> Result<(), GraphError> {
        for instance in &self.topology.instances {
            let from = EntityKey::new(EntityKind::Instance, &instance.name);
            let (subnet, subnet_id) =
                self.resolve_node(&from, "subnet", &instance.subnet, EntityKind::Subnet, Step::Provision)?;
            let context = self.context_of(subnet_id);

            let mut rules = Vec::with_capacity(instance.security_rules.len());
            for (index, name) in instance.security_rules.iter().enumerate() {
                let field = format!("security_rules[{index}]");
                rules.push(self.resolve_node(
                    &from,
                    &field,
                    name,
                    EntityKind::SecurityRule,
                    Step::Provision,
                )?);
            }

            let key_pair =
                self.symbols
                    .resolve(&from, "key_pair", &instance.key_pair, EntityKind::KeyPair)?;
            let key_pair_ref = self.topology.key_pair(&key_pair.name);
            let verify_key = NodeKey::new(
                EntityKey::key_pair_check(&key_pair.name, &context),
                Step::Verify,
            );
            let verify_id = match self.graph.find(&verify_key) {
                Some(id) => id,
                None => {
                    let mut spec = ResourceSpec::default();
                    if let Some(key_pair_ref) = key_pair_ref {
                        spec = spec
                            .attribute("key_name", key_pair_ref.key_name.as_str())
                            .attribute("region", key_pair_ref.region.as_str());
                    }
                    self.graph.add_node(verify_key, context.clone(), spec)?
                }
            };

            let mut spec = ResourceSpec::default()
                .reference("subnet", subnet)
                .reference("key_pair", key_pair)
                .attribute("instance_type", instance.instance_type.as_str())
                .attribute("tags", json!(instance.tags));
            if let Some(key_pair_ref) = key_pair_ref {
                spec = spec.attribute("key_name", key_pair_ref.key_name.as_str());
            }
            for (index, (rule, _)) in rules.iter().enumerate() {
                spec = spec.reference(&format!("security_rules[{index}]"), rule.clone());
            }

            let id = self
                .graph
                .add_node(NodeKey::provision(from), context, spec)?;
            self.graph.add_edge(id, subnet_id);
            self.graph.add_edge(id, verify_id);
            for (_, rule_id) in rules {
                self.graph.add_edge(id, rule_id);
            }
        }
        Ok(())
    }

    /// Route entries and associations are derived nodes of their table
    ///
    /// A destination repeated within one table yields a single node; the
    /// validator reports the duplicate.
    fn add_routes_and_associations(&mut self, tables: &[NodeId]) -> Result<(), GraphError> {
        for (table, &table_id) in self.topology.route_tables.iter().zip(tables) {
            let table_key = EntityKey::new(EntityKind::RouteTable, &table.name);
            let context = self.context_of(table_id);

            for (index, route) in table.routes.iter().enumerate() {
                let field = format!("routes[{index}].target");
                let destination = normalized(&route.destination);
                let entry = EntityKey::route_entry(&table.name, &destination);

                let target = self.symbols.resolve(
                    &table_key,
                    &field,
                    route.target.name(),
                    route.target.kind(),
                )?;
                let target_id = match &route.target {
                    RouteTarget::Peering(name) => self.peering_dependency(&entry, &field, name)?,
                    RouteTarget::Instance(name) | RouteTarget::Gateway(name) => {
                        self.resolve_node(&table_key, &field, name, route.target.kind(), Step::Provision)?
                            .1
                    }
                };

                let entry_key = NodeKey::provision(entry);
                if self.graph.find(&entry_key).is_some() {
                    continue;
                }
                let spec = ResourceSpec::default()
                    .reference("route_table", table_key.clone())
                    .attribute("destination", destination)
                    .attribute("target_kind", route.target.kind().as_str())
                    .reference("target", target);
                let id = self.graph.add_node(entry_key, context.clone(), spec)?;
                self.graph.add_edge(id, table_id);
                self.graph.add_edge(id, target_id);
            }

            for (index, subnet_name) in table.associations.iter().enumerate() {
                let field = format!("associations[{index}]");
                let (subnet, subnet_id) =
                    self.resolve_node(&table_key, &field, subnet_name, EntityKind::Subnet, Step::Provision)?;
                let key = NodeKey::provision(EntityKey::association(&table.name, subnet_name));
                if self.graph.find(&key).is_some() {
                    continue;
                }
                let spec = ResourceSpec::default()
                    .reference("route_table", table_key.clone())
                    .reference("subnet", subnet);
                let id = self.graph.add_node(key, context.clone(), spec)?;
                self.graph.add_edge(id, table_id);
                self.graph.add_edge(id, subnet_id);
            }
        }
        Ok(())
    }

    /// Node a route over peering `name` must wait for
    ///
    /// Managed acceptance: the accept node (the Active transition).
    /// External acceptance: the create node, but only when the connection
    /// is already known to be Active.
    fn peering_dependency(
        &self,
        route: &EntityKey,
        field: &str,
        name: &str,
    ) -> Result<NodeId, GraphError> {
        let peering = EntityKey::new(EntityKind::PeeringConnection, name);
        let acceptance = self
            .topology
            .peerings
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.acceptance);

        let step = match acceptance {
            Some(AcceptanceMode::Managed) => Step::Accept,
            Some(AcceptanceMode::External) => match self.known.get(name) {
                Some(PeeringState::Active) => Step::Provision,
                state => {
                    return Err(GraphError::PrematureRoute {
                        route: route.clone(),
                        peering: name.to_string(),
                        state: state.copied(),
                    })
                }
            },
            None => {
                return Err(GraphError::UnresolvedReference {
                    from: route.clone(),
                    field: field.to_string(),
                    name: name.to_string(),
                    expected: EntityKind::PeeringConnection,
                })
            }
        };

        self.graph
            .find(&NodeKey::new(peering, step))
            .ok_or_else(|| GraphError::UnresolvedReference {
                from: route.clone(),
                field: field.to_string(),
                name: name.to_string(),
                expected: EntityKind::PeeringConnection,
            })
    }

    fn add_dns_zones(&mut self) -> Result<(), GraphError> {
        for zone in &self.topology.dns_zones {
            let from = EntityKey::new(EntityKind::DnsZone, &zone.name);
            let context =
                self.symbols
                    .resolve(&from, "context", &zone.context, EntityKind::AccountContext)?;
            let mut spec = ResourceSpec::default()
                .reference("context", context)
                .attribute("domain", zone.domain.as_str())
                .attribute("records", json!(zone.records));

            let segment_id = match &zone.segment {
                Some(name) => {
                    let (segment, id) =
                        self.resolve_node(&from, "segment", name, EntityKind::Segment, Step::Provision)?;
                    spec = spec.reference("segment", segment);
                    Some(id)
                }
                None => {
                    spec = spec.attribute("segment", Value::Null);
                    None
                }
            };

            let id = self
                .graph
                .add_node(NodeKey::provision(from), &zone.context, spec)?;
            if let Some(segment_id) = segment_id {
                self.graph.add_edge(id, segment_id);
            }
        }
        Ok(())
    }
}

/// Canonical text of a CIDR field; malformed input is kept for the validator
fn normalized(raw: &str) -> String {
    CidrBlock::new(raw)
        .map(|cidr| cidr.to_string())
        .unwrap_or_else(|_| raw.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn two_account() -> Topology {
        serde_json::from_value(json!({
            "contexts": [
                { "name": "a", "account_id": "111111111111", "region": "us-east-1" },
                { "name": "b", "account_id": "222222222222", "region": "us-west-2" }
            ],
            "segments": [
                { "name": "vpc-a", "context": "a", "cidr": "10.0.0.0/16" },
                { "name": "vpc-b", "context": "b", "cidr": "10.1.0.0/16" }
            ],
            "peerings": [
                { "name": "pcx-a-b", "requester": "vpc-a", "accepter": "vpc-b" }
            ],
            "route_tables": [
                { "name": "rt-a", "segment": "vpc-a",
                  "routes": [ { "destination": "10.1.0.0/16", "target": { "peering": "pcx-a-b" } } ] },
                { "name": "rt-b", "segment": "vpc-b",
                  "routes": [ { "destination": "10.0.0.0/16", "target": { "peering": "pcx-a-b" } } ] }
            ]
        }))
        .unwrap()
    }

    fn node_id(graph: &DependencyGraph, entity: EntityKey, step: Step) -> NodeId {
        graph.find(&NodeKey::new(entity, step)).unwrap()
    }

    #[test]
    fn test_routes_wait_for_acceptance_on_accepter_context() {
        let graph = build_graph(&two_account(), &KnownPeeringStates::new()).unwrap();
        let pcx = EntityKey::new(EntityKind::PeeringConnection, "pcx-a-b");

        let create = node_id(&graph, pcx.clone(), Step::Provision);
        let accept = node_id(&graph, pcx, Step::Accept);
        let route = node_id(&graph, EntityKey::route_entry("rt-a", "10.1.0.0/16"), Step::Provision);

        assert_eq!(graph.node(create).context, "a");
        assert_eq!(graph.node(accept).context, "b");
        assert!(graph.dependencies(accept).contains(&create));
        assert!(graph.dependencies(route).contains(&accept));
        assert!(!graph.dependencies(route).contains(&create));
    }

    #[test]
    fn test_misspelled_peering_is_unresolved_with_field() {
        let mut topology = two_account();
        topology.route_tables[0].routes[0].target = RouteTarget::Peering("pcx-a-bb".into());

        let err = build_graph(&topology, &KnownPeeringStates::new()).unwrap_err();
        assert_eq!(
            err,
            GraphError::UnresolvedReference {
                from: EntityKey::new(EntityKind::RouteTable, "rt-a"),
                field: "routes[0].target".into(),
                name: "pcx-a-bb".into(),
                expected: EntityKind::PeeringConnection,
            }
        );
    }

    #[test]
    fn test_table_pointing_at_peering_name_is_type_mismatch() {
        let mut topology = two_account();
        topology.route_tables[0].segment = "pcx-a-b".into();

        let err = build_graph(&topology, &KnownPeeringStates::new()).unwrap_err();
        assert!(matches!(
            err,
            GraphError::TypeMismatch {
                expected: EntityKind::Segment,
                found: EntityKind::PeeringConnection,
                ..
            }
        ));
    }

    #[test]
    fn test_external_acceptance_requires_known_active_state() {
        let mut topology = two_account();
        topology.peerings[0].acceptance = AcceptanceMode::External;

        let err = build_graph(&topology, &KnownPeeringStates::new()).unwrap_err();
        assert!(matches!(err, GraphError::PrematureRoute { state: None, .. }));

        let pending = KnownPeeringStates::from([("pcx-a-b".to_string(), PeeringState::PendingAcceptance)]);
        let err = build_graph(&topology, &pending).unwrap_err();
        assert!(matches!(
            err,
            GraphError::PrematureRoute { state: Some(PeeringState::PendingAcceptance), .. }
        ));

        let active = KnownPeeringStates::from([("pcx-a-b".to_string(), PeeringState::Active)]);
        let graph = build_graph(&topology, &active).unwrap();
        let pcx = EntityKey::new(EntityKind::PeeringConnection, "pcx-a-b");
        assert!(graph.find(&NodeKey::new(pcx, Step::Accept)).is_none());
    }

    #[test]
    fn test_rule_set_cycle_is_reported() {
        let mut topology = two_account();
        topology.security_rules = serde_json::from_value(json!([
            { "name": "web", "segment": "vpc-a", "direction": "ingress", "protocol": "tcp",
              "from_port": 443, "to_port": 443, "peer": { "rule_set": "app" } },
            { "name": "app", "segment": "vpc-a", "direction": "ingress", "protocol": "tcp",
              "from_port": 8080, "to_port": 8080, "peer": { "rule_set": "web" } }
        ]))
        .unwrap();

        let err = build_graph(&topology, &KnownPeeringStates::new()).unwrap_err();
        match err {
            GraphError::CyclicDependency { cycle } => {
                let names: Vec<_> = cycle.iter().map(|k| k.entity.name.as_str()).collect();
                assert_eq!(names, vec!["app", "web"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_declaration_rejected() {
        let mut topology = two_account();
        let duplicate = topology.segments[0].clone();
        topology.segments.push(duplicate);

        let err = build_graph(&topology, &KnownPeeringStates::new()).unwrap_err();
        assert_eq!(
            err,
            GraphError::DuplicateSymbol {
                key: EntityKey::new(EntityKind::Segment, "vpc-a")
            }
        );
    }

    #[test]
    fn test_key_pair_is_verified_once_per_context() {
        let mut topology = two_account();
        let extra: Topology = serde_json::from_value(json!({
            "subnets": [
                { "name": "sub-a", "segment": "vpc-a", "cidr": "10.0.1.0/24", "availability_zone": "us-east-1a" },
                { "name": "sub-b", "segment": "vpc-b", "cidr": "10.1.1.0/24", "availability_zone": "us-west-2a" }
            ],
            "key_pairs": [ { "name": "ops", "key_name": "ops-key", "region": "us-east-1" } ],
            "instances": [
                { "name": "vm-1", "subnet": "sub-a", "key_pair": "ops", "instance_type": "t3.micro" },
                { "name": "vm-2", "subnet": "sub-a", "key_pair": "ops", "instance_type": "t3.micro" },
                { "name": "vm-3", "subnet": "sub-b", "key_pair": "ops", "instance_type": "t3.micro" }
            ]
        }))
        .unwrap();
        topology.subnets = extra.subnets;
        topology.key_pairs = extra.key_pairs;
        topology.instances = extra.instances;

        let graph = build_graph(&topology, &KnownPeeringStates::new()).unwrap();
        let in_a = node_id(&graph, EntityKey::key_pair_check("ops", "a"), Step::Verify);
        let in_b = node_id(&graph, EntityKey::key_pair_check("ops", "b"), Step::Verify);

        assert_eq!(graph.node(in_a).context, "a");
        assert_eq!(graph.node(in_a).spec.get_str("key_name"), Some("ops-key"));
        assert_eq!(graph.dependents(in_a).len(), 2);

        assert_eq!(graph.node(in_b).context, "b");
        let vm_3 = node_id(&graph, EntityKey::new(EntityKind::Instance, "vm-3"), Step::Provision);
        assert_eq!(graph.dependents(in_b).iter().copied().collect::<Vec<_>>(), vec![vm_3]);
    }
}
