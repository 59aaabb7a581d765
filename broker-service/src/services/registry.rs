//! Capability registry - versioned, atomically-replaced capability graphs.
//!
//! Readers take an `Arc` snapshot and never observe a half-written graph;
//! the reconciler builds a complete replacement and swaps it in one map
//! insert. Versions are monotonic per application.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

use crate::models::{
    CapabilityGraph, Endpoint, FieldMetadata, Grant, GrantScope, Role,
};

#[derive(Default)]
pub struct CapabilityRegistry {
    graphs: DashMap<String, Arc<CapabilityGraph>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Coherent snapshot of the current graph, if one has been discovered.
    pub fn snapshot(&self, client_id: &str) -> Option<Arc<CapabilityGraph>> {
        self.graphs.get(client_id).map(|entry| entry.value().clone())
    }

    pub fn version(&self, client_id: &str) -> Option<u64> {
        self.graphs.get(client_id).map(|entry| entry.version)
    }

    /// Replace the graph wholesale, bumping the version. Returns the new
    /// version number.
    pub fn replace(
        &self,
        client_id: &str,
        endpoints: Vec<Endpoint>,
        fields: HashMap<String, Vec<FieldMetadata>>,
        last_updated: DateTime<Utc>,
    ) -> u64 {
        let next_version = self.version(client_id).unwrap_or(0) + 1;
        let graph = Arc::new(CapabilityGraph {
            client_id: client_id.to_string(),
            version: next_version,
            last_updated,
            endpoints,
            fields,
        });
        self.graphs.insert(client_id.to_string(), graph);
        next_version
    }

    /// Grants across `roles` that reference fields missing from the current
    /// graph. Stale grants are surfaced, never deleted and never expanded.
    pub fn stale_grants(&self, client_id: &str, roles: &[Role]) -> Vec<String> {
        let Some(graph) = self.snapshot(client_id) else {
            return Vec::new();
        };
        let mut warnings = Vec::new();
        for role in roles {
            for grant in &role.grants {
                if let Some(warning) = stale_grant_warning(&graph, &role.role_name, grant) {
                    warnings.push(warning);
                }
            }
        }
        warnings
    }
}

fn stale_grant_warning(graph: &CapabilityGraph, role_name: &str, grant: &Grant) -> Option<String> {
    match &grant.scope {
        GrantScope::Field(field) => {
            if graph.has_field(&grant.resource, field) {
                None
            } else {
                Some(format!(
                    "role {} grants {}.{}.{} but the field is no longer discovered",
                    role_name, grant.resource, grant.action, field
                ))
            }
        }
        // Category and wildcard grants expand against whatever exists; an
        // unknown resource is still worth flagging.
        GrantScope::Category(_) | GrantScope::Wildcard => {
            if graph.fields.contains_key(&grant.resource)
                || graph
                    .endpoints
                    .iter()
                    .any(|e| e.resource == grant.resource)
            {
                None
            } else {
                Some(format!(
                    "role {} grants on resource {} which is no longer discovered",
                    role_name, grant.resource
                ))
            }
        }
    }
}
