//! Permission resolution.
//!
//! `resolve_permission_set` is a pure function over the roles in play and a
//! capability-graph snapshot, so the precedence rules are unit-testable
//! without I/O. Precedence: deny > group-derived-over-default > priority.
//!
//! Emission keeps grants at their granted granularity: a category grant that
//! survives intact emits one `resource.action.category` string; a deny that
//! carves fields out of a category forces per-field emission of the
//! survivors. Base reachability (`resource.action`) is emitted once any
//! allow survives for that resource/action.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::models::{
    CapabilityGraph, Category, GrantEffect, GrantScope, RlsFilterClaim, Role,
};
use crate::services::error::BrokerError;
use crate::services::registry::CapabilityRegistry;
use crate::services::store::BrokerStore;

/// Output of a resolution round, embedded into issued tokens.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedPermissions {
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    pub rls_filters: HashMap<String, Vec<RlsFilterClaim>>,
}

impl ResolvedPermissions {
    pub fn is_empty(&self) -> bool {
        self.roles.is_empty() && self.permissions.is_empty() && self.rls_filters.is_empty()
    }
}

#[derive(Default)]
struct ActionAgg {
    allow_wildcard: bool,
    allow_base: bool,
    allow_categories: BTreeSet<Category>,
    allow_fields: BTreeSet<String>,
    deny_wildcard: bool,
    deny_categories: BTreeSet<Category>,
    deny_fields: BTreeSet<String>,
}

impl ActionAgg {
    fn any_allow(&self) -> bool {
        self.allow_wildcard
            || self.allow_base
            || !self.allow_categories.is_empty()
            || !self.allow_fields.is_empty()
    }

    fn is_field_denied(
        &self,
        resource: &str,
        field: &str,
        graph: Option<&CapabilityGraph>,
    ) -> bool {
        if self.deny_fields.contains(field) {
            return true;
        }
        match graph.and_then(|g| g.field_category(resource, field)) {
            Some(category) => self.deny_categories.contains(&category),
            None => false,
        }
    }
}

/// Resolve the effective permission set for a principal's roles.
///
/// `group_roles` come from group→role mappings, `default_roles` apply to
/// every principal of the application. A default-role grant is dropped when
/// any group-derived grant exists for the same (resource, action, scope)
/// key; within the surviving set, deny always wins.
pub fn resolve_permission_set(
    group_roles: &[Role],
    default_roles: &[Role],
    graph: Option<&CapabilityGraph>,
) -> ResolvedPermissions {
    let group_keys: HashSet<(String, String, String)> = group_roles
        .iter()
        .flat_map(|r| r.grants.iter().map(|g| g.key()))
        .collect();

    let mut aggs: BTreeMap<(String, String), ActionAgg> = BTreeMap::new();
    let contributions = group_roles
        .iter()
        .flat_map(|r| r.grants.iter())
        .chain(
            default_roles
                .iter()
                .flat_map(|r| r.grants.iter())
                .filter(|g| !group_keys.contains(&g.key())),
        );

    for grant in contributions {
        let agg = aggs
            .entry((grant.resource.clone(), grant.action.clone()))
            .or_default();
        match (&grant.effect, &grant.scope) {
            (GrantEffect::Allow, GrantScope::Wildcard) => agg.allow_wildcard = true,
            (GrantEffect::Allow, GrantScope::Category(Category::Base)) => agg.allow_base = true,
            (GrantEffect::Allow, GrantScope::Category(c)) => {
                agg.allow_categories.insert(*c);
            }
            (GrantEffect::Allow, GrantScope::Field(f)) => {
                agg.allow_fields.insert(f.clone());
            }
            (GrantEffect::Deny, GrantScope::Wildcard) => agg.deny_wildcard = true,
            (GrantEffect::Deny, GrantScope::Category(c)) => {
                agg.deny_categories.insert(*c);
            }
            (GrantEffect::Deny, GrantScope::Field(f)) => {
                agg.deny_fields.insert(f.clone());
            }
        }
    }

    let mut permissions: BTreeSet<String> = BTreeSet::new();
    let mut granted_actions: BTreeSet<(String, String)> = BTreeSet::new();

    for ((resource, action), agg) in &aggs {
        if !agg.any_allow() || agg.deny_wildcard {
            continue;
        }

        let mut emitted = false;

        // Base reachability: implied by any surviving allow, unless base
        // itself is denied (as a category or through its fields).
        let base_denied = agg.deny_categories.contains(&Category::Base)
            || graph.is_some_and(|g| {
                g.fields_in_category(resource, Category::Base)
                    .any(|f| agg.deny_fields.contains(&f.name))
            });

        if agg.allow_wildcard {
            match graph {
                Some(g) if !g.fields_for(resource).is_empty() => {
                    let fields = g.fields_for(resource);
                    let carved = fields
                        .iter()
                        .any(|f| agg.is_field_denied(resource, &f.name, graph));
                    if carved {
                        for f in fields {
                            if !agg.is_field_denied(resource, &f.name, graph) {
                                permissions.insert(format!("{}.{}.{}", resource, action, f.name));
                                emitted = true;
                            }
                        }
                    } else {
                        permissions.insert(format!("{}.{}.wildcard", resource, action));
                        emitted = true;
                    }
                }
                // Nothing discovered to carve against.
                _ => {
                    permissions.insert(format!("{}.{}.wildcard", resource, action));
                    emitted = true;
                }
            }
        }

        for category in &agg.allow_categories {
            if agg.deny_categories.contains(category) {
                continue;
            }
            let cat_fields: Vec<&str> = graph
                .map(|g| {
                    g.fields_in_category(resource, *category)
                        .map(|f| f.name.as_str())
                        .collect()
                })
                .unwrap_or_default();
            if cat_fields.is_empty() {
                permissions.insert(format!("{}.{}.{}", resource, action, category.label()));
                emitted = true;
                continue;
            }
            let carved = cat_fields
                .iter()
                .any(|f| agg.is_field_denied(resource, f, graph));
            if carved {
                for f in cat_fields {
                    if !agg.is_field_denied(resource, f, graph) {
                        permissions.insert(format!("{}.{}.{}", resource, action, f));
                        emitted = true;
                    }
                }
            } else {
                permissions.insert(format!("{}.{}.{}", resource, action, category.label()));
                emitted = true;
            }
        }

        for field in &agg.allow_fields {
            if agg.is_field_denied(resource, field, graph) {
                continue;
            }
            // A stale field grant (discovered surface no longer carries the
            // field) is tolerated but never auto-granted.
            if let Some(g) = graph {
                if !g.fields_for(resource).is_empty() && !g.has_field(resource, field) {
                    continue;
                }
            }
            permissions.insert(format!("{}.{}.{}", resource, action, field));
            emitted = true;
        }

        if (emitted || agg.allow_base) && !base_denied {
            permissions.insert(format!("{}.{}", resource, action));
            emitted = true;
        }

        if emitted {
            granted_actions.insert((resource.clone(), action.clone()));
        }
    }

    // RLS filters from every contributing role, keyed by granted
    // resource.action, verbatim with their operator tag.
    let mut rls_filters: HashMap<String, Vec<RlsFilterClaim>> = HashMap::new();
    for (resource, action) in &granted_actions {
        let mut entries: Vec<(i32, RlsFilterClaim)> = Vec::new();
        for role in group_roles.iter().chain(default_roles.iter()) {
            for filter in &role.rls_filters {
                if &filter.resource == resource {
                    entries.push((
                        filter.priority,
                        RlsFilterClaim {
                            expression: filter.expression.clone(),
                            operator: filter.operator,
                        },
                    ));
                }
            }
        }
        if entries.is_empty() {
            continue;
        }
        entries.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.expression.cmp(&b.1.expression)));
        let mut claims: Vec<RlsFilterClaim> = Vec::new();
        for (_, claim) in entries {
            if !claims.contains(&claim) {
                claims.push(claim);
            }
        }
        rls_filters.insert(format!("{}.{}", resource, action), claims);
    }

    let mut roles: Vec<String> = group_roles
        .iter()
        .chain(default_roles.iter())
        .map(|r| r.role_name.clone())
        .collect();
    roles.sort();
    roles.dedup();

    ResolvedPermissions {
        roles,
        permissions: permissions.into_iter().collect(),
        rls_filters,
    }
}

/// I/O wrapper: matches a principal's groups against the mapping store and
/// resolves against one coherent graph snapshot.
pub struct PermissionResolver {
    store: Arc<dyn BrokerStore>,
    registry: Arc<CapabilityRegistry>,
}

impl PermissionResolver {
    pub fn new(store: Arc<dyn BrokerStore>, registry: Arc<CapabilityRegistry>) -> Self {
        Self { store, registry }
    }

    pub async fn resolve(
        &self,
        groups: &[String],
        client_id: &str,
    ) -> Result<ResolvedPermissions, BrokerError> {
        let mappings = self.store.mappings_for_client(client_id).await?;
        let group_set: HashSet<&str> = groups.iter().map(String::as_str).collect();
        let mapped_roles: HashSet<&str> = mappings
            .iter()
            .filter(|m| group_set.contains(m.group_name.as_str()))
            .map(|m| m.role_name.as_str())
            .collect();

        let mut group_roles = Vec::new();
        let mut default_roles = Vec::new();
        for role in self.store.roles_for_client(client_id).await? {
            if !role.is_active || role.a2a_only {
                continue;
            }
            if mapped_roles.contains(role.role_name.as_str()) {
                group_roles.push(role);
            } else if role.is_default {
                default_roles.push(role);
            }
        }
        // Deterministic contribution order: priority, then name.
        group_roles.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.role_name.cmp(&b.role_name))
        });

        let graph = self.registry.snapshot(client_id);
        Ok(resolve_permission_set(
            &group_roles,
            &default_roles,
            graph.as_deref(),
        ))
    }
}
