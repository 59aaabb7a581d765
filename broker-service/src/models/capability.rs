//! Capability graph - the discovered surface of one registered application.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::ToSchema;

/// Field sensitivity classification.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Base,
    Pii,
    Phi,
    Financial,
    Sensitive,
}

impl Category {
    pub fn label(&self) -> &'static str {
        match self {
            Category::Base => "base",
            Category::Pii => "pii",
            Category::Phi => "phi",
            Category::Financial => "financial",
            Category::Sensitive => "sensitive",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "base" => Some(Category::Base),
            "pii" => Some(Category::Pii),
            "phi" => Some(Category::Phi),
            "financial" => Some(Category::Financial),
            "sensitive" => Some(Category::Sensitive),
            _ => None,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Field-level metadata discovered from an application.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FieldMetadata {
    pub name: String,
    pub field_type: String,
    pub category: Category,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One discovered endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Endpoint {
    pub path: String,
    pub method: String,
    pub resource: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub response_fields: Vec<String>,
}

/// The discovered capability surface of one application, replaced wholesale
/// on every successful discovery round. Readers always hold a full snapshot;
/// the registry swaps the `Arc` atomically.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CapabilityGraph {
    pub client_id: String,
    /// Monotonic, bumped on every replacement.
    pub version: u64,
    pub last_updated: DateTime<Utc>,
    pub endpoints: Vec<Endpoint>,
    /// resource -> discovered fields
    #[schema(value_type = Object)]
    pub fields: HashMap<String, Vec<FieldMetadata>>,
}

impl CapabilityGraph {
    pub fn fields_for(&self, resource: &str) -> &[FieldMetadata] {
        self.fields.get(resource).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn fields_in_category<'a>(
        &'a self,
        resource: &str,
        category: Category,
    ) -> impl Iterator<Item = &'a FieldMetadata> {
        self.fields_for(resource)
            .iter()
            .filter(move |f| f.category == category)
    }

    pub fn field_category(&self, resource: &str, field: &str) -> Option<Category> {
        self.fields_for(resource)
            .iter()
            .find(|f| f.name == field)
            .map(|f| f.category)
    }

    pub fn has_field(&self, resource: &str, field: &str) -> bool {
        self.field_category(resource, field).is_some()
    }

    /// All (resource, action) pairs exposed by the discovered endpoints.
    pub fn resource_actions(&self) -> std::collections::BTreeSet<(String, String)> {
        self.endpoints
            .iter()
            .map(|e| (e.resource.clone(), e.action.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> CapabilityGraph {
        CapabilityGraph {
            client_id: "app_hr".into(),
            version: 3,
            last_updated: Utc::now(),
            endpoints: vec![Endpoint {
                path: "/employees".into(),
                method: "GET".into(),
                resource: "employees".into(),
                action: "read".into(),
                description: None,
                response_fields: vec!["email".into(), "ssn".into()],
            }],
            fields: HashMap::from([(
                "employees".to_string(),
                vec![
                    FieldMetadata {
                        name: "id".into(),
                        field_type: "string".into(),
                        category: Category::Base,
                        nullable: false,
                        description: None,
                    },
                    FieldMetadata {
                        name: "email".into(),
                        field_type: "string".into(),
                        category: Category::Pii,
                        nullable: false,
                        description: None,
                    },
                    FieldMetadata {
                        name: "ssn".into(),
                        field_type: "string".into(),
                        category: Category::Sensitive,
                        nullable: true,
                        description: None,
                    },
                ],
            )]),
        }
    }

    #[test]
    fn test_category_labels_round_trip() {
        for c in [
            Category::Base,
            Category::Pii,
            Category::Phi,
            Category::Financial,
            Category::Sensitive,
        ] {
            assert_eq!(Category::from_label(c.label()), Some(c));
        }
        assert_eq!(Category::from_label("wildcard"), None);
    }

    #[test]
    fn test_fields_in_category() {
        let g = graph();
        let pii: Vec<_> = g
            .fields_in_category("employees", Category::Pii)
            .map(|f| f.name.as_str())
            .collect();
        assert_eq!(pii, vec!["email"]);
    }

    #[test]
    fn test_field_category_lookup() {
        let g = graph();
        assert_eq!(
            g.field_category("employees", "ssn"),
            Some(Category::Sensitive)
        );
        assert_eq!(g.field_category("employees", "missing"), None);
        assert_eq!(g.field_category("unknown", "ssn"), None);
    }

    #[test]
    fn test_resource_actions() {
        let g = graph();
        assert!(g
            .resource_actions()
            .contains(&("employees".to_string(), "read".to_string())));
    }
}
