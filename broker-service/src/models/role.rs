//! Role model - per-application roles owning grants and RLS filters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::capability::Category;

/// Role scoped to one application. Owns its grants and RLS filters; deleting
/// a role removes both, never the application.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Role {
    pub client_id: String,
    pub role_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Tie-break among group-derived roles contributing to the same key.
    #[serde(default)]
    pub priority: i32,
    /// Default roles contribute to every principal of the application.
    #[serde(default)]
    pub is_default: bool,
    /// Roles only reachable through the A2A broker, never via user login.
    #[serde(default)]
    pub a2a_only: bool,
    pub is_active: bool,
    #[serde(default)]
    pub grants: Vec<Grant>,
    #[serde(default)]
    pub rls_filters: Vec<RlsFilter>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Role {
    pub fn new(client_id: String, role_name: String) -> Self {
        let now = Utc::now();
        Self {
            client_id,
            role_name,
            description: None,
            priority: 0,
            is_default: false,
            a2a_only: false,
            is_active: true,
            grants: Vec::new(),
            rls_filters: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Allow or deny. Deny is stored first-class so deny-wins is enforced
/// structurally rather than by string convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum GrantEffect {
    Allow,
    Deny,
}

impl Default for GrantEffect {
    fn default() -> Self {
        GrantEffect::Allow
    }
}

/// Granularity of a grant: a whole sensitivity category, everything, or one
/// named field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum GrantScope {
    Category(Category),
    Wildcard,
    Field(String),
}

/// A stored permission assignment on a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Grant {
    pub resource: String,
    pub action: String,
    pub scope: GrantScope,
    #[serde(default)]
    pub effect: GrantEffect,
}

impl Grant {
    /// Collision key for layering default-role contributions under
    /// group-derived ones: same resource, action, and scope.
    pub fn key(&self) -> (String, String, String) {
        let scope = match &self.scope {
            GrantScope::Category(c) => c.label().to_string(),
            GrantScope::Wildcard => "wildcard".to_string(),
            GrantScope::Field(f) => format!("field:{}", f),
        };
        (self.resource.clone(), self.action.clone(), scope)
    }
}

/// How multiple filter expressions for one resource combine downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum FilterOperator {
    And,
    Or,
}

/// Context variables an RLS expression may reference. Anything else is
/// rejected at save time; raw user input never reaches an expression.
pub const ALLOWED_CONTEXT_VARIABLES: &[&str] = &[
    "current_user_id",
    "current_user_email",
    "current_user_groups",
];

/// Row-level security filter attached to a role.
///
/// The broker stores and forwards expressions verbatim; it never evaluates
/// them. Tokens embed a snapshot, so editing a filter does not change
/// already-issued tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RlsFilter {
    pub resource: String,
    /// `None` applies to the whole resource ("all").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub expression: String,
    pub operator: FilterOperator,
    #[serde(default)]
    pub priority: i32,
}

impl RlsFilter {
    /// Validate that an expression only references whitelisted context
    /// variables and carries no statement separators.
    pub fn validate_expression(expression: &str) -> Result<(), String> {
        if expression.trim().is_empty() {
            return Err("filter expression is empty".to_string());
        }
        if expression.contains(';') || expression.contains("--") {
            return Err("filter expression contains a statement separator".to_string());
        }

        let mut chars = expression.char_indices().peekable();
        while let Some((idx, c)) = chars.next() {
            if c != '@' {
                continue;
            }
            let rest: String = expression[idx + 1..]
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                .collect();
            if !ALLOWED_CONTEXT_VARIABLES.contains(&rest.as_str()) {
                return Err(format!("unknown context variable: @{}", rest));
            }
        }
        Ok(())
    }
}

/// Identity-provider group to role mapping, many-to-many.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct GroupRoleMapping {
    pub client_id: String,
    /// Matched exactly against the principal's group display names.
    pub group_name: String,
    pub role_name: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_key_distinguishes_scope() {
        let category = Grant {
            resource: "employees".into(),
            action: "read".into(),
            scope: GrantScope::Category(Category::Pii),
            effect: GrantEffect::Allow,
        };
        let field = Grant {
            resource: "employees".into(),
            action: "read".into(),
            scope: GrantScope::Field("pii".into()),
            effect: GrantEffect::Allow,
        };
        assert_ne!(category.key(), field.key());
    }

    #[test]
    fn test_expression_whitelist_accepts_known_variables() {
        assert!(RlsFilter::validate_expression("owner_email = @current_user_email").is_ok());
        assert!(RlsFilter::validate_expression(
            "region = 'EU' AND manager_id = @current_user_id"
        )
        .is_ok());
    }

    #[test]
    fn test_expression_whitelist_rejects_unknown_variable() {
        let err = RlsFilter::validate_expression("owner = @request_param").unwrap_err();
        assert!(err.contains("@request_param"));
    }

    #[test]
    fn test_expression_rejects_statement_separators() {
        assert!(RlsFilter::validate_expression("a = 1; DROP TABLE x").is_err());
        assert!(RlsFilter::validate_expression("a = 1 -- comment").is_err());
        assert!(RlsFilter::validate_expression("  ").is_err());
    }

    #[test]
    fn test_grant_scope_serde_shape() {
        let scope = GrantScope::Category(Category::Phi);
        let json = serde_json::to_value(&scope).unwrap();
        assert_eq!(json["kind"], "category");
        assert_eq!(json["value"], "phi");

        let wildcard: GrantScope = serde_json::from_value(serde_json::json!({
            "kind": "wildcard"
        }))
        .unwrap();
        assert_eq!(wildcard, GrantScope::Wildcard);
    }
}
