//! Admin surface DTOs: application registration, roles, mappings, filters,
//! A2A permissions. Thin wrappers over the store; permission strings are
//! normalized at this boundary.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use crate::models::{
    Category, FilterOperator, Grant, GrantEffect, GrantScope, Permission, RlsFilter,
};

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RegisterAppRequest {
    #[validate(length(min = 3, max = 64))]
    pub client_id: String,
    #[validate(length(min = 1, max = 128))]
    pub display_name: String,
    #[validate(length(min = 1, max = 128))]
    pub owner: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    #[validate(url)]
    pub discovery_url: Option<String>,
    #[serde(default)]
    pub allow_discovery: bool,
    #[serde(default)]
    pub ip_binding_enabled: bool,
    #[serde(default)]
    pub device_binding_enabled: bool,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct UpsertRoleRequest {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub a2a_only: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub grants: Vec<GrantDto>,
    #[serde(default)]
    pub rls_filters: Vec<RlsFilterDto>,
}

fn default_true() -> bool {
    true
}

/// One grant as submitted by an admin. Exactly one of `category` or `field`
/// must be set; `category` also accepts `wildcard`.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct GrantDto {
    pub resource: String,
    pub action: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub effect: GrantEffect,
}

impl GrantDto {
    pub fn into_grant(self) -> Result<Grant, String> {
        // Validates both segments and normalizes any legacy delimiter use.
        let base = Permission::from_external(&format!("{}.{}", self.resource, self.action))
            .map_err(|e| e.to_string())?;
        let (resource, action) = (base.resource().to_string(), base.action().to_string());

        let scope = match (self.category, self.field) {
            (Some(category), None) => {
                if category == "wildcard" {
                    GrantScope::Wildcard
                } else {
                    GrantScope::Category(
                        Category::from_label(&category)
                            .ok_or_else(|| format!("unknown category: {}", category))?,
                    )
                }
            }
            (None, Some(field)) => {
                let parsed =
                    Permission::from_external(&format!("{}.{}.{}", resource, action, field))
                        .map_err(|e| e.to_string())?;
                match parsed {
                    Permission::Field { field, .. } => GrantScope::Field(field),
                    // The field name collided with a category label.
                    _ => return Err(format!("{} is a reserved category name", field)),
                }
            }
            (Some(_), Some(_)) => {
                return Err("grant must set category or field, not both".to_string())
            }
            (None, None) => return Err("grant must set category or field".to_string()),
        };

        Ok(Grant {
            resource,
            action,
            scope,
            effect: self.effect,
        })
    }
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct RlsFilterDto {
    pub resource: String,
    #[serde(default)]
    pub field: Option<String>,
    pub expression: String,
    pub operator: FilterOperator,
    #[serde(default)]
    pub priority: i32,
}

impl RlsFilterDto {
    pub fn into_filter(self) -> Result<RlsFilter, String> {
        RlsFilter::validate_expression(&self.expression)?;
        Ok(RlsFilter {
            resource: self.resource,
            field: self.field,
            expression: self.expression,
            operator: self.operator,
            priority: self.priority,
        })
    }
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct MappingRequest {
    #[validate(length(min = 1, max = 256))]
    pub group_name: String,
    #[validate(length(min = 1, max = 128))]
    pub role_name: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct A2aPermissionRequest {
    #[validate(length(min = 1))]
    pub source_client_id: String,
    #[validate(length(min = 1))]
    pub target_client_id: String,
    #[validate(length(min = 1))]
    pub allowed_scopes: Vec<String>,
    #[validate(range(min = 1, max = 86400))]
    pub max_token_duration_seconds: i64,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

/// Plaintext API key, returned exactly once at issuance/rotation.
#[derive(Debug, Serialize, ToSchema)]
pub struct CredentialResponse {
    pub client_id: String,
    pub api_key: String,
}

/// Request body for the A2A token endpoint.
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct ServiceTokenRequest {
    #[validate(length(min = 1))]
    pub target_client_id: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    #[validate(range(min = 1, max = 86400))]
    pub duration_seconds: Option<i64>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AuditQuery {
    #[serde(default = "default_audit_limit")]
    pub limit: usize,
}

fn default_audit_limit() -> usize {
    50
}
