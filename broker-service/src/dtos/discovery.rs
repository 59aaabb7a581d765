//! Discovery wire schema (application -> broker) and discovery responses.

use serde::Deserialize;
use std::collections::HashMap;
use utoipa::ToSchema;
use validator::Validate;

/// Discovery payload schema version this broker accepts.
pub const SUPPORTED_DISCOVERY_VERSION: &str = "2.0";

/// Raw discovery document as served by an application's discovery endpoint.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct DiscoveryDocument {
    pub app_id: String,
    pub app_name: String,
    pub version: String,
    pub last_updated: String,
    #[serde(default, alias = "services")]
    pub endpoints: Vec<DiscoveryEndpoint>,
    /// resource -> field name -> metadata
    #[serde(default)]
    #[schema(value_type = Object)]
    pub response_fields: HashMap<String, HashMap<String, DiscoveryField>>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct DiscoveryEndpoint {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub response_fields: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct DiscoveryField {
    #[serde(rename = "type", default)]
    pub field_type: String,
    #[serde(default)]
    pub description: Option<String>,
    pub category: String,
    #[serde(default)]
    pub nullable: Option<bool>,
    #[serde(default)]
    pub searchable: Option<bool>,
    #[serde(default)]
    pub filterable: Option<bool>,
    #[serde(default)]
    pub max_length: Option<u32>,
    #[serde(default)]
    pub format: Option<String>,
}

/// Request body for batch discovery.
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct BatchDiscoverRequest {
    #[validate(length(min = 1, max = 100))]
    pub client_ids: Vec<String>,
    #[serde(default)]
    pub force: bool,
}

/// Query parameters for single-app discovery.
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct DiscoverParams {
    #[serde(default)]
    pub force: bool,
}
