//! Domain models for the token broker.

mod a2a;
mod application;
mod audit;
mod capability;
mod discovery;
mod permission;
mod role;
mod token;

pub use a2a::A2aPermission;
pub use application::{ApiCredential, Application};
pub use audit::AuditEvent;
pub use capability::{CapabilityGraph, Category, Endpoint, FieldMetadata};
pub use discovery::{DiscoveryRecord, DiscoveryStats, DiscoveryStatus};
pub use permission::{Permission, PermissionParseError};
pub use role::{
    ALLOWED_CONTEXT_VARIABLES, FilterOperator, Grant, GrantEffect, GrantScope, GroupRoleMapping,
    RlsFilter, Role,
};
pub use token::{BrokerClaims, RefreshRecord, RlsFilterClaim, TokenType};
