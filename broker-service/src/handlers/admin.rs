//! Admin CRUD handlers: applications, roles, mappings, A2A permissions,
//! key rotation, audit trail. Thin wrappers over the store; the core
//! consumes these tables as data sources and never calls back into them.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use service_core::error::AppError;
use utoipa::ToSchema;
use validator::Validate;

use crate::AppState;
use crate::dtos::admin::{
    A2aPermissionRequest, AuditQuery, CredentialResponse, MappingRequest, RegisterAppRequest,
    UpsertRoleRequest,
};
use crate::models::{
    A2aPermission, Application, AuditEvent, GroupRoleMapping, Role,
};

/// Previous API key stays valid this long after a rotation.
const PREVIOUS_KEY_GRACE_HOURS: i64 = 24;

/// Register an application
#[utoipa::path(
    post,
    path = "/admin/apps",
    request_body = RegisterAppRequest,
    responses(
        (status = 201, description = "Application registered", body = Application),
        (status = 409, description = "client_id already registered")
    ),
    security(("admin_api_key" = [])),
    tag = "Admin"
)]
pub async fn create_app(
    State(state): State<AppState>,
    Json(request): Json<RegisterAppRequest>,
) -> Result<(StatusCode, Json<Application>), AppError> {
    request.validate()?;

    if state
        .store
        .get_application(&request.client_id)
        .await
        .map_err(AppError::from)?
        .is_some()
    {
        return Err(AppError::Conflict(anyhow::anyhow!(
            "application {} is already registered",
            request.client_id
        )));
    }

    let mut app = Application::new(
        request.client_id,
        request.display_name,
        request.owner,
        request.redirect_uris,
        request.discovery_url,
        request.allow_discovery,
    );
    app.ip_binding_enabled = request.ip_binding_enabled;
    app.device_binding_enabled = request.device_binding_enabled;

    state
        .store
        .upsert_application(app.clone())
        .await
        .map_err(AppError::from)?;
    state
        .store
        .append_audit(AuditEvent::new("application_registered").client(&app.client_id))
        .await
        .map_err(AppError::from)?;

    Ok((StatusCode::CREATED, Json(app)))
}

/// List registered applications
#[utoipa::path(
    get,
    path = "/admin/apps",
    responses((status = 200, description = "All applications", body = [Application])),
    security(("admin_api_key" = [])),
    tag = "Admin"
)]
pub async fn list_apps(
    State(state): State<AppState>,
) -> Result<Json<Vec<Application>>, AppError> {
    let apps = state.store.list_applications().await.map_err(AppError::from)?;
    Ok(Json(apps))
}

/// Fetch one application
#[utoipa::path(
    get,
    path = "/admin/apps/{client_id}",
    params(("client_id" = String, Path, description = "Application")),
    responses(
        (status = 200, description = "Application", body = Application),
        (status = 404, description = "Unknown application")
    ),
    security(("admin_api_key" = [])),
    tag = "Admin"
)]
pub async fn get_app(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> Result<Json<Application>, AppError> {
    state
        .store
        .get_application(&client_id)
        .await
        .map_err(AppError::from)?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("unknown application {}", client_id)))
}

/// Deactivate an application
///
/// Soft-deactivation only: tokens referencing the application stay
/// revocable and auditable.
#[utoipa::path(
    delete,
    path = "/admin/apps/{client_id}",
    params(("client_id" = String, Path, description = "Application")),
    responses(
        (status = 204, description = "Application deactivated"),
        (status = 404, description = "Unknown application")
    ),
    security(("admin_api_key" = [])),
    tag = "Admin"
)]
pub async fn deactivate_app(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> Result<StatusCode, AppError> {
    if !state
        .store
        .deactivate_application(&client_id)
        .await
        .map_err(AppError::from)?
    {
        return Err(AppError::NotFound(anyhow::anyhow!(
            "unknown application {}",
            client_id
        )));
    }
    state
        .store
        .append_audit(AuditEvent::new("application_deactivated").client(&client_id))
        .await
        .map_err(AppError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Issue or rotate an application's API key
///
/// The plaintext key is returned exactly once. A rotated-out key keeps
/// working for a short grace window.
#[utoipa::path(
    post,
    path = "/admin/apps/{client_id}/credentials",
    params(("client_id" = String, Path, description = "Application")),
    responses(
        (status = 201, description = "Plaintext key, shown once", body = CredentialResponse),
        (status = 404, description = "Unknown application")
    ),
    security(("admin_api_key" = [])),
    tag = "Admin"
)]
pub async fn issue_credential(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> Result<(StatusCode, Json<CredentialResponse>), AppError> {
    let api_key = state
        .a2a
        .issue_api_key(&client_id, PREVIOUS_KEY_GRACE_HOURS)
        .await
        .map_err(AppError::from)?;
    Ok((
        StatusCode::CREATED,
        Json(CredentialResponse { client_id, api_key }),
    ))
}

/// Role upsert response: the saved role plus any grants now referencing
/// undiscovered capabilities.
#[derive(Debug, Serialize, ToSchema)]
pub struct RoleSavedResponse {
    pub role: Role,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Create or update a role with its grants and RLS filters
#[utoipa::path(
    put,
    path = "/admin/apps/{client_id}/roles/{role_name}",
    params(
        ("client_id" = String, Path, description = "Application"),
        ("role_name" = String, Path, description = "Role")
    ),
    request_body = UpsertRoleRequest,
    responses(
        (status = 200, description = "Role saved", body = RoleSavedResponse),
        (status = 400, description = "Malformed grant or filter expression")
    ),
    security(("admin_api_key" = [])),
    tag = "Admin"
)]
pub async fn upsert_role(
    State(state): State<AppState>,
    Path((client_id, role_name)): Path<(String, String)>,
    Json(request): Json<UpsertRoleRequest>,
) -> Result<Json<RoleSavedResponse>, AppError> {
    request.validate()?;

    if state
        .store
        .get_application(&client_id)
        .await
        .map_err(AppError::from)?
        .is_none()
    {
        return Err(AppError::NotFound(anyhow::anyhow!(
            "unknown application {}",
            client_id
        )));
    }

    let mut grants = Vec::with_capacity(request.grants.len());
    for dto in request.grants {
        grants.push(
            dto.into_grant()
                .map_err(|e| AppError::BadRequest(anyhow::anyhow!(e)))?,
        );
    }
    let mut rls_filters = Vec::with_capacity(request.rls_filters.len());
    for dto in request.rls_filters {
        rls_filters.push(
            dto.into_filter()
                .map_err(|e| AppError::BadRequest(anyhow::anyhow!(e)))?,
        );
    }

    let existing = state
        .store
        .get_role(&client_id, &role_name)
        .await
        .map_err(AppError::from)?;
    let mut role = existing.unwrap_or_else(|| Role::new(client_id.clone(), role_name.clone()));
    role.description = request.description;
    role.priority = request.priority;
    role.is_default = request.is_default;
    role.a2a_only = request.a2a_only;
    role.is_active = request.is_active;
    role.grants = grants;
    role.rls_filters = rls_filters;
    role.updated_at = Utc::now();

    // Best effort against the current graph: unknown references are
    // surfaced, not rejected.
    let warnings = state.registry.stale_grants(&client_id, std::slice::from_ref(&role));

    state
        .store
        .upsert_role(role.clone())
        .await
        .map_err(AppError::from)?;

    Ok(Json(RoleSavedResponse { role, warnings }))
}

/// List roles for an application
#[utoipa::path(
    get,
    path = "/admin/apps/{client_id}/roles",
    params(("client_id" = String, Path, description = "Application")),
    responses((status = 200, description = "Roles", body = [Role])),
    security(("admin_api_key" = [])),
    tag = "Admin"
)]
pub async fn list_roles(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> Result<Json<Vec<Role>>, AppError> {
    let roles = state
        .store
        .roles_for_client(&client_id)
        .await
        .map_err(AppError::from)?;
    Ok(Json(roles))
}

/// Delete a role
///
/// Cascades to the role's grants, filters, and group mappings; never to the
/// application.
#[utoipa::path(
    delete,
    path = "/admin/apps/{client_id}/roles/{role_name}",
    params(
        ("client_id" = String, Path, description = "Application"),
        ("role_name" = String, Path, description = "Role")
    ),
    responses(
        (status = 204, description = "Role deleted"),
        (status = 404, description = "Unknown role")
    ),
    security(("admin_api_key" = [])),
    tag = "Admin"
)]
pub async fn delete_role(
    State(state): State<AppState>,
    Path((client_id, role_name)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    if !state
        .store
        .delete_role(&client_id, &role_name)
        .await
        .map_err(AppError::from)?
    {
        return Err(AppError::NotFound(anyhow::anyhow!(
            "unknown role {} for {}",
            role_name,
            client_id
        )));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Map an identity-provider group to a role
#[utoipa::path(
    post,
    path = "/admin/apps/{client_id}/mappings",
    params(("client_id" = String, Path, description = "Application")),
    request_body = MappingRequest,
    responses(
        (status = 201, description = "Mapping saved", body = GroupRoleMapping),
        (status = 400, description = "Mapping references an unknown role")
    ),
    security(("admin_api_key" = [])),
    tag = "Admin"
)]
pub async fn create_mapping(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    Json(request): Json<MappingRequest>,
) -> Result<(StatusCode, Json<GroupRoleMapping>), AppError> {
    request.validate()?;
    let mapping = GroupRoleMapping {
        client_id,
        group_name: request.group_name,
        role_name: request.role_name,
        created_at: Utc::now(),
    };
    state
        .store
        .upsert_mapping(mapping.clone())
        .await
        .map_err(AppError::from)?;
    Ok((StatusCode::CREATED, Json(mapping)))
}

/// List group→role mappings for an application
#[utoipa::path(
    get,
    path = "/admin/apps/{client_id}/mappings",
    params(("client_id" = String, Path, description = "Application")),
    responses((status = 200, description = "Mappings", body = [GroupRoleMapping])),
    security(("admin_api_key" = [])),
    tag = "Admin"
)]
pub async fn list_mappings(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> Result<Json<Vec<GroupRoleMapping>>, AppError> {
    let mappings = state
        .store
        .mappings_for_client(&client_id)
        .await
        .map_err(AppError::from)?;
    Ok(Json(mappings))
}

/// Remove a group→role mapping
#[utoipa::path(
    delete,
    path = "/admin/apps/{client_id}/mappings",
    params(("client_id" = String, Path, description = "Application")),
    request_body = MappingRequest,
    responses(
        (status = 204, description = "Mapping removed"),
        (status = 404, description = "Unknown mapping")
    ),
    security(("admin_api_key" = [])),
    tag = "Admin"
)]
pub async fn delete_mapping(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    Json(request): Json<MappingRequest>,
) -> Result<StatusCode, AppError> {
    if !state
        .store
        .delete_mapping(&client_id, &request.group_name, &request.role_name)
        .await
        .map_err(AppError::from)?
    {
        return Err(AppError::NotFound(anyhow::anyhow!(
            "no mapping {} -> {} for {}",
            request.group_name,
            request.role_name,
            client_id
        )));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Create or update an A2A permission
#[utoipa::path(
    put,
    path = "/admin/a2a",
    request_body = A2aPermissionRequest,
    responses((status = 200, description = "A2A permission saved", body = A2aPermission)),
    security(("admin_api_key" = [])),
    tag = "Admin"
)]
pub async fn upsert_a2a(
    State(state): State<AppState>,
    Json(request): Json<A2aPermissionRequest>,
) -> Result<Json<A2aPermission>, AppError> {
    request.validate()?;

    let existing = state
        .store
        .get_a2a_permission(&request.source_client_id, &request.target_client_id)
        .await
        .map_err(AppError::from)?;
    let mut permission = existing.unwrap_or_else(|| {
        A2aPermission::new(
            request.source_client_id.clone(),
            request.target_client_id.clone(),
            Vec::new(),
            request.max_token_duration_seconds,
        )
    });
    permission.allowed_scopes = request.allowed_scopes;
    permission.max_token_duration_seconds = request.max_token_duration_seconds;
    permission.is_active = request.is_active;
    permission.updated_at = Utc::now();

    state
        .store
        .upsert_a2a_permission(permission.clone())
        .await
        .map_err(AppError::from)?;
    Ok(Json(permission))
}

/// List A2A permissions
#[utoipa::path(
    get,
    path = "/admin/a2a",
    responses((status = 200, description = "A2A allow-list", body = [A2aPermission])),
    security(("admin_api_key" = [])),
    tag = "Admin"
)]
pub async fn list_a2a(
    State(state): State<AppState>,
) -> Result<Json<Vec<A2aPermission>>, AppError> {
    let list = state
        .store
        .list_a2a_permissions()
        .await
        .map_err(AppError::from)?;
    Ok(Json(list))
}

/// Remove an A2A permission
#[utoipa::path(
    delete,
    path = "/admin/a2a/{source_client_id}/{target_client_id}",
    params(
        ("source_client_id" = String, Path, description = "Source application"),
        ("target_client_id" = String, Path, description = "Target application")
    ),
    responses(
        (status = 204, description = "A2A permission removed"),
        (status = 404, description = "No such pair")
    ),
    security(("admin_api_key" = [])),
    tag = "Admin"
)]
pub async fn delete_a2a(
    State(state): State<AppState>,
    Path((source_client_id, target_client_id)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    if !state
        .store
        .delete_a2a_permission(&source_client_id, &target_client_id)
        .await
        .map_err(AppError::from)?
    {
        return Err(AppError::NotFound(anyhow::anyhow!(
            "no A2A permission for {} -> {}",
            source_client_id,
            target_client_id
        )));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Rotate the signing key
///
/// The outgoing public key stays published for the configured grace window.
#[utoipa::path(
    post,
    path = "/admin/keys/rotate",
    responses((status = 200, description = "New active key id")),
    security(("admin_api_key" = [])),
    tag = "Admin"
)]
pub async fn rotate_keys(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let kid = state.keyring.rotate()?;
    state
        .store
        .append_audit(AuditEvent::new("signing_key_rotated").detail(kid.clone()))
        .await
        .map_err(AppError::from)?;
    Ok(Json(json!({ "kid": kid })))
}

/// Read the recent activity trail
#[utoipa::path(
    get,
    path = "/admin/audit",
    params(("limit" = Option<usize>, Query, description = "Max entries, newest first")),
    responses((status = 200, description = "Recent audit events", body = [AuditEvent])),
    security(("admin_api_key" = [])),
    tag = "Admin"
)]
pub async fn audit_trail(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditEvent>>, AppError> {
    let events = state
        .store
        .recent_audit(query.limit.min(500))
        .await
        .map_err(AppError::from)?;
    Ok(Json(events))
}
