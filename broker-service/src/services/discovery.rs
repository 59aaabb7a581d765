//! Discovery reconciler.
//!
//! Fetches an application's discovery document, validates it against the
//! supported schema, and atomically replaces the capability graph. Transient
//! failures retry with backoff through the shared retry policy; validation,
//! authentication, and configuration failures surface immediately. Runs for
//! the same application are serialized; different applications reconcile in
//! parallel.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use utoipa::ToSchema;

use service_core::retry::{RetryPolicy, retry_call};

use crate::dtos::discovery::{DiscoveryDocument, SUPPORTED_DISCOVERY_VERSION};
use crate::models::{
    AuditEvent, Category, DiscoveryRecord, DiscoveryStats, DiscoveryStatus, Endpoint,
    FieldMetadata,
};
use crate::services::error::{BrokerError, ErrorClass};
use crate::services::registry::CapabilityRegistry;
use crate::services::store::BrokerStore;

/// Outcome of one discovery round, also used as the admin-facing response.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DiscoveryReport {
    pub client_id: String,
    pub status: DiscoveryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph_version: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Served from the cache window without contacting the application.
    pub cached: bool,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

pub struct DiscoveryService {
    http: reqwest::Client,
    store: Arc<dyn BrokerStore>,
    registry: Arc<CapabilityRegistry>,
    policy: RetryPolicy,
    cache_window: Duration,
    max_response_bytes: usize,
    batch_concurrency: usize,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl DiscoveryService {
    pub fn new(
        store: Arc<dyn BrokerStore>,
        registry: Arc<CapabilityRegistry>,
        policy: RetryPolicy,
        timeout_seconds: u64,
        max_response_bytes: usize,
        cache_window_minutes: i64,
        batch_concurrency: usize,
    ) -> Result<Self, anyhow::Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(timeout_seconds))
            .timeout(std::time::Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build discovery HTTP client: {}", e))?;

        Ok(Self {
            http,
            store,
            registry,
            policy,
            cache_window: Duration::minutes(cache_window_minutes),
            max_response_bytes,
            batch_concurrency: batch_concurrency.max(1),
            locks: DashMap::new(),
        })
    }

    /// Run discovery for one application.
    pub async fn discover(
        &self,
        client_id: &str,
        force: bool,
    ) -> Result<DiscoveryReport, BrokerError> {
        let app = self
            .store
            .get_application(client_id)
            .await?
            .ok_or_else(|| {
                BrokerError::Configuration(format!("unknown application {}", client_id))
            })?;
        if !app.is_active {
            return Err(BrokerError::Configuration(format!(
                "application {} is inactive",
                client_id
            )));
        }
        if !app.allow_discovery {
            return Err(BrokerError::Configuration(format!(
                "discovery is disabled for {}",
                client_id
            )));
        }
        let url = app.discovery_url.clone().ok_or_else(|| {
            BrokerError::Configuration(format!("no discovery endpoint configured for {}", client_id))
        })?;
        if reqwest::Url::parse(&url).is_err() {
            return Err(BrokerError::Configuration(format!(
                "malformed discovery URL: {}",
                url
            )));
        }

        // Single writer per application; other apps proceed in parallel.
        let lock = self
            .locks
            .entry(client_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if !force {
            if let Some(report) = self.cached_report(client_id).await? {
                return Ok(report);
            }
        }

        let started = Instant::now();

        // Reachability pre-check: failure short-circuits without touching
        // the retry budget.
        if let Err(err) = self.probe(&url).await {
            self.record_failure(client_id, &err, started.elapsed().as_millis() as u64)
                .await;
            return Err(err);
        }

        let document = match retry_call(&self.policy, "discovery_fetch", || {
            self.fetch_document(&url)
        })
        .await
        {
            Ok(doc) => doc,
            Err(err) => {
                self.record_failure(client_id, &err, started.elapsed().as_millis() as u64)
                    .await;
                return Err(err);
            }
        };

        let (endpoints, fields, last_updated) = match validate_document(client_id, &document) {
            Ok(parts) => parts,
            Err(err) => {
                self.record_failure(client_id, &err, started.elapsed().as_millis() as u64)
                    .await;
                return Err(err);
            }
        };

        let version = self.registry.replace(client_id, endpoints, fields, last_updated);

        // Grants left pointing at removed capabilities: surfaced, not dropped.
        let roles = self.store.roles_for_client(client_id).await?;
        let warnings = self.registry.stale_grants(client_id, &roles);
        for warning in &warnings {
            tracing::warn!(client_id = %client_id, "{}", warning);
            self.store
                .append_audit(
                    AuditEvent::new("stale_grant_detected")
                        .client(client_id)
                        .detail(warning.clone()),
                )
                .await?;
        }

        let latency_ms = started.elapsed().as_millis() as u64;
        let status = if warnings.is_empty() {
            DiscoveryStatus::Success
        } else {
            DiscoveryStatus::Partial
        };

        self.store
            .append_discovery_record(
                client_id,
                DiscoveryRecord {
                    timestamp: Utc::now(),
                    outcome: status,
                    error_class: None,
                    message: None,
                    latency_ms,
                    graph_version: Some(version),
                },
            )
            .await?;
        self.store
            .append_audit(
                AuditEvent::new("discovery_completed")
                    .client(client_id)
                    .detail(format!("graph version {}", version)),
            )
            .await?;

        tracing::info!(
            client_id = %client_id,
            version = version,
            latency_ms = latency_ms,
            warnings = warnings.len(),
            "Discovery completed"
        );

        Ok(DiscoveryReport {
            client_id: client_id.to_string(),
            status,
            graph_version: Some(version),
            warnings,
            error_class: None,
            error: None,
            cached: false,
            latency_ms,
            timestamp: Utc::now(),
        })
    }

    /// Like [`discover`], but folds failures into an error-status report so
    /// batch callers get one entry per application.
    pub async fn discover_report(&self, client_id: &str, force: bool) -> DiscoveryReport {
        match self.discover(client_id, force).await {
            Ok(report) => report,
            Err(err) => DiscoveryReport {
                client_id: client_id.to_string(),
                status: DiscoveryStatus::Error,
                graph_version: self.registry.version(client_id),
                warnings: Vec::new(),
                error_class: err.class(),
                error: Some(err.to_string()),
                cached: false,
                latency_ms: 0,
                timestamp: Utc::now(),
            },
        }
    }

    /// Discover many applications with bounded concurrency. One hung or
    /// failing application never blocks or fails the others.
    pub async fn batch_discover(&self, client_ids: &[String], force: bool) -> Vec<DiscoveryReport> {
        futures::stream::iter(client_ids.to_vec())
            .map(|client_id| async move { self.discover_report(&client_id, force).await })
            .buffer_unordered(self.batch_concurrency)
            .collect()
            .await
    }

    pub async fn history(&self, client_id: &str) -> Result<Vec<DiscoveryRecord>, BrokerError> {
        self.store.discovery_history(client_id).await
    }

    pub async fn stats(&self, client_id: &str) -> Result<DiscoveryStats, BrokerError> {
        let history = self.store.discovery_history(client_id).await?;
        Ok(DiscoveryStats::from_history(client_id, &history))
    }

    async fn cached_report(
        &self,
        client_id: &str,
    ) -> Result<Option<DiscoveryReport>, BrokerError> {
        let history = self.store.discovery_history(client_id).await?;
        let fresh = history.iter().rev().find(|r| {
            matches!(
                r.outcome,
                DiscoveryStatus::Success | DiscoveryStatus::Partial
            ) && r.timestamp + self.cache_window > Utc::now()
        });
        Ok(fresh.map(|record| DiscoveryReport {
            client_id: client_id.to_string(),
            status: DiscoveryStatus::Success,
            graph_version: self.registry.version(client_id),
            warnings: Vec::new(),
            error_class: None,
            error: None,
            cached: true,
            latency_ms: 0,
            timestamp: record.timestamp,
        }))
    }

    async fn probe(&self, url: &str) -> Result<(), BrokerError> {
        // Any HTTP response proves reachability; status handling belongs to
        // the real fetch.
        self.http
            .head(url)
            .send()
            .await
            .map(|_| ())
            .map_err(classify_transport_error)
    }

    async fn fetch_document(&self, url: &str) -> Result<DiscoveryDocument, BrokerError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(BrokerError::Authentication(format!(
                "discovery endpoint rejected credentials ({})",
                status
            )));
        }
        if status.is_server_error() {
            return Err(BrokerError::Server(format!(
                "discovery endpoint returned {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(BrokerError::Validation(format!(
                "discovery endpoint returned unexpected status {}",
                status
            )));
        }

        if let Some(length) = response.content_length() {
            if length as usize > self.max_response_bytes {
                return Err(BrokerError::Validation(format!(
                    "discovery response exceeds size ceiling ({} > {} bytes)",
                    length, self.max_response_bytes
                )));
            }
        }

        let bytes = response.bytes().await.map_err(classify_transport_error)?;
        if bytes.len() > self.max_response_bytes {
            return Err(BrokerError::Validation(format!(
                "discovery response exceeds size ceiling ({} > {} bytes)",
                bytes.len(),
                self.max_response_bytes
            )));
        }

        serde_json::from_slice(&bytes)
            .map_err(|e| BrokerError::Validation(format!("malformed discovery payload: {}", e)))
    }

    async fn record_failure(&self, client_id: &str, err: &BrokerError, latency_ms: u64) {
        let record = DiscoveryRecord {
            timestamp: Utc::now(),
            outcome: DiscoveryStatus::Error,
            error_class: err.class(),
            message: Some(err.to_string()),
            latency_ms,
            graph_version: None,
        };
        if let Err(store_err) = self.store.append_discovery_record(client_id, record).await {
            tracing::error!(
                client_id = %client_id,
                error = %store_err,
                "Failed to record discovery failure"
            );
        }
    }
}

fn classify_transport_error(err: reqwest::Error) -> BrokerError {
    if err.is_timeout() {
        BrokerError::Timeout(err.to_string())
    } else if err.is_builder() {
        BrokerError::Configuration(err.to_string())
    } else {
        BrokerError::Network(err.to_string())
    }
}

/// Validate a discovery document against the supported schema and convert it
/// into graph parts. Pure; all failures are `ValidationError`.
pub fn validate_document(
    client_id: &str,
    document: &DiscoveryDocument,
) -> Result<
    (
        Vec<Endpoint>,
        HashMap<String, Vec<FieldMetadata>>,
        DateTime<Utc>,
    ),
    BrokerError,
> {
    if document.app_id != client_id {
        return Err(BrokerError::Validation(format!(
            "app_id mismatch: payload says {} but registration is {}",
            document.app_id, client_id
        )));
    }
    if document.app_name.trim().is_empty() {
        return Err(BrokerError::Validation("app_name is empty".to_string()));
    }
    if document.version != SUPPORTED_DISCOVERY_VERSION {
        return Err(BrokerError::Validation(format!(
            "unsupported discovery schema version {} (expected {})",
            document.version, SUPPORTED_DISCOVERY_VERSION
        )));
    }
    let last_updated = DateTime::parse_from_rfc3339(&document.last_updated)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            BrokerError::Validation(format!(
                "last_updated is not ISO-8601 ({}): {}",
                document.last_updated, e
            ))
        })?;
    if document.endpoints.is_empty() {
        return Err(BrokerError::Validation(
            "discovery payload has no endpoints".to_string(),
        ));
    }

    for endpoint in &document.endpoints {
        if endpoint.path.is_empty()
            || endpoint.method.is_empty()
            || endpoint.resource.is_empty()
            || endpoint.action.is_empty()
        {
            return Err(BrokerError::Validation(format!(
                "endpoint {} {} is missing path, method, resource, or action",
                endpoint.method, endpoint.path
            )));
        }
        for field in &endpoint.response_fields {
            let known = document
                .response_fields
                .get(&endpoint.resource)
                .and_then(|fields| fields.get(field));
            match known {
                Some(meta) => {
                    if Category::from_label(&meta.category).is_none() {
                        return Err(BrokerError::Validation(format!(
                            "field {}.{} has unknown category {}",
                            endpoint.resource, field, meta.category
                        )));
                    }
                }
                None => {
                    return Err(BrokerError::Validation(format!(
                        "endpoint {} {} references undeclared field {}.{}",
                        endpoint.method, endpoint.path, endpoint.resource, field
                    )));
                }
            }
        }
    }

    let mut fields: HashMap<String, Vec<FieldMetadata>> = HashMap::new();
    for (resource, declared) in &document.response_fields {
        let mut list: Vec<FieldMetadata> = Vec::with_capacity(declared.len());
        for (name, meta) in declared {
            let category = Category::from_label(&meta.category).ok_or_else(|| {
                BrokerError::Validation(format!(
                    "field {}.{} has unknown category {}",
                    resource, name, meta.category
                ))
            })?;
            list.push(FieldMetadata {
                name: name.clone(),
                field_type: meta.field_type.clone(),
                category,
                nullable: meta.nullable.unwrap_or(false),
                description: meta.description.clone(),
            });
        }
        list.sort_by(|a, b| a.name.cmp(&b.name));
        fields.insert(resource.clone(), list);
    }

    let endpoints = document
        .endpoints
        .iter()
        .map(|e| Endpoint {
            path: e.path.clone(),
            method: e.method.clone(),
            resource: e.resource.clone(),
            action: e.action.clone(),
            description: e.description.clone(),
            response_fields: e.response_fields.clone(),
        })
        .collect();

    Ok((endpoints, fields, last_updated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtos::discovery::{DiscoveryEndpoint, DiscoveryField};

    fn document(app_id: &str) -> DiscoveryDocument {
        DiscoveryDocument {
            app_id: app_id.to_string(),
            app_name: "HR Portal".into(),
            version: SUPPORTED_DISCOVERY_VERSION.into(),
            last_updated: "2026-08-01T10:00:00Z".into(),
            endpoints: vec![DiscoveryEndpoint {
                path: "/employees".into(),
                method: "GET".into(),
                resource: "employees".into(),
                action: "read".into(),
                description: None,
                response_fields: vec!["email".into()],
            }],
            response_fields: HashMap::from([(
                "employees".to_string(),
                HashMap::from([(
                    "email".to_string(),
                    DiscoveryField {
                        field_type: "string".into(),
                        description: None,
                        category: "pii".into(),
                        nullable: None,
                        searchable: None,
                        filterable: None,
                        max_length: None,
                        format: None,
                    },
                )]),
            )]),
        }
    }

    #[test]
    fn test_valid_document_converts() {
        let (endpoints, fields, _) = validate_document("app_hr", &document("app_hr")).unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(fields["employees"][0].name, "email");
        assert_eq!(fields["employees"][0].category, Category::Pii);
    }

    #[test]
    fn test_app_id_mismatch_is_validation_error() {
        let err = validate_document("app_y", &document("app_x")).unwrap_err();
        assert!(matches!(err, BrokerError::Validation(_)));
        assert_eq!(err.class(), Some(ErrorClass::ValidationError));
    }

    #[test]
    fn test_wrong_schema_version_rejected() {
        let mut doc = document("app_hr");
        doc.version = "1.0".into();
        assert!(matches!(
            validate_document("app_hr", &doc),
            Err(BrokerError::Validation(_))
        ));
    }

    #[test]
    fn test_bad_last_updated_rejected() {
        let mut doc = document("app_hr");
        doc.last_updated = "yesterday".into();
        assert!(validate_document("app_hr", &doc).is_err());
    }

    #[test]
    fn test_empty_endpoints_rejected() {
        let mut doc = document("app_hr");
        doc.endpoints.clear();
        assert!(validate_document("app_hr", &doc).is_err());
    }

    #[test]
    fn test_undeclared_field_reference_rejected() {
        let mut doc = document("app_hr");
        doc.endpoints[0].response_fields.push("ghost".into());
        let err = validate_document("app_hr", &doc).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_unknown_category_rejected() {
        let mut doc = document("app_hr");
        doc.response_fields
            .get_mut("employees")
            .unwrap()
            .get_mut("email")
            .unwrap()
            .category = "secret".into();
        assert!(validate_document("app_hr", &doc).is_err());
    }

    #[test]
    fn test_idempotent_validation() {
        let doc = document("app_hr");
        let a = validate_document("app_hr", &doc).unwrap();
        let b = validate_document("app_hr", &doc).unwrap();
        assert_eq!(a.0.len(), b.0.len());
        assert_eq!(a.1["employees"].len(), b.1["employees"].len());
        assert_eq!(a.2, b.2);
    }
}
