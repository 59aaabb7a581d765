//! Persistence boundary for broker state.
//!
//! The store is a collaborator with transactional guarantees assumed: each
//! trait method is one consistency unit (a role upsert lands with all its
//! grants and filters or not at all; refresh rotation is atomic). The
//! in-memory implementation keeps everything under a single `RwLock`, which
//! gives those guarantees trivially and backs the integration tests.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

use crate::models::{
    A2aPermission, ApiCredential, Application, AuditEvent, DiscoveryRecord, GroupRoleMapping,
    RefreshRecord, Role,
};
use crate::services::error::BrokerError;

/// Retained discovery-history entries per application.
pub const DISCOVERY_HISTORY_CAP: usize = 100;

/// Outcome of an atomic refresh rotation.
#[derive(Debug)]
pub enum RotateOutcome {
    /// Old token superseded, new token recorded.
    Rotated,
    /// The presented token was already superseded: replay. The whole chain
    /// has been marked revoked; the revocation index still needs the jtis.
    Reuse { revoked_jtis: Vec<String> },
}

#[async_trait]
pub trait BrokerStore: Send + Sync {
    // Applications
    async fn upsert_application(&self, app: Application) -> Result<(), BrokerError>;
    async fn get_application(&self, client_id: &str) -> Result<Option<Application>, BrokerError>;
    async fn list_applications(&self) -> Result<Vec<Application>, BrokerError>;
    async fn deactivate_application(&self, client_id: &str) -> Result<bool, BrokerError>;
    async fn set_credential(
        &self,
        client_id: &str,
        credential: ApiCredential,
    ) -> Result<(), BrokerError>;
    async fn find_application_by_lookup_hash(
        &self,
        lookup_hash: &str,
    ) -> Result<Option<Application>, BrokerError>;
    async fn touch_credential_usage(&self, client_id: &str) -> Result<(), BrokerError>;

    // Roles (one upsert = role + grants + filters, transactionally)
    async fn upsert_role(&self, role: Role) -> Result<(), BrokerError>;
    async fn get_role(
        &self,
        client_id: &str,
        role_name: &str,
    ) -> Result<Option<Role>, BrokerError>;
    async fn delete_role(&self, client_id: &str, role_name: &str) -> Result<bool, BrokerError>;
    async fn roles_for_client(&self, client_id: &str) -> Result<Vec<Role>, BrokerError>;

    // Group -> role mappings
    async fn upsert_mapping(&self, mapping: GroupRoleMapping) -> Result<(), BrokerError>;
    async fn delete_mapping(
        &self,
        client_id: &str,
        group_name: &str,
        role_name: &str,
    ) -> Result<bool, BrokerError>;
    async fn mappings_for_client(
        &self,
        client_id: &str,
    ) -> Result<Vec<GroupRoleMapping>, BrokerError>;

    // A2A allow-list
    async fn upsert_a2a_permission(&self, permission: A2aPermission) -> Result<(), BrokerError>;
    async fn get_a2a_permission(
        &self,
        source_client_id: &str,
        target_client_id: &str,
    ) -> Result<Option<A2aPermission>, BrokerError>;
    async fn delete_a2a_permission(
        &self,
        source_client_id: &str,
        target_client_id: &str,
    ) -> Result<bool, BrokerError>;
    async fn list_a2a_permissions(&self) -> Result<Vec<A2aPermission>, BrokerError>;

    // Refresh-token chain tracking
    async fn insert_refresh(&self, record: RefreshRecord) -> Result<(), BrokerError>;
    async fn get_refresh_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshRecord>, BrokerError>;
    /// Atomically supersede `old_hash` and record `new`. Replay of an
    /// already-superseded token revokes the entire chain.
    async fn rotate_refresh(
        &self,
        old_hash: &str,
        new: RefreshRecord,
    ) -> Result<RotateOutcome, BrokerError>;
    /// Revoke every record in the chain containing `token_hash`; returns the
    /// jtis that were revoked.
    async fn revoke_refresh_chain(&self, token_hash: &str) -> Result<Vec<String>, BrokerError>;
    async fn purge_expired_refresh(&self) -> Result<u64, BrokerError>;

    // Audit trail (append-only)
    async fn append_audit(&self, event: AuditEvent) -> Result<(), BrokerError>;
    async fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEvent>, BrokerError>;

    // Discovery history (bounded per app)
    async fn append_discovery_record(
        &self,
        client_id: &str,
        record: DiscoveryRecord,
    ) -> Result<(), BrokerError>;
    async fn discovery_history(
        &self,
        client_id: &str,
    ) -> Result<Vec<DiscoveryRecord>, BrokerError>;
}

#[derive(Default)]
struct Inner {
    applications: HashMap<String, Application>,
    roles: HashMap<(String, String), Role>,
    mappings: HashMap<(String, String, String), GroupRoleMapping>,
    a2a: HashMap<(String, String), A2aPermission>,
    refresh: HashMap<String, RefreshRecord>,
    audit: Vec<AuditEvent>,
    discovery_history: HashMap<String, VecDeque<DiscoveryRecord>>,
}

impl Inner {
    /// Hashes of every record in the chain containing `token_hash`,
    /// following parent links in both directions.
    fn chain_hashes(&self, token_hash: &str) -> Vec<String> {
        let mut chain = vec![token_hash.to_string()];

        // Walk back through ancestors.
        let mut cursor = self
            .refresh
            .get(token_hash)
            .and_then(|r| r.parent_token_hash.clone());
        while let Some(parent) = cursor {
            if chain.contains(&parent) {
                break;
            }
            chain.push(parent.clone());
            cursor = self
                .refresh
                .get(&parent)
                .and_then(|r| r.parent_token_hash.clone());
        }

        // Walk forward through descendants.
        let mut frontier = chain.clone();
        while let Some(hash) = frontier.pop() {
            for (child_hash, record) in &self.refresh {
                if record.parent_token_hash.as_deref() == Some(hash.as_str())
                    && !chain.contains(child_hash)
                {
                    chain.push(child_hash.clone());
                    frontier.push(child_hash.clone());
                }
            }
        }

        chain
    }
}

/// In-memory reference implementation of [`BrokerStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BrokerStore for MemoryStore {
    async fn upsert_application(&self, app: Application) -> Result<(), BrokerError> {
        let mut inner = self.inner.write().await;
        inner.applications.insert(app.client_id.clone(), app);
        Ok(())
    }

    async fn get_application(&self, client_id: &str) -> Result<Option<Application>, BrokerError> {
        let inner = self.inner.read().await;
        Ok(inner.applications.get(client_id).cloned())
    }

    async fn list_applications(&self) -> Result<Vec<Application>, BrokerError> {
        let inner = self.inner.read().await;
        let mut apps: Vec<_> = inner.applications.values().cloned().collect();
        apps.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        Ok(apps)
    }

    async fn deactivate_application(&self, client_id: &str) -> Result<bool, BrokerError> {
        let mut inner = self.inner.write().await;
        match inner.applications.get_mut(client_id) {
            Some(app) => {
                app.is_active = false;
                app.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_credential(
        &self,
        client_id: &str,
        credential: ApiCredential,
    ) -> Result<(), BrokerError> {
        let mut inner = self.inner.write().await;
        let app = inner
            .applications
            .get_mut(client_id)
            .ok_or_else(|| BrokerError::NotFound(format!("unknown application {}", client_id)))?;
        app.credential = Some(credential);
        app.updated_at = Utc::now();
        Ok(())
    }

    async fn find_application_by_lookup_hash(
        &self,
        lookup_hash: &str,
    ) -> Result<Option<Application>, BrokerError> {
        let inner = self.inner.read().await;
        Ok(inner
            .applications
            .values()
            .find(|app| {
                app.credential.as_ref().is_some_and(|c| {
                    c.api_key_lookup_hash == lookup_hash
                        || c.previous_api_key_lookup_hash.as_deref() == Some(lookup_hash)
                })
            })
            .cloned())
    }

    async fn touch_credential_usage(&self, client_id: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.write().await;
        if let Some(cred) = inner
            .applications
            .get_mut(client_id)
            .and_then(|a| a.credential.as_mut())
        {
            cred.last_used_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn upsert_role(&self, role: Role) -> Result<(), BrokerError> {
        let mut inner = self.inner.write().await;
        inner
            .roles
            .insert((role.client_id.clone(), role.role_name.clone()), role);
        Ok(())
    }

    async fn get_role(
        &self,
        client_id: &str,
        role_name: &str,
    ) -> Result<Option<Role>, BrokerError> {
        let inner = self.inner.read().await;
        Ok(inner
            .roles
            .get(&(client_id.to_string(), role_name.to_string()))
            .cloned())
    }

    async fn delete_role(&self, client_id: &str, role_name: &str) -> Result<bool, BrokerError> {
        let mut inner = self.inner.write().await;
        let removed = inner
            .roles
            .remove(&(client_id.to_string(), role_name.to_string()))
            .is_some();
        if removed {
            // Mappings pointing at the removed role go with it.
            inner
                .mappings
                .retain(|_, m| !(m.client_id == client_id && m.role_name == role_name));
        }
        Ok(removed)
    }

    async fn roles_for_client(&self, client_id: &str) -> Result<Vec<Role>, BrokerError> {
        let inner = self.inner.read().await;
        let mut roles: Vec<_> = inner
            .roles
            .values()
            .filter(|r| r.client_id == client_id)
            .cloned()
            .collect();
        roles.sort_by(|a, b| a.role_name.cmp(&b.role_name));
        Ok(roles)
    }

    async fn upsert_mapping(&self, mapping: GroupRoleMapping) -> Result<(), BrokerError> {
        let mut inner = self.inner.write().await;
        let key = (
            mapping.client_id.clone(),
            mapping.group_name.clone(),
            mapping.role_name.clone(),
        );
        if !inner
            .roles
            .contains_key(&(mapping.client_id.clone(), mapping.role_name.clone()))
        {
            return Err(BrokerError::Validation(format!(
                "mapping references unknown role {} for {}",
                mapping.role_name, mapping.client_id
            )));
        }
        inner.mappings.insert(key, mapping);
        Ok(())
    }

    async fn delete_mapping(
        &self,
        client_id: &str,
        group_name: &str,
        role_name: &str,
    ) -> Result<bool, BrokerError> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .mappings
            .remove(&(
                client_id.to_string(),
                group_name.to_string(),
                role_name.to_string(),
            ))
            .is_some())
    }

    async fn mappings_for_client(
        &self,
        client_id: &str,
    ) -> Result<Vec<GroupRoleMapping>, BrokerError> {
        let inner = self.inner.read().await;
        let mut mappings: Vec<_> = inner
            .mappings
            .values()
            .filter(|m| m.client_id == client_id)
            .cloned()
            .collect();
        mappings.sort_by(|a, b| {
            (a.group_name.as_str(), a.role_name.as_str())
                .cmp(&(b.group_name.as_str(), b.role_name.as_str()))
        });
        Ok(mappings)
    }

    async fn upsert_a2a_permission(&self, permission: A2aPermission) -> Result<(), BrokerError> {
        let mut inner = self.inner.write().await;
        inner.a2a.insert(
            (
                permission.source_client_id.clone(),
                permission.target_client_id.clone(),
            ),
            permission,
        );
        Ok(())
    }

    async fn get_a2a_permission(
        &self,
        source_client_id: &str,
        target_client_id: &str,
    ) -> Result<Option<A2aPermission>, BrokerError> {
        let inner = self.inner.read().await;
        Ok(inner
            .a2a
            .get(&(source_client_id.to_string(), target_client_id.to_string()))
            .cloned())
    }

    async fn delete_a2a_permission(
        &self,
        source_client_id: &str,
        target_client_id: &str,
    ) -> Result<bool, BrokerError> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .a2a
            .remove(&(source_client_id.to_string(), target_client_id.to_string()))
            .is_some())
    }

    async fn list_a2a_permissions(&self) -> Result<Vec<A2aPermission>, BrokerError> {
        let inner = self.inner.read().await;
        let mut list: Vec<_> = inner.a2a.values().cloned().collect();
        list.sort_by(|a, b| {
            (a.source_client_id.as_str(), a.target_client_id.as_str())
                .cmp(&(b.source_client_id.as_str(), b.target_client_id.as_str()))
        });
        Ok(list)
    }

    async fn insert_refresh(&self, record: RefreshRecord) -> Result<(), BrokerError> {
        let mut inner = self.inner.write().await;
        inner.refresh.insert(record.token_hash.clone(), record);
        Ok(())
    }

    async fn get_refresh_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshRecord>, BrokerError> {
        let inner = self.inner.read().await;
        Ok(inner.refresh.get(token_hash).cloned())
    }

    async fn rotate_refresh(
        &self,
        old_hash: &str,
        new: RefreshRecord,
    ) -> Result<RotateOutcome, BrokerError> {
        let mut inner = self.inner.write().await;

        let old = match inner.refresh.get(old_hash) {
            Some(r) => r.clone(),
            None => {
                return Err(BrokerError::Authentication(
                    "unknown refresh token".to_string(),
                ))
            }
        };

        if old.revoked {
            return Err(BrokerError::Revoked);
        }
        if old.is_expired() {
            return Err(BrokerError::Expired);
        }
        if old.superseded {
            // Replay of a rotated-away token: kill the whole chain.
            let chain = inner.chain_hashes(old_hash);
            let mut revoked_jtis = Vec::new();
            for hash in chain {
                if let Some(record) = inner.refresh.get_mut(&hash) {
                    if !record.revoked {
                        record.revoked = true;
                        revoked_jtis.push(record.jti.clone());
                    }
                }
            }
            return Ok(RotateOutcome::Reuse { revoked_jtis });
        }

        // Supersede-old and insert-new as one unit.
        if let Some(record) = inner.refresh.get_mut(old_hash) {
            record.superseded = true;
        }
        inner.refresh.insert(new.token_hash.clone(), new);
        Ok(RotateOutcome::Rotated)
    }

    async fn revoke_refresh_chain(&self, token_hash: &str) -> Result<Vec<String>, BrokerError> {
        let mut inner = self.inner.write().await;
        let chain = inner.chain_hashes(token_hash);
        let mut revoked = Vec::new();
        for hash in chain {
            if let Some(record) = inner.refresh.get_mut(&hash) {
                if !record.revoked {
                    record.revoked = true;
                    revoked.push(record.jti.clone());
                }
            }
        }
        Ok(revoked)
    }

    async fn purge_expired_refresh(&self) -> Result<u64, BrokerError> {
        let mut inner = self.inner.write().await;
        let before = inner.refresh.len();
        inner.refresh.retain(|_, r| !r.is_expired());
        Ok((before - inner.refresh.len()) as u64)
    }

    async fn append_audit(&self, event: AuditEvent) -> Result<(), BrokerError> {
        let mut inner = self.inner.write().await;
        inner.audit.push(event);
        Ok(())
    }

    async fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEvent>, BrokerError> {
        let inner = self.inner.read().await;
        Ok(inner.audit.iter().rev().take(limit).cloned().collect())
    }

    async fn append_discovery_record(
        &self,
        client_id: &str,
        record: DiscoveryRecord,
    ) -> Result<(), BrokerError> {
        let mut inner = self.inner.write().await;
        let history = inner
            .discovery_history
            .entry(client_id.to_string())
            .or_default();
        history.push_back(record);
        while history.len() > DISCOVERY_HISTORY_CAP {
            history.pop_front();
        }
        Ok(())
    }

    async fn discovery_history(
        &self,
        client_id: &str,
    ) -> Result<Vec<DiscoveryRecord>, BrokerError> {
        let inner = self.inner.read().await;
        Ok(inner
            .discovery_history
            .get(client_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DiscoveryStatus;
    use chrono::Duration;

    fn refresh(jti: &str, token: &str, parent: Option<&str>) -> RefreshRecord {
        RefreshRecord::new(
            jti.to_string(),
            "user-1".into(),
            "app_x".into(),
            token,
            parent.map(|p| RefreshRecord::hash_token(p)),
            Utc::now() + Duration::days(7),
        )
    }

    #[tokio::test]
    async fn test_rotate_refresh_happy_path() {
        let store = MemoryStore::new();
        let first = refresh("jti-1", "tok-1", None);
        let first_hash = first.token_hash.clone();
        store.insert_refresh(first).await.unwrap();

        let second = refresh("jti-2", "tok-2", Some("tok-1"));
        let outcome = store.rotate_refresh(&first_hash, second).await.unwrap();
        assert!(matches!(outcome, RotateOutcome::Rotated));

        let old = store.get_refresh_by_hash(&first_hash).await.unwrap().unwrap();
        assert!(old.superseded);
    }

    #[tokio::test]
    async fn test_rotate_refresh_replay_revokes_chain() {
        let store = MemoryStore::new();
        let first = refresh("jti-1", "tok-1", None);
        let first_hash = first.token_hash.clone();
        store.insert_refresh(first).await.unwrap();

        let second = refresh("jti-2", "tok-2", Some("tok-1"));
        store
            .rotate_refresh(&first_hash, second)
            .await
            .unwrap();

        // Replay the superseded token.
        let third = refresh("jti-3", "tok-3", Some("tok-1"));
        let outcome = store.rotate_refresh(&first_hash, third).await.unwrap();
        match outcome {
            RotateOutcome::Reuse { revoked_jtis } => {
                assert!(revoked_jtis.contains(&"jti-1".to_string()));
                assert!(revoked_jtis.contains(&"jti-2".to_string()));
            }
            RotateOutcome::Rotated => panic!("replay must not rotate"),
        }

        // The descendant is now unusable too.
        let second_hash = RefreshRecord::hash_token("tok-2");
        let second = store.get_refresh_by_hash(&second_hash).await.unwrap().unwrap();
        assert!(second.revoked);
    }

    #[tokio::test]
    async fn test_delete_role_cascades_mappings() {
        let store = MemoryStore::new();
        store
            .upsert_role(Role::new("app_x".into(), "viewer".into()))
            .await
            .unwrap();
        store
            .upsert_mapping(GroupRoleMapping {
                client_id: "app_x".into(),
                group_name: "Readers".into(),
                role_name: "viewer".into(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        assert!(store.delete_role("app_x", "viewer").await.unwrap());
        assert!(store
            .mappings_for_client("app_x")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_mapping_requires_existing_role() {
        let store = MemoryStore::new();
        let err = store
            .upsert_mapping(GroupRoleMapping {
                client_id: "app_x".into(),
                group_name: "Readers".into(),
                role_name: "ghost".into(),
                created_at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Validation(_)));
    }

    #[tokio::test]
    async fn test_discovery_history_is_bounded() {
        let store = MemoryStore::new();
        for i in 0..(DISCOVERY_HISTORY_CAP + 20) {
            store
                .append_discovery_record(
                    "app_x",
                    DiscoveryRecord {
                        timestamp: Utc::now(),
                        outcome: DiscoveryStatus::Success,
                        error_class: None,
                        message: Some(format!("round {}", i)),
                        latency_ms: 1,
                        graph_version: None,
                    },
                )
                .await
                .unwrap();
        }
        let history = store.discovery_history("app_x").await.unwrap();
        assert_eq!(history.len(), DISCOVERY_HISTORY_CAP);
        // Oldest entries were dropped.
        assert_eq!(history[0].message.as_deref(), Some("round 20"));
    }

    #[tokio::test]
    async fn test_find_application_by_previous_lookup_hash() {
        let store = MemoryStore::new();
        let mut app = Application::new(
            "app_x".into(),
            "X".into(),
            "owner".into(),
            vec![],
            None,
            false,
        );
        let mut cred = ApiCredential::new("argon".into(), "current-hash".into());
        cred.previous_api_key_lookup_hash = Some("old-hash".into());
        app.credential = Some(cred);
        store.upsert_application(app).await.unwrap();

        assert!(store
            .find_application_by_lookup_hash("old-hash")
            .await
            .unwrap()
            .is_some());
        assert!(store
            .find_application_by_lookup_hash("nope")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_audit_is_append_only_and_recent_first() {
        let store = MemoryStore::new();
        store
            .append_audit(AuditEvent::new("token_issued").subject("u1"))
            .await
            .unwrap();
        store
            .append_audit(AuditEvent::new("token_revoked").subject("u1"))
            .await
            .unwrap();
        let events = store.recent_audit(10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "token_revoked");
    }
}
