//! Permission resolution through the store-backed resolver: group matching,
//! defaults, deny-wins across roles, and RLS filter snapshots in tokens.

mod common;

use broker_service::models::{Category, FilterOperator, GrantScope, RlsFilter};
use broker_service::services::BrokerStore;
use common::{TestBroker, allow, deny, principal};

#[tokio::test]
async fn groups_map_to_roles_by_exact_display_name() {
    let broker = TestBroker::spawn().await;
    broker.register_app("app_hr", None).await;
    broker.seed_hr_graph("app_hr");
    broker
        .seed_role(
            "app_hr",
            "HR_Manager",
            vec![allow(
                "employees",
                "read",
                GrantScope::Category(Category::Pii),
            )],
        )
        .await;
    broker.map_group("app_hr", "HR Managers", "HR_Manager").await;

    // Exact match resolves.
    let resolved = broker
        .state
        .resolver
        .resolve(&["HR Managers".to_string()], "app_hr")
        .await
        .unwrap();
    assert_eq!(resolved.roles, vec!["HR_Manager".to_string()]);

    // Case or partial matches do not.
    let resolved = broker
        .state
        .resolver
        .resolve(&["hr managers".to_string()], "app_hr")
        .await
        .unwrap();
    assert!(resolved.roles.is_empty());
}

#[tokio::test]
async fn deny_from_one_role_wins_across_the_composition() {
    let broker = TestBroker::spawn().await;
    broker.register_app("app_hr", None).await;
    broker.seed_hr_graph("app_hr");
    broker
        .seed_role(
            "app_hr",
            "reader",
            vec![allow(
                "employees",
                "read",
                GrantScope::Category(Category::Pii),
            )],
        )
        .await;
    broker
        .seed_role(
            "app_hr",
            "privacy_guard",
            vec![deny("employees", "read", GrantScope::Field("email".into()))],
        )
        .await;
    broker.map_group("app_hr", "Staff", "reader").await;
    broker.map_group("app_hr", "Staff", "privacy_guard").await;

    let resolved = broker
        .state
        .resolver
        .resolve(&["Staff".to_string()], "app_hr")
        .await
        .unwrap();
    assert!(!resolved.permissions.iter().any(|p| p.contains("email")));
    assert!(resolved
        .permissions
        .contains(&"employees.read.phone".to_string()));
}

#[tokio::test]
async fn default_role_applies_to_everyone_and_inactive_roles_do_not() {
    let broker = TestBroker::spawn().await;
    broker.register_app("app_hr", None).await;
    broker.seed_hr_graph("app_hr");

    let mut everyone = broker
        .seed_role(
            "app_hr",
            "everyone",
            vec![allow(
                "employees",
                "read",
                GrantScope::Category(Category::Base),
            )],
        )
        .await;
    everyone.is_default = true;
    broker.state.store.upsert_role(everyone).await.unwrap();

    let mut retired = broker
        .seed_role(
            "app_hr",
            "retired",
            vec![allow("employees", "read", GrantScope::Wildcard)],
        )
        .await;
    retired.is_active = false;
    broker.state.store.upsert_role(retired).await.unwrap();
    broker.map_group("app_hr", "Staff", "retired").await;

    let resolved = broker
        .state
        .resolver
        .resolve(&["Staff".to_string()], "app_hr")
        .await
        .unwrap();
    // Default contributes; the inactive role does not.
    assert_eq!(resolved.permissions, vec!["employees.read".to_string()]);
    assert_eq!(resolved.roles, vec!["everyone".to_string()]);
}

#[tokio::test]
async fn a2a_only_roles_never_resolve_for_users() {
    let broker = TestBroker::spawn().await;
    broker.register_app("app_hr", None).await;
    broker.seed_hr_graph("app_hr");

    let mut machine = broker
        .seed_role(
            "app_hr",
            "machine",
            vec![allow("employees", "read", GrantScope::Wildcard)],
        )
        .await;
    machine.a2a_only = true;
    broker.state.store.upsert_role(machine).await.unwrap();
    broker.map_group("app_hr", "Staff", "machine").await;

    let resolved = broker
        .state
        .resolver
        .resolve(&["Staff".to_string()], "app_hr")
        .await
        .unwrap();
    assert!(resolved.permissions.is_empty());
}

#[tokio::test]
async fn rls_filters_are_snapshotted_into_issued_tokens() {
    let broker = TestBroker::spawn().await;
    let app = broker.register_app("app_hr", None).await;
    broker.seed_hr_graph("app_hr");

    let mut role = broker
        .seed_role(
            "app_hr",
            "regional",
            vec![allow(
                "employees",
                "read",
                GrantScope::Category(Category::Pii),
            )],
        )
        .await;
    role.rls_filters = vec![RlsFilter {
        resource: "employees".into(),
        field: None,
        expression: "manager_email = @current_user_email".into(),
        operator: FilterOperator::And,
        priority: 0,
    }];
    broker.state.store.upsert_role(role).await.unwrap();
    broker.map_group("app_hr", "Staff", "regional").await;

    let user = principal("erin", &["Staff"]);
    let resolved = broker
        .state
        .resolver
        .resolve(&user.groups, "app_hr")
        .await
        .unwrap();
    let pair = broker
        .state
        .tokens
        .issue_user_tokens(&user, &app, &resolved, None, None)
        .await
        .unwrap();
    let claims = broker
        .state
        .tokens
        .validate(&pair.access_token, "app_hr", None, None)
        .await
        .unwrap();

    let filters = claims.rls_filters.get("employees.read").unwrap();
    assert_eq!(filters.len(), 1);
    assert_eq!(filters[0].expression, "manager_email = @current_user_email");
    assert_eq!(filters[0].operator, FilterOperator::And);

    // Editing the stored filter does not change the issued snapshot.
    let mut edited = broker
        .state
        .store
        .get_role("app_hr", "regional")
        .await
        .unwrap()
        .unwrap();
    edited.rls_filters[0].expression = "1 = 1".into();
    broker.state.store.upsert_role(edited).await.unwrap();

    let claims = broker
        .state
        .tokens
        .validate(&pair.access_token, "app_hr", None, None)
        .await
        .unwrap();
    assert_eq!(
        claims.rls_filters.get("employees.read").unwrap()[0].expression,
        "manager_email = @current_user_email"
    );
}

#[tokio::test]
async fn resolution_is_scoped_to_the_target_application() {
    let broker = TestBroker::spawn().await;
    broker.register_app("app_hr", None).await;
    broker.register_app("app_billing", None).await;
    broker.seed_hr_graph("app_hr");
    broker
        .seed_role(
            "app_hr",
            "viewer",
            vec![allow(
                "employees",
                "read",
                GrantScope::Category(Category::Base),
            )],
        )
        .await;
    broker.map_group("app_hr", "Staff", "viewer").await;

    let resolved = broker
        .state
        .resolver
        .resolve(&["Staff".to_string()], "app_billing")
        .await
        .unwrap();
    assert!(resolved.permissions.is_empty());
    assert!(resolved.roles.is_empty());
}
