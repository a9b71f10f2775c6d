use std::collections::HashMap;
use std::sync::Arc;

use consentkeeper_backend::{
    db::connection::StoreTarget,
    models::mapping::{MAPPING_STATUS_ACTIVE, MAPPING_STATUS_INACTIVE},
    repositories::audit::StatusAuditFilters,
    repositories::detailed::ConsentSearchFilters,
    services::consent_core::{
        ApplicableConsentsQuery, ConsentRevocation, ExclusiveCreateParams, ReAuthorization,
    },
    services::notifier::TracingNotifier,
};

#[path = "support/mod.rs"]
mod support;

use support::RecordingNotifier;

#[tokio::test]
async fn create_consent_with_implicit_auth_writes_one_audit_record() {
    let _guard = support::integration_guard().await;
    let Some(pool) = support::test_pool().await else {
        eprintln!("skipping: TEST_DATABASE_URL not set");
        return;
    };
    support::reset(&pool).await;

    let notifier = RecordingNotifier::default();
    let service = support::service(&pool, Arc::new(notifier.clone()));

    let detailed = service
        .create_consent(support::create_request("AwaitingAuthorisation"))
        .await
        .expect("create consent");

    assert!(!detailed.consent_id.is_nil());
    assert_eq!(detailed.current_status, "AwaitingAuthorisation");
    assert_eq!(detailed.authorizations.len(), 1);
    assert_eq!(detailed.authorizations[0].authorization_status, "Created");
    assert_eq!(
        detailed.authorizations[0].user_id.as_deref(),
        Some("user-1")
    );

    let audits = service
        .search_consent_status_audit_records(StatusAuditFilters {
            consent_id: Some(detailed.consent_id),
            ..Default::default()
        })
        .await
        .expect("search audit records");
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].current_status, "AwaitingAuthorisation");
    assert_eq!(audits[0].previous_status, None);

    let events = notifier.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].previous_status, None);
    assert_eq!(events[0].new_status, "AwaitingAuthorisation");
}

#[tokio::test]
async fn failed_create_writes_no_rows() {
    let _guard = support::integration_guard().await;
    let Some(pool) = support::test_pool().await else {
        eprintln!("skipping: TEST_DATABASE_URL not set");
        return;
    };
    support::reset(&pool).await;

    let service = support::service(&pool, Arc::new(TracingNotifier));
    let mut request = support::create_request("AwaitingAuthorisation");
    request.consent.receipt = String::new();
    service
        .create_consent(request)
        .await
        .expect_err("blank receipt must be rejected");

    let all = service
        .search_detailed_consents(ConsentSearchFilters::default(), StoreTarget::Live)
        .await
        .expect("search consents");
    assert!(all.is_empty());
}

#[tokio::test]
async fn revoke_deactivates_every_mapping_and_audits_the_transition() {
    let _guard = support::integration_guard().await;
    let Some(pool) = support::test_pool().await else {
        eprintln!("skipping: TEST_DATABASE_URL not set");
        return;
    };
    support::reset(&pool).await;

    let service = support::service(&pool, Arc::new(TracingNotifier));
    let created = service
        .create_consent(support::create_request("AwaitingAuthorisation"))
        .await
        .expect("create consent");
    let auth_id = created.authorizations[0].authorization_id;

    service
        .re_authorize_existing_auth_resource(ReAuthorization {
            consent_id: created.consent_id,
            authorization_id: auth_id,
            user_id: "user-1".to_string(),
            account_permissions: support::account_permissions(&["acc-1", "acc-2"]),
            new_consent_status: "Authorised".to_string(),
        })
        .await
        .expect("re-authorize");

    let revoked = service
        .revoke_consent_with_reason(ConsentRevocation {
            consent_id: created.consent_id,
            revoked_status: "Revoked".to_string(),
            reason: "user requested".to_string(),
            user_id: Some("user-1".to_string()),
            should_revoke_tokens: false,
        })
        .await
        .expect("revoke consent");

    assert_eq!(revoked.current_status, "Revoked");
    assert_eq!(revoked.mappings.len(), 2);
    assert!(revoked
        .mappings
        .iter()
        .all(|m| m.mapping_status == MAPPING_STATUS_INACTIVE));

    let audits = service
        .search_consent_status_audit_records(StatusAuditFilters {
            consent_id: Some(created.consent_id),
            status: Some("Revoked".to_string()),
            ..Default::default()
        })
        .await
        .expect("search audit records");
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].previous_status.as_deref(), Some("Authorised"));
    assert_eq!(audits[0].reason, "user requested");
}

#[tokio::test]
async fn re_authorization_applies_only_the_account_delta() {
    let _guard = support::integration_guard().await;
    let Some(pool) = support::test_pool().await else {
        eprintln!("skipping: TEST_DATABASE_URL not set");
        return;
    };
    support::reset(&pool).await;

    let service = support::service(&pool, Arc::new(TracingNotifier));
    let created = service
        .create_consent(support::create_request("AwaitingAuthorisation"))
        .await
        .expect("create consent");
    let auth_id = created.authorizations[0].authorization_id;

    // Existing active accounts: {B, C}.
    let first = service
        .re_authorize_existing_auth_resource(ReAuthorization {
            consent_id: created.consent_id,
            authorization_id: auth_id,
            user_id: "user-1".to_string(),
            account_permissions: support::account_permissions(&["B", "C"]),
            new_consent_status: "Authorised".to_string(),
        })
        .await
        .expect("first re-authorization");
    let b_mapping_id = first
        .mappings
        .iter()
        .find(|m| m.account_id == "B")
        .expect("mapping for B")
        .mapping_id;

    // Desired accounts: {A, B}.
    let second = service
        .re_authorize_existing_auth_resource(ReAuthorization {
            consent_id: created.consent_id,
            authorization_id: auth_id,
            user_id: "user-1".to_string(),
            account_permissions: support::account_permissions(&["A", "B"]),
            new_consent_status: "Authorised".to_string(),
        })
        .await
        .expect("second re-authorization");

    let mapping_for = |account: &str| {
        second
            .mappings
            .iter()
            .find(|m| m.account_id == account)
            .unwrap_or_else(|| panic!("mapping for {}", account))
    };
    assert_eq!(mapping_for("C").mapping_status, MAPPING_STATUS_INACTIVE);
    assert_eq!(mapping_for("A").mapping_status, MAPPING_STATUS_ACTIVE);
    let b_mapping = mapping_for("B");
    assert_eq!(b_mapping.mapping_status, MAPPING_STATUS_ACTIVE);
    assert_eq!(b_mapping.mapping_id, b_mapping_id);
}

#[tokio::test]
async fn exclusive_create_supersedes_applicable_consents() {
    let _guard = support::integration_guard().await;
    let Some(pool) = support::test_pool().await else {
        eprintln!("skipping: TEST_DATABASE_URL not set");
        return;
    };
    support::reset(&pool).await;

    let service = support::service(&pool, Arc::new(TracingNotifier));
    let existing = service
        .create_consent(support::create_request("Authorised"))
        .await
        .expect("create existing consent");
    let auth_id = existing.authorizations[0].authorization_id;
    service
        .re_authorize_existing_auth_resource(ReAuthorization {
            consent_id: existing.consent_id,
            authorization_id: auth_id,
            user_id: "user-1".to_string(),
            account_permissions: support::account_permissions(&["acc-1"]),
            new_consent_status: "Authorised".to_string(),
        })
        .await
        .expect("bind an account");

    let fresh = service
        .create_exclusive_consent(
            support::create_request("AwaitingAuthorisation"),
            ExclusiveCreateParams {
                applicable_status: "Authorised".to_string(),
                transitioned_status: "Revoked".to_string(),
                transition_reason: "Superseded by a new consent".to_string(),
            },
        )
        .await
        .expect("create exclusive consent");

    let superseded = service
        .get_detailed_consent(existing.consent_id)
        .await
        .expect("read superseded consent");
    assert_eq!(superseded.current_status, "Revoked");
    assert!(superseded
        .mappings
        .iter()
        .all(|m| m.mapping_status == MAPPING_STATUS_INACTIVE));

    let current = service
        .get_detailed_consent(fresh.consent_id)
        .await
        .expect("read fresh consent");
    assert_eq!(current.current_status, "AwaitingAuthorisation");
}

#[tokio::test]
async fn bulk_revoke_transitions_every_applicable_consent() {
    let _guard = support::integration_guard().await;
    let Some(pool) = support::test_pool().await else {
        eprintln!("skipping: TEST_DATABASE_URL not set");
        return;
    };
    support::reset(&pool).await;

    let service = support::service(&pool, Arc::new(TracingNotifier));
    for _ in 0..2 {
        service
            .create_consent(support::create_request("Authorised"))
            .await
            .expect("create consent");
    }

    let transitioned = service
        .revoke_existing_applicable_consents(
            ApplicableConsentsQuery {
                client_id: "client-1".to_string(),
                user_id: "user-1".to_string(),
                consent_type: "accounts".to_string(),
                applicable_status: "Authorised".to_string(),
                new_status: "Revoked".to_string(),
                reason: "bulk revoke".to_string(),
            },
            false,
        )
        .await
        .expect("bulk revoke");
    assert_eq!(transitioned, 2);

    let still_authorised = service
        .search_detailed_consents(
            ConsentSearchFilters {
                consent_statuses: vec!["Authorised".to_string()],
                ..Default::default()
            },
            StoreTarget::Live,
        )
        .await
        .expect("search");
    assert!(still_authorised.is_empty());
}

#[tokio::test]
async fn search_without_filters_returns_all_consents() {
    let _guard = support::integration_guard().await;
    let Some(pool) = support::test_pool().await else {
        eprintln!("skipping: TEST_DATABASE_URL not set");
        return;
    };
    support::reset(&pool).await;

    let service = support::service(&pool, Arc::new(TracingNotifier));
    let mut other = support::create_request("Authorised");
    other.consent.client_id = "client-2".to_string();
    other.user_id = Some("user-2".to_string());
    service
        .create_consent(support::create_request("AwaitingAuthorisation"))
        .await
        .expect("create first");
    service.create_consent(other).await.expect("create second");

    let all = service
        .search_detailed_consents(ConsentSearchFilters::default(), StoreTarget::Live)
        .await
        .expect("unfiltered search");
    assert_eq!(all.len(), 2);

    let by_client = service
        .search_detailed_consents(
            ConsentSearchFilters {
                client_ids: vec!["client-2".to_string()],
                ..Default::default()
            },
            StoreTarget::Live,
        )
        .await
        .expect("client-filtered search");
    assert_eq!(by_client.len(), 1);
    assert_eq!(by_client[0].client_id, "client-2");

    let by_user = service
        .search_detailed_consents(
            ConsentSearchFilters {
                user_ids: vec!["user-1".to_string()],
                ..Default::default()
            },
            StoreTarget::Live,
        )
        .await
        .expect("user-filtered search");
    assert_eq!(by_user.len(), 1);
    assert_eq!(by_user[0].client_id, "client-1");
}

#[tokio::test]
async fn consent_attributes_round_trip_through_the_service() {
    let _guard = support::integration_guard().await;
    let Some(pool) = support::test_pool().await else {
        eprintln!("skipping: TEST_DATABASE_URL not set");
        return;
    };
    support::reset(&pool).await;

    let service = support::service(&pool, Arc::new(TracingNotifier));
    let created = service
        .create_consent(support::create_request("AwaitingAuthorisation"))
        .await
        .expect("create consent");

    let mut attributes = HashMap::new();
    attributes.insert("sharing_duration".to_string(), "86400".to_string());
    attributes.insert("channel".to_string(), "mobile".to_string());
    service
        .store_consent_attributes(created.consent_id, attributes)
        .await
        .expect("store attributes");

    let stored = service
        .get_consent_attributes(created.consent_id)
        .await
        .expect("get attributes");
    assert_eq!(stored.attributes.len(), 2);
    assert_eq!(stored.attributes["channel"], "mobile");

    let by_name = service
        .get_consent_attributes_by_name("channel")
        .await
        .expect("get by name");
    assert_eq!(by_name.get(&created.consent_id).map(String::as_str), Some("mobile"));

    let ids = service
        .get_consent_id_by_consent_attribute_name_and_value("channel", "mobile")
        .await
        .expect("reverse lookup");
    assert_eq!(ids, vec![created.consent_id]);

    service
        .delete_consent_attributes(created.consent_id, vec!["channel".to_string()])
        .await
        .expect("delete attribute");
    let remaining = service
        .get_consent_attributes(created.consent_id)
        .await
        .expect("get attributes after delete");
    assert_eq!(remaining.attributes.len(), 1);
    assert!(remaining.attributes.contains_key("sharing_duration"));
}
