use std::collections::HashMap;
use std::sync::Arc;

use consentkeeper_backend::{
    models::mapping::MAPPING_STATUS_ACTIVE,
    services::consent_core::{ConsentAmendment, NewAuthResource, NewMappingSpec},
    services::notifier::TracingNotifier,
};
use serde_json::Value;

#[path = "support/mod.rs"]
mod support;

fn amendment(
    consent_id: uuid::Uuid,
    receipt: &str,
    attributes: HashMap<String, String>,
) -> ConsentAmendment {
    ConsentAmendment {
        consent_id,
        receipt: Some(receipt.to_string()),
        validity_period: None,
        authorization_id: None,
        account_permissions: HashMap::new(),
        new_status: "Authorised".to_string(),
        attributes,
        user_id: Some("user-1".to_string()),
        amendment_reason: "ConsentAmendmentFlow".to_string(),
    }
}

#[tokio::test]
async fn amended_receipt_is_recoverable_from_history() {
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

    let amended = service
        .amend_detailed_consent(amendment(created.consent_id, "{\"v\":2}", HashMap::new()))
        .await
        .expect("amend consent");
    assert_eq!(amended.receipt, "{\"v\":2}");

    let history = service
        .get_consent_amendment_history_data(created.consent_id)
        .await
        .expect("history data");
    assert_eq!(history.len(), 1);

    let entry = &history[0];
    let basic = entry
        .changed_basic_data
        .as_ref()
        .expect("basic diff present");
    assert_eq!(basic["receipt"], Value::from("{}"));

    let reconstructed = entry
        .reconstructed_consent
        .as_ref()
        .expect("reconstructed snapshot");
    assert_eq!(reconstructed.receipt, "{}");
    assert_eq!(reconstructed.current_status, "AwaitingAuthorisation");
}

#[tokio::test]
async fn amend_replaces_the_attribute_set_exactly() {
    let _guard = support::integration_guard().await;
    let Some(pool) = support::test_pool().await else {
        eprintln!("skipping: TEST_DATABASE_URL not set");
        return;
    };
    support::reset(&pool).await;

    let service = support::service(&pool, Arc::new(TracingNotifier));
    let mut request = support::create_request("AwaitingAuthorisation");
    request.attributes.insert("a".to_string(), "1".to_string());
    request.attributes.insert("b".to_string(), "2".to_string());
    let created = service.create_consent(request).await.expect("create consent");

    let mut replacement = HashMap::new();
    replacement.insert("b".to_string(), "9".to_string());
    replacement.insert("c".to_string(), "3".to_string());
    let amended = service
        .amend_detailed_consent(amendment(created.consent_id, "{\"v\":2}", replacement.clone()))
        .await
        .expect("amend consent");

    assert_eq!(amended.attributes, replacement);
}

#[tokio::test]
async fn history_reconstruction_walks_back_through_every_amendment() {
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

    service
        .amend_detailed_consent(amendment(created.consent_id, "{\"v\":2}", HashMap::new()))
        .await
        .expect("first amendment");
    service
        .amend_detailed_consent(amendment(created.consent_id, "{\"v\":3}", HashMap::new()))
        .await
        .expect("second amendment");

    let history = service
        .get_consent_amendment_history_data(created.consent_id)
        .await
        .expect("history data");
    assert_eq!(history.len(), 2);

    // Newest entry first: it rolls v3 back to v2; the older one to v1.
    let receipts: Vec<String> = history
        .iter()
        .map(|entry| {
            entry
                .reconstructed_consent
                .as_ref()
                .expect("snapshot")
                .receipt
                .clone()
        })
        .collect();
    assert_eq!(receipts, vec!["{\"v\":2}".to_string(), "{}".to_string()]);
}

#[tokio::test]
async fn bulk_amendment_inserts_new_grants_and_diffs_them_as_new() {
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

    let amended = service
        .amend_detailed_consent_with_bulk_auth_resources(
            amendment(created.consent_id, "{\"v\":2}", HashMap::new()),
            vec![NewAuthResource {
                authorization_type: "authorisation".to_string(),
                authorization_status: "Created".to_string(),
                user_id: Some("user-2".to_string()),
                mappings: vec![NewMappingSpec {
                    account_id: "acc-9".to_string(),
                    permission: "read".to_string(),
                    mapping_status: MAPPING_STATUS_ACTIVE.to_string(),
                }],
            }],
        )
        .await
        .expect("bulk amendment");

    assert_eq!(amended.authorizations.len(), 2);
    assert_eq!(amended.mappings.len(), 1);
    let new_auth = amended
        .authorizations
        .iter()
        .find(|a| a.user_id.as_deref() == Some("user-2"))
        .expect("new authorization");

    let history = service
        .get_consent_amendment_history_data(created.consent_id)
        .await
        .expect("history data");
    assert_eq!(history.len(), 1);
    let entry = &history[0];
    assert_eq!(
        entry.changed_auth_resources.get(&new_auth.authorization_id),
        Some(&Value::Null)
    );
    // Before the amendment the new grant did not exist.
    let reconstructed = entry
        .reconstructed_consent
        .as_ref()
        .expect("reconstructed snapshot");
    assert_eq!(reconstructed.authorizations.len(), 1);
    assert!(reconstructed.mappings.is_empty());
}
