#![allow(dead_code)]
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use consentkeeper_backend::{
    db::connection::StorePools,
    models::consent::NewConsent,
    services::consent_core::{ConsentCoreService, ConsentCreateRequest, ImplicitAuthParams},
    services::notifier::{ConsentStateChangeEvent, StateChangeNotifier},
    services::token::NoopTokenRevoker,
};

/// Serializes the DB-backed tests of one binary; they share tables.
pub async fn integration_guard() -> tokio::sync::MutexGuard<'static, ()> {
    static GUARD: OnceLock<tokio::sync::Mutex<()>> = OnceLock::new();
    GUARD.get_or_init(|| tokio::sync::Mutex::new(())).lock().await
}

/// Connects to the database named by `TEST_DATABASE_URL` and applies the
/// migrations. Returns `None` when the variable is unset, so suites skip
/// cleanly on machines without a database.
pub async fn test_pool() -> Option<PgPool> {
    pool_for_env("TEST_DATABASE_URL").await
}

/// Second database for retention-sync tests, named by
/// `TEST_RETENTION_DATABASE_URL`.
pub async fn retention_pool() -> Option<PgPool> {
    pool_for_env("TEST_RETENTION_DATABASE_URL").await
}

async fn pool_for_env(var: &str) -> Option<PgPool> {
    let url = std::env::var(var).ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .unwrap_or_else(|e| panic!("connect to {}: {}", var, e));
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("run migrations");
    Some(pool)
}

pub async fn reset(pool: &PgPool) {
    sqlx::query(
        "TRUNCATE consent_amendment_history, consent_status_audit, consent_attributes, \
         consent_mappings, consent_auth_resources, consents",
    )
    .execute(pool)
    .await
    .expect("truncate consent tables");
}

/// Notifier double that records every published event.
#[derive(Debug, Default, Clone)]
pub struct RecordingNotifier {
    events: Arc<Mutex<Vec<ConsentStateChangeEvent>>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<ConsentStateChangeEvent> {
        self.events.lock().expect("lock events").clone()
    }
}

#[async_trait]
impl StateChangeNotifier for RecordingNotifier {
    async fn notify(&self, event: ConsentStateChangeEvent) {
        self.events.lock().expect("lock events").push(event);
    }
}

pub fn service(pool: &PgPool, notifier: Arc<dyn StateChangeNotifier>) -> ConsentCoreService {
    ConsentCoreService::new(
        StorePools::new(Arc::new(pool.clone()), None),
        notifier,
        Arc::new(NoopTokenRevoker),
    )
}

pub fn service_with_retention(
    live: &PgPool,
    retention: &PgPool,
    notifier: Arc<dyn StateChangeNotifier>,
) -> ConsentCoreService {
    ConsentCoreService::new(
        StorePools::new(Arc::new(live.clone()), Some(Arc::new(retention.clone()))),
        notifier,
        Arc::new(NoopTokenRevoker),
    )
}

pub fn new_consent(status: &str) -> NewConsent {
    NewConsent {
        consent_id: None,
        client_id: "client-1".to_string(),
        receipt: "{}".to_string(),
        consent_type: "accounts".to_string(),
        current_status: status.to_string(),
        consent_frequency: 0,
        validity_period: 3600,
        recurring_indicator: false,
        created_time: None,
        updated_time: None,
    }
}

/// The standard creation request used across suites: implicit authorization
/// of type "authorisation" in status "Created", bound to "user-1".
pub fn create_request(status: &str) -> ConsentCreateRequest {
    ConsentCreateRequest {
        consent: new_consent(status),
        attributes: HashMap::new(),
        user_id: Some("user-1".to_string()),
        implicit_auth: Some(ImplicitAuthParams {
            auth_status: "Created".to_string(),
            auth_type: "authorisation".to_string(),
        }),
    }
}

pub fn account_permissions(accounts: &[&str]) -> HashMap<String, Vec<String>> {
    accounts
        .iter()
        .map(|account| (account.to_string(), vec!["read".to_string()]))
        .collect()
}
