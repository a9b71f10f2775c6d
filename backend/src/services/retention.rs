//! Retention sync: moves purgeable consents from the live store into the
//! retention store.
//!
//! The whole batch runs in one transaction per store; every record is
//! additionally isolated in savepoints on both connections, so a failing
//! record rolls back alone while the rest of the batch proceeds.

use sqlx::{Acquire, PgConnection};
use uuid::Uuid;

use crate::db::connection::StorePools;
use crate::error::{ConsentDataError, ConsentMgtError};
use crate::models::audit::NewStatusAudit;
use crate::models::authorization::NewAuthorization;
use crate::models::consent::NewConsent;
use crate::models::mapping::NewMapping;
use crate::repositories::{
    attribute as attribute_repo, audit as audit_repo, authorization as authorization_repo,
    consent as consent_repo, detailed as detailed_repo, history as history_repo,
    mapping as mapping_repo, transaction,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionSyncOutcome {
    pub moved: usize,
    pub skipped: usize,
}

/// Moves expired or revoked consent data into the retention store.
pub struct RetentionSyncService {
    pools: StorePools,
    purgeable_statuses: Vec<String>,
}

impl RetentionSyncService {
    pub fn new(pools: StorePools, purgeable_statuses: Vec<String>) -> Self {
        Self {
            pools,
            purgeable_statuses,
        }
    }

    /// Runs one sync pass: every consent in a purgeable status whose last
    /// update is older than `cutoff_time` is copied to the retention store
    /// and deleted from the live store. Returns how many records moved and
    /// how many were skipped because of per-record failures.
    pub async fn sync(&self, cutoff_time: i64) -> Result<RetentionSyncOutcome, ConsentMgtError> {
        let retention_pool = self.pools.retention()?.clone();
        let mut live_tx = transaction::begin_transaction(self.pools.live()).await?;
        let mut retention_tx = transaction::begin_transaction(&retention_pool).await?;

        let consent_ids = consent_repo::get_consent_ids_for_retention(
            live_tx.as_mut(),
            &self.purgeable_statuses,
            cutoff_time,
        )
        .await?;

        let mut outcome = RetentionSyncOutcome::default();
        for consent_id in consent_ids {
            let mut live_sp = live_tx.begin().await.map_err(ConsentMgtError::Transaction)?;
            let mut retention_sp = retention_tx
                .begin()
                .await
                .map_err(ConsentMgtError::Transaction)?;

            match move_record(live_sp.as_mut(), retention_sp.as_mut(), consent_id).await {
                Ok(()) => {
                    live_sp.commit().await.map_err(ConsentMgtError::Transaction)?;
                    retention_sp
                        .commit()
                        .await
                        .map_err(ConsentMgtError::Transaction)?;
                    outcome.moved += 1;
                }
                Err(error) => {
                    // The dropped savepoints roll this record back alone.
                    tracing::warn!(%consent_id, %error, "skipping consent in retention sync");
                    outcome.skipped += 1;
                }
            }
        }

        transaction::commit_transaction(live_tx).await?;
        transaction::commit_transaction(retention_tx).await?;
        Ok(outcome)
    }
}

/// Copies one consent with all dependent rows into the retention store and
/// removes it from the live store.
async fn move_record(
    live: &mut PgConnection,
    retention: &mut PgConnection,
    consent_id: Uuid,
) -> Result<(), ConsentDataError> {
    let detailed = detailed_repo::get_detailed_consent(&mut *live, consent_id).await?;

    // A broken history read downgrades to an empty history: the core
    // entities still move, the gap is logged.
    let history_rows =
        match history_repo::fetch_amendment_history_rows(&mut *live, &detailed.history_record_ids())
            .await
        {
            Ok(rows) => rows,
            Err(error) => {
                tracing::warn!(%consent_id, %error, "retention sync proceeds without amendment history");
                Vec::new()
            }
        };
    let audits =
        audit_repo::get_audit_records_for_consents(&mut *live, &[consent_id], None, None).await?;

    consent_repo::store_consent(
        &mut *retention,
        NewConsent {
            consent_id: Some(detailed.consent_id),
            client_id: detailed.client_id.clone(),
            receipt: detailed.receipt.clone(),
            consent_type: detailed.consent_type.clone(),
            current_status: detailed.current_status.clone(),
            consent_frequency: detailed.consent_frequency,
            validity_period: detailed.validity_period,
            recurring_indicator: detailed.recurring_indicator,
            created_time: Some(detailed.created_time),
            updated_time: Some(detailed.updated_time),
        },
    )
    .await?;

    for authorization in &detailed.authorizations {
        authorization_repo::store_authorization(
            &mut *retention,
            NewAuthorization {
                authorization_id: Some(authorization.authorization_id),
                consent_id: authorization.consent_id,
                authorization_type: authorization.authorization_type.clone(),
                user_id: authorization.user_id.clone(),
                authorization_status: authorization.authorization_status.clone(),
                updated_time: Some(authorization.updated_time),
            },
        )
        .await?;
    }
    for mapping in &detailed.mappings {
        mapping_repo::store_mapping(
            &mut *retention,
            NewMapping {
                mapping_id: Some(mapping.mapping_id),
                authorization_id: mapping.authorization_id,
                account_id: mapping.account_id.clone(),
                permission: mapping.permission.clone(),
                mapping_status: mapping.mapping_status.clone(),
            },
        )
        .await?;
    }
    if !detailed.attributes.is_empty() {
        attribute_repo::store_attributes(&mut *retention, consent_id, &detailed.attributes).await?;
    }
    for audit in &audits {
        audit_repo::store_status_audit_record(
            &mut *retention,
            NewStatusAudit {
                status_audit_id: Some(audit.status_audit_id),
                consent_id: audit.consent_id,
                current_status: audit.current_status.clone(),
                action_time: Some(audit.action_time),
                reason: audit.reason.clone(),
                action_by: audit.action_by.clone(),
                previous_status: audit.previous_status.clone(),
            },
        )
        .await?;
    }
    for row in &history_rows {
        history_repo::store_amendment_history(&mut *retention, row).await?;
    }

    consent_repo::delete_consent_data(&mut *live, consent_id).await
}
