use serde_json::Value;
use sqlx::{FromRow, PgConnection};
use uuid::Uuid;

use crate::error::ConsentDataError;
use crate::models::history::{ConsentDataCategory, ConsentHistoryResource};

/// One persisted amendment-history row: a backward diff for one record of
/// one category, tagged with the amendment's history id and timestamp.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct AmendmentHistoryRow {
    pub table_id: String,
    pub record_id: Uuid,
    pub history_id: Uuid,
    pub changed_values: String,
    pub reason: String,
    pub effective_timestamp: i64,
}

/// Inserts one amendment-history row. History rows are immutable once
/// written; there is no update path.
pub async fn store_amendment_history(
    conn: &mut PgConnection,
    row: &AmendmentHistoryRow,
) -> Result<(), ConsentDataError> {
    let result = sqlx::query(
        "INSERT INTO consent_amendment_history \
         (table_id, record_id, history_id, changed_values, reason, effective_timestamp) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(&row.table_id)
    .bind(row.record_id)
    .bind(row.history_id)
    .bind(&row.changed_values)
    .bind(&row.reason)
    .bind(row.effective_timestamp)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        ConsentDataError::insertion_from(
            format!(
                "failed to insert amendment history for record {}",
                row.record_id
            ),
            e,
        )
    })?;

    if result.rows_affected() == 0 {
        return Err(ConsentDataError::insertion(format!(
            "amendment history insert affected zero rows for record {}",
            row.record_id
        )));
    }
    Ok(())
}

/// Raw history rows for a set of record ids, newest amendment first.
pub async fn fetch_amendment_history_rows(
    conn: &mut PgConnection,
    record_ids: &[Uuid],
) -> Result<Vec<AmendmentHistoryRow>, ConsentDataError> {
    sqlx::query_as::<_, AmendmentHistoryRow>(
        "SELECT table_id, record_id, history_id, changed_values, reason, effective_timestamp \
         FROM consent_amendment_history WHERE record_id = ANY($1) \
         ORDER BY effective_timestamp DESC, history_id",
    )
    .bind(record_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| ConsentDataError::retrieval_from("failed to read amendment history", e))
}

/// History rows grouped into one resource per history id, newest first.
pub async fn retrieve_amendment_history(
    conn: &mut PgConnection,
    consent_id: Uuid,
    record_ids: &[Uuid],
) -> Result<Vec<ConsentHistoryResource>, ConsentDataError> {
    let rows = fetch_amendment_history_rows(conn, record_ids).await?;
    Ok(group_history_rows(consent_id, rows))
}

/// Groups rows sharing a history id into one [`ConsentHistoryResource`],
/// merging per-category payloads. Authorization and mapping categories
/// accumulate nested maps keyed by the affected record id, since one
/// amendment can touch several of each.
pub fn group_history_rows(
    consent_id: Uuid,
    rows: Vec<AmendmentHistoryRow>,
) -> Vec<ConsentHistoryResource> {
    let mut grouped: Vec<ConsentHistoryResource> = Vec::new();

    for row in rows {
        let diff: Value = match serde_json::from_str(&row.changed_values) {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(
                    history_id = %row.history_id,
                    record_id = %row.record_id,
                    %error,
                    "skipping unparseable amendment history payload"
                );
                continue;
            }
        };

        let index = match grouped.iter().position(|e| e.history_id == row.history_id) {
            Some(index) => index,
            None => {
                grouped.push(ConsentHistoryResource::new(
                    consent_id,
                    row.history_id,
                    row.effective_timestamp,
                    row.reason.clone(),
                ));
                grouped.len() - 1
            }
        };
        let entry = &mut grouped[index];

        match ConsentDataCategory::from_table_id(&row.table_id) {
            Some(ConsentDataCategory::BasicConsentData) => {
                entry.changed_basic_data = Some(diff);
            }
            Some(ConsentDataCategory::AttributesData) => {
                entry.changed_attributes = Some(diff);
            }
            Some(ConsentDataCategory::AuthResourceData) => {
                entry.changed_auth_resources.insert(row.record_id, diff);
            }
            Some(ConsentDataCategory::MappingData) => {
                entry.changed_mappings.insert(row.record_id, diff);
            }
            None => {
                tracing::warn!(
                    table_id = %row.table_id,
                    record_id = %row.record_id,
                    "amendment history row has an unknown table id"
                );
            }
        }
    }

    grouped
}
