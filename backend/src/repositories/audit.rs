use chrono::Utc;
use sqlx::{PgConnection, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::error::ConsentDataError;
use crate::models::audit::{ConsentStatusAuditRecord, NewStatusAudit};
use crate::repositories::common::push_clause;

#[derive(Debug, Clone, Default)]
pub struct StatusAuditFilters {
    pub consent_id: Option<Uuid>,
    pub status: Option<String>,
    pub action_by: Option<String>,
    pub from_time: Option<i64>,
    pub to_time: Option<i64>,
    pub status_audit_id: Option<Uuid>,
}

/// Appends one audit record, assigning id and action time when absent.
pub async fn store_status_audit_record(
    conn: &mut PgConnection,
    new: NewStatusAudit,
) -> Result<ConsentStatusAuditRecord, ConsentDataError> {
    let record = ConsentStatusAuditRecord {
        status_audit_id: new.status_audit_id.unwrap_or_else(Uuid::new_v4),
        consent_id: new.consent_id,
        current_status: new.current_status,
        action_time: new.action_time.unwrap_or_else(|| Utc::now().timestamp()),
        reason: new.reason,
        action_by: new.action_by,
        previous_status: new.previous_status,
    };

    let result = sqlx::query(
        "INSERT INTO consent_status_audit \
         (status_audit_id, consent_id, current_status, action_time, reason, action_by, \
         previous_status) VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(record.status_audit_id)
    .bind(record.consent_id)
    .bind(&record.current_status)
    .bind(record.action_time)
    .bind(&record.reason)
    .bind(&record.action_by)
    .bind(&record.previous_status)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        ConsentDataError::insertion_from(
            format!(
                "failed to insert status audit record for consent {}",
                record.consent_id
            ),
            e,
        )
    })?;

    if result.rows_affected() == 0 {
        return Err(ConsentDataError::insertion(format!(
            "status audit insert affected zero rows for consent {}",
            record.consent_id
        )));
    }
    Ok(record)
}

/// Searches audit records over optional filters; absent filters are
/// omitted from the predicate entirely.
pub async fn search_status_audit_records(
    conn: &mut PgConnection,
    filters: &StatusAuditFilters,
) -> Result<Vec<ConsentStatusAuditRecord>, ConsentDataError> {
    let mut builder = build_audit_search_query(filters);
    builder
        .build_query_as::<ConsentStatusAuditRecord>()
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| ConsentDataError::retrieval_from("failed to search status audit records", e))
}

/// Audit records of a set of consents, newest first, optionally paginated.
pub async fn get_audit_records_for_consents(
    conn: &mut PgConnection,
    consent_ids: &[Uuid],
    limit: Option<i64>,
    offset: Option<i64>,
) -> Result<Vec<ConsentStatusAuditRecord>, ConsentDataError> {
    let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new(
        "SELECT status_audit_id, consent_id, current_status, action_time, reason, action_by, \
         previous_status FROM consent_status_audit WHERE consent_id = ANY(",
    );
    builder.push_bind(consent_ids.to_vec());
    builder.push(") ORDER BY action_time DESC, status_audit_id");
    if let Some(limit) = limit {
        builder.push(" LIMIT ").push_bind(limit);
    }
    if let Some(offset) = offset {
        builder.push(" OFFSET ").push_bind(offset);
    }

    builder
        .build_query_as::<ConsentStatusAuditRecord>()
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| ConsentDataError::retrieval_from("failed to read status audit records", e))
}

fn build_audit_search_query(filters: &StatusAuditFilters) -> QueryBuilder<'static, Postgres> {
    let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new(
        "SELECT status_audit_id, consent_id, current_status, action_time, reason, action_by, \
         previous_status FROM consent_status_audit",
    );
    let mut has_clause = false;
    if let Some(consent_id) = filters.consent_id {
        push_clause(&mut builder, &mut has_clause);
        builder.push("consent_id = ").push_bind(consent_id);
    }
    if let Some(status) = filters.status.as_ref() {
        push_clause(&mut builder, &mut has_clause);
        builder.push("current_status = ").push_bind(status.clone());
    }
    if let Some(action_by) = filters.action_by.as_ref() {
        push_clause(&mut builder, &mut has_clause);
        builder.push("action_by = ").push_bind(action_by.clone());
    }
    if let Some(from_time) = filters.from_time {
        push_clause(&mut builder, &mut has_clause);
        builder.push("action_time >= ").push_bind(from_time);
    }
    if let Some(to_time) = filters.to_time {
        push_clause(&mut builder, &mut has_clause);
        builder.push("action_time <= ").push_bind(to_time);
    }
    if let Some(status_audit_id) = filters.status_audit_id {
        push_clause(&mut builder, &mut has_clause);
        builder.push("status_audit_id = ").push_bind(status_audit_id);
    }
    builder.push(" ORDER BY action_time DESC, status_audit_id");
    builder
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_search_without_filters_has_no_predicate() {
        let builder = build_audit_search_query(&StatusAuditFilters::default());
        let sql = builder.sql();
        assert!(!sql.contains("WHERE"));
        assert!(sql.contains("ORDER BY action_time DESC"));
    }

    #[test]
    fn audit_search_combines_filters_with_and() {
        let filters = StatusAuditFilters {
            consent_id: Some(Uuid::new_v4()),
            status: Some("Revoked".to_string()),
            from_time: Some(100),
            ..Default::default()
        };
        let builder = build_audit_search_query(&filters);
        let sql = builder.sql();
        assert!(sql.contains("WHERE consent_id = $1"));
        assert!(sql.contains(" AND current_status = $2"));
        assert!(sql.contains(" AND action_time >= $3"));
    }
}
