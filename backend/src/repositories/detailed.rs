use std::collections::{HashMap, HashSet};

use sqlx::{FromRow, PgConnection, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::error::ConsentDataError;
use crate::models::authorization::AuthorizationResource;
use crate::models::detailed::DetailedConsentResource;
use crate::models::mapping::ConsentMappingResource;
use crate::repositories::common::push_clause;

/// Optional search filters. Empty collections and `None` values are omitted
/// from the generated predicate entirely; within one category several values
/// combine with OR (`= ANY`), across categories with AND.
#[derive(Debug, Clone, Default)]
pub struct ConsentSearchFilters {
    pub consent_ids: Vec<Uuid>,
    pub client_ids: Vec<String>,
    pub consent_types: Vec<String>,
    pub consent_statuses: Vec<String>,
    pub user_ids: Vec<String>,
    pub from_time: Option<i64>,
    pub to_time: Option<i64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

const DETAILED_SELECT: &str = "SELECT c.consent_id, c.client_id, c.receipt, c.consent_type, \
     c.current_status, c.consent_frequency, c.validity_period, c.recurring_indicator, \
     c.created_time, c.updated_time, \
     a.authorization_id, a.authorization_type, a.user_id, a.authorization_status, \
     a.updated_time AS auth_updated_time, \
     m.mapping_id, m.account_id, m.permission, m.mapping_status, \
     att.att_key, att.att_value \
     FROM consents c \
     LEFT JOIN consent_auth_resources a ON a.consent_id = c.consent_id \
     LEFT JOIN consent_mappings m ON m.authorization_id = a.authorization_id \
     LEFT JOIN consent_attributes att ON att.consent_id = c.consent_id";

/// One row of the wide detailed-consent join. The joins fan out, so child
/// columns repeat and are nullable.
#[derive(Debug, Clone, FromRow)]
struct DetailedConsentRow {
    consent_id: Uuid,
    client_id: String,
    receipt: String,
    consent_type: String,
    current_status: String,
    consent_frequency: i32,
    validity_period: i64,
    recurring_indicator: bool,
    created_time: i64,
    updated_time: i64,
    authorization_id: Option<Uuid>,
    authorization_type: Option<String>,
    user_id: Option<String>,
    authorization_status: Option<String>,
    auth_updated_time: Option<i64>,
    mapping_id: Option<Uuid>,
    account_id: Option<String>,
    permission: Option<String>,
    mapping_status: Option<String>,
    att_key: Option<String>,
    att_value: Option<String>,
}

/// Reads a consent with all its authorizations, mappings and attributes in
/// one wide join. Fails with a retrieval error when no row comes back.
pub async fn get_detailed_consent(
    conn: &mut PgConnection,
    consent_id: Uuid,
) -> Result<DetailedConsentResource, ConsentDataError> {
    let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new(DETAILED_SELECT);
    builder.push(" WHERE c.consent_id = ").push_bind(consent_id);

    let rows = builder
        .build_query_as::<DetailedConsentRow>()
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| {
            ConsentDataError::retrieval_from(
                format!("failed to read detailed consent {}", consent_id),
                e,
            )
        })?;

    fold_detailed_rows(rows).into_iter().next().ok_or_else(|| {
        ConsentDataError::retrieval(format!("no consent found for {}", consent_id))
    })
}

/// Searches consents and returns the matches as detailed aggregates,
/// ordered by updated time, newest first.
pub async fn search_consents(
    conn: &mut PgConnection,
    filters: &ConsentSearchFilters,
) -> Result<Vec<DetailedConsentResource>, ConsentDataError> {
    let mut builder = build_search_query(filters);
    let id_rows: Vec<(Uuid, i64)> = builder
        .build_query_as()
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| ConsentDataError::retrieval_from("failed to search consents", e))?;

    let ids: Vec<Uuid> = id_rows.into_iter().map(|(id, _)| id).collect();
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    get_detailed_consents_by_ids(conn, &ids).await
}

/// Fetches detailed aggregates for a set of consent ids, preserving the
/// order of the given id list.
pub async fn get_detailed_consents_by_ids(
    conn: &mut PgConnection,
    consent_ids: &[Uuid],
) -> Result<Vec<DetailedConsentResource>, ConsentDataError> {
    let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new(DETAILED_SELECT);
    builder
        .push(" WHERE c.consent_id = ANY(")
        .push_bind(consent_ids.to_vec())
        .push(")");

    let rows = builder
        .build_query_as::<DetailedConsentRow>()
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| ConsentDataError::retrieval_from("failed to read detailed consents", e))?;

    let order: HashMap<Uuid, usize> = consent_ids
        .iter()
        .enumerate()
        .map(|(index, id)| (*id, index))
        .collect();
    let mut detailed = fold_detailed_rows(rows);
    detailed.sort_by_key(|d| order.get(&d.consent_id).copied().unwrap_or(usize::MAX));
    Ok(detailed)
}

/// Builds the id-selection query for [`search_consents`].
fn build_search_query(filters: &ConsentSearchFilters) -> QueryBuilder<'static, Postgres> {
    let mut builder: QueryBuilder<'_, Postgres> =
        QueryBuilder::new("SELECT DISTINCT c.consent_id, c.updated_time FROM consents c");
    if !filters.user_ids.is_empty() {
        builder.push(" LEFT JOIN consent_auth_resources a ON a.consent_id = c.consent_id");
    }

    let mut has_clause = false;
    if !filters.consent_ids.is_empty() {
        push_clause(&mut builder, &mut has_clause);
        builder
            .push("c.consent_id = ANY(")
            .push_bind(filters.consent_ids.clone())
            .push(")");
    }
    if !filters.client_ids.is_empty() {
        push_clause(&mut builder, &mut has_clause);
        builder
            .push("c.client_id = ANY(")
            .push_bind(filters.client_ids.clone())
            .push(")");
    }
    if !filters.consent_types.is_empty() {
        push_clause(&mut builder, &mut has_clause);
        builder
            .push("c.consent_type = ANY(")
            .push_bind(filters.consent_types.clone())
            .push(")");
    }
    if !filters.consent_statuses.is_empty() {
        push_clause(&mut builder, &mut has_clause);
        builder
            .push("c.current_status = ANY(")
            .push_bind(filters.consent_statuses.clone())
            .push(")");
    }
    if !filters.user_ids.is_empty() {
        push_clause(&mut builder, &mut has_clause);
        builder
            .push("a.user_id = ANY(")
            .push_bind(filters.user_ids.clone())
            .push(")");
    }
    if let Some(from_time) = filters.from_time {
        push_clause(&mut builder, &mut has_clause);
        builder.push("c.updated_time >= ").push_bind(from_time);
    }
    if let Some(to_time) = filters.to_time {
        push_clause(&mut builder, &mut has_clause);
        builder.push("c.updated_time <= ").push_bind(to_time);
    }

    builder.push(" ORDER BY c.updated_time DESC, c.consent_id");
    if let Some(limit) = filters.limit {
        builder.push(" LIMIT ").push_bind(limit);
    }
    if let Some(offset) = filters.offset {
        builder.push(" OFFSET ").push_bind(offset);
    }
    builder
}

/// Folds the join fan-out into aggregates: one entry per consent, children
/// deduplicated on authorization id and mapping id, first-seen order kept.
fn fold_detailed_rows(rows: Vec<DetailedConsentRow>) -> Vec<DetailedConsentResource> {
    let mut order: Vec<Uuid> = Vec::new();
    let mut consents: HashMap<Uuid, DetailedConsentResource> = HashMap::new();
    let mut seen_authorizations: HashSet<Uuid> = HashSet::new();
    let mut seen_mappings: HashSet<Uuid> = HashSet::new();

    for row in rows {
        let entry = consents.entry(row.consent_id).or_insert_with(|| {
            order.push(row.consent_id);
            DetailedConsentResource {
                consent_id: row.consent_id,
                client_id: row.client_id.clone(),
                receipt: row.receipt.clone(),
                consent_type: row.consent_type.clone(),
                current_status: row.current_status.clone(),
                consent_frequency: row.consent_frequency,
                validity_period: row.validity_period,
                recurring_indicator: row.recurring_indicator,
                created_time: row.created_time,
                updated_time: row.updated_time,
                authorizations: Vec::new(),
                mappings: Vec::new(),
                attributes: HashMap::new(),
            }
        });

        if let (Some(authorization_id), Some(authorization_type), Some(authorization_status)) = (
            row.authorization_id,
            row.authorization_type.clone(),
            row.authorization_status.clone(),
        ) {
            if seen_authorizations.insert(authorization_id) {
                entry.authorizations.push(AuthorizationResource {
                    authorization_id,
                    consent_id: row.consent_id,
                    authorization_type,
                    user_id: row.user_id.clone(),
                    authorization_status,
                    updated_time: row.auth_updated_time.unwrap_or_default(),
                });
            }
        }

        if let (Some(mapping_id), Some(authorization_id), Some(account_id), Some(permission), Some(mapping_status)) = (
            row.mapping_id,
            row.authorization_id,
            row.account_id.clone(),
            row.permission.clone(),
            row.mapping_status.clone(),
        ) {
            if seen_mappings.insert(mapping_id) {
                entry.mappings.push(ConsentMappingResource {
                    mapping_id,
                    authorization_id,
                    account_id,
                    permission,
                    mapping_status,
                });
            }
        }

        if let (Some(att_key), Some(att_value)) = (row.att_key, row.att_value) {
            entry.attributes.insert(att_key, att_value);
        }
    }

    order
        .into_iter()
        .filter_map(|id| consents.remove(&id))
        .collect()
}
