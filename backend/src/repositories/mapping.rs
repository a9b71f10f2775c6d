use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::ConsentDataError;
use crate::models::mapping::{ConsentMappingResource, NewMapping};

/// Inserts a mapping row, assigning the id when absent.
pub async fn store_mapping(
    conn: &mut PgConnection,
    new: NewMapping,
) -> Result<ConsentMappingResource, ConsentDataError> {
    let mapping = ConsentMappingResource {
        mapping_id: new.mapping_id.unwrap_or_else(Uuid::new_v4),
        authorization_id: new.authorization_id,
        account_id: new.account_id,
        permission: new.permission,
        mapping_status: new.mapping_status,
    };

    let result = sqlx::query(
        "INSERT INTO consent_mappings \
         (mapping_id, authorization_id, account_id, permission, mapping_status) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(mapping.mapping_id)
    .bind(mapping.authorization_id)
    .bind(&mapping.account_id)
    .bind(&mapping.permission)
    .bind(&mapping.mapping_status)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        ConsentDataError::insertion_from(
            format!("failed to insert mapping {}", mapping.mapping_id),
            e,
        )
    })?;

    if result.rows_affected() == 0 {
        return Err(ConsentDataError::insertion(format!(
            "mapping insert affected zero rows for {}",
            mapping.mapping_id
        )));
    }
    Ok(mapping)
}

/// Mappings for one authorization, optionally narrowed to one status.
pub async fn get_mappings_for_authorization(
    conn: &mut PgConnection,
    authorization_id: Uuid,
    status: Option<&str>,
) -> Result<Vec<ConsentMappingResource>, ConsentDataError> {
    sqlx::query_as::<_, ConsentMappingResource>(
        "SELECT mapping_id, authorization_id, account_id, permission, mapping_status \
         FROM consent_mappings \
         WHERE authorization_id = $1 AND ($2::text IS NULL OR mapping_status = $2) \
         ORDER BY account_id, permission",
    )
    .bind(authorization_id)
    .bind(status)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| {
        ConsentDataError::retrieval_from(
            format!(
                "failed to read mappings of authorization {}",
                authorization_id
            ),
            e,
        )
    })
}

/// Batched status update over mapping ids; submitted as one statement.
/// Raises when any id in the batch did not match a row.
pub async fn update_mapping_status(
    conn: &mut PgConnection,
    mapping_ids: &[Uuid],
    new_status: &str,
) -> Result<(), ConsentDataError> {
    if mapping_ids.is_empty() {
        return Err(ConsentDataError::update(
            "mapping status update requested with no mapping ids",
        ));
    }

    let result =
        sqlx::query("UPDATE consent_mappings SET mapping_status = $1 WHERE mapping_id = ANY($2)")
            .bind(new_status)
            .bind(mapping_ids)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                ConsentDataError::update_from("failed to update mapping statuses", e)
            })?;

    if result.rows_affected() != mapping_ids.len() as u64 {
        return Err(ConsentDataError::update(format!(
            "mapping status update affected {} of {} rows",
            result.rows_affected(),
            mapping_ids.len()
        )));
    }
    Ok(())
}

/// Re-points mappings at a new authorization, used when a fresh
/// authorization supersedes an old one during re-authorization.
pub async fn reparent_mappings(
    conn: &mut PgConnection,
    mapping_ids: &[Uuid],
    new_authorization_id: Uuid,
) -> Result<(), ConsentDataError> {
    if mapping_ids.is_empty() {
        return Ok(());
    }

    let result = sqlx::query(
        "UPDATE consent_mappings SET authorization_id = $1 WHERE mapping_id = ANY($2)",
    )
    .bind(new_authorization_id)
    .bind(mapping_ids)
    .execute(&mut *conn)
    .await
    .map_err(|e| ConsentDataError::update_from("failed to re-parent mappings", e))?;

    if result.rows_affected() != mapping_ids.len() as u64 {
        return Err(ConsentDataError::update(format!(
            "mapping re-parent affected {} of {} rows",
            result.rows_affected(),
            mapping_ids.len()
        )));
    }
    Ok(())
}
