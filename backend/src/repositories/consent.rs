use chrono::Utc;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::ConsentDataError;
use crate::models::consent::{ConsentResource, NewConsent};

/// Inserts a consent row, assigning id and timestamps when absent.
pub async fn store_consent(
    conn: &mut PgConnection,
    new: NewConsent,
) -> Result<ConsentResource, ConsentDataError> {
    let now = Utc::now().timestamp();
    let consent = ConsentResource {
        consent_id: new.consent_id.unwrap_or_else(Uuid::new_v4),
        client_id: new.client_id,
        receipt: new.receipt,
        consent_type: new.consent_type,
        current_status: new.current_status,
        consent_frequency: new.consent_frequency,
        validity_period: new.validity_period,
        recurring_indicator: new.recurring_indicator,
        created_time: new.created_time.unwrap_or(now),
        updated_time: new.updated_time.unwrap_or(now),
    };

    let result = sqlx::query(
        "INSERT INTO consents \
         (consent_id, client_id, receipt, consent_type, current_status, consent_frequency, \
         validity_period, recurring_indicator, created_time, updated_time) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind(consent.consent_id)
    .bind(&consent.client_id)
    .bind(&consent.receipt)
    .bind(&consent.consent_type)
    .bind(&consent.current_status)
    .bind(consent.consent_frequency)
    .bind(consent.validity_period)
    .bind(consent.recurring_indicator)
    .bind(consent.created_time)
    .bind(consent.updated_time)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        ConsentDataError::insertion_from(
            format!("failed to insert consent {}", consent.consent_id),
            e,
        )
    })?;

    if result.rows_affected() == 0 {
        return Err(ConsentDataError::insertion(format!(
            "consent insert affected zero rows for {}",
            consent.consent_id
        )));
    }
    Ok(consent)
}

pub async fn get_consent(
    conn: &mut PgConnection,
    consent_id: Uuid,
) -> Result<ConsentResource, ConsentDataError> {
    sqlx::query_as::<_, ConsentResource>(
        "SELECT consent_id, client_id, receipt, consent_type, current_status, consent_frequency, \
         validity_period, recurring_indicator, created_time, updated_time \
         FROM consents WHERE consent_id = $1",
    )
    .bind(consent_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| {
        ConsentDataError::retrieval_from(format!("failed to read consent {}", consent_id), e)
    })?
    .ok_or_else(|| ConsentDataError::retrieval(format!("no consent found for {}", consent_id)))
}

/// Locks the consent row for the remainder of the current transaction.
///
/// Mutating lifecycle operations call this as their first read so that
/// concurrent amendments and revocations of the same consent serialize.
pub async fn lock_consent(
    conn: &mut PgConnection,
    consent_id: Uuid,
) -> Result<(), ConsentDataError> {
    let row: Option<(Uuid,)> =
        sqlx::query_as("SELECT consent_id FROM consents WHERE consent_id = $1 FOR UPDATE")
            .bind(consent_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| {
                ConsentDataError::retrieval_from(
                    format!("failed to lock consent {}", consent_id),
                    e,
                )
            })?;

    if row.is_none() {
        return Err(ConsentDataError::retrieval(format!(
            "no consent found for {}",
            consent_id
        )));
    }
    Ok(())
}

pub async fn update_consent_status(
    conn: &mut PgConnection,
    consent_id: Uuid,
    new_status: &str,
) -> Result<ConsentResource, ConsentDataError> {
    let now = Utc::now().timestamp();
    sqlx::query_as::<_, ConsentResource>(
        "UPDATE consents SET current_status = $1, updated_time = $2 WHERE consent_id = $3 \
         RETURNING consent_id, client_id, receipt, consent_type, current_status, \
         consent_frequency, validity_period, recurring_indicator, created_time, updated_time",
    )
    .bind(new_status)
    .bind(now)
    .bind(consent_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| {
        ConsentDataError::update_from(
            format!("failed to update status of consent {}", consent_id),
            e,
        )
    })?
    .ok_or_else(|| {
        ConsentDataError::update(format!(
            "consent status update affected zero rows for {}",
            consent_id
        ))
    })
}

pub async fn update_consent_receipt(
    conn: &mut PgConnection,
    consent_id: Uuid,
    receipt: &str,
) -> Result<(), ConsentDataError> {
    let result = sqlx::query("UPDATE consents SET receipt = $1 WHERE consent_id = $2")
        .bind(receipt)
        .bind(consent_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            ConsentDataError::update_from(
                format!("failed to update receipt of consent {}", consent_id),
                e,
            )
        })?;

    if result.rows_affected() == 0 {
        return Err(ConsentDataError::update(format!(
            "consent receipt update affected zero rows for {}",
            consent_id
        )));
    }
    Ok(())
}

pub async fn update_consent_validity_period(
    conn: &mut PgConnection,
    consent_id: Uuid,
    validity_period: i64,
) -> Result<(), ConsentDataError> {
    let now = Utc::now().timestamp();
    let result = sqlx::query(
        "UPDATE consents SET validity_period = $1, updated_time = $2 WHERE consent_id = $3",
    )
    .bind(validity_period)
    .bind(now)
    .bind(consent_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        ConsentDataError::update_from(
            format!("failed to update validity period of consent {}", consent_id),
            e,
        )
    })?;

    if result.rows_affected() == 0 {
        return Err(ConsentDataError::update(format!(
            "consent validity update affected zero rows for {}",
            consent_id
        )));
    }
    Ok(())
}

/// Consents eligible for the retention sweep: purgeable status and not
/// touched since the cutoff.
pub async fn get_consent_ids_for_retention(
    conn: &mut PgConnection,
    statuses: &[String],
    cutoff_time: i64,
) -> Result<Vec<Uuid>, ConsentDataError> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT consent_id FROM consents \
         WHERE current_status = ANY($1) AND updated_time < $2 \
         ORDER BY updated_time, consent_id",
    )
    .bind(statuses)
    .bind(cutoff_time)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| {
        ConsentDataError::retrieval_from("failed to read consents eligible for retention", e)
    })?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Removes a consent and every dependent row from the current store.
///
/// Used by the retention sweep after the record has been copied to the
/// retention store. Deletion order respects foreign keys.
pub async fn delete_consent_data(
    conn: &mut PgConnection,
    consent_id: Uuid,
) -> Result<(), ConsentDataError> {
    let statements = [
        "DELETE FROM consent_amendment_history WHERE record_id = $1 \
         OR record_id IN (SELECT authorization_id FROM consent_auth_resources WHERE consent_id = $1) \
         OR record_id IN (SELECT m.mapping_id FROM consent_mappings m \
             JOIN consent_auth_resources a ON m.authorization_id = a.authorization_id \
             WHERE a.consent_id = $1)",
        "DELETE FROM consent_status_audit WHERE consent_id = $1",
        "DELETE FROM consent_attributes WHERE consent_id = $1",
        "DELETE FROM consent_mappings WHERE authorization_id IN \
         (SELECT authorization_id FROM consent_auth_resources WHERE consent_id = $1)",
        "DELETE FROM consent_auth_resources WHERE consent_id = $1",
    ];

    for statement in statements {
        sqlx::query(statement)
            .bind(consent_id)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                ConsentDataError::deletion_from(
                    format!("failed to delete dependent rows of consent {}", consent_id),
                    e,
                )
            })?;
    }

    let result = sqlx::query("DELETE FROM consents WHERE consent_id = $1")
        .bind(consent_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            ConsentDataError::deletion_from(format!("failed to delete consent {}", consent_id), e)
        })?;

    if result.rows_affected() == 0 {
        return Err(ConsentDataError::deletion(format!(
            "consent delete affected zero rows for {}",
            consent_id
        )));
    }
    Ok(())
}
