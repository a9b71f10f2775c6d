use std::collections::HashMap;

use sqlx::{PgConnection, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::error::ConsentDataError;
use crate::models::attribute::ConsentAttributes;

/// Batched upsert of a key→value attribute map; one statement for all rows.
pub async fn store_attributes(
    conn: &mut PgConnection,
    consent_id: Uuid,
    attributes: &HashMap<String, String>,
) -> Result<(), ConsentDataError> {
    if attributes.is_empty() {
        return Err(ConsentDataError::insertion(
            "attribute store requested with an empty attribute map",
        ));
    }

    let mut builder: QueryBuilder<'_, Postgres> =
        QueryBuilder::new("INSERT INTO consent_attributes (consent_id, att_key, att_value) ");
    builder.push_values(attributes.iter(), |mut row, (key, value)| {
        row.push_bind(consent_id).push_bind(key).push_bind(value);
    });
    builder.push(
        " ON CONFLICT (consent_id, att_key) DO UPDATE SET att_value = EXCLUDED.att_value",
    );

    let result = builder.build().execute(&mut *conn).await.map_err(|e| {
        ConsentDataError::insertion_from(
            format!("failed to insert attributes of consent {}", consent_id),
            e,
        )
    })?;

    if result.rows_affected() != attributes.len() as u64 {
        return Err(ConsentDataError::insertion(format!(
            "attribute insert affected {} of {} rows for consent {}",
            result.rows_affected(),
            attributes.len(),
            consent_id
        )));
    }
    Ok(())
}

pub async fn get_attributes(
    conn: &mut PgConnection,
    consent_id: Uuid,
) -> Result<ConsentAttributes, ConsentDataError> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT att_key, att_value FROM consent_attributes WHERE consent_id = $1",
    )
    .bind(consent_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| {
        ConsentDataError::retrieval_from(
            format!("failed to read attributes of consent {}", consent_id),
            e,
        )
    })?;

    Ok(ConsentAttributes::new(
        consent_id,
        rows.into_iter().collect(),
    ))
}

pub async fn get_attributes_for_keys(
    conn: &mut PgConnection,
    consent_id: Uuid,
    keys: &[String],
) -> Result<ConsentAttributes, ConsentDataError> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT att_key, att_value FROM consent_attributes \
         WHERE consent_id = $1 AND att_key = ANY($2)",
    )
    .bind(consent_id)
    .bind(keys)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| {
        ConsentDataError::retrieval_from(
            format!("failed to read attributes of consent {}", consent_id),
            e,
        )
    })?;

    Ok(ConsentAttributes::new(
        consent_id,
        rows.into_iter().collect(),
    ))
}

/// All values stored under one attribute key, keyed by consent id.
pub async fn get_attributes_by_name(
    conn: &mut PgConnection,
    attribute_name: &str,
) -> Result<HashMap<Uuid, String>, ConsentDataError> {
    let rows: Vec<(Uuid, String)> = sqlx::query_as(
        "SELECT consent_id, att_value FROM consent_attributes WHERE att_key = $1",
    )
    .bind(attribute_name)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| {
        ConsentDataError::retrieval_from(
            format!("failed to read attributes named {}", attribute_name),
            e,
        )
    })?;

    Ok(rows.into_iter().collect())
}

/// Attribute-keyed reverse lookup: consent ids carrying the given
/// key/value pair.
pub async fn get_consent_ids_by_attribute_name_and_value(
    conn: &mut PgConnection,
    attribute_name: &str,
    attribute_value: &str,
) -> Result<Vec<Uuid>, ConsentDataError> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT consent_id FROM consent_attributes WHERE att_key = $1 AND att_value = $2",
    )
    .bind(attribute_name)
    .bind(attribute_value)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| {
        ConsentDataError::retrieval_from(
            format!("failed to look up consents by attribute {}", attribute_name),
            e,
        )
    })?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Batched delete of attribute keys; raises when any key was missing.
pub async fn delete_attributes(
    conn: &mut PgConnection,
    consent_id: Uuid,
    keys: &[String],
) -> Result<(), ConsentDataError> {
    if keys.is_empty() {
        return Err(ConsentDataError::deletion(
            "attribute delete requested with no keys",
        ));
    }

    let result = sqlx::query(
        "DELETE FROM consent_attributes WHERE consent_id = $1 AND att_key = ANY($2)",
    )
    .bind(consent_id)
    .bind(keys)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        ConsentDataError::deletion_from(
            format!("failed to delete attributes of consent {}", consent_id),
            e,
        )
    })?;

    if result.rows_affected() != keys.len() as u64 {
        return Err(ConsentDataError::deletion(format!(
            "attribute delete affected {} of {} rows for consent {}",
            result.rows_affected(),
            keys.len(),
            consent_id
        )));
    }
    Ok(())
}
