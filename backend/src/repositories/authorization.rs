use chrono::Utc;
use sqlx::{PgConnection, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::error::ConsentDataError;
use crate::models::authorization::{AuthorizationResource, NewAuthorization};
use crate::repositories::common::push_clause;

/// Inserts an authorization row, assigning id and timestamp when absent.
pub async fn store_authorization(
    conn: &mut PgConnection,
    new: NewAuthorization,
) -> Result<AuthorizationResource, ConsentDataError> {
    let authorization = AuthorizationResource {
        authorization_id: new.authorization_id.unwrap_or_else(Uuid::new_v4),
        consent_id: new.consent_id,
        authorization_type: new.authorization_type,
        user_id: new.user_id,
        authorization_status: new.authorization_status,
        updated_time: new.updated_time.unwrap_or_else(|| Utc::now().timestamp()),
    };

    let result = sqlx::query(
        "INSERT INTO consent_auth_resources \
         (authorization_id, consent_id, authorization_type, user_id, authorization_status, \
         updated_time) VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(authorization.authorization_id)
    .bind(authorization.consent_id)
    .bind(&authorization.authorization_type)
    .bind(&authorization.user_id)
    .bind(&authorization.authorization_status)
    .bind(authorization.updated_time)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        ConsentDataError::insertion_from(
            format!(
                "failed to insert authorization {}",
                authorization.authorization_id
            ),
            e,
        )
    })?;

    if result.rows_affected() == 0 {
        return Err(ConsentDataError::insertion(format!(
            "authorization insert affected zero rows for {}",
            authorization.authorization_id
        )));
    }
    Ok(authorization)
}

pub async fn get_authorization(
    conn: &mut PgConnection,
    authorization_id: Uuid,
) -> Result<AuthorizationResource, ConsentDataError> {
    sqlx::query_as::<_, AuthorizationResource>(
        "SELECT authorization_id, consent_id, authorization_type, user_id, \
         authorization_status, updated_time \
         FROM consent_auth_resources WHERE authorization_id = $1",
    )
    .bind(authorization_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| {
        ConsentDataError::retrieval_from(
            format!("failed to read authorization {}", authorization_id),
            e,
        )
    })?
    .ok_or_else(|| {
        ConsentDataError::retrieval(format!("no authorization found for {}", authorization_id))
    })
}

/// Searches authorizations by optional consent id and user id. Absent
/// filters are omitted from the predicate; an empty result is valid.
pub async fn search_authorizations(
    conn: &mut PgConnection,
    consent_id: Option<Uuid>,
    user_id: Option<&str>,
) -> Result<Vec<AuthorizationResource>, ConsentDataError> {
    let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new(
        "SELECT authorization_id, consent_id, authorization_type, user_id, \
         authorization_status, updated_time FROM consent_auth_resources",
    );
    let mut has_clause = false;
    if let Some(consent_id) = consent_id {
        push_clause(&mut builder, &mut has_clause);
        builder.push("consent_id = ").push_bind(consent_id);
    }
    if let Some(user_id) = user_id {
        push_clause(&mut builder, &mut has_clause);
        builder.push("user_id = ").push_bind(user_id.to_string());
    }
    builder.push(" ORDER BY updated_time DESC, authorization_id");

    builder
        .build_query_as::<AuthorizationResource>()
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| ConsentDataError::retrieval_from("failed to search authorizations", e))
}

pub async fn update_authorization_status(
    conn: &mut PgConnection,
    authorization_id: Uuid,
    new_status: &str,
) -> Result<AuthorizationResource, ConsentDataError> {
    let now = Utc::now().timestamp();
    sqlx::query_as::<_, AuthorizationResource>(
        "UPDATE consent_auth_resources SET authorization_status = $1, updated_time = $2 \
         WHERE authorization_id = $3 \
         RETURNING authorization_id, consent_id, authorization_type, user_id, \
         authorization_status, updated_time",
    )
    .bind(new_status)
    .bind(now)
    .bind(authorization_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| {
        ConsentDataError::update_from(
            format!(
                "failed to update status of authorization {}",
                authorization_id
            ),
            e,
        )
    })?
    .ok_or_else(|| {
        ConsentDataError::update(format!(
            "authorization status update affected zero rows for {}",
            authorization_id
        ))
    })
}

pub async fn update_authorization_user(
    conn: &mut PgConnection,
    authorization_id: Uuid,
    user_id: &str,
) -> Result<AuthorizationResource, ConsentDataError> {
    let now = Utc::now().timestamp();
    sqlx::query_as::<_, AuthorizationResource>(
        "UPDATE consent_auth_resources SET user_id = $1, updated_time = $2 \
         WHERE authorization_id = $3 \
         RETURNING authorization_id, consent_id, authorization_type, user_id, \
         authorization_status, updated_time",
    )
    .bind(user_id)
    .bind(now)
    .bind(authorization_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| {
        ConsentDataError::update_from(
            format!("failed to bind user to authorization {}", authorization_id),
            e,
        )
    })?
    .ok_or_else(|| {
        ConsentDataError::update(format!(
            "authorization user update affected zero rows for {}",
            authorization_id
        ))
    })
}
