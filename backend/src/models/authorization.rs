use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One grant event tied to a consent and, once bound, a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct AuthorizationResource {
    pub authorization_id: Uuid,
    pub consent_id: Uuid,
    pub authorization_type: String,
    pub user_id: Option<String>,
    pub authorization_status: String,
    pub updated_time: i64,
}

/// Insert payload for an authorization resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAuthorization {
    pub authorization_id: Option<Uuid>,
    pub consent_id: Uuid,
    pub authorization_type: String,
    pub user_id: Option<String>,
    pub authorization_status: String,
    pub updated_time: Option<i64>,
}
