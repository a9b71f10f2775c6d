use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Append-only record of one consent status transition.
///
/// `previous_status` is `None` only for the record written at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ConsentStatusAuditRecord {
    pub status_audit_id: Uuid,
    pub consent_id: Uuid,
    pub current_status: String,
    pub action_time: i64,
    pub reason: String,
    pub action_by: Option<String>,
    pub previous_status: Option<String>,
}

/// Insert payload for a status audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStatusAudit {
    pub status_audit_id: Option<Uuid>,
    pub consent_id: Uuid,
    pub current_status: String,
    pub action_time: Option<i64>,
    pub reason: String,
    pub action_by: Option<String>,
    pub previous_status: Option<String>,
}
