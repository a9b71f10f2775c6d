use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

/// A top-level consent record as persisted in the `consents` table.
///
/// `client_id`, `consent_type` and `current_status` are never empty once
/// persisted; timestamps are Unix seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ConsentResource {
    pub consent_id: Uuid,
    pub client_id: String,
    pub receipt: String,
    pub consent_type: String,
    pub current_status: String,
    pub consent_frequency: i32,
    pub validity_period: i64,
    pub recurring_indicator: bool,
    pub created_time: i64,
    pub updated_time: i64,
}

/// Insert payload for a consent. The identifier and timestamps are assigned
/// by the repository when absent.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewConsent {
    pub consent_id: Option<Uuid>,
    #[validate(custom(function = "crate::validation::non_blank"))]
    pub client_id: String,
    #[validate(custom(function = "crate::validation::non_blank"))]
    pub receipt: String,
    #[validate(custom(function = "crate::validation::non_blank"))]
    pub consent_type: String,
    #[validate(custom(function = "crate::validation::non_blank"))]
    pub current_status: String,
    pub consent_frequency: i32,
    pub validity_period: i64,
    pub recurring_indicator: bool,
    pub created_time: Option<i64>,
    pub updated_time: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> NewConsent {
        NewConsent {
            consent_id: None,
            client_id: "client-1".to_string(),
            receipt: "{}".to_string(),
            consent_type: "accounts".to_string(),
            current_status: "AwaitingAuthorisation".to_string(),
            consent_frequency: 0,
            validity_period: 3600,
            recurring_indicator: false,
            created_time: None,
            updated_time: None,
        }
    }

    #[test]
    fn new_consent_accepts_complete_payload() {
        assert!(payload().validate().is_ok());
    }

    #[test]
    fn new_consent_rejects_blank_client_id() {
        let mut consent = payload();
        consent.client_id = "  ".to_string();
        assert!(consent.validate().is_err());
    }

    #[test]
    fn new_consent_rejects_empty_receipt() {
        let mut consent = payload();
        consent.receipt = String::new();
        assert!(consent.validate().is_err());
    }
}
