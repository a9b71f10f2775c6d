use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Mapping rows are the unit of account-binding revocation: deactivated
/// mappings stay in the store, they are never physically removed.
pub const MAPPING_STATUS_ACTIVE: &str = "active";
pub const MAPPING_STATUS_INACTIVE: &str = "inactive";

/// Binding of one account + permission to an authorization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ConsentMappingResource {
    pub mapping_id: Uuid,
    pub authorization_id: Uuid,
    pub account_id: String,
    pub permission: String,
    pub mapping_status: String,
}

impl ConsentMappingResource {
    pub fn is_active(&self) -> bool {
        self.mapping_status == MAPPING_STATUS_ACTIVE
    }
}

/// Insert payload for a consent mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMapping {
    pub mapping_id: Option<Uuid>,
    pub authorization_id: Uuid,
    pub account_id: String,
    pub permission: String,
    pub mapping_status: String,
}
