use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::authorization::AuthorizationResource;
use crate::models::mapping::ConsentMappingResource;

/// Read-model aggregate of a consent with all its authorizations, mappings
/// and attributes. Assembled on read, never persisted as one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailedConsentResource {
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
    pub authorizations: Vec<AuthorizationResource>,
    pub mappings: Vec<ConsentMappingResource>,
    pub attributes: HashMap<String, String>,
}

impl DetailedConsentResource {
    /// Ids of every mapping currently in active status.
    pub fn active_mapping_ids(&self) -> Vec<Uuid> {
        self.mappings
            .iter()
            .filter(|m| m.is_active())
            .map(|m| m.mapping_id)
            .collect()
    }

    /// Active mappings belonging to one authorization.
    pub fn active_mappings_for(&self, authorization_id: Uuid) -> Vec<&ConsentMappingResource> {
        self.mappings
            .iter()
            .filter(|m| m.authorization_id == authorization_id && m.is_active())
            .collect()
    }

    /// All record ids participating in amendment history for this consent:
    /// the consent itself plus every authorization and mapping id.
    pub fn history_record_ids(&self) -> Vec<Uuid> {
        let mut ids = Vec::with_capacity(1 + self.authorizations.len() + self.mappings.len());
        ids.push(self.consent_id);
        ids.extend(self.authorizations.iter().map(|a| a.authorization_id));
        ids.extend(self.mappings.iter().map(|m| m.mapping_id));
        ids
    }
}
