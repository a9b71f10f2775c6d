use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::models::detailed::DetailedConsentResource;

/// The record categories an amendment can touch. Each category maps to a
/// fixed two-character table id in the amendment-history store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsentDataCategory {
    BasicConsentData,
    AuthResourceData,
    MappingData,
    AttributesData,
}

impl ConsentDataCategory {
    pub const fn table_id(self) -> &'static str {
        match self {
            Self::BasicConsentData => "01",
            Self::AuthResourceData => "02",
            Self::MappingData => "03",
            Self::AttributesData => "04",
        }
    }

    pub fn from_table_id(table_id: &str) -> Option<Self> {
        match table_id {
            "01" => Some(Self::BasicConsentData),
            "02" => Some(Self::AuthResourceData),
            "03" => Some(Self::MappingData),
            "04" => Some(Self::AttributesData),
            _ => None,
        }
    }
}

/// One amendment of a consent: the backward diffs needed to roll the
/// consent back to the state before this amendment, grouped by category.
///
/// `changed_auth_resources` and `changed_mappings` are keyed by the affected
/// record id, since one amendment can touch several authorizations and
/// mappings at once. A `Value::Null` diff means the record did not exist
/// before the amendment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsentHistoryResource {
    pub consent_id: Uuid,
    pub history_id: Uuid,
    /// Epoch milliseconds; orders amendments that land within one second.
    pub timestamp: i64,
    pub reason: String,
    pub changed_basic_data: Option<Value>,
    pub changed_attributes: Option<Value>,
    pub changed_auth_resources: HashMap<Uuid, Value>,
    pub changed_mappings: HashMap<Uuid, Value>,
    /// Filled by history reconstruction: the consent as it looked before
    /// the amendment this entry records.
    pub reconstructed_consent: Option<DetailedConsentResource>,
}

impl ConsentHistoryResource {
    pub fn new(consent_id: Uuid, history_id: Uuid, timestamp: i64, reason: String) -> Self {
        Self {
            consent_id,
            history_id,
            timestamp,
            reason,
            changed_basic_data: None,
            changed_attributes: None,
            changed_auth_resources: HashMap::new(),
            changed_mappings: HashMap::new(),
            reconstructed_consent: None,
        }
    }
}
