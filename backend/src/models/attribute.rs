use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Free-form metadata attached to a consent, stored one row per key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsentAttributes {
    pub consent_id: Uuid,
    pub attributes: HashMap<String, String>,
}

impl ConsentAttributes {
    pub fn new(consent_id: Uuid, attributes: HashMap<String, String>) -> Self {
        Self {
            consent_id,
            attributes,
        }
    }
}
