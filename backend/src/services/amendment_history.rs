//! Amendment history engine.
//!
//! Amendments store minimal field-level diffs instead of snapshots. A diff
//! is "backward": it records what a field used to be before the amendment
//! that produced it, so any historical version can be rebuilt by folding
//! diffs onto the current state, newest first.

use std::collections::HashMap;

use serde_json::{Map, Value};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::ConsentDataError;
use crate::models::detailed::DetailedConsentResource;
use crate::models::history::{ConsentDataCategory, ConsentHistoryResource};
use crate::repositories::history::{self as history_repo, AmendmentHistoryRow};

const FIELD_RECEIPT: &str = "receipt";
const FIELD_VALIDITY_PERIOD: &str = "validity_period";
const FIELD_UPDATED_TIME: &str = "updated_time";
const FIELD_CURRENT_STATUS: &str = "current_status";
const FIELD_MAPPING_STATUS: &str = "mapping_status";
const FIELD_AUTHORIZATION_STATUS: &str = "authorization_status";
const FIELD_USER_ID: &str = "user_id";

/// One computed diff: the backward payload for a single record of a single
/// category. `Value::Null` means the record did not exist before the
/// amendment.
#[derive(Debug, Clone, PartialEq)]
pub struct AmendmentDiff {
    pub category: ConsentDataCategory,
    pub record_id: Uuid,
    pub changed_values: Value,
}

/// Computes the minimal backward diffs between the pre-amendment and
/// post-amendment snapshots of one consent.
pub fn compute_amendment_diffs(
    old: &DetailedConsentResource,
    new: &DetailedConsentResource,
) -> Vec<AmendmentDiff> {
    let mut diffs = Vec::new();

    let basic = diff_basic_fields(old, new);
    if !basic.is_empty() {
        diffs.push(AmendmentDiff {
            category: ConsentDataCategory::BasicConsentData,
            record_id: old.consent_id,
            changed_values: Value::Object(basic),
        });
    }

    let attributes = diff_attributes(&old.attributes, &new.attributes);
    if !attributes.is_empty() {
        diffs.push(AmendmentDiff {
            category: ConsentDataCategory::AttributesData,
            record_id: old.consent_id,
            changed_values: Value::Object(attributes),
        });
    }

    diffs.extend(diff_authorizations(old, new));
    diffs.extend(diff_mappings(old, new));
    diffs
}

fn diff_basic_fields(
    old: &DetailedConsentResource,
    new: &DetailedConsentResource,
) -> Map<String, Value> {
    let mut diff = Map::new();
    if new.receipt != old.receipt {
        diff.insert(FIELD_RECEIPT.to_string(), Value::from(old.receipt.clone()));
    }
    if new.validity_period != old.validity_period {
        diff.insert(
            FIELD_VALIDITY_PERIOD.to_string(),
            Value::from(old.validity_period),
        );
    }
    if new.updated_time != old.updated_time {
        diff.insert(FIELD_UPDATED_TIME.to_string(), Value::from(old.updated_time));
    }
    if new.current_status != old.current_status {
        diff.insert(
            FIELD_CURRENT_STATUS.to_string(),
            Value::from(old.current_status.clone()),
        );
    }
    diff
}

fn diff_attributes(
    old: &HashMap<String, String>,
    new: &HashMap<String, String>,
) -> Map<String, Value> {
    let mut diff = Map::new();
    for (key, old_value) in old {
        if new.get(key) != Some(old_value) {
            diff.insert(key.clone(), Value::from(old_value.clone()));
        }
    }
    for key in new.keys() {
        if !old.contains_key(key) {
            // Null marks a key that did not exist before the amendment.
            diff.insert(key.clone(), Value::Null);
        }
    }
    diff
}

fn diff_authorizations(
    old: &DetailedConsentResource,
    new: &DetailedConsentResource,
) -> Vec<AmendmentDiff> {
    let old_by_id: HashMap<Uuid, _> = old
        .authorizations
        .iter()
        .map(|a| (a.authorization_id, a))
        .collect();

    let mut diffs = Vec::new();
    for authorization in &new.authorizations {
        match old_by_id.get(&authorization.authorization_id) {
            None => diffs.push(AmendmentDiff {
                category: ConsentDataCategory::AuthResourceData,
                record_id: authorization.authorization_id,
                changed_values: Value::Null,
            }),
            Some(previous) => {
                let mut diff = Map::new();
                if authorization.authorization_status != previous.authorization_status {
                    diff.insert(
                        FIELD_AUTHORIZATION_STATUS.to_string(),
                        Value::from(previous.authorization_status.clone()),
                    );
                }
                if authorization.user_id != previous.user_id {
                    diff.insert(
                        FIELD_USER_ID.to_string(),
                        previous
                            .user_id
                            .clone()
                            .map(Value::from)
                            .unwrap_or(Value::Null),
                    );
                }
                if !diff.is_empty() {
                    diffs.push(AmendmentDiff {
                        category: ConsentDataCategory::AuthResourceData,
                        record_id: authorization.authorization_id,
                        changed_values: Value::Object(diff),
                    });
                }
            }
        }
    }
    diffs
}

fn diff_mappings(
    old: &DetailedConsentResource,
    new: &DetailedConsentResource,
) -> Vec<AmendmentDiff> {
    let old_by_id: HashMap<Uuid, _> =
        old.mappings.iter().map(|m| (m.mapping_id, m)).collect();

    let mut diffs = Vec::new();
    for mapping in &new.mappings {
        match old_by_id.get(&mapping.mapping_id) {
            None => diffs.push(AmendmentDiff {
                category: ConsentDataCategory::MappingData,
                record_id: mapping.mapping_id,
                changed_values: Value::Null,
            }),
            Some(previous) if previous.mapping_status != mapping.mapping_status => {
                let mut diff = Map::new();
                diff.insert(
                    FIELD_MAPPING_STATUS.to_string(),
                    Value::from(previous.mapping_status.clone()),
                );
                diffs.push(AmendmentDiff {
                    category: ConsentDataCategory::MappingData,
                    record_id: mapping.mapping_id,
                    changed_values: Value::Object(diff),
                });
            }
            Some(_) => {}
        }
    }
    diffs
}

/// Persists one amendment: every non-empty category diff becomes one history
/// row sharing the same history id, timestamp and reason. Returns the number
/// of rows written.
pub async fn persist_amendment(
    conn: &mut PgConnection,
    history_id: Uuid,
    timestamp: i64,
    reason: &str,
    old: &DetailedConsentResource,
    new: &DetailedConsentResource,
) -> Result<usize, ConsentDataError> {
    let diffs = compute_amendment_diffs(old, new);
    for diff in &diffs {
        let row = AmendmentHistoryRow {
            table_id: diff.category.table_id().to_string(),
            record_id: diff.record_id,
            history_id,
            changed_values: diff.changed_values.to_string(),
            reason: reason.to_string(),
            effective_timestamp: timestamp,
        };
        history_repo::store_amendment_history(conn, &row).await?;
    }
    Ok(diffs.len())
}

/// Rebuilds every historical snapshot by folding stored diffs onto the
/// current state, newest entry first. Each returned entry carries the
/// consent as it looked before the amendment that entry records. Inputs are
/// never mutated; only in-memory copies are produced.
pub fn reconstruct_history(
    current: &DetailedConsentResource,
    entries: Vec<ConsentHistoryResource>,
) -> Vec<ConsentHistoryResource> {
    let mut running = current.clone();
    let mut reconstructed = Vec::with_capacity(entries.len());

    for mut entry in entries {
        let snapshot = apply_entry(&running, &entry);
        entry.reconstructed_consent = Some(snapshot.clone());
        running = snapshot;
        reconstructed.push(entry);
    }
    reconstructed
}

/// Applies one entry's backward diffs onto a copy of the given snapshot.
fn apply_entry(
    snapshot: &DetailedConsentResource,
    entry: &ConsentHistoryResource,
) -> DetailedConsentResource {
    let mut result = snapshot.clone();

    if let Some(Value::Object(basic)) = entry.changed_basic_data.as_ref() {
        for (field, value) in basic {
            match (field.as_str(), value) {
                (FIELD_RECEIPT, Value::String(receipt)) => result.receipt = receipt.clone(),
                (FIELD_VALIDITY_PERIOD, value) => {
                    if let Some(validity) = value.as_i64() {
                        result.validity_period = validity;
                    }
                }
                (FIELD_UPDATED_TIME, value) => {
                    if let Some(updated) = value.as_i64() {
                        result.updated_time = updated;
                    }
                }
                (FIELD_CURRENT_STATUS, Value::String(status)) => {
                    result.current_status = status.clone();
                }
                _ => {}
            }
        }
    }

    if let Some(Value::Object(attributes)) = entry.changed_attributes.as_ref() {
        for (key, value) in attributes {
            match value {
                // The key did not exist at this point in time.
                Value::Null => {
                    result.attributes.remove(key);
                }
                Value::String(old_value) => {
                    result.attributes.insert(key.clone(), old_value.clone());
                }
                _ => {}
            }
        }
    }

    for (authorization_id, diff) in &entry.changed_auth_resources {
        match diff {
            Value::Null => {
                result
                    .authorizations
                    .retain(|a| a.authorization_id != *authorization_id);
            }
            Value::Object(fields) => {
                if let Some(authorization) = result
                    .authorizations
                    .iter_mut()
                    .find(|a| a.authorization_id == *authorization_id)
                {
                    if let Some(Value::String(status)) = fields.get(FIELD_AUTHORIZATION_STATUS) {
                        authorization.authorization_status = status.clone();
                    }
                    if let Some(user) = fields.get(FIELD_USER_ID) {
                        authorization.user_id = user.as_str().map(str::to_string);
                    }
                }
            }
            _ => {}
        }
    }

    for (mapping_id, diff) in &entry.changed_mappings {
        match diff {
            Value::Null => {
                result.mappings.retain(|m| m.mapping_id != *mapping_id);
            }
            Value::Object(fields) => {
                if let Some(mapping) = result
                    .mappings
                    .iter_mut()
                    .find(|m| m.mapping_id == *mapping_id)
                {
                    if let Some(Value::String(status)) = fields.get(FIELD_MAPPING_STATUS) {
                        mapping.mapping_status = status.clone();
                    }
                }
            }
            _ => {}
        }
    }

    result
}
