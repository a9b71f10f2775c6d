//! Shared precondition rules for consent payloads.

use validator::ValidationError;

use crate::error::ConsentMgtError;

/// Rejects values that are empty or whitespace-only.
pub fn non_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("blank"));
    }
    Ok(())
}

/// Service-layer variant of [`non_blank`] that names the offending field.
pub fn require_non_blank(value: &str, field: &str) -> Result<(), ConsentMgtError> {
    if value.trim().is_empty() {
        return Err(ConsentMgtError::Precondition(format!(
            "{} must not be blank",
            field
        )));
    }
    Ok(())
}
