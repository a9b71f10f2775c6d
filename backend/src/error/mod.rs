use thiserror::Error;

/// Faults raised by the repository layer.
///
/// Every write asserts its affected-row count and raises immediately on a
/// zero-row result; reads of a single entity raise `Retrieval` when no row
/// comes back. Search operations return empty collections instead.
#[derive(Debug, Error)]
pub enum ConsentDataError {
    #[error("{message}")]
    Retrieval {
        message: String,
        #[source]
        source: Option<sqlx::Error>,
    },
    #[error("{message}")]
    Insertion {
        message: String,
        #[source]
        source: Option<sqlx::Error>,
    },
    #[error("{message}")]
    Update {
        message: String,
        #[source]
        source: Option<sqlx::Error>,
    },
    #[error("{message}")]
    Deletion {
        message: String,
        #[source]
        source: Option<sqlx::Error>,
    },
}

impl ConsentDataError {
    pub fn retrieval(message: impl Into<String>) -> Self {
        Self::Retrieval {
            message: message.into(),
            source: None,
        }
    }

    pub fn retrieval_from(message: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Retrieval {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn insertion(message: impl Into<String>) -> Self {
        Self::Insertion {
            message: message.into(),
            source: None,
        }
    }

    pub fn insertion_from(message: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Insertion {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn update(message: impl Into<String>) -> Self {
        Self::Update {
            message: message.into(),
            source: None,
        }
    }

    pub fn update_from(message: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Update {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn deletion(message: impl Into<String>) -> Self {
        Self::Deletion {
            message: message.into(),
            source: None,
        }
    }

    pub fn deletion_from(message: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Deletion {
            message: message.into(),
            source: Some(source),
        }
    }
}

/// The single business-level error surfaced by the service layer.
///
/// Data-layer faults are wrapped with their cause attached; callers never
/// match on repository error types. Precondition failures are raised before
/// any connection is acquired.
#[derive(Debug, Error)]
pub enum ConsentMgtError {
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("consent data access failed")]
    Data(#[from] ConsentDataError),
    #[error("transaction failure")]
    Transaction(#[source] sqlx::Error),
    #[error("token revocation failed for consent {consent_id}")]
    TokenRevocation {
        consent_id: uuid::Uuid,
        #[source]
        source: anyhow::Error,
    },
    #[error("retention store is not configured")]
    RetentionUnavailable,
}

impl From<validator::ValidationErrors> for ConsentMgtError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let messages: Vec<String> = errors
            .field_errors()
            .into_iter()
            .flat_map(|(field, errs)| {
                errs.iter().map(move |e| {
                    let code = e.code.as_ref();
                    format!("{}: {}", field, code)
                })
            })
            .collect();
        ConsentMgtError::Precondition(messages.join(", "))
    }
}
