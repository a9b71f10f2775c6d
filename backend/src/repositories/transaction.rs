//! Transaction management utilities for repositories.
//!
//! Repositories themselves never open or close transactions; every lifecycle
//! operation acquires one transaction here, passes its connection down, and
//! commits at the end. Dropping an uncommitted transaction rolls it back.

use crate::error::ConsentMgtError;
use sqlx::postgres::PgTransaction;
use sqlx::PgPool;

/// Begin a new database transaction.
pub async fn begin_transaction(db: &PgPool) -> Result<PgTransaction<'_>, ConsentMgtError> {
    db.begin().await.map_err(ConsentMgtError::Transaction)
}

/// Commit a transaction.
pub async fn commit_transaction(tx: PgTransaction<'_>) -> Result<(), ConsentMgtError> {
    tx.commit().await.map_err(ConsentMgtError::Transaction)
}

/// Rollback a transaction.
///
/// Undoes all changes made within the transaction since it began.
pub async fn rollback_transaction(tx: PgTransaction<'_>) -> Result<(), ConsentMgtError> {
    tx.rollback().await.map_err(ConsentMgtError::Transaction)
}
