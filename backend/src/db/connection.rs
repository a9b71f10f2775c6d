use sqlx::postgres::PgPool;
use std::sync::Arc;

use crate::error::ConsentMgtError;

pub type DbPool = Arc<PgPool>;

pub async fn create_pool(database_url: &str) -> anyhow::Result<DbPool> {
    let pool = PgPool::connect(database_url).await?;
    Ok(Arc::new(pool))
}

/// Which store an operation runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreTarget {
    Live,
    Retention,
}

/// Connection provider for the live store and the optional retention store.
///
/// Retention-targeted operations fail when no retention pool is configured;
/// there is no silent fallback to the live store, since the two hold
/// different data.
#[derive(Clone)]
pub struct StorePools {
    live: DbPool,
    retention: Option<DbPool>,
}

impl StorePools {
    pub fn new(live: DbPool, retention: Option<DbPool>) -> Self {
        Self { live, retention }
    }

    pub fn live(&self) -> &DbPool {
        &self.live
    }

    pub fn retention(&self) -> Result<&DbPool, ConsentMgtError> {
        self.retention
            .as_ref()
            .ok_or(ConsentMgtError::RetentionUnavailable)
    }

    pub fn pool_for(&self, target: StoreTarget) -> Result<&DbPool, ConsentMgtError> {
        match target {
            StoreTarget::Live => Ok(&self.live),
            StoreTarget::Retention => self.retention(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    fn lazy_pool() -> DbPool {
        Arc::new(
            PgPoolOptions::new()
                .connect_lazy("postgres://localhost/consentkeeper")
                .expect("lazy pool"),
        )
    }

    #[tokio::test]
    async fn retention_target_fails_when_unconfigured() {
        let pools = StorePools::new(lazy_pool(), None);
        assert!(matches!(
            pools.pool_for(StoreTarget::Retention),
            Err(ConsentMgtError::RetentionUnavailable)
        ));
    }

    #[tokio::test]
    async fn live_target_always_resolves() {
        let pools = StorePools::new(lazy_pool(), None);
        assert!(pools.pool_for(StoreTarget::Live).is_ok());
    }
}
