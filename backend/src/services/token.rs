use async_trait::async_trait;
use uuid::Uuid;

/// Revokes tokens issued against a consent in the external OAuth2
/// subsystem.
///
/// Invoked strictly after the revoking transaction has committed; a failure
/// here surfaces as a business error but never rolls the committed
/// status and mapping changes back.
#[async_trait]
pub trait TokenRevoker: Send + Sync {
    async fn revoke_tokens(
        &self,
        client_id: &str,
        user_id: &str,
        consent_id: Uuid,
    ) -> anyhow::Result<()>;
}

/// Default revoker for deployments without a token subsystem attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTokenRevoker;

#[async_trait]
impl TokenRevoker for NoopTokenRevoker {
    async fn revoke_tokens(
        &self,
        _client_id: &str,
        _user_id: &str,
        consent_id: Uuid,
    ) -> anyhow::Result<()> {
        tracing::debug!(%consent_id, "no token revoker configured, skipping");
        Ok(())
    }
}
