//! Consent lifecycle orchestrator.
//!
//! Every lifecycle operation acquires one transaction, composes its
//! multi-table writes inside it, and funnels status transitions through
//! [`ConsentCoreService::post_state_change`]: exactly one audit record per
//! transition, followed by notification fan-out. Precondition failures are
//! raised before any connection is acquired.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use sqlx::PgConnection;
use uuid::Uuid;
use validator::Validate;

use crate::db::connection::{StorePools, StoreTarget};
use crate::error::ConsentMgtError;
use crate::models::attribute::ConsentAttributes;
use crate::models::audit::{ConsentStatusAuditRecord, NewStatusAudit};
use crate::models::authorization::{AuthorizationResource, NewAuthorization};
use crate::models::consent::{ConsentResource, NewConsent};
use crate::models::detailed::DetailedConsentResource;
use crate::models::history::ConsentHistoryResource;
use crate::models::mapping::{ConsentMappingResource, NewMapping, MAPPING_STATUS_ACTIVE, MAPPING_STATUS_INACTIVE};
use crate::repositories::audit::{self as audit_repo, StatusAuditFilters};
use crate::repositories::detailed::{self as detailed_repo, ConsentSearchFilters};
use crate::repositories::{
    attribute as attribute_repo, authorization as authorization_repo, consent as consent_repo,
    history as history_repo, mapping as mapping_repo, transaction,
};
use crate::services::amendment_history;
use crate::services::notifier::{ConsentStateChangeEvent, StateChangeNotifier};
use crate::services::token::TokenRevoker;
use crate::validation::require_non_blank;

const REASON_CONSENT_CREATED: &str = "Consent created";
const REASON_CONSENT_REAUTHORIZED: &str = "Consent re-authorized";
const REASON_CONSENT_AMENDED: &str = "Consent amended";

/// Input for consent creation.
#[derive(Debug, Clone)]
pub struct ConsentCreateRequest {
    pub consent: NewConsent,
    pub attributes: HashMap<String, String>,
    pub user_id: Option<String>,
    pub implicit_auth: Option<ImplicitAuthParams>,
}

/// Parameters of the authorization created implicitly with a consent.
#[derive(Debug, Clone)]
pub struct ImplicitAuthParams {
    pub auth_status: String,
    pub auth_type: String,
}

/// Parameters of the bulk transition run before an exclusive creation.
#[derive(Debug, Clone)]
pub struct ExclusiveCreateParams {
    pub applicable_status: String,
    pub transitioned_status: String,
    pub transition_reason: String,
}

/// Input for consent revocation.
#[derive(Debug, Clone)]
pub struct ConsentRevocation {
    pub consent_id: Uuid,
    pub revoked_status: String,
    pub reason: String,
    pub user_id: Option<String>,
    pub should_revoke_tokens: bool,
}

/// Selector and target state for the bulk revoke of applicable consents.
#[derive(Debug, Clone)]
pub struct ApplicableConsentsQuery {
    pub client_id: String,
    pub user_id: String,
    pub consent_type: String,
    pub applicable_status: String,
    pub new_status: String,
    pub reason: String,
}

/// Input for re-authorization against an existing authorization resource.
#[derive(Debug, Clone)]
pub struct ReAuthorization {
    pub consent_id: Uuid,
    pub authorization_id: Uuid,
    pub user_id: String,
    /// Desired account → permissions map the mappings are reconciled to.
    pub account_permissions: HashMap<String, Vec<String>>,
    pub new_consent_status: String,
}

/// Input for re-authorization that supersedes the prior authorizations with
/// a freshly created one.
#[derive(Debug, Clone)]
pub struct ReAuthorizationWithNewResource {
    pub consent_id: Uuid,
    pub user_id: String,
    pub account_permissions: HashMap<String, Vec<String>>,
    pub new_consent_status: String,
    pub superseded_auth_status: String,
    pub new_auth_status: String,
    pub new_auth_type: String,
}

/// Input for a detailed-consent amendment.
#[derive(Debug, Clone)]
pub struct ConsentAmendment {
    pub consent_id: Uuid,
    pub receipt: Option<String>,
    pub validity_period: Option<i64>,
    pub authorization_id: Option<Uuid>,
    pub account_permissions: HashMap<String, Vec<String>>,
    pub new_status: String,
    pub attributes: HashMap<String, String>,
    pub user_id: Option<String>,
    pub amendment_reason: String,
}

/// A brand-new authorization grant (plus its mappings) inserted verbatim by
/// the bulk amendment variant.
#[derive(Debug, Clone)]
pub struct NewAuthResource {
    pub authorization_type: String,
    pub authorization_status: String,
    pub user_id: Option<String>,
    pub mappings: Vec<NewMappingSpec>,
}

#[derive(Debug, Clone)]
pub struct NewMappingSpec {
    pub account_id: String,
    pub permission: String,
    pub mapping_status: String,
}

/// Outcome of reconciling desired accounts against active mappings.
#[derive(Debug, Default, PartialEq)]
struct MappingDelta {
    /// Active mappings whose account is no longer desired.
    deactivate: Vec<Uuid>,
    /// Active mappings whose account is still desired.
    retain: Vec<Uuid>,
    /// (account, permission) pairs that need fresh active mappings.
    create: Vec<(String, String)>,
}

struct StateChange<'a> {
    consent_id: Uuid,
    client_id: &'a str,
    user_id: Option<&'a str>,
    new_status: &'a str,
    previous_status: Option<&'a str>,
    reason: &'a str,
}

/// Service layer over the consent store. Constructed with its repository
/// pools and collaborator seams passed in explicitly.
#[derive(Clone)]
pub struct ConsentCoreService {
    pools: StorePools,
    notifier: Arc<dyn StateChangeNotifier>,
    token_revoker: Arc<dyn TokenRevoker>,
}

impl ConsentCoreService {
    pub fn new(
        pools: StorePools,
        notifier: Arc<dyn StateChangeNotifier>,
        token_revoker: Arc<dyn TokenRevoker>,
    ) -> Self {
        Self {
            pools,
            notifier,
            token_revoker,
        }
    }

    /// Creates a consent with optional attributes and an optional implicit
    /// authorization, all inside one transaction.
    pub async fn create_consent(
        &self,
        request: ConsentCreateRequest,
    ) -> Result<DetailedConsentResource, ConsentMgtError> {
        Self::check_create_preconditions(&request)?;

        let mut tx = transaction::begin_transaction(self.pools.live()).await?;
        let detailed = self.create_consent_in_tx(tx.as_mut(), request).await?;
        transaction::commit_transaction(tx).await?;
        Ok(detailed)
    }

    /// Creates a consent after bulk-transitioning every existing applicable
    /// consent of the same (client, user, type) out of the way, enforcing
    /// at-most-one-active semantics. One transaction spans both steps.
    pub async fn create_exclusive_consent(
        &self,
        request: ConsentCreateRequest,
        exclusive: ExclusiveCreateParams,
    ) -> Result<DetailedConsentResource, ConsentMgtError> {
        Self::check_create_preconditions(&request)?;
        require_non_blank(&exclusive.applicable_status, "applicable_status")?;
        require_non_blank(&exclusive.transitioned_status, "transitioned_status")?;
        require_non_blank(&exclusive.transition_reason, "transition_reason")?;
        let user_id = request
            .user_id
            .clone()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| {
                ConsentMgtError::Precondition(
                    "user_id must be provided for exclusive consent creation".to_string(),
                )
            })?;

        let mut tx = transaction::begin_transaction(self.pools.live()).await?;
        self.transition_applicable_consents(
            tx.as_mut(),
            &ApplicableConsentsQuery {
                client_id: request.consent.client_id.clone(),
                user_id,
                consent_type: request.consent.consent_type.clone(),
                applicable_status: exclusive.applicable_status,
                new_status: exclusive.transitioned_status,
                reason: exclusive.transition_reason,
            },
        )
        .await?;
        let detailed = self.create_consent_in_tx(tx.as_mut(), request).await?;
        transaction::commit_transaction(tx).await?;
        Ok(detailed)
    }

    pub async fn get_consent(&self, consent_id: Uuid) -> Result<ConsentResource, ConsentMgtError> {
        let mut conn = self.acquire_live().await?;
        Ok(consent_repo::get_consent(&mut conn, consent_id).await?)
    }

    pub async fn get_consent_with_attributes(
        &self,
        consent_id: Uuid,
    ) -> Result<(ConsentResource, ConsentAttributes), ConsentMgtError> {
        let mut conn = self.acquire_live().await?;
        let consent = consent_repo::get_consent(&mut conn, consent_id).await?;
        let attributes = attribute_repo::get_attributes(&mut conn, consent_id).await?;
        Ok((consent, attributes))
    }

    pub async fn get_detailed_consent(
        &self,
        consent_id: Uuid,
    ) -> Result<DetailedConsentResource, ConsentMgtError> {
        let mut conn = self.acquire_live().await?;
        Ok(detailed_repo::get_detailed_consent(&mut conn, consent_id).await?)
    }

    pub async fn get_authorization_resource(
        &self,
        authorization_id: Uuid,
    ) -> Result<AuthorizationResource, ConsentMgtError> {
        let mut conn = self.acquire_live().await?;
        Ok(authorization_repo::get_authorization(&mut conn, authorization_id).await?)
    }

    /// Authorizations filtered by optional consent id and user id; both
    /// absent returns everything.
    pub async fn search_authorizations(
        &self,
        consent_id: Option<Uuid>,
        user_id: Option<&str>,
    ) -> Result<Vec<AuthorizationResource>, ConsentMgtError> {
        let mut conn = self.acquire_live().await?;
        Ok(authorization_repo::search_authorizations(&mut conn, consent_id, user_id).await?)
    }

    /// Binds a user to an authorization that was created unbound.
    pub async fn update_authorization_user(
        &self,
        authorization_id: Uuid,
        user_id: &str,
    ) -> Result<AuthorizationResource, ConsentMgtError> {
        require_non_blank(user_id, "user_id")?;
        let mut tx = transaction::begin_transaction(self.pools.live()).await?;
        let updated =
            authorization_repo::update_authorization_user(tx.as_mut(), authorization_id, user_id)
                .await?;
        transaction::commit_transaction(tx).await?;
        Ok(updated)
    }

    /// Revokes a consent: status transition, deactivation of every active
    /// mapping, one audit record and one amendment-history record set, all
    /// committed atomically. Token revocation, when requested, runs strictly
    /// after commit; its failure surfaces as a business error without
    /// undoing the committed changes.
    pub async fn revoke_consent_with_reason(
        &self,
        revocation: ConsentRevocation,
    ) -> Result<DetailedConsentResource, ConsentMgtError> {
        require_non_blank(&revocation.revoked_status, "revoked_status")?;
        require_non_blank(&revocation.reason, "reason")?;
        if revocation.should_revoke_tokens
            && revocation
                .user_id
                .as_deref()
                .map_or(true, |u| u.trim().is_empty())
        {
            return Err(ConsentMgtError::Precondition(
                "user_id must be provided when token revocation is requested".to_string(),
            ));
        }

        let mut tx = transaction::begin_transaction(self.pools.live()).await?;
        consent_repo::lock_consent(tx.as_mut(), revocation.consent_id).await?;
        let old = detailed_repo::get_detailed_consent(tx.as_mut(), revocation.consent_id).await?;
        if old.current_status == revocation.revoked_status {
            return Err(ConsentMgtError::Precondition(format!(
                "consent {} is already in status {}",
                old.consent_id, old.current_status
            )));
        }

        consent_repo::update_consent_status(
            tx.as_mut(),
            revocation.consent_id,
            &revocation.revoked_status,
        )
        .await?;
        let active = old.active_mapping_ids();
        if !active.is_empty() {
            mapping_repo::update_mapping_status(tx.as_mut(), &active, MAPPING_STATUS_INACTIVE)
                .await?;
        }
        self.post_state_change(
            tx.as_mut(),
            StateChange {
                consent_id: old.consent_id,
                client_id: &old.client_id,
                user_id: revocation.user_id.as_deref(),
                new_status: &revocation.revoked_status,
                previous_status: Some(&old.current_status),
                reason: &revocation.reason,
            },
        )
        .await?;

        let new_snapshot =
            detailed_repo::get_detailed_consent(tx.as_mut(), revocation.consent_id).await?;
        amendment_history::persist_amendment(
            tx.as_mut(),
            Uuid::new_v4(),
            Utc::now().timestamp_millis(),
            &revocation.reason,
            &old,
            &new_snapshot,
        )
        .await?;
        transaction::commit_transaction(tx).await?;

        if revocation.should_revoke_tokens {
            let user_id = revocation.user_id.as_deref().unwrap_or_default();
            self.token_revoker
                .revoke_tokens(&old.client_id, user_id, old.consent_id)
                .await
                .map_err(|source| ConsentMgtError::TokenRevocation {
                    consent_id: old.consent_id,
                    source,
                })?;
        }
        Ok(new_snapshot)
    }

    /// Bulk revoke: every consent matching (client, user, type, applicable
    /// status) is transitioned with its own audit record; the affected
    /// mapping ids accumulate into one final batched deactivation. Returns
    /// the number of consents transitioned.
    pub async fn revoke_existing_applicable_consents(
        &self,
        query: ApplicableConsentsQuery,
        should_revoke_tokens: bool,
    ) -> Result<usize, ConsentMgtError> {
        require_non_blank(&query.client_id, "client_id")?;
        require_non_blank(&query.user_id, "user_id")?;
        require_non_blank(&query.consent_type, "consent_type")?;
        require_non_blank(&query.applicable_status, "applicable_status")?;
        require_non_blank(&query.new_status, "new_status")?;
        require_non_blank(&query.reason, "reason")?;

        let mut tx = transaction::begin_transaction(self.pools.live()).await?;
        let transitioned = self.transition_applicable_consents(tx.as_mut(), &query).await?;
        transaction::commit_transaction(tx).await?;

        if should_revoke_tokens {
            for consent in &transitioned {
                self.token_revoker
                    .revoke_tokens(&consent.client_id, &query.user_id, consent.consent_id)
                    .await
                    .map_err(|source| ConsentMgtError::TokenRevocation {
                        consent_id: consent.consent_id,
                        source,
                    })?;
            }
        }
        Ok(transitioned.len())
    }

    /// Reconciles the desired account/permission map against one
    /// authorization's active mappings, then transitions the consent.
    pub async fn re_authorize_existing_auth_resource(
        &self,
        request: ReAuthorization,
    ) -> Result<DetailedConsentResource, ConsentMgtError> {
        require_non_blank(&request.user_id, "user_id")?;
        require_non_blank(&request.new_consent_status, "new_consent_status")?;
        if request.account_permissions.is_empty() {
            return Err(ConsentMgtError::Precondition(
                "account_permissions must not be empty".to_string(),
            ));
        }

        let mut tx = transaction::begin_transaction(self.pools.live()).await?;
        consent_repo::lock_consent(tx.as_mut(), request.consent_id).await?;
        let detailed = detailed_repo::get_detailed_consent(tx.as_mut(), request.consent_id).await?;
        Self::authorization_of(&detailed, request.authorization_id)?;

        let existing_active = mapping_repo::get_mappings_for_authorization(
            tx.as_mut(),
            request.authorization_id,
            Some(MAPPING_STATUS_ACTIVE),
        )
        .await?;
        let existing_refs: Vec<&ConsentMappingResource> = existing_active.iter().collect();
        let delta = reconcile_account_mappings(&existing_refs, &request.account_permissions);
        self.apply_mapping_delta(tx.as_mut(), request.authorization_id, &delta).await?;

        consent_repo::update_consent_status(
            tx.as_mut(),
            request.consent_id,
            &request.new_consent_status,
        )
        .await?;
        self.post_state_change(
            tx.as_mut(),
            StateChange {
                consent_id: detailed.consent_id,
                client_id: &detailed.client_id,
                user_id: Some(&request.user_id),
                new_status: &request.new_consent_status,
                previous_status: Some(&detailed.current_status),
                reason: REASON_CONSENT_REAUTHORIZED,
            },
        )
        .await?;

        let new_snapshot =
            detailed_repo::get_detailed_consent(tx.as_mut(), request.consent_id).await?;
        transaction::commit_transaction(tx).await?;
        Ok(new_snapshot)
    }

    /// Re-authorization that supersedes the prior authorizations: a fresh
    /// authorization is created for the user, retained active mappings are
    /// re-parented onto it, and the add/remove delta is applied against the
    /// union of previously active accounts.
    pub async fn re_authorize_with_new_auth_resource(
        &self,
        request: ReAuthorizationWithNewResource,
    ) -> Result<DetailedConsentResource, ConsentMgtError> {
        require_non_blank(&request.user_id, "user_id")?;
        require_non_blank(&request.new_consent_status, "new_consent_status")?;
        require_non_blank(&request.superseded_auth_status, "superseded_auth_status")?;
        require_non_blank(&request.new_auth_status, "new_auth_status")?;
        require_non_blank(&request.new_auth_type, "new_auth_type")?;
        if request.account_permissions.is_empty() {
            return Err(ConsentMgtError::Precondition(
                "account_permissions must not be empty".to_string(),
            ));
        }

        let mut tx = transaction::begin_transaction(self.pools.live()).await?;
        consent_repo::lock_consent(tx.as_mut(), request.consent_id).await?;
        let detailed = detailed_repo::get_detailed_consent(tx.as_mut(), request.consent_id).await?;

        for authorization in &detailed.authorizations {
            authorization_repo::update_authorization_status(
                tx.as_mut(),
                authorization.authorization_id,
                &request.superseded_auth_status,
            )
            .await?;
        }
        let new_authorization = authorization_repo::store_authorization(
            tx.as_mut(),
            NewAuthorization {
                authorization_id: None,
                consent_id: request.consent_id,
                authorization_type: request.new_auth_type.clone(),
                user_id: Some(request.user_id.clone()),
                authorization_status: request.new_auth_status.clone(),
                updated_time: None,
            },
        )
        .await?;

        let existing_active: Vec<&ConsentMappingResource> =
            detailed.mappings.iter().filter(|m| m.is_active()).collect();
        let delta = reconcile_account_mappings(&existing_active, &request.account_permissions);
        if !delta.retain.is_empty() {
            mapping_repo::reparent_mappings(
                tx.as_mut(),
                &delta.retain,
                new_authorization.authorization_id,
            )
            .await?;
        }
        self.apply_mapping_delta(tx.as_mut(), new_authorization.authorization_id, &delta)
            .await?;

        consent_repo::update_consent_status(
            tx.as_mut(),
            request.consent_id,
            &request.new_consent_status,
        )
        .await?;
        self.post_state_change(
            tx.as_mut(),
            StateChange {
                consent_id: detailed.consent_id,
                client_id: &detailed.client_id,
                user_id: Some(&request.user_id),
                new_status: &request.new_consent_status,
                previous_status: Some(&detailed.current_status),
                reason: REASON_CONSENT_REAUTHORIZED,
            },
        )
        .await?;

        let new_snapshot =
            detailed_repo::get_detailed_consent(tx.as_mut(), request.consent_id).await?;
        transaction::commit_transaction(tx).await?;
        Ok(new_snapshot)
    }

    /// Amends a detailed consent: optional receipt/validity update, mapping
    /// reconciliation, full attribute replace and a status transition, with
    /// one amendment-history record set always written from the pre/post
    /// snapshots.
    pub async fn amend_detailed_consent(
        &self,
        amendment: ConsentAmendment,
    ) -> Result<DetailedConsentResource, ConsentMgtError> {
        self.amend_detailed_consent_inner(amendment, Vec::new()).await
    }

    /// Amendment variant that additionally inserts caller-supplied
    /// brand-new authorization grants with their mappings, verbatim.
    pub async fn amend_detailed_consent_with_bulk_auth_resources(
        &self,
        amendment: ConsentAmendment,
        new_resources: Vec<NewAuthResource>,
    ) -> Result<DetailedConsentResource, ConsentMgtError> {
        if new_resources.is_empty() {
            return Err(ConsentMgtError::Precondition(
                "new_resources must not be empty".to_string(),
            ));
        }
        self.amend_detailed_consent_inner(amendment, new_resources).await
    }

    async fn amend_detailed_consent_inner(
        &self,
        amendment: ConsentAmendment,
        new_resources: Vec<NewAuthResource>,
    ) -> Result<DetailedConsentResource, ConsentMgtError> {
        if amendment.receipt.is_none() && amendment.validity_period.is_none() {
            return Err(ConsentMgtError::Precondition(
                "either receipt or validity_period must be provided".to_string(),
            ));
        }
        require_non_blank(&amendment.new_status, "new_status")?;
        require_non_blank(&amendment.amendment_reason, "amendment_reason")?;
        match (
            amendment.authorization_id,
            amendment.account_permissions.is_empty(),
        ) {
            (Some(_), true) => {
                return Err(ConsentMgtError::Precondition(
                    "account_permissions must not be empty when authorization_id is given"
                        .to_string(),
                ));
            }
            (None, false) => {
                return Err(ConsentMgtError::Precondition(
                    "authorization_id must be given when account_permissions are provided"
                        .to_string(),
                ));
            }
            _ => {}
        }
        for resource in &new_resources {
            require_non_blank(&resource.authorization_type, "authorization_type")?;
            require_non_blank(&resource.authorization_status, "authorization_status")?;
            for mapping in &resource.mappings {
                require_non_blank(&mapping.account_id, "account_id")?;
                require_non_blank(&mapping.permission, "permission")?;
                require_non_blank(&mapping.mapping_status, "mapping_status")?;
            }
        }

        let mut tx = transaction::begin_transaction(self.pools.live()).await?;
        consent_repo::lock_consent(tx.as_mut(), amendment.consent_id).await?;
        let old = detailed_repo::get_detailed_consent(tx.as_mut(), amendment.consent_id).await?;

        if let Some(receipt) = amendment.receipt.as_deref() {
            consent_repo::update_consent_receipt(tx.as_mut(), amendment.consent_id, receipt)
                .await?;
        }
        if let Some(validity_period) = amendment.validity_period {
            consent_repo::update_consent_validity_period(
                tx.as_mut(),
                amendment.consent_id,
                validity_period,
            )
            .await?;
        }
        consent_repo::update_consent_status(tx.as_mut(), amendment.consent_id, &amendment.new_status)
            .await?;

        if let Some(authorization_id) = amendment.authorization_id {
            Self::authorization_of(&old, authorization_id)?;
            let existing_active = old.active_mappings_for(authorization_id);
            let delta = reconcile_account_mappings(&existing_active, &amendment.account_permissions);
            self.apply_mapping_delta(tx.as_mut(), authorization_id, &delta).await?;
        }

        // Full replace: the resulting attribute set is exactly the caller's.
        let existing_keys: Vec<String> = old.attributes.keys().cloned().collect();
        if !existing_keys.is_empty() {
            attribute_repo::delete_attributes(tx.as_mut(), amendment.consent_id, &existing_keys)
                .await?;
        }
        if !amendment.attributes.is_empty() {
            attribute_repo::store_attributes(
                tx.as_mut(),
                amendment.consent_id,
                &amendment.attributes,
            )
            .await?;
        }

        for resource in new_resources {
            let authorization = authorization_repo::store_authorization(
                tx.as_mut(),
                NewAuthorization {
                    authorization_id: None,
                    consent_id: amendment.consent_id,
                    authorization_type: resource.authorization_type,
                    user_id: resource.user_id,
                    authorization_status: resource.authorization_status,
                    updated_time: None,
                },
            )
            .await?;
            for mapping in resource.mappings {
                mapping_repo::store_mapping(
                    tx.as_mut(),
                    NewMapping {
                        mapping_id: None,
                        authorization_id: authorization.authorization_id,
                        account_id: mapping.account_id,
                        permission: mapping.permission,
                        mapping_status: mapping.mapping_status,
                    },
                )
                .await?;
            }
        }

        self.post_state_change(
            tx.as_mut(),
            StateChange {
                consent_id: old.consent_id,
                client_id: &old.client_id,
                user_id: amendment.user_id.as_deref(),
                new_status: &amendment.new_status,
                previous_status: Some(&old.current_status),
                reason: REASON_CONSENT_AMENDED,
            },
        )
        .await?;

        let new_snapshot =
            detailed_repo::get_detailed_consent(tx.as_mut(), amendment.consent_id).await?;
        amendment_history::persist_amendment(
            tx.as_mut(),
            Uuid::new_v4(),
            Utc::now().timestamp_millis(),
            &amendment.amendment_reason,
            &old,
            &new_snapshot,
        )
        .await?;
        transaction::commit_transaction(tx).await?;
        Ok(new_snapshot)
    }

    /// Search pass-through; `target` routes to the live or retention store.
    pub async fn search_detailed_consents(
        &self,
        filters: ConsentSearchFilters,
        target: StoreTarget,
    ) -> Result<Vec<DetailedConsentResource>, ConsentMgtError> {
        let pool = self.pools.pool_for(target)?;
        let mut conn = pool.acquire().await.map_err(ConsentMgtError::Transaction)?;
        Ok(detailed_repo::search_consents(&mut conn, &filters).await?)
    }

    pub async fn store_consent_attributes(
        &self,
        consent_id: Uuid,
        attributes: HashMap<String, String>,
    ) -> Result<(), ConsentMgtError> {
        if attributes.is_empty() {
            return Err(ConsentMgtError::Precondition(
                "attributes must not be empty".to_string(),
            ));
        }
        let mut tx = transaction::begin_transaction(self.pools.live()).await?;
        consent_repo::get_consent(tx.as_mut(), consent_id).await?;
        attribute_repo::store_attributes(tx.as_mut(), consent_id, &attributes).await?;
        transaction::commit_transaction(tx).await
    }

    pub async fn get_consent_attributes(
        &self,
        consent_id: Uuid,
    ) -> Result<ConsentAttributes, ConsentMgtError> {
        let mut conn = self.acquire_live().await?;
        consent_repo::get_consent(&mut conn, consent_id).await?;
        Ok(attribute_repo::get_attributes(&mut conn, consent_id).await?)
    }

    pub async fn get_consent_attributes_for_keys(
        &self,
        consent_id: Uuid,
        keys: Vec<String>,
    ) -> Result<ConsentAttributes, ConsentMgtError> {
        if keys.is_empty() {
            return Err(ConsentMgtError::Precondition(
                "attribute keys must not be empty".to_string(),
            ));
        }
        let mut conn = self.acquire_live().await?;
        Ok(attribute_repo::get_attributes_for_keys(&mut conn, consent_id, &keys).await?)
    }

    pub async fn get_consent_attributes_by_name(
        &self,
        attribute_name: &str,
    ) -> Result<HashMap<Uuid, String>, ConsentMgtError> {
        require_non_blank(attribute_name, "attribute_name")?;
        let mut conn = self.acquire_live().await?;
        Ok(attribute_repo::get_attributes_by_name(&mut conn, attribute_name).await?)
    }

    pub async fn get_consent_id_by_consent_attribute_name_and_value(
        &self,
        attribute_name: &str,
        attribute_value: &str,
    ) -> Result<Vec<Uuid>, ConsentMgtError> {
        require_non_blank(attribute_name, "attribute_name")?;
        require_non_blank(attribute_value, "attribute_value")?;
        let mut conn = self.acquire_live().await?;
        Ok(attribute_repo::get_consent_ids_by_attribute_name_and_value(
            &mut conn,
            attribute_name,
            attribute_value,
        )
        .await?)
    }

    pub async fn delete_consent_attributes(
        &self,
        consent_id: Uuid,
        keys: Vec<String>,
    ) -> Result<(), ConsentMgtError> {
        if keys.is_empty() {
            return Err(ConsentMgtError::Precondition(
                "attribute keys must not be empty".to_string(),
            ));
        }
        let mut tx = transaction::begin_transaction(self.pools.live()).await?;
        attribute_repo::delete_attributes(tx.as_mut(), consent_id, &keys).await?;
        transaction::commit_transaction(tx).await
    }

    pub async fn search_consent_status_audit_records(
        &self,
        filters: StatusAuditFilters,
    ) -> Result<Vec<ConsentStatusAuditRecord>, ConsentMgtError> {
        let mut conn = self.acquire_live().await?;
        Ok(audit_repo::search_status_audit_records(&mut conn, &filters).await?)
    }

    pub async fn get_consent_status_audit_records(
        &self,
        consent_ids: Vec<Uuid>,
        limit: Option<i64>,
        offset: Option<i64>,
        target: StoreTarget,
    ) -> Result<Vec<ConsentStatusAuditRecord>, ConsentMgtError> {
        if consent_ids.is_empty() {
            return Err(ConsentMgtError::Precondition(
                "consent_ids must not be empty".to_string(),
            ));
        }
        let pool = self.pools.pool_for(target)?;
        let mut conn = pool.acquire().await.map_err(ConsentMgtError::Transaction)?;
        Ok(audit_repo::get_audit_records_for_consents(&mut conn, &consent_ids, limit, offset)
            .await?)
    }

    /// Retrieves the amendment history of a consent and rebuilds every
    /// historical snapshot by replaying the stored diffs onto the current
    /// state, newest first.
    pub async fn get_consent_amendment_history_data(
        &self,
        consent_id: Uuid,
    ) -> Result<Vec<ConsentHistoryResource>, ConsentMgtError> {
        let mut conn = self.acquire_live().await?;
        let current = detailed_repo::get_detailed_consent(&mut conn, consent_id).await?;
        let record_ids = current.history_record_ids();
        let entries =
            history_repo::retrieve_amendment_history(&mut conn, consent_id, &record_ids).await?;
        Ok(amendment_history::reconstruct_history(&current, entries))
    }

    fn check_create_preconditions(request: &ConsentCreateRequest) -> Result<(), ConsentMgtError> {
        request.consent.validate()?;
        if let Some(auth) = request.implicit_auth.as_ref() {
            require_non_blank(&auth.auth_status, "auth_status")?;
            require_non_blank(&auth.auth_type, "auth_type")?;
        }
        Ok(())
    }

    async fn create_consent_in_tx(
        &self,
        conn: &mut PgConnection,
        request: ConsentCreateRequest,
    ) -> Result<DetailedConsentResource, ConsentMgtError> {
        let consent = consent_repo::store_consent(conn, request.consent).await?;
        if !request.attributes.is_empty() {
            attribute_repo::store_attributes(conn, consent.consent_id, &request.attributes).await?;
        }

        let mut authorizations: Vec<AuthorizationResource> = Vec::new();
        if let Some(auth) = request.implicit_auth {
            let stored = authorization_repo::store_authorization(
                conn,
                NewAuthorization {
                    authorization_id: None,
                    consent_id: consent.consent_id,
                    authorization_type: auth.auth_type,
                    user_id: request.user_id.clone(),
                    authorization_status: auth.auth_status,
                    updated_time: None,
                },
            )
            .await?;
            authorizations.push(stored);
        }

        self.post_state_change(
            conn,
            StateChange {
                consent_id: consent.consent_id,
                client_id: &consent.client_id,
                user_id: request.user_id.as_deref(),
                new_status: &consent.current_status,
                previous_status: None,
                reason: REASON_CONSENT_CREATED,
            },
        )
        .await?;

        Ok(DetailedConsentResource {
            consent_id: consent.consent_id,
            client_id: consent.client_id,
            receipt: consent.receipt,
            consent_type: consent.consent_type,
            current_status: consent.current_status,
            consent_frequency: consent.consent_frequency,
            validity_period: consent.validity_period,
            recurring_indicator: consent.recurring_indicator,
            created_time: consent.created_time,
            updated_time: consent.updated_time,
            authorizations,
            mappings: Vec::new(),
            attributes: request.attributes,
        })
    }

    /// Transitions every consent matching the query, auditing each one, and
    /// deactivates all affected mappings in one final batched call.
    async fn transition_applicable_consents(
        &self,
        conn: &mut PgConnection,
        query: &ApplicableConsentsQuery,
    ) -> Result<Vec<DetailedConsentResource>, ConsentMgtError> {
        let filters = ConsentSearchFilters {
            client_ids: vec![query.client_id.clone()],
            consent_types: vec![query.consent_type.clone()],
            consent_statuses: vec![query.applicable_status.clone()],
            user_ids: vec![query.user_id.clone()],
            ..Default::default()
        };
        let matches = detailed_repo::search_consents(conn, &filters).await?;

        let mut mapping_ids: Vec<Uuid> = Vec::new();
        for consent in &matches {
            consent_repo::update_consent_status(conn, consent.consent_id, &query.new_status)
                .await?;
            self.post_state_change(
                conn,
                StateChange {
                    consent_id: consent.consent_id,
                    client_id: &consent.client_id,
                    user_id: Some(&query.user_id),
                    new_status: &query.new_status,
                    previous_status: Some(&consent.current_status),
                    reason: &query.reason,
                },
            )
            .await?;
            mapping_ids.extend(consent.active_mapping_ids());
        }
        if !mapping_ids.is_empty() {
            mapping_repo::update_mapping_status(conn, &mapping_ids, MAPPING_STATUS_INACTIVE)
                .await?;
        }
        Ok(matches)
    }

    async fn apply_mapping_delta(
        &self,
        conn: &mut PgConnection,
        authorization_id: Uuid,
        delta: &MappingDelta,
    ) -> Result<(), ConsentMgtError> {
        if !delta.deactivate.is_empty() {
            mapping_repo::update_mapping_status(conn, &delta.deactivate, MAPPING_STATUS_INACTIVE)
                .await?;
        }
        for (account_id, permission) in &delta.create {
            mapping_repo::store_mapping(
                conn,
                NewMapping {
                    mapping_id: None,
                    authorization_id,
                    account_id: account_id.clone(),
                    permission: permission.clone(),
                    mapping_status: MAPPING_STATUS_ACTIVE.to_string(),
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Writes exactly one audit record for the transition, then publishes
    /// the lifecycle event.
    async fn post_state_change(
        &self,
        conn: &mut PgConnection,
        change: StateChange<'_>,
    ) -> Result<ConsentStatusAuditRecord, ConsentMgtError> {
        let audit = audit_repo::store_status_audit_record(
            conn,
            NewStatusAudit {
                status_audit_id: None,
                consent_id: change.consent_id,
                current_status: change.new_status.to_string(),
                action_time: None,
                reason: change.reason.to_string(),
                action_by: change.user_id.map(str::to_string),
                previous_status: change.previous_status.map(str::to_string),
            },
        )
        .await?;

        self.notifier
            .notify(ConsentStateChangeEvent {
                consent_id: change.consent_id,
                client_id: change.client_id.to_string(),
                user_id: change.user_id.map(str::to_string),
                previous_status: change.previous_status.map(str::to_string),
                new_status: change.new_status.to_string(),
                reason: change.reason.to_string(),
                metadata: HashMap::new(),
            })
            .await;
        Ok(audit)
    }

    fn authorization_of(
        detailed: &DetailedConsentResource,
        authorization_id: Uuid,
    ) -> Result<&AuthorizationResource, ConsentMgtError> {
        detailed
            .authorizations
            .iter()
            .find(|a| a.authorization_id == authorization_id)
            .ok_or_else(|| {
                ConsentMgtError::Precondition(format!(
                    "authorization {} does not belong to consent {}",
                    authorization_id, detailed.consent_id
                ))
            })
    }

    async fn acquire_live(
        &self,
    ) -> Result<sqlx::pool::PoolConnection<sqlx::Postgres>, ConsentMgtError> {
        self.pools
            .live()
            .acquire()
            .await
            .map_err(ConsentMgtError::Transaction)
    }
}

/// Computes the add/remove delta between an authorization's active mappings
/// and the desired account → permissions map. Accounts are the unit of
/// reconciliation: an account present on both sides keeps its mappings
/// untouched.
fn reconcile_account_mappings(
    existing_active: &[&ConsentMappingResource],
    desired: &HashMap<String, Vec<String>>,
) -> MappingDelta {
    let mut delta = MappingDelta::default();
    let existing_accounts: HashSet<&str> = existing_active
        .iter()
        .map(|m| m.account_id.as_str())
        .collect();

    for mapping in existing_active {
        if desired.contains_key(&mapping.account_id) {
            delta.retain.push(mapping.mapping_id);
        } else {
            delta.deactivate.push(mapping.mapping_id);
        }
    }

    let mut desired_accounts: Vec<&String> = desired.keys().collect();
    desired_accounts.sort();
    for account in desired_accounts {
        if !existing_accounts.contains(account.as_str()) {
            for permission in &desired[account] {
                delta.create.push((account.clone(), permission.clone()));
            }
        }
    }
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::StorePools;
    use crate::services::notifier::TracingNotifier;
    use crate::services::token::NoopTokenRevoker;
    use sqlx::postgres::PgPoolOptions;

    fn mapping(account: &str, status: &str) -> ConsentMappingResource {
        ConsentMappingResource {
            mapping_id: Uuid::new_v4(),
            authorization_id: Uuid::new_v4(),
            account_id: account.to_string(),
            permission: "read".to_string(),
            mapping_status: status.to_string(),
        }
    }

    fn service() -> ConsentCoreService {
        // A lazy pool never connects; precondition tests return before any
        // connection is acquired.
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/consentkeeper")
            .expect("lazy pool");
        ConsentCoreService::new(
            StorePools::new(Arc::new(pool), None),
            Arc::new(TracingNotifier),
            Arc::new(NoopTokenRevoker),
        )
    }

    fn create_request() -> ConsentCreateRequest {
        ConsentCreateRequest {
            consent: NewConsent {
                consent_id: None,
                client_id: "client-1".to_string(),
                receipt: "{}".to_string(),
                consent_type: "accounts".to_string(),
                current_status: "AwaitingAuthorisation".to_string(),
                consent_frequency: 0,
                validity_period: 3600,
                recurring_indicator: false,
                created_time: None,
                updated_time: None,
            },
            attributes: HashMap::new(),
            user_id: Some("user-1".to_string()),
            implicit_auth: None,
        }
    }

    #[test]
    fn reconcile_computes_the_expected_delta() {
        let kept = mapping("B", MAPPING_STATUS_ACTIVE);
        let dropped = mapping("C", MAPPING_STATUS_ACTIVE);
        let existing = vec![&kept, &dropped];

        let mut desired = HashMap::new();
        desired.insert("A".to_string(), vec!["read".to_string()]);
        desired.insert("B".to_string(), vec!["read".to_string()]);

        let delta = reconcile_account_mappings(&existing, &desired);
        assert_eq!(delta.deactivate, vec![dropped.mapping_id]);
        assert_eq!(delta.retain, vec![kept.mapping_id]);
        assert_eq!(delta.create, vec![("A".to_string(), "read".to_string())]);
    }

    #[test]
    fn reconcile_creates_one_mapping_per_permission() {
        let existing: Vec<&ConsentMappingResource> = Vec::new();
        let mut desired = HashMap::new();
        desired.insert(
            "A".to_string(),
            vec!["read".to_string(), "write".to_string()],
        );

        let delta = reconcile_account_mappings(&existing, &desired);
        assert_eq!(
            delta.create,
            vec![
                ("A".to_string(), "read".to_string()),
                ("A".to_string(), "write".to_string()),
            ]
        );
        assert!(delta.deactivate.is_empty());
        assert!(delta.retain.is_empty());
    }

    #[test]
    fn reconcile_with_identical_sets_changes_nothing() {
        let kept = mapping("A", MAPPING_STATUS_ACTIVE);
        let existing = vec![&kept];
        let mut desired = HashMap::new();
        desired.insert("A".to_string(), vec!["read".to_string()]);

        let delta = reconcile_account_mappings(&existing, &desired);
        assert!(delta.deactivate.is_empty());
        assert!(delta.create.is_empty());
        assert_eq!(delta.retain, vec![kept.mapping_id]);
    }

    #[tokio::test]
    async fn create_consent_rejects_blank_client_id_before_touching_the_store() {
        let mut request = create_request();
        request.consent.client_id = " ".to_string();
        let error = service().create_consent(request).await.unwrap_err();
        assert!(matches!(error, ConsentMgtError::Precondition(_)));
    }

    #[tokio::test]
    async fn create_consent_requires_auth_params_for_implicit_auth() {
        let mut request = create_request();
        request.implicit_auth = Some(ImplicitAuthParams {
            auth_status: String::new(),
            auth_type: "authorisation".to_string(),
        });
        let error = service().create_consent(request).await.unwrap_err();
        assert!(matches!(error, ConsentMgtError::Precondition(_)));
    }

    #[tokio::test]
    async fn exclusive_create_requires_a_user() {
        let mut request = create_request();
        request.user_id = None;
        let error = service()
            .create_exclusive_consent(
                request,
                ExclusiveCreateParams {
                    applicable_status: "Authorised".to_string(),
                    transitioned_status: "Revoked".to_string(),
                    transition_reason: "Superseded by a new consent".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(error, ConsentMgtError::Precondition(_)));
    }

    #[tokio::test]
    async fn amend_requires_receipt_or_validity() {
        let amendment = ConsentAmendment {
            consent_id: Uuid::new_v4(),
            receipt: None,
            validity_period: None,
            authorization_id: None,
            account_permissions: HashMap::new(),
            new_status: "Authorised".to_string(),
            attributes: HashMap::new(),
            user_id: None,
            amendment_reason: "update".to_string(),
        };
        let error = service().amend_detailed_consent(amendment).await.unwrap_err();
        assert!(matches!(error, ConsentMgtError::Precondition(_)));
    }

    #[tokio::test]
    async fn amend_rejects_account_permissions_without_authorization() {
        let mut permissions = HashMap::new();
        permissions.insert("acc-1".to_string(), vec!["read".to_string()]);
        let amendment = ConsentAmendment {
            consent_id: Uuid::new_v4(),
            receipt: Some("{}".to_string()),
            validity_period: None,
            authorization_id: None,
            account_permissions: permissions,
            new_status: "Authorised".to_string(),
            attributes: HashMap::new(),
            user_id: None,
            amendment_reason: "update".to_string(),
        };
        let error = service().amend_detailed_consent(amendment).await.unwrap_err();
        assert!(matches!(error, ConsentMgtError::Precondition(_)));
    }

    #[tokio::test]
    async fn revoke_with_token_revocation_requires_a_user() {
        let revocation = ConsentRevocation {
            consent_id: Uuid::new_v4(),
            revoked_status: "Revoked".to_string(),
            reason: "user requested".to_string(),
            user_id: None,
            should_revoke_tokens: true,
        };
        let error = service()
            .revoke_consent_with_reason(revocation)
            .await
            .unwrap_err();
        assert!(matches!(error, ConsentMgtError::Precondition(_)));
    }
}
