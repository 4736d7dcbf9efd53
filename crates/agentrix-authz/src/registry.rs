//! Authorization registry
//!
//! Owns grant records. Counters are only moved by `record_usage`, after the
//! caller confirms that a payment actually executed.

use std::sync::Arc;

use agentrix_types::{AgentId, AgentrixError, AuthorizationId, MerchantId, Result, UserId};
use chrono::{DateTime, Duration, FixedOffset, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::authorization::{Authorization, AuthorizationStatus};
use crate::store::AuthorizationStore;

/// Request to create a grant
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateAuthorization {
    pub user_id: UserId,
    pub agent_id: Option<AgentId>,
    pub description: Option<String>,
    pub merchant_scope: Option<Vec<MerchantId>>,
    pub category_scope: Option<Vec<String>>,
    pub single_tx_limit: Option<Decimal>,
    pub daily_limit: Option<Decimal>,
    pub monthly_limit: Option<Decimal>,
    pub total_limit: Option<Decimal>,
    pub auto_pay: bool,
    /// Validity from creation; `None` never expires
    pub duration: Option<Duration>,
}

/// Mutable fields of a grant; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateAuthorization {
    pub description: Option<String>,
    pub merchant_scope: Option<Vec<MerchantId>>,
    pub category_scope: Option<Vec<String>>,
    pub single_tx_limit: Option<Decimal>,
    pub daily_limit: Option<Decimal>,
    pub monthly_limit: Option<Decimal>,
    pub total_limit: Option<Decimal>,
}

/// Listing filter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthorizationFilter {
    pub agent_id: Option<AgentId>,
    pub status: Option<AuthorizationStatus>,
    pub auto_pay: Option<bool>,
}

impl AuthorizationFilter {
    fn matches(&self, a: &Authorization) -> bool {
        self.agent_id
            .as_ref()
            .map_or(true, |agent| a.agent_id.as_ref() == Some(agent))
            && self.status.map_or(true, |s| a.status == s)
            && self.auto_pay.map_or(true, |flag| a.auto_pay == flag)
    }
}

fn validate_limits(limits: [(&str, Option<Decimal>); 4]) -> Result<()> {
    for (field, limit) in limits {
        if let Some(limit) = limit {
            if limit.is_sign_negative() {
                return Err(AgentrixError::invalid_input(field, "limit must not be negative"));
            }
        }
    }
    Ok(())
}

fn ensure_owner(authorization: &Authorization, caller: &UserId) -> Result<()> {
    if &authorization.user_id != caller {
        return Err(AgentrixError::forbidden("authorization", &authorization.id, caller));
    }
    Ok(())
}

/// The Agentrix authorization registry
#[derive(Clone)]
pub struct AuthorizationRegistry {
    store: Arc<dyn AuthorizationStore>,
    offset: FixedOffset,
}

impl AuthorizationRegistry {
    pub fn new(store: Arc<dyn AuthorizationStore>, offset: FixedOffset) -> Self {
        Self { store, offset }
    }

    pub fn store(&self) -> &Arc<dyn AuthorizationStore> {
        &self.store
    }

    /// Create a grant
    pub async fn create(&self, request: CreateAuthorization) -> Result<Authorization> {
        self.create_at(request, Utc::now()).await
    }

    pub async fn create_at(&self, request: CreateAuthorization, now: DateTime<Utc>) -> Result<Authorization> {
        validate_limits([
            ("single_tx_limit", request.single_tx_limit),
            ("daily_limit", request.daily_limit),
            ("monthly_limit", request.monthly_limit),
            ("total_limit", request.total_limit),
        ])?;

        let expires_at = match request.duration {
            Some(d) if d <= Duration::zero() => {
                return Err(AgentrixError::invalid_input("duration", "must be positive"));
            }
            Some(d) => Some(now + d),
            None => None,
        };

        let authorization = Authorization {
            id: AuthorizationId::new(),
            user_id: request.user_id,
            agent_id: request.agent_id,
            description: request.description,
            merchant_scope: request.merchant_scope,
            category_scope: request.category_scope,
            single_tx_limit: request.single_tx_limit,
            daily_limit: request.daily_limit,
            monthly_limit: request.monthly_limit,
            total_limit: request.total_limit,
            status: AuthorizationStatus::Active,
            auto_pay: request.auto_pay,
            expires_at,
            used_today: Decimal::ZERO,
            used_this_month: Decimal::ZERO,
            total_used: Decimal::ZERO,
            last_daily_reset: now,
            last_monthly_reset: now,
            created_at: now,
            updated_at: now,
        };

        self.store.insert(authorization.clone()).await?;
        info!(
            authorization_id = %authorization.id,
            user_id = %authorization.user_id,
            agent_id = ?authorization.agent_id,
            "Authorization created"
        );
        Ok(authorization)
    }

    pub async fn get(&self, id: &AuthorizationId) -> Result<Authorization> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| AgentrixError::not_found("authorization", id))
    }

    /// Grants of `user` matching `filter`, newest first
    pub async fn list(&self, user: &UserId, filter: &AuthorizationFilter) -> Result<Vec<Authorization>> {
        let grants = self.store.list_for_user(user).await?;
        Ok(grants.into_iter().filter(|a| filter.matches(a)).collect())
    }

    /// Active grants that cover (user, agent), newest first
    pub async fn active_for(&self, user: &UserId, agent: &AgentId) -> Result<Vec<Authorization>> {
        let grants = self.store.list_for_user(user).await?;
        Ok(grants
            .into_iter()
            .filter(|a| a.status == AuthorizationStatus::Active && a.applies_to(user, agent))
            .collect())
    }

    /// Update limits, scopes or description
    pub async fn update(
        &self,
        caller: &UserId,
        id: &AuthorizationId,
        patch: UpdateAuthorization,
    ) -> Result<Authorization> {
        ensure_owner(&self.get(id).await?, caller)?;
        validate_limits([
            ("single_tx_limit", patch.single_tx_limit),
            ("daily_limit", patch.daily_limit),
            ("monthly_limit", patch.monthly_limit),
            ("total_limit", patch.total_limit),
        ])?;

        let updated = self
            .store
            .update(
                id,
                Box::new(move |a: &mut Authorization| {
                    if a.status.is_terminal() {
                        return Err(AgentrixError::invalid_transition(
                            "authorization",
                            &a.id,
                            a.status,
                            "update",
                        ));
                    }
                    if let Some(v) = patch.description {
                        a.description = Some(v);
                    }
                    if let Some(v) = patch.merchant_scope {
                        a.merchant_scope = Some(v);
                    }
                    if let Some(v) = patch.category_scope {
                        a.category_scope = Some(v);
                    }
                    if let Some(v) = patch.single_tx_limit {
                        a.single_tx_limit = Some(v);
                    }
                    if let Some(v) = patch.daily_limit {
                        a.daily_limit = Some(v);
                    }
                    if let Some(v) = patch.monthly_limit {
                        a.monthly_limit = Some(v);
                    }
                    if let Some(v) = patch.total_limit {
                        a.total_limit = Some(v);
                    }
                    a.updated_at = Utc::now();
                    Ok(())
                }),
            )
            .await?;

        info!(authorization_id = %id, "Authorization updated");
        Ok(updated)
    }

    /// Revoke a grant; revoking twice is a no-op
    pub async fn revoke(&self, caller: &UserId, id: &AuthorizationId) -> Result<Authorization> {
        ensure_owner(&self.get(id).await?, caller)?;
        let revoked = self
            .store
            .update(
                id,
                Box::new(|a: &mut Authorization| {
                    if a.status != AuthorizationStatus::Revoked {
                        a.status = AuthorizationStatus::Revoked;
                        a.updated_at = Utc::now();
                    }
                    Ok(())
                }),
            )
            .await?;

        info!(authorization_id = %id, "Authorization revoked");
        Ok(revoked)
    }

    /// Temporarily disable an active grant
    pub async fn suspend(&self, caller: &UserId, id: &AuthorizationId) -> Result<Authorization> {
        ensure_owner(&self.get(id).await?, caller)?;
        let suspended = self
            .store
            .update(
                id,
                Box::new(|a: &mut Authorization| match a.status {
                    AuthorizationStatus::Suspended => Ok(()),
                    AuthorizationStatus::Active => {
                        a.status = AuthorizationStatus::Suspended;
                        a.updated_at = Utc::now();
                        Ok(())
                    }
                    other => Err(AgentrixError::invalid_transition(
                        "authorization",
                        &a.id,
                        other,
                        "suspend",
                    )),
                }),
            )
            .await?;

        info!(authorization_id = %id, "Authorization suspended");
        Ok(suspended)
    }

    /// Bring a suspended grant back; a grant past its expiry becomes `expired` instead
    pub async fn reactivate(&self, caller: &UserId, id: &AuthorizationId) -> Result<Authorization> {
        self.reactivate_at(caller, id, Utc::now()).await
    }

    pub async fn reactivate_at(
        &self,
        caller: &UserId,
        id: &AuthorizationId,
        now: DateTime<Utc>,
    ) -> Result<Authorization> {
        ensure_owner(&self.get(id).await?, caller)?;
        let reactivated = self
            .store
            .update(
                id,
                Box::new(move |a: &mut Authorization| match a.status {
                    AuthorizationStatus::Active => Ok(()),
                    AuthorizationStatus::Suspended if a.is_expired_at(now) => {
                        a.status = AuthorizationStatus::Expired;
                        a.updated_at = now;
                        Ok(())
                    }
                    AuthorizationStatus::Suspended => {
                        a.status = AuthorizationStatus::Active;
                        a.updated_at = now;
                        Ok(())
                    }
                    other => Err(AgentrixError::invalid_transition(
                        "authorization",
                        &a.id,
                        other,
                        "reactivate",
                    )),
                }),
            )
            .await?;

        if reactivated.status == AuthorizationStatus::Expired {
            info!(authorization_id = %id, "Suspended authorization past expiry marked expired");
        } else {
            info!(authorization_id = %id, "Authorization reactivated");
        }
        Ok(reactivated)
    }

    /// Record expiry detected during evaluation
    pub async fn mark_expired(&self, id: &AuthorizationId) -> Result<Authorization> {
        let expired = self
            .store
            .update(
                id,
                Box::new(|a: &mut Authorization| {
                    if matches!(a.status, AuthorizationStatus::Active | AuthorizationStatus::Suspended) {
                        a.status = AuthorizationStatus::Expired;
                        a.updated_at = Utc::now();
                    }
                    Ok(())
                }),
            )
            .await?;

        info!(authorization_id = %id, "Authorization expired");
        Ok(expired)
    }

    /// Increment usage counters after a payment executed
    pub async fn record_usage(&self, id: &AuthorizationId, amount: Decimal) -> Result<Authorization> {
        self.record_usage_at(id, amount, Utc::now()).await
    }

    pub async fn record_usage_at(
        &self,
        id: &AuthorizationId,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Authorization> {
        let offset = self.offset;
        let updated = self
            .store
            .update(
                id,
                Box::new(move |a: &mut Authorization| a.apply_usage(amount, now, offset)),
            )
            .await?;

        info!(
            authorization_id = %id,
            amount = %amount,
            used_today = %updated.used_today,
            "Authorization usage recorded"
        );
        Ok(updated)
    }

    /// Undo a `record_usage` whose payment then failed to execute
    pub async fn reverse_usage(
        &self,
        id: &AuthorizationId,
        amount: Decimal,
        charged_at: DateTime<Utc>,
    ) -> Result<Authorization> {
        let offset = self.offset;
        let now = Utc::now();
        let updated = self
            .store
            .update(
                id,
                Box::new(move |a: &mut Authorization| {
                    a.reverse_usage(amount, charged_at, now, offset);
                    Ok(())
                }),
            )
            .await?;

        info!(authorization_id = %id, amount = %amount, "Authorization usage reversed");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryAuthorizationStore;
    use futures::future::join_all;
    use rust_decimal_macros::dec;

    fn registry() -> AuthorizationRegistry {
        AuthorizationRegistry::new(
            Arc::new(InMemoryAuthorizationStore::new()),
            FixedOffset::east_opt(0).unwrap(),
        )
    }

    fn request(user: &str) -> CreateAuthorization {
        CreateAuthorization {
            user_id: UserId::from_raw(user),
            agent_id: Some(AgentId::from_raw("agent-1")),
            single_tx_limit: Some(dec!(100)),
            daily_limit: Some(dec!(300)),
            duration: Some(Duration::days(30)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_computes_expiry() {
        let registry = registry();
        let now = Utc::now();
        let auth = registry.create_at(request("u1"), now).await.unwrap();

        assert_eq!(auth.status, AuthorizationStatus::Active);
        assert_eq!(auth.expires_at, Some(now + Duration::days(30)));
        assert_eq!(auth.used_today, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_create_rejects_negative_limits() {
        let registry = registry();
        let mut req = request("u1");
        req.daily_limit = Some(dec!(-1));

        let err = registry.create(req).await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_list_filters() {
        let registry = registry();
        let user = UserId::from_raw("u1");
        let a = registry.create(request("u1")).await.unwrap();
        let mut auto = request("u1");
        auto.auto_pay = true;
        auto.agent_id = Some(AgentId::from_raw("agent-2"));
        registry.create(auto).await.unwrap();
        registry.revoke(&user, &a.id).await.unwrap();

        let all = registry.list(&user, &AuthorizationFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let active = registry
            .list(
                &user,
                &AuthorizationFilter {
                    status: Some(AuthorizationStatus::Active),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert!(active[0].auto_pay);

        let agent_one = registry
            .list(
                &user,
                &AuthorizationFilter {
                    agent_id: Some(AgentId::from_raw("agent-1")),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(agent_one.len(), 1);
        assert_eq!(agent_one[0].id, a.id);
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent() {
        let registry = registry();
        let user = UserId::from_raw("u1");
        let auth = registry.create(request("u1")).await.unwrap();

        let first = registry.revoke(&user, &auth.id).await.unwrap();
        let second = registry.revoke(&user, &auth.id).await.unwrap();
        assert_eq!(first.status, AuthorizationStatus::Revoked);
        assert_eq!(second.status, AuthorizationStatus::Revoked);
        assert_eq!(first.updated_at, second.updated_at);
    }

    #[tokio::test]
    async fn test_update_requires_ownership() {
        let registry = registry();
        let auth = registry.create(request("u1")).await.unwrap();

        let err = registry
            .update(
                &UserId::from_raw("intruder"),
                &auth.id,
                UpdateAuthorization {
                    daily_limit: Some(dec!(1_000_000)),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "FORBIDDEN");

        let updated = registry
            .update(
                &UserId::from_raw("u1"),
                &auth.id,
                UpdateAuthorization {
                    daily_limit: Some(dec!(500)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.daily_limit, Some(dec!(500)));
    }

    #[tokio::test]
    async fn test_update_after_revoke_is_rejected() {
        let registry = registry();
        let user = UserId::from_raw("u1");
        let auth = registry.create(request("u1")).await.unwrap();
        registry.revoke(&user, &auth.id).await.unwrap();

        let err = registry
            .update(&user, &auth.id, UpdateAuthorization::default())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_STATE_TRANSITION");
    }

    #[tokio::test]
    async fn test_suspend_and_reactivate() {
        let registry = registry();
        let user = UserId::from_raw("u1");
        let auth = registry.create(request("u1")).await.unwrap();

        let suspended = registry.suspend(&user, &auth.id).await.unwrap();
        assert_eq!(suspended.status, AuthorizationStatus::Suspended);
        assert!(registry
            .active_for(&user, &AgentId::from_raw("agent-1"))
            .await
            .unwrap()
            .is_empty());

        let active = registry.reactivate(&user, &auth.id).await.unwrap();
        assert_eq!(active.status, AuthorizationStatus::Active);

        registry.revoke(&user, &auth.id).await.unwrap();
        assert!(registry.reactivate(&user, &auth.id).await.is_err());
    }

    #[tokio::test]
    async fn test_reactivate_past_expiry_marks_expired() {
        let registry = registry();
        let user = UserId::from_raw("u1");
        let now = Utc::now();
        let auth = registry
            .create_at(request("u1"), now - Duration::days(31))
            .await
            .unwrap();
        registry.suspend(&user, &auth.id).await.unwrap();

        let expired = registry.reactivate_at(&user, &auth.id, now).await.unwrap();
        assert_eq!(expired.status, AuthorizationStatus::Expired);
        assert_eq!(
            registry.get(&auth.id).await.unwrap().status,
            AuthorizationStatus::Expired
        );

        let err = registry.reactivate_at(&user, &auth.id, now).await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_STATE_TRANSITION");
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let err = registry().get(&AuthorizationId::new()).await.unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_concurrent_usage_never_exceeds_daily_limit() {
        let registry = registry();
        let mut req = request("u1");
        req.single_tx_limit = Some(dec!(10));
        req.daily_limit = Some(dec!(100));
        let auth = registry.create(req).await.unwrap();

        let attempts = (0..50).map(|_| {
            let registry = registry.clone();
            let id = auth.id.clone();
            tokio::spawn(async move { registry.record_usage(&id, dec!(10)).await })
        });
        let results = join_all(attempts).await;

        let accepted = results
            .into_iter()
            .filter(|r| matches!(r, Ok(Ok(_))))
            .count();
        assert_eq!(accepted, 10);

        let stored = registry.get(&auth.id).await.unwrap();
        assert_eq!(stored.used_today, dec!(100));
        assert_eq!(stored.total_used, dec!(100));
    }
}
