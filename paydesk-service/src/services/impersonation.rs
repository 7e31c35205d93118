//! Time-limited impersonation sessions for platform administrators.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use service_core::error::AppError;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::authz::{authorize, Capability, Principal, Role};
use crate::models::{ImpersonationSession, NewImpersonationSession};
use crate::services::store::FeeStore;

/// Default upper bound on a session's lifetime, in minutes.
pub const DEFAULT_MAX_MINUTES: i64 = 60;

#[derive(Debug, Clone)]
pub struct StartImpersonation {
    pub target_user_id: String,
    pub target_school_id: Uuid,
    pub target_role: Role,
    pub reason: String,
    pub ttl_minutes: i64,
}

#[derive(Debug, Clone)]
pub struct ImpersonationService {
    max_minutes: i64,
}

impl Default for ImpersonationService {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MINUTES)
    }
}

fn generate_token() -> String {
    let mut rng = rand::thread_rng();
    let token_bytes: [u8; 32] = rng.gen();
    hex::encode(token_bytes)
}

fn unauthorized(message: &str) -> AppError {
    AppError::Unauthorized(anyhow::anyhow!("{}", message.to_string()))
}

impl ImpersonationService {
    pub fn new(max_minutes: i64) -> Self {
        Self {
            max_minutes: max_minutes.max(1),
        }
    }

    pub fn max_minutes(&self) -> i64 {
        self.max_minutes
    }

    #[instrument(skip(self, store, actor, input), fields(actor_id = %actor.user_id, target_user_id = %input.target_user_id))]
    pub async fn start(
        &self,
        store: &dyn FeeStore,
        actor: &Principal,
        input: StartImpersonation,
        now: DateTime<Utc>,
    ) -> Result<ImpersonationSession, AppError> {
        authorize(actor, Capability::Impersonate)?;
        if actor.impersonated_by.is_some() {
            return Err(AppError::Forbidden(anyhow::anyhow!(
                "Impersonation sessions cannot be nested"
            )));
        }
        if input.target_role == Role::SuperAdmin {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Platform administrators cannot be impersonated"
            )));
        }
        if !(1..=self.max_minutes).contains(&input.ttl_minutes) {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Session length must be between 1 and {} minutes",
                self.max_minutes
            )));
        }
        let reason = input.reason.trim();
        if reason.is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "A reason is required to impersonate a user"
            )));
        }

        store
            .get_school(input.target_school_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "School {} not found",
                    input.target_school_id
                ))
            })?;

        let session = store
            .create_impersonation(&NewImpersonationSession {
                token: generate_token(),
                actor_id: actor.user_id.clone(),
                target_user_id: input.target_user_id,
                target_school_id: input.target_school_id,
                target_role: input.target_role,
                reason: reason.to_string(),
                issued_utc: now,
                expires_utc: now + Duration::minutes(input.ttl_minutes),
            })
            .await?;

        info!(
            session_id = %session.session_id,
            target_school_id = %session.target_school_id,
            target_role = session.target_role.as_str(),
            expires_utc = %session.expires_utc,
            "Impersonation session started"
        );

        Ok(session)
    }

    /// Principal a live session token acts as.
    pub async fn resolve(
        &self,
        store: &dyn FeeStore,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Principal, AppError> {
        let session = store
            .get_impersonation(token)
            .await?
            .ok_or_else(|| unauthorized("Unknown impersonation token"))?;

        if !session.is_live(now) {
            warn!(session_id = %session.session_id, "Rejected expired or revoked impersonation token");
            return Err(unauthorized("Impersonation session has ended"));
        }

        Ok(Principal {
            user_id: session.target_user_id,
            role: session.target_role,
            school_id: Some(session.target_school_id),
            impersonated_by: Some(session.actor_id),
        })
    }

    #[instrument(skip(self, store, actor, token), fields(actor_id = %actor.user_id))]
    pub async fn end(
        &self,
        store: &dyn FeeStore,
        actor: &Principal,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<ImpersonationSession, AppError> {
        authorize(actor, Capability::Impersonate)?;
        let session = store
            .revoke_impersonation(token, now)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Impersonation session not found")))?;

        info!(session_id = %session.session_id, "Impersonation session ended");

        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CreateSchool;
    use crate::services::memory::MemoryStore;

    fn admin() -> Principal {
        Principal {
            user_id: "admin-1".to_string(),
            role: Role::SuperAdmin,
            school_id: None,
            impersonated_by: None,
        }
    }

    async fn school(store: &MemoryStore) -> Uuid {
        store
            .create_school(&CreateSchool {
                name: "Lakeview".to_string(),
                code: "LAKE".to_string(),
            })
            .await
            .unwrap()
            .school_id
    }

    fn start_input(school_id: Uuid, ttl_minutes: i64) -> StartImpersonation {
        StartImpersonation {
            target_user_id: "bursar-9".to_string(),
            target_school_id: school_id,
            target_role: Role::Bursar,
            reason: "Support ticket 4411".to_string(),
            ttl_minutes,
        }
    }

    #[test]
    fn tokens_are_long_and_unique() {
        let a = generate_token();
        assert_eq!(a.len(), 64);
        assert_ne!(a, generate_token());
    }

    #[tokio::test]
    async fn token_acts_as_target_until_expiry() {
        let store = MemoryStore::new();
        let school_id = school(&store).await;
        let service = ImpersonationService::default();
        let now = Utc::now();

        let session = service
            .start(&store, &admin(), start_input(school_id, 30), now)
            .await
            .unwrap();

        let principal = service.resolve(&store, &session.token, now).await.unwrap();
        assert_eq!(principal.role, Role::Bursar);
        assert_eq!(principal.school_id, Some(school_id));
        assert_eq!(principal.impersonated_by.as_deref(), Some("admin-1"));

        let later = now + Duration::minutes(31);
        let err = service.resolve(&store, &session.token, later).await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn ttl_must_fit_the_configured_bound() {
        let store = MemoryStore::new();
        let school_id = school(&store).await;
        let service = ImpersonationService::new(15);

        let err = service
            .start(&store, &admin(), start_input(school_id, 16), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));

        let err = service
            .start(&store, &admin(), start_input(school_id, 0), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn revoked_token_is_rejected() {
        let store = MemoryStore::new();
        let school_id = school(&store).await;
        let service = ImpersonationService::default();
        let now = Utc::now();

        let session = service
            .start(&store, &admin(), start_input(school_id, 10), now)
            .await
            .unwrap();
        service.end(&store, &admin(), &session.token, now).await.unwrap();

        assert!(service.resolve(&store, &session.token, now).await.is_err());
    }
}
