//! Delegated, time-limited sessions issued to platform administrators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::authz::Role;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ImpersonationSession {
    pub session_id: Uuid,
    #[serde(skip_serializing)]
    pub token: String,
    pub actor_id: String,
    pub target_user_id: String,
    pub target_school_id: Uuid,
    pub target_role: Role,
    pub reason: String,
    pub issued_utc: DateTime<Utc>,
    pub expires_utc: DateTime<Utc>,
    pub revoked_utc: Option<DateTime<Utc>>,
}

impl ImpersonationSession {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.revoked_utc.is_none() && now < self.expires_utc
    }
}

#[derive(Debug, Clone)]
pub struct NewImpersonationSession {
    pub token: String,
    pub actor_id: String,
    pub target_user_id: String,
    pub target_school_id: Uuid,
    pub target_role: Role,
    pub reason: String,
    pub issued_utc: DateTime<Utc>,
    pub expires_utc: DateTime<Utc>,
}
