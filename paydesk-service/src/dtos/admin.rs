use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::authz::Role;
use crate::models::ImpersonationSession;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateSchoolRequest {
    #[validate(length(min = 1, max = 200, message = "School name is required"))]
    pub name: String,

    #[validate(length(min = 2, max = 20, message = "School code must be 2-20 characters"))]
    pub code: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct StartImpersonationRequest {
    #[validate(length(min = 1, message = "Target user is required"))]
    pub target_user_id: String,

    pub target_school_id: Uuid,

    pub target_role: Role,

    #[validate(length(min = 1, message = "Reason is required"))]
    pub reason: String,

    /// Defaults to the configured maximum.
    pub ttl_minutes: Option<i64>,
}

/// Returned once, when the session is issued; the token is never listed again.
#[derive(Debug, Serialize)]
pub struct ImpersonationStartedResponse {
    pub token: String,
    pub session_id: Uuid,
    pub actor_id: String,
    pub target_user_id: String,
    pub target_school_id: Uuid,
    pub target_role: Role,
    pub issued_utc: DateTime<Utc>,
    pub expires_utc: DateTime<Utc>,
}

impl From<ImpersonationSession> for ImpersonationStartedResponse {
    fn from(session: ImpersonationSession) -> Self {
        Self {
            token: session.token,
            session_id: session.session_id,
            actor_id: session.actor_id,
            target_user_id: session.target_user_id,
            target_school_id: session.target_school_id,
            target_role: session.target_role,
            issued_utc: session.issued_utc,
            expires_utc: session.expires_utc,
        }
    }
}
