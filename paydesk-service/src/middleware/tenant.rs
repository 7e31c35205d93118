//! Caller identity extraction.
//!
//! The fronting BFF authenticates users and forwards who they are as headers:
//! 1. `X-Impersonation-Token` (a live session issued to a platform administrator), or
//! 2. `X-User-ID` + `X-User-Role`, plus `X-School-ID` for school-scoped roles.

use chrono::Utc;
use service_core::{
    axum::{async_trait, extract::FromRequestParts, http::request::Parts},
    error::AppError,
};
use uuid::Uuid;

use crate::authz::{Principal, Role};
use crate::startup::AppState;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";
pub const SCHOOL_ID_HEADER: &str = "x-school-id";
pub const IMPERSONATION_TOKEN_HEADER: &str = "x-impersonation-token";

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn unauthorized(message: &str) -> AppError {
    AppError::Unauthorized(anyhow::anyhow!("{}", message.to_string()))
}

/// Build a principal from identity headers alone.
pub fn principal_from_headers(parts: &Parts) -> Result<Principal, AppError> {
    let user_id = header(parts, USER_ID_HEADER)
        .ok_or_else(|| unauthorized("Missing X-User-ID header"))?;
    let raw_role = header(parts, USER_ROLE_HEADER)
        .ok_or_else(|| unauthorized("Missing X-User-Role header"))?;
    let role = Role::parse(raw_role)
        .ok_or_else(|| unauthorized(&format!("Unknown role '{}'", raw_role)))?;

    let school_id = header(parts, SCHOOL_ID_HEADER)
        .map(|raw| {
            Uuid::parse_str(raw).map_err(|_| {
                AppError::BadRequest(anyhow::anyhow!("Invalid X-School-ID header '{}'", raw))
            })
        })
        .transpose()?;

    if role.is_school_scoped() && school_id.is_none() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "X-School-ID header is required for role {}",
            role.as_str()
        )));
    }

    Ok(Principal {
        user_id: user_id.to_string(),
        role,
        school_id,
        impersonated_by: None,
    })
}

#[async_trait]
impl FromRequestParts<AppState> for Principal {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if let Some(token) = header(parts, IMPERSONATION_TOKEN_HEADER) {
            let principal = state
                .impersonation
                .resolve(state.store.as_ref(), token, Utc::now())
                .await?;
            tracing::info!(
                user_id = %principal.user_id,
                impersonated_by = principal.impersonated_by.as_deref().unwrap_or(""),
                method = %parts.method,
                uri = %parts.uri,
                "Request acting through impersonation session"
            );
            return Ok(principal);
        }

        principal_from_headers(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_core::axum::http::Request;

    fn parts(headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri("/invoices");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let (parts, _) = builder.body(()).unwrap().into_parts();
        parts
    }

    #[test]
    fn school_scoped_roles_need_a_school() {
        let err = principal_from_headers(&parts(&[
            (USER_ID_HEADER, "bursar-1"),
            (USER_ROLE_HEADER, "BURSAR"),
        ]))
        .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[test]
    fn super_admin_may_omit_the_school() {
        let principal = principal_from_headers(&parts(&[
            (USER_ID_HEADER, "root"),
            (USER_ROLE_HEADER, "super_admin"),
        ]))
        .unwrap();
        assert_eq!(principal.role, Role::SuperAdmin);
        assert!(principal.school_id.is_none());
    }

    #[test]
    fn missing_identity_is_unauthorized() {
        let err = principal_from_headers(&parts(&[])).unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));

        let err = principal_from_headers(&parts(&[
            (USER_ID_HEADER, "x"),
            (USER_ROLE_HEADER, "janitor"),
        ]))
        .unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }
}
