//! Roles, capabilities and the single authorization check used by every handler.

use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;

/// Closed set of roles a caller can act under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    SuperAdmin,
    Principal,
    Bursar,
    Teacher,
    Parent,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::SuperAdmin => "SUPER_ADMIN",
            Role::Principal => "PRINCIPAL",
            Role::Bursar => "BURSAR",
            Role::Teacher => "TEACHER",
            Role::Parent => "PARENT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SUPER_ADMIN" => Some(Role::SuperAdmin),
            "PRINCIPAL" => Some(Role::Principal),
            "BURSAR" => Some(Role::Bursar),
            "TEACHER" => Some(Role::Teacher),
            "PARENT" => Some(Role::Parent),
            _ => None,
        }
    }

    /// Whether the role is confined to a single school.
    pub fn is_school_scoped(&self) -> bool {
        !matches!(self, Role::SuperAdmin)
    }
}

/// Actions guarded by [`authorize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    ManageSchools,
    Impersonate,
    ManageAcademics,
    ManageStudents,
    ManageFees,
    ManageInvoices,
    RecordPayments,
    RequestApproval,
    ResolveApproval,
    ViewFinance,
    ViewOwnChildren,
    InitiateMobilePayment,
    ExportData,
}

impl Capability {
    /// Capability key in `{domain}.{resource}:{action}` form.
    pub fn key(&self) -> &'static str {
        match self {
            Capability::ManageSchools => "paydesk.school:manage",
            Capability::Impersonate => "paydesk.session:impersonate",
            Capability::ManageAcademics => "paydesk.period:manage",
            Capability::ManageStudents => "paydesk.student:manage",
            Capability::ManageFees => "paydesk.fee_structure:manage",
            Capability::ManageInvoices => "paydesk.invoice:manage",
            Capability::RecordPayments => "paydesk.payment:record",
            Capability::RequestApproval => "paydesk.approval:request",
            Capability::ResolveApproval => "paydesk.approval:resolve",
            Capability::ViewFinance => "paydesk.finance:read",
            Capability::ViewOwnChildren => "paydesk.finance:read:own",
            Capability::InitiateMobilePayment => "paydesk.payment:initiate",
            Capability::ExportData => "paydesk.export:read",
        }
    }
}

/// Capability table.
pub fn role_has(role: Role, capability: Capability) -> bool {
    use Capability::*;

    match role {
        Role::SuperAdmin => matches!(capability, ManageSchools | Impersonate | ViewFinance | ExportData),
        Role::Principal => !matches!(
            capability,
            ManageSchools | Impersonate | ViewOwnChildren | InitiateMobilePayment
        ),
        Role::Bursar => matches!(
            capability,
            ManageStudents
                | ManageFees
                | ManageInvoices
                | RecordPayments
                | RequestApproval
                | ViewFinance
                | ExportData
        ),
        Role::Teacher => matches!(capability, ViewFinance),
        Role::Parent => matches!(capability, ViewOwnChildren | InitiateMobilePayment),
    }
}

/// The authenticated caller of a request.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: String,
    pub role: Role,
    pub school_id: Option<Uuid>,
    /// Set when a platform administrator is acting through an impersonation session.
    pub impersonated_by: Option<String>,
}

impl Principal {
    /// School the caller is confined to; required for every school-scoped route.
    pub fn school_id(&self) -> Result<Uuid, AppError> {
        self.school_id.ok_or_else(|| {
            AppError::BadRequest(anyhow::anyhow!(
                "X-School-ID header is required for this operation"
            ))
        })
    }
}

/// Fail with `Forbidden` unless the caller's role grants `capability`.
pub fn authorize(principal: &Principal, capability: Capability) -> Result<(), AppError> {
    if role_has(principal.role, capability) {
        Ok(())
    } else {
        tracing::warn!(
            user_id = %principal.user_id,
            role = principal.role.as_str(),
            capability = capability.key(),
            "Capability denied"
        );
        Err(AppError::Forbidden(anyhow::anyhow!(
            "Role {} lacks capability {}",
            principal.role.as_str(),
            capability.key()
        )))
    }
}

/// Either full finance visibility, or a parent reading one of their own children.
pub fn authorize_student_view(
    principal: &Principal,
    parent_user_id: Option<&str>,
) -> Result<(), AppError> {
    if role_has(principal.role, Capability::ViewFinance) {
        return Ok(());
    }
    authorize(principal, Capability::ViewOwnChildren)?;
    if parent_user_id == Some(principal.user_id.as_str()) {
        Ok(())
    } else {
        Err(AppError::Forbidden(anyhow::anyhow!(
            "Parents may only view their own children"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(role: Role) -> Principal {
        Principal {
            user_id: "user-1".to_string(),
            role,
            school_id: Some(Uuid::new_v4()),
            impersonated_by: None,
        }
    }

    #[test]
    fn only_principals_resolve_approvals() {
        assert!(role_has(Role::Principal, Capability::ResolveApproval));
        assert!(!role_has(Role::Bursar, Capability::ResolveApproval));
        assert!(!role_has(Role::SuperAdmin, Capability::ResolveApproval));
        assert!(!role_has(Role::Parent, Capability::ResolveApproval));
    }

    #[test]
    fn bursar_can_request_but_not_manage_periods() {
        assert!(role_has(Role::Bursar, Capability::RequestApproval));
        assert!(!role_has(Role::Bursar, Capability::ManageAcademics));
    }

    #[test]
    fn denial_is_forbidden() {
        let err = authorize(&principal(Role::Teacher), Capability::ManageInvoices).unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[test]
    fn parent_sees_only_own_children() {
        let parent = principal(Role::Parent);
        assert!(authorize_student_view(&parent, Some("user-1")).is_ok());
        assert!(authorize_student_view(&parent, Some("someone-else")).is_err());
        assert!(authorize_student_view(&parent, None).is_err());
        assert!(authorize_student_view(&principal(Role::Teacher), None).is_ok());
    }

    #[test]
    fn roles_parse_case_insensitively() {
        assert_eq!(Role::parse("principal"), Some(Role::Principal));
        assert_eq!(Role::parse("SUPER_ADMIN"), Some(Role::SuperAdmin));
        assert_eq!(Role::parse("janitor"), None);
    }
}
