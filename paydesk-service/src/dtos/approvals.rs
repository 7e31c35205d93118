use serde::Deserialize;
use validator::Validate;

#[derive(Debug, Default, Deserialize, Validate)]
pub struct ResolveApprovalRequest {
    #[validate(length(max = 1000, message = "Note is too long"))]
    pub note: Option<String>,
}
