pub mod tenant;

pub use tenant::{
    IMPERSONATION_TOKEN_HEADER, SCHOOL_ID_HEADER, USER_ID_HEADER, USER_ROLE_HEADER,
};
