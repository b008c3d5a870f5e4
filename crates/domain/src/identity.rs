use serde::{Deserialize, Serialize};

/// Identity of the user on whose behalf a service call runs.
///
/// Built per request from the auth platform's identity output and passed
/// explicitly into every acting operation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentitySession {
    pub user_id: String,
    pub email: Option<String>,
    pub email_verified: bool,
}

impl IdentitySession {
    pub fn new(user_id: impl Into<String>, email: Option<String>, email_verified: bool) -> Self {
        Self {
            user_id: user_id.into(),
            email,
            email_verified,
        }
    }

    pub fn with_user_id(user_id: impl Into<String>) -> Self {
        Self::new(user_id, None, false)
    }
}
