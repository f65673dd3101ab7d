use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

/// Shared-password auth. The login user name becomes the owner of every
/// reservation made on the session, so it must be present.
#[derive(Debug)]
pub struct ReservdAuthSource {
    password: String,
}

impl ReservdAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for ReservdAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        if login.user().is_none_or(|u| u.trim().is_empty()) {
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                "a user name is required".into(),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
