//! Authentication boundary. The server verifies a single process-wide
//! password; who the actor *is* (customer vs. salon owner) arrives as ids
//! in the SQL itself, asserted by whatever sits in front of slotd. The
//! engine never inspects credentials.

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

#[derive(Debug)]
pub struct SlotdAuthSource {
    password: String,
}

impl SlotdAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SlotdAuthSource {
    /// Same cleartext password for every login; the username and database
    /// in `LoginInfo` only select the tenant, they carry no secret.
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
