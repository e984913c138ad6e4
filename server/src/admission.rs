use platform_authz::UserRecord;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Webhook envelope posted by Drone before a user logs in or registers.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AdmissionRequest {
    #[serde(default)]
    pub event: String,
    pub user: User,
}

/// Drone's user record. Fields this service does not touch are carried
/// through untouched so an elevated record can be echoed back.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct User {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub machine: bool,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub avatar: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserRecord for User {
    fn login(&self) -> &str {
        &self.login
    }

    fn set_admin(&mut self, admin: bool) {
        self.admin = admin;
    }
}
