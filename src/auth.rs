use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use serde::Deserialize;

use crate::model::{Actor, ActorId, Role};

/// One login known to the server and the actor it acts as.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Account {
    pub username: String,
    pub password: String,
    pub actor_id: ActorId,
    pub role: Role,
    #[serde(default)]
    pub contact: Option<String>,
}

impl Account {
    pub fn actor(&self) -> Actor {
        Actor {
            id: self.actor_id,
            role: self.role,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailed;

impl std::fmt::Display for AuthFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "authentication failed")
    }
}

impl std::error::Error for AuthFailed {}

/// Resolves session users to actors. The engine never sees credentials, only
/// the `Actor` this returns.
pub trait IdentityProvider: Send + Sync {
    fn lookup(&self, username: &str) -> Option<Account>;

    fn authenticate(&self, username: &str, password: &str) -> Result<Actor, AuthFailed> {
        match self.lookup(username) {
            Some(account) if account.password == password => Ok(account.actor()),
            _ => Err(AuthFailed),
        }
    }

    /// Every account with a notice contact.
    fn contacts(&self) -> Vec<(ActorId, String)>;
}

/// Fixed account table, usually loaded once at startup.
#[derive(Debug, Default)]
pub struct StaticIdentity {
    accounts: HashMap<String, Account>,
}

impl StaticIdentity {
    pub fn new(accounts: Vec<Account>) -> Self {
        Self {
            accounts: accounts.into_iter().map(|a| (a.username.clone(), a)).collect(),
        }
    }

    /// Load `[{username, password, actor_id, role, contact}]` from a JSON file.
    pub fn from_json_file(path: &Path) -> io::Result<Self> {
        let raw = std::fs::read(path)?;
        let accounts: Vec<Account> = serde_json::from_slice(&raw)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{}: {e}", path.display())))?;
        Ok(Self::new(accounts))
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

impl IdentityProvider for StaticIdentity {
    fn lookup(&self, username: &str) -> Option<Account> {
        self.accounts.get(username).cloned()
    }

    fn contacts(&self) -> Vec<(ActorId, String)> {
        self.accounts
            .values()
            .filter_map(|a| a.contact.clone().map(|c| (a.actor_id, c)))
            .collect()
    }
}

/// Cleartext-password source for pgwire backed by an identity provider.
pub struct SlotbookAuthSource {
    identity: Arc<dyn IdentityProvider>,
}

impl SlotbookAuthSource {
    pub fn new(identity: Arc<dyn IdentityProvider>) -> Self {
        Self { identity }
    }
}

impl std::fmt::Debug for SlotbookAuthSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotbookAuthSource").finish_non_exhaustive()
    }
}

#[async_trait]
impl AuthSource for SlotbookAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        match self.identity.lookup(user) {
            Some(account) => Ok(Password::new(None, account.password.into_bytes())),
            None => {
                metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
                tracing::debug!(user, "login for unknown user");
                Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                    "FATAL".into(),
                    "28P01".into(),
                    format!("password authentication failed for user \"{user}\""),
                ))))
            }
        }
    }
}
