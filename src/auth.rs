use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Member,
}

/// An authenticated connection. For members, `identity` is their external id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub identity: String,
    pub role: Role,
}

impl Caller {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum AuthError {
    BadCredentials,
    RoleDisabled(Role),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::BadCredentials => write!(f, "bad credentials"),
            AuthError::RoleDisabled(role) => write!(f, "{role:?} logins are disabled"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Decides who a connection is. Swap in a directory-backed implementation
/// without touching the front end.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn authenticate(&self, identity: &str, role: Role, password: &str) -> Result<Caller, AuthError>;
}

/// One shared password per role. Member logins are refused unless a member
/// password is configured.
#[derive(Debug)]
pub struct SharedSecretAuth {
    admin_password: String,
    member_password: Option<String>,
}

impl SharedSecretAuth {
    pub fn new(admin_password: String, member_password: Option<String>) -> Self {
        Self {
            admin_password,
            member_password,
        }
    }
}

#[async_trait]
impl IdentityProvider for SharedSecretAuth {
    async fn authenticate(&self, identity: &str, role: Role, password: &str) -> Result<Caller, AuthError> {
        let expected = match role {
            Role::Admin => self.admin_password.as_str(),
            Role::Member => self
                .member_password
                .as_deref()
                .ok_or(AuthError::RoleDisabled(Role::Member))?,
        };
        if identity.trim().is_empty() || !constant_time_eq(expected.as_bytes(), password.as_bytes()) {
            return Err(AuthError::BadCredentials);
        }
        Ok(Caller {
            identity: identity.trim().to_string(),
            role,
        })
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
