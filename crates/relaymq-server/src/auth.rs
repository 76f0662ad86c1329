//! Authentication gateway.
//!
//! A successful login yields a [`SecurityContext`] guard. The guard is held
//! by whatever owns the authenticated connection and releases the login
//! when dropped, so every exit path (close, error, teardown) ends it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AuthError;

/// Credentials check consumed by connection factories and STOMP sessions.
pub trait Authenticator: Send + Sync {
    /// Verifies credentials. `None` username means an anonymous login.
    fn authenticate(
        &self,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<SecurityContext, AuthError>;

    /// Client id configured for a user, if any.
    fn preconfigured_client_id(&self, username: &str) -> Option<String>;
}

/// An active login. Released on drop.
#[derive(Debug)]
pub struct SecurityContext {
    principal: Option<String>,
    active: Option<Arc<AtomicUsize>>,
}

impl SecurityContext {
    /// A context that is not tracked by any authenticator.
    pub fn untracked(principal: Option<String>) -> Self {
        Self {
            principal,
            active: None,
        }
    }

    fn tracked(principal: Option<String>, active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::AcqRel);
        Self {
            principal,
            active: Some(active),
        }
    }

    /// Authenticated user, `None` for anonymous.
    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }
}

impl Drop for SecurityContext {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.fetch_sub(1, Ordering::AcqRel);
        }
        debug!(principal = ?self.principal, "Security context released");
    }
}

/// A configured user account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCredentials {
    pub username: String,
    pub password: String,
    /// Client id assigned to this user's connections unless overridden.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl UserCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            client_id: None,
        }
    }

    /// Builder: set the preconfigured client id.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

/// Authenticator backed by a fixed user table.
#[derive(Debug, Default)]
pub struct StaticAuthenticator {
    users: HashMap<String, UserCredentials>,
    allow_anonymous: bool,
    active: Arc<AtomicUsize>,
}

impl StaticAuthenticator {
    /// Creates an authenticator from a user list.
    pub fn new(users: impl IntoIterator<Item = UserCredentials>) -> Self {
        Self {
            users: users
                .into_iter()
                .map(|user| (user.username.clone(), user))
                .collect(),
            allow_anonymous: false,
            active: Arc::default(),
        }
    }

    /// Builder: accept logins without a username.
    pub fn with_anonymous(mut self, allow: bool) -> Self {
        self.allow_anonymous = allow;
        self
    }

    /// Number of security contexts currently alive.
    pub fn active_contexts(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

impl Authenticator for StaticAuthenticator {
    fn authenticate(
        &self,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<SecurityContext, AuthError> {
        let Some(username) = username else {
            if self.allow_anonymous {
                return Ok(SecurityContext::tracked(None, Arc::clone(&self.active)));
            }
            return Err(AuthError::AnonymousRefused);
        };

        match self.users.get(username) {
            Some(user) if user.password == password.unwrap_or_default() => Ok(
                SecurityContext::tracked(Some(username.to_string()), Arc::clone(&self.active)),
            ),
            _ => Err(AuthError::InvalidCredentials {
                username: username.to_string(),
            }),
        }
    }

    fn preconfigured_client_id(&self, username: &str) -> Option<String> {
        self.users.get(username).and_then(|u| u.client_id.clone())
    }
}
