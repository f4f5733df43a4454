//! Shared user/token pair used to authenticate against the peer.
//!
//! The worker pushes fresh credentials through the control API; every
//! session reads them when (re)starting its stream reader.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// A user/token pair.
///
/// Valid only when both fields are non-empty.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub token: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            token: token.into(),
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.user.is_empty() && !self.token.is_empty()
    }
}

// Tokens must never end up in logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("token", &if self.token.is_empty() { "" } else { "<redacted>" })
            .finish()
    }
}

/// Lock-guarded holder of the current credentials.
///
/// Cheap to clone; all clones share the same value. Readers get a
/// point-in-time copy, so the lock is never held across caller logic.
#[derive(Clone, Default)]
pub struct CredentialStore {
    inner: Arc<Mutex<Credentials>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the current credentials.
    pub fn get(&self) -> Credentials {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the stored credentials if either field differs.
    ///
    /// Returns `true` when the value changed and observers should be
    /// notified, `false` when it was identical.
    pub fn update(&self, new: Credentials) -> bool {
        let mut current = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if *current == new {
            return false;
        }
        debug!(user = %new.user, "Credentials updated");
        *current = new;
        true
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CredentialStore").field(&self.get()).finish()
    }
}
