//! Credential source for uploads.
//!
//! Sign-in itself lives outside the pipeline; the pipeline only asks for the
//! current bearer token and reports when the server refused it.

use std::{
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use async_trait::async_trait;
use thiserror::Error;

use crate::settings::SettingsStore;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("no valid credential, sign-in required")]
pub struct AuthRequired;

#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn bearer(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

#[async_trait]
pub trait AuthClient: Send + Sync {
    async fn current_credential(&self) -> Result<Credential, AuthRequired>;

    /// The server answered 401 for `rejected`; stop handing it out.
    async fn invalidate(&self, rejected: &Credential);
}

/// Serves the token saved in settings. A token the server rejected stays
/// unavailable until a different one is saved.
pub struct SettingsCredentialStore {
    settings: Arc<SettingsStore>,
    rejected: RwLock<Option<Credential>>,
}

impl SettingsCredentialStore {
    pub fn new(settings: Arc<SettingsStore>) -> Self {
        Self {
            settings,
            rejected: RwLock::new(None),
        }
    }
}

#[async_trait]
impl AuthClient for SettingsCredentialStore {
    async fn current_credential(&self) -> Result<Credential, AuthRequired> {
        let token = self
            .settings
            .snapshot()
            .saved_token
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .ok_or(AuthRequired)?;
        let credential = Credential::new(token);

        let rejected = self.rejected.read().unwrap_or_else(PoisonError::into_inner);
        if rejected.as_ref() == Some(&credential) {
            return Err(AuthRequired);
        }
        Ok(credential)
    }

    async fn invalidate(&self, rejected: &Credential) {
        *self.rejected.write().unwrap_or_else(PoisonError::into_inner) = Some(rejected.clone());
    }
}
