//! Per-registry authentication session.

use std::sync::atomic::{AtomicU32, Ordering};

use chrono::Utc;
use dockyard_core::error::Result;
use tokio::sync::Mutex;

use super::credentials::{Credential, CredentialProvider};
use crate::oci::RegistryAuth;

/// Cached credential for one registry during a publish batch.
///
/// The credential is acquired on first use and reused until it expires or
/// the registry rejects it. Dropping the session drops (and zeroes) it.
pub struct RegistrySession {
    provider: Box<dyn CredentialProvider>,
    cached: Mutex<Option<Credential>>,
    acquired: AtomicU32,
}

impl RegistrySession {
    pub fn new(provider: Box<dyn CredentialProvider>) -> Self {
        Self {
            provider,
            cached: Mutex::new(None),
            acquired: AtomicU32::new(0),
        }
    }

    /// Auth for the next request, acquiring a credential if none is cached
    /// or the cached one has expired.
    pub async fn auth(&self) -> Result<RegistryAuth> {
        let mut cached = self.cached.lock().await;
        if let Some(credential) = cached.as_ref() {
            if !credential.is_expired(Utc::now()) {
                return Ok(credential.to_auth());
            }
            tracing::debug!(provider = %self.provider.describe(), "Cached credential expired");
        }
        self.acquire_into(&mut cached).await
    }

    /// Discard the cached credential and acquire a new one.
    pub async fn refresh(&self) -> Result<RegistryAuth> {
        let mut cached = self.cached.lock().await;
        *cached = None;
        self.acquire_into(&mut cached).await
    }

    /// Number of times a credential was acquired from the provider.
    pub fn acquisitions(&self) -> u32 {
        self.acquired.load(Ordering::SeqCst)
    }

    async fn acquire_into(&self, slot: &mut Option<Credential>) -> Result<RegistryAuth> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(provider = %self.provider.describe(), "Acquiring registry credential");
        let credential = self.provider.acquire().await?;
        let auth = credential
            .as_ref()
            .map_or(RegistryAuth::Anonymous, Credential::to_auth);
        *slot = credential;
        Ok(auth)
    }
}

impl std::fmt::Debug for RegistrySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrySession")
            .field("provider", &self.provider.describe())
            .field("acquisitions", &self.acquisitions())
            .finish()
    }
}
