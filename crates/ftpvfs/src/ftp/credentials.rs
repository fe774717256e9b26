//! Credential resolver boundary.
//!
//! The pool asks, in order: the request itself, the pool entry's cached
//! pair, [`CredentialResolver::lookup_cached`],
//! [`CredentialResolver::query_secret_store`], and finally
//! [`CredentialResolver::prompt_user`] in a bounded retry loop.
//! Resolver calls are made without any pool lock held.

use crate::ftp::error::FtpResult;
use crate::ftp::types::{ConnectionIdentity, Credential};
use async_trait::async_trait;

/// Outcome of an interactive prompt.
#[derive(Debug, Clone)]
pub enum PromptResponse {
    Provided(Credential),
    /// The user declined; surfaces as `Cancelled`.
    Cancelled,
    /// Nobody can be asked; the login falls back to anonymous.
    Unavailable,
}

#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Credentials remembered outside this process's pools (session keyring).
    async fn lookup_cached(&self, _identity: &ConnectionIdentity) -> Option<Credential> {
        None
    }

    async fn query_secret_store(&self, identity: &ConnectionIdentity) -> Option<Credential>;

    async fn prompt_user(
        &self,
        identity: &ConnectionIdentity,
        previous_attempt_failed: bool,
    ) -> PromptResponse;

    async fn save_credential(
        &self,
        identity: &ConnectionIdentity,
        credential: &Credential,
    ) -> FtpResult<()>;
}

/// Resolver for headless use: no store, no prompt, nothing saved.
#[derive(Debug, Clone, Copy, Default)]
pub struct NonInteractive;

#[async_trait]
impl CredentialResolver for NonInteractive {
    async fn query_secret_store(&self, _identity: &ConnectionIdentity) -> Option<Credential> {
        None
    }

    async fn prompt_user(
        &self,
        _identity: &ConnectionIdentity,
        _previous_attempt_failed: bool,
    ) -> PromptResponse {
        PromptResponse::Unavailable
    }

    async fn save_credential(
        &self,
        _identity: &ConnectionIdentity,
        _credential: &Credential,
    ) -> FtpResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn non_interactive_never_answers() {
        let id = ConnectionIdentity::new("ftp.example.org", 21);
        let r = NonInteractive;
        assert!(r.lookup_cached(&id).await.is_none());
        assert!(r.query_secret_store(&id).await.is_none());
        assert!(matches!(r.prompt_user(&id, false).await, PromptResponse::Unavailable));
    }
}
