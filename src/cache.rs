//! Best-effort caching of accepted passwords into the local credential
//! store.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::request::{AuthStatus, Responder};
use crate::secret::Secret;

/// Errors reported by the credential store.
#[derive(Debug, thiserror::Error)]
#[error("credential store error: {0}")]
pub struct CacheError(pub String);

/// Local store holding cached credentials, written under a transaction.
#[async_trait]
pub trait CredentialStore: Send + Sync {
	/// Open a write transaction.
	async fn begin_transaction(&self) -> Result<Box<dyn CredentialTransaction>, CacheError>;
}

/// One open credential-store transaction.
#[async_trait]
pub trait CredentialTransaction: Send {
	/// Record `password` as the cached credential for `user` in `domain`.
	async fn set_cached_password(
		&mut self,
		domain: &str,
		user: &str,
		password: &Secret,
	) -> Result<(), CacheError>;

	/// Close the transaction, committing when `success` is true.
	async fn finish(self: Box<Self>, success: bool) -> Result<(), CacheError>;
}

/// Write the accepted password to the credential store, then report the
/// authentication outcome that was already decided.
///
/// Runs detached from the session that spawned it and owns its own copy of
/// the password, which is wiped on drop. Store failures are logged and
/// never demote the outcome.
pub(crate) async fn cache_and_complete(
	store: Arc<dyn CredentialStore>,
	domain: String,
	user: String,
	password: Secret,
	status: AuthStatus,
	responder: Responder,
) {
	if let Err(err) = write_cached_password(&*store, &domain, &user, &password).await {
		warn!("failed to cache the password for `{}`: {}", user, err);
	}
	responder.complete(status, None);
}

/// The transactional write: open, set, close. The transaction is closed
/// with the write's status even when the write failed.
async fn write_cached_password(
	store: &dyn CredentialStore,
	domain: &str,
	user: &str,
	password: &Secret,
) -> Result<(), CacheError> {
	let mut tx = store.begin_transaction().await?;
	let written = tx.set_cached_password(domain, user, password).await;
	let closed = tx.finish(written.is_ok()).await;
	written?;
	closed
}
