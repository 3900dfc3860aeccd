//! LDAP-backed authentication provider.
//!
//! Services PAM-style requests (verify a user's password, change it, or
//! just locate the user) by driving a directory server over a TLS-secured
//! LDAP connection: StartTLS bootstrap, a service-account bind, a subtree
//! search for the user's DN, a user-authenticating bind, and (for password
//! changes) the password-modify extended operation. Each request runs as
//! its own session task and reports exactly one completion; on success the
//! accepted password can be cached into a local credential store,
//! best-effort.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

pub mod cache;
pub mod config;
pub mod directory;
mod machine;
pub mod request;
pub mod secret;
pub mod test_helpers;

pub use cache::{CacheError, CredentialStore, CredentialTransaction};
pub use config::{ConfigStore, InitError, ProviderContext, TlsRequireCert};
pub use directory::ldap::LdapConnector;
pub use directory::{
	BindOutcome, ConnectError, DirectoryConnector, DirectoryError, DirectoryLink,
};
pub use request::{AuthRequest, AuthStatus, Completion, PamCommand, RequestHandle};
pub use secret::Secret;

use machine::Session;

/// The provider's operations surface.
///
/// The dispatcher hands requests in through
/// [`handle_auth_request`](AuthProvider::handle_auth_request) and tears the
/// provider down through [`finalize`](AuthProvider::finalize).
pub struct AuthProvider {
	/// Immutable context shared by every session.
	ctx: Arc<ProviderContext>,
	/// Opens one directory connection per session.
	connector: Arc<dyn DirectoryConnector>,
	/// Credential store for best-effort password caching, when attached.
	store: Option<Arc<dyn CredentialStore>>,
}

impl AuthProvider {
	/// Initialise the provider from the configuration store, talking to the
	/// directory with the stock `ldap3` connector.
	///
	/// Must run before any connection is opened: a configured `tls_reqcert`
	/// is recorded here as the process-wide TLS policy snapshot.
	pub fn init(store: &ConfigStore) -> Result<Self, InitError> {
		let ctx = ProviderContext::init(store)?;
		Ok(Self::from_parts(ctx, Arc::new(LdapConnector)))
	}

	/// Assemble a provider from an explicit context and connector. Tests
	/// use this to drive the machine against a stub directory.
	#[must_use]
	pub fn from_parts(ctx: ProviderContext, connector: Arc<dyn DirectoryConnector>) -> Self {
		Self { ctx: Arc::new(ctx), connector, store: None }
	}

	/// Attach the credential store used for password caching. Caching still
	/// only happens when the context enables it.
	#[must_use]
	pub fn with_credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
		self.store = Some(store);
		self
	}

	/// The context the provider was initialised with.
	#[must_use]
	pub fn context(&self) -> &ProviderContext {
		&self.ctx
	}

	/// Service one request. Returns as soon as the session task is
	/// scheduled, before any I/O happens; the outcome arrives on the
	/// handle's completion channel. Needs to run inside a tokio runtime.
	pub fn handle_auth_request(&self, handle: RequestHandle) {
		let RequestHandle { request, responder } = handle;
		debug!("servicing {:?} for `{}`", request.command, request.user);
		let session = Session::new(Arc::clone(&self.ctx), Arc::clone(&self.connector), request);
		tokio::spawn(session.run(self.store.clone(), responder));
	}

	/// Shut the provider down. Sessions already scheduled run to their
	/// terminal state on their own tasks.
	pub fn finalize(&self) {
		debug!("authentication provider shutting down");
	}
}

impl fmt::Debug for AuthProvider {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("AuthProvider")
			.field("ctx", &self.ctx)
			.field("caching", &self.store.is_some())
			.finish()
	}
}
