//! Seam between the authentication machine and the LDAP client.
//!
//! The machine only ever talks to a [`DirectoryLink`], so the same
//! conversation can run against a live `ldap3` connection or against the
//! scripted stub used by the tests.

use async_trait::async_trait;

use crate::config::ProviderContext;
use crate::secret::Secret;

pub mod ldap;

/// Outcome of a simple bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
	/// The directory accepted the credentials.
	Bound,
	/// The directory rejected the credentials (LDAP `invalidCredentials`).
	InvalidCredentials,
}

/// Failure to open a connection to the directory server.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
	/// The server could not be reached at all: connection refused, reset,
	/// or gone before the LDAP layer came up.
	#[error("directory server unreachable: {0}")]
	Unreachable(String),
	/// Connection setup failed after the server was reached, TLS included.
	#[error("connection setup failed: {0}")]
	Setup(String),
}

/// A directory operation failed for a reason other than the user's
/// credentials being wrong.
#[derive(Debug, thiserror::Error)]
#[error("directory operation failed: {0}")]
pub struct DirectoryError(pub String);

/// Opens one directory connection per authentication session.
#[async_trait]
pub trait DirectoryConnector: Send + Sync {
	/// Dial the configured server and begin the TLS negotiation.
	async fn open(&self, ctx: &ProviderContext) -> Result<Box<dyn DirectoryLink>, ConnectError>;
}

/// One open, session-exclusive connection to the directory server.
///
/// Operations are strictly sequential; the machine never has more than one
/// in flight.
#[async_trait]
pub trait DirectoryLink: Send {
	/// Confirm that the TLS layer is in place on the link.
	async fn confirm_tls(&mut self) -> Result<(), DirectoryError>;

	/// Perform a simple bind. An empty `dn` with an empty password is an
	/// anonymous bind.
	async fn simple_bind(
		&mut self,
		dn: &str,
		password: &Secret,
	) -> Result<BindOutcome, DirectoryError>;

	/// Search the subtree under `base` for entries whose `name_attr` equals
	/// `name` and whose object class is `object_class`, requesting no
	/// attributes. Returns the DNs of the matching entries; non-entry
	/// messages such as referrals are not reported.
	async fn search_user_dns(
		&mut self,
		base: &str,
		name_attr: &str,
		name: &str,
		object_class: &str,
	) -> Result<Vec<String>, DirectoryError>;

	/// Change `user_dn`'s password with the password-modify extended
	/// operation (RFC 3062).
	async fn modify_password(
		&mut self,
		user_dn: &str,
		old: &Secret,
		new: &Secret,
	) -> Result<(), DirectoryError>;

	/// Close the connection.
	async fn unbind(&mut self) -> Result<(), DirectoryError>;
}
