//! Directory link backed by the `ldap3` client.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use ldap3::exop::PasswordModify;
use ldap3::{ldap_escape, Ldap, LdapConnAsync, LdapConnSettings, LdapError, Scope, SearchEntry};
use tracing::{debug, warn};

use super::{BindOutcome, ConnectError, DirectoryConnector, DirectoryError, DirectoryLink};
use crate::config::{tls_require_cert_snapshot, ProviderContext, TlsRequireCert};
use crate::secret::Secret;

/// LDAP result code for `success`.
const RC_SUCCESS: u32 = 0;
/// LDAP result code for `invalidCredentials`.
const RC_INVALID_CREDENTIALS: u32 = 49;
/// The attribute-list entry requesting no attributes at all (RFC 4511).
const NO_ATTRS: &str = "1.1";

/// Connector that opens StartTLS-secured `ldap3` connections.
///
/// The TLS verification mode comes from the process-wide `tls_reqcert`
/// snapshot; without one, certificates are verified.
#[derive(Debug, Default)]
pub struct LdapConnector;

#[async_trait]
impl DirectoryConnector for LdapConnector {
	async fn open(&self, ctx: &ProviderContext) -> Result<Box<dyn DirectoryLink>, ConnectError> {
		let verify_peer = tls_require_cert_snapshot().map_or(true, TlsRequireCert::verifies_peer);
		let settings = LdapConnSettings::new()
			.set_conn_timeout(ctx.network_timeout)
			.set_starttls(true)
			.set_no_tls_verify(!verify_peer);

		debug!("connecting to {}", ctx.ldap_uri);
		let (conn, ldap) = LdapConnAsync::from_url_with_settings(settings, &ctx.ldap_uri)
			.await
			.map_err(classify_connect_error)?;

		tokio::spawn(async move {
			if let Err(err) = conn.drive().await {
				warn!("LDAP connection driver error: {}", err);
			}
		});

		Ok(Box::new(LdapLink { ldap, op_timeout: ctx.op_timeout }))
	}
}

/// Classify a connection failure: transport-level refusals are the
/// transient server-down condition, everything else (TLS included) is a
/// setup error.
fn classify_connect_error(err: LdapError) -> ConnectError {
	match &err {
		LdapError::Io { source, .. } if is_server_down(source) => {
			ConnectError::Unreachable(err.to_string())
		}
		LdapError::EndOfStream => ConnectError::Unreachable(err.to_string()),
		_ => ConnectError::Setup(err.to_string()),
	}
}

/// Whether an I/O error means the server never came up on the socket.
fn is_server_down(err: &io::Error) -> bool {
	matches!(
		err.kind(),
		io::ErrorKind::ConnectionRefused
			| io::ErrorKind::ConnectionReset
			| io::ErrorKind::ConnectionAborted
			| io::ErrorKind::NotConnected
			| io::ErrorKind::AddrNotAvailable
			| io::ErrorKind::TimedOut
	)
}

/// One live `ldap3` connection; the connection driver runs on its own task.
struct LdapLink {
	/// Operation handle onto the connection.
	ldap: Ldap,
	/// Timeout applied to each directory operation.
	op_timeout: Duration,
}

#[async_trait]
impl DirectoryLink for LdapLink {
	async fn confirm_tls(&mut self) -> Result<(), DirectoryError> {
		// StartTLS is negotiated while the connection is opened; a link
		// only exists here with the TLS layer already pinned.
		Ok(())
	}

	async fn simple_bind(
		&mut self,
		dn: &str,
		password: &Secret,
	) -> Result<BindOutcome, DirectoryError> {
		debug!("binding as `{}`", dn);
		let result = self
			.ldap
			.with_timeout(self.op_timeout)
			.simple_bind(dn, password.expose())
			.await
			.map_err(|err| DirectoryError(format!("bind failed: {err}")))?;
		match result.rc {
			RC_SUCCESS => Ok(BindOutcome::Bound),
			RC_INVALID_CREDENTIALS => Ok(BindOutcome::InvalidCredentials),
			_ => Err(DirectoryError(format!("bind rejected: {result}"))),
		}
	}

	async fn search_user_dns(
		&mut self,
		base: &str,
		name_attr: &str,
		name: &str,
		object_class: &str,
	) -> Result<Vec<String>, DirectoryError> {
		let filter =
			format!("(&({}={})(objectclass={}))", name_attr, ldap_escape(name), object_class);
		debug!("searching under `{}` with filter `{}`", base, filter);
		let result = self
			.ldap
			.with_timeout(self.op_timeout)
			.search(base, Scope::Subtree, &filter, vec![NO_ATTRS])
			.await
			.map_err(|err| DirectoryError(format!("search failed: {err}")))?;
		if result.1.rc != RC_SUCCESS {
			return Err(DirectoryError(format!("search rejected: {}", result.1)));
		}
		Ok(result
			.0
			.into_iter()
			.filter(|entry| !entry.is_ref())
			.map(|entry| SearchEntry::construct(entry).dn)
			.collect())
	}

	async fn modify_password(
		&mut self,
		user_dn: &str,
		old: &Secret,
		new: &Secret,
	) -> Result<(), DirectoryError> {
		let exop = PasswordModify {
			user_id: Some(user_dn),
			old_pass: Some(old.expose()),
			new_pass: Some(new.expose()),
		};
		let result = self
			.ldap
			.with_timeout(self.op_timeout)
			.extended(exop)
			.await
			.map_err(|err| DirectoryError(format!("password modify failed: {err}")))?;
		debug!("password modify result: {}", result.1);
		if result.1.rc != RC_SUCCESS {
			return Err(DirectoryError(format!("password modify rejected: {}", result.1)));
		}
		Ok(())
	}

	async fn unbind(&mut self) -> Result<(), DirectoryError> {
		self.ldap
			.unbind()
			.await
			.map_err(|err| DirectoryError(format!("unbind failed: {err}")))
	}
}
