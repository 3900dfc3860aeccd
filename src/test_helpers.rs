//! Scripted stand-ins for the external collaborators: an in-memory
//! directory server and credential store, used by the tests to drive the
//! authentication machine without network I/O.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::cache::{CacheError, CredentialStore, CredentialTransaction};
use crate::config::ProviderContext;
use crate::directory::{
	BindOutcome, ConnectError, DirectoryConnector, DirectoryError, DirectoryLink,
};
use crate::secret::Secret;

/// A provider context aimed at the stub directory, with caching enabled.
#[must_use]
pub fn stub_context() -> ProviderContext {
	ProviderContext {
		ldap_uri: url::Url::parse("ldap://stub").unwrap_or_else(|_| unreachable!("fixed literal")),
		default_bind_dn: Some("cn=svc".to_owned()),
		default_authtok: Some(Secret::from("svcpw")),
		default_authtok_type: None,
		user_search_base: "ou=p,dc=x".to_owned(),
		user_name_attribute: "uid".to_owned(),
		user_object_class: "posixAccount".to_owned(),
		network_timeout: Duration::from_secs(5),
		op_timeout: Duration::from_secs(5),
		tls_require_cert: None,
		domain: "default".to_owned(),
		cache_credentials: true,
	}
}

/// One user entry known to the stub directory.
#[derive(Debug, Clone)]
pub struct StubUser {
	/// DN of the entry; deliberately empty entries model a directory that
	/// answered with a nameless result.
	pub dn: String,
	/// Value of the name attribute.
	pub name: String,
	/// The entry's password.
	pub password: String,
	/// The entry's object class.
	pub object_class: String,
}

/// Operations the stub directory observed, in order, across connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubOp {
	/// A connection was opened.
	Open,
	/// TLS was confirmed on a connection.
	ConfirmTls,
	/// A simple bind for the given DN.
	Bind(String),
	/// A user search for `(attribute, name, object class)`.
	Search(String, String, String),
	/// A password modify for the given DN.
	ModifyPassword(String),
	/// A connection was unbound.
	Unbind,
}

/// Mutable state shared between a stub directory and the connections it
/// hands out.
#[derive(Debug, Default)]
struct StubState {
	/// User entries the directory knows.
	users: Vec<StubUser>,
	/// Service identities accepted for the initial bind, DN to password.
	service_accounts: HashMap<String, String>,
	/// Refuse TCP connections outright.
	refuse_connections: bool,
	/// Fail the TLS confirmation on every connection.
	fail_tls: bool,
	/// Reject every password-modify operation.
	refuse_password_modify: bool,
	/// Everything the directory was asked to do.
	log: Vec<StubOp>,
	/// Connections opened so far.
	opens: usize,
	/// Unbinds observed so far.
	unbinds: usize,
}

/// The stub state; a poisoned lock just hands the state back.
fn locked(state: &Mutex<StubState>) -> MutexGuard<'_, StubState> {
	state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A scripted in-memory directory implementing the provider's LDAP seam.
#[derive(Debug, Clone, Default)]
pub struct StubDirectory {
	/// State shared with the connections handed out.
	state: Arc<Mutex<StubState>>,
}

impl StubDirectory {
	/// An empty directory that accepts connections and anonymous binds.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Accept `dn` with `password` as a service identity.
	#[must_use]
	pub fn with_service_account(self, dn: &str, password: &str) -> Self {
		locked(&self.state).service_accounts.insert(dn.to_owned(), password.to_owned());
		self
	}

	/// Add a `posixAccount` user entry.
	#[must_use]
	pub fn with_user(self, dn: &str, name: &str, password: &str) -> Self {
		locked(&self.state).users.push(StubUser {
			dn: dn.to_owned(),
			name: name.to_owned(),
			password: password.to_owned(),
			object_class: "posixAccount".to_owned(),
		});
		self
	}

	/// Refuse TCP connections, as if the server were down.
	#[must_use]
	pub fn refusing_connections(self) -> Self {
		locked(&self.state).refuse_connections = true;
		self
	}

	/// Fail the TLS negotiation on every connection.
	#[must_use]
	pub fn failing_tls(self) -> Self {
		locked(&self.state).fail_tls = true;
		self
	}

	/// Reject every password-modify operation.
	#[must_use]
	pub fn refusing_password_modify(self) -> Self {
		locked(&self.state).refuse_password_modify = true;
		self
	}

	/// The operations performed so far, in order.
	#[must_use]
	pub fn operations(&self) -> Vec<StubOp> {
		locked(&self.state).log.clone()
	}

	/// Number of binds performed so far.
	#[must_use]
	pub fn bind_count(&self) -> usize {
		locked(&self.state)
			.log
			.iter()
			.filter(|op| matches!(op, StubOp::Bind(_)))
			.count()
	}

	/// Number of connections opened so far.
	#[must_use]
	pub fn open_count(&self) -> usize {
		locked(&self.state).opens
	}

	/// Number of unbinds observed so far.
	#[must_use]
	pub fn unbind_count(&self) -> usize {
		locked(&self.state).unbinds
	}

	/// Current password of the named user, if the directory knows them.
	#[must_use]
	pub fn password_of(&self, name: &str) -> Option<String> {
		locked(&self.state)
			.users
			.iter()
			.find(|user| user.name == name)
			.map(|user| user.password.clone())
	}
}

#[async_trait]
impl DirectoryConnector for StubDirectory {
	async fn open(&self, _ctx: &ProviderContext) -> Result<Box<dyn DirectoryLink>, ConnectError> {
		let mut state = locked(&self.state);
		if state.refuse_connections {
			return Err(ConnectError::Unreachable("connection refused".to_owned()));
		}
		state.opens += 1;
		state.log.push(StubOp::Open);
		Ok(Box::new(StubLink { state: Arc::clone(&self.state) }))
	}
}

/// One stub connection.
#[derive(Debug)]
struct StubLink {
	/// State shared with the parent directory.
	state: Arc<Mutex<StubState>>,
}

#[async_trait]
impl DirectoryLink for StubLink {
	async fn confirm_tls(&mut self) -> Result<(), DirectoryError> {
		let mut state = locked(&self.state);
		state.log.push(StubOp::ConfirmTls);
		if state.fail_tls {
			return Err(DirectoryError("TLS negotiation failed".to_owned()));
		}
		Ok(())
	}

	async fn simple_bind(
		&mut self,
		dn: &str,
		password: &Secret,
	) -> Result<BindOutcome, DirectoryError> {
		let mut state = locked(&self.state);
		state.log.push(StubOp::Bind(dn.to_owned()));
		if dn.is_empty() {
			return Ok(BindOutcome::Bound);
		}
		let expected = state
			.service_accounts
			.get(dn)
			.cloned()
			.or_else(|| {
				state.users.iter().find(|user| user.dn == dn).map(|user| user.password.clone())
			});
		Ok(match expected {
			Some(expected) if expected == password.expose() => BindOutcome::Bound,
			_ => BindOutcome::InvalidCredentials,
		})
	}

	async fn search_user_dns(
		&mut self,
		_base: &str,
		name_attr: &str,
		name: &str,
		object_class: &str,
	) -> Result<Vec<String>, DirectoryError> {
		let mut state = locked(&self.state);
		state.log.push(StubOp::Search(
			name_attr.to_owned(),
			name.to_owned(),
			object_class.to_owned(),
		));
		Ok(state
			.users
			.iter()
			.filter(|user| user.name == name && user.object_class == object_class)
			.map(|user| user.dn.clone())
			.collect())
	}

	async fn modify_password(
		&mut self,
		user_dn: &str,
		old: &Secret,
		new: &Secret,
	) -> Result<(), DirectoryError> {
		let mut state = locked(&self.state);
		state.log.push(StubOp::ModifyPassword(user_dn.to_owned()));
		if state.refuse_password_modify {
			return Err(DirectoryError("password modify refused".to_owned()));
		}
		let Some(user) = state.users.iter_mut().find(|user| user.dn == user_dn) else {
			return Err(DirectoryError(format!("no entry `{user_dn}`")));
		};
		if user.password != old.expose() {
			return Err(DirectoryError("old password does not match".to_owned()));
		}
		user.password = new.expose().to_owned();
		Ok(())
	}

	async fn unbind(&mut self) -> Result<(), DirectoryError> {
		let mut state = locked(&self.state);
		state.unbinds += 1;
		state.log.push(StubOp::Unbind);
		Ok(())
	}
}

/// In-memory credential store recording cached passwords.
#[derive(Debug, Clone, Default)]
pub struct MemoryCredentialStore {
	/// Cached passwords keyed by `(domain, user)`.
	entries: Arc<Mutex<HashMap<(String, String), String>>>,
	/// Fail every write, for exercising the best-effort path.
	fail_writes: bool,
}

impl MemoryCredentialStore {
	/// An empty store whose writes succeed.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// A store whose writes always fail.
	#[must_use]
	pub fn failing() -> Self {
		Self { entries: Arc::default(), fail_writes: true }
	}

	/// The cached password for `user` in `domain`, if one was written.
	#[must_use]
	pub fn cached_password(&self, domain: &str, user: &str) -> Option<String> {
		self.entries
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.get(&(domain.to_owned(), user.to_owned()))
			.cloned()
	}
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
	async fn begin_transaction(&self) -> Result<Box<dyn CredentialTransaction>, CacheError> {
		Ok(Box::new(MemoryTransaction {
			entries: Arc::clone(&self.entries),
			fail_writes: self.fail_writes,
		}))
	}
}

/// One open transaction on the in-memory store.
#[derive(Debug)]
struct MemoryTransaction {
	/// Entries shared with the parent store.
	entries: Arc<Mutex<HashMap<(String, String), String>>>,
	/// Whether the write is scripted to fail.
	fail_writes: bool,
}

#[async_trait]
impl CredentialTransaction for MemoryTransaction {
	async fn set_cached_password(
		&mut self,
		domain: &str,
		user: &str,
		password: &Secret,
	) -> Result<(), CacheError> {
		if self.fail_writes {
			return Err(CacheError("credential store write refused".to_owned()));
		}
		self.entries
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.insert((domain.to_owned(), user.to_owned()), password.expose().to_owned());
		Ok(())
	}

	async fn finish(self: Box<Self>, _success: bool) -> Result<(), CacheError> {
		Ok(())
	}
}
