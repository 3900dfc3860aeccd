//! The per-request session and the authentication state machine driving it.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::{self, CredentialStore};
use crate::config::ProviderContext;
use crate::directory::{
	BindOutcome, ConnectError, DirectoryConnector, DirectoryError, DirectoryLink,
};
use crate::request::{AuthRequest, AuthStatus, PamCommand, Responder};
use crate::secret::Secret;

/// Steps of the authentication conversation.
///
/// One handler per step; each handler performs the directory operation
/// whose result it checks and names the step that follows. Suspension
/// happens inside the directory operations, where the task yields back to
/// the event loop until the server has answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
	/// Open the connection to the directory server.
	OpInit,
	/// Check the connection bootstrap, TLS included.
	CheckInitResult,
	/// Bind with the provider's service identity.
	CheckStdBind,
	/// Locate the user's entry under the search base.
	CheckSearchDnResult,
	/// Bind as the user to prove the password, changing it when asked.
	CheckUserBind,
	/// Terminal state; the outcome is decided.
	Done,
}

/// Why a conversation ended without `Success`.
#[derive(Debug, thiserror::Error)]
enum AuthFailure {
	/// The directory server could not be reached.
	#[error("directory server unavailable: {0}")]
	Unavailable(String),
	/// No user entry matched the search.
	#[error("user not found in the directory")]
	UnknownUser,
	/// The user bind was rejected.
	#[error("directory rejected the supplied password")]
	WrongPassword,
	/// Everything else: protocol failures, TLS failures, ambiguous search
	/// results, malformed requests.
	#[error("{0}")]
	System(String),
}

impl AuthFailure {
	/// The outcome reported for this failure.
	fn status(&self) -> AuthStatus {
		match self {
			Self::Unavailable(_) => AuthStatus::ServiceUnavailable,
			Self::UnknownUser => AuthStatus::UserUnknown,
			Self::WrongPassword => AuthStatus::BadCredentials,
			Self::System(_) => AuthStatus::SystemError,
		}
	}
}

impl From<DirectoryError> for AuthFailure {
	fn from(err: DirectoryError) -> Self {
		Self::System(err.to_string())
	}
}

/// Per-request state: the connection, the discovered user DN, and the step
/// the conversation is at.
///
/// A session lives on its own task, services exactly one request, and is
/// destroyed on the first terminal path, unbinding the connection if one is
/// open.
pub(crate) struct Session {
	/// Shared provider context.
	ctx: Arc<ProviderContext>,
	/// Opens the session's connection.
	connector: Arc<dyn DirectoryConnector>,
	/// The request being serviced.
	request: AuthRequest,
	/// Open directory connection, present from open until unbind.
	link: Option<Box<dyn DirectoryLink>>,
	/// DN of the user entry discovered by the search step.
	user_dn: Option<String>,
	/// Step the conversation is at.
	step: Step,
}

impl Session {
	/// Create a session over a fresh request.
	pub(crate) fn new(
		ctx: Arc<ProviderContext>,
		connector: Arc<dyn DirectoryConnector>,
		request: AuthRequest,
	) -> Self {
		Self { ctx, connector, request, link: None, user_dn: None, step: Step::OpInit }
	}

	/// Drive the conversation to its terminal state, tear the connection
	/// down, and report the outcome. When the directory just accepted a
	/// password and caching is on, reporting goes through the caching
	/// hand-off instead.
	pub(crate) async fn run(
		mut self,
		store: Option<Arc<dyn CredentialStore>>,
		responder: Responder,
	) {
		let (status, message) = self.converse().await;
		self.teardown().await;

		if status == AuthStatus::Success && self.ctx.cache_credentials {
			if let (Some(store), Some(password)) = (store, self.accepted_password()) {
				let domain = self.ctx.domain.clone();
				let user = self.request.user.clone();
				tokio::spawn(cache::cache_and_complete(
					store, domain, user, password, status, responder,
				));
				return;
			}
		}

		responder.complete(status, message);
	}

	/// Walk the steps until `Done`, converting the first failure into its
	/// outcome. The deadline bounds the whole conversation; running into it
	/// is a system error, not a verdict on the credentials.
	async fn converse(&mut self) -> (AuthStatus, Option<String>) {
		let deadline = self.ctx.session_deadline();
		let verdict = tokio::time::timeout(deadline, self.drive()).await;
		match verdict {
			Ok(Ok(())) => (AuthStatus::Success, None),
			Ok(Err(failure)) => {
				warn!("authentication for `{}` failed: {}", self.request.user, failure);
				(failure.status(), Some(failure.to_string()))
			}
			Err(_) => {
				warn!(
					"authentication for `{}` made no progress within {:?}",
					self.request.user, deadline
				);
				(AuthStatus::SystemError, Some("authentication timed out".to_owned()))
			}
		}
	}

	/// The explicit step sequencing; each handler returns the step that
	/// follows it.
	async fn drive(&mut self) -> Result<(), AuthFailure> {
		loop {
			self.step = match self.step {
				Step::OpInit => self.op_init().await?,
				Step::CheckInitResult => self.check_init_result().await?,
				Step::CheckStdBind => self.check_std_bind().await?,
				Step::CheckSearchDnResult => self.check_search_dn_result().await?,
				Step::CheckUserBind => self.check_user_bind().await?,
				Step::Done => return Ok(()),
			};
		}
	}

	/// Open the connection; StartTLS is requested as part of the bootstrap.
	async fn op_init(&mut self) -> Result<Step, AuthFailure> {
		let link = self.connector.open(&self.ctx).await.map_err(|err| match err {
			ConnectError::Unreachable(reason) => AuthFailure::Unavailable(reason),
			ConnectError::Setup(reason) => AuthFailure::System(reason),
		})?;
		self.link = Some(link);
		Ok(Step::CheckInitResult)
	}

	/// Check that the TLS layer came up on the new connection.
	async fn check_init_result(&mut self) -> Result<Step, AuthFailure> {
		self.link_mut()?.confirm_tls().await?;
		Ok(Step::CheckStdBind)
	}

	/// Bind with the service identity so the user search is allowed. Any
	/// rejection here, wrong service credentials included, is a system
	/// error rather than a verdict on the user.
	async fn check_std_bind(&mut self) -> Result<Step, AuthFailure> {
		let dn = self.ctx.default_bind_dn.clone().unwrap_or_default();
		let password = self.ctx.default_authtok.clone().unwrap_or_default();
		match self.link_mut()?.simple_bind(&dn, &password).await? {
			BindOutcome::Bound => Ok(Step::CheckSearchDnResult),
			BindOutcome::InvalidCredentials => {
				Err(AuthFailure::System("service bind rejected".to_owned()))
			}
		}
	}

	/// Locate the user's DN and decide whether a user bind is required at
	/// all.
	async fn check_search_dn_result(&mut self) -> Result<Step, AuthFailure> {
		let base = self.ctx.user_search_base.clone();
		let attr = self.ctx.user_name_attribute.clone();
		let class = self.ctx.user_object_class.clone();
		let name = self.request.user.clone();
		let dns = self.link_mut()?.search_user_dns(&base, &attr, &name, &class).await?;

		let user_dn = match dns.as_slice() {
			[] => return Err(AuthFailure::UnknownUser),
			[dn] if dn.is_empty() => return Err(AuthFailure::UnknownUser),
			[dn] => dn.clone(),
			_ => {
				return Err(AuthFailure::System(format!(
					"found more than one entry for `{name}`"
				)))
			}
		};
		debug!("found dn `{}` for `{}`", user_dn, name);
		self.user_dn = Some(user_dn);

		if self.request.command.needs_user_bind() {
			Ok(Step::CheckUserBind)
		} else {
			// Locating the user is all the remaining commands need.
			Ok(Step::Done)
		}
	}

	/// Prove the user's password with a bind of their own; on a password
	/// change, follow up with the password-modify operation.
	async fn check_user_bind(&mut self) -> Result<Step, AuthFailure> {
		let user_dn = self
			.user_dn
			.clone()
			.ok_or_else(|| AuthFailure::System("user DN missing before the user bind".to_owned()))?;
		let password = self.request.authtok.clone();
		let new_password = if self.request.command == PamCommand::ChangeAuthTok {
			Some(self.request.newauthtok.clone().ok_or_else(|| {
				AuthFailure::System("password change without a new password".to_owned())
			})?)
		} else {
			None
		};

		match self.link_mut()?.simple_bind(&user_dn, &password).await? {
			BindOutcome::Bound => {}
			BindOutcome::InvalidCredentials => return Err(AuthFailure::WrongPassword),
		}

		if let Some(new_password) = new_password {
			self.link_mut()?.modify_password(&user_dn, &password, &new_password).await?;
		}

		Ok(Step::Done)
	}

	/// Unbind at most once, tolerating a server that is already gone.
	async fn teardown(&mut self) {
		if let Some(mut link) = self.link.take() {
			if let Err(err) = link.unbind().await {
				debug!("unbind failed: {}", err);
			}
		}
	}

	/// The open link; a missing link this deep into the conversation is a
	/// sequencing bug.
	fn link_mut(&mut self) -> Result<&mut (dyn DirectoryLink + '_), AuthFailure> {
		match self.link.as_deref_mut() {
			Some(link) => Ok(link),
			None => Err(AuthFailure::System("no open directory connection".to_owned())),
		}
	}

	/// The password the directory just accepted: the current one for an
	/// authentication, the new one for a password change. `None` for the
	/// commands that never proved a password.
	fn accepted_password(&self) -> Option<Secret> {
		match self.request.command {
			PamCommand::Authenticate => Some(self.request.authtok.clone()),
			PamCommand::ChangeAuthTok => self.request.newauthtok.clone(),
			_ => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::{AuthFailure, Session, Step};
	use crate::request::{AuthRequest, AuthStatus, PamCommand};
	use crate::secret::Secret;
	use crate::test_helpers::{stub_context, StubDirectory};

	/// A session over the given command, pointed at an empty stub.
	fn session_for(command: PamCommand) -> Session {
		let request = AuthRequest {
			command,
			user: "alice".to_owned(),
			authtok: Secret::from("s3cret"),
			newauthtok: Some(Secret::from("n3w")),
		};
		Session::new(Arc::new(stub_context()), Arc::new(StubDirectory::new()), request)
	}

	#[test]
	fn failures_map_onto_the_outcome_taxonomy() {
		assert_eq!(
			AuthFailure::Unavailable("down".to_owned()).status(),
			AuthStatus::ServiceUnavailable
		);
		assert_eq!(AuthFailure::UnknownUser.status(), AuthStatus::UserUnknown);
		assert_eq!(AuthFailure::WrongPassword.status(), AuthStatus::BadCredentials);
		assert_eq!(AuthFailure::System("broken".to_owned()).status(), AuthStatus::SystemError);
	}

	#[test]
	fn sessions_start_at_the_connection_step() {
		let session = session_for(PamCommand::Authenticate);
		assert_eq!(session.step, Step::OpInit);
		assert!(session.link.is_none());
		assert!(session.user_dn.is_none());
	}

	#[test]
	fn accepted_password_follows_the_command() {
		let authenticate = session_for(PamCommand::Authenticate);
		assert_eq!(
			authenticate.accepted_password().map(|secret| secret.expose().to_owned()),
			Some("s3cret".to_owned())
		);

		let change = session_for(PamCommand::ChangeAuthTok);
		assert_eq!(
			change.accepted_password().map(|secret| secret.expose().to_owned()),
			Some("n3w".to_owned())
		);

		let acct = session_for(PamCommand::AcctMgmt);
		assert_eq!(acct.accepted_password(), None);
	}
}
