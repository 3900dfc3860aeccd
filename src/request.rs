//! PAM-style requests and the completion seam towards the dispatcher.

use tokio::sync::oneshot;

use crate::secret::Secret;

/// The PAM-style commands delivered by the host authentication stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PamCommand {
	/// Verify the user's password.
	Authenticate,
	/// Change the user's password.
	ChangeAuthTok,
	/// Account management; resolving the user is all this provider does.
	AcctMgmt,
	/// Credential establishment; resolving the user is all this provider
	/// does.
	SetCred,
	/// Session open; resolving the user is all this provider does.
	OpenSession,
	/// Session close; resolving the user is all this provider does.
	CloseSession,
}

impl PamCommand {
	/// Whether the command requires the user to prove their password with a
	/// bind of their own.
	#[must_use]
	pub fn needs_user_bind(self) -> bool {
		matches!(self, Self::Authenticate | Self::ChangeAuthTok)
	}
}

/// Outcome of a request, reported to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
	/// Authentication or password change succeeded, or the command only
	/// needed the user to be located.
	Success,
	/// The directory rejected the user's password.
	BadCredentials,
	/// No matching user entry exists in the directory.
	UserUnknown,
	/// The directory server could not be reached.
	ServiceUnavailable,
	/// Any other directory or local failure.
	SystemError,
}

/// One authentication-related request.
#[derive(Debug)]
pub struct AuthRequest {
	/// The command to service.
	pub command: PamCommand,
	/// The username being authenticated.
	pub user: String,
	/// The user's current password.
	pub authtok: Secret,
	/// The new password, for [`PamCommand::ChangeAuthTok`].
	pub newauthtok: Option<Secret>,
}

/// Completion message delivered to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
	/// Final outcome of the request.
	pub status: AuthStatus,
	/// Diagnostic message accompanying a failure, if any.
	pub message: Option<String>,
}

/// A request together with its single-use completion channel.
#[derive(Debug)]
pub struct RequestHandle {
	/// The request payload.
	pub request: AuthRequest,
	/// Responder consumed when the request completes.
	pub(crate) responder: Responder,
}

impl RequestHandle {
	/// Wrap a request, returning the handle and the receiver on which the
	/// dispatcher awaits the completion.
	#[must_use]
	pub fn new(request: AuthRequest) -> (Self, oneshot::Receiver<Completion>) {
		let (sender, receiver) = oneshot::channel();
		(Self { request, responder: Responder(sender) }, receiver)
	}
}

/// Single-use completion sender.
///
/// Completing consumes the responder, so a session can only ever report one
/// outcome.
#[derive(Debug)]
pub(crate) struct Responder(oneshot::Sender<Completion>);

impl Responder {
	/// Report the final outcome. A dispatcher that stopped listening is
	/// logged and otherwise ignored; the session already ran to completion.
	pub(crate) fn complete(self, status: AuthStatus, message: Option<String>) {
		tracing::debug!("request completed: {:?}", status);
		if self.0.send(Completion { status, message }).is_err() {
			tracing::warn!("dispatcher dropped the completion receiver");
		}
	}
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
	use super::{AuthRequest, AuthStatus, PamCommand, RequestHandle};
	use crate::secret::Secret;

	#[tokio::test]
	async fn completion_reaches_the_dispatcher() {
		let request = AuthRequest {
			command: PamCommand::Authenticate,
			user: "alice".to_owned(),
			authtok: Secret::from("s3cret"),
			newauthtok: None,
		};
		let (handle, receiver) = RequestHandle::new(request);
		handle.responder.complete(AuthStatus::Success, None);
		let completion = receiver.await.expect("completion should arrive");
		assert_eq!(completion.status, AuthStatus::Success);
		assert_eq!(completion.message, None);
	}

	#[test]
	fn only_authentication_commands_bind_as_the_user() {
		assert!(PamCommand::Authenticate.needs_user_bind());
		assert!(PamCommand::ChangeAuthTok.needs_user_bind());
		assert!(!PamCommand::AcctMgmt.needs_user_bind());
		assert!(!PamCommand::SetCred.needs_user_bind());
		assert!(!PamCommand::OpenSession.needs_user_bind());
		assert!(!PamCommand::CloseSession.needs_user_bind());
	}
}
