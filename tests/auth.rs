#![allow(clippy::expect_used)]

//! End-to-end authentication scenarios against the scripted stub
//! directory.

use std::sync::Arc;

use indoc::indoc;
use ldap_auth::test_helpers::{stub_context, MemoryCredentialStore, StubDirectory, StubOp};
use ldap_auth::{
	AuthProvider, AuthRequest, AuthStatus, Completion, PamCommand, RequestHandle, Secret,
};
use test_log::test;

/// A directory with the service account and one regular user.
fn standard_directory() -> StubDirectory {
	StubDirectory::new()
		.with_service_account("cn=svc", "svcpw")
		.with_user("uid=alice,ou=p,dc=x", "alice", "s3cret")
}

/// A provider over the given directory, without a credential store.
fn provider_over(directory: &StubDirectory) -> AuthProvider {
	AuthProvider::from_parts(stub_context(), Arc::new(directory.clone()))
}

/// A provider over the given directory with an attached credential store.
fn caching_provider_over(
	directory: &StubDirectory,
	store: &MemoryCredentialStore,
) -> AuthProvider {
	provider_over(directory).with_credential_store(Arc::new(store.clone()))
}

/// Submit one request and wait for its completion.
async fn run_request(
	provider: &AuthProvider,
	command: PamCommand,
	user: &str,
	authtok: &str,
	newauthtok: Option<&str>,
) -> Completion {
	let request = AuthRequest {
		command,
		user: user.to_owned(),
		authtok: Secret::from(authtok),
		newauthtok: newauthtok.map(Secret::from),
	};
	let (handle, receiver) = RequestHandle::new(request);
	provider.handle_auth_request(handle);
	receiver.await.expect("the session should complete")
}

#[test(tokio::test)]
async fn authenticates_with_the_correct_password() {
	let directory = standard_directory();
	let store = MemoryCredentialStore::new();
	let provider = caching_provider_over(&directory, &store);

	let completion =
		run_request(&provider, PamCommand::Authenticate, "alice", "s3cret", None).await;

	assert_eq!(completion.status, AuthStatus::Success);
	assert_eq!(store.cached_password("default", "alice"), Some("s3cret".to_owned()));
	assert_eq!(
		directory.operations(),
		vec![
			StubOp::Open,
			StubOp::ConfirmTls,
			StubOp::Bind("cn=svc".to_owned()),
			StubOp::Search("uid".to_owned(), "alice".to_owned(), "posixAccount".to_owned()),
			StubOp::Bind("uid=alice,ou=p,dc=x".to_owned()),
			StubOp::Unbind,
		]
	);
}

#[test(tokio::test)]
async fn rejects_the_wrong_password() {
	let directory = standard_directory();
	let store = MemoryCredentialStore::new();
	let provider = caching_provider_over(&directory, &store);

	let completion =
		run_request(&provider, PamCommand::Authenticate, "alice", "wrong", None).await;

	assert_eq!(completion.status, AuthStatus::BadCredentials);
	assert_eq!(store.cached_password("default", "alice"), None);
	assert_eq!(directory.unbind_count(), 1);
}

#[test(tokio::test)]
async fn reports_an_unknown_user() {
	let directory = standard_directory();
	let provider = provider_over(&directory);

	let completion =
		run_request(&provider, PamCommand::Authenticate, "ghost", "s3cret", None).await;

	assert_eq!(completion.status, AuthStatus::UserUnknown);
	assert_eq!(directory.unbind_count(), 1);
}

#[test(tokio::test)]
async fn reports_a_server_that_is_down() {
	let directory = StubDirectory::new().refusing_connections();
	let provider = provider_over(&directory);

	let completion =
		run_request(&provider, PamCommand::Authenticate, "alice", "s3cret", None).await;

	assert_eq!(completion.status, AuthStatus::ServiceUnavailable);
	assert_eq!(directory.open_count(), 0);
	assert_eq!(directory.unbind_count(), 0);
}

#[test(tokio::test)]
async fn changes_the_password_and_authenticates_with_it() {
	let directory = standard_directory();
	let store = MemoryCredentialStore::new();
	let provider = caching_provider_over(&directory, &store);

	let change =
		run_request(&provider, PamCommand::ChangeAuthTok, "alice", "s3cret", Some("n3w")).await;
	assert_eq!(change.status, AuthStatus::Success);
	assert_eq!(directory.password_of("alice"), Some("n3w".to_owned()));
	assert_eq!(store.cached_password("default", "alice"), Some("n3w".to_owned()));

	let auth = run_request(&provider, PamCommand::Authenticate, "alice", "n3w", None).await;
	assert_eq!(auth.status, AuthStatus::Success);
}

#[test(tokio::test)]
async fn locates_the_user_without_a_user_bind() {
	let directory = standard_directory();
	let provider = provider_over(&directory);

	for command in [
		PamCommand::AcctMgmt,
		PamCommand::SetCred,
		PamCommand::OpenSession,
		PamCommand::CloseSession,
	] {
		let completion = run_request(&provider, command, "alice", "", None).await;
		assert_eq!(completion.status, AuthStatus::Success);
	}

	// One service bind per request, and no user bind at all.
	assert_eq!(directory.bind_count(), 4);
	assert!(directory
		.operations()
		.iter()
		.all(|op| !matches!(op, StubOp::Bind(dn) if dn != "cn=svc")));
}

#[test(tokio::test)]
async fn an_ambiguous_search_is_a_system_error() {
	let directory = standard_directory().with_user("uid=alice,ou=q,dc=x", "alice", "other");
	let provider = provider_over(&directory);

	let completion =
		run_request(&provider, PamCommand::Authenticate, "alice", "s3cret", None).await;

	assert_eq!(completion.status, AuthStatus::SystemError);
	assert_eq!(directory.unbind_count(), 1);
}

#[test(tokio::test)]
async fn an_entry_with_an_empty_dn_is_an_unknown_user() {
	let directory = StubDirectory::new()
		.with_service_account("cn=svc", "svcpw")
		.with_user("", "alice", "s3cret");
	let provider = provider_over(&directory);

	let completion =
		run_request(&provider, PamCommand::Authenticate, "alice", "s3cret", None).await;

	assert_eq!(completion.status, AuthStatus::UserUnknown);
}

#[test(tokio::test)]
async fn a_failing_tls_negotiation_is_a_system_error() {
	let directory = standard_directory().failing_tls();
	let provider = provider_over(&directory);

	let completion =
		run_request(&provider, PamCommand::Authenticate, "alice", "s3cret", None).await;

	assert_eq!(completion.status, AuthStatus::SystemError);
	// The connection was already open, so it is torn down exactly once.
	assert_eq!(directory.unbind_count(), 1);
}

#[test(tokio::test)]
async fn a_rejected_password_modify_is_a_system_error() {
	let directory = standard_directory().refusing_password_modify();
	let provider = provider_over(&directory);

	let completion =
		run_request(&provider, PamCommand::ChangeAuthTok, "alice", "s3cret", Some("n3w")).await;

	assert_eq!(completion.status, AuthStatus::SystemError);
	assert_eq!(directory.password_of("alice"), Some("s3cret".to_owned()));
}

#[test(tokio::test)]
async fn a_password_change_without_a_new_password_is_a_system_error() {
	let directory = standard_directory();
	let provider = provider_over(&directory);

	let completion =
		run_request(&provider, PamCommand::ChangeAuthTok, "alice", "s3cret", None).await;

	assert_eq!(completion.status, AuthStatus::SystemError);
	assert_eq!(directory.password_of("alice"), Some("s3cret".to_owned()));
}

#[test(tokio::test)]
async fn a_failing_credential_store_never_demotes_success() {
	let directory = standard_directory();
	let store = MemoryCredentialStore::failing();
	let provider = caching_provider_over(&directory, &store);

	let completion =
		run_request(&provider, PamCommand::Authenticate, "alice", "s3cret", None).await;

	assert_eq!(completion.status, AuthStatus::Success);
	assert_eq!(store.cached_password("default", "alice"), None);
}

#[test(tokio::test)]
async fn every_session_unbinds_exactly_once() {
	let directory = standard_directory();
	let provider = provider_over(&directory);

	run_request(&provider, PamCommand::Authenticate, "alice", "s3cret", None).await;
	run_request(&provider, PamCommand::Authenticate, "alice", "wrong", None).await;
	run_request(&provider, PamCommand::Authenticate, "ghost", "s3cret", None).await;

	assert_eq!(directory.open_count(), 3);
	assert_eq!(directory.unbind_count(), 3);
}

#[test(tokio::test)]
async fn the_provider_initialises_from_a_configuration_file() {
	let yaml = indoc! {r"
		ldapUri: ldap://directory.example.org
		defaultBindDn: cn=svc,dc=example,dc=org
		defaultAuthtok: svcpw
		userSearchBase: ou=people,dc=example,dc=org
		userNameAttribute: uid
		userObjectClass: posixAccount
		network_timeout: 6
		opt_timeout: 8
		domain: example
		cache_credentials: true
	"};
	let store = config::Config::builder()
		.add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
		.build()
		.expect("the configuration should parse");

	let provider = AuthProvider::init(&store).expect("init should succeed");
	let ctx = provider.context();
	assert_eq!(ctx.ldap_uri.as_str(), "ldap://directory.example.org");
	assert_eq!(ctx.user_search_base, "ou=people,dc=example,dc=org");
	assert_eq!(ctx.domain, "example");
	assert!(ctx.cache_credentials);
	assert_eq!(ctx.network_timeout.as_secs(), 6);
	assert_eq!(ctx.op_timeout.as_secs(), 8);
}
