//! Command-line driver for the LDAP authentication provider.
//!
//! Reads the provider configuration, services a single PAM-style request
//! for the named user, and exits with a code describing the outcome.
//! Password material is read from standard input, one value per line.

use std::path::Path;
use std::process::ExitCode;
use std::str::FromStr;

use anyhow::{bail, Context};
use ldap_auth::{AuthProvider, AuthRequest, AuthStatus, PamCommand, RequestHandle, Secret};
use tracing::level_filters::LevelFilter;

#[tokio::main]
async fn main() -> ExitCode {
	match run().await {
		Ok(status) => exit_code(status),
		Err(err) => {
			tracing::error!("{:#}", err);
			ExitCode::FAILURE
		}
	}
}

/// Load the configuration, run one request, report the outcome.
async fn run() -> anyhow::Result<AuthStatus> {
	let config_path =
		std::env::var("LDAP_AUTH_CONFIG").unwrap_or_else(|_| "config.yaml".to_owned());
	let store = config::Config::builder()
		.add_source(config::File::from(Path::new(&config_path)))
		.build()
		.with_context(|| format!("reading the provider configuration from `{config_path}` failed"))?;

	let log_level = store.get_string("log_level").ok();
	let subscriber = tracing_subscriber::FmtSubscriber::builder()
		.with_max_level(
			log_level
				.as_ref()
				.map_or(Ok(LevelFilter::INFO), |level| LevelFilter::from_str(level))?,
		)
		.finish();
	tracing::subscriber::set_global_default(subscriber)
		.context("setting default tracing subscriber failed")?;

	let (command, user) = parse_args()?;
	let request = build_request(command, user).await?;

	let provider = AuthProvider::init(&store)?;
	let (handle, completion) = RequestHandle::new(request);
	provider.handle_auth_request(handle);
	let completion = completion.await.context("the session dropped its completion channel")?;

	if let Some(message) = &completion.message {
		tracing::warn!("{}", message);
	}
	tracing::info!("outcome: {:?}", completion.status);
	provider.finalize();
	Ok(completion.status)
}

/// Parse `<command> <user>` from the command line.
fn parse_args() -> anyhow::Result<(PamCommand, String)> {
	let mut args = std::env::args().skip(1);
	let command = match args.next().as_deref() {
		Some("authenticate") => PamCommand::Authenticate,
		Some("change-password") => PamCommand::ChangeAuthTok,
		Some("check-account") => PamCommand::AcctMgmt,
		Some(other) => bail!("unknown command `{other}`"),
		None => bail!("usage: ldap-auth <authenticate|change-password|check-account> <user>"),
	};
	let Some(user) = args.next() else {
		bail!("missing user name");
	};
	Ok((command, user))
}

/// Assemble the request, reading password material from standard input for
/// the commands that need it.
async fn build_request(command: PamCommand, user: String) -> anyhow::Result<AuthRequest> {
	let authtok = if command.needs_user_bind() {
		Secret::from(read_secret_line().await?)
	} else {
		Secret::default()
	};
	let newauthtok = if command == PamCommand::ChangeAuthTok {
		Some(Secret::from(read_secret_line().await?))
	} else {
		None
	};
	Ok(AuthRequest { command, user, authtok, newauthtok })
}

/// Read one line from standard input, stripped of its line ending.
async fn read_secret_line() -> anyhow::Result<String> {
	use tokio::io::AsyncBufReadExt;

	let mut line = String::new();
	let mut reader = tokio::io::BufReader::new(tokio::io::stdin());
	reader.read_line(&mut line).await.context("reading a password from stdin failed")?;
	Ok(line.trim_end_matches(['\r', '\n']).to_owned())
}

/// Map the outcome onto the process exit code.
fn exit_code(status: AuthStatus) -> ExitCode {
	match status {
		AuthStatus::Success => ExitCode::SUCCESS,
		AuthStatus::BadCredentials => ExitCode::from(1),
		AuthStatus::UserUnknown => ExitCode::from(2),
		AuthStatus::ServiceUnavailable => ExitCode::from(3),
		AuthStatus::SystemError => ExitCode::from(4),
	}
}
