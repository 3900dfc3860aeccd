//! Provider parameters: loading, validation, and the immutable context.

use std::sync::OnceLock;
use std::time::Duration;

use url::Url;

use crate::secret::Secret;

/// The configuration store handed to the provider by the host daemon.
pub type ConfigStore = config::Config;

/// Default URI of the directory server.
const DEFAULT_LDAP_URI: &str = "ldap://localhost";
/// Default attribute compared against the username.
const DEFAULT_NAME_ATTRIBUTE: &str = "uid";
/// Default object class required of user entries.
const DEFAULT_OBJECT_CLASS: &str = "posixAccount";
/// Default network and operation timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 5;
/// Default domain name handed to the credential store.
const DEFAULT_DOMAIN: &str = "default";

/// Errors surfaced by provider initialisation.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
	/// A parameter failed validation or could not be parsed.
	#[error("invalid configuration: {0}")]
	InvalidConfig(String),
	/// The configuration store could not be read.
	#[error("configuration store error")]
	Store(#[from] config::ConfigError),
}

/// TLS certificate requirement policy, mirroring the values accepted by the
/// `tls_reqcert` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRequireCert {
	/// Never request a server certificate.
	Never,
	/// Request a certificate and proceed even if none or a bad one arrives.
	Allow,
	/// Request a certificate and drop a bad one, continuing the session.
	Try,
	/// Demand a valid certificate, terminating the session otherwise.
	Demand,
	/// Synonym of [`TlsRequireCert::Demand`].
	Hard,
}

impl TlsRequireCert {
	/// Parse the configuration value, case-insensitively.
	fn parse(value: &str) -> Result<Self, InitError> {
		match value.to_ascii_lowercase().as_str() {
			"never" => Ok(Self::Never),
			"allow" => Ok(Self::Allow),
			"try" => Ok(Self::Try),
			"demand" => Ok(Self::Demand),
			"hard" => Ok(Self::Hard),
			other => Err(InitError::InvalidConfig(format!(
				"unknown value for tls_reqcert: `{other}`"
			))),
		}
	}

	/// Whether connections made under this policy verify the server
	/// certificate.
	#[must_use]
	pub fn verifies_peer(self) -> bool {
		matches!(self, Self::Demand | Self::Hard)
	}
}

/// Process-wide snapshot of the TLS certificate policy.
///
/// The policy feeds the TLS context of every connection, so it is fixed
/// before the first connection is opened and cannot change afterwards.
static TLS_REQUIRE_CERT: OnceLock<TlsRequireCert> = OnceLock::new();

/// The TLS certificate policy snapshot, if an init recorded one.
#[must_use]
pub fn tls_require_cert_snapshot() -> Option<TlsRequireCert> {
	TLS_REQUIRE_CERT.get().copied()
}

/// Record the TLS policy snapshot. A later init asking for a different
/// policy keeps the snapshot and is logged.
fn record_tls_policy(policy: TlsRequireCert) {
	let recorded = *TLS_REQUIRE_CERT.get_or_init(|| policy);
	if recorded != policy {
		tracing::warn!(
			"tls_reqcert is fixed per process; keeping {:?}, ignoring {:?}",
			recorded,
			policy
		);
	}
}

/// Immutable provider context shared by every session.
#[derive(Debug)]
pub struct ProviderContext {
	/// URI of the directory server.
	pub ldap_uri: Url,
	/// Identity used for the initial search bind; anonymous when unset.
	pub default_bind_dn: Option<String>,
	/// Credential for the initial search bind.
	pub default_authtok: Option<Secret>,
	/// Tag describing the kind of `default_authtok`; stored, not
	/// interpreted.
	pub default_authtok_type: Option<String>,
	/// Subtree under which user entries live.
	pub user_search_base: String,
	/// Attribute compared against the username.
	pub user_name_attribute: String,
	/// Object class required of user entries.
	pub user_object_class: String,
	/// Connection establishment timeout.
	pub network_timeout: Duration,
	/// Per-operation timeout.
	pub op_timeout: Duration,
	/// TLS certificate requirement policy, when configured.
	pub tls_require_cert: Option<TlsRequireCert>,
	/// Domain name handed to the credential store.
	pub domain: String,
	/// Whether accepted passwords are cached into the credential store.
	pub cache_credentials: bool,
}

impl ProviderContext {
	/// Read and validate the provider parameters from the configuration
	/// store.
	///
	/// Parameter names are read verbatim as the provider namespace defines
	/// them, hence the mix of camelCase and snake_case. On success the TLS
	/// policy, when present, is recorded as the process-wide snapshot.
	pub fn init(store: &ConfigStore) -> Result<Self, InitError> {
		let user_search_base = opt_string(store, "userSearchBase")?
			.filter(|base| !base.is_empty())
			.ok_or_else(|| InitError::InvalidConfig("missing userSearchBase".to_owned()))?;

		let raw_uri = string_or(store, "ldapUri", DEFAULT_LDAP_URI)?;
		let ldap_uri = Url::parse(&raw_uri)
			.map_err(|err| InitError::InvalidConfig(format!("bad ldapUri `{raw_uri}`: {err}")))?;

		let tls_require_cert = opt_string(store, "tls_reqcert")?
			.as_deref()
			.map(TlsRequireCert::parse)
			.transpose()?;

		let ctx = Self {
			ldap_uri,
			default_bind_dn: opt_string(store, "defaultBindDn")?,
			default_authtok: opt_string(store, "defaultAuthtok")?.map(Secret::from),
			default_authtok_type: opt_string(store, "defaultAuthtokType")?,
			user_search_base,
			user_name_attribute: string_or(store, "userNameAttribute", DEFAULT_NAME_ATTRIBUTE)?,
			user_object_class: string_or(store, "userObjectClass", DEFAULT_OBJECT_CLASS)?,
			network_timeout: Duration::from_secs(seconds_or(
				store,
				"network_timeout",
				DEFAULT_TIMEOUT_SECS,
			)?),
			op_timeout: Duration::from_secs(seconds_or(store, "opt_timeout", DEFAULT_TIMEOUT_SECS)?),
			tls_require_cert,
			domain: string_or(store, "domain", DEFAULT_DOMAIN)?,
			cache_credentials: bool_or(store, "cache_credentials", false)?,
		};

		if let Some(policy) = ctx.tls_require_cert {
			record_tls_policy(policy);
		}

		Ok(ctx)
	}

	/// Upper bound for one whole authentication conversation: connection
	/// establishment plus one allowance per directory operation the longest
	/// conversation performs.
	#[must_use]
	pub fn session_deadline(&self) -> Duration {
		self.network_timeout + self.op_timeout * 5
	}
}

/// Read an optional string parameter; absence is not an error.
fn opt_string(store: &ConfigStore, key: &str) -> Result<Option<String>, InitError> {
	match store.get_string(key) {
		Ok(value) => Ok(Some(value)),
		Err(config::ConfigError::NotFound(_)) => Ok(None),
		Err(err) => Err(InitError::Store(err)),
	}
}

/// Read a string parameter, falling back to `default` when unset.
fn string_or(store: &ConfigStore, key: &str, default: &str) -> Result<String, InitError> {
	Ok(opt_string(store, key)?.unwrap_or_else(|| default.to_owned()))
}

/// Read a non-negative seconds parameter, falling back to `default` when
/// unset.
fn seconds_or(store: &ConfigStore, key: &str, default: u64) -> Result<u64, InitError> {
	match store.get_int(key) {
		Ok(value) => u64::try_from(value)
			.map_err(|_| InitError::InvalidConfig(format!("{key} must not be negative"))),
		Err(config::ConfigError::NotFound(_)) => Ok(default),
		Err(err) => Err(InitError::Store(err)),
	}
}

/// Read a boolean parameter, falling back to `default` when unset.
fn bool_or(store: &ConfigStore, key: &str, default: bool) -> Result<bool, InitError> {
	match store.get_bool(key) {
		Ok(value) => Ok(value),
		Err(config::ConfigError::NotFound(_)) => Ok(default),
		Err(err) => Err(InitError::Store(err)),
	}
}
