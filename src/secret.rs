//! Password material handling.

use std::fmt;

use zeroize::Zeroize;

/// An owned credential that is wiped from memory when dropped.
///
/// PAM-style authtoks travel through the whole authentication conversation,
/// so they get a dedicated type that zeroes its buffer on drop and keeps the
/// value out of `Debug` output.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
	/// Expose the secret for handing to the directory server.
	#[must_use]
	pub fn expose(&self) -> &str {
		&self.0
	}

	/// Number of bytes in the secret.
	#[must_use]
	pub fn len(&self) -> usize {
		self.0.len()
	}

	/// Whether the secret is empty.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl Zeroize for Secret {
	fn zeroize(&mut self) {
		self.0.zeroize();
	}
}

impl Drop for Secret {
	fn drop(&mut self) {
		self.zeroize();
	}
}

impl From<String> for Secret {
	fn from(value: String) -> Self {
		Self(value)
	}
}

impl From<&str> for Secret {
	fn from(value: &str) -> Self {
		Self(value.to_owned())
	}
}

impl fmt::Debug for Secret {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("Secret(<redacted>)")
	}
}
