#![forbid(unsafe_code)]

pub mod secret {
	use core::fmt;

	/// Wrapper that redacts its contents in `Debug`/`Display` output.
	///
	/// Holds configuration values (JWT secrets, connection-string credentials) that must never
	/// land in a log line even via a derive on a containing struct.
	#[derive(Clone)]
	pub struct SecretString(String);

	impl SecretString {
		pub fn new(s: impl Into<String>) -> Self {
			Self(s.into())
		}

		/// Access the inner secret string.
		pub fn expose(&self) -> &str {
			&self.0
		}
	}

	impl fmt::Debug for SecretString {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			f.write_str("SecretString(<redacted>)")
		}
	}

	impl fmt::Display for SecretString {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			f.write_str("<redacted>")
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn debug_and_display_redact() {
			let s = SecretString::new("super-secret");
			assert_eq!(format!("{s:?}"), "SecretString(<redacted>)");
			assert_eq!(format!("{s}"), "<redacted>");
			assert_eq!(s.expose(), "super-secret");
		}
	}
}

pub mod bindaddr {
	use std::net::SocketAddr;

	/// Parse a `host:port` bind address, producing a consistent error message across every CLI
	/// flag and config field that accepts one.
	pub fn parse(s: &str) -> Result<SocketAddr, String> {
		let s = s.trim();
		if s.is_empty() {
			return Err("bind address must be non-empty (expected host:port)".to_string());
		}

		s.parse().map_err(|_| format!("invalid bind address (expected host:port): {s}"))
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn parses_valid_addr() {
			let a = parse("127.0.0.1:8080").unwrap();
			assert_eq!(a.to_string(), "127.0.0.1:8080");
		}

		#[test]
		fn rejects_empty_and_malformed() {
			assert!(parse("").is_err());
			assert!(parse("not-an-addr").is_err());
		}
	}
}
