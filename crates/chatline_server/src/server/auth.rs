#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use chatline_domain::Principal;
use chatline_util::secret::SecretString;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Claims carried by the HS256 JWT the Hub's upgrade path consumes.
///
/// Grounded on the original system's auth service: the signer embeds exactly these three fields
/// and nothing else.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
	user_id: String,
	email: String,
	exp: u64,
}

#[derive(Debug, Error)]
pub enum AuthError {
	#[error("missing token")]
	Missing,
	#[error("malformed or unparseable token")]
	Malformed,
	#[error("invalid token signature")]
	BadSignature,
	#[error("token expired")]
	Expired,
}

/// Issues and validates the HMAC-SHA256 JWTs the Hub's upgrade endpoint depends on.
///
/// This is the token-validating boundary the spec calls out as an external collaborator; the
/// `issue` half exists for tests and ops tooling to mint tokens, not as a full account-signup
/// service (the original system's bcrypt-backed registration flow is out of scope, §1).
#[derive(Clone)]
pub struct TokenService {
	secret: SecretString,
	default_ttl: std::time::Duration,
}

impl TokenService {
	pub fn new(secret: SecretString, default_ttl: std::time::Duration) -> Self {
		Self { secret, default_ttl }
	}

	/// Mint a token binding `user_id` and `email`, expiring after `default_ttl`.
	pub fn issue(&self, user_id: &str, email: &str) -> Result<String, AuthError> {
		let exp = now_unix_secs() + self.default_ttl.as_secs();
		let claims = Claims {
			user_id: user_id.to_string(),
			email: email.to_string(),
			exp,
		};

		encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(self.secret.expose().as_bytes()))
			.map_err(|_| AuthError::Malformed)
	}

	/// Verify signature and strictly check `exp` against the current wall clock (§9 open
	/// question, resolved: no grace period).
	pub fn validate(&self, token: &str) -> Result<Principal, AuthError> {
		if token.trim().is_empty() {
			return Err(AuthError::Missing);
		}

		let mut validation = Validation::new(Algorithm::HS256);
		validation.validate_exp = true;
		validation.set_required_spec_claims(&["exp"]);

		let data = decode::<Claims>(token, &DecodingKey::from_secret(self.secret.expose().as_bytes()), &validation).map_err(
			|e| match e.kind() {
				jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
				jsonwebtoken::errors::ErrorKind::InvalidSignature => AuthError::BadSignature,
				_ => AuthError::Malformed,
			},
		)?;

		if data.claims.exp <= now_unix_secs() {
			return Err(AuthError::Expired);
		}

		Ok(Principal::new(data.claims.user_id, data.claims.email))
	}
}

fn now_unix_secs() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Pull a bearer token out of either the `token` query parameter or an `Authorization: Bearer`
/// header, per §6's upgrade endpoint contract.
pub fn extract_token(query_token: Option<&str>, auth_header: Option<&str>) -> Option<String> {
	if let Some(t) = query_token
		&& !t.is_empty()
	{
		return Some(t.to_string());
	}

	auth_header.and_then(|h| h.strip_prefix("Bearer ")).map(|t| t.to_string())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn service() -> TokenService {
		TokenService::new(SecretString::new("test-secret"), std::time::Duration::from_secs(3600))
	}

	#[test]
	fn issue_then_validate_roundtrips_claims() {
		let svc = service();
		let token = svc.issue("u-1", "u1@example.com").unwrap();
		let principal = svc.validate(&token).unwrap();
		assert_eq!(principal.user_id, "u-1");
		assert_eq!(principal.email, "u1@example.com");
	}

	#[test]
	fn wrong_secret_is_rejected() {
		let svc = service();
		let token = svc.issue("u-1", "u1@example.com").unwrap();

		let other = TokenService::new(SecretString::new("other-secret"), std::time::Duration::from_secs(3600));
		assert!(matches!(other.validate(&token), Err(AuthError::BadSignature)));
	}

	#[test]
	fn expired_token_is_rejected() {
		let svc = service();
		let claims = Claims {
			user_id: "u-1".to_string(),
			email: "u1@example.com".to_string(),
			exp: now_unix_secs().saturating_sub(60),
		};
		let token = encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(b"test-secret")).unwrap();

		assert!(matches!(svc.validate(&token), Err(AuthError::Expired)));
	}

	#[test]
	fn empty_token_is_missing() {
		let svc = service();
		assert!(matches!(svc.validate(""), Err(AuthError::Missing)));
	}

	#[test]
	fn extract_token_prefers_query_over_header() {
		assert_eq!(extract_token(Some("q"), Some("Bearer h")), Some("q".to_string()));
		assert_eq!(extract_token(None, Some("Bearer h")), Some("h".to_string()));
		assert_eq!(extract_token(Some(""), Some("Bearer h")), Some("h".to_string()));
		assert_eq!(extract_token(None, None), None);
		assert_eq!(extract_token(None, Some("h")), None);
	}
}
