#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use chrono::{DateTime, Utc};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
#[cfg(feature = "errors")]
use thiserror::Error;

/// Default room a Connection is bound to when the client supplies none.
pub const DEFAULT_ROOM_ID: &str = "general";

/// Errors for parsing identifiers from strings.
#[cfg_attr(feature = "errors", derive(Error))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[cfg_attr(feature = "errors", error("empty value"))]
	Empty,
}

/// Room identifier. Non-empty; defaults to `general` when not supplied by a caller.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId(String);

impl RoomId {
	/// Construct a non-empty `RoomId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	/// The default room (`"general"`), used when an upgrade request omits `room_id`.
	pub fn default_room() -> Self {
		Self(DEFAULT_ROOM_ID.to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomId::new(s.to_string())
	}
}

/// The authenticated identity bound to a Connection for its entire lifetime.
///
/// Derived once from a validated token at upgrade time; never mutated afterward.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal {
	pub user_id: String,
	pub email: String,
}

impl Principal {
	pub fn new(user_id: impl Into<String>, email: impl Into<String>) -> Self {
		Self { user_id: user_id.into(), email: email.into() }
	}
}

/// Wire/storage representation of a single chat message.
///
/// `user_id` is always overwritten server-side with the sending Connection's principal;
/// `timestamp` is always assigned server-side. Both fields are present on ingress only so
/// the wire shape round-trips through the same struct on the way back out.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
	pub room_id: String,
	pub user_id: String,
	pub content: String,
	pub timestamp: String,
}

impl ChatMessage {
	/// Build an outgoing message with a server-assigned RFC3339 timestamp.
	pub fn stamped(room_id: impl Into<String>, user_id: impl Into<String>, content: impl Into<String>, now: DateTimeRfc3339) -> Self {
		Self { room_id: room_id.into(), user_id: user_id.into(), content: content.into(), timestamp: now.0 }
	}
}

/// Thin wrapper so call sites don't need to depend on `chrono` directly just to stamp a message.
pub struct DateTimeRfc3339(String);

impl DateTimeRfc3339 {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}
}

#[cfg(feature = "serde")]
impl From<DateTime<Utc>> for DateTimeRfc3339 {
	fn from(dt: DateTime<Utc>) -> Self {
		Self(dt.to_rfc3339())
	}
}

#[cfg(test)]
mod proptests {
	use proptest::prelude::*;

	use super::RoomId;

	proptest! {
		/// Any non-blank string round-trips through `RoomId` unchanged (§3 identifier invariant).
		#[test]
		fn non_blank_strings_round_trip(s in "\\PC{1,64}".prop_filter("must not be blank", |s| !s.trim().is_empty())) {
			let room = RoomId::new(s.clone()).unwrap();
			prop_assert_eq!(room.as_str(), s);
		}

		#[test]
		fn blank_strings_are_always_rejected(s in "[ \t]{0,8}") {
			prop_assert!(RoomId::new(s).is_err());
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn room_id_rejects_empty() {
		assert!(RoomId::new("").is_err());
		assert!(RoomId::new("   ").is_err());
		assert_eq!(RoomId::default_room().as_str(), "general");
	}

	#[test]
	fn room_id_parse_roundtrip() {
		let r: RoomId = "alpha".parse().unwrap();
		assert_eq!(r.to_string(), "alpha");
	}

	#[test]
	fn principal_is_plain_data() {
		let p = Principal::new("u-1", "u1@example.com");
		assert_eq!(p.user_id, "u-1");
		assert_eq!(p.email, "u1@example.com");
	}

	#[test]
	fn chat_message_stamped_carries_fields() {
		let msg = ChatMessage::stamped("alpha", "u-1", "hi", DateTimeRfc3339::new("2026-01-01T00:00:00Z"));
		assert_eq!(msg.room_id, "alpha");
		assert_eq!(msg.user_id, "u-1");
		assert_eq!(msg.content, "hi");
		assert_eq!(msg.timestamp, "2026-01-01T00:00:00Z");
	}
}
