#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context as _;
use chatline_domain::RoomId;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

/// Façade over Redis providing the per-room presence set, per-member TTL keys, and pub/sub
/// publish/subscribe on the per-room channel (§4.4).
///
/// All mutations are pipelined as atomic multi-commands; no in-process locking guards this store
/// because it is shared across every instance in the deployment (§3 ownership note).
#[derive(Clone)]
pub struct PresenceStore {
	client: redis::Client,
	manager: ConnectionManager,
	ttl: Duration,
}

impl PresenceStore {
	pub async fn connect(url: &str, ttl: Duration) -> anyhow::Result<Self> {
		let client = redis::Client::open(url).context("open redis client")?;
		let manager = ConnectionManager::new(client.clone()).await.context("connect redis connection manager")?;
		Ok(Self { client, manager, ttl })
	}

	/// Add `user_id` to the room's presence set and (re)set its TTL key. Idempotent: calling
	/// this twice in a row is equivalent to calling it once (set semantics + TTL reset).
	pub async fn track(&self, room: &RoomId, user_id: &str) -> anyhow::Result<()> {
		let mut conn = self.manager.clone();
		redis::pipe()
			.atomic()
			.sadd(set_key(room), user_id)
			.set_ex(member_key(room, user_id), "1", self.ttl.as_secs())
			.query_async::<()>(&mut conn)
			.await
			.context("presence track")
	}

	/// Equivalent to `track`; kept as a distinct method name to make call sites read as
	/// heartbeat refreshes rather than initial joins.
	pub async fn refresh(&self, room: &RoomId, user_id: &str) -> anyhow::Result<()> {
		self.track(room, user_id).await
	}

	/// Remove `user_id` from the room's presence set and delete its TTL key.
	pub async fn remove(&self, room: &RoomId, user_id: &str) -> anyhow::Result<()> {
		let mut conn = self.manager.clone();
		redis::pipe()
			.atomic()
			.srem(set_key(room), user_id)
			.del(member_key(room, user_id))
			.query_async::<()>(&mut conn)
			.await
			.context("presence remove")
	}

	/// Live member count with stale-member reaping (§4.1 presence query, the self-healing
	/// property). A member whose TTL key has expired did not count toward the returned total and
	/// is evicted from the set before this call returns.
	pub async fn count(&self, room: &RoomId) -> anyhow::Result<u64> {
		let mut conn = self.manager.clone();
		let members: Vec<String> = conn.smembers(set_key(room)).await.context("presence smembers")?;

		let mut live = 0u64;
		let mut stale = Vec::new();
		for member in &members {
			let ttl: i64 = conn.ttl(member_key(room, member)).await.context("presence ttl")?;
			if ttl > 0 {
				live += 1;
			} else {
				stale.push(member.clone());
			}
		}

		if !stale.is_empty() {
			let mut pipe = redis::pipe();
			pipe.atomic();
			for member in &stale {
				pipe.srem(set_key(room), member);
			}
			pipe.query_async::<()>(&mut conn).await.context("presence reap stale")?;
		}

		Ok(live)
	}

	/// Publish a pre-encoded payload to the room's channel (`chat_room:<room_id>`).
	pub async fn publish(&self, room: &RoomId, payload: &str) -> anyhow::Result<()> {
		let mut conn = self.manager.clone();
		let _: i64 = conn.publish(channel_name(room), payload).await.context("presence publish")?;
		Ok(())
	}

	/// Open a fresh subscription to the room's channel. Each caller gets its own connection: a
	/// Room Subscriber's receive loop owns this connection for its whole lifetime (§4.3).
	pub async fn subscribe(&self, room: &RoomId) -> anyhow::Result<redis::aio::PubSub> {
		let mut pubsub = self.client.get_async_pubsub().await.context("open redis pubsub connection")?;
		pubsub.subscribe(channel_name(room)).await.context("subscribe to room channel")?;
		Ok(pubsub)
	}
}

fn set_key(room: &RoomId) -> String {
	format!("presence:room:{}", room.as_str())
}

fn member_key(room: &RoomId, user_id: &str) -> String {
	format!("presence:room:{}:user:{}", room.as_str(), user_id)
}

/// Channel name a publish/subscribe pair agrees on for a room (§6).
pub fn channel_name(room: &RoomId) -> String {
	format!("chat_room:{}", room.as_str())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn keys_are_namespaced_per_room_and_member() {
		let room = RoomId::new("alpha").unwrap();
		assert_eq!(set_key(&room), "presence:room:alpha");
		assert_eq!(member_key(&room, "u-1"), "presence:room:alpha:user:u-1");
		assert_eq!(channel_name(&room), "chat_room:alpha");
	}
}

#[cfg(test)]
mod proptests {
	use proptest::prelude::*;

	use super::*;

	proptest! {
		/// Two distinct rooms never collide on any of the three derived key names (§6 key naming).
		#[test]
		fn distinct_rooms_never_collide_on_derived_keys(
			a in "[a-zA-Z0-9_-]{1,32}",
			b in "[a-zA-Z0-9_-]{1,32}",
		) {
			prop_assume!(a != b);
			let ra = RoomId::new(a).unwrap();
			let rb = RoomId::new(b).unwrap();

			prop_assert_ne!(set_key(&ra), set_key(&rb));
			prop_assert_ne!(channel_name(&ra), channel_name(&rb));
			prop_assert_ne!(member_key(&ra, "same-user"), member_key(&rb, "same-user"));
		}
	}
}
