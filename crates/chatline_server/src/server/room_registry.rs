#![forbid(unsafe_code)]

use anyhow::Context;

use crate::server::message_store::SqlPool;

/// Idempotent room creation (§4.7). Shares the message store's pool rather than opening a second
/// connection to the same database.
#[derive(Clone)]
pub struct RoomRegistry {
	pool: SqlPool,
}

impl RoomRegistry {
	pub fn new(pool: SqlPool) -> Self {
		Self { pool }
	}

	/// Idempotent create: a second call for the same `room_id` leaves the registry in the same
	/// state as the first (§8 idempotence law).
	pub async fn ensure(&self, room_id: &str) -> anyhow::Result<()> {
		match &self.pool {
			SqlPool::Sqlite(pool) => {
				sqlx::query("INSERT OR IGNORE INTO chat_rooms (room_id) VALUES (?)")
					.bind(room_id)
					.execute(pool)
					.await
					.context("ensure chat_rooms (sqlite)")?;
			}
			SqlPool::Postgres(pool) => {
				sqlx::query("INSERT INTO chat_rooms (room_id) VALUES ($1) ON CONFLICT (room_id) DO NOTHING")
					.bind(room_id)
					.execute(pool)
					.await
					.context("ensure chat_rooms (postgres)")?;
			}
			SqlPool::Mysql(pool) => {
				sqlx::query("INSERT IGNORE INTO chat_rooms (room_id) VALUES (?)")
					.bind(room_id)
					.execute(pool)
					.await
					.context("ensure chat_rooms (mysql)")?;
			}
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::server::message_store::connect;

	#[tokio::test]
	async fn ensure_is_idempotent() {
		let pool = connect("sqlite::memory:").await.unwrap();
		let registry = RoomRegistry::new(pool.clone());

		registry.ensure("alpha").await.unwrap();
		registry.ensure("alpha").await.unwrap();

		let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM chat_rooms WHERE room_id = ?")
			.bind("alpha")
			.fetch_one(match &pool {
				SqlPool::Sqlite(p) => p,
				_ => unreachable!(),
			})
			.await
			.unwrap();
		assert_eq!(count.0, 1);
	}
}
