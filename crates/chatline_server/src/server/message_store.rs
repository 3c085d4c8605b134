#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use chatline_domain::ChatMessage;

/// Multi-backend SQL pool, dispatched on the `database_url` scheme. Grounded on the teacher's
/// audit-log connection pattern: one pool type per backend, selected once at startup.
#[derive(Clone)]
pub enum SqlPool {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
	Mysql(sqlx::MySqlPool),
}

pub async fn connect(database_url: &str) -> anyhow::Result<SqlPool> {
	if database_url.starts_with("sqlite:") {
		let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
		sqlx::migrate!("migrations/sqlite").run(&pool).await.context("run sqlite migrations")?;
		Ok(SqlPool::Sqlite(pool))
	} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
		let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
		sqlx::migrate!("migrations/postgres").run(&pool).await.context("run postgres migrations")?;
		Ok(SqlPool::Postgres(pool))
	} else if database_url.starts_with("mysql:") || database_url.starts_with("mariadb:") {
		let pool = sqlx::MySqlPool::connect(database_url).await.context("connect mysql")?;
		sqlx::migrate!("migrations/mysql").run(&pool).await.context("run mysql migrations")?;
		Ok(SqlPool::Mysql(pool))
	} else {
		Err(anyhow!("unsupported database_url for message store: {database_url}"))
	}
}

/// The message store ambient collaborator (§4.6): `insert` persists every accepted frame,
/// `query` serves `GET /chat/history/{roomID}` newest-first, capped by the caller's `limit`.
#[derive(Clone)]
pub struct MessageStore {
	pool: SqlPool,
}

impl MessageStore {
	pub fn new(pool: SqlPool) -> Self {
		Self { pool }
	}

	pub async fn insert(&self, msg: &ChatMessage) -> anyhow::Result<()> {
		match &self.pool {
			SqlPool::Sqlite(pool) => {
				sqlx::query("INSERT INTO chat_messages (room_id, user_id, content, created_at) VALUES (?, ?, ?, ?)")
					.bind(&msg.room_id)
					.bind(&msg.user_id)
					.bind(&msg.content)
					.bind(&msg.timestamp)
					.execute(pool)
					.await
					.context("insert chat_messages (sqlite)")?;
			}
			SqlPool::Postgres(pool) => {
				sqlx::query("INSERT INTO chat_messages (room_id, user_id, content, created_at) VALUES ($1, $2, $3, $4)")
					.bind(&msg.room_id)
					.bind(&msg.user_id)
					.bind(&msg.content)
					.bind(&msg.timestamp)
					.execute(pool)
					.await
					.context("insert chat_messages (postgres)")?;
			}
			SqlPool::Mysql(pool) => {
				sqlx::query("INSERT INTO chat_messages (room_id, user_id, content, created_at) VALUES (?, ?, ?, ?)")
					.bind(&msg.room_id)
					.bind(&msg.user_id)
					.bind(&msg.content)
					.bind(&msg.timestamp)
					.execute(pool)
					.await
					.context("insert chat_messages (mysql)")?;
			}
		}

		Ok(())
	}

	/// Newest-first list for `room_id`, capped at `limit`.
	pub async fn query(&self, room_id: &str, limit: i64) -> anyhow::Result<Vec<ChatMessage>> {
		let rows: Vec<(String, String, String, String)> = match &self.pool {
			SqlPool::Sqlite(pool) => sqlx::query_as(
				"SELECT room_id, user_id, content, created_at FROM chat_messages \
				 WHERE room_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
			)
			.bind(room_id)
			.bind(limit)
			.fetch_all(pool)
			.await
			.context("query chat_messages (sqlite)")?,
			SqlPool::Postgres(pool) => sqlx::query_as(
				"SELECT room_id, user_id, content, created_at FROM chat_messages \
				 WHERE room_id = $1 ORDER BY created_at DESC, id DESC LIMIT $2",
			)
			.bind(room_id)
			.bind(limit)
			.fetch_all(pool)
			.await
			.context("query chat_messages (postgres)")?,
			SqlPool::Mysql(pool) => sqlx::query_as(
				"SELECT room_id, user_id, content, created_at FROM chat_messages \
				 WHERE room_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
			)
			.bind(room_id)
			.bind(limit)
			.fetch_all(pool)
			.await
			.context("query chat_messages (mysql)")?,
		};

		Ok(rows
			.into_iter()
			.map(|(room_id, user_id, content, timestamp)| ChatMessage { room_id, user_id, content, timestamp })
			.collect())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	async fn memory_store() -> MessageStore {
		let pool = connect("sqlite::memory:").await.unwrap();
		MessageStore::new(pool)
	}

	#[tokio::test]
	async fn query_returns_newest_first_capped_at_limit() {
		let store = memory_store().await;

		for (i, ts) in ["2026-01-01T00:00:00Z", "2026-01-01T00:00:01Z", "2026-01-01T00:00:02Z"].into_iter().enumerate() {
			let msg = ChatMessage { room_id: "alpha".to_string(), user_id: format!("u-{i}"), content: format!("msg-{i}"), timestamp: ts.to_string() };
			store.insert(&msg).await.unwrap();
		}

		let rows = store.query("alpha", 2).await.unwrap();
		assert_eq!(rows.len(), 2);
		assert_eq!(rows[0].content, "msg-2");
		assert_eq!(rows[1].content, "msg-1");
	}

	#[tokio::test]
	async fn query_only_returns_messages_for_the_requested_room() {
		let store = memory_store().await;

		store
			.insert(&ChatMessage { room_id: "alpha".to_string(), user_id: "u-1".to_string(), content: "a".to_string(), timestamp: "2026-01-01T00:00:00Z".to_string() })
			.await
			.unwrap();
		store
			.insert(&ChatMessage { room_id: "beta".to_string(), user_id: "u-2".to_string(), content: "b".to_string(), timestamp: "2026-01-01T00:00:01Z".to_string() })
			.await
			.unwrap();

		let rows = store.query("beta", 50).await.unwrap();
		assert_eq!(rows.len(), 1);
		assert_eq!(rows[0].content, "b");
	}
}
