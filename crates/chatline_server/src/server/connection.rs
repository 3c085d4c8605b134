#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use chatline_domain::{ChatMessage, Principal, RoomId};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::server::hub::HubHandle;
use crate::server::message_store::MessageStore;
use crate::server::presence::PresenceStore;

/// Timing constants and the outbound queue capacity a Connection pair is built with (§6).
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub write_wait: Duration,
	pub pong_wait: Duration,
	pub ping_period: Duration,
	pub outbound_queue_capacity: usize,
	pub command_rate_limit_per_conn_burst: u32,
	pub command_rate_limit_per_conn_per_minute: u32,
}

/// Token bucket guarding how many frames a single Connection may push through the read pump.
/// Zero burst or zero refill rate disables the limiter entirely (§4.10 rate limit).
#[derive(Debug, Clone)]
struct TokenBucket {
	capacity: f64,
	tokens: f64,
	refill_per_sec: f64,
	last: Instant,
}

impl TokenBucket {
	fn new(burst: u32, per_minute: u32) -> Option<Self> {
		if burst == 0 || per_minute == 0 {
			return None;
		}
		Some(Self { capacity: burst as f64, tokens: burst as f64, refill_per_sec: per_minute as f64 / 60.0, last: Instant::now() })
	}

	fn allow(&mut self) -> bool {
		let now = Instant::now();
		let elapsed = now.duration_since(self.last).as_secs_f64();
		if elapsed > 0.0 {
			self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
			self.last = now;
		}
		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			true
		} else {
			false
		}
	}
}

/// Client → server wire shape (§6): `user_id` is ignored on ingress and `timestamp` is always
/// server-assigned, so neither is accepted here — only what the client actually sends.
#[derive(Debug, Deserialize)]
struct IncomingFrame {
	room_id: String,
	content: String,
}

/// Drive one upgraded WebSocket to completion: register with the Hub, run the read and write
/// pumps concurrently, unregister on exit (§4.2). Returns once both pumps have stopped.
pub async fn handle_connection(
	socket: WebSocket,
	principal: Principal,
	room_id: RoomId,
	settings: ConnectionSettings,
	hub: HubHandle,
	message_store: MessageStore,
	presence: PresenceStore,
) {
	let (sink, stream) = socket.split();
	let (outbound_tx, outbound_rx) = mpsc::channel::<String>(settings.outbound_queue_capacity);

	let conn_id = hub.register(principal.clone(), room_id.clone(), outbound_tx).await;

	let write_task = tokio::spawn(run_write_pump(sink, outbound_rx, settings.clone()));

	run_read_pump(stream, principal, room_id, conn_id, settings, hub.clone(), message_store, presence).await;

	hub.unregister(conn_id).await;
	let _ = write_task.await;
}

/// Write pump (§4.2): a periodic ping ticker raced against outbound-queue receives. The Hub is
/// the sole closer of the outbound queue; observing that close is this pump's only exit signal
/// besides a transport write error.
async fn run_write_pump(
	mut sink: futures::stream::SplitSink<WebSocket, Message>,
	mut outbound_rx: mpsc::Receiver<String>,
	settings: ConnectionSettings,
) {
	let mut ticker = tokio::time::interval(settings.ping_period);
	ticker.tick().await; // first tick fires immediately; consume it so the real period starts clean

	loop {
		tokio::select! {
			payload = outbound_rx.recv() => {
				match payload {
					Some(payload) => {
						let sent = tokio::time::timeout(settings.write_wait, sink.send(Message::Text(payload.into()))).await;
						match sent {
							Ok(Ok(())) => {}
							_ => break,
						}
					}
					None => {
						let _ = tokio::time::timeout(settings.write_wait, sink.send(Message::Close(None))).await;
						break;
					}
				}
			}
			_ = ticker.tick() => {
				let sent = tokio::time::timeout(settings.write_wait, sink.send(Message::Ping(Vec::new().into()))).await;
				if !matches!(sent, Ok(Ok(()))) {
					break;
				}
			}
		}
	}

	let _ = sink.close().await;
}

/// Read pump (§4.2): blocks on transport read bounded by `pong_wait`; every received frame
/// (including pong hooks the transport surfaces) resets that bound because the loop re-arms the
/// timeout fresh on every iteration.
async fn run_read_pump(
	mut stream: futures::stream::SplitStream<WebSocket>,
	principal: Principal,
	initial_room: RoomId,
	conn_id: crate::server::hub::ConnectionId,
	settings: ConnectionSettings,
	hub: HubHandle,
	message_store: MessageStore,
	presence: PresenceStore,
) {
	let mut current_room = initial_room;
	let mut rate_limiter = TokenBucket::new(settings.command_rate_limit_per_conn_burst, settings.command_rate_limit_per_conn_per_minute);

	loop {
		let next = tokio::time::timeout(settings.pong_wait, stream.next()).await;
		let message = match next {
			Ok(Some(Ok(m))) => m,
			Ok(Some(Err(e))) => {
				debug!(error = %e, user = %principal.user_id, "read pump: transport error");
				break;
			}
			Ok(None) => break,
			Err(_) => {
				debug!(user = %principal.user_id, "read pump: no frame within pong_wait, tearing down");
				break;
			}
		};

		// Every received frame is a heartbeat: refresh presence here rather than only on
		// register/room-switch, so a long-lived idle-but-connected client's TTL key doesn't
		// expire under it between pings (§3, §4.4 refresh).
		if let Err(e) = presence.refresh(&current_room, &principal.user_id).await {
			warn!(error = %e, room = %current_room, user = %principal.user_id, "read pump: presence refresh failed");
		}

		let text = match message {
			Message::Text(t) => t,
			Message::Close(_) => break,
			// Ping/Pong/Binary: no payload to process, but receiving any frame already reset
			// the read deadline for the next loop iteration (§4.2 item 5).
			_ => continue,
		};

		if !rate_limiter.as_mut().map(TokenBucket::allow).unwrap_or(true) {
			metrics::counter!("chatline_server_commands_rate_limited_total").increment(1);
			debug!(user = %principal.user_id, "read pump: frame dropped, rate limited");
			continue;
		}

		let incoming: IncomingFrame = match serde_json::from_str(text.as_str()) {
			Ok(m) => m,
			Err(e) => {
				debug!(error = %e, user = %principal.user_id, "read pump: malformed frame, dropping");
				continue;
			}
		};

		current_room = resolve_target_room(&hub, conn_id, &current_room, &incoming.room_id).await;

		let stamped = ChatMessage::stamped(current_room.as_str(), principal.user_id.clone(), incoming.content, Utc::now().into());

		if let Err(e) = message_store.insert(&stamped).await {
			warn!(error = %e, room = %current_room, "read pump: message store insert failed, dropping frame");
			continue;
		}

		let encoded = match serde_json::to_string(&stamped) {
			Ok(s) => s,
			Err(e) => {
				warn!(error = %e, room = %current_room, "read pump: failed to re-encode stamped message");
				continue;
			}
		};

		if let Err(e) = presence.publish(&current_room, &encoded).await {
			warn!(error = %e, room = %current_room, "read pump: publish to pub/sub failed, dropping frame");
		}
	}
}

/// Room-switch resolution for a single incoming frame (§4.1). An empty or unparseable room id on
/// the frame is treated as "stay put", not as a switch attempt.
async fn resolve_target_room(
	hub: &HubHandle,
	conn_id: crate::server::hub::ConnectionId,
	current_room: &RoomId,
	requested_room_id: &str,
) -> RoomId {
	let requested = match RoomId::new(requested_room_id) {
		Ok(r) => r,
		Err(_) => return current_room.clone(),
	};

	if &requested == current_room {
		return current_room.clone();
	}

	hub.switch_room(conn_id, requested).await
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn resolve_target_room_keeps_current_on_empty_room_id() {
		// A direct unit test of the pure resolution helper does not need a live Hub: the
		// "stay put" branch returns before touching the handle.
		let hub = HubHandle::for_test();
		let current = RoomId::new("alpha").unwrap();
		let resolved = resolve_target_room(&hub, crate::server::hub::ConnectionId::for_test(0), &current, "").await;
		assert_eq!(resolved, current);
	}

	#[tokio::test]
	async fn resolve_target_room_keeps_current_when_requested_room_matches() {
		let hub = HubHandle::for_test();
		let current = RoomId::new("alpha").unwrap();
		let resolved = resolve_target_room(&hub, crate::server::hub::ConnectionId::for_test(0), &current, "alpha").await;
		assert_eq!(resolved, current);
	}

	#[test]
	fn incoming_frame_decodes_without_user_id_or_timestamp() {
		// The real ingress shape (§6): the client sends only room_id and content, never the
		// server-assigned fields.
		let frame: IncomingFrame = serde_json::from_str(r#"{"room_id":"alpha","content":"hi"}"#).unwrap();
		assert_eq!(frame.room_id, "alpha");
		assert_eq!(frame.content, "hi");
	}
}
