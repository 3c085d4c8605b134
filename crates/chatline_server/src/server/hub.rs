#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use chatline_domain::{Principal, RoomId};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::server::presence::PresenceStore;
use crate::server::room_registry::RoomRegistry;
use crate::server::room_subscriber;

/// Opaque handle identifying one Connection inside the Hub's connection-set. Assigned by the Hub
/// on `register`; meaningless outside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
	#[cfg(test)]
	pub fn for_test(raw: u64) -> Self {
		Self(raw)
	}
}

/// A payload ready to fan out to every local Connection in a room (§3 broadcast envelope).
#[derive(Debug, Clone)]
pub struct BroadcastEnvelope {
	pub room_id: RoomId,
	pub payload: String,
}

struct RegisterRequest {
	principal: Principal,
	room_id: RoomId,
	outbound: mpsc::Sender<String>,
	reply: oneshot::Sender<ConnectionId>,
}

struct SwitchRequest {
	id: ConnectionId,
	new_room: RoomId,
	reply: oneshot::Sender<RoomId>,
}

/// Clonable front door to the Hub's three inboxes (plus the room-switch control path), handed to
/// every Connection and Room Subscriber task. Enqueuing here never touches the connection-set or
/// room-subscription-set directly — only the Hub's own task does that (§5).
#[derive(Clone)]
pub struct HubHandle {
	register_tx: mpsc::Sender<RegisterRequest>,
	unregister_tx: mpsc::Sender<ConnectionId>,
	broadcast_tx: mpsc::Sender<BroadcastEnvelope>,
	switch_tx: mpsc::Sender<SwitchRequest>,
}

impl HubHandle {
	/// Register a newly-upgraded Connection; returns the id the Hub assigned it.
	pub async fn register(&self, principal: Principal, room_id: RoomId, outbound: mpsc::Sender<String>) -> ConnectionId {
		let (reply, rx) = oneshot::channel();
		let req = RegisterRequest { principal, room_id, outbound, reply };
		// The Hub task never exits while the process is up; a send failure here would mean the
		// Hub has already shut down, in which case there is nothing left to register with.
		if self.register_tx.send(req).await.is_err() {
			unreachable!("hub task does not exit while the process is running");
		}
		rx.await.expect("hub always replies to register")
	}

	/// Remove a Connection. Idempotent: the Hub is a no-op if `id` is already gone.
	pub async fn unregister(&self, id: ConnectionId) {
		let _ = self.unregister_tx.send(id).await;
	}

	/// Deliver `envelope` to every local Connection bound to its room.
	pub async fn broadcast(&self, envelope: BroadcastEnvelope) {
		let _ = self.broadcast_tx.send(envelope).await;
	}

	/// Request a room switch for `id`. Returns the room the Connection is bound to afterward —
	/// `new_room` on success, the prior room on failure (§4.1).
	pub async fn switch_room(&self, id: ConnectionId, new_room: RoomId) -> RoomId {
		let (reply, rx) = oneshot::channel();
		let req = SwitchRequest { id, new_room, reply };
		if self.switch_tx.send(req).await.is_err() {
			unreachable!("hub task does not exit while the process is running");
		}
		rx.await.expect("hub always replies to switch_room")
	}

	/// A handle backed by inboxes nobody drains, for tests that only exercise call sites which
	/// short-circuit before actually sending (e.g. resolving an empty room id never touches the
	/// handle at all).
	#[cfg(test)]
	pub fn for_test() -> Self {
		let (register_tx, _register_rx) = mpsc::channel(1);
		let (unregister_tx, _unregister_rx) = mpsc::channel(1);
		let (broadcast_tx, _broadcast_rx) = mpsc::channel(1);
		let (switch_tx, _switch_rx) = mpsc::channel(1);
		Self { register_tx, unregister_tx, broadcast_tx, switch_tx }
	}
}

struct ConnectionEntry {
	principal: Principal,
	room_id: RoomId,
	outbound: mpsc::Sender<String>,
}

/// Single-threaded event coordinator owning the connection-set and room-subscription-set for one
/// process instance (§4.1). `run` is the Hub's entire lifetime; every mutation to its two owned
/// sets happens inside that one loop, so no lock is needed over either of them.
pub struct Hub {
	presence: PresenceStore,
	room_registry: RoomRegistry,
	connections: HashMap<ConnectionId, ConnectionEntry>,
	rooms: HashSet<RoomId>,
	next_id: u64,

	register_rx: mpsc::Receiver<RegisterRequest>,
	unregister_rx: mpsc::Receiver<ConnectionId>,
	broadcast_rx: mpsc::Receiver<BroadcastEnvelope>,
	switch_rx: mpsc::Receiver<SwitchRequest>,

	// Kept so `handle` can spawn Room Subscribers with a live sender even after every
	// `HubHandle` clone elsewhere has been dropped (e.g. in tests).
	broadcast_tx: mpsc::Sender<BroadcastEnvelope>,
}

const INBOX_CAPACITY: usize = 1024;

impl Hub {
	pub fn new(presence: PresenceStore, room_registry: RoomRegistry) -> (Self, HubHandle) {
		let (register_tx, register_rx) = mpsc::channel(INBOX_CAPACITY);
		let (unregister_tx, unregister_rx) = mpsc::channel(INBOX_CAPACITY);
		let (broadcast_tx, broadcast_rx) = mpsc::channel(INBOX_CAPACITY);
		let (switch_tx, switch_rx) = mpsc::channel(INBOX_CAPACITY);

		let handle = HubHandle {
			register_tx,
			unregister_tx,
			broadcast_tx: broadcast_tx.clone(),
			switch_tx,
		};

		let hub = Self {
			presence,
			room_registry,
			connections: HashMap::new(),
			rooms: HashSet::new(),
			next_id: 0,
			register_rx,
			unregister_rx,
			broadcast_rx,
			switch_rx,
			broadcast_tx,
		};

		(hub, handle)
	}

	/// Number of local Connections currently bound to `room`. Test/introspection helper; the
	/// externally-visible presence count comes from `PresenceStore::count`, not this.
	#[cfg(test)]
	pub fn local_connection_count(&self, room: &RoomId) -> usize {
		self.connections.values().filter(|e| &e.room_id == room).count()
	}

	/// Run the Hub's event loop. Never returns while any inbox remains open; in practice that
	/// means for the lifetime of the process, since every `HubHandle` clone keeps at least one
	/// sender alive.
	pub async fn run(mut self) {
		loop {
			tokio::select! {
				req = self.register_rx.recv() => {
					let Some(req) = req else { break };
					self.handle_register(req).await;
				}
				id = self.unregister_rx.recv() => {
					let Some(id) = id else { break };
					self.handle_unregister(id).await;
				}
				env = self.broadcast_rx.recv() => {
					let Some(env) = env else { break };
					self.handle_broadcast(env);
				}
				req = self.switch_rx.recv() => {
					let Some(req) = req else { break };
					self.handle_switch(req).await;
				}
			}
		}
	}

	async fn handle_register(&mut self, req: RegisterRequest) {
		let id = ConnectionId(self.next_id);
		self.next_id += 1;

		self.ensure_subscription(&req.room_id);

		if let Err(e) = self.presence.track(&req.room_id, &req.principal.user_id).await {
			warn!(error = %e, room = %req.room_id, user = %req.principal.user_id, "presence track failed on register");
		}

		info!(user = %req.principal.user_id, room = %req.room_id, "connection registered");

		self.connections.insert(
			id,
			ConnectionEntry {
				principal: req.principal,
				room_id: req.room_id,
				outbound: req.outbound,
			},
		);

		let _ = req.reply.send(id);
	}

	async fn handle_unregister(&mut self, id: ConnectionId) {
		let Some(entry) = self.connections.remove(&id) else {
			return;
		};

		// Dropping `entry.outbound` here closes the outbound queue exactly once: `remove`
		// already guarantees this branch runs at most once per id.
		drop(entry.outbound);

		if let Err(e) = self.presence.remove(&entry.room_id, &entry.principal.user_id).await {
			warn!(error = %e, room = %entry.room_id, user = %entry.principal.user_id, "presence remove failed on unregister");
		}

		info!(user = %entry.principal.user_id, room = %entry.room_id, "connection unregistered");
	}

	fn handle_broadcast(&mut self, env: BroadcastEnvelope) {
		let mut evict = Vec::new();

		for (id, entry) in self.connections.iter() {
			if entry.room_id != env.room_id {
				continue;
			}

			match entry.outbound.try_send(env.payload.clone()) {
				Ok(()) => {}
				Err(TrySendError::Full(_)) => {
					warn!(user = %entry.principal.user_id, room = %entry.room_id, "outbound queue full, evicting connection");
					evict.push(*id);
				}
				Err(TrySendError::Closed(_)) => {
					evict.push(*id);
				}
			}
		}

		for id in evict {
			// Eviction-on-backpressure: remove from the set and let the dropped sender close
			// the queue, exactly as an explicit unregister would.
			self.connections.remove(&id);
		}
	}

	async fn handle_switch(&mut self, req: SwitchRequest) {
		let Some(entry) = self.connections.get(&req.id) else {
			let _ = req.reply.send(req.new_room);
			return;
		};

		if entry.room_id == req.new_room {
			let _ = req.reply.send(req.new_room);
			return;
		}

		let old_room = entry.room_id.clone();
		let user_id = entry.principal.user_id.clone();

		if let Err(e) = self.room_registry.ensure(req.new_room.as_str()).await {
			warn!(error = %e, room = %req.new_room, "room switch rejected: registry unavailable");
			let _ = req.reply.send(old_room);
			return;
		}

		if let Err(e) = self.presence.track(&req.new_room, &user_id).await {
			warn!(error = %e, room = %req.new_room, user = %user_id, "presence track failed on room switch");
			let _ = req.reply.send(old_room);
			return;
		}

		if let Err(e) = self.presence.remove(&old_room, &user_id).await {
			warn!(error = %e, room = %old_room, user = %user_id, "presence remove failed on room switch");
		}

		self.ensure_subscription(&req.new_room);

		if let Some(entry) = self.connections.get_mut(&req.id) {
			entry.room_id = req.new_room.clone();
		}

		debug!(user = %user_id, from = %old_room, to = %req.new_room, "connection switched room");
		let _ = req.reply.send(req.new_room);
	}

	/// Spawn a Room Subscriber if this instance has never had a member in `room` before.
	/// Subscriptions are never torn down while the process runs (§3, §9): the set only grows.
	fn ensure_subscription(&mut self, room: &RoomId) {
		if self.rooms.contains(room) {
			return;
		}

		self.rooms.insert(room.clone());
		room_subscriber::spawn(room.clone(), self.presence.clone(), self.broadcast_tx.clone());
	}
}
