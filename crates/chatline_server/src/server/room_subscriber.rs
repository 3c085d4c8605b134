#![forbid(unsafe_code)]

use chatline_domain::RoomId;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::server::hub::BroadcastEnvelope;
use crate::server::presence::PresenceStore;

/// Spawn the Room Subscriber task for `room` (§4.3). Created lazily by the Hub on first local
/// membership; on receive error it logs and exits without removing `room` from the Hub's
/// room-subscription-set — re-subscription happens the next time a local member registers into
/// this room, which is acceptable best-effort recovery (§7 BusError).
pub fn spawn(room: RoomId, presence: PresenceStore, broadcast_tx: mpsc::Sender<BroadcastEnvelope>) {
	tokio::spawn(async move {
		let mut pubsub = match presence.subscribe(&room).await {
			Ok(p) => p,
			Err(e) => {
				warn!(error = %e, room = %room, "room subscriber failed to open pub/sub connection");
				return;
			}
		};

		info!(room = %room, "room subscriber started");
		let mut stream = pubsub.on_message();

		loop {
			let Some(msg) = stream.next().await else {
				warn!(room = %room, "room subscriber: pub/sub stream ended");
				break;
			};

			let payload: String = match msg.get_payload() {
				Ok(p) => p,
				Err(e) => {
					warn!(error = %e, room = %room, "room subscriber: malformed pub/sub payload");
					continue;
				}
			};

			let envelope = BroadcastEnvelope { room_id: room.clone(), payload };
			if broadcast_tx.send(envelope).await.is_err() {
				warn!(room = %room, "room subscriber: hub broadcast inbox closed");
				break;
			}
		}
	});
}
