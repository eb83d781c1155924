//! Named pub/sub bus shared by execution contexts.
//!
//! The bus is a best-effort hint channel: messages may be delayed, and every consumer
//! re-reads the store instead of trusting payloads.

// crates.io
use tokio::sync::{
	broadcast::{self, error::RecvError},
	mpsc,
};
// self
use crate::_prelude::*;

const CHANNEL_CAPACITY: usize = 256;

/// Errors surfaced by [`MessageBus`] implementations.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum BusError {
	/// The hosting environment cannot provide the bus.
	#[error("Message bus is unsupported: {message}.")]
	Unsupported {
		/// Implementation-specific reason.
		message: String,
	},
	/// Publishing failed.
	#[error("Failed to publish on {channel}: {message}.")]
	Publish {
		/// Channel name.
		channel: String,
		/// Implementation-specific reason.
		message: String,
	},
}

/// Broadcast bus used by [`CoordinationLock`](crate::lock::CoordinationLock).
///
/// Implementations deliver every published payload to every other subscriber of the same
/// channel, including subscribers owned by the publishing process.
pub trait MessageBus
where
	Self: 'static + Send + Sync,
{
	/// Publishes `payload` on `channel`.
	fn publish(&self, channel: &str, payload: String) -> Result<(), BusError>;

	/// Opens a subscription on `channel`.
	fn subscribe(&self, channel: &str) -> Result<BusReceiver, BusError>;
}

enum ReceiverKind {
	Broadcast(broadcast::Receiver<String>),
	Queue(mpsc::UnboundedReceiver<String>),
}

/// Subscription handle returned by [`MessageBus::subscribe`].
pub struct BusReceiver(ReceiverKind);
impl BusReceiver {
	/// Wraps a Tokio broadcast receiver.
	pub fn from_broadcast(receiver: broadcast::Receiver<String>) -> Self {
		Self(ReceiverKind::Broadcast(receiver))
	}

	/// Wraps an unbounded queue, for host buses that forward messages from another transport.
	pub fn from_queue(receiver: mpsc::UnboundedReceiver<String>) -> Self {
		Self(ReceiverKind::Queue(receiver))
	}

	/// Waits for the next payload; `None` once the bus side is closed.
	pub async fn recv(&mut self) -> Option<String> {
		match &mut self.0 {
			ReceiverKind::Broadcast(receiver) => loop {
				match receiver.recv().await {
					Ok(payload) => return Some(payload),
					Err(RecvError::Lagged(skipped)) => {
						crate::obs::log_event("bus.lagged", &skipped);
					},
					Err(RecvError::Closed) => return None,
				}
			},
			ReceiverKind::Queue(receiver) => receiver.recv().await,
		}
	}
}
impl Debug for BusReceiver {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str("BusReceiver(..)")
	}
}

/// In-process bus backed by one Tokio broadcast channel per name.
///
/// Clones share channels, so contexts running as tasks in one process coordinate through it.
#[derive(Clone, Debug, Default)]
pub struct LocalBus(Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>);
impl LocalBus {
	fn sender(&self, channel: &str) -> broadcast::Sender<String> {
		self.0
			.lock()
			.entry(channel.to_owned())
			.or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
			.clone()
	}
}
impl MessageBus for LocalBus {
	fn publish(&self, channel: &str, payload: String) -> Result<(), BusError> {
		// Publishing with no subscribers is not an error.
		let _ = self.sender(channel).send(payload);

		Ok(())
	}

	fn subscribe(&self, channel: &str) -> Result<BusReceiver, BusError> {
		Ok(BusReceiver::from_broadcast(self.sender(channel).subscribe()))
	}
}
