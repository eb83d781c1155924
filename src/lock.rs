//! Cross-context mutual exclusion over a [`MessageBus`].
//!
//! A requester broadcasts `sync` with its `(timestamp, origin)` pair and listens for
//! [`LOCK_WAIT`]. Every context that is requesting or holding answers a `sync` with a `lock`
//! carrying its own pair. The smaller pair wins; losers wait for `release` (or
//! [`RELEASE_TIMEOUT`]) and retry with a fresh timestamp.

// std
use std::time::Duration as StdDuration;
// crates.io
use async_lock::MutexGuardArc;
use tokio::{
	sync::broadcast::{self, error::RecvError},
	task::JoinHandle,
	time::{self, Instant},
};
// self
use crate::{
	_prelude::*,
	auth::{ContextId, TokenIdentity},
	bus::{BusReceiver, MessageBus},
	clock::{Clock, SystemClock},
	error::ConfigError,
	obs::{self, FlowKind, FlowSpan},
};

/// How long a requester collects competing replies before taking the lock.
pub const LOCK_WAIT: StdDuration = StdDuration::from_millis(50);
/// How long a losing requester waits for `release` before retrying.
pub const RELEASE_TIMEOUT: StdDuration = StdDuration::from_secs(5);
/// Library namespace used in channel names.
pub const DEFAULT_NAMESPACE: &str = "oauth2-token-broker";

const EVENT_CAPACITY: usize = 64;

/// Message types exchanged on a lock channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockMessageKind {
	/// A context asks for the lock.
	Sync,
	/// A requesting or holding context answers a `sync`.
	Lock,
	/// The holder gave the lock up.
	Release,
	/// A context persisted a token obtained by external renewal.
	ExternalStoring,
}

/// Wire message broadcast on `{namespace}:{identity}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockMessage {
	/// Message type.
	#[serde(rename = "type")]
	pub kind: LockMessageKind,
	/// Sender's context id.
	pub origin_id: ContextId,
	/// Sender's request timestamp in unix milliseconds.
	pub timestamp: i64,
	/// Addressee of a `lock` reply.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub to: Option<ContextId>,
}
impl LockMessage {
	fn pair(&self) -> (i64, &ContextId) {
		(self.timestamp, &self.origin_id)
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LockState {
	Idle,
	Requesting(i64),
	Holding(i64),
}
impl LockState {
	fn timestamp(self) -> Option<i64> {
		match self {
			Self::Idle => None,
			Self::Requesting(ts) | Self::Holding(ts) => Some(ts),
		}
	}
}

struct Shared {
	channel: String,
	origin: ContextId,
	bus: Option<Arc<dyn MessageBus>>,
	state: Mutex<LockState>,
	local: Arc<AsyncMutex<()>>,
	events: broadcast::Sender<LockMessage>,
}
impl Shared {
	fn send(&self, kind: LockMessageKind, timestamp: i64, to: Option<ContextId>) {
		let Some(bus) = &self.bus else {
			return;
		};
		let message = LockMessage { kind, origin_id: self.origin.clone(), timestamp, to };

		match serde_json::to_string(&message) {
			Ok(payload) =>
				if let Err(e) = bus.publish(&self.channel, payload) {
					obs::log_suppressed("lock.publish", &e);
				},
			Err(e) => obs::log_suppressed("lock.encode", &e),
		}
	}

	fn handle_incoming(&self, payload: &str) {
		let message = match serde_json::from_str::<LockMessage>(payload) {
			Ok(message) => message,
			Err(e) => {
				obs::log_event("lock.malformed", &e);

				return;
			},
		};

		if message.origin_id == self.origin {
			return;
		}
		if message.kind == LockMessageKind::Sync {
			let ours = self.state.lock().timestamp();

			if let Some(ts) = ours {
				self.send(LockMessageKind::Lock, ts, Some(message.origin_id.clone()));
			}
		}

		// Nobody listening is fine.
		let _ = self.events.send(message);
	}
}

/// Advisory lock shared by every context that uses the same bus channel.
pub struct CoordinationLock {
	shared: Arc<Shared>,
	responder: Option<JoinHandle<()>>,
}
impl CoordinationLock {
	/// Creates a lock on `{namespace}:{identity}` and starts its bus responder.
	///
	/// Fails with [`ConfigError::BusUnavailable`] when the bus refuses the subscription and with
	/// [`ConfigError::RuntimeUnavailable`] outside a Tokio runtime.
	pub fn new(
		bus: Arc<dyn MessageBus>,
		namespace: &str,
		identity: &TokenIdentity,
		origin: ContextId,
	) -> Result<Self> {
		let channel = format!("{namespace}:{identity}");
		let receiver = bus
			.subscribe(&channel)
			.map_err(|e| ConfigError::BusUnavailable { message: e.to_string() })?;
		let runtime = tokio::runtime::Handle::try_current()
			.map_err(|_| ConfigError::RuntimeUnavailable)?;
		let shared = Arc::new(Shared {
			channel,
			origin,
			bus: Some(bus),
			state: Mutex::new(LockState::Idle),
			local: Arc::new(AsyncMutex::new(())),
			events: broadcast::channel(EVENT_CAPACITY).0,
		});
		let responder = runtime.spawn(respond(shared.clone(), receiver));

		Ok(Self { shared, responder: Some(responder) })
	}

	/// Creates a lock that only serializes callers inside this process.
	pub fn single_context(identity: &TokenIdentity) -> Self {
		let shared = Arc::new(Shared {
			channel: format!("{DEFAULT_NAMESPACE}:{identity}"),
			origin: ContextId::random(),
			bus: None,
			state: Mutex::new(LockState::Idle),
			local: Arc::new(AsyncMutex::new(())),
			events: broadcast::channel(EVENT_CAPACITY).0,
		});

		Self { shared, responder: None }
	}

	/// Channel name used on the bus.
	pub fn channel(&self) -> &str {
		&self.shared.channel
	}

	/// This context's tie-break identifier.
	pub fn origin(&self) -> &ContextId {
		&self.shared.origin
	}

	/// Returns `true` when peers are reachable through a bus.
	pub fn is_shared(&self) -> bool {
		self.shared.bus.is_some()
	}

	/// Waits until this context holds the lock.
	pub async fn acquire(&self) -> LockGuard {
		let span = FlowSpan::new(FlowKind::Lock, "acquire");

		span.instrument(self.acquire_inner()).await
	}

	async fn acquire_inner(&self) -> LockGuard {
		let local = self.shared.local.lock_arc().await;

		if self.shared.bus.is_none() {
			return LockGuard { shared: self.shared.clone(), _local: local, released: false };
		}

		loop {
			let mut events = self.shared.events.subscribe();
			let ts = SystemClock.now_millis();

			*self.shared.state.lock() = LockState::Requesting(ts);
			self.shared.send(LockMessageKind::Sync, ts, None);

			if self.collect_replies(&mut events, ts).await {
				*self.shared.state.lock() = LockState::Holding(ts);

				return LockGuard { shared: self.shared.clone(), _local: local, released: false };
			}

			*self.shared.state.lock() = LockState::Idle;
			obs::log_event("lock.deferred", &self.shared.channel);
			wait_for_release(&mut events).await;
		}
	}

	/// Returns `true` when no competing pair beat `(ts, origin)` within [`LOCK_WAIT`].
	async fn collect_replies(
		&self,
		events: &mut broadcast::Receiver<LockMessage>,
		ts: i64,
	) -> bool {
		let deadline = Instant::now() + LOCK_WAIT;
		let ours = (ts, &self.shared.origin);

		loop {
			let message = match time::timeout_at(deadline, events.recv()).await {
				Ok(Ok(message)) => message,
				Ok(Err(RecvError::Lagged(_))) => continue,
				Ok(Err(RecvError::Closed)) | Err(_) => return true,
			};
			let beats_us = match message.kind {
				LockMessageKind::Lock => message.to.as_ref() == Some(&self.shared.origin),
				LockMessageKind::Sync => true,
				_ => false,
			} && message.pair() < ours;

			if beats_us {
				return false;
			}
		}
	}

	/// Tells peers that a token obtained by external renewal was persisted.
	pub fn broadcast_external_storing(&self) {
		self.shared.send(LockMessageKind::ExternalStoring, SystemClock.now_millis(), None);
	}

	/// Subscribes to the next peer `external-storing` message.
	pub fn external_storing(&self) -> ExternalStoring {
		ExternalStoring(self.shared.bus.as_ref().map(|_| self.shared.events.subscribe()))
	}
}
impl Debug for CoordinationLock {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("CoordinationLock")
			.field("channel", &self.shared.channel)
			.field("origin", &self.shared.origin)
			.field("shared", &self.is_shared())
			.finish()
	}
}
impl Drop for CoordinationLock {
	fn drop(&mut self) {
		if let Some(responder) = self.responder.take() {
			responder.abort();
		}
	}
}

/// Held lock; dropping it (or calling [`LockGuard::release`]) broadcasts `release`.
pub struct LockGuard {
	shared: Arc<Shared>,
	_local: MutexGuardArc<()>,
	released: bool,
}
impl LockGuard {
	/// Releases the lock explicitly.
	pub fn release(mut self) {
		self.release_inner();
	}

	fn release_inner(&mut self) {
		if self.released {
			return;
		}

		self.released = true;

		if self.shared.bus.is_some() {
			let ts = {
				let mut state = self.shared.state.lock();
				let ts = state.timestamp().unwrap_or_default();

				*state = LockState::Idle;

				ts
			};

			self.shared.send(LockMessageKind::Release, ts, None);
		}
	}
}
impl Debug for LockGuard {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("LockGuard").field("channel", &self.shared.channel).finish()
	}
}
impl Drop for LockGuard {
	fn drop(&mut self) {
		self.release_inner();
	}
}

/// Pending notification for the next peer `external-storing` message.
#[derive(Debug)]
pub struct ExternalStoring(Option<broadcast::Receiver<LockMessage>>);
impl ExternalStoring {
	/// Resolves when a peer announces a stored token; never resolves without a bus.
	pub async fn recv(&mut self) {
		let Some(events) = &mut self.0 else {
			return std::future::pending().await;
		};

		loop {
			match events.recv().await {
				Ok(message) if message.kind == LockMessageKind::ExternalStoring => return,
				Ok(_) | Err(RecvError::Lagged(_)) => continue,
				Err(RecvError::Closed) => return std::future::pending().await,
			}
		}
	}
}

async fn respond(shared: Arc<Shared>, mut receiver: BusReceiver) {
	while let Some(payload) = receiver.recv().await {
		shared.handle_incoming(&payload);
	}

	obs::log_event("lock.bus_closed", &shared.channel);
}

async fn wait_for_release(events: &mut broadcast::Receiver<LockMessage>) {
	let wait = async {
		loop {
			match events.recv().await {
				Ok(message) if message.kind == LockMessageKind::Release => return,
				Ok(_) | Err(RecvError::Lagged(_)) => continue,
				Err(RecvError::Closed) => return,
			}
		}
	};

	if time::timeout(RELEASE_TIMEOUT, wait).await.is_err() {
		obs::log_event("lock.release_timeout", &RELEASE_TIMEOUT.as_millis());
	}
}
