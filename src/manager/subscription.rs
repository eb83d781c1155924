// std
use std::sync::{
	Weak,
	atomic::{AtomicU64, Ordering},
};
// self
use crate::{_prelude::*, auth::AccessTokenInfo};

type Listener = Arc<dyn Fn(Option<&AccessTokenInfo>) + Send + Sync>;

/// Registered access-token listeners.
#[derive(Default)]
pub(crate) struct Listeners {
	next_id: AtomicU64,
	entries: Mutex<BTreeMap<u64, Listener>>,
	last: Mutex<Option<Option<String>>>,
}
impl Listeners {
	pub(crate) fn add(self: &Arc<Self>, listener: Listener) -> Subscription {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);

		self.entries.lock().insert(id, listener);

		Subscription { id, listeners: Arc::downgrade(self) }
	}

	/// Calls one listener with the current value, outside the registry lock.
	pub(crate) fn deliver_to(&self, id: u64, value: Option<&AccessTokenInfo>) {
		let listener = self.entries.lock().get(&id).cloned();

		if let Some(listener) = listener {
			listener(value);
		}
	}

	/// Fans `value` out unless it repeats the last delivered token.
	pub(crate) fn notify(&self, value: Option<&AccessTokenInfo>) {
		let token = value.map(|info| info.token.expose().to_owned());

		{
			let mut last = self.last.lock();

			if last.as_ref() == Some(&token) {
				return;
			}

			*last = Some(token);
		}

		let listeners = self.entries.lock().values().cloned().collect::<Vec<_>>();

		for listener in listeners {
			listener(value);
		}
	}

	fn remove(&self, id: u64) {
		self.entries.lock().remove(&id);
	}
}

/// Handle returned by [`crate::manager::AccessTokenManager::subscribe`].
///
/// Dropping it unsubscribes.
pub struct Subscription {
	id: u64,
	listeners: Weak<Listeners>,
}
impl Subscription {
	pub(crate) fn id(&self) -> u64 {
		self.id
	}

	/// Stops delivery; equivalent to dropping the handle.
	pub fn unsubscribe(self) {
		drop(self);
	}
}
impl Debug for Subscription {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("Subscription").field("id", &self.id).finish()
	}
}
impl Drop for Subscription {
	fn drop(&mut self) {
		if let Some(listeners) = self.listeners.upgrade() {
			listeners.remove(self.id);
		}
	}
}
