//! Thread-safe in-memory [`KeyValueStore`] shared by in-process contexts and tests.

// crates.io
use serde_json::Value;
use tokio::sync::broadcast;
// self
use crate::{
	_prelude::*,
	store::{KeyValueStore, KeyWatch, StoreEvent, StoreFuture},
};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug)]
struct Shared {
	map: RwLock<HashMap<String, Value>>,
	events: broadcast::Sender<StoreEvent>,
}

/// Storage backend that keeps values in-process; clones share the same map and watchers.
#[derive(Clone, Debug)]
pub struct MemoryStore(Arc<Shared>);
impl MemoryStore {
	fn publish(&self, key: &str, value: Option<Value>) {
		// No receivers is fine.
		let _ = self.0.events.send(StoreEvent { key: key.to_owned(), value });
	}
}
impl Default for MemoryStore {
	fn default() -> Self {
		let (events, _) = broadcast::channel(EVENT_CAPACITY);

		Self(Arc::new(Shared { map: RwLock::new(HashMap::new()), events }))
	}
}
impl KeyValueStore for MemoryStore {
	fn load<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Value>> {
		let value = self.0.map.read().get(key).cloned();

		Box::pin(async move { Ok(value) })
	}

	fn store<'a>(&'a self, key: &'a str, value: Value) -> StoreFuture<'a, Value> {
		self.0.map.write().insert(key.to_owned(), value.clone());
		self.publish(key, Some(value.clone()));

		Box::pin(async move { Ok(value) })
	}

	fn remove<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
		if self.0.map.write().remove(key).is_some() {
			self.publish(key, None);
		}

		Box::pin(async { Ok(()) })
	}

	fn watch(&self, key: &str) -> KeyWatch {
		KeyWatch::new(key, self.0.events.subscribe())
	}

	fn keys(&self) -> StoreFuture<'_, Vec<String>> {
		let keys = self.0.map.read().keys().cloned().collect();

		Box::pin(async move { Ok(keys) })
	}
}
