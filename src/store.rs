//! Key-value storage contract shared by every execution context, plus built-in backends.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

// crates.io
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
// self
use crate::{_prelude::*, auth::TokenIdentity};

/// Boxed future returned by [`KeyValueStore`] operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + 'a + Send>>;

/// Persistent key-value contract consumed by the manager and the state store.
///
/// The store is the single source of truth shared by all contexts; values are plain JSON so
/// different builds of the broker can read each other's records.
pub trait KeyValueStore
where
	Self: 'static + Send + Sync,
{
	/// Loads the value stored under `key`.
	fn load<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Value>>;

	/// Stores `value` under `key`, returning the stored value.
	fn store<'a>(&'a self, key: &'a str, value: Value) -> StoreFuture<'a, Value>;

	/// Removes `key`; missing keys are not an error.
	fn remove<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()>;

	/// Subscribes to changes of `key`.
	fn watch(&self, key: &str) -> KeyWatch;

	/// Lists every key currently stored.
	fn keys(&self) -> StoreFuture<'_, Vec<String>>;
}

/// Error type produced by [`KeyValueStore`] implementations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ThisError)]
pub enum StoreError {
	/// Serialization failures surfaced by the backend or record codec.
	#[error("Serialization error: {message}.")]
	Serialization {
		/// Human-readable error payload.
		message: String,
	},
	/// Backend-level failure for the storage engine.
	#[error("Backend failure: {message}.")]
	Backend {
		/// Human-readable error payload.
		message: String,
	},
	/// None of the candidate backends answered a `keys()` check.
	#[error("No storage backend is available.")]
	NoBackendAvailable,
}

/// Well-known keys written by the broker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreKey<'a> {
	/// Cached access token of an identity.
	AccessToken(&'a TokenIdentity),
	/// Refresh token of an identity.
	RefreshToken(&'a TokenIdentity),
	/// In-flight authorization state record.
	State(&'a str),
}
impl Display for StoreKey<'_> {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		match self {
			Self::AccessToken(identity) => write!(f, "access-token/{identity}"),
			Self::RefreshToken(identity) => write!(f, "refresh-token/{identity}"),
			Self::State(id) => write!(f, "state/{id}"),
		}
	}
}

/// Change notification emitted by a backend.
#[derive(Clone, Debug, PartialEq)]
pub struct StoreEvent {
	/// Full key that changed.
	pub key: String,
	/// New value, or `None` after removal.
	pub value: Option<Value>,
}

/// Stream of changes for a single key.
#[derive(Debug)]
pub struct KeyWatch {
	key: String,
	receiver: broadcast::Receiver<StoreEvent>,
}
impl KeyWatch {
	/// Wraps a backend event receiver, filtering on `key`.
	pub fn new(key: impl Into<String>, receiver: broadcast::Receiver<StoreEvent>) -> Self {
		Self { key: key.into(), receiver }
	}

	/// Waits for the next change of the watched key.
	///
	/// Returns `None` once the backend is gone. Lagged receivers skip ahead to the newest events.
	pub async fn changed(&mut self) -> Option<Option<Value>> {
		loop {
			match self.receiver.recv().await {
				Ok(event) if event.key == self.key => return Some(event.value),
				Ok(_) | Err(RecvError::Lagged(_)) => continue,
				Err(RecvError::Closed) => return None,
			}
		}
	}
}

/// Prefixes every key with `"{name}@v{version}/"` so several logical stores share one backend.
#[derive(Clone, Debug)]
pub struct Namespaced<S> {
	inner: S,
	prefix: String,
}
impl<S> Namespaced<S>
where
	S: KeyValueStore,
{
	/// Wraps `inner` with the namespace `name` at `version`.
	pub fn new(inner: S, name: &str, version: u32) -> Self {
		Self { inner, prefix: format!("{name}@v{version}/") }
	}

	/// Returns the key prefix in use.
	pub fn prefix(&self) -> &str {
		&self.prefix
	}

	fn scoped(&self, key: &str) -> String {
		format!("{}{key}", self.prefix)
	}
}
impl<S> KeyValueStore for Namespaced<S>
where
	S: KeyValueStore,
{
	fn load<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Value>> {
		Box::pin(async move {
			let key = self.scoped(key);

			self.inner.load(&key).await
		})
	}

	fn store<'a>(&'a self, key: &'a str, value: Value) -> StoreFuture<'a, Value> {
		Box::pin(async move {
			let key = self.scoped(key);

			self.inner.store(&key, value).await
		})
	}

	fn remove<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
		Box::pin(async move {
			let key = self.scoped(key);

			self.inner.remove(&key).await
		})
	}

	fn watch(&self, key: &str) -> KeyWatch {
		self.inner.watch(&self.scoped(key))
	}

	fn keys(&self) -> StoreFuture<'_, Vec<String>> {
		Box::pin(async move {
			let keys = self.inner.keys().await?;

			Ok(keys
				.into_iter()
				.filter_map(|key| key.strip_prefix(&self.prefix).map(ToOwned::to_owned))
				.collect())
		})
	}
}

/// Returns the first candidate whose `keys()` check succeeds, in the given order.
pub async fn select(
	candidates: Vec<Arc<dyn KeyValueStore>>,
) -> Result<Arc<dyn KeyValueStore>, StoreError> {
	for candidate in candidates {
		match candidate.keys().await {
			Ok(_) => return Ok(candidate),
			Err(e) => crate::obs::log_suppressed("store.select", &e),
		}
	}

	Err(StoreError::NoBackendAvailable)
}

/// Loads and decodes a typed record.
pub(crate) async fn load_record<T>(
	store: &dyn KeyValueStore,
	key: &str,
) -> Result<Option<T>, StoreError>
where
	T: DeserializeOwned,
{
	let Some(value) = store.load(key).await? else {
		return Ok(None);
	};

	serde_json::from_value(value).map(Some).map_err(|e| StoreError::Serialization {
		message: format!("Failed to decode record at {key}: {e}"),
	})
}

/// Encodes and stores a typed record.
pub(crate) async fn store_record<T>(
	store: &dyn KeyValueStore,
	key: &str,
	record: &T,
) -> Result<(), StoreError>
where
	T: Serialize,
{
	let value = serde_json::to_value(record).map_err(|e| StoreError::Serialization {
		message: format!("Failed to encode record at {key}: {e}"),
	})?;

	store.store(key, value).await?;

	Ok(())
}
