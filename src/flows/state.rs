//! TTL-bounded authorization state records kept in the shared store.

// crates.io
use serde::de::DeserializeOwned;
// self
use crate::{
	_prelude::*,
	clock::Clock,
	error::StateError,
	obs,
	store::{self, KeyValueStore, StoreKey},
};

const STATE_PREFIX: &str = "state/";

/// In-flight authorization request persisted between redirect and callback.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateRecord<T> {
	/// Instant after which the record is rejected.
	pub expires_at: OffsetDateTime,
	/// PKCE verifier, when PKCE was enabled.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub code_verifier: Option<String>,
	/// Caller-supplied application state.
	pub data: T,
}
impl<T> StateRecord<T> {
	/// Returns `true` once `instant` has reached `expires_at`.
	pub fn is_expired_at(&self, instant: OffsetDateTime) -> bool {
		self.expires_at <= instant
	}
}

/// Ephemeral state records on top of a [`KeyValueStore`].
#[derive(Clone)]
pub struct StateStore {
	store: Arc<dyn KeyValueStore>,
	clock: Arc<dyn Clock>,
}
impl StateStore {
	/// Opens the store and deletes every record that has already expired.
	pub async fn open(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Result<Self> {
		let this = Self { store, clock };

		this.sweep().await?;

		Ok(this)
	}

	/// Persists `record` under `state`.
	pub async fn put<T>(&self, state: &str, record: &StateRecord<T>) -> Result<()>
	where
		T: Serialize,
	{
		let key = StoreKey::State(state).to_string();

		store::store_record(self.store.as_ref(), &key, record).await?;

		Ok(())
	}

	/// Reads and deletes the record for `state`.
	///
	/// Expired records are deleted too and reported as [`StateError::Expired`].
	pub async fn take<T>(&self, state: &str) -> Result<StateRecord<T>>
	where
		T: DeserializeOwned,
	{
		let key = StoreKey::State(state).to_string();
		let record = store::load_record::<StateRecord<T>>(self.store.as_ref(), &key)
			.await?
			.ok_or(StateError::NotFound)?;

		self.store.remove(&key).await?;

		if record.is_expired_at(self.clock.now()) {
			return Err(StateError::Expired.into());
		}

		Ok(record)
	}

	/// Deletes expired records; returns how many were removed.
	pub async fn sweep(&self) -> Result<usize> {
		let now = self.clock.now();
		let mut removed = 0;

		for key in self.store.keys().await? {
			if !key.starts_with(STATE_PREFIX) {
				continue;
			}

			let Some(value) = self.store.load(&key).await? else {
				continue;
			};
			let expired = match serde_json::from_value::<StateRecord<serde_json::Value>>(value) {
				Ok(record) => record.is_expired_at(now),
				Err(e) => {
					obs::log_suppressed("state.sweep.decode", &e);

					true
				},
			};

			if expired {
				self.store.remove(&key).await?;

				removed += 1;
			}
		}

		if removed > 0 {
			obs::log_event("state.sweep", &removed);
		}

		Ok(removed)
	}

	pub(crate) fn now(&self) -> OffsetDateTime {
		self.clock.now()
	}
}
impl Debug for StateStore {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str("StateStore(..)")
	}
}
