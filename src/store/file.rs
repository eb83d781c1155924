//! Simple file-backed [`KeyValueStore`] for processes sharing a local disk.

// std
use std::{
	ffi::OsString,
	fs::{self, File, OpenOptions},
	io::Write,
	path::{Path, PathBuf},
	process,
};
// crates.io
use rand::{Rng, distr::Alphanumeric};
use serde_json::Value;
use tokio::sync::broadcast;
// self
use crate::{
	_prelude::*,
	store::{KeyValueStore, KeyWatch, StoreError, StoreEvent, StoreFuture},
};

const EVENT_CAPACITY: usize = 64;
const TMP_SUFFIX_LEN: usize = 12;

type Snapshot = BTreeMap<String, Value>;

/// Persists values to a JSON object file.
///
/// The file is re-read on every access so writes from other processes are observed. Every
/// read-modify-write holds an advisory lock on a sibling `<file>.lock`, so processes sharing the
/// file serialize their updates; each writer stages into its own temporary file before the atomic
/// rename. Watches only see writes made through this handle (and its clones).
#[derive(Clone, Debug)]
pub struct FileStore {
	path: PathBuf,
	write_lock: Arc<Mutex<()>>,
	events: broadcast::Sender<StoreEvent>,
}
impl FileStore {
	/// Opens (or creates) a store at the provided path.
	pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
		let path = path.into();

		Self::ensure_parent_exists(&path)?;
		// Fail early on a corrupt file.
		Self::load_snapshot(&path)?;

		let (events, _) = broadcast::channel(EVENT_CAPACITY);

		Ok(Self { path, write_lock: Arc::new(Mutex::new(())), events })
	}

	/// Returns the backing file path.
	pub fn path(&self) -> &Path {
		&self.path
	}

	fn sibling(&self, suffix: &str) -> PathBuf {
		let mut name = self.path.file_name().map(OsString::from).unwrap_or_default();

		name.push(suffix);

		self.path.with_file_name(name)
	}

	fn lock_path(&self) -> PathBuf {
		self.sibling(".lock")
	}

	fn tmp_path(&self) -> PathBuf {
		let suffix: String =
			rand::rng().sample_iter(Alphanumeric).take(TMP_SUFFIX_LEN).map(char::from).collect();

		self.sibling(&format!(".{}.{suffix}.tmp", process::id()))
	}

	// Released when the returned handle is dropped.
	fn lock_file(&self) -> Result<File, StoreError> {
		let lock_path = self.lock_path();
		let file = OpenOptions::new()
			.create(true)
			.truncate(false)
			.write(true)
			.open(&lock_path)
			.map_err(|e| StoreError::Backend {
				message: format!("Failed to open {}: {e}", lock_path.display()),
			})?;

		file.lock().map_err(|e| StoreError::Backend {
			message: format!("Failed to lock {}: {e}", lock_path.display()),
		})?;

		Ok(file)
	}

	fn load_snapshot(path: &Path) -> Result<Snapshot, StoreError> {
		if !path.exists() {
			return Ok(Snapshot::new());
		}

		let bytes = fs::read(path).map_err(|e| StoreError::Backend {
			message: format!("Failed to read {}: {e}", path.display()),
		})?;

		if bytes.is_empty() {
			return Ok(Snapshot::new());
		}

		serde_json::from_slice(&bytes).map_err(|e| StoreError::Serialization {
			message: format!("Failed to parse {}: {e}", path.display()),
		})
	}

	fn ensure_parent_exists(path: &Path) -> Result<(), StoreError> {
		if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
			fs::create_dir_all(parent).map_err(|e| StoreError::Backend {
				message: format!("Failed to create store directory {}: {e}", parent.display()),
			})?;
		}

		Ok(())
	}

	fn persist(&self, contents: &Snapshot) -> Result<(), StoreError> {
		let serialized =
			serde_json::to_vec_pretty(contents).map_err(|e| StoreError::Serialization {
				message: format!("Failed to serialize store snapshot: {e}"),
			})?;
		let tmp_path = self.tmp_path();
		let staged = File::create_new(&tmp_path)
			.and_then(|mut file| {
				file.write_all(&serialized)?;
				file.sync_all()
			})
			.and_then(|()| fs::rename(&tmp_path, &self.path));

		staged.map_err(|e| {
			let _ = fs::remove_file(&tmp_path);

			StoreError::Backend {
				message: format!(
					"Failed to replace {} via {}: {e}",
					self.path.display(),
					tmp_path.display()
				),
			}
		})
	}

	fn mutate<F>(&self, key: &str, f: F) -> Result<Option<Value>, StoreError>
	where
		F: FnOnce(&mut Snapshot) -> bool,
	{
		Self::ensure_parent_exists(&self.path)?;

		let _guard = self.write_lock.lock();
		let _file_guard = self.lock_file()?;
		let mut snapshot = Self::load_snapshot(&self.path)?;

		if f(&mut snapshot) {
			self.persist(&snapshot)?;

			let value = snapshot.get(key).cloned();
			let _ = self.events.send(StoreEvent { key: key.to_owned(), value: value.clone() });

			return Ok(value);
		}

		Ok(snapshot.get(key).cloned())
	}
}
impl KeyValueStore for FileStore {
	fn load<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Value>> {
		Box::pin(async move { Ok(Self::load_snapshot(&self.path)?.remove(key)) })
	}

	fn store<'a>(&'a self, key: &'a str, value: Value) -> StoreFuture<'a, Value> {
		Box::pin(async move {
			let stored = value.clone();

			self.mutate(key, move |snapshot| {
				snapshot.insert(key.to_owned(), value);

				true
			})?;

			Ok(stored)
		})
	}

	fn remove<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
		Box::pin(async move {
			self.mutate(key, |snapshot| snapshot.remove(key).is_some())?;

			Ok(())
		})
	}

	fn watch(&self, key: &str) -> KeyWatch {
		KeyWatch::new(key, self.events.subscribe())
	}

	fn keys(&self) -> StoreFuture<'_, Vec<String>> {
		Box::pin(async move { Ok(Self::load_snapshot(&self.path)?.into_keys().collect()) })
	}
}
