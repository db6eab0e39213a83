//! Persistent key-value stores for compiled artifacts and search choices.
//!
//! Each table is one sled tree whose name carries [`CACHE_VERSION`], so a
//! format change starts from an empty table instead of misreading old entries.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use kiln_schedule::{ChoiceStore, SearchChoice};
use parking_lot::Mutex;
use snafu::{OptionExt, ResultExt};
use tracing::{debug, warn};

use crate::config::RuntimeConfig;
use crate::error::{NoCacheDirSnafu, Result, StoreSnafu};

pub const CACHE_VERSION: u32 = 1;

/// Compiled artifacts keyed by compiler and source hash.
pub const COMPILE_TABLE: &str = "compile";
/// Search choices keyed by kernel identity.
pub const KOPT_TABLE: &str = "kopt";

pub trait KeyValueStore: Send + Sync {
    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put(&self, table: &str, key: &[u8], value: &[u8]) -> Result<()>;
}

pub struct SledStore {
    db: sled::Db,
    path: PathBuf,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let db = sled::open(&path).context(StoreSnafu { path: path.display().to_string() })?;
        debug!(path = %path.display(), "opened cache store");
        Ok(Self { db, path })
    }

    /// `cache_dir/kiln.db`, with `cache_dir` defaulting to the user cache directory.
    pub fn open_default(config: &RuntimeConfig) -> Result<Self> {
        let root = match &config.cache_dir {
            Some(dir) => dir.clone(),
            None => dirs::cache_dir().context(NoCacheDirSnafu)?.join("kiln"),
        };
        Self::open(root.join("kiln.db"))
    }

    fn tree(&self, table: &str) -> Result<sled::Tree> {
        self.db
            .open_tree(format!("{table}_{CACHE_VERSION}"))
            .context(StoreSnafu { path: self.path.display().to_string() })
    }
}

impl KeyValueStore for SledStore {
    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let value = self.tree(table)?.get(key).context(StoreSnafu { path: self.path.display().to_string() })?;
        Ok(value.map(|v| v.to_vec()))
    }

    fn put(&self, table: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.tree(table)?.insert(key, value).context(StoreSnafu { path: self.path.display().to_string() })?;
        Ok(())
    }
}

/// In-process store for tests and `CACHELEVEL=0`-like isolation.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<(String, Vec<u8>), Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, table: &str) -> usize {
        self.entries.lock().keys().filter(|(t, _)| t == table).count()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(&(table.to_string(), key.to_vec())).cloned())
    }

    fn put(&self, table: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.entries.lock().insert((table.to_string(), key.to_vec()), value.to_vec());
        Ok(())
    }
}

/// Search choices stored in the `kopt` table of a [`KeyValueStore`].
pub struct KoptTable<'a>(pub &'a dyn KeyValueStore);

impl ChoiceStore for KoptTable<'_> {
    fn get(&self, key: &str) -> Option<SearchChoice> {
        match self.0.get(KOPT_TABLE, key.as_bytes()) {
            Ok(bytes) => bytes.and_then(|b| SearchChoice::from_bytes(&b)),
            Err(err) => {
                warn!(error = %err, "search choice lookup failed");
                None
            }
        }
    }

    fn put(&self, key: &str, choice: &SearchChoice) {
        if let Err(err) = self.0.put(KOPT_TABLE, key.as_bytes(), &choice.to_bytes()) {
            warn!(error = %err, "search choice not persisted");
        }
    }
}
