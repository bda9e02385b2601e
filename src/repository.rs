//! Versioned local replica of flag and segment definitions.
//!
//! The repository has two tiers: a bounded in-memory cache and an optional durable [`Storage`].
//! Reads check the cache first and fall back to the store, repopulating the cache. Writes go to
//! the store (invalidating the cached entry) when one is configured, and to the cache otherwise.
//!
//! Every write is version-checked: a definition is only replaced by a strictly newer one. This is
//! what makes the poll and stream paths safe to run concurrently against the same repository.
use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    cache::BoundedCache,
    models::{is_outdated, Flag, Segment},
    Result,
};

const FLAGS_PREFIX: &str = "flags/";
const SEGMENTS_PREFIX: &str = "segments/";

/// Read-only lookups used by the evaluator.
pub trait Query {
    fn get_flag(&self, identifier: &str) -> Option<Arc<Flag>>;
    fn get_segment(&self, identifier: &str) -> Option<Arc<Segment>>;
}

/// A durable key/value store backing the repository.
///
/// Keys are `flags/<identifier>` and `segments/<identifier>`; values are JSON-encoded records
/// holding the current (and optionally previous) definition and its version. Implementations
/// must be safe to call concurrently.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
    fn keys(&self) -> Result<Vec<String>>;

    /// Release the underlying resources. Called once when the client closes.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Change notification emitted on every accepted write or delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryEvent {
    FlagStored(String),
    FlagDeleted(String),
    SegmentStored(String),
    SegmentDeleted(String),
}

pub(crate) type RepositoryCallback = Box<dyn Fn(RepositoryEvent) + Send + Sync>;

/// Persisted and cached form of a definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Record<T> {
    version: Option<i64>,
    current: Arc<T>,
    #[serde(default = "Option::default")]
    previous: Option<Arc<T>>,
}

trait Versioned {
    fn version(&self) -> Option<i64>;
}

impl Versioned for Flag {
    fn version(&self) -> Option<i64> {
        self.version
    }
}

impl Versioned for Segment {
    fn version(&self) -> Option<i64> {
        self.version
    }
}

pub struct Repository {
    flags: BoundedCache<Record<Flag>>,
    segments: BoundedCache<Record<Segment>>,
    store: Option<Arc<dyn Storage>>,
    keep_previous: bool,
    on_change: Option<RepositoryCallback>,
    /// Serializes version-check-then-write sequences.
    write_lock: Mutex<()>,
    /// Bumped on every durable store write or delete, before the cached entry is invalidated.
    generation: AtomicU64,
    closed: AtomicBool,
}

impl Repository {
    pub(crate) fn new(
        capacity: usize,
        store: Option<Arc<dyn Storage>>,
        keep_previous: bool,
        on_change: Option<RepositoryCallback>,
    ) -> Repository {
        Repository {
            flags: BoundedCache::new(capacity),
            segments: BoundedCache::new(capacity),
            store,
            keep_previous,
            on_change,
            write_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Store `flag` unless the stored version is the same or newer. Returns `true` if the flag was
    /// stored.
    pub fn set_flag(&self, flag: Flag) -> bool {
        let identifier = flag.identifier.clone();
        let stored = self.store_record(&self.flags, FLAGS_PREFIX, &identifier, flag);
        if stored {
            self.notify(RepositoryEvent::FlagStored(identifier));
        }
        stored
    }

    /// Store `segment` unless the stored version is the same or newer. Returns `true` if the
    /// segment was stored.
    pub fn set_segment(&self, segment: Segment) -> bool {
        let identifier = segment.identifier.clone();
        let stored = self.store_record(&self.segments, SEGMENTS_PREFIX, &identifier, segment);
        if stored {
            self.notify(RepositoryEvent::SegmentStored(identifier));
        }
        stored
    }

    pub fn delete_flag(&self, identifier: &str) {
        self.remove_record(&self.flags, FLAGS_PREFIX, identifier);
        self.notify(RepositoryEvent::FlagDeleted(identifier.to_owned()));
    }

    pub fn delete_segment(&self, identifier: &str) {
        self.remove_record(&self.segments, SEGMENTS_PREFIX, identifier);
        self.notify(RepositoryEvent::SegmentDeleted(identifier.to_owned()));
    }

    /// Stored version of a flag, without populating the cache.
    pub(crate) fn flag_version(&self, identifier: &str) -> Option<i64> {
        self.peek(&self.flags, FLAGS_PREFIX, identifier)
            .and_then(|record| record.version)
    }

    /// Stored version of a segment, without populating the cache.
    pub(crate) fn segment_version(&self, identifier: &str) -> Option<i64> {
        self.peek(&self.segments, SEGMENTS_PREFIX, identifier)
            .and_then(|record| record.version)
    }

    /// The current definition of a flag and, if previous snapshots are kept, the one it replaced.
    pub fn get_current_and_previous_flag(
        &self,
        identifier: &str,
    ) -> Option<(Arc<Flag>, Option<Arc<Flag>>)> {
        self.load(&self.flags, FLAGS_PREFIX, identifier)
            .map(|record| (record.current, record.previous))
    }

    /// Identifiers of all known flags starting with `prefix`, sorted.
    pub fn get_all_flag_identifiers(&self, prefix: &str) -> Vec<String> {
        let mut identifiers: BTreeSet<String> = self.flags.keys().into_iter().collect();

        if let Some(store) = &self.store {
            match store.keys() {
                Ok(keys) => identifiers.extend(
                    keys.iter()
                        .filter_map(|key| key.strip_prefix(FLAGS_PREFIX))
                        .map(str::to_owned),
                ),
                Err(err) => {
                    log::warn!(target: "ff", "failed to list keys of the durable store: {err}");
                }
            }
        }

        identifiers
            .into_iter()
            .filter(|identifier| identifier.starts_with(prefix))
            .collect()
    }

    /// Identifiers of flags whose evaluation depends on `segment`.
    pub fn find_flags_referencing_segment(&self, segment: &str) -> Vec<String> {
        self.get_all_flag_identifiers("")
            .into_iter()
            .filter(|identifier| {
                self.get_flag(identifier)
                    .map_or(false, |flag| flag.references_segment(segment))
            })
            .collect()
    }

    /// Release the durable store. Subsequent calls are no-ops.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match &self.store {
            Some(store) => store.close(),
            None => Ok(()),
        }
    }

    fn notify(&self, event: RepositoryEvent) {
        log::debug!(target: "ff", "repository changed: {event:?}");
        if let Some(on_change) = &self.on_change {
            on_change(event);
        }
    }

    fn load<T>(
        &self,
        cache: &BoundedCache<Record<T>>,
        prefix: &str,
        identifier: &str,
    ) -> Option<Record<T>>
    where
        T: Clone + DeserializeOwned,
    {
        if let Some(record) = cache.get(identifier) {
            return Some(record);
        }
        let generation = self.generation.load(Ordering::SeqCst);
        let record = self.read_store::<T>(prefix, identifier)?;
        // A write that landed after the store read may already have invalidated this entry.
        cache.insert_if(identifier.to_owned(), record.clone(), || {
            self.generation.load(Ordering::SeqCst) == generation
        });
        Some(record)
    }

    fn peek<T>(
        &self,
        cache: &BoundedCache<Record<T>>,
        prefix: &str,
        identifier: &str,
    ) -> Option<Record<T>>
    where
        T: Clone + DeserializeOwned,
    {
        cache
            .get(identifier)
            .or_else(|| self.read_store(prefix, identifier))
    }

    fn read_store<T: DeserializeOwned>(&self, prefix: &str, identifier: &str) -> Option<Record<T>> {
        let store = self.store.as_ref()?;
        let key = format!("{prefix}{identifier}");
        match store.get(&key) {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(record) => Some(record),
                Err(err) => {
                    log::warn!(target: "ff", key = key.as_str(); "failed to parse stored record: {err}");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                log::warn!(target: "ff", key = key.as_str(); "failed to read from durable store: {err}");
                None
            }
        }
    }

    fn store_record<T>(
        &self,
        cache: &BoundedCache<Record<T>>,
        prefix: &str,
        identifier: &str,
        value: T,
    ) -> bool
    where
        T: Versioned + Clone + Serialize + DeserializeOwned,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let existing = self.peek(cache, prefix, identifier);
        if let Some(existing) = &existing {
            if is_outdated(existing.version, value.version()) {
                log::debug!(target: "ff",
                            key = identifier,
                            stored = existing.version,
                            incoming = value.version();
                            "ignoring update, stored version is the same or newer");
                return false;
            }
        }

        let record = Record {
            version: value.version(),
            current: Arc::new(value),
            previous: if self.keep_previous {
                existing.map(|record| record.current)
            } else {
                None
            },
        };

        match &self.store {
            Some(store) => {
                let key = format!("{prefix}{identifier}");
                let written = serde_json::to_vec(&record)
                    .map_err(crate::Error::from)
                    .and_then(|bytes| store.set(&key, bytes));
                if let Err(err) = written {
                    log::warn!(target: "ff", key = key.as_str(); "failed to write to durable store: {err}");
                    return false;
                }
                // Next read re-derives the entry from the store.
                self.generation.fetch_add(1, Ordering::SeqCst);
                cache.remove(identifier);
            }
            None => cache.insert(identifier.to_owned(), record),
        }
        true
    }

    fn remove_record<T: Clone>(&self, cache: &BoundedCache<Record<T>>, prefix: &str, identifier: &str) {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(store) = &self.store {
            let key = format!("{prefix}{identifier}");
            if let Err(err) = store.delete(&key) {
                log::warn!(target: "ff", key = key.as_str(); "failed to delete from durable store: {err}");
            }
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        cache.remove(identifier);
    }
}

impl Query for Repository {
    fn get_flag(&self, identifier: &str) -> Option<Arc<Flag>> {
        self.load(&self.flags, FLAGS_PREFIX, identifier)
            .map(|record| record.current)
    }

    fn get_segment(&self, identifier: &str) -> Option<Arc<Segment>> {
        self.load(&self.segments, SEGMENTS_PREFIX, identifier)
            .map(|record| record.current)
    }
}
