//! Domain registry interface and in-memory implementation.
//!
//! The registry answers a single query shape: "is there a record named exactly
//! `X`, and is it eligible for managed TLS". Lookups are unique-key point reads,
//! so every implementation must index records by name.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{debug, trace};

/// A registered public-facing hostname.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRecord {
    /// Exact hostname, compared case-sensitively
    pub name: String,
    /// Whether certificates may be issued automatically for this hostname
    #[serde(default)]
    pub managed_tls: bool,
}

impl DomainRecord {
    pub fn new(name: impl Into<String>, managed_tls: bool) -> Self {
        Self {
            name: name.into(),
            managed_tls,
        }
    }
}

impl fmt::Display for DomainRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (managed_tls={})", self.name, self.managed_tls)
    }
}

/// Errors returned by registry backends.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The backing store could not be reached
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    /// The backing store returned data that could not be interpreted
    #[error("registry returned invalid data: {0}")]
    Corrupt(String),
}

/// Read interface the certificate engine needs from the domain registry.
///
/// Implementations are externally synchronized and must tolerate concurrent
/// calls from many handshake tasks at once.
pub trait DomainRegistry: Send + Sync {
    /// Look up the record whose name equals `name` exactly.
    fn lookup(&self, name: &str) -> Result<Option<DomainRecord>, RegistryError>;
}

/// In-memory registry keyed by exact hostname.
///
/// Backed by a `DashMap`, so lookups from handshake tasks never contend with
/// each other and only briefly with operator writes on the same shard.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    records: DashMap<String, DomainRecord>,
}

impl MemoryRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the given records
    ///
    /// Later records replace earlier ones with the same name.
    pub fn with_records(records: impl IntoIterator<Item = DomainRecord>) -> Self {
        let registry = Self::new();
        for record in records {
            registry.register(record);
        }
        registry
    }

    /// Insert or replace a record
    pub fn register(&self, record: DomainRecord) {
        debug!(domain = %record.name, managed_tls = record.managed_tls, "Registering domain");
        self.records.insert(record.name.clone(), record);
    }

    /// Change the managed-TLS flag of an existing record
    ///
    /// Returns `false` if no record with that name exists.
    pub fn set_managed_tls(&self, name: &str, managed_tls: bool) -> bool {
        match self.records.get_mut(name) {
            Some(mut record) => {
                record.managed_tls = managed_tls;
                debug!(domain = %name, managed_tls, "Updated domain managed TLS flag");
                true
            }
            None => false,
        }
    }

    /// Remove a record, returning it if it existed
    pub fn remove(&self, name: &str) -> Option<DomainRecord> {
        let removed = self.records.remove(name).map(|(_, record)| record);
        if removed.is_some() {
            debug!(domain = %name, "Removed domain");
        }
        removed
    }

    /// Replace the whole record set
    ///
    /// Used on configuration reload. Records absent from `records` are dropped.
    pub fn replace_all(&self, records: impl IntoIterator<Item = DomainRecord>) {
        let incoming: Vec<DomainRecord> = records.into_iter().collect();
        self.records
            .retain(|name, _| incoming.iter().any(|record| &record.name == name));
        for record in incoming {
            self.records.insert(record.name.clone(), record);
        }
        debug!(domain_count = self.records.len(), "Replaced registry contents");
    }

    /// Number of registered domains
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the registry holds no domains
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Snapshot of all registered names
    pub fn names(&self) -> Vec<String> {
        self.records.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl DomainRegistry for MemoryRegistry {
    fn lookup(&self, name: &str) -> Result<Option<DomainRecord>, RegistryError> {
        let record = self.records.get(name).map(|entry| entry.value().clone());
        trace!(domain = %name, found = record.is_some(), "Registry lookup");
        Ok(record)
    }
}
