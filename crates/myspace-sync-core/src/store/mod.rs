//! Versioned, soft-deleting record store
//!
//! Records are keyed by `(table, id)` and carry a 64-bit version chosen by
//! the writing device. Convergence across devices is last-writer-wins by
//! numeric version, so every backend must issue strictly increasing
//! versions within one process and must keep tombstones around.
//!
//! The store is specified by the [`RecordStore`] contract; the in-memory
//! [`MemoryStore`] is the shipping backend and a durable one can be slotted
//! in behind the same trait.

mod clock;
mod memory;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use clock::{Clock, SystemClock, VersionClock};
pub use memory::MemoryStore;

use crate::error::SyncResult;
use crate::sync::SyncOp;

/// Payload of a record: a JSON object
pub type RecordData = serde_json::Map<String, serde_json::Value>;

/// Callback invoked synchronously after every successful mutation
pub type ChangeCallback = Arc<dyn Fn(&Record) + Send + Sync>;

/// A versioned, soft-deletable document keyed by `(table, id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Logical collection name
    pub table: String,
    /// Identifier within the table
    pub id: String,
    /// Document body; empty once deleted
    pub data: RecordData,
    /// Monotone 64-bit version chosen by the writing device
    pub version: i64,
    /// Unix seconds; preserved across updates
    pub created_at: i64,
    /// Unix seconds of the latest mutation
    pub updated_at: i64,
    /// Tombstone timestamp; a record is live iff this is `None`
    pub deleted_at: Option<i64>,
}

impl Record {
    /// Whether the record has not been soft-deleted
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// Contract every record backend satisfies.
///
/// Mutations are serialized by the backend; reads may run concurrently
/// with each other. Change callbacks fire once per successful mutation,
/// in registration order, before the mutating call returns.
pub trait RecordStore: Send + Sync {
    /// Insert a new record.
    ///
    /// Fails with `AlreadyExists` if any record (live or tombstoned)
    /// occupies the key; a tombstone is never resurrected locally.
    fn create(&self, table: &str, id: &str, data: RecordData) -> SyncResult<Record>;

    /// Replace the data of a live record, preserving `created_at`.
    ///
    /// Fails with `NotFound` if the record is absent or tombstoned.
    fn update(&self, table: &str, id: &str, data: RecordData) -> SyncResult<Record>;

    /// Soft-delete a live record: data replaced with the empty object,
    /// `deleted_at` set, a fresh version assigned.
    ///
    /// Fails with `NotFound` if the record is absent or already deleted.
    fn delete(&self, table: &str, id: &str) -> SyncResult<()>;

    /// Fetch one record, live or tombstoned. Data is defensively copied.
    fn get(&self, table: &str, id: &str) -> SyncResult<Record>;

    /// All live records of a table, newest update first.
    fn list(&self, table: &str) -> SyncResult<Vec<Record>>;

    /// All records (tombstones included) with `version > since_version`,
    /// ascending by version.
    fn records_since(&self, table: &str, since_version: i64) -> SyncResult<Vec<Record>>;

    /// Apply a remotely originated mutation, keeping the sender's version.
    ///
    /// The last-writer-wins predicate is enforced here: the mutation takes
    /// effect iff `version` is greater than the current version at the key.
    /// Returns `Ok(None)` when the incoming change is stale and skipped.
    /// Accepted applies fire change callbacks exactly like local mutations.
    fn apply(
        &self,
        op: SyncOp,
        table: &str,
        id: &str,
        data: RecordData,
        version: i64,
    ) -> SyncResult<Option<Record>>;

    /// Register a change callback. Callbacks are configured at startup and
    /// invoked synchronously on the mutating thread.
    fn subscribe(&self, callback: ChangeCallback);
}
