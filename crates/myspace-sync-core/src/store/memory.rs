//! In-memory record backend

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::store::{ChangeCallback, Clock, Record, RecordData, RecordStore, VersionClock};
use crate::sync::SyncOp;

/// Key of a record within the store
type RecordKey = (String, String);

/// In-memory [`RecordStore`] backend.
///
/// Mutations are serialized by the write half of a single `RwLock`; reads
/// proceed concurrently. Change callbacks run on the mutating thread after
/// the lock is released, still before the mutating call returns.
pub struct MemoryStore {
    records: RwLock<HashMap<RecordKey, Record>>,
    callbacks: RwLock<Vec<ChangeCallback>>,
    versions: VersionClock,
}

impl MemoryStore {
    /// Create a store backed by the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(crate::store::SystemClock))
    }

    /// Create a store with an injected clock (frozen clocks in tests)
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            callbacks: RwLock::new(Vec::new()),
            versions: VersionClock::new(clock),
        }
    }

    fn key(table: &str, id: &str) -> RecordKey {
        (table.to_string(), id.to_string())
    }

    fn notify(&self, record: &Record) {
        for callback in self.callbacks.read().iter() {
            callback(record);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore for MemoryStore {
    fn create(&self, table: &str, id: &str, data: RecordData) -> SyncResult<Record> {
        let record = {
            let mut records = self.records.write();
            if records.contains_key(&Self::key(table, id)) {
                return Err(SyncError::AlreadyExists {
                    table: table.to_string(),
                    id: id.to_string(),
                });
            }

            let now = self.versions.now_secs();
            let record = Record {
                table: table.to_string(),
                id: id.to_string(),
                data,
                version: self.versions.next(),
                created_at: now,
                updated_at: now,
                deleted_at: None,
            };
            records.insert(Self::key(table, id), record.clone());
            record
        };

        debug!(table, id, version = record.version, "Created record");
        self.notify(&record);
        Ok(record)
    }

    fn update(&self, table: &str, id: &str, data: RecordData) -> SyncResult<Record> {
        let record = {
            let mut records = self.records.write();
            let existing = match records.get(&Self::key(table, id)) {
                Some(r) if r.is_live() => r,
                _ => {
                    return Err(SyncError::NotFound {
                        table: table.to_string(),
                        id: id.to_string(),
                    })
                }
            };

            let record = Record {
                table: table.to_string(),
                id: id.to_string(),
                data,
                version: self.versions.next(),
                created_at: existing.created_at,
                updated_at: self.versions.now_secs(),
                deleted_at: None,
            };
            records.insert(Self::key(table, id), record.clone());
            record
        };

        debug!(table, id, version = record.version, "Updated record");
        self.notify(&record);
        Ok(record)
    }

    fn delete(&self, table: &str, id: &str) -> SyncResult<()> {
        let record = {
            let mut records = self.records.write();
            let existing = match records.get(&Self::key(table, id)) {
                Some(r) if r.is_live() => r,
                _ => {
                    return Err(SyncError::NotFound {
                        table: table.to_string(),
                        id: id.to_string(),
                    })
                }
            };

            let now = self.versions.now_secs();
            let record = Record {
                table: table.to_string(),
                id: id.to_string(),
                data: RecordData::new(),
                version: self.versions.next(),
                created_at: existing.created_at,
                updated_at: now,
                deleted_at: Some(now),
            };
            records.insert(Self::key(table, id), record.clone());
            record
        };

        debug!(table, id, version = record.version, "Deleted record");
        self.notify(&record);
        Ok(())
    }

    fn get(&self, table: &str, id: &str) -> SyncResult<Record> {
        self.records
            .read()
            .get(&Self::key(table, id))
            .cloned()
            .ok_or_else(|| SyncError::NotFound {
                table: table.to_string(),
                id: id.to_string(),
            })
    }

    fn list(&self, table: &str) -> SyncResult<Vec<Record>> {
        let records = self.records.read();
        let mut live: Vec<Record> = records
            .values()
            .filter(|r| r.table == table && r.is_live())
            .cloned()
            .collect();
        live.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(live)
    }

    fn records_since(&self, table: &str, since_version: i64) -> SyncResult<Vec<Record>> {
        let records = self.records.read();
        let mut changed: Vec<Record> = records
            .values()
            .filter(|r| r.table == table && r.version > since_version)
            .cloned()
            .collect();
        changed.sort_by_key(|r| r.version);
        Ok(changed)
    }

    fn apply(
        &self,
        op: SyncOp,
        table: &str,
        id: &str,
        data: RecordData,
        version: i64,
    ) -> SyncResult<Option<Record>> {
        let record = {
            let mut records = self.records.write();
            let existing = records.get(&Self::key(table, id));

            // Last-writer-wins: only a strictly newer version may mutate.
            if let Some(current) = existing {
                if current.version >= version {
                    debug!(
                        table,
                        id,
                        current = current.version,
                        incoming = version,
                        "Skipping stale remote change"
                    );
                    return Ok(None);
                }
            }

            let now = self.versions.now_secs();
            let created_at = existing.map(|r| r.created_at).unwrap_or(now);
            let record = match op {
                SyncOp::Create | SyncOp::Update => Record {
                    table: table.to_string(),
                    id: id.to_string(),
                    data,
                    version,
                    created_at,
                    updated_at: now,
                    deleted_at: None,
                },
                // A delete for an unknown record still leaves a tombstone,
                // so an older create arriving later cannot win.
                SyncOp::Delete => Record {
                    table: table.to_string(),
                    id: id.to_string(),
                    data: RecordData::new(),
                    version,
                    created_at,
                    updated_at: now,
                    deleted_at: Some(now),
                },
            };

            records.insert(Self::key(table, id), record.clone());
            // Lift the local version sequence above the accepted remote
            // version so later local writes win LWW against it.
            self.versions.observe(version);
            record
        };

        debug!(table, id, version, op = ?op, "Applied remote change");
        self.notify(&record);
        Ok(Some(record))
    }

    fn subscribe(&self, callback: ChangeCallback) {
        self.callbacks.write().push(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn data(pairs: &[(&str, serde_json::Value)]) -> RecordData {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_create_and_get() {
        let store = MemoryStore::new();
        let created = store
            .create("diary_entries", "demo-1", data(&[("title", json!("t"))]))
            .unwrap();

        let fetched = store.get("diary_entries", "demo-1").unwrap();
        assert_eq!(fetched.version, created.version);
        assert_eq!(fetched.data["title"], json!("t"));
        assert_eq!(fetched.created_at, fetched.updated_at);
        assert!(fetched.is_live());
    }

    #[test]
    fn test_create_twice_fails() {
        let store = MemoryStore::new();
        store.create("t", "a", RecordData::new()).unwrap();
        assert!(matches!(
            store.create("t", "a", RecordData::new()),
            Err(SyncError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_update_preserves_created_at_and_bumps_version() {
        let store = MemoryStore::new();
        let created = store
            .create("t", "a", data(&[("n", json!(1))]))
            .unwrap();
        let updated = store
            .update("t", "a", data(&[("n", json!(2))]))
            .unwrap();

        assert_eq!(updated.created_at, created.created_at);
        assert!(updated.version > created.version);
        assert_eq!(updated.data["n"], json!(2));
    }

    #[test]
    fn test_update_missing_fails() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.update("t", "missing", RecordData::new()),
            Err(SyncError::NotFound { .. })
        ));
    }

    #[test]
    fn test_soft_delete_finality() {
        let store = MemoryStore::new();
        store
            .create("t", "a", data(&[("n", json!(1))]))
            .unwrap();
        store.delete("t", "a").unwrap();

        let tombstone = store.get("t", "a").unwrap();
        assert!(tombstone.deleted_at.is_some());
        assert!(tombstone.data.is_empty());

        assert!(matches!(
            store.update("t", "a", RecordData::new()),
            Err(SyncError::NotFound { .. })
        ));
        assert!(matches!(store.delete("t", "a"), Err(SyncError::NotFound { .. })));
        assert!(matches!(
            store.create("t", "a", RecordData::new()),
            Err(SyncError::AlreadyExists { .. })
        ));
        assert!(store.list("t").unwrap().is_empty());
    }

    #[test]
    fn test_versions_strictly_increase_across_mutations() {
        let store = MemoryStore::new();
        let mut prev = store.create("t", "a", RecordData::new()).unwrap().version;
        for _ in 0..50 {
            let v = store.update("t", "a", RecordData::new()).unwrap().version;
            assert!(v > prev);
            prev = v;
        }
    }

    #[test]
    fn test_records_since_is_complete_and_ordered() {
        let store = MemoryStore::new();
        store.create("t", "a", RecordData::new()).unwrap();
        let b = store.create("t", "b", RecordData::new()).unwrap();
        store.delete("t", "a").unwrap();
        let tombstone = store.get("t", "a").unwrap();

        let all = store.records_since("t", 0).unwrap();
        let versions: Vec<i64> = all.iter().map(|r| r.version).collect();
        assert_eq!(versions, {
            let mut sorted = versions.clone();
            sorted.sort();
            sorted
        });
        // "a" appears once, at its tombstone version.
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|r| r.id == "a" && r.version == tombstone.version));

        let after_b = store.records_since("t", b.version).unwrap();
        assert_eq!(after_b.len(), 1);
        assert_eq!(after_b[0].id, "a");
    }

    #[test]
    fn test_returned_data_is_a_copy() {
        let store = MemoryStore::new();
        store
            .create("t", "a", data(&[("n", json!(1))]))
            .unwrap();

        let mut fetched = store.get("t", "a").unwrap();
        fetched.data.insert("n".to_string(), json!(99));

        assert_eq!(store.get("t", "a").unwrap().data["n"], json!(1));
    }

    #[test]
    fn test_callbacks_fire_in_registration_order() {
        let store = MemoryStore::new();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = seen.clone();
            store.subscribe(Arc::new(move |record: &Record| {
                seen.lock().push(format!("{tag}:{}", record.id));
            }));
        }

        store.create("t", "a", RecordData::new()).unwrap();
        assert_eq!(*seen.lock(), vec!["first:a", "second:a"]);

        store.delete("t", "a").unwrap();
        assert_eq!(seen.lock().len(), 4);
    }

    #[test]
    fn test_apply_newer_version_wins() {
        let store = MemoryStore::new();
        let local = store
            .create("t", "a", data(&[("n", json!(1))]))
            .unwrap();

        let applied = store
            .apply(
                SyncOp::Update,
                "t",
                "a",
                data(&[("n", json!(2))]),
                local.version + 10,
            )
            .unwrap()
            .expect("newer version must apply");
        assert_eq!(applied.version, local.version + 10);
        assert_eq!(store.get("t", "a").unwrap().data["n"], json!(2));
    }

    #[test]
    fn test_apply_stale_version_skipped() {
        let store = MemoryStore::new();
        let local = store
            .create("t", "a", data(&[("n", json!(1))]))
            .unwrap();

        let stale = store
            .apply(
                SyncOp::Update,
                "t",
                "a",
                data(&[("n", json!(0))]),
                local.version - 1,
            )
            .unwrap();
        assert!(stale.is_none());
        assert_eq!(store.get("t", "a").unwrap().data["n"], json!(1));
    }

    #[test]
    fn test_apply_delete_without_record_leaves_tombstone() {
        let store = MemoryStore::new();
        store
            .apply(SyncOp::Delete, "t", "ghost", RecordData::new(), 42)
            .unwrap()
            .expect("delete must leave a tombstone");

        let tombstone = store.get("t", "ghost").unwrap();
        assert!(tombstone.deleted_at.is_some());

        // An older create arriving afterwards loses.
        assert!(store
            .apply(SyncOp::Create, "t", "ghost", RecordData::new(), 41)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_local_writes_after_apply_win_lww() {
        let store = MemoryStore::new();
        let local = store.create("t", "a", RecordData::new()).unwrap();

        // Remote version far ahead of our clock.
        let remote_version = local.version + 1_000_000_000;
        store
            .apply(SyncOp::Update, "t", "a", RecordData::new(), remote_version)
            .unwrap();

        let next_local = store.update("t", "a", RecordData::new()).unwrap();
        assert!(next_local.version > remote_version);
    }
}
