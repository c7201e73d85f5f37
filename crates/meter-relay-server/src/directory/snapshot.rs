//! Copy-on-refresh registry of reachable meters.
//!
//! The current snapshot sits behind an `Arc` that is swapped wholesale on
//! every refresh. Readers clone the `Arc` under a short read lock and then
//! look up without any lock held, so a lookup sees either the old or the new
//! snapshot, never a mix.

use meter_relay_core::{MeterHandle, RelayError, RelayResult};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One immutable inventory generation.
#[derive(Debug)]
struct Snapshot {
    meters: HashMap<String, MeterHandle>,
    refreshed_at: Instant,
    generation: u64,
}

/// Tracks which meters currently have a reachable local agent.
pub struct DeviceDirectory {
    current: RwLock<Arc<Snapshot>>,
    max_age: Duration,
}

impl DeviceDirectory {
    /// Create an empty directory. Handles older than `max_age` are not served.
    pub fn new(max_age: Duration) -> Self {
        Self {
            current: RwLock::new(Arc::new(Snapshot {
                meters: HashMap::new(),
                refreshed_at: Instant::now(),
                generation: 0,
            })),
            max_age,
        }
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Resolve a meter to its handle in the current snapshot.
    pub fn lookup(&self, meter_id: &str) -> RelayResult<MeterHandle> {
        let snapshot = self.snapshot();
        let age = snapshot.refreshed_at.elapsed();
        if age > self.max_age {
            return Err(RelayError::DirectoryStale {
                age_secs: age.as_secs(),
            });
        }
        snapshot
            .meters
            .get(meter_id)
            .cloned()
            .ok_or_else(|| RelayError::MeterNotFound(meter_id.to_string()))
    }

    /// Replace the snapshot with a freshly fetched inventory.
    ///
    /// Entries with an empty id or port 0 are dropped; for duplicate ids the
    /// last entry wins. Returns the new generation number.
    pub fn replace(&self, handles: Vec<MeterHandle>) -> u64 {
        let mut meters = HashMap::with_capacity(handles.len());
        for handle in handles {
            if handle.meter_id.is_empty() || handle.port == 0 {
                warn!(meter_id = %handle.meter_id, port = handle.port, "dropping invalid inventory entry");
                continue;
            }
            if let Some(previous) = meters.insert(handle.meter_id.clone(), handle) {
                warn!(meter_id = %previous.meter_id, "duplicate inventory entry, keeping the last one");
            }
        }

        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let generation = current.generation + 1;
        debug!(generation, count = meters.len(), "directory snapshot replaced");
        *current = Arc::new(Snapshot {
            meters,
            refreshed_at: Instant::now(),
            generation,
        });
        generation
    }

    /// All meters in the current snapshot, sorted by meter id.
    pub fn list_active_meters(&self) -> Vec<MeterHandle> {
        let snapshot = self.snapshot();
        if snapshot.refreshed_at.elapsed() > self.max_age {
            return Vec::new();
        }
        let mut meters: Vec<MeterHandle> = snapshot.meters.values().cloned().collect();
        meters.sort_by(|a, b| a.meter_id.cmp(&b.meter_id));
        meters
    }

    pub fn generation(&self) -> u64 {
        self.snapshot().generation
    }

    /// Time since the last successful refresh.
    pub fn age(&self) -> Duration {
        self.snapshot().refreshed_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> DeviceDirectory {
        DeviceDirectory::new(Duration::from_secs(30))
    }

    #[test]
    fn lookup_known_and_unknown() {
        let dir = directory();
        dir.replace(vec![MeterHandle::new("M-001", 9001, 4242)]);
        assert_eq!(dir.lookup("M-001").unwrap().pid, 4242);
        assert!(matches!(dir.lookup("M-404"), Err(RelayError::MeterNotFound(id)) if id == "M-404"));
    }

    #[test]
    fn replace_is_wholesale() {
        let dir = directory();
        dir.replace(vec![
            MeterHandle::new("M-001", 9001, 1),
            MeterHandle::new("M-002", 9002, 2),
        ]);
        dir.replace(vec![MeterHandle::new("M-002", 9102, 3)]);
        assert!(dir.lookup("M-001").is_err());
        assert_eq!(dir.lookup("M-002").unwrap().port, 9102);
        assert_eq!(dir.generation(), 2);
    }

    #[test]
    fn invalid_and_duplicate_entries() {
        let dir = directory();
        dir.replace(vec![
            MeterHandle::new("", 9001, 1),
            MeterHandle::new("M-001", 0, 1),
            MeterHandle::new("M-002", 9002, 1),
            MeterHandle::new("M-002", 9003, 2),
        ]);
        let meters = dir.list_active_meters();
        assert_eq!(meters, vec![MeterHandle::new("M-002", 9003, 2)]);
    }

    #[test]
    fn list_is_sorted() {
        let dir = directory();
        dir.replace(vec![
            MeterHandle::new("M-003", 9003, 3),
            MeterHandle::new("M-001", 9001, 1),
            MeterHandle::new("M-002", 9002, 2),
        ]);
        let ids: Vec<String> = dir.list_active_meters().into_iter().map(|m| m.meter_id).collect();
        assert_eq!(ids, ["M-001", "M-002", "M-003"]);
    }

    #[test]
    fn stale_snapshot_serves_nothing() {
        let dir = DeviceDirectory::new(Duration::ZERO);
        dir.replace(vec![MeterHandle::new("M-001", 9001, 4242)]);
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(dir.lookup("M-001"), Err(RelayError::DirectoryStale { .. })));
        assert!(dir.list_active_meters().is_empty());
    }

    #[test]
    fn readers_keep_old_snapshot_during_replace() {
        let dir = directory();
        dir.replace(vec![MeterHandle::new("M-001", 9001, 1)]);
        let held = dir.snapshot();
        dir.replace(Vec::new());
        assert!(held.meters.contains_key("M-001"));
        assert!(dir.lookup("M-001").is_err());
    }
}
