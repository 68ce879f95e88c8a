use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::record::{AlarmId, AlarmRecord};

/// Newest on-disk layout this build reads and the one it writes.
pub const STORE_VERSION: u32 = 1;

/// Durable CRUD over alarm records keyed by id.
///
/// Every mutating call must be durable before it returns. Implementations
/// serialize writers internally, so one store can be shared between the
/// caller context and the OS callback contexts.
pub trait AlarmStore: Send + Sync {
    /// Inserts or replaces the record with the same id.
    fn save(&self, record: &AlarmRecord) -> Result<(), StoreError>;
    fn get(&self, id: AlarmId) -> Result<Option<AlarmRecord>, StoreError>;
    fn get_all(&self) -> Result<Vec<AlarmRecord>, StoreError>;
    /// Deleting an unknown id is not an error.
    fn delete(&self, id: AlarmId) -> Result<(), StoreError>;
    fn clear(&self) -> Result<(), StoreError>;

    /// Records that have not fired yet at `now_millis`.
    fn get_active(&self, now_millis: i64) -> Result<Vec<AlarmRecord>, StoreError> {
        Ok(self
            .get_all()?
            .into_iter()
            .filter(|record| record.is_active(now_millis))
            .collect())
    }
}

#[derive(Serialize)]
struct StoreDocument<'a> {
    version: u32,
    alarms: Vec<&'a AlarmRecord>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredAlarms {
    Versioned {
        version: u32,
        #[serde(default)]
        alarms: Vec<AlarmRecord>,
    },
    // Unversioned layout: a bare array of records.
    Legacy(Vec<AlarmRecord>),
}

/// JSON-file backed store.
///
/// The whole collection lives in one document that is rewritten through a
/// synced temp file and an atomic rename on every mutation. Reads are served
/// from the in-memory copy, which only changes after the write hit disk.
pub struct FileAlarmStore {
    path: PathBuf,
    records: Mutex<BTreeMap<AlarmId, AlarmRecord>>,
}

impl FileAlarmStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let records = load_records(&path)?;
        debug!(path = %path.display(), count = records.len(), "opened alarm store");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn mutate(
        &self,
        apply: impl FnOnce(&mut BTreeMap<AlarmId, AlarmRecord>),
    ) -> Result<(), StoreError> {
        let mut guard = self.records.lock();
        let mut next = guard.clone();
        apply(&mut next);
        persist_records(&self.path, &next)?;
        *guard = next;
        Ok(())
    }
}

impl AlarmStore for FileAlarmStore {
    fn save(&self, record: &AlarmRecord) -> Result<(), StoreError> {
        self.mutate(|records| {
            records.insert(record.id, record.clone());
        })
    }

    fn get(&self, id: AlarmId) -> Result<Option<AlarmRecord>, StoreError> {
        Ok(self.records.lock().get(&id).cloned())
    }

    fn get_all(&self) -> Result<Vec<AlarmRecord>, StoreError> {
        Ok(self.records.lock().values().cloned().collect())
    }

    fn delete(&self, id: AlarmId) -> Result<(), StoreError> {
        if !self.records.lock().contains_key(&id) {
            return Ok(());
        }
        self.mutate(|records| {
            records.remove(&id);
        })
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.mutate(|records| records.clear())
    }
}

fn load_records(path: &Path) -> Result<BTreeMap<AlarmId, AlarmRecord>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(err) => return Err(StoreError::io(path, err)),
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(BTreeMap::new());
    }

    let alarms = match serde_json::from_slice::<StoredAlarms>(&bytes) {
        Ok(StoredAlarms::Versioned { version, .. }) if version > STORE_VERSION => {
            return Err(StoreError::UnsupportedVersion {
                path: path.to_path_buf(),
                found: version,
                supported: STORE_VERSION,
            });
        }
        Ok(StoredAlarms::Versioned { alarms, .. }) => alarms,
        Ok(StoredAlarms::Legacy(alarms)) => {
            debug!(path = %path.display(), "reading unversioned alarm store");
            alarms
        }
        Err(err) => {
            quarantine(path, &err)?;
            return Ok(BTreeMap::new());
        }
    };

    let mut records = BTreeMap::new();
    for record in alarms {
        if record.id <= 0 {
            warn!(alarm_id = record.id, "dropping stored alarm with invalid id");
            continue;
        }
        records.insert(record.id, record);
    }
    Ok(records)
}

fn quarantine(path: &Path, err: &serde_json::Error) -> Result<(), StoreError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "alarms".to_string());
    let target = path.with_file_name(format!(
        "{file_name}.corrupt-{}",
        Utc::now().timestamp_millis()
    ));
    warn!(
        path = %path.display(),
        quarantined = %target.display(),
        %err,
        "alarm store is unreadable, starting empty"
    );
    fs::rename(path, &target).map_err(|source| StoreError::io(path, source))
}

fn persist_records(
    path: &Path,
    records: &BTreeMap<AlarmId, AlarmRecord>,
) -> Result<(), StoreError> {
    let document = StoreDocument {
        version: STORE_VERSION,
        alarms: records.values().collect(),
    };
    let json = serde_json::to_vec_pretty(&document)?;

    let parent = path.parent().filter(|dir| !dir.as_os_str().is_empty());
    if let Some(dir) = parent {
        fs::create_dir_all(dir).map_err(|source| StoreError::io(dir, source))?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    {
        let mut file = File::create(&tmp_path).map_err(|source| StoreError::io(&tmp_path, source))?;
        file.write_all(&json)
            .and_then(|_| file.sync_all())
            .map_err(|source| StoreError::io(&tmp_path, source))?;
    }
    fs::rename(&tmp_path, path).map_err(|source| StoreError::io(path, source))?;

    // Directory fsync makes the rename itself durable. Not every platform lets
    // a directory be opened, so this is best effort.
    if let Some(dir) = parent {
        if let Err(err) = File::open(dir).and_then(|handle| handle.sync_all()) {
            debug!(dir = %dir.display(), %err, "skipping directory sync");
        }
    }
    Ok(())
}

/// Non-durable store for tests and hosts that do not need reboot survival.
#[derive(Default)]
pub struct MemoryAlarmStore {
    records: Mutex<BTreeMap<AlarmId, AlarmRecord>>,
}

impl MemoryAlarmStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = AlarmRecord>) -> Self {
        let store = Self::new();
        store
            .records
            .lock()
            .extend(records.into_iter().map(|record| (record.id, record)));
        store
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl AlarmStore for MemoryAlarmStore {
    fn save(&self, record: &AlarmRecord) -> Result<(), StoreError> {
        self.records.lock().insert(record.id, record.clone());
        Ok(())
    }

    fn get(&self, id: AlarmId) -> Result<Option<AlarmRecord>, StoreError> {
        Ok(self.records.lock().get(&id).cloned())
    }

    fn get_all(&self) -> Result<Vec<AlarmRecord>, StoreError> {
        Ok(self.records.lock().values().cloned().collect())
    }

    fn delete(&self, id: AlarmId) -> Result<(), StoreError> {
        self.records.lock().remove(&id);
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.records.lock().clear();
        Ok(())
    }
}
