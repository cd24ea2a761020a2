//! Device cache
//!
//! Remembers validated model ids and capabilities between restarts so
//! startup can skip MPPT and storage probing. The model id is always
//! re-read before use; the cache only saves discovery round trips.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{Result, SunSrvError};
use crate::sunspec::DeviceType;

/// Static attributes persisted per unit id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedDeviceRecord {
    pub unit_id: u8,
    pub device_type: DeviceType,
    pub model_id: u16,
    #[serde(default)]
    pub serial_number: String,
    #[serde(default)]
    pub mppt_string_count: u16,
    #[serde(default)]
    pub has_storage: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    saved_at: DateTime<Utc>,
    devices: BTreeMap<u8, CachedDeviceRecord>,
}

/// File-backed device cache keyed by unit id
#[derive(Debug)]
pub struct DeviceCache {
    path: PathBuf,
    records: BTreeMap<u8, CachedDeviceRecord>,
}

impl DeviceCache {
    /// Empty cache that will persist to `path`
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: BTreeMap::new(),
        }
    }

    /// Load the cache, falling back to an empty one if the file is missing or corrupt
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match Self::read_file(&path).await {
            Ok(Some(records)) => {
                info!("Loaded {} cached devices from {}", records.len(), path.display());
                Self { path, records }
            },
            Ok(None) => {
                debug!("No device cache at {}", path.display());
                Self::empty(path)
            },
            Err(e) => {
                warn!("Ignoring device cache {}: {e}", path.display());
                Self::empty(path)
            },
        }
    }

    async fn read_file(path: &Path) -> Result<Option<BTreeMap<u8, CachedDeviceRecord>>> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SunSrvError::cache(format!("read failed: {e}"))),
        };
        let file: CacheFile = serde_json::from_str(&content)?;

        // Entries are keyed by unit id; a mismatching record is dropped
        let records = file
            .devices
            .into_iter()
            .filter(|(unit_id, record)| record.unit_id == *unit_id)
            .collect();
        Ok(Some(records))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, unit_id: u8) -> Option<&CachedDeviceRecord> {
        self.records.get(&unit_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Store a record, writing the file only when it differs from the cached one
    ///
    /// Returns whether the file was written.
    pub async fn save(&mut self, record: CachedDeviceRecord) -> Result<bool> {
        if self.records.get(&record.unit_id) == Some(&record) {
            return Ok(false);
        }
        let unit_id = record.unit_id;
        self.records.insert(unit_id, record);
        self.persist().await?;
        debug!(unit_id, "Device cache updated");
        Ok(true)
    }

    /// Write the whole cache through a temporary file and rename
    async fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    SunSrvError::cache(format!("failed to create {}: {e}", parent.display()))
                })?;
            }
        }

        let file = CacheFile {
            saved_at: Utc::now(),
            devices: self.records.clone(),
        };
        let content = serde_json::to_string_pretty(&file)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, content)
            .await
            .map_err(|e| SunSrvError::cache(format!("write failed: {e}")))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| SunSrvError::cache(format!("rename failed: {e}")))?;
        Ok(())
    }
}
