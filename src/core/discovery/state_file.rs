//! Registered-entity record of the previous run.
//!
//! ```json
//! {"sensors": ["penguin_metrics_..._cpu_percent", ...], "kinds": {"...": "sensor"}}
//! ```
//!
//! `kinds` is optional; files without it are still read.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs, io,
    path::{Path, PathBuf},
    time::SystemTime,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::DiscoveryError;
use crate::core::model::EntityKind;

const FALLBACK_DIR: &str = "penguin-metrics";
const FALLBACK_FILE: &str = "registered_sensors.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredSensors {
    pub sensors: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub kinds: BTreeMap<String, EntityKind>,
}

impl RegisteredSensors {
    pub fn from_map(entities: &BTreeMap<String, EntityKind>) -> Self {
        Self {
            sensors: entities.keys().cloned().collect(),
            kinds: entities.clone(),
        }
    }

    /// Recorded kind of `id`, if the file carried one.
    pub fn kind_of(&self, id: &str) -> Option<EntityKind> {
        self.kinds.get(id).copied()
    }
}

/// The per-user fallback location, under the XDG state (or data) directory.
pub fn default_fallback_path() -> Option<PathBuf> {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .map(|dir| dir.join(FALLBACK_DIR).join(FALLBACK_FILE))
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Reads and writes [`RegisteredSensors`], falling back to a second path when
/// the primary one is not usable.
#[derive(Debug, Clone)]
pub struct StateStore {
    primary: PathBuf,
    fallback: Option<PathBuf>,
}

impl StateStore {
    pub fn new(primary: impl Into<PathBuf>) -> Self {
        Self {
            primary: primary.into(),
            fallback: default_fallback_path(),
        }
    }

    pub fn with_fallback(mut self, fallback: Option<PathBuf>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn primary(&self) -> &Path {
        &self.primary
    }

    pub fn fallback(&self) -> Option<&Path> {
        self.fallback.as_deref()
    }

    /// Loads the previous record. `Ok(None)` when neither location holds one.
    ///
    /// [`save`](Self::save) writes the fallback whenever the primary is not
    /// writable, so the more recently modified file is read first and the
    /// other one only if the first is missing or unreadable.
    pub fn load(&self) -> Result<Option<RegisteredSensors>, DiscoveryError> {
        let Some(fallback) = &self.fallback else {
            return Self::read(&self.primary);
        };

        let (first, second) = if modified(fallback) >= modified(&self.primary) {
            (fallback.as_path(), self.primary.as_path())
        } else {
            (self.primary.as_path(), fallback.as_path())
        };

        match Self::read(first) {
            Ok(Some(state)) => return Ok(Some(state)),
            Ok(None) => {}
            Err(e) => warn!("Cannot read {}: {}, trying {}", first.display(), e, second.display()),
        }
        Self::read(second)
    }

    /// Writes `state`, falling back on failure. Returns the path written.
    pub fn save(&self, state: &RegisteredSensors) -> Result<PathBuf, DiscoveryError> {
        let json = serde_json::to_vec_pretty(state)?;

        let primary_error = match Self::write(&self.primary, &json) {
            Ok(()) => return Ok(self.primary.clone()),
            Err(e) => e,
        };

        let Some(fallback) = &self.fallback else {
            return Err(primary_error);
        };
        warn!(
            "Cannot write {}: {}, using {}",
            self.primary.display(),
            primary_error,
            fallback.display()
        );
        Self::write(fallback, &json)?;
        Ok(fallback.clone())
    }

    fn read(path: &Path) -> Result<Option<RegisteredSensors>, DiscoveryError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(DiscoveryError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        let state = serde_json::from_slice(&bytes).map_err(|e| DiscoveryError::Corrupt {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        debug!("Loaded registered sensors from {}", path.display());
        Ok(Some(state))
    }

    /// Writes through a temporary file so a crash never leaves half a record.
    fn write(path: &Path, json: &[u8]) -> Result<(), DiscoveryError> {
        let io_err = |source| DiscoveryError::Io {
            path: path.display().to_string(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(io_err)?;
        fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use tempfile::tempdir;

    use super::*;

    fn record(ids: &[&str]) -> RegisteredSensors {
        RegisteredSensors {
            sensors: ids.iter().map(|s| s.to_string()).collect(),
            kinds: BTreeMap::new(),
        }
    }

    #[test]
    fn test_round_trip_and_format() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state/registered.json")).with_fallback(None);

        let mut kinds = BTreeMap::new();
        kinds.insert("a".to_string(), EntityKind::Sensor);
        kinds.insert("b".to_string(), EntityKind::BinarySensor);
        let state = RegisteredSensors::from_map(&kinds);

        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap(), Some(state));

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(store.primary()).unwrap()).unwrap();
        assert_eq!(raw["sensors"], serde_json::json!(["a", "b"]));
        assert_eq!(raw["kinds"]["b"], "binary_sensor");
    }

    #[test]
    fn test_reads_file_without_kinds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registered.json");
        fs::write(&path, r#"{"sensors": ["x", "y"]}"#).unwrap();

        let state = StateStore::new(&path).with_fallback(None).load().unwrap().unwrap();
        assert_eq!(state, record(&["x", "y"]));
        assert_eq!(state.kind_of("x"), None);
    }

    #[test]
    fn test_missing_everywhere_is_none() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("a.json"))
            .with_fallback(Some(dir.path().join("b.json")));
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registered.json");
        fs::write(&path, "{not json").unwrap();
        let err = StateStore::new(&path).with_fallback(None).load().unwrap_err();
        assert!(matches!(err, DiscoveryError::Corrupt { .. }));
    }

    #[test]
    fn test_record_written_to_fallback_wins_over_stale_primary() {
        let dir = tempdir().unwrap();
        let primary = dir.path().join("primary.json");
        fs::write(&primary, r#"{"sensors": []}"#).unwrap();
        // readable, but every write through the temporary file fails
        fs::create_dir(dir.path().join("primary.json.tmp")).unwrap();

        let fallback = dir.path().join("user/registered.json");
        let store = StateStore::new(&primary).with_fallback(Some(fallback.clone()));

        assert_eq!(store.save(&record(&["a", "x"])).unwrap(), fallback);
        assert_eq!(store.load().unwrap(), Some(record(&["a", "x"])));
        assert_eq!(
            StateStore::new(&primary).with_fallback(None).load().unwrap(),
            Some(record(&[]))
        );
    }

    #[test]
    fn test_newer_primary_wins_over_old_fallback() {
        let dir = tempdir().unwrap();
        let fallback = dir.path().join("fallback.json");
        fs::write(&fallback, r#"{"sensors": ["old"]}"#).unwrap();
        let primary = dir.path().join("primary.json");
        let store = StateStore::new(&primary).with_fallback(Some(fallback));

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(store.save(&record(&["new"])).unwrap(), primary);
        assert_eq!(store.load().unwrap(), Some(record(&["new"])));
    }

    #[test]
    fn test_unwritable_primary_falls_back() {
        let dir = tempdir().unwrap();
        let locked = dir.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o500)).unwrap();

        // root ignores directory permissions
        if fs::write(locked.join("write_check"), "").is_ok() {
            return;
        }

        let fallback = dir.path().join("user/registered.json");
        let store = StateStore::new(locked.join("registered.json"))
            .with_fallback(Some(fallback.clone()));

        let written = store.save(&record(&["a"])).unwrap();
        assert_eq!(written, fallback);
        assert_eq!(store.load().unwrap(), Some(record(&["a"])));

        fs::set_permissions(&locked, fs::Permissions::from_mode(0o700)).unwrap();
    }
}
