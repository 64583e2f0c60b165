//! Where the decision-engine API key comes from.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};

pub trait CredentialStore: Send + Sync {
    /// Returns `true` when the value was persisted.
    fn save(&self, key: &str, value: &str) -> bool;
    fn load(&self, key: &str) -> Option<String>;
}

/// JSON map on disk, by default under the user's config directory.
pub struct FileCredentialStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn in_config_dir() -> Result<Self> {
        let dir = dirs::config_dir().context("no config directory on this platform")?;
        Ok(Self::new(dir.join("goal-pilot").join("credentials.json")))
    }

    fn read_map(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let file = std::fs::File::open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        let map = serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("parsing {}", self.path.display()))?;
        Ok(map)
    }

    fn write_map(&self, map: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(&self.path)
            .with_context(|| format!("creating {}", self.path.display()))?;
        let mut writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, map)?;
        writer
            .flush()
            .with_context(|| format!("writing {}", self.path.display()))?;
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn save(&self, key: &str, value: &str) -> bool {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let result = self.read_map().and_then(|mut map| {
            map.insert(key.to_string(), value.to_string());
            self.write_map(&map)
        });
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("failed to save credential '{key}': {e:#}");
                false
            }
        }
    }

    fn load(&self, key: &str) -> Option<String> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        match self.read_map() {
            Ok(map) => map.get(key).cloned().filter(|v| !v.is_empty()),
            Err(e) => {
                tracing::warn!("failed to read credentials: {e:#}");
                None
            }
        }
    }
}

/// Read-only lookup of `KEY_NAME` in the process environment.
#[derive(Default)]
pub struct EnvCredentialStore;

impl CredentialStore for EnvCredentialStore {
    fn save(&self, _key: &str, _value: &str) -> bool {
        false
    }

    fn load(&self, key: &str) -> Option<String> {
        std::env::var(key.to_uppercase())
            .ok()
            .filter(|v| !v.trim().is_empty())
    }
}

/// Loads from the first store that has the key; saves into the first one that accepts it.
pub struct LayeredCredentialStore {
    layers: Vec<Box<dyn CredentialStore>>,
}

impl LayeredCredentialStore {
    pub fn new(layers: Vec<Box<dyn CredentialStore>>) -> Self {
        Self { layers }
    }
}

impl CredentialStore for LayeredCredentialStore {
    fn save(&self, key: &str, value: &str) -> bool {
        self.layers.iter().any(|layer| layer.save(key, value))
    }

    fn load(&self, key: &str) -> Option<String> {
        self.layers.iter().find_map(|layer| layer.load(key))
    }
}

/// In-process store; used when nothing should touch disk.
#[derive(Default)]
pub struct MemoryCredentialStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl CredentialStore for MemoryCredentialStore {
    fn save(&self, key: &str, value: &str) -> bool {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
        true
    }

    fn load(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("goal-pilot-test-{}-{name}", std::process::id()))
            .join("credentials.json")
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn write_failures_surface_instead_of_being_dropped() {
        // /dev/full accepts the open but fails every flushed write.
        if !std::path::Path::new("/dev/full").exists() {
            return;
        }
        let store = FileCredentialStore::new("/dev/full");
        let mut map = BTreeMap::new();
        map.insert("gemini_api_key".to_string(), "abc".to_string());
        assert!(store.write_map(&map).is_err());
    }

    #[test]
    fn file_store_round_trips_and_keeps_other_keys() {
        let path = temp_path("file");
        let _ = std::fs::remove_file(&path);
        let store = FileCredentialStore::new(&path);

        assert_eq!(store.load("gemini_api_key"), None);
        assert!(store.save("gemini_api_key", "abc"));
        assert!(store.save("other", "xyz"));
        assert_eq!(store.load("gemini_api_key").as_deref(), Some("abc"));
        assert_eq!(store.load("other").as_deref(), Some("xyz"));

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn layered_store_falls_through_and_saves_to_first_writable() {
        let store = LayeredCredentialStore::new(vec![
            Box::new(EnvCredentialStore),
            Box::new(MemoryCredentialStore::default()),
        ]);
        let key = "goal_pilot_layered_test_key_that_is_not_in_env";
        assert_eq!(store.load(key), None);
        assert!(store.save(key, "secret"));
        assert_eq!(store.load(key).as_deref(), Some("secret"));
    }
}
