//! User aspect-ratio overrides
//!
//! A small TOML file mapping title keys to the ratio the user picked from
//! the override menu. Every read goes to disk so a write is visible to the
//! next read, including reads from another process (`lensmem override`).
//! Writes go through a temporary file and a rename.

use crate::aspect::AspectRatio;
use crate::error::StoreError;
use crate::title::TitleKey;
use chrono::Local;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct OverrideFile {
    overrides: BTreeMap<TitleKey, AspectRatio>,
    /// When each override was last written (RFC 3339)
    updated: BTreeMap<TitleKey, String>,
}

/// One stored override
#[derive(Debug, Clone, PartialEq)]
pub struct OverrideEntry {
    pub key: TitleKey,
    pub ratio: AspectRatio,
    pub updated: Option<String>,
}

pub struct OverrideStore {
    path: PathBuf,
}

impl OverrideStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<OverrideFile, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(OverrideFile::default()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        toml::from_str(&content).map_err(|source| StoreError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn write(&self, file: &OverrideFile) -> Result<(), StoreError> {
        let content = toml::to_string_pretty(file)?;
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = self.path.with_extension("toml.tmp");
        fs::write(&tmp, content).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)
    }

    pub fn get(&self, key: &TitleKey) -> Result<Option<AspectRatio>, StoreError> {
        Ok(self.read()?.overrides.get(key).copied())
    }

    pub fn set(&self, key: &TitleKey, ratio: AspectRatio) -> Result<(), StoreError> {
        let mut file = self.read()?;
        file.overrides.insert(key.clone(), ratio);
        file.updated.insert(key.clone(), Local::now().to_rfc3339());
        self.write(&file)?;
        info!("Saved override for {}: {}", key, ratio);
        Ok(())
    }

    /// Remove an override; returns whether one existed
    pub fn clear(&self, key: &TitleKey) -> Result<bool, StoreError> {
        let mut file = self.read()?;
        let existed = file.overrides.remove(key).is_some();
        file.updated.remove(key);
        if existed {
            self.write(&file)?;
            info!("Cleared override for {}", key);
        }
        Ok(existed)
    }

    pub fn list(&self) -> Result<Vec<OverrideEntry>, StoreError> {
        let file = self.read()?;
        Ok(file
            .overrides
            .iter()
            .map(|(key, ratio)| OverrideEntry {
                key: key.clone(),
                ratio: *ratio,
                updated: file.updated.get(key).cloned(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::title::Title;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = OverrideStore::new(dir.path().join("overrides.toml"));
        let key = Title::named("Movie A").key;

        assert_eq!(store.get(&key).unwrap(), None);
        assert!(store.list().unwrap().is_empty());
        assert!(!store.clear(&key).unwrap());
    }

    #[test]
    fn test_set_get_clear() {
        let dir = tempdir().unwrap();
        let store = OverrideStore::new(dir.path().join("nested").join("overrides.toml"));
        let key = Title::new("The Matrix", Some(1999), Some("tt0133093"), None).key;

        store.set(&key, AspectRatio::Scope).unwrap();
        assert_eq!(store.get(&key).unwrap(), Some(AspectRatio::Scope));

        store.set(&key, AspectRatio::Other(240)).unwrap();
        assert_eq!(store.get(&key).unwrap(), Some(AspectRatio::Other(240)));

        let entries = store.list().unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].updated.is_some());

        assert!(store.clear(&key).unwrap());
        assert_eq!(store.get(&key).unwrap(), None);
    }

    #[test]
    fn test_writes_visible_to_other_instances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("overrides.toml");
        let writer = OverrideStore::new(&path);
        let reader = OverrideStore::new(&path);
        let key = Title::new("Show", None, None, Some(7)).key;

        writer.set(&key, AspectRatio::Flat).unwrap();
        assert_eq!(reader.get(&key).unwrap(), Some(AspectRatio::Flat));
    }

    #[test]
    fn test_file_format() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("overrides.toml");
        fs::write(
            &path,
            "[overrides]\n\"movie/tt0133093\" = \"2.39\"\n\"tvshow/7\" = \"1.85\"\n",
        )
        .unwrap();

        let store = OverrideStore::new(&path);
        assert_eq!(
            store.get(&TitleKey::from_user("tt0133093")).unwrap(),
            Some(AspectRatio::Other(239))
        );
        assert_eq!(
            store.get(&TitleKey::from_user("tvshow/7")).unwrap(),
            Some(AspectRatio::Flat)
        );
    }

    #[test]
    fn test_corrupt_file_reports_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("overrides.toml");
        fs::write(&path, "[overrides\n").unwrap();

        let store = OverrideStore::new(&path);
        assert!(matches!(
            store.get(&TitleKey::from_user("x")),
            Err(StoreError::Parse { .. })
        ));
    }
}
