//! The `.index` file of a managed directory.
//!
//! An index maps child names to attribute mappings; `"."` holds the
//! directory's own attributes. The file is JSON text in UTF-8 and is always
//! replaced atomically (write to a temporary sibling, then rename over).

use crate::error::{AppResult, DaqError};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Attribute mapping attached to a directory or file.
pub type Attributes = Map<String, Value>;

/// Name of the index file inside a managed directory.
pub const INDEX_FILE: &str = ".index";

/// Temporary file used for atomic index replacement.
const INDEX_TMP: &str = ".index.tmp";

/// Reserved key: creation time in float seconds since the epoch.
pub const TIMESTAMP_KEY: &str = "__timestamp__";

/// Reserved key: name of the filetype adapter that wrote the file.
pub const OBJECT_TYPE_KEY: &str = "__object_type__";

/// Key of the directory's own entry.
pub const SELF_KEY: &str = ".";

/// In-memory contents of a `.index` file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Index {
    entries: BTreeMap<String, Attributes>,
}

impl Index {
    /// Fresh index whose `"."` entry holds `info`.
    pub fn with_dir_info(info: Attributes) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(SELF_KEY.to_string(), info);
        Self { entries }
    }

    /// Path of the index file for `dir`.
    pub fn path_for(dir: &Path) -> PathBuf {
        dir.join(INDEX_FILE)
    }

    /// True when `name` is one of the store's own bookkeeping files.
    pub fn is_reserved_name(name: &str) -> bool {
        name == INDEX_FILE || name == INDEX_TMP
    }

    /// Load the index of `dir`; `Ok(None)` when the directory is unmanaged.
    ///
    /// Parse failures surface as [`DaqError::CorruptIndex`]; the damaged file
    /// is left untouched.
    pub fn load(dir: &Path) -> AppResult<Option<Self>> {
        let path = Self::path_for(dir);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                return Err(DaqError::CorruptIndex {
                    path: dir.to_path_buf(),
                    detail: e.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let entries: BTreeMap<String, Attributes> =
            serde_json::from_str(&text).map_err(|e| DaqError::CorruptIndex {
                path: dir.to_path_buf(),
                detail: e.to_string(),
            })?;
        Ok(Some(Self { entries }))
    }

    /// Atomically replace the index file of `dir`.
    pub fn save(&self, dir: &Path) -> AppResult<()> {
        let tmp = dir.join(INDEX_TMP);
        {
            let mut file = File::create(&tmp)?;
            serde_json::to_writer_pretty(&mut file, &self.entries)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
        }
        fs::rename(&tmp, Self::path_for(dir))?;
        Ok(())
    }

    /// Attributes of `name`, if indexed.
    pub fn get(&self, name: &str) -> Option<&Attributes> {
        self.entries.get(name)
    }

    /// True when `name` has an entry.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Attributes of `name`, created empty when absent.
    pub fn entry_mut(&mut self, name: &str) -> &mut Attributes {
        self.entries.entry(name.to_string()).or_default()
    }

    /// Replace the entry for `name`.
    pub fn insert(&mut self, name: &str, attrs: Attributes) {
        self.entries.insert(name.to_string(), attrs);
    }

    /// Remove and return the entry for `name`.
    pub fn remove(&mut self, name: &str) -> Option<Attributes> {
        self.entries.remove(name)
    }

    /// Shallow-merge `info` into the entry for `name`.
    pub fn merge(&mut self, name: &str, info: &Attributes) {
        let entry = self.entry_mut(name);
        for (k, v) in info {
            entry.insert(k.clone(), v.clone());
        }
    }

    /// Creation timestamp of `name`.
    pub fn timestamp(&self, name: &str) -> Option<f64> {
        self.get(name)
            .and_then(|a| a.get(TIMESTAMP_KEY))
            .and_then(Value::as_f64)
    }

    /// The directory's own attributes.
    pub fn dir_info(&self) -> Attributes {
        self.get(SELF_KEY).cloned().unwrap_or_default()
    }

    /// Child names (everything except `"."`).
    pub fn children(&self) -> impl Iterator<Item = &str> {
        self.entries
            .keys()
            .map(String::as_str)
            .filter(|k| *k != SELF_KEY)
    }
}
