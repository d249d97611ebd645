//! Directory and file handles.
//!
//! Handles are cheap clones of one cached record per path; two handles for
//! the same path compare equal by identity. Every operation first checks the
//! record has not been deleted.

use super::index::{Attributes, Index, OBJECT_TYPE_KEY, SELF_KEY, TIMESTAMP_KEY};
use super::log::{self as store_log, LogEntry};
use super::{split, validate_name, HandleInner, StoreInner};
use crate::data::registry::MetaArrayFile;
use crate::data::{DataObject, FileTypeRegistry, MetaArray};
use crate::error::{AppResult, DaqError};
use serde_json::Value;
use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

macro_rules! common_handle_methods {
    () => {
        /// Current absolute path.
        pub fn path(&self) -> PathBuf {
            self.inner.path()
        }

        /// Final path component.
        pub fn name(&self) -> String {
            self.inner
                .path()
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        }

        /// True unless deleted through the store or removed behind its back.
        pub fn exists(&self) -> bool {
            !self.inner.is_deleted() && self.inner.path().exists()
        }

        /// True once deleted through the store.
        pub fn is_deleted(&self) -> bool {
            self.inner.is_deleted()
        }

        /// Identity comparison: both handles are the same cached record.
        pub fn same_handle(&self, other: &Self) -> bool {
            Arc::ptr_eq(&self.inner, &other.inner)
        }

        /// Handle of the containing directory.
        pub fn parent(&self) -> AppResult<DirHandle> {
            let path = self.inner.checked_path()?;
            let store = self.inner.store()?;
            let (parent, _) = split(&path)?;
            Ok(DirHandle::new(store.handle_for(parent, true)))
        }

        /// True when this entry lies anywhere below `dir`.
        pub fn is_grandchild_of(&self, dir: &DirHandle) -> bool {
            let path = self.inner.path();
            let dir = dir.path();
            path != dir && path.starts_with(dir)
        }

        /// Path relative to `dir`, if this entry lies below it.
        pub fn relative_to(&self, dir: &DirHandle) -> Option<PathBuf> {
            self.inner
                .path()
                .strip_prefix(dir.path())
                .ok()
                .map(Path::to_path_buf)
        }

        /// Rename within the same directory. Cached handles below this entry
        /// follow the new path.
        pub fn rename(&self, new_name: &str) -> AppResult<()> {
            validate_name(new_name)?;
            let path = self.inner.checked_path()?;
            let (parent, _) = split(&path)?;
            self.inner.store()?.relocate(&self.inner, parent.join(new_name))
        }

        /// Move into `dir`, keeping the name.
        pub fn move_to(&self, dir: &DirHandle) -> AppResult<()> {
            let path = self.inner.checked_path()?;
            let target = dir.inner.checked_path()?;
            let (_, name) = split(&path)?;
            self.inner.store()?.relocate(&self.inner, target.join(name))
        }
    };
}

/// Handle to a directory in the store.
#[derive(Clone)]
pub struct DirHandle {
    inner: Arc<HandleInner>,
}

impl PartialEq for DirHandle {
    fn eq(&self, other: &Self) -> bool {
        self.same_handle(other)
    }
}

impl std::fmt::Debug for DirHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DirHandle({})", self.inner.path().display())
    }
}

impl DirHandle {
    pub(super) fn new(inner: Arc<HandleInner>) -> Self {
        Self { inner }
    }

    common_handle_methods!();

    fn context(&self) -> AppResult<(Arc<StoreInner>, PathBuf)> {
        let path = self.inner.checked_path()?;
        Ok((self.inner.store()?, path))
    }

    /// True when the directory has an index.
    pub fn is_managed(&self) -> bool {
        Index::path_for(&self.inner.path()).exists()
    }

    /// Give an unmanaged directory an empty index.
    pub fn create_index(&self) -> AppResult<()> {
        let (store, path) = self.context()?;
        store.update_index(&path, true, |_| ())?;
        Ok(())
    }

    /// Child names, ordered by creation timestamp and then by name.
    ///
    /// Entries without a timestamp sort last. The index file, the log file
    /// and files still being written are not listed.
    pub fn ls(&self) -> AppResult<Vec<String>> {
        let (store, path) = self.context()?;
        let mut names = Vec::new();
        for entry in fs::read_dir(&path)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if Index::is_reserved_name(&name)
                || name == store_log::LOG_FILE
                || store.is_pending(&path.join(&name))
            {
                continue;
            }
            names.push(name);
        }
        let index = store.index(&path)?;
        let stamp = |name: &str| index.as_ref().and_then(|i| i.timestamp(name));
        names.sort_by(|a, b| match (stamp(a), stamp(b)) {
            (Some(x), Some(y)) => x.total_cmp(&y).then_with(|| a.cmp(b)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => a.cmp(b),
        });
        Ok(names)
    }

    /// Child directories in [`ls`](Self::ls) order.
    pub fn subdirs(&self) -> AppResult<Vec<DirHandle>> {
        let path = self.inner.checked_path()?;
        self.ls()?
            .into_iter()
            .filter(|name| path.join(name).is_dir())
            .map(|name| self.get_dir(&name, false))
            .collect()
    }

    /// True when `name` exists in this directory.
    pub fn exists_child(&self, name: &str) -> bool {
        self.inner.path().join(name).exists()
    }

    /// Create a sub-directory.
    ///
    /// With `auto_increment`, the name becomes `name_NNN` with NNN one more
    /// than the largest suffix already used (starting at `000`). The creation
    /// timestamp is written both to the parent's entry and to the new
    /// directory's own `"."` entry, together with `info`.
    pub fn mkdir(&self, name: &str, auto_increment: bool, info: Attributes) -> AppResult<DirHandle> {
        validate_name(name)?;
        let (store, path) = self.context()?;
        let _guard = store.lock.lock();

        let child = if auto_increment {
            let taken = store.known_names(&path)?;
            let next = next_suffix(taken.iter().map(String::as_str), name, "");
            format!("{}_{:03}", name, next)
        } else {
            name.to_string()
        };
        let child_path = path.join(&child);
        if child_path.exists() {
            return Err(DaqError::AlreadyExists(child_path));
        }

        fs::create_dir(&child_path)?;
        let ts = store.next_timestamp();
        let mut own = info;
        own.insert(TIMESTAMP_KEY.to_string(), Value::from(ts));
        let registered = store
            .update_index(&child_path, true, |index| index.merge(SELF_KEY, &own))
            .and_then(|_| {
                store.update_index(&path, true, |index| {
                    index
                        .entry_mut(&child)
                        .insert(TIMESTAMP_KEY.to_string(), Value::from(ts));
                })
            });
        if let Err(e) = registered {
            let _ = fs::remove_dir_all(&child_path);
            store.with_state(|state| state.forget(&child_path));
            return Err(e);
        }

        tracing::debug!(dir = %child_path.display(), "Created directory");
        Ok(DirHandle::new(store.handle_for(child_path, true)))
    }

    /// Handle for a child directory, created (with a timestamp) when missing
    /// and `create` is set.
    pub fn get_dir(&self, name: &str, create: bool) -> AppResult<DirHandle> {
        let (store, path) = self.context()?;
        let child = path.join(name);
        if child.is_dir() {
            return Ok(DirHandle::new(store.handle_for(child, true)));
        }
        if create && !child.exists() {
            return self.mkdir(name, false, Attributes::new());
        }
        Err(DaqError::NotADirectory(child))
    }

    /// Handle for an existing child file.
    pub fn get_file(&self, name: &str) -> AppResult<FileHandle> {
        let (store, path) = self.context()?;
        let child = path.join(name);
        if child.is_dir() {
            return Err(DaqError::NotAFile(child));
        }
        if !child.exists() {
            return Err(DaqError::NotFound(child));
        }
        Ok(FileHandle::new(store.handle_for(child, false)))
    }

    /// The directory's own attributes (its `"."` entry).
    pub fn info(&self) -> AppResult<Attributes> {
        let (store, path) = self.context()?;
        Ok(store
            .index(&path)?
            .map(|index| index.dir_info())
            .unwrap_or_default())
    }

    /// Merge `info` into the directory's own attributes, creating the index
    /// if needed.
    pub fn set_info(&self, info: Attributes) -> AppResult<()> {
        let (store, path) = self.context()?;
        store.update_index(&path, true, |index| index.merge(SELF_KEY, &info))?;
        Ok(())
    }

    /// Index entry of a child; empty when the child is not indexed.
    pub fn info_for(&self, name: &str) -> AppResult<Attributes> {
        let (store, path) = self.context()?;
        Ok(store
            .index(&path)?
            .and_then(|index| index.get(name).cloned())
            .unwrap_or_default())
    }

    /// Merge `info` into the index entry of an existing child.
    pub fn set_child_info(&self, name: &str, info: Attributes) -> AppResult<()> {
        let (store, path) = self.context()?;
        if !path.join(name).exists() {
            return Err(DaqError::NotFound(path.join(name)));
        }
        store.update_index(&path, true, |index| index.merge(name, &info))?;
        Ok(())
    }

    /// Persist `obj` as a new file through the filetype registry.
    ///
    /// The name is reserved under the store lock, the body is written and
    /// flushed outside it, and only then is the index entry (carrying
    /// `__object_type__` and `__timestamp__` plus `info`) added. A failed
    /// write leaves neither a file nor an entry behind.
    pub fn write_file(
        &self,
        obj: &DataObject,
        name: &str,
        info: Attributes,
        auto_increment: bool,
    ) -> AppResult<FileHandle> {
        validate_name(name)?;
        let (store, path) = self.context()?;
        let adapter = store.registry.writer_for(obj)?;
        let file_name = FileTypeRegistry::file_name_for(adapter.as_ref(), name);

        let (file_name, target) = {
            let _guard = store.lock.lock();
            let file_name = if auto_increment {
                let (stem, ext) = split_extension(&file_name);
                let taken = store.known_names(&path)?;
                let next = next_suffix(taken.iter().map(String::as_str), stem, ext);
                format!("{}_{:04}{}", stem, next, ext)
            } else {
                file_name
            };
            let target = path.join(&file_name);
            if target.exists() || store.is_pending(&target) {
                return Err(DaqError::AlreadyExists(target));
            }
            store.with_state(|state| state.pending.insert(target.clone()));
            (file_name, target)
        };

        let written = adapter.write(obj, &target);
        let _guard = store.lock.lock();
        store.with_state(|state| state.pending.remove(&target));
        let extra = match written {
            Ok(extra) => extra,
            Err(e) => {
                let _ = fs::remove_file(&target);
                return Err(e);
            }
        };

        let ts = store.next_timestamp();
        let mut entry = info;
        entry.extend(extra);
        entry.insert(OBJECT_TYPE_KEY.to_string(), Value::from(adapter.name()));
        entry.insert(TIMESTAMP_KEY.to_string(), Value::from(ts));
        if let Err(e) = store.update_index(&path, true, |index| index.insert(&file_name, entry)) {
            let _ = fs::remove_file(&target);
            return Err(e);
        }

        tracing::debug!(file = %target.display(), filetype = adapter.name(), "Wrote file");
        Ok(FileHandle::new(store.handle_for(target, false)))
    }

    /// Persist any result: groups become a sub-directory holding one entry
    /// per member, everything else goes through [`write_file`](Self::write_file).
    pub fn write_object(&self, obj: &DataObject, name: &str, info: Attributes) -> AppResult<Handle> {
        match obj {
            DataObject::Group(members) => {
                let dir = self.mkdir(name, false, info)?;
                for (member, value) in members {
                    dir.write_object(value, member, Attributes::new())?;
                }
                Ok(Handle::Dir(dir))
            }
            other => self
                .write_file(other, name, info, false)
                .map(Handle::File),
        }
    }

    /// Adopt a file that was created outside the store into the index.
    ///
    /// The entry's timestamp is the file's modification time unless `info`
    /// supplies one.
    pub fn add_file(&self, name: &str, info: Attributes) -> AppResult<FileHandle> {
        let (store, path) = self.context()?;
        let target = path.join(name);
        if target.is_dir() {
            return Err(DaqError::NotAFile(target));
        }
        if !target.exists() {
            return Err(DaqError::NotFound(target));
        }
        let object_type = store.registry.reader_for(&target).ok().map(|a| a.name());
        let ts = fs::metadata(&target)?
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs_f64())
            .unwrap_or_else(|| store.next_timestamp());
        let _guard = store.lock.lock();
        store.update_index(&path, true, |index| {
            let fresh = !index.contains(name);
            let entry = index.entry_mut(name);
            if fresh {
                entry.insert(TIMESTAMP_KEY.to_string(), Value::from(ts));
                if let Some(object_type) = object_type {
                    entry.insert(OBJECT_TYPE_KEY.to_string(), Value::from(object_type));
                }
            }
            for (k, v) in info {
                entry.insert(k, v);
            }
        })?;
        Ok(FileHandle::new(store.handle_for(target, false)))
    }

    /// Append samples along axis 0 of a MetaArray file, creating it on first use.
    pub fn append_file(&self, data: &MetaArray, name: &str) -> AppResult<FileHandle> {
        let (store, path) = self.context()?;
        let file_name = FileTypeRegistry::file_name_for(&MetaArrayFile, name);
        let target = path.join(&file_name);
        if !target.exists() {
            return self.write_file(&DataObject::Array(data.clone()), name, Attributes::new(), false);
        }
        let lock = store.log_lock(&target);
        let _held = lock.lock();
        MetaArray::append_to(&target, data)?;
        Ok(FileHandle::new(store.handle_for(target, false)))
    }

    /// Append a record to this directory's `log.txt`.
    pub fn log_msg(&self, message: &str, tags: Attributes) -> AppResult<()> {
        let (store, path) = self.context()?;
        let entry = LogEntry::new(store.next_timestamp(), message, tags);
        let lock = store.log_lock(&path);
        let _held = lock.lock();
        store_log::append_entry(&path, &entry)
    }

    /// All records of this directory's `log.txt`.
    pub fn read_log(&self) -> AppResult<Vec<LogEntry>> {
        let (store, path) = self.context()?;
        let lock = store.log_lock(&path);
        let _held = lock.lock();
        store_log::read_entries(&path)
    }

    /// Delete the directory. A directory with children is only removed when
    /// `recursive` is set.
    pub fn delete(&self, recursive: bool) -> AppResult<()> {
        self.inner.store()?.remove(&self.inner, recursive)
    }
}

/// Handle to a file in the store.
#[derive(Clone)]
pub struct FileHandle {
    inner: Arc<HandleInner>,
}

impl PartialEq for FileHandle {
    fn eq(&self, other: &Self) -> bool {
        self.same_handle(other)
    }
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FileHandle({})", self.inner.path().display())
    }
}

impl FileHandle {
    pub(super) fn new(inner: Arc<HandleInner>) -> Self {
        Self { inner }
    }

    common_handle_methods!();

    /// The file's entry in its parent's index; empty when not indexed.
    pub fn info(&self) -> AppResult<Attributes> {
        self.parent()?.info_for(&self.name())
    }

    /// Merge `info` into the file's index entry.
    pub fn set_info(&self, info: Attributes) -> AppResult<()> {
        self.parent()?.set_child_info(&self.name(), info)
    }

    /// Name of the filetype recorded when the file was written, or of the
    /// reader the registry picks for an unindexed file.
    pub fn file_type(&self) -> AppResult<Option<String>> {
        if let Some(name) = self.info()?.get(OBJECT_TYPE_KEY).and_then(Value::as_str) {
            return Ok(Some(name.to_string()));
        }
        let path = self.inner.checked_path()?;
        Ok(self
            .inner
            .store()?
            .registry
            .reader_for(&path)
            .ok()
            .map(|a| a.name().to_string()))
    }

    /// Load the stored object.
    ///
    /// The recorded filetype is preferred; otherwise the registry picks a
    /// reader by extension and magic bytes.
    pub fn read(&self) -> AppResult<DataObject> {
        let path = self.inner.checked_path()?;
        let store = self.inner.store()?;
        let info = self.info()?;
        let adapter = match info
            .get(OBJECT_TYPE_KEY)
            .and_then(Value::as_str)
            .and_then(|name| store.registry.get(name))
        {
            Some(adapter) => adapter,
            None => store.registry.reader_for(&path)?,
        };
        adapter.read(&path, &info)
    }

    /// Replace the file body with `obj`, keeping the creation timestamp.
    pub fn write(&self, obj: &DataObject) -> AppResult<()> {
        let path = self.inner.checked_path()?;
        let store = self.inner.store()?;
        let adapter = store.registry.writer_for(obj)?;
        let extra = adapter.write(obj, &path)?;
        let (parent, name) = split(&path)?;
        store.update_index(&parent, true, |index| {
            let entry = index.entry_mut(&name);
            entry.extend(extra);
            entry.insert(OBJECT_TYPE_KEY.to_string(), Value::from(adapter.name()));
        })?;
        Ok(())
    }

    /// Delete the file and its index entry.
    pub fn delete(&self) -> AppResult<()> {
        self.inner.store()?.remove(&self.inner, false)
    }
}

/// Either kind of handle.
#[derive(Debug, Clone, PartialEq)]
pub enum Handle {
    /// Directory
    Dir(DirHandle),
    /// File
    File(FileHandle),
}

impl Handle {
    /// Current absolute path.
    pub fn path(&self) -> PathBuf {
        match self {
            Handle::Dir(d) => d.path(),
            Handle::File(f) => f.path(),
        }
    }

    /// Final path component.
    pub fn name(&self) -> String {
        match self {
            Handle::Dir(d) => d.name(),
            Handle::File(f) => f.name(),
        }
    }

    /// Attributes of the entry.
    pub fn info(&self) -> AppResult<Attributes> {
        match self {
            Handle::Dir(d) => d.info(),
            Handle::File(f) => f.info(),
        }
    }

    /// The directory, if this is one.
    pub fn as_dir(&self) -> Option<&DirHandle> {
        match self {
            Handle::Dir(d) => Some(d),
            Handle::File(_) => None,
        }
    }

    /// The file, if this is one.
    pub fn as_file(&self) -> Option<&FileHandle> {
        match self {
            Handle::File(f) => Some(f),
            Handle::Dir(_) => None,
        }
    }
}

/// Split `name.ext` into (`name`, `.ext`); names without extension keep an
/// empty second half.
fn split_extension(file_name: &str) -> (&str, &str) {
    let path = Path::new(file_name);
    match (path.file_stem().and_then(|s| s.to_str()), path.extension()) {
        (Some(stem), Some(_)) if !stem.is_empty() => file_name.split_at(stem.len()),
        _ => (file_name, ""),
    }
}

/// One more than the largest numeric suffix among `stem_<digits><ext>`
/// names, or 0 when there is none.
fn next_suffix<'a>(names: impl Iterator<Item = &'a str>, stem: &str, ext: &str) -> u64 {
    names
        .filter_map(|name| {
            let digits = name
                .strip_prefix(stem)?
                .strip_prefix('_')?
                .strip_suffix(ext)?;
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            digits.parse::<u64>().ok()
        })
        .max()
        .map_or(0, |n| n + 1)
}
