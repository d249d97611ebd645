//! Hierarchical experiment data store.
//!
//! The store is a tree of ordinary directories. A directory becomes
//! *managed* once it holds a `.index` file; managed directories record a
//! creation timestamp and arbitrary attributes for themselves and for each
//! child, and list their children in creation order.
//!
//! All access goes through [`DataStore`], which hands out one canonical
//! [`DirHandle`] or [`FileHandle`] per path. The handle cache and index
//! bookkeeping share a single re-entrant lock; bulk file bodies are written
//! outside that lock so a large write in one directory does not stall
//! bookkeeping elsewhere. Renames and moves rewrite the paths of every cached
//! descendant handle in place, so handles held by other components stay
//! valid. The cache only holds weak references: a path's record lives as long
//! as some component holds a handle to it.

pub mod handle;
pub mod index;
pub mod log;

pub use self::handle::{DirHandle, FileHandle, Handle};
pub use self::index::{Attributes, Index, OBJECT_TYPE_KEY, TIMESTAMP_KEY};
pub use self::log::LogEntry;

use crate::data::FileTypeRegistry;
use crate::error::{AppResult, DaqError};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

/// Shared state behind one cached handle.
pub(crate) struct HandleInner {
    path: RwLock<PathBuf>,
    is_dir: bool,
    deleted: AtomicBool,
    store: Weak<StoreInner>,
}

impl HandleInner {
    fn path(&self) -> PathBuf {
        self.path.read().clone()
    }

    fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Current path, or [`DaqError::Deleted`].
    fn checked_path(&self) -> AppResult<PathBuf> {
        let path = self.path();
        if self.is_deleted() {
            return Err(DaqError::Deleted(path));
        }
        Ok(path)
    }

    fn store(&self) -> AppResult<Arc<StoreInner>> {
        self.store
            .upgrade()
            .ok_or_else(|| DaqError::InvalidState("data store has been dropped".to_string()))
    }
}

#[derive(Default)]
struct StoreState {
    handles: HashMap<PathBuf, Weak<HandleInner>>,
    indexes: HashMap<PathBuf, Index>,
    /// Files whose names are reserved while their bodies are being written.
    pending: HashSet<PathBuf>,
    last_timestamp: f64,
}

impl StoreState {
    fn next_timestamp(&mut self) -> f64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        let ts = now.max(self.last_timestamp + 1e-6);
        self.last_timestamp = ts;
        ts
    }

    /// Move every cached handle and index at or below `old` under `new`.
    fn rebase(&mut self, old: &Path, new: &Path) {
        let moved: Vec<PathBuf> = self
            .handles
            .keys()
            .filter(|p| p.starts_with(old))
            .cloned()
            .collect();
        for path in moved {
            if let Some(handle) = self.handles.remove(&path).and_then(|w| w.upgrade()) {
                let target = rebased(&path, old, new);
                *handle.path.write() = target.clone();
                self.handles.insert(target, Arc::downgrade(&handle));
            }
        }

        let moved: Vec<PathBuf> = self
            .indexes
            .keys()
            .filter(|p| p.starts_with(old))
            .cloned()
            .collect();
        for path in moved {
            if let Some(index) = self.indexes.remove(&path) {
                self.indexes.insert(rebased(&path, old, new), index);
            }
        }
    }

    /// Mark every cached handle at or below `path` deleted and drop it.
    fn forget(&mut self, path: &Path) {
        self.handles.retain(|p, handle| {
            if p.starts_with(path) {
                if let Some(handle) = handle.upgrade() {
                    handle.deleted.store(true, Ordering::Release);
                }
                false
            } else {
                true
            }
        });
        self.indexes.retain(|p, _| !p.starts_with(path));
    }
}

fn rebased(path: &Path, old: &Path, new: &Path) -> PathBuf {
    match path.strip_prefix(old) {
        Ok(rest) if rest.as_os_str().is_empty() => new.to_path_buf(),
        Ok(rest) => new.join(rest),
        Err(_) => path.to_path_buf(),
    }
}

/// Split a path into parent directory and final component.
fn split(path: &Path) -> AppResult<(PathBuf, String)> {
    let parent = path
        .parent()
        .ok_or_else(|| DaqError::InvalidState(format!("{} has no parent", path.display())))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| DaqError::InvalidState(format!("{} has no name", path.display())))?;
    Ok((parent.to_path_buf(), name))
}

/// Reject names that would escape the directory or clash with bookkeeping.
fn validate_name(name: &str) -> AppResult<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || Index::is_reserved_name(name)
        || name == log::LOG_FILE;
    if bad {
        return Err(DaqError::InvalidState(format!("invalid name '{}'", name)));
    }
    Ok(())
}

pub(crate) struct StoreInner {
    lock: ReentrantMutex<RefCell<StoreState>>,
    registry: FileTypeRegistry,
    log_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl StoreInner {
    /// Run `f` on the bookkeeping state. Calls must not nest; compound
    /// operations hold `self.lock` across several calls instead.
    fn with_state<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> R {
        let guard = self.lock.lock();
        let mut state = guard.borrow_mut();
        f(&mut state)
    }

    fn next_timestamp(&self) -> f64 {
        self.with_state(StoreState::next_timestamp)
    }

    /// Canonical handle for `path`, created on first request.
    fn handle_for(self: &Arc<Self>, path: PathBuf, is_dir: bool) -> Arc<HandleInner> {
        let weak = Arc::downgrade(self);
        self.with_state(|state| {
            if let Some(existing) = state.handles.get(&path).and_then(Weak::upgrade) {
                if existing.is_dir == is_dir && !existing.is_deleted() {
                    return existing;
                }
            }
            state.handles.retain(|_, cached| cached.strong_count() > 0);
            let handle = Arc::new(HandleInner {
                path: RwLock::new(path.clone()),
                is_dir,
                deleted: AtomicBool::new(false),
                store: weak,
            });
            state.handles.insert(path, Arc::downgrade(&handle));
            handle
        })
    }

    /// Index of `dir`, loaded and cached on first use.
    fn index(&self, dir: &Path) -> AppResult<Option<Index>> {
        self.with_state(|state| {
            if let Some(index) = state.indexes.get(dir) {
                return Ok(Some(index.clone()));
            }
            let loaded = Index::load(dir)?;
            if let Some(index) = &loaded {
                state.indexes.insert(dir.to_path_buf(), index.clone());
            }
            Ok(loaded)
        })
    }

    /// Apply `f` to the index of `dir` and persist it.
    ///
    /// With `create`, an unmanaged directory gains a fresh index; without it
    /// the call is a no-op returning `None`. The cached copy only changes once
    /// the file has been replaced, so a failed save leaves no trace.
    fn update_index<R>(
        &self,
        dir: &Path,
        create: bool,
        f: impl FnOnce(&mut Index) -> R,
    ) -> AppResult<Option<R>> {
        let _guard = self.lock.lock();
        let mut index = match self.index(dir)? {
            Some(index) => index,
            None if create => Index::with_dir_info(Attributes::new()),
            None => return Ok(None),
        };
        let out = f(&mut index);
        index.save(dir)?;
        self.with_state(|state| state.indexes.insert(dir.to_path_buf(), index));
        Ok(Some(out))
    }

    /// Names present in `dir` on disk, in its index, or reserved for writing.
    fn known_names(&self, dir: &Path) -> AppResult<HashSet<String>> {
        let mut names = HashSet::new();
        for entry in fs::read_dir(dir)? {
            names.insert(entry?.file_name().to_string_lossy().into_owned());
        }
        if let Some(index) = self.index(dir)? {
            names.extend(index.children().map(str::to_string));
        }
        self.with_state(|state| {
            for path in &state.pending {
                if path.parent() == Some(dir) {
                    if let Some(name) = path.file_name() {
                        names.insert(name.to_string_lossy().into_owned());
                    }
                }
            }
        });
        Ok(names)
    }

    fn is_pending(&self, path: &Path) -> bool {
        self.with_state(|state| state.pending.contains(path))
    }

    /// Rename or move the entry behind `handle` to `target`.
    fn relocate(&self, handle: &HandleInner, target: PathBuf) -> AppResult<()> {
        let _guard = self.lock.lock();
        let source = handle.checked_path()?;
        if target == source {
            return Ok(());
        }
        if target.exists() || self.is_pending(&target) {
            return Err(DaqError::AlreadyExists(target));
        }
        if handle.is_dir && target.starts_with(&source) {
            return Err(DaqError::InvalidState(format!(
                "cannot move {} into itself",
                source.display()
            )));
        }
        let (old_parent, old_name) = split(&source)?;
        let (new_parent, new_name) = split(&target)?;
        let entry = self
            .index(&old_parent)?
            .and_then(|index| index.get(&old_name).cloned());

        fs::rename(&source, &target)?;
        self.with_state(|state| state.rebase(&source, &target));

        if let Some(entry) = entry {
            self.update_index(&old_parent, false, |index| {
                index.remove(&old_name);
            })?;
            self.update_index(&new_parent, true, |index| index.insert(&new_name, entry))?;
        }
        tracing::debug!(from = %source.display(), to = %target.display(), "Relocated store entry");
        Ok(())
    }

    /// Delete the entry behind `handle` and invalidate it and its descendants.
    fn remove(&self, handle: &HandleInner, recursive: bool) -> AppResult<()> {
        let _guard = self.lock.lock();
        let path = handle.checked_path()?;
        let (parent, name) = split(&path)?;
        if handle.is_dir {
            if !recursive && has_visible_children(&path)? {
                return Err(DaqError::DirectoryNotEmpty(path));
            }
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
        self.with_state(|state| state.forget(&path));
        self.update_index(&parent, false, |index| {
            index.remove(&name);
        })?;
        tracing::debug!(path = %path.display(), "Deleted store entry");
        Ok(())
    }

    fn log_lock(&self, dir: &Path) -> Arc<Mutex<()>> {
        self.log_locks
            .lock()
            .entry(dir.to_path_buf())
            .or_default()
            .clone()
    }
}

fn has_visible_children(dir: &Path) -> AppResult<bool> {
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if !Index::is_reserved_name(&name) && name != log::LOG_FILE {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Entry point to the data store.
///
/// Cloning is cheap; clones share the handle cache.
#[derive(Clone)]
pub struct DataStore {
    inner: Arc<StoreInner>,
}

impl Default for DataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStore")
            .field("filetypes", &self.inner.registry.names())
            .finish()
    }
}

impl DataStore {
    /// Store using the built-in filetype adapters.
    pub fn new() -> Self {
        Self::with_registry(FileTypeRegistry::with_builtins())
    }

    /// Store using a custom filetype registry.
    pub fn with_registry(registry: FileTypeRegistry) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                lock: ReentrantMutex::new(RefCell::new(StoreState::default())),
                registry,
                log_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The filetype registry used for reads and writes.
    pub fn registry(&self) -> &FileTypeRegistry {
        &self.inner.registry
    }

    /// Directory handle for `path`, creating the directory (and any missing
    /// ancestors) when `create` is set.
    pub fn dir(&self, path: impl AsRef<Path>, create: bool) -> AppResult<DirHandle> {
        let path = path.as_ref();
        if !path.exists() {
            if !create {
                return Err(DaqError::NotADirectory(path.to_path_buf()));
            }
            fs::create_dir_all(path)?;
        }
        let canonical = fs::canonicalize(path)?;
        if !canonical.is_dir() {
            return Err(DaqError::NotADirectory(canonical));
        }
        Ok(DirHandle::new(self.inner.handle_for(canonical, true)))
    }

    /// File handle for an existing file.
    pub fn file(&self, path: impl AsRef<Path>) -> AppResult<FileHandle> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DaqError::NotFound(path.to_path_buf()));
        }
        let canonical = fs::canonicalize(path)?;
        if canonical.is_dir() {
            return Err(DaqError::NotAFile(canonical));
        }
        Ok(FileHandle::new(self.inner.handle_for(canonical, false)))
    }

    /// Handle of the right kind for an existing path.
    pub fn handle(&self, path: impl AsRef<Path>) -> AppResult<Handle> {
        let path = path.as_ref();
        if path.is_dir() {
            self.dir(path, false).map(Handle::Dir)
        } else if path.exists() {
            self.file(path).map(Handle::File)
        } else {
            Err(DaqError::NotFound(path.to_path_buf()))
        }
    }

    /// Number of live cached handles.
    pub fn cached_handles(&self) -> usize {
        self.inner.with_state(|state| {
            state
                .handles
                .values()
                .filter(|cached| cached.strong_count() > 0)
                .count()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn same_path_same_handle() {
        let tmp = tempdir().unwrap();
        let store = DataStore::new();
        let a = store.dir(tmp.path(), false).unwrap();
        let b = store.dir(tmp.path().join("."), false).unwrap();
        assert!(a.same_handle(&b));
        assert_eq!(store.cached_handles(), 1);
    }

    #[test]
    fn missing_dir_without_create_fails() {
        let tmp = tempdir().unwrap();
        let store = DataStore::new();
        let err = store.dir(tmp.path().join("nope"), false).unwrap_err();
        assert!(matches!(err, DaqError::NotADirectory(_)));
        assert!(store.dir(tmp.path().join("a/b"), true).unwrap().exists());
    }

    #[test]
    fn file_and_dir_kinds_are_checked() {
        let tmp = tempdir().unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "x").unwrap();
        let store = DataStore::new();
        assert!(matches!(
            store.dir(tmp.path().join("notes.txt"), false),
            Err(DaqError::NotADirectory(_))
        ));
        assert!(matches!(store.file(tmp.path()), Err(DaqError::NotAFile(_))));
        assert!(matches!(
            store.file(tmp.path().join("missing.ma")),
            Err(DaqError::NotFound(_))
        ));
        assert!(matches!(
            store.handle(tmp.path().join("notes.txt")).unwrap(),
            Handle::File(_)
        ));
    }

    #[test]
    fn dropped_handles_leave_the_cache() {
        let tmp = tempdir().unwrap();
        let store = DataStore::new();
        let root = store.dir(tmp.path(), false).unwrap();
        for _ in 0..50 {
            let run = root.mkdir("run", true, Attributes::new()).unwrap();
            drop(run);
        }
        assert_eq!(store.cached_handles(), 1);
        root.mkdir("slice", false, Attributes::new()).unwrap();
        let size = store.inner.with_state(|state| state.handles.len());
        assert!(size <= 2, "cache kept {size} entries");

        let first = store.dir(tmp.path().join("run_000"), false).unwrap();
        let again = root.get_dir("run_000", false).unwrap();
        assert!(first.same_handle(&again));
    }

    #[test]
    fn timestamps_strictly_increase() {
        let store = DataStore::new();
        let mut last = 0.0;
        for _ in 0..1000 {
            let ts = store.inner.next_timestamp();
            assert!(ts > last);
            last = ts;
        }
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("cell_000").is_ok());
        for bad in ["", ".", "..", "a/b", ".index", "log.txt"] {
            assert!(validate_name(bad).is_err(), "{bad}");
        }
    }
}
