//! Filetype registry: pluggable writers and readers for [`DataObject`]s.
//!
//! Each adapter declares the extensions it recognizes, the object kinds it
//! accepts and a priority. The data store asks the registry for a writer by
//! object and for a reader by file; the highest-priority match wins.
//!
//! Built-in adapters:
//!
//! | Name          | Ext   | Accepts           | Priority |
//! |---------------|-------|-------------------|----------|
//! | `MetaArray`   | `.ma` | array, waveform   | 50       |
//! | `ImageFile`   | `.tif`| image             | 50       |
//! | `JsonMapping` | `.json`| mapping          | 10       |

use super::image::{self as image_file, ImageData};
use super::metaarray::{self, MetaArray};
use super::{DataObject, ObjectKind};
use crate::error::{AppResult, DaqError};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

/// Number of leading bytes handed to [`FileType::probe`].
const PROBE_LEN: usize = 16;

/// A writer/reader adapter for one file format.
pub trait FileType: Send + Sync {
    /// Adapter name, recorded as `__object_type__` in index entries.
    fn name(&self) -> &'static str;

    /// Recognized extensions, without the dot. The first one is used for writes.
    fn extensions(&self) -> &'static [&'static str];

    /// Object kinds this adapter can write.
    fn accepts(&self) -> &'static [ObjectKind];

    /// Higher wins when several adapters match.
    fn priority(&self) -> i32 {
        0
    }

    /// True when the leading bytes identify this format.
    fn probe(&self, _head: &[u8]) -> bool {
        false
    }

    /// Write `obj` to `path`, flushed to disk on return.
    ///
    /// Returns extra attributes to merge into the index entry.
    fn write(&self, obj: &DataObject, path: &Path) -> AppResult<Map<String, Value>>;

    /// Read `path`; `info` is the file's index entry (empty when unmanaged).
    fn read(&self, path: &Path, info: &Map<String, Value>) -> AppResult<DataObject>;

    /// Whether this adapter accepts `obj`.
    fn accepts_object(&self, obj: &DataObject) -> bool {
        self.accepts().contains(&obj.kind())
    }
}

/// MetaArray file adapter.
pub struct MetaArrayFile;

impl FileType for MetaArrayFile {
    fn name(&self) -> &'static str {
        "MetaArray"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["ma"]
    }

    fn accepts(&self) -> &'static [ObjectKind] {
        &[ObjectKind::Array, ObjectKind::Waveform]
    }

    fn priority(&self) -> i32 {
        50
    }

    fn probe(&self, head: &[u8]) -> bool {
        metaarray::probe(head)
    }

    fn write(&self, obj: &DataObject, path: &Path) -> AppResult<Map<String, Value>> {
        let array = obj
            .as_array()
            .ok_or_else(|| DaqError::NoWriter(obj.kind().to_string()))?;
        array.write_to(path)?;
        Ok(Map::new())
    }

    fn read(&self, path: &Path, _info: &Map<String, Value>) -> AppResult<DataObject> {
        Ok(DataObject::Array(MetaArray::read_from(path)?))
    }
}

/// Lossless TIFF adapter for calibrated images.
pub struct ImageFile;

impl FileType for ImageFile {
    fn name(&self) -> &'static str {
        "ImageFile"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["tif", "tiff"]
    }

    fn accepts(&self) -> &'static [ObjectKind] {
        &[ObjectKind::Image]
    }

    fn priority(&self) -> i32 {
        50
    }

    fn probe(&self, head: &[u8]) -> bool {
        image_file::probe(head)
    }

    fn write(&self, obj: &DataObject, path: &Path) -> AppResult<Map<String, Value>> {
        let image = obj
            .as_image()
            .ok_or_else(|| DaqError::NoWriter(obj.kind().to_string()))?;
        image.write_tiff(path)?;
        Ok(image.calibration_info())
    }

    fn read(&self, path: &Path, info: &Map<String, Value>) -> AppResult<DataObject> {
        let mut image = ImageData::read_tiff(path)?;
        image.apply_calibration(info);
        Ok(DataObject::Image(image))
    }
}

/// Plain JSON adapter for mapping results.
pub struct JsonMapping;

impl FileType for JsonMapping {
    fn name(&self) -> &'static str {
        "JsonMapping"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["json"]
    }

    fn accepts(&self) -> &'static [ObjectKind] {
        &[ObjectKind::Mapping]
    }

    fn priority(&self) -> i32 {
        10
    }

    fn write(&self, obj: &DataObject, path: &Path) -> AppResult<Map<String, Value>> {
        let DataObject::Mapping(map) = obj else {
            return Err(DaqError::NoWriter(obj.kind().to_string()));
        };
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, map)?;
        writer.write_all(b"\n")?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(Map::new())
    }

    fn read(&self, path: &Path, _info: &Map<String, Value>) -> AppResult<DataObject> {
        let text = std::fs::read_to_string(path)?;
        let map: Map<String, Value> = serde_json::from_str(&text)?;
        Ok(DataObject::Mapping(map))
    }
}

/// Ordered set of filetype adapters.
#[derive(Clone)]
pub struct FileTypeRegistry {
    adapters: Vec<Arc<dyn FileType>>,
}

impl Default for FileTypeRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl FileTypeRegistry {
    /// Registry with no adapters.
    pub fn empty() -> Self {
        Self {
            adapters: Vec::new(),
        }
    }

    /// Registry holding the MetaArray, image and JSON adapters.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(MetaArrayFile));
        registry.register(Arc::new(ImageFile));
        registry.register(Arc::new(JsonMapping));
        registry
    }

    /// Add an adapter. Adapters are kept sorted by descending priority;
    /// equal priorities keep registration order.
    pub fn register(&mut self, adapter: Arc<dyn FileType>) {
        let pos = self
            .adapters
            .iter()
            .position(|a| a.priority() < adapter.priority())
            .unwrap_or(self.adapters.len());
        self.adapters.insert(pos, adapter);
    }

    /// Look up an adapter by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn FileType>> {
        self.adapters.iter().find(|a| a.name() == name).cloned()
    }

    /// Names of all registered adapters, highest priority first.
    pub fn names(&self) -> Vec<&'static str> {
        self.adapters.iter().map(|a| a.name()).collect()
    }

    /// Highest-priority adapter accepting `obj`.
    pub fn writer_for(&self, obj: &DataObject) -> AppResult<Arc<dyn FileType>> {
        self.adapters
            .iter()
            .find(|a| a.accepts_object(obj))
            .cloned()
            .ok_or_else(|| DaqError::NoWriter(obj.kind().to_string()))
    }

    /// Adapter for an existing file: extension first, magic bytes second.
    pub fn reader_for(&self, path: &Path) -> AppResult<Arc<dyn FileType>> {
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            let ext = ext.to_ascii_lowercase();
            if let Some(adapter) = self
                .adapters
                .iter()
                .find(|a| a.extensions().contains(&ext.as_str()))
            {
                return Ok(adapter.clone());
            }
        }

        let mut head = [0u8; PROBE_LEN];
        let n = match File::open(path) {
            Ok(mut file) => file.read(&mut head)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DaqError::NotFound(path.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };
        self.adapters
            .iter()
            .find(|a| a.probe(&head[..n]))
            .cloned()
            .ok_or_else(|| DaqError::NoReader(path.to_path_buf()))
    }

    /// File name for `base` as the writer wants it (extension appended when missing).
    pub fn file_name_for(adapter: &dyn FileType, base: &str) -> String {
        let has_ext = Path::new(base)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| adapter.extensions().contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        match adapter.extensions().first() {
            Some(ext) if !has_ext => format!("{base}.{ext}"),
            _ => base.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ArrayData, Pixels};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[test]
    fn writer_dispatch_by_kind() {
        let registry = FileTypeRegistry::with_builtins();
        let wave = DataObject::Array(MetaArray::waveform(ArrayData::F64(vec![0.0; 4]), 1e3));
        assert_eq!(registry.writer_for(&wave).unwrap().name(), "MetaArray");

        let img = DataObject::Image(ImageData::new(1, 1, Pixels::Gray8(vec![7])).unwrap());
        assert_eq!(registry.writer_for(&img).unwrap().name(), "ImageFile");

        let map = DataObject::Mapping(Map::new());
        assert_eq!(registry.writer_for(&map).unwrap().name(), "JsonMapping");
    }

    #[test]
    fn group_has_no_writer() {
        let registry = FileTypeRegistry::with_builtins();
        let group = DataObject::Group(BTreeMap::new());
        assert!(matches!(registry.writer_for(&group), Err(DaqError::NoWriter(_))));
    }

    #[test]
    fn reader_falls_back_to_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("unnamed_blob");
        MetaArray::waveform(ArrayData::F32(vec![1.0, 2.0]), 10.0)
            .write_to(&path)
            .unwrap();
        let registry = FileTypeRegistry::with_builtins();
        assert_eq!(registry.reader_for(&path).unwrap().name(), "MetaArray");

        let junk = dir.path().join("notes");
        std::fs::write(&junk, b"plain text").unwrap();
        assert!(matches!(registry.reader_for(&junk), Err(DaqError::NoReader(_))));
    }

    #[test]
    fn priority_orders_adapters() {
        struct Loud;
        impl FileType for Loud {
            fn name(&self) -> &'static str {
                "Loud"
            }
            fn extensions(&self) -> &'static [&'static str] {
                &["loud"]
            }
            fn accepts(&self) -> &'static [ObjectKind] {
                &[ObjectKind::Waveform]
            }
            fn priority(&self) -> i32 {
                100
            }
            fn write(&self, _obj: &DataObject, _path: &Path) -> AppResult<Map<String, Value>> {
                Ok(Map::new())
            }
            fn read(&self, _path: &Path, _info: &Map<String, Value>) -> AppResult<DataObject> {
                Ok(DataObject::Mapping(Map::new()))
            }
        }

        let mut registry = FileTypeRegistry::with_builtins();
        registry.register(Arc::new(Loud));
        let wave = DataObject::Array(MetaArray::waveform(ArrayData::F64(vec![1.0]), 1.0));
        assert_eq!(registry.writer_for(&wave).unwrap().name(), "Loud");
        assert_eq!(registry.names()[0], "Loud");
    }

    #[test]
    fn extension_is_appended_once() {
        assert_eq!(FileTypeRegistry::file_name_for(&MetaArrayFile, "Clamp1"), "Clamp1.ma");
        assert_eq!(FileTypeRegistry::file_name_for(&MetaArrayFile, "Clamp1.ma"), "Clamp1.ma");
    }
}
