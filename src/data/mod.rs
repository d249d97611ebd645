//! Result objects and their persistent representations.
//!
//! - [`metaarray`]: typed N-dimensional arrays with axis annotations.
//! - [`image`]: calibrated grayscale frames.
//! - [`registry`]: pluggable writers/readers keyed by object kind, extension
//!   and magic bytes.

pub mod image;
pub mod metaarray;
pub mod registry;

pub use self::image::{ImageData, Pixels};
pub use self::metaarray::{ArrayData, AxisInfo, ColumnInfo, Dtype, MetaArray};
pub use self::registry::{FileType, FileTypeRegistry};

use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Shape of an object as seen by the filetype registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// N-dimensional array (N != 1)
    Array,
    /// One-dimensional sampled waveform
    Waveform,
    /// Raster image
    Image,
    /// Attribute mapping
    Mapping,
    /// Nested mapping of results
    Group,
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ObjectKind::Array => "array",
            ObjectKind::Waveform => "waveform",
            ObjectKind::Image => "image",
            ObjectKind::Mapping => "mapping",
            ObjectKind::Group => "group",
        };
        write!(f, "{}", label)
    }
}

/// Anything a device can return or the data store can persist.
///
/// Consumers pattern-match on the variant instead of probing attributes.
#[derive(Debug, Clone, PartialEq)]
pub enum DataObject {
    /// Array or waveform
    Array(MetaArray),
    /// Raster image
    Image(ImageData),
    /// Plain attribute mapping
    Mapping(Map<String, Value>),
    /// Named sub-results, stored as a sub-directory
    Group(BTreeMap<String, DataObject>),
}

impl DataObject {
    /// Registry-facing shape of the object.
    pub fn kind(&self) -> ObjectKind {
        match self {
            DataObject::Array(a) if a.ndim() == 1 => ObjectKind::Waveform,
            DataObject::Array(_) => ObjectKind::Array,
            DataObject::Image(_) => ObjectKind::Image,
            DataObject::Mapping(_) => ObjectKind::Mapping,
            DataObject::Group(_) => ObjectKind::Group,
        }
    }

    /// Borrow the array, if this is one.
    pub fn as_array(&self) -> Option<&MetaArray> {
        match self {
            DataObject::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Borrow the image, if this is one.
    pub fn as_image(&self) -> Option<&ImageData> {
        match self {
            DataObject::Image(i) => Some(i),
            _ => None,
        }
    }
}

impl From<MetaArray> for DataObject {
    fn from(value: MetaArray) -> Self {
        DataObject::Array(value)
    }
}

impl From<ImageData> for DataObject {
    fn from(value: ImageData) -> Self {
        DataObject::Image(value)
    }
}

impl From<Map<String, Value>> for DataObject {
    fn from(value: Map<String, Value>) -> Self {
        DataObject::Mapping(value)
    }
}
