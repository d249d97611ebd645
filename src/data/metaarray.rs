//! Self-describing N-dimensional arrays and their on-disk layout.
//!
//! A [`MetaArray`] is a typed, row-major array with per-axis annotations
//! (name, units, sample values, column descriptions) and a free-form
//! attribute mapping. It is the common currency of device results: waveform
//! recordings, derived traces and image stacks all travel as `MetaArray`s.
//!
//! # File Layout
//!
//! ```text
//! ┌──────────┬───────────────┬─────────────┬──────────────────────┬───────────────┐
//! │ magic(8) │ capacity u64  │ length u64  │ JSON header + padding │ raw LE samples │
//! └──────────┴───────────────┴─────────────┴──────────────────────┴───────────────┘
//! ```
//!
//! The header region has a fixed capacity chosen at creation time, so that an
//! append along axis 0 only writes the new samples at the end of the file and
//! then rewrites the header in place. Samples are always little-endian.

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Magic bytes at the start of every array file.
pub const MAGIC: &[u8; 8] = b"MARRAY\x00\x01";

/// Size of magic + capacity + length words.
const PREFIX_LEN: u64 = 24;

/// Smallest header region written to disk.
const MIN_HEADER_CAPACITY: usize = 4096;

const FORMAT_VERSION: u32 = 1;

/// Element type of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    /// 64-bit IEEE float
    F64,
    /// 32-bit IEEE float
    F32,
    /// Signed 32-bit integer
    I32,
    /// Signed 16-bit integer
    I16,
    /// Unsigned 16-bit integer
    U16,
    /// Unsigned 8-bit integer
    U8,
}

impl Dtype {
    /// Bytes per element.
    pub fn size(self) -> usize {
        match self {
            Dtype::F64 => 8,
            Dtype::F32 | Dtype::I32 => 4,
            Dtype::I16 | Dtype::U16 => 2,
            Dtype::U8 => 1,
        }
    }

    /// Parse a dtype name as written in device configs (`"f64"`, `"int16"`, ...).
    pub fn parse(name: &str) -> AppResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "f64" | "float64" | "double" => Ok(Dtype::F64),
            "f32" | "float32" | "float" => Ok(Dtype::F32),
            "i32" | "int32" => Ok(Dtype::I32),
            "i16" | "int16" => Ok(Dtype::I16),
            "u16" | "uint16" => Ok(Dtype::U16),
            "u8" | "uint8" => Ok(Dtype::U8),
            other => Err(DaqError::Configuration(format!("unknown dtype '{other}'"))),
        }
    }
}

impl std::fmt::Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Dtype::F64 => "f64",
            Dtype::F32 => "f32",
            Dtype::I32 => "i32",
            Dtype::I16 => "i16",
            Dtype::U16 => "u16",
            Dtype::U8 => "u8",
        };
        write!(f, "{}", label)
    }
}

/// Typed, flat sample storage.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    /// 64-bit floats
    F64(Vec<f64>),
    /// 32-bit floats
    F32(Vec<f32>),
    /// Signed 32-bit integers
    I32(Vec<i32>),
    /// Signed 16-bit integers
    I16(Vec<i16>),
    /// Unsigned 16-bit integers
    U16(Vec<u16>),
    /// Unsigned 8-bit integers
    U8(Vec<u8>),
}

macro_rules! dispatch {
    ($value:expr, $v:ident => $body:expr) => {
        match $value {
            ArrayData::F64($v) => $body,
            ArrayData::F32($v) => $body,
            ArrayData::I32($v) => $body,
            ArrayData::I16($v) => $body,
            ArrayData::U16($v) => $body,
            ArrayData::U8($v) => $body,
        }
    };
}

macro_rules! decode_le {
    ($ty:ty, $bytes:expr) => {
        $bytes
            .chunks_exact(std::mem::size_of::<$ty>())
            .map(|chunk| {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                buf.copy_from_slice(chunk);
                <$ty>::from_le_bytes(buf)
            })
            .collect::<Vec<$ty>>()
    };
}

impl ArrayData {
    /// Element type.
    pub fn dtype(&self) -> Dtype {
        match self {
            ArrayData::F64(_) => Dtype::F64,
            ArrayData::F32(_) => Dtype::F32,
            ArrayData::I32(_) => Dtype::I32,
            ArrayData::I16(_) => Dtype::I16,
            ArrayData::U16(_) => Dtype::U16,
            ArrayData::U8(_) => Dtype::U8,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        dispatch!(self, v => v.len())
    }

    /// True when there are no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Little-endian byte image of the samples.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        dispatch!(self, v => v.iter().flat_map(|x| x.to_le_bytes()).collect())
    }

    /// Decode little-endian bytes of the given type.
    pub fn from_le_bytes(dtype: Dtype, bytes: &[u8]) -> AppResult<Self> {
        if bytes.len() % dtype.size() != 0 {
            return Err(DaqError::Parse(format!(
                "{} bytes is not a whole number of {} elements",
                bytes.len(),
                dtype
            )));
        }
        Ok(match dtype {
            Dtype::F64 => ArrayData::F64(decode_le!(f64, bytes)),
            Dtype::F32 => ArrayData::F32(decode_le!(f32, bytes)),
            Dtype::I32 => ArrayData::I32(decode_le!(i32, bytes)),
            Dtype::I16 => ArrayData::I16(decode_le!(i16, bytes)),
            Dtype::U16 => ArrayData::U16(decode_le!(u16, bytes)),
            Dtype::U8 => ArrayData::U8(decode_le!(u8, bytes)),
        })
    }

    /// Cast 64-bit samples to a channel dtype.
    ///
    /// Integer conversions round to nearest and saturate at the type bounds.
    pub fn from_f64(samples: &[f64], dtype: Dtype) -> Self {
        match dtype {
            Dtype::F64 => ArrayData::F64(samples.to_vec()),
            Dtype::F32 => ArrayData::F32(samples.iter().map(|&x| x as f32).collect()),
            Dtype::I32 => ArrayData::I32(samples.iter().map(|&x| x.round() as i32).collect()),
            Dtype::I16 => ArrayData::I16(samples.iter().map(|&x| x.round() as i16).collect()),
            Dtype::U16 => ArrayData::U16(samples.iter().map(|&x| x.round() as u16).collect()),
            Dtype::U8 => ArrayData::U8(samples.iter().map(|&x| x.round() as u8).collect()),
        }
    }

    /// Widen every sample to f64.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            ArrayData::F64(v) => v.clone(),
            ArrayData::F32(v) => v.iter().map(|&x| f64::from(x)).collect(),
            ArrayData::I32(v) => v.iter().map(|&x| f64::from(x)).collect(),
            ArrayData::I16(v) => v.iter().map(|&x| f64::from(x)).collect(),
            ArrayData::U16(v) => v.iter().map(|&x| f64::from(x)).collect(),
            ArrayData::U8(v) => v.iter().map(|&x| f64::from(x)).collect(),
        }
    }

    fn extend_from(&mut self, other: &ArrayData) -> AppResult<()> {
        match (self, other) {
            (ArrayData::F64(a), ArrayData::F64(b)) => a.extend_from_slice(b),
            (ArrayData::F32(a), ArrayData::F32(b)) => a.extend_from_slice(b),
            (ArrayData::I32(a), ArrayData::I32(b)) => a.extend_from_slice(b),
            (ArrayData::I16(a), ArrayData::I16(b)) => a.extend_from_slice(b),
            (ArrayData::U16(a), ArrayData::U16(b)) => a.extend_from_slice(b),
            (ArrayData::U8(a), ArrayData::U8(b)) => a.extend_from_slice(b),
            (a, b) => {
                return Err(DaqError::InvalidState(format!(
                    "cannot append {} samples to {} array",
                    b.dtype(),
                    a.dtype()
                )))
            }
        }
        Ok(())
    }
}

/// Description of one column along a column axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name
    pub name: String,
    /// Physical units
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
}

/// Per-axis annotation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AxisInfo {
    /// Axis name (e.g. "Time", "Channel")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Physical units of the axis values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    /// Sample coordinates along the axis
    #[serde(default, skip_serializing_if = "Option::is_none", with = "exact_floats")]
    pub values: Option<Vec<f64>>,
    /// Column descriptions when the axis enumerates channels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<Vec<ColumnInfo>>,
}

impl AxisInfo {
    /// Named axis without units or values.
    pub fn named(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    /// Set the units.
    pub fn with_units(mut self, units: &str) -> Self {
        self.units = Some(units.to_string());
        self
    }

    /// Set the sample coordinates.
    pub fn with_values(mut self, values: Vec<f64>) -> Self {
        self.values = Some(values);
        self
    }

    /// Set column descriptions.
    pub fn with_cols(mut self, cols: Vec<ColumnInfo>) -> Self {
        self.cols = Some(cols);
        self
    }
}

/// Axis values in the JSON header. Finite values are plain numbers; others
/// are written as `"0x"`-prefixed bit patterns, which JSON numbers cannot
/// carry.
mod exact_floats {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Encoded {
        Number(f64),
        Bits(String),
    }

    impl Encoded {
        fn from_f64(value: f64) -> Self {
            if value.is_finite() {
                Encoded::Number(value)
            } else {
                Encoded::Bits(format!("0x{:016x}", value.to_bits()))
            }
        }

        fn into_f64<E: serde::de::Error>(self) -> Result<f64, E> {
            match self {
                Encoded::Number(v) => Ok(v),
                Encoded::Bits(text) => text
                    .strip_prefix("0x")
                    .and_then(|hex| u64::from_str_radix(hex, 16).ok())
                    .map(f64::from_bits)
                    .ok_or_else(|| E::custom(format!("bad float bit pattern '{text}'"))),
            }
        }
    }

    pub fn serialize<S: Serializer>(values: &Option<Vec<f64>>, s: S) -> Result<S::Ok, S::Error> {
        values
            .as_ref()
            .map(|v| v.iter().copied().map(Encoded::from_f64).collect::<Vec<_>>())
            .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<f64>>, D::Error> {
        Option::<Vec<Encoded>>::deserialize(d)?
            .map(|v| {
                v.into_iter()
                    .map(Encoded::into_f64::<D::Error>)
                    .collect::<Result<Vec<f64>, D::Error>>()
            })
            .transpose()
    }
}

fn axes_bit_eq(a: &[AxisInfo], b: &[AxisInfo]) -> bool {
    fn bits(values: &Option<Vec<f64>>) -> Option<Vec<u64>> {
        values.as_ref().map(|v| v.iter().map(|x| x.to_bits()).collect())
    }
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| {
            x.name == y.name
                && x.units == y.units
                && x.cols == y.cols
                && bits(&x.values) == bits(&y.values)
        })
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    version: u32,
    dtype: Dtype,
    shape: Vec<usize>,
    axes: Vec<AxisInfo>,
    #[serde(default)]
    attrs: Map<String, Value>,
}

/// Typed N-dimensional array with axis annotations and attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaArray {
    data: ArrayData,
    shape: Vec<usize>,
    axes: Vec<AxisInfo>,
    /// Free-form attributes stored in the file header
    pub attrs: Map<String, Value>,
}

impl MetaArray {
    /// Wrap flat row-major data with the given shape.
    pub fn new(data: ArrayData, shape: Vec<usize>) -> AppResult<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(DaqError::InvalidState(format!(
                "shape {:?} needs {} elements, data has {}",
                shape,
                expected,
                data.len()
            )));
        }
        let axes = vec![AxisInfo::default(); shape.len()];
        Ok(Self {
            data,
            shape,
            axes,
            attrs: Map::new(),
        })
    }

    /// One-dimensional waveform sampled at `rate` Hz.
    pub fn waveform(data: ArrayData, rate: f64) -> Self {
        let len = data.len();
        let mut attrs = Map::new();
        attrs.insert("rate".to_string(), Value::from(rate));
        Self {
            data,
            shape: vec![len],
            axes: vec![AxisInfo::named("Time").with_units("s")],
            attrs,
        }
    }

    /// Replace the annotation of one axis.
    pub fn with_axis(mut self, index: usize, info: AxisInfo) -> AppResult<Self> {
        let slot = self.axes.get_mut(index).ok_or_else(|| {
            DaqError::InvalidState(format!("array has no axis {index}"))
        })?;
        *slot = info;
        Ok(self)
    }

    /// Add one attribute.
    pub fn with_attr(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attrs.insert(key.to_string(), value.into());
        self
    }

    /// Sample storage.
    pub fn data(&self) -> &ArrayData {
        &self.data
    }

    /// Array shape.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Axis annotations, one per dimension.
    pub fn axes(&self) -> &[AxisInfo] {
        &self.axes
    }

    /// Element type.
    pub fn dtype(&self) -> Dtype {
        self.data.dtype()
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Sample rate attribute, when present.
    pub fn rate(&self) -> Option<f64> {
        self.attrs.get("rate").and_then(Value::as_f64)
    }

    /// Bit-exact comparison of values, axes and attributes.
    ///
    /// Unlike `==`, NaN payloads compare equal when their bits match.
    pub fn bit_eq(&self, other: &MetaArray) -> bool {
        self.dtype() == other.dtype()
            && self.shape == other.shape
            && axes_bit_eq(&self.axes, &other.axes)
            && self.attrs == other.attrs
            && self.data.to_le_bytes() == other.data.to_le_bytes()
    }

    fn header(&self) -> Header {
        Header {
            version: FORMAT_VERSION,
            dtype: self.dtype(),
            shape: self.shape.clone(),
            axes: self.axes.clone(),
            attrs: self.attrs.clone(),
        }
    }

    /// Write the array to `path`, replacing any existing file, and sync it.
    pub fn write_to(&self, path: &Path) -> AppResult<()> {
        let header = serde_json::to_vec(&self.header())?;
        let capacity = header_capacity(header.len());

        let mut writer = BufWriter::new(File::create(path)?);
        write_prefix(&mut writer, capacity, header.len())?;
        writer.write_all(&header)?;
        writer.write_all(&vec![b' '; capacity - header.len()])?;
        writer.write_all(&self.data.to_le_bytes())?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    }

    /// Read an array file.
    ///
    /// Bytes beyond the header's declared shape (left by an interrupted
    /// append) are ignored.
    pub fn read_from(path: &Path) -> AppResult<Self> {
        let mut file = File::open(path)?;
        let (capacity, header) = read_header(&mut file, path)?;

        let available = file.metadata()?.len().saturating_sub(PREFIX_LEN + capacity as u64);
        let size = sample_bytes(&header.shape, header.dtype)
            .filter(|&size| size as u64 <= available)
            .ok_or_else(|| {
                DaqError::Parse(format!(
                    "{}: shape {:?} does not fit the file",
                    path.display(),
                    header.shape
                ))
            })?;
        let mut bytes = vec![0u8; size];
        file.read_exact(&mut bytes).map_err(|e| {
            DaqError::Parse(format!(
                "{}: truncated sample block ({e})",
                path.display()
            ))
        })?;

        let data = ArrayData::from_le_bytes(header.dtype, &bytes)?;
        let mut axes = header.axes;
        axes.resize(header.shape.len(), AxisInfo::default());
        Ok(Self {
            data,
            shape: header.shape,
            axes,
            attrs: header.attrs,
        })
    }

    /// Append `other` along axis 0 of the array stored at `path`.
    ///
    /// The new samples are written first and the header is rewritten last,
    /// so an interruption leaves the previous contents readable. When the
    /// grown header no longer fits its reserved region the file is rewritten.
    pub fn append_to(path: &Path, other: &MetaArray) -> AppResult<()> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let (capacity, mut header) = read_header(&mut file, path)?;

        if header.dtype != other.dtype() {
            return Err(DaqError::InvalidState(format!(
                "cannot append {} data to {} array",
                other.dtype(),
                header.dtype
            )));
        }
        if header.shape.is_empty()
            || header.shape.len() != other.ndim()
            || header.shape[1..] != other.shape[1..]
        {
            return Err(DaqError::InvalidState(format!(
                "cannot append shape {:?} to shape {:?} along axis 0",
                other.shape, header.shape
            )));
        }

        let old_rows = header.shape.first().copied().unwrap_or(0);
        header.shape[0] = old_rows
            .checked_add(other.shape[0])
            .ok_or_else(|| DaqError::InvalidState("appended row count overflows".to_string()))?;
        if let (Some(existing), Some(extra)) = (
            header.axes.get_mut(0).and_then(|a| a.values.as_mut()),
            other.axes.first().and_then(|a| a.values.as_ref()),
        ) {
            existing.extend_from_slice(extra);
        }

        let encoded = serde_json::to_vec(&header)?;
        if encoded.len() > capacity {
            drop(file);
            let mut whole = MetaArray::read_from(path)?;
            whole.data.extend_from(&other.data)?;
            whole.shape = header.shape;
            whole.axes = header.axes;
            return whole.write_to(path);
        }

        let old_bytes = sample_bytes(&header.shape[1..], header.dtype)
            .and_then(|row| row.checked_mul(old_rows))
            .ok_or_else(|| DaqError::Parse(format!("{}: shape overflows", path.display())))?;
        let data_start = PREFIX_LEN + capacity as u64;
        file.seek(SeekFrom::Start(data_start + old_bytes as u64))?;
        file.write_all(&other.data.to_le_bytes())?;
        file.sync_data()?;

        file.seek(SeekFrom::Start(0))?;
        write_prefix(&mut file, capacity, encoded.len())?;
        file.write_all(&encoded)?;
        file.write_all(&vec![b' '; capacity - encoded.len()])?;
        file.sync_all()?;
        Ok(())
    }
}

/// True when `head` begins with the array-file magic.
pub fn probe(head: &[u8]) -> bool {
    head.starts_with(MAGIC)
}

/// Byte size of a sample block, or `None` on overflow.
fn sample_bytes(shape: &[usize], dtype: Dtype) -> Option<usize> {
    shape
        .iter()
        .try_fold(dtype.size(), |acc, &dim| acc.checked_mul(dim))
}

fn header_capacity(len: usize) -> usize {
    (len * 2).next_power_of_two().max(MIN_HEADER_CAPACITY)
}

fn write_prefix<W: Write>(writer: &mut W, capacity: usize, len: usize) -> AppResult<()> {
    writer.write_all(MAGIC)?;
    writer.write_all(&(capacity as u64).to_le_bytes())?;
    writer.write_all(&(len as u64).to_le_bytes())?;
    Ok(())
}

fn read_header(file: &mut File, path: &Path) -> AppResult<(usize, Header)> {
    let mut prefix = [0u8; PREFIX_LEN as usize];
    file.read_exact(&mut prefix)?;
    if !probe(&prefix) {
        return Err(DaqError::Parse(format!(
            "{} is not an array file",
            path.display()
        )));
    }
    let mut word = [0u8; 8];
    word.copy_from_slice(&prefix[8..16]);
    let capacity = u64::from_le_bytes(word);
    word.copy_from_slice(&prefix[16..24]);
    let len = u64::from_le_bytes(word);
    let file_len = file.metadata()?.len();
    if capacity > file_len.saturating_sub(PREFIX_LEN) {
        return Err(DaqError::Parse(format!(
            "{}: header capacity {} exceeds file size {}",
            path.display(),
            capacity,
            file_len
        )));
    }
    let (capacity, len) = (capacity as usize, len as usize);
    if len > capacity {
        return Err(DaqError::Parse(format!(
            "{}: header length {} exceeds capacity {}",
            path.display(),
            len,
            capacity
        )));
    }

    let mut region = vec![0u8; capacity];
    file.read_exact(&mut region)?;
    let header: Header = serde_json::from_slice(&region[..len])?;
    if header.version > FORMAT_VERSION {
        return Err(DaqError::Parse(format!(
            "{}: unsupported array format version {}",
            path.display(),
            header.version
        )));
    }
    Ok((capacity, header))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn trace() -> MetaArray {
        let samples = vec![0.0, 1.5, -2.25, f64::MIN_POSITIVE, 1e-300, f64::NAN];
        MetaArray::waveform(ArrayData::F64(samples), 20_000.0).with_attr("units", "V")
    }

    #[test]
    fn round_trip_is_bit_exact() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trace.ma");
        let original = trace();
        original.write_to(&path).unwrap();

        let back = MetaArray::read_from(&path).unwrap();
        assert!(back.bit_eq(&original));
        assert_eq!(back.rate(), Some(20_000.0));
    }

    #[test]
    fn two_dimensional_axes_survive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("grid.ma");
        let arr = MetaArray::new(ArrayData::I16(vec![1, -2, 3, -4, 5, -6]), vec![2, 3])
            .unwrap()
            .with_axis(
                0,
                AxisInfo::named("Channel").with_cols(vec![
                    ColumnInfo { name: "primary".into(), units: Some("A".into()) },
                    ColumnInfo { name: "secondary".into(), units: Some("V".into()) },
                ]),
            )
            .unwrap()
            .with_axis(1, AxisInfo::named("Time").with_units("s").with_values(vec![0.0, 0.1, 0.2]))
            .unwrap();
        arr.write_to(&path).unwrap();
        assert!(MetaArray::read_from(&path).unwrap().bit_eq(&arr));
    }

    #[test]
    fn non_finite_axis_values_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("edges.ma");
        let odd_nan = f64::from_bits(0x7ff8_0000_0000_0123);
        let arr = MetaArray::waveform(ArrayData::F64(vec![1.0, 2.0, 3.0, 4.0]), 1000.0)
            .with_axis(
                0,
                AxisInfo::named("Time").with_values(vec![0.0, f64::INFINITY, f64::NEG_INFINITY, odd_nan]),
            )
            .unwrap();
        arr.write_to(&path).unwrap();

        let back = MetaArray::read_from(&path).unwrap();
        assert!(back.bit_eq(&arr));
        let values = back.axes()[0].values.as_ref().unwrap();
        assert_eq!(values[1], f64::INFINITY);
        assert_eq!(values[3].to_bits(), odd_nan.to_bits());
    }

    #[test]
    fn non_finite_attrs_are_not_representable() {
        let arr = trace().with_attr("offset", f64::NAN);
        assert_eq!(arr.attrs["offset"], Value::Null);
    }

    #[test]
    fn corrupt_sizes_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.ma");
        trace().write_to(&path).unwrap();
        let pristine = std::fs::read(&path).unwrap();

        let mut huge_capacity = pristine.clone();
        huge_capacity[8..16].copy_from_slice(&u64::MAX.to_le_bytes());
        std::fs::write(&path, &huge_capacity).unwrap();
        assert!(matches!(MetaArray::read_from(&path), Err(DaqError::Parse(_))));

        let capacity = u64::from_le_bytes(pristine[8..16].try_into().unwrap()) as usize;
        let huge = MetaArray::new(ArrayData::U8(Vec::new()), vec![0]).unwrap();
        let mut header = serde_json::to_value(huge.header()).unwrap();
        header["shape"] = serde_json::json!([usize::MAX, 4]);
        let encoded = serde_json::to_vec(&header).unwrap();
        let mut overflow = pristine.clone();
        overflow[16..24].copy_from_slice(&(encoded.len() as u64).to_le_bytes());
        overflow[24..24 + encoded.len()].copy_from_slice(&encoded);
        for b in &mut overflow[24 + encoded.len()..24 + capacity] {
            *b = b' ';
        }
        std::fs::write(&path, &overflow).unwrap();
        assert!(matches!(MetaArray::read_from(&path), Err(DaqError::Parse(_))));
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        assert!(MetaArray::new(ArrayData::U8(vec![1, 2, 3]), vec![2, 2]).is_err());
    }

    #[test]
    fn append_rewrites_only_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows.ma");
        let first = MetaArray::new(ArrayData::F32(vec![1.0, 2.0, 3.0, 4.0]), vec![2, 2]).unwrap();
        first.write_to(&path).unwrap();
        let size_before = std::fs::metadata(&path).unwrap().len();

        let more = MetaArray::new(ArrayData::F32(vec![5.0, 6.0]), vec![1, 2]).unwrap();
        MetaArray::append_to(&path, &more).unwrap();

        let size_after = std::fs::metadata(&path).unwrap().len();
        assert_eq!(size_after - size_before, 8);

        let back = MetaArray::read_from(&path).unwrap();
        assert_eq!(back.shape(), &[3, 2]);
        assert_eq!(back.data(), &ArrayData::F32(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]));
    }

    #[test]
    fn append_rejects_mismatched_dtype() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows.ma");
        MetaArray::new(ArrayData::F32(vec![1.0, 2.0]), vec![1, 2])
            .unwrap()
            .write_to(&path)
            .unwrap();
        let wrong = MetaArray::new(ArrayData::F64(vec![1.0, 2.0]), vec![1, 2]).unwrap();
        assert!(MetaArray::append_to(&path, &wrong).is_err());
    }

    #[test]
    fn integer_cast_saturates() {
        let cast = ArrayData::from_f64(&[-40_000.0, 1.6, 40_000.0], Dtype::I16);
        assert_eq!(cast, ArrayData::I16(vec![i16::MIN, 2, i16::MAX]));
    }

    #[test]
    fn probe_checks_magic() {
        assert!(probe(b"MARRAY\x00\x01rest"));
        assert!(!probe(b"II*\x00"));
    }
}
