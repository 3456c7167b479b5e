//! Core data types for IDX datasets

use crate::error::{IdxError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Scalar element types supported by IDX fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    /// Unsigned 8-bit integer
    U8 = 1,
    /// Unsigned 16-bit integer
    U16 = 2,
    /// Unsigned 32-bit integer
    U32 = 3,
    /// Unsigned 64-bit integer
    U64 = 4,
    /// Signed 8-bit integer
    I8 = 5,
    /// Signed 16-bit integer
    I16 = 6,
    /// Signed 32-bit integer
    I32 = 7,
    /// Signed 64-bit integer
    I64 = 8,
    /// 32-bit floating point
    F32 = 9,
    /// 64-bit floating point
    F64 = 10,
}

impl DataType {
    /// Size in bytes of this data type
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::U8 | DataType::I8 => 1,
            DataType::U16 | DataType::I16 => 2,
            DataType::U32 | DataType::I32 | DataType::F32 => 4,
            DataType::U64 | DataType::I64 | DataType::F64 => 8,
        }
    }

    /// Check if this is a floating point type
    pub fn is_float(&self) -> bool {
        matches!(self, DataType::F32 | DataType::F64)
    }

    /// Name used in `.idx` descriptors
    pub fn name(&self) -> &'static str {
        match self {
            DataType::U8 => "uint8",
            DataType::U16 => "uint16",
            DataType::U32 => "uint32",
            DataType::U64 => "uint64",
            DataType::I8 => "int8",
            DataType::I16 => "int16",
            DataType::I32 => "int32",
            DataType::I64 => "int64",
            DataType::F32 => "float32",
            DataType::F64 => "float64",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "uint8" => DataType::U8,
            "uint16" => DataType::U16,
            "uint32" => DataType::U32,
            "uint64" => DataType::U64,
            "int8" => DataType::I8,
            "int16" => DataType::I16,
            "int32" => DataType::I32,
            "int64" => DataType::I64,
            "float32" => DataType::F32,
            "float64" => DataType::F64,
            _ => return None,
        })
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Element type of a field: a scalar type repeated `ncomponents` times
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DType {
    pub data_type: DataType,
    pub ncomponents: usize,
}

impl DType {
    pub fn new(data_type: DataType, ncomponents: usize) -> Self {
        Self {
            data_type,
            ncomponents: ncomponents.max(1),
        }
    }

    pub fn scalar(data_type: DataType) -> Self {
        Self::new(data_type, 1)
    }

    /// Bytes of a single (multi-component) sample
    pub fn sample_size(&self) -> usize {
        self.data_type.size_in_bytes() * self.ncomponents
    }

    /// Bytes needed for `nsamples` samples
    pub fn byte_size(&self, nsamples: u64) -> usize {
        self.sample_size() * nsamples as usize
    }

    /// True for `float32` and `float32[N]`
    pub fn is_vector_of(&self, data_type: DataType) -> bool {
        self.data_type == data_type
    }

    /// Parse `uint8`, `float32[3]` or the older `3*uint8`
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let bad = || IdxError::InvalidFormat(format!("invalid dtype '{}'", s));

        if let Some((count, name)) = s.split_once('*') {
            let n: usize = count.trim().parse().map_err(|_| bad())?;
            let t = DataType::from_name(name.trim()).ok_or_else(bad)?;
            return Ok(Self::new(t, n));
        }

        if let Some(open) = s.find('[') {
            let close = s.rfind(']').ok_or_else(bad)?;
            let n: usize = s[open + 1..close].trim().parse().map_err(|_| bad())?;
            let t = DataType::from_name(s[..open].trim()).ok_or_else(bad)?;
            return Ok(Self::new(t, n));
        }

        DataType::from_name(s).map(Self::scalar).ok_or_else(bad)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ncomponents == 1 {
            write!(f, "{}", self.data_type)
        } else {
            write!(f, "{}[{}]", self.data_type, self.ncomponents)
        }
    }
}

/// In-memory ordering of the samples of a block or buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Layout {
    /// Dimension 0 varies fastest
    RowMajor,
    /// Samples ordered by HZ address
    #[default]
    HzOrder,
}

/// A named, typed channel of a dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub dtype: DType,
    /// Codec name, empty means raw
    #[serde(default)]
    pub default_compression: String,
    #[serde(default)]
    pub default_layout: Layout,
    #[serde(default)]
    pub default_value: f64,
    /// Slot of this field inside the file header table
    #[serde(default)]
    pub index: usize,
}

impl Field {
    pub fn new(name: impl Into<String>, dtype: DType) -> Self {
        Self {
            name: name.into(),
            dtype,
            default_compression: String::new(),
            default_layout: Layout::HzOrder,
            default_value: 0.0,
            index: 0,
        }
    }

    pub fn with_compression(mut self, compression: impl Into<String>) -> Self {
        self.default_compression = compression.into();
        self
    }

    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.default_layout = layout;
        self
    }

    pub fn with_default_value(mut self, value: f64) -> Self {
        self.default_value = value;
        self
    }

    pub fn is_valid(&self) -> bool {
        !self.name.is_empty()
    }
}

/// Shared cancellation flag, polled at every I/O and loop boundary
#[derive(Debug, Clone, Default)]
pub struct Aborted(Arc<AtomicBool>);

impl Aborted {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Aborted)` once the flag is raised
    pub fn check(&self) -> Result<()> {
        if self.is_set() {
            Err(IdxError::Aborted)
        } else {
            Ok(())
        }
    }
}

/// Timesteps of a dataset, stored as inclusive ranges
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Timesteps {
    /// `(from, to, step)` ranges
    pub ranges: Vec<(f64, f64, f64)>,
    /// Timesteps are not known in advance (`* *` in the descriptor)
    #[serde(default)]
    pub star: bool,
}

impl Timesteps {
    pub fn single(time: f64) -> Self {
        Self {
            ranges: vec![(time, time, 1.0)],
            star: false,
        }
    }

    pub fn star() -> Self {
        Self {
            ranges: Vec::new(),
            star: true,
        }
    }

    pub fn add_range(&mut self, from: f64, to: f64, step: f64) {
        self.ranges.push((from, to, if step > 0.0 { step } else { 1.0 }));
    }

    pub fn contains(&self, time: f64) -> bool {
        if self.star {
            return true;
        }
        self.ranges.iter().any(|&(a, b, step)| {
            if time < a || time > b {
                return false;
            }
            let k = (time - a) / step;
            (k - k.round()).abs() < 1e-9
        })
    }

    pub fn default_time(&self) -> f64 {
        self.ranges.first().map(|r| r.0).unwrap_or(0.0)
    }

    pub fn is_empty(&self) -> bool {
        !self.star && self.ranges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_sizes() {
        assert_eq!(DataType::U8.size_in_bytes(), 1);
        assert_eq!(DataType::U16.size_in_bytes(), 2);
        assert_eq!(DataType::F32.size_in_bytes(), 4);
        assert_eq!(DataType::F64.size_in_bytes(), 8);
    }

    #[test]
    fn test_dtype_parse() {
        assert_eq!(DType::parse("uint8").unwrap(), DType::scalar(DataType::U8));
        assert_eq!(
            DType::parse("float32[3]").unwrap(),
            DType::new(DataType::F32, 3)
        );
        assert_eq!(DType::parse("3*uint8").unwrap(), DType::new(DataType::U8, 3));
        assert!(DType::parse("complex").is_err());
        assert_eq!(DType::new(DataType::U8, 3).to_string(), "uint8[3]");
        assert_eq!(DType::new(DataType::U8, 3).sample_size(), 3);
    }

    #[test]
    fn test_aborted_is_shared() {
        let a = Aborted::new();
        let child = a.clone();
        assert!(child.check().is_ok());
        a.abort();
        assert!(child.is_set());
        assert!(child.check().unwrap_err().is_aborted());
    }

    #[test]
    fn test_timesteps() {
        let mut t = Timesteps::default();
        t.add_range(0.0, 10.0, 2.0);
        assert!(t.contains(4.0));
        assert!(!t.contains(5.0));
        assert!(!t.contains(12.0));
        assert!(Timesteps::star().contains(123.0));
        assert_eq!(t.default_time(), 0.0);
    }
}
