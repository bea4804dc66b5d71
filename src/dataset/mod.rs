//! Standardized in-memory container produced by every reader.

mod dimension;
mod metadata;

pub use dimension::{linspace, Dimension, DimensionKind};
pub use metadata::{map_to_json, MetaMap, MetaValue};

use ndarray::ArrayD;
use serde::Serialize;

use crate::error::{ReaderError, Result};

/// Classification of what the dataset as a whole represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Unknown,
    Spectrum,
    LinePlot,
    Image,
    ImageStack,
    SpectralImage,
    Image4d,
}

impl DataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Unknown => "unknown",
            DataKind::Spectrum => "spectrum",
            DataKind::LinePlot => "line_plot",
            DataKind::Image => "image",
            DataKind::ImageStack => "image_stack",
            DataKind::SpectralImage => "spectral_image",
            DataKind::Image4d => "image_4d",
        }
    }
}

impl std::fmt::Display for DataKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! with_array {
    ($buffer:expr, $arr:ident => $body:expr) => {
        match $buffer {
            DataBuffer::U8($arr) => $body,
            DataBuffer::I8($arr) => $body,
            DataBuffer::U16($arr) => $body,
            DataBuffer::I16($arr) => $body,
            DataBuffer::U32($arr) => $body,
            DataBuffer::I32($arr) => $body,
            DataBuffer::U64($arr) => $body,
            DataBuffer::I64($arr) => $body,
            DataBuffer::F32($arr) => $body,
            DataBuffer::F64($arr) => $body,
        }
    };
}

/// N-dimensional payload in the element type the file stored
#[derive(Debug, Clone, PartialEq)]
pub enum DataBuffer {
    U8(ArrayD<u8>),
    I8(ArrayD<i8>),
    U16(ArrayD<u16>),
    I16(ArrayD<i16>),
    U32(ArrayD<u32>),
    I32(ArrayD<i32>),
    U64(ArrayD<u64>),
    I64(ArrayD<i64>),
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
}

impl DataBuffer {
    pub fn shape(&self) -> &[usize] {
        with_array!(self, arr => arr.shape())
    }

    pub fn ndim(&self) -> usize {
        with_array!(self, arr => arr.ndim())
    }

    pub fn len(&self) -> usize {
        with_array!(self, arr => arr.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> &'static str {
        match self {
            DataBuffer::U8(_) => "u8",
            DataBuffer::I8(_) => "i8",
            DataBuffer::U16(_) => "u16",
            DataBuffer::I16(_) => "i16",
            DataBuffer::U32(_) => "u32",
            DataBuffer::I32(_) => "i32",
            DataBuffer::U64(_) => "u64",
            DataBuffer::I64(_) => "i64",
            DataBuffer::F32(_) => "f32",
            DataBuffer::F64(_) => "f64",
        }
    }

    /// Widening copy used by normalization and statistics.
    pub fn to_f64(&self) -> ArrayD<f64> {
        with_array!(self, arr => arr.mapv(|v| v as f64))
    }

    pub fn get_f64(&self, index: &[usize]) -> Option<f64> {
        with_array!(self, arr => arr.get(index).map(|v| *v as f64))
    }

    /// Reinterpret the buffer with a new shape holding the same element count.
    pub fn reshape(self, shape: &[usize]) -> Result<DataBuffer> {
        let wanted: usize = shape.iter().product();
        if wanted != self.len() {
            return Err(ReaderError::ShapeMismatch(format!(
                "cannot reshape {} elements into {:?}",
                self.len(),
                shape
            )));
        }
        let dim = ndarray::IxDyn(shape);
        let out = match self {
            DataBuffer::U8(arr) => DataBuffer::U8(reshape_array(arr, dim)?),
            DataBuffer::I8(arr) => DataBuffer::I8(reshape_array(arr, dim)?),
            DataBuffer::U16(arr) => DataBuffer::U16(reshape_array(arr, dim)?),
            DataBuffer::I16(arr) => DataBuffer::I16(reshape_array(arr, dim)?),
            DataBuffer::U32(arr) => DataBuffer::U32(reshape_array(arr, dim)?),
            DataBuffer::I32(arr) => DataBuffer::I32(reshape_array(arr, dim)?),
            DataBuffer::U64(arr) => DataBuffer::U64(reshape_array(arr, dim)?),
            DataBuffer::I64(arr) => DataBuffer::I64(reshape_array(arr, dim)?),
            DataBuffer::F32(arr) => DataBuffer::F32(reshape_array(arr, dim)?),
            DataBuffer::F64(arr) => DataBuffer::F64(reshape_array(arr, dim)?),
        };
        Ok(out)
    }
}

fn reshape_array<T: Clone>(arr: ArrayD<T>, dim: ndarray::IxDyn) -> Result<ArrayD<T>> {
    let standard = if arr.is_standard_layout() {
        arr
    } else {
        arr.as_standard_layout().into_owned()
    };
    standard
        .into_shape(dim)
        .map_err(|e| ReaderError::ShapeMismatch(e.to_string()))
}

impl From<ArrayD<u8>> for DataBuffer {
    fn from(arr: ArrayD<u8>) -> Self {
        DataBuffer::U8(arr)
    }
}

impl From<ArrayD<i8>> for DataBuffer {
    fn from(arr: ArrayD<i8>) -> Self {
        DataBuffer::I8(arr)
    }
}

impl From<ArrayD<u16>> for DataBuffer {
    fn from(arr: ArrayD<u16>) -> Self {
        DataBuffer::U16(arr)
    }
}

impl From<ArrayD<i16>> for DataBuffer {
    fn from(arr: ArrayD<i16>) -> Self {
        DataBuffer::I16(arr)
    }
}

impl From<ArrayD<u32>> for DataBuffer {
    fn from(arr: ArrayD<u32>) -> Self {
        DataBuffer::U32(arr)
    }
}

impl From<ArrayD<i32>> for DataBuffer {
    fn from(arr: ArrayD<i32>) -> Self {
        DataBuffer::I32(arr)
    }
}

impl From<ArrayD<u64>> for DataBuffer {
    fn from(arr: ArrayD<u64>) -> Self {
        DataBuffer::U64(arr)
    }
}

impl From<ArrayD<i64>> for DataBuffer {
    fn from(arr: ArrayD<i64>) -> Self {
        DataBuffer::I64(arr)
    }
}

impl From<ArrayD<f32>> for DataBuffer {
    fn from(arr: ArrayD<f32>) -> Self {
        DataBuffer::F32(arr)
    }
}

impl From<ArrayD<f64>> for DataBuffer {
    fn from(arr: ArrayD<f64>) -> Self {
        DataBuffer::F64(arr)
    }
}

/// Standardized dataset: array payload plus calibrated axes and metadata.
///
/// Dimension count always matches the array rank, and each dimension holds
/// exactly one value per index along its axis.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub title: String,
    pub quantity: String,
    pub units: String,
    pub data_kind: DataKind,
    pub modality: String,
    pub source: String,
    pub data: DataBuffer,
    pub dims: Vec<Dimension>,
    pub metadata: MetaMap,
    pub original_metadata: MetaMap,
}

impl Dataset {
    pub fn new(title: impl Into<String>, data: impl Into<DataBuffer>) -> Self {
        let data = data.into();
        let dims = data
            .shape()
            .iter()
            .enumerate()
            .map(|(i, &len)| Dimension::indices(len, format!("dim_{}", i)))
            .collect();

        Self {
            title: title.into(),
            quantity: "generic".to_string(),
            units: "generic".to_string(),
            data_kind: DataKind::Unknown,
            modality: "generic".to_string(),
            source: "generic".to_string(),
            data,
            dims,
            metadata: MetaMap::new(),
            original_metadata: MetaMap::new(),
        }
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn ndim(&self) -> usize {
        self.data.ndim()
    }

    /// Replace the axis description for `axis`, keeping it consistent with
    /// the array shape.
    pub fn set_dimension(&mut self, axis: usize, dim: Dimension) -> Result<()> {
        let shape = self.data.shape();
        if axis >= shape.len() {
            return Err(ReaderError::ShapeMismatch(format!(
                "axis {} out of range for {}-d data",
                axis,
                shape.len()
            )));
        }
        if dim.len() != shape[axis] {
            return Err(ReaderError::ShapeMismatch(format!(
                "dimension '{}' has {} values, axis {} has length {}",
                dim.name,
                dim.len(),
                axis,
                shape[axis]
            )));
        }
        self.dims[axis] = dim;
        Ok(())
    }

    /// "quantity (units)" label used when annotating plots and printouts.
    pub fn data_descriptor(&self) -> String {
        format!("{} ({})", self.quantity, self.units)
    }

    /// One-line human description used by the CLI.
    pub fn summary(&self) -> String {
        let shape: Vec<String> = self.shape().iter().map(|s| s.to_string()).collect();
        let dims: Vec<String> = self
            .dims
            .iter()
            .map(|d| format!("{} [{}]", d.name, d.units))
            .collect();
        format!(
            "{}: {} {} ({}) axes: {}",
            self.title,
            self.data_kind,
            self.data.dtype(),
            shape.join(" x "),
            dims.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;

    #[test]
    fn new_dataset_gets_index_dimensions() {
        let arr = ArrayD::<f32>::zeros(ndarray::IxDyn(&[3, 5]));
        let ds = Dataset::new("test", arr);
        assert_eq!(ds.ndim(), 2);
        assert_eq!(ds.dims.len(), 2);
        assert_eq!(ds.dims[0].name, "dim_0");
        assert_eq!(ds.dims[1].values.len(), 5);
        assert_eq!(ds.quantity, "generic");
        assert_eq!(ds.data_kind, DataKind::Unknown);
    }

    #[test]
    fn set_dimension_rejects_wrong_length() {
        let arr = ArrayD::<u8>::zeros(ndarray::IxDyn(&[4]));
        let mut ds = Dataset::new("test", arr);
        let bad = Dimension::indices(3, "x");
        assert!(ds.set_dimension(0, bad).is_err());
        assert!(ds.set_dimension(1, Dimension::indices(4, "x")).is_err());
        assert!(ds.set_dimension(0, Dimension::indices(4, "x")).is_ok());
        assert_eq!(ds.dims[0].name, "x");
    }

    #[test]
    fn buffer_widens_to_f64() {
        let arr = ArrayD::from_shape_vec(ndarray::IxDyn(&[2, 2]), vec![1u16, 2, 3, 4]).unwrap();
        let buf = DataBuffer::from(arr);
        assert_eq!(buf.dtype(), "u16");
        assert_eq!(buf.get_f64(&[1, 0]), Some(3.0));
        assert_eq!(buf.get_f64(&[2, 0]), None);
        let wide = buf.to_f64();
        assert_eq!(wide.sum(), 10.0);
    }

    #[test]
    fn reshape_keeps_element_order() {
        let arr = ArrayD::from_shape_vec(ndarray::IxDyn(&[2, 3]), vec![0i32, 1, 2, 3, 4, 5]).unwrap();
        let buf = DataBuffer::from(arr).reshape(&[2, 1, 3]).unwrap();
        assert_eq!(buf.shape(), &[2, 1, 3]);
        assert_eq!(buf.get_f64(&[1, 0, 2]), Some(5.0));
        assert!(buf.reshape(&[4, 2]).is_err());
    }

    #[test]
    fn data_descriptor_matches_quantity_and_units() {
        let arr = ArrayD::<f64>::zeros(ndarray::IxDyn(&[2]));
        let mut ds = Dataset::new("curve", arr);
        ds.quantity = "Current".to_string();
        ds.units = "A".to_string();
        assert_eq!(ds.data_descriptor(), "Current (A)");
    }
}
