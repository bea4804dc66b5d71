use std::path::Path;

use ndarray::ArrayD;

use crate::dataset::Dataset;
use crate::error::{ReaderError, Result};

/// One proprietary file format per implementation.
///
/// `open` on the concrete type performs the upfront validation (existence,
/// magic, version), `can_read` is the cheap recognition probe used during
/// auto-detection, `read` extracts every dataset the file holds.
pub trait FormatReader {
    fn read(&mut self) -> Result<Vec<Dataset>>;

    fn can_read(&self) -> bool;
}

/// Read the whole file, mapping a missing path to a typed error.
pub(crate) fn read_all(path: &Path) -> Result<Vec<u8>> {
    if !path.is_file() {
        return Err(ReaderError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    Ok(std::fs::read(path)?)
}

/// Lowercased extension without the dot; empty when there is none.
pub(crate) fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

pub(crate) fn has_extension(path: &Path, exts: &[&str]) -> bool {
    let ext = extension_of(path);
    exts.iter().any(|e| *e == ext)
}

/// File stem used as the default dataset title.
pub(crate) fn basename_of(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("dataset")
        .to_string()
}

/// Build an array from a first-index-fastest (column-major) value stream.
pub(crate) fn fortran_array<T: Clone>(values: Vec<T>, shape: &[usize]) -> Result<ArrayD<T>> {
    let mut reversed: Vec<usize> = shape.to_vec();
    reversed.reverse();
    let arr = ArrayD::from_shape_vec(ndarray::IxDyn(&reversed), values)
        .map_err(|e| ReaderError::ShapeMismatch(e.to_string()))?;
    Ok(arr.reversed_axes().as_standard_layout().into_owned())
}

/// Float-first numeric coercion used by instrument text headers: whole
/// floats become integers, everything else stays a string.
pub(crate) fn coerce_number(text: &str) -> crate::dataset::MetaValue {
    use crate::dataset::MetaValue;
    match text.parse::<f64>() {
        Ok(num) => {
            if num.is_finite()
                && num.fract() == 0.0
                && num >= i64::MIN as f64
                && num <= i64::MAX as f64
            {
                MetaValue::Int(num as i64)
            } else {
                MetaValue::Float(num)
            }
        }
        Err(_) => MetaValue::String(text.to_string()),
    }
}
