use std::io::Cursor;
use std::path::{Path, PathBuf};

use ndarray::ArrayD;
use tiff::decoder::{Decoder, DecodingResult};

use crate::dataset::{
    DataBuffer, DataKind, Dataset, Dimension, DimensionKind, MetaMap, MetaValue,
};
use crate::error::{ReaderError, Result};
use crate::reader::{basename_of, extension_of, has_extension, read_all, FormatReader};

/// Plain image files: TIFF frames and whitespace or comma separated
/// numeric grids. Optional block binning and 0-1 normalization.
pub struct ImageReader {
    path: PathBuf,
    bytes: Vec<u8>,
    bin_factor: Option<(usize, usize)>,
    normalize: bool,
}

enum Pixels {
    U8(Vec<u8>),
    U16(Vec<u16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl Pixels {
    fn to_f64(&self) -> Vec<f64> {
        match self {
            Pixels::U8(v) => v.iter().map(|&x| x as f64).collect(),
            Pixels::U16(v) => v.iter().map(|&x| x as f64).collect(),
            Pixels::F32(v) => v.iter().map(|&x| x as f64).collect(),
            Pixels::F64(v) => v.clone(),
        }
    }

    fn into_buffer(self, rows: usize, cols: usize) -> Result<DataBuffer> {
        let dim = ndarray::IxDyn(&[rows, cols]);
        let shaped = |e: ndarray::ShapeError| ReaderError::ShapeMismatch(e.to_string());
        let buffer = match self {
            Pixels::U8(v) => DataBuffer::from(ArrayD::from_shape_vec(dim, v).map_err(shaped)?),
            Pixels::U16(v) => DataBuffer::from(ArrayD::from_shape_vec(dim, v).map_err(shaped)?),
            Pixels::F32(v) => DataBuffer::from(ArrayD::from_shape_vec(dim, v).map_err(shaped)?),
            Pixels::F64(v) => DataBuffer::from(ArrayD::from_shape_vec(dim, v).map_err(shaped)?),
        };
        Ok(buffer)
    }

    /// Collapse interleaved samples to grayscale by averaging.
    fn to_grayscale(self, samples: usize) -> Pixels {
        if samples < 2 {
            return self;
        }
        fn mean<T: Copy + Into<f64>>(v: &[T], samples: usize) -> impl Iterator<Item = f64> + '_ {
            v.chunks_exact(samples)
                .map(move |px| px.iter().map(|&s| s.into()).sum::<f64>() / samples as f64)
        }
        match self {
            Pixels::U8(v) => Pixels::U8(mean(&v, samples).map(|m| m.round() as u8).collect()),
            Pixels::U16(v) => Pixels::U16(mean(&v, samples).map(|m| m.round() as u16).collect()),
            Pixels::F32(v) => Pixels::F32(mean(&v, samples).map(|m| m as f32).collect()),
            Pixels::F64(v) => Pixels::F64(mean(&v, samples).collect()),
        }
    }
}

impl ImageReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let bytes = read_all(&path)?;
        Ok(Self {
            path,
            bytes,
            bin_factor: None,
            normalize: false,
        })
    }

    /// Block-mean downsampling, one factor per axis. Both factors must
    /// divide the image evenly.
    pub fn with_bin_factor(mut self, rows: usize, cols: usize) -> Self {
        self.bin_factor = Some((rows, cols));
        self
    }

    pub fn with_normalize(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }

    fn decode(&self) -> Result<(Pixels, usize, usize)> {
        match extension_of(&self.path).as_str() {
            "txt" => self.decode_grid(None),
            "csv" => self.decode_grid(Some(',')),
            _ => self.decode_tiff(),
        }
    }

    fn decode_tiff(&self) -> Result<(Pixels, usize, usize)> {
        let mut decoder = Decoder::new(Cursor::new(&self.bytes))?;
        let (width, height) = decoder.dimensions()?;
        let (rows, cols) = (height as usize, width as usize);
        if rows * cols == 0 {
            return Err(ReaderError::InvalidFormat("empty image".to_string()));
        }
        let pixels = match decoder.read_image()? {
            DecodingResult::U8(v) => Pixels::U8(v),
            DecodingResult::U16(v) => Pixels::U16(v),
            DecodingResult::F32(v) => Pixels::F32(v),
            DecodingResult::F64(v) => Pixels::F64(v),
            _ => {
                return Err(ReaderError::UnsupportedDataType(
                    "tiff sample format".to_string(),
                ))
            }
        };
        let count = match &pixels {
            Pixels::U8(v) => v.len(),
            Pixels::U16(v) => v.len(),
            Pixels::F32(v) => v.len(),
            Pixels::F64(v) => v.len(),
        };
        if count % (rows * cols) != 0 {
            return Err(ReaderError::InvalidFormat(format!(
                "{} samples do not fill a {}x{} frame",
                count, rows, cols
            )));
        }
        let samples = count / (rows * cols);
        Ok((pixels.to_grayscale(samples), rows, cols))
    }

    fn decode_grid(&self, delimiter: Option<char>) -> Result<(Pixels, usize, usize)> {
        let text = String::from_utf8_lossy(&self.bytes);
        let mut values = Vec::new();
        let mut cols = 0usize;
        let mut rows = 0usize;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let tokens: Vec<&str> = match delimiter {
                Some(d) => line.split(d).map(str::trim).filter(|t| !t.is_empty()).collect(),
                None => line.split_whitespace().collect(),
            };
            if rows == 0 {
                cols = tokens.len();
            } else if tokens.len() != cols {
                return Err(ReaderError::InvalidFormat(format!(
                    "row {} has {} values, expected {}",
                    rows + 1,
                    tokens.len(),
                    cols
                )));
            }
            for tok in tokens {
                let value = tok.parse::<f64>().map_err(|_| {
                    ReaderError::InvalidFormat(format!("non-numeric image entry '{}'", tok))
                })?;
                values.push(value);
            }
            rows += 1;
        }
        if rows == 0 || cols == 0 {
            return Err(ReaderError::InvalidFormat("empty image".to_string()));
        }
        Ok((Pixels::F64(values), rows, cols))
    }
}

impl FormatReader for ImageReader {
    fn can_read(&self) -> bool {
        has_extension(&self.path, &["tif", "tiff", "csv", "txt"])
    }

    fn read(&mut self) -> Result<Vec<Dataset>> {
        let (mut pixels, mut rows, mut cols) = self.decode()?;
        let mut metadata = MetaMap::new();

        if let Some((brow, bcol)) = self.bin_factor {
            if brow == 0 || bcol == 0 {
                return Err(ReaderError::InvalidFormat(
                    "bin factors must be positive".to_string(),
                ));
            }
            if rows % brow != 0 || cols % bcol != 0 {
                return Err(ReaderError::ShapeMismatch(format!(
                    "bin factors ({}, {}) do not divide a {}x{} image",
                    brow, bcol, rows, cols
                )));
            }
            let src = pixels.to_f64();
            let (out_rows, out_cols) = (rows / brow, cols / bcol);
            let mut binned = vec![0f64; out_rows * out_cols];
            for r in 0..rows {
                for c in 0..cols {
                    binned[(r / brow) * out_cols + c / bcol] += src[r * cols + c];
                }
            }
            let block = (brow * bcol) as f64;
            for v in &mut binned {
                *v /= block;
            }
            pixels = Pixels::F64(binned);
            rows = out_rows;
            cols = out_cols;
            metadata.insert(
                "image_binning_size".to_string(),
                MetaValue::List(vec![
                    MetaValue::UInt(brow as u64),
                    MetaValue::UInt(bcol as u64),
                ]),
            );
        }

        if self.normalize {
            let mut values = pixels.to_f64();
            let min = values.iter().copied().fold(f64::INFINITY, f64::min);
            for v in &mut values {
                *v -= min;
            }
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            if max != 0.0 {
                for v in &mut values {
                    *v /= max;
                }
            }
            pixels = Pixels::F64(values);
        }

        let final_values = pixels.to_f64();
        let min = final_values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = final_values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        metadata.insert("normalized".to_string(), MetaValue::Bool(self.normalize));
        metadata.insert("image_min".to_string(), MetaValue::Float(min));
        metadata.insert("image_max".to_string(), MetaValue::Float(max));

        let title = basename_of(&self.path);
        let mut ds = Dataset::new(title, pixels.into_buffer(rows, cols)?);
        ds.data_kind = DataKind::Image;
        ds.units = "a. u.".to_string();
        ds.quantity = "Intensity".to_string();
        ds.source = "ImageReader".to_string();
        ds.set_dimension(
            0,
            Dimension::new(
                (0..rows).map(|i| i as f64).collect(),
                "y",
                "Length",
                "a. u.",
                DimensionKind::Spatial,
            ),
        )?;
        ds.set_dimension(
            1,
            Dimension::new(
                (0..cols).map(|i| i as f64).collect(),
                "x",
                "Length",
                "a. u.",
                DimensionKind::Spatial,
            ),
        )?;
        ds.metadata = metadata;
        Ok(vec![ds])
    }
}
