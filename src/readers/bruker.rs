use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use ndarray::ArrayD;
use tracing::warn;

use crate::dataset::{
    linspace, DataBuffer, DataKind, Dataset, Dimension, DimensionKind, MetaMap, MetaValue,
};
use crate::error::{ReaderError, Result};
use crate::reader::{coerce_number, read_all, FormatReader};

const FILE_LIST_END: &str = "*File list end";
const IMAGE_LIST: &str = "Ciao image list";
const FORCE_LIST: &str = "Ciao force image list";

/// Bruker Nanoscope AFM files: a text parameter header of `\`-prefixed
/// lines grouped into `\*Class` sections, followed by raw binary layers
/// located by `Data offset` and `Data length`.
pub struct BrukerAfmReader {
    path: PathBuf,
    bytes: Vec<u8>,
}

struct Header {
    /// Image and force channel sections, in file order.
    layers: Vec<(String, MetaMap)>,
    /// Everything else (scan list, equipment list, ...), `Ciao ` stripped.
    other: Vec<(String, MetaMap)>,
}

enum RawVec {
    I16(Vec<i16>),
    I32(Vec<i32>),
}

impl RawVec {
    fn len(&self) -> usize {
        match self {
            RawVec::I16(v) => v.len(),
            RawVec::I32(v) => v.len(),
        }
    }

    fn segment_buffer(&self, start: usize, len: usize) -> Result<DataBuffer> {
        let dim = ndarray::IxDyn(&[len]);
        let buffer = match self {
            RawVec::I16(v) => DataBuffer::from(
                ArrayD::from_shape_vec(dim, v[start..start + len].to_vec())
                    .map_err(|e| ReaderError::ShapeMismatch(e.to_string()))?,
            ),
            RawVec::I32(v) => DataBuffer::from(
                ArrayD::from_shape_vec(dim, v[start..start + len].to_vec())
                    .map_err(|e| ReaderError::ShapeMismatch(e.to_string()))?,
            ),
        };
        Ok(buffer)
    }

    fn segment_f64(&self, start: usize, len: usize) -> Vec<f64> {
        match self {
            RawVec::I16(v) => v[start..start + len].iter().map(|&x| x as f64).collect(),
            RawVec::I32(v) => v[start..start + len].iter().map(|&x| x as f64).collect(),
        }
    }

    fn into_image(self, rows: usize, cols: usize) -> Result<DataBuffer> {
        let dim = ndarray::IxDyn(&[rows, cols]);
        let buffer = match self {
            RawVec::I16(v) => DataBuffer::from(
                ArrayD::from_shape_vec(dim, v).map_err(|e| ReaderError::ShapeMismatch(e.to_string()))?,
            ),
            RawVec::I32(v) => DataBuffer::from(
                ArrayD::from_shape_vec(dim, v).map_err(|e| ReaderError::ShapeMismatch(e.to_string()))?,
            ),
        };
        Ok(buffer)
    }
}

impl BrukerAfmReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let bytes = read_all(&path)?;
        Ok(Self { path, bytes })
    }

    /// Walk header lines up to `\*File list end`, never decoding the
    /// binary section that follows.
    fn parse_header(&self) -> Result<Header> {
        let mut layers: Vec<(String, MetaMap)> = Vec::new();
        let mut other: Vec<(String, MetaMap)> = Vec::new();
        let mut category = String::new();
        let mut section = MetaMap::new();

        let mut flush = |category: &str, section: &mut MetaMap| {
            if section.is_empty() {
                return;
            }
            let taken = std::mem::take(section);
            if category.contains(IMAGE_LIST) || category.contains(FORCE_LIST) {
                let count = layers.iter().filter(|(n, _)| n.contains(category)).count();
                if count == 0 {
                    layers.push((category.to_string(), taken));
                } else {
                    if count == 1 {
                        if let Some(entry) = layers.iter_mut().find(|(n, _)| n == category) {
                            entry.0 = format!("{}_0", category);
                        }
                    }
                    layers.push((format!("{}_{}", category, count), taken));
                }
            } else {
                other.push((category.replace("Ciao ", ""), taken));
            }
        };

        for raw in self.bytes.split(|&b| b == b'\n') {
            let line = String::from_utf8_lossy(raw);
            let trimmed: String = line.trim().chars().filter(|&c| c != '\\' && c != '@').collect();
            let parts: Vec<&str> = trimmed.split(':').collect();

            let (key, value) = match parts.len() {
                1 => {
                    flush(&category, &mut section);
                    if trimmed.contains(FILE_LIST_END) {
                        break;
                    }
                    category = parts[0].replace('*', "");
                    continue;
                }
                2 => (parts[0], parts[1]),
                // Keys like `2:Image Data` fold the numeral into the name.
                3 => (parts[1], parts[2]),
                _ => match trimmed.split_once(':') {
                    Some((k, v)) => {
                        section.insert(k.trim().to_string(), coerce_number(v.trim()));
                        continue;
                    }
                    None => continue,
                },
            };
            let key = if parts.len() == 3 {
                format!("{}_{}", key, parts[0])
            } else {
                key.trim().to_string()
            };
            section.insert(key.trim().to_string(), coerce_number(value.trim()));
        }
        flush(&category, &mut section);

        if layers.is_empty() && other.is_empty() {
            return Err(ReaderError::InvalidFormat(
                "no Nanoscope parameter sections".to_string(),
            ));
        }
        Ok(Header { layers, other })
    }

    /// Pull the binary layer a section points at and strip the locator
    /// keys from the attached metadata.
    fn read_raw(&self, parms: &mut MetaMap) -> Result<RawVec> {
        let offset = remove_usize(parms, "Data offset")?;
        let length = remove_usize(parms, "Data length")?;
        let bpp = remove_usize(parms, "Bytes/pixel")?;
        let end = offset
            .checked_add(length)
            .ok_or_else(|| ReaderError::InvalidFormat("data range overflows".to_string()))?;
        if end > self.bytes.len() {
            return Err(ReaderError::InvalidFormat(format!(
                "data layer at {}+{} runs past end of file ({} bytes)",
                offset,
                length,
                self.bytes.len()
            )));
        }
        let src = &self.bytes[offset..end];
        match bpp {
            2 => {
                let mut values = vec![0i16; length / 2];
                LittleEndian::read_i16_into(&src[..values.len() * 2], &mut values);
                Ok(RawVec::I16(values))
            }
            _ => {
                let mut values = vec![0i32; length / 4];
                LittleEndian::read_i32_into(&src[..values.len() * 4], &mut values);
                Ok(RawVec::I32(values))
            }
        }
    }

    fn read_image_stack(&self, header: &Header) -> Result<Vec<Dataset>> {
        let first = header
            .layers
            .iter()
            .find(|(name, _)| name.contains(IMAGE_LIST))
            .ok_or_else(|| ReaderError::InvalidFormat("no Ciao image list sections".to_string()))?;
        let samps_extent = first.1.get("Samps/line").and_then(MetaValue::as_f64).unwrap_or(0.0);
        let lines_extent = first
            .1
            .get("Number of lines")
            .and_then(MetaValue::as_f64)
            .unwrap_or(0.0);

        let mut datasets = Vec::new();
        for (name, parms) in &header.layers {
            if !name.contains(IMAGE_LIST) {
                continue;
            }
            let mut parms = parms.clone();
            let (title, quantity) = pop_image_data(&mut parms, name);
            let rows = get_usize(&parms, "Number of lines")?;
            let cols = get_usize(&parms, "Samps/line")?;
            let mut raw = self.read_raw(&mut parms)?;
            if raw.len() < rows * cols {
                return Err(ReaderError::InvalidFormat(format!(
                    "layer '{}' holds {} values, expected {}x{}",
                    title,
                    raw.len(),
                    rows,
                    cols
                )));
            }
            if raw.len() > rows * cols {
                warn!(layer = %title, "layer data longer than its scan size, truncating");
                raw = match raw {
                    RawVec::I16(mut v) => {
                        v.truncate(rows * cols);
                        RawVec::I16(v)
                    }
                    RawVec::I32(mut v) => {
                        v.truncate(rows * cols);
                        RawVec::I32(v)
                    }
                };
            }

            let mut ds = Dataset::new(title, raw.into_image(rows, cols)?);
            ds.data_kind = DataKind::Image;
            ds.quantity = quantity;
            ds.units = "nm".to_string();
            ds.source = "BrukerAfmReader".to_string();
            ds.set_dimension(
                0,
                Dimension::new(
                    linspace(0.0, lines_extent, rows),
                    "y",
                    "y",
                    "nm",
                    DimensionKind::Spatial,
                ),
            )?;
            ds.set_dimension(
                1,
                Dimension::new(
                    linspace(0.0, samps_extent, cols),
                    "x",
                    "x",
                    "nm",
                    DimensionKind::Spatial,
                ),
            )?;
            attach_metadata(&mut ds, parms, &header.other);
            datasets.push(ds);
        }
        if datasets.is_empty() {
            return Err(ReaderError::InvalidFormat("no image layers read".to_string()));
        }
        Ok(datasets)
    }

    fn read_force_curves(&self, header: &Header) -> Result<Vec<Dataset>> {
        let mut channels: Vec<(String, String, RawVec, MetaMap)> = Vec::new();
        let mut segment_lens: Vec<usize> = Vec::new();
        for (name, parms) in &header.layers {
            if !name.contains(FORCE_LIST) {
                continue;
            }
            let mut parms = parms.clone();
            let (title, quantity) = pop_image_data(&mut parms, name);
            if segment_lens.is_empty() {
                segment_lens = samps_per_segment(&parms)?;
            }
            let raw = self.read_raw(&mut parms)?;
            channels.push((title, quantity, raw, parms));
        }
        let Some((title, quantity, zraw, zparms)) = channels.first() else {
            return Err(ReaderError::InvalidFormat("no force image list sections".to_string()));
        };
        let seg_len = *segment_lens.first().ok_or_else(|| {
            ReaderError::MetadataParse("force list carries no Samps/line".to_string())
        })?;
        if seg_len == 0 {
            return Err(ReaderError::MetadataParse("zero-length force segment".to_string()));
        }
        if channels.len() < 2 {
            warn!("single force channel, spectral axis falls back to sample index");
        }

        let segments = zraw.len() / seg_len;
        let mut datasets = Vec::new();
        for k in 0..segments {
            let start = k * seg_len;
            let axis = channels
                .get(1)
                .filter(|(_, _, raw, _)| raw.len() >= start + seg_len)
                .map(|(_, _, raw, _)| raw.segment_f64(start, seg_len))
                .unwrap_or_else(|| (0..seg_len).map(|i| i as f64).collect());

            let mut ds = Dataset::new(title.clone(), zraw.segment_buffer(start, seg_len)?);
            ds.data_kind = DataKind::Spectrum;
            ds.quantity = quantity.clone();
            ds.units = "nm".to_string();
            ds.source = "BrukerAfmReader".to_string();
            ds.set_dimension(
                0,
                Dimension::new(axis, "z", "z", "nm", DimensionKind::Spectral),
            )?;
            attach_metadata(&mut ds, zparms.clone(), &header.other);
            datasets.push(ds);
        }
        if datasets.is_empty() {
            return Err(ReaderError::InvalidFormat("no force segments read".to_string()));
        }
        Ok(datasets)
    }
}

impl FormatReader for BrukerAfmReader {
    fn can_read(&self) -> bool {
        self.bytes.starts_with(b"\\*")
    }

    fn read(&mut self) -> Result<Vec<Dataset>> {
        let header = self.parse_header()?;
        let force_count = header.layers.iter().filter(|(n, _)| n.contains(FORCE_LIST)).count();
        let image_count = header.layers.iter().filter(|(n, _)| n.contains(IMAGE_LIST)).count();

        if force_count > 0 && image_count > 0 {
            return Err(ReaderError::Unsupported(
                "Nanoscope force volume maps".to_string(),
            ));
        }
        if force_count > 0 {
            self.read_force_curves(&header)
        } else {
            self.read_image_stack(&header)
        }
    }
}

/// Title is the quoted channel name inside the `Image Data` value.
fn pop_image_data(parms: &mut MetaMap, section: &str) -> (String, String) {
    let key = parms.keys().find(|k| k.starts_with("Image Data")).cloned();
    let value = key.and_then(|k| parms.remove(&k));
    match value.as_ref().and_then(MetaValue::as_str) {
        Some(text) => {
            let title = text
                .split('"')
                .nth(1)
                .map(|t| t.to_string())
                .unwrap_or_else(|| text.to_string());
            (title, text.to_string())
        }
        None => {
            warn!(section, "section carries no Image Data entry");
            (section.to_string(), "intensity".to_string())
        }
    }
}

/// `Samps/line` of a force list holds one integer per ramp segment.
fn samps_per_segment(parms: &MetaMap) -> Result<Vec<usize>> {
    match parms.get("Samps/line") {
        Some(MetaValue::Int(n)) => Ok(vec![usize::try_from(*n).unwrap_or(0)]),
        Some(MetaValue::String(text)) => Ok(text
            .split_whitespace()
            .filter_map(|tok| tok.parse::<usize>().ok())
            .collect()),
        _ => Ok(Vec::new()),
    }
}

fn attach_metadata(ds: &mut Dataset, mut parms: MetaMap, other: &[(String, MetaMap)]) {
    for (name, section) in other {
        parms.insert(name.clone(), MetaValue::Map(section.clone()));
    }
    ds.original_metadata = parms;
}

fn get_usize(parms: &MetaMap, key: &str) -> Result<usize> {
    parms
        .get(key)
        .and_then(MetaValue::as_u64)
        .and_then(|v| usize::try_from(v).ok())
        .ok_or_else(|| ReaderError::MetadataParse(format!("missing or invalid '{}'", key)))
}

fn remove_usize(parms: &mut MetaMap, key: &str) -> Result<usize> {
    let value = parms
        .remove(key)
        .and_then(|v| v.as_u64())
        .and_then(|v| usize::try_from(v).ok())
        .ok_or_else(|| ReaderError::MetadataParse(format!("missing or invalid '{}'", key)))?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_file() -> Vec<u8> {
        let mut header = String::new();
        header.push_str("\\*File list\r\n");
        header.push_str("\\Version: 0x09300201\r\n");
        header.push_str("\\Date: 10:30:15 AM\r\n");
        header.push_str("\\*Ciao scan list\r\n");
        header.push_str("\\Scan Size: 2000 nm\r\n");
        header.push_str("\\Samps/line: 2\r\n");
        header.push_str("\\*Ciao image list\r\n");
        header.push_str("\\Data offset: 512\r\n");
        header.push_str("\\Data length: 12\r\n");
        header.push_str("\\Bytes/pixel: 2\r\n");
        header.push_str("\\Samps/line: 2\r\n");
        header.push_str("\\Number of lines: 3\r\n");
        header.push_str("\\@2:Image Data: S [Height] \"Height\"\r\n");
        header.push_str("\\*Ciao image list\r\n");
        header.push_str("\\Data offset: 524\r\n");
        header.push_str("\\Data length: 12\r\n");
        header.push_str("\\Bytes/pixel: 2\r\n");
        header.push_str("\\Samps/line: 2\r\n");
        header.push_str("\\Number of lines: 3\r\n");
        header.push_str("\\@2:Image Data: S [Phase] \"Phase\"\r\n");
        header.push_str("\\*File list end\r\n");

        let mut bytes = header.into_bytes();
        bytes.resize(512, 0);
        for v in 0..6i16 {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        for v in 10..16i16 {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes
    }

    fn force_file() -> Vec<u8> {
        let mut header = String::new();
        header.push_str("\\*File list\r\n");
        header.push_str("\\Version: 0x09300201\r\n");
        header.push_str("\\*Ciao force image list\r\n");
        header.push_str("\\Data offset: 512\r\n");
        header.push_str("\\Data length: 16\r\n");
        header.push_str("\\Bytes/pixel: 2\r\n");
        header.push_str("\\Samps/line: 4 4\r\n");
        header.push_str("\\@4:Image Data: S [DeflectionError] \"Deflection Error\"\r\n");
        header.push_str("\\*Ciao force image list\r\n");
        header.push_str("\\Data offset: 528\r\n");
        header.push_str("\\Data length: 16\r\n");
        header.push_str("\\Bytes/pixel: 2\r\n");
        header.push_str("\\Samps/line: 4 4\r\n");
        header.push_str("\\@4:Image Data: S [ZSensor] \"Height Sensor\"\r\n");
        header.push_str("\\*File list end\r\n");

        let mut bytes = header.into_bytes();
        bytes.resize(512, 0);
        for v in 0..8i16 {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        for v in 100..108i16 {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes
    }

    fn write_temp(dir: &tempfile::TempDir, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join("scan.001");
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn image_channels_become_named_images() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, &image_file());
        let mut reader = BrukerAfmReader::open(&path).unwrap();
        assert!(reader.can_read());

        let datasets = reader.read().unwrap();
        assert_eq!(datasets.len(), 2);
        assert_eq!(datasets[0].title, "Height");
        assert_eq!(datasets[1].title, "Phase");
        assert_eq!(datasets[0].shape(), &[3, 2]);
        assert_eq!(datasets[0].data_kind, DataKind::Image);
        // Row-major layout: row 2, column 1 is the sixth value.
        assert_eq!(datasets[0].data.get_f64(&[2, 1]), Some(5.0));
        assert_eq!(datasets[1].data.get_f64(&[0, 0]), Some(10.0));
        assert_eq!(datasets[0].dims[0].name, "y");
        assert_eq!(datasets[0].dims[0].values.len(), 3);
        assert_eq!(datasets[0].dims[1].values, vec![0.0, 2.0]);
        // Locator keys are stripped, the rest of the section is attached.
        assert!(!datasets[0].original_metadata.contains_key("Data offset"));
        assert_eq!(
            datasets[0].original_metadata.get("Number of lines"),
            Some(&MetaValue::Int(3))
        );
        match datasets[0].original_metadata.get("scan list") {
            Some(MetaValue::Map(scan)) => {
                assert_eq!(
                    scan.get("Scan Size"),
                    Some(&MetaValue::String("2000 nm".to_string()))
                );
            }
            other => panic!("expected nested scan list, got {:?}", other),
        }
    }

    #[test]
    fn force_segments_use_the_second_channel_axis() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, &force_file());
        let datasets = BrukerAfmReader::open(&path).unwrap().read().unwrap();

        assert_eq!(datasets.len(), 2);
        assert_eq!(datasets[0].title, "Deflection Error");
        assert_eq!(datasets[0].data_kind, DataKind::Spectrum);
        assert_eq!(datasets[0].shape(), &[4]);
        assert_eq!(datasets[0].data.get_f64(&[3]), Some(3.0));
        assert_eq!(datasets[1].data.get_f64(&[0]), Some(4.0));
        assert_eq!(datasets[0].dims[0].name, "z");
        assert_eq!(datasets[0].dims[0].values, vec![100.0, 101.0, 102.0, 103.0]);
        assert_eq!(datasets[1].dims[0].values, vec![104.0, 105.0, 106.0, 107.0]);
    }

    #[test]
    fn mixed_image_and_force_sections_are_rejected() {
        let mut text = String::new();
        text.push_str("\\*Ciao image list\r\n\\Data offset: 0\r\n");
        text.push_str("\\*Ciao force image list\r\n\\Data offset: 0\r\n");
        text.push_str("\\*File list end\r\n");
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, text.as_bytes());
        match BrukerAfmReader::open(&path).unwrap().read() {
            Err(ReaderError::Unsupported(_)) => {}
            other => panic!("expected Unsupported, got {:?}", other.map(|d| d.len())),
        }
    }
}
