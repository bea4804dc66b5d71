use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use tracing::warn;

use crate::dataset::{DataBuffer, DataKind, Dataset, Dimension, DimensionKind, MetaMap, MetaValue};
use crate::error::{ReaderError, Result};
use crate::reader::{basename_of, fortran_array, has_extension, read_all, FormatReader};

const TAG_DATA: u8 = 21;
const DATA_MARKER: &[u8] = b"%%%%";

/// Gatan DigitalMicrograph `.dm3` / `.dm4` files.
///
/// The file is one big tag tree. Image payloads live under
/// `ImageList.<n>.ImageData.Data` with their shape in `Dimensions` and the
/// axis calibrations in `Calibrations.Dimension`.
pub struct DmReader {
    path: PathBuf,
    bytes: Vec<u8>,
    version: u32,
    root_len: u64,
    little_endian: bool,
    header_size: usize,
}

impl DmReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let bytes = read_all(&path)?;
        if bytes.len() < 4 {
            return Err(ReaderError::InvalidFormat("file too short for a DM header".to_string()));
        }
        let version = BigEndian::read_u32(&bytes[0..4]);
        let (root_len, flag, header_size) = match version {
            3 if bytes.len() >= 12 => {
                (BigEndian::read_u32(&bytes[4..8]) as u64, BigEndian::read_u32(&bytes[8..12]), 12)
            }
            4 if bytes.len() >= 16 => {
                (BigEndian::read_u64(&bytes[4..12]), BigEndian::read_u32(&bytes[12..16]), 16)
            }
            3 | 4 => {
                return Err(ReaderError::InvalidFormat("file too short for a DM header".to_string()))
            }
            other => {
                return Err(ReaderError::InvalidFormat(format!(
                    "version tag {} is not DigitalMicrograph 3 or 4",
                    other
                )))
            }
        };
        Ok(Self {
            path,
            bytes,
            version,
            root_len,
            // Tag data is little-endian on normal files; the header flag
            // switches the whole stream to big-endian when zero.
            little_endian: flag == 1,
            header_size,
        })
    }

    fn image_entry_to_dataset(&self, entry: &MetaMap) -> Result<Option<Dataset>> {
        let image_data = match entry.get("ImageData").and_then(MetaValue::as_map) {
            Some(map) => map,
            None => return Ok(None),
        };
        let payload = match image_data.get("Data") {
            Some(MetaValue::Bytes(bytes)) => bytes,
            Some(_) => {
                return Err(ReaderError::UnsupportedDataType(
                    "image data is not a raw buffer".to_string(),
                ))
            }
            None => return Ok(None),
        };
        let pixel_type = image_data
            .get("DataType")
            .and_then(MetaValue::as_i64)
            .ok_or_else(|| ReaderError::MetadataParse("image entry lacks a DataType tag".to_string()))?;
        let dims_group = image_data
            .get("Dimensions")
            .and_then(MetaValue::as_map)
            .ok_or_else(|| ReaderError::MetadataParse("image entry lacks a Dimensions group".to_string()))?;
        let mut shape = Vec::new();
        for (_, value) in numeric_entries(dims_group) {
            let len = value
                .as_i64()
                .and_then(|v| usize::try_from(v).ok())
                .ok_or_else(|| ReaderError::MetadataParse("bad Dimensions entry".to_string()))?;
            shape.push(len);
        }
        if shape.is_empty() {
            return Err(ReaderError::InvalidFormat("empty Dimensions group".to_string()));
        }

        let mut buffer = decode_pixels(payload, pixel_type, &shape)?;
        let title = entry
            .get("Name")
            .and_then(MetaValue::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| basename_of(&self.path));

        let mut dims: Vec<Option<Dimension>> = vec![None; shape.len()];
        match image_data
            .get("Calibrations")
            .and_then(MetaValue::as_map)
            .and_then(|c| c.get("Dimension"))
            .and_then(MetaValue::as_map)
        {
            Some(calibrations) => {
                let mut reciprocal_name = 'u';
                let mut spatial_name = 'x';
                for (axis, tags) in numeric_entries(calibrations) {
                    let axis = axis as usize;
                    let tags = match tags.as_map() {
                        Some(map) if axis < shape.len() => map,
                        _ => continue,
                    };
                    let dim = calibrated_dimension(
                        tags,
                        shape[axis],
                        &mut reciprocal_name,
                        &mut spatial_name,
                    );
                    dims[axis] = Some(dim);
                }
            }
            None => warn!(title = %title, "image entry lacks calibration tags"),
        }

        let spectral_dim = dims
            .iter()
            .flatten()
            .any(|d| d.kind == DimensionKind::Spectral);
        let has_si = entry
            .get("ImageTags")
            .and_then(MetaValue::as_map)
            .map_or(false, |tags| tags.contains_key("SI"));

        let ndim = shape.len();
        let mut survey_image = false;
        let mut kind = DataKind::Unknown;
        if has_si {
            kind = if ndim == 3 || spectral_dim {
                DataKind::SpectralImage
            } else {
                survey_image = true;
                DataKind::Image
            };
        }
        if kind == DataKind::Unknown {
            kind = match ndim {
                n if n > 3 => {
                    return Err(ReaderError::Unsupported(format!(
                        "{}-dimensional image data",
                        n
                    )))
                }
                3 => {
                    if spectral_dim {
                        DataKind::SpectralImage
                    } else {
                        DataKind::ImageStack
                    }
                }
                2 => {
                    if spectral_dim {
                        DataKind::SpectralImage
                    } else {
                        DataKind::Image
                    }
                }
                _ => {
                    if spectral_dim {
                        DataKind::Spectrum
                    } else {
                        DataKind::LinePlot
                    }
                }
            };
        }
        if kind == DataKind::Image {
            for dim in dims.iter_mut().flatten() {
                if dim.name == "x" || dim.name == "y" {
                    dim.kind = DimensionKind::Spatial;
                }
            }
        }

        // A calibrated spectral axis on 2-d data marks a line scan; widen it
        // to a one-pixel spectral image.
        if spectral_dim && ndim == 2 {
            buffer = buffer.reshape(&[shape[0], 1, shape[1]])?;
            let line_dim = Dimension::new(vec![1.0], "y", "distance", "pixels", DimensionKind::Spatial);
            dims = vec![dims[0].take(), Some(line_dim), dims[1].take()];
            kind = DataKind::SpectralImage;
        }

        let mut ds = Dataset::new(title, buffer);
        ds.data_kind = kind;
        for (axis, dim) in dims.into_iter().enumerate() {
            if let Some(dim) = dim {
                ds.set_dimension(axis, dim)?;
            }
        }
        if survey_image {
            ds.metadata
                .insert("image_type".to_string(), MetaValue::from("survey image"));
        }
        let mut meta = entry.clone();
        if let Some(MetaValue::Map(image_data)) = meta.get_mut("ImageData") {
            image_data.insert("Data".to_string(), MetaValue::from("read"));
        }
        ds.original_metadata = meta;
        Ok(Some(ds))
    }
}

impl FormatReader for DmReader {
    fn can_read(&self) -> bool {
        has_extension(&self.path, &["dm3", "dm4"])
    }

    fn read(&mut self) -> Result<Vec<Dataset>> {
        let mut cursor = TagCursor {
            buf: &self.bytes,
            pos: self.header_size,
            little: self.little_endian,
            dm4: self.version == 4,
        };
        let mut stored = MetaMap::new();
        cursor.read_tag_group(&mut stored)?;
        stored.insert(
            "original_filename".to_string(),
            MetaValue::String(self.path.display().to_string()),
        );

        let mut dm_info = MetaMap::new();
        dm_info.insert("dm_version".to_string(), MetaValue::Int(self.version as i64));
        dm_info.insert("file_size".to_string(), MetaValue::UInt(self.root_len));
        dm_info.insert(
            "full_file_name".to_string(),
            MetaValue::String(self.path.display().to_string()),
        );

        let image_list = match stored.remove("ImageList") {
            Some(MetaValue::Map(map)) => map,
            _ => {
                return Err(ReaderError::InvalidFormat(
                    "file holds no ImageList tag group".to_string(),
                ))
            }
        };
        // Image 0 is the thumbnail whenever a second image exists.
        let start = if image_list.contains_key("1") { 1 } else { 0 };

        let mut datasets = Vec::new();
        for (index, entry) in numeric_entries(&image_list) {
            if index < start {
                continue;
            }
            let entry = match entry.as_map() {
                Some(map) => map,
                None => continue,
            };
            if let Some(mut ds) = self.image_entry_to_dataset(entry)? {
                ds.quantity = "intensity".to_string();
                ds.units = "counts".to_string();
                ds.modality = "generic".to_string();
                ds.source = "DmReader".to_string();
                ds.original_metadata
                    .insert("DM".to_string(), MetaValue::Map(dm_info.clone()));
                datasets.push(ds);
            }
        }
        if datasets.is_empty() {
            return Err(ReaderError::InvalidFormat(
                "file holds no readable image data".to_string(),
            ));
        }

        // Residual root tags go to the survey image when one is present,
        // otherwise to the first dataset.
        let mut main = 0;
        for (index, ds) in datasets.iter().enumerate() {
            if ds.title.contains("urvey") {
                main = index;
            }
        }
        for (key, value) in stored {
            datasets[main].original_metadata.insert(key, value);
        }
        Ok(datasets)
    }
}

fn numeric_entries(map: &MetaMap) -> Vec<(u64, &MetaValue)> {
    let mut out: Vec<(u64, &MetaValue)> = map
        .iter()
        .filter_map(|(key, value)| key.parse::<u64>().ok().map(|index| (index, value)))
        .collect();
    out.sort_by_key(|(index, _)| *index);
    out
}

fn calibrated_dimension(
    tags: &MetaMap,
    len: usize,
    reciprocal_name: &mut char,
    spatial_name: &mut char,
) -> Dimension {
    let origin = tags.get("Origin").and_then(MetaValue::as_f64).unwrap_or(0.0);
    let mut scale = tags.get("Scale").and_then(MetaValue::as_f64).unwrap_or(1.0);
    let mut units = tags
        .get("Units")
        .and_then(MetaValue::as_str)
        .unwrap_or("")
        .to_string();
    // Zeiss spectrum images calibrate in micrometres at a nanometre scale.
    if units == "\u{b5}m" {
        units = "nm".to_string();
        scale *= 1000.0;
    }
    let effective = if units.trim().is_empty() {
        "counts".to_string()
    } else {
        units.clone()
    };
    let values: Vec<f64> = (0..len).map(|i| (i as f64 - origin) * scale).collect();

    if effective == "eV" {
        Dimension::new(values, "energy_loss", "energy-loss", effective, DimensionKind::Spectral)
    } else if effective.contains("eV") {
        Dimension::new(values, "energy", "energy", effective, DimensionKind::Spectral)
    } else if effective.contains("1/") || effective == "mrad" || effective == "rad" {
        let name = reciprocal_name.to_string();
        *reciprocal_name = bump_axis_name(*reciprocal_name);
        Dimension::new(values, name, "reciprocal distance", effective, DimensionKind::Reciprocal)
    } else if effective.contains('m') {
        let name = spatial_name.to_string();
        *spatial_name = bump_axis_name(*spatial_name);
        Dimension::new(values, name, "distance", effective, DimensionKind::Spatial)
    } else {
        let name = spatial_name.to_string();
        *spatial_name = bump_axis_name(*spatial_name);
        Dimension::new(values, name, "number", "frame", DimensionKind::Temporal)
    }
}

fn bump_axis_name(name: char) -> char {
    (name as u8 + 1) as char
}

fn decode_pixels(payload: &[u8], pixel_type: i64, shape: &[usize]) -> Result<DataBuffer> {
    let count = shape
        .iter()
        .try_fold(1usize, |acc, &s| acc.checked_mul(s))
        .ok_or_else(|| ReaderError::InvalidFormat("image shape overflows".to_string()))?;

    fn checked<'a>(payload: &'a [u8], count: usize, width: usize) -> Result<&'a [u8]> {
        let needed = count
            .checked_mul(width)
            .ok_or_else(|| ReaderError::InvalidFormat("image shape overflows".to_string()))?;
        if payload.len() < needed {
            return Err(ReaderError::InvalidFormat(format!(
                "image data holds {} bytes, {} needed",
                payload.len(),
                needed
            )));
        }
        Ok(&payload[..needed])
    }

    // Pixel data is little-endian no matter what the tag stream uses.
    let buffer = match pixel_type {
        1 | 10 => {
            let src = checked(payload, count, 2)?;
            let mut out = vec![0u16; count];
            LittleEndian::read_u16_into(src, &mut out);
            fortran_array(out, shape)?.into()
        }
        2 => {
            let src = checked(payload, count, 4)?;
            let mut out = vec![0f32; count];
            LittleEndian::read_f32_into(src, &mut out);
            fortran_array(out, shape)?.into()
        }
        6 => {
            let src = checked(payload, count, 1)?;
            fortran_array(src.to_vec(), shape)?.into()
        }
        7 => {
            let src = checked(payload, count, 4)?;
            let mut out = vec![0i32; count];
            LittleEndian::read_i32_into(src, &mut out);
            fortran_array(out, shape)?.into()
        }
        9 => {
            let src = checked(payload, count, 1)?;
            let out: Vec<i8> = src.iter().map(|&b| b as i8).collect();
            fortran_array(out, shape)?.into()
        }
        11 => {
            let src = checked(payload, count, 4)?;
            let mut out = vec![0u32; count];
            LittleEndian::read_u32_into(src, &mut out);
            fortran_array(out, shape)?.into()
        }
        12 => {
            let src = checked(payload, count, 8)?;
            let mut out = vec![0f64; count];
            LittleEndian::read_f64_into(src, &mut out);
            fortran_array(out, shape)?.into()
        }
        14 => {
            let src = checked(payload, count, 1)?;
            fortran_array(src.to_vec(), shape)?.into()
        }
        other => {
            return Err(ReaderError::UnsupportedDataType(format!(
                "pixel data type {}",
                other
            )))
        }
    };
    Ok(buffer)
}

macro_rules! endian_read {
    ($name:ident, $t:ty, $method:ident) => {
        fn $name(&self, bytes: &[u8]) -> $t {
            if self.little {
                LittleEndian::$method(bytes)
            } else {
                BigEndian::$method(bytes)
            }
        }
    };
}

struct TagCursor<'a> {
    buf: &'a [u8],
    pos: usize,
    little: bool,
    dm4: bool,
}

impl<'a> TagCursor<'a> {
    endian_read!(order_i16, i16, read_i16);
    endian_read!(order_u16, u16, read_u16);
    endian_read!(order_i32, i32, read_i32);
    endian_read!(order_u32, u32, read_u32);
    endian_read!(order_i64, i64, read_i64);
    endian_read!(order_u64, u64, read_u64);
    endian_read!(order_f32, f32, read_f32);
    endian_read!(order_f64, f64, read_f64);

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| {
                ReaderError::InvalidFormat(format!("tag stream ends early at offset {}", self.pos))
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Group and definition counts are big-endian in both versions.
    fn read_count(&mut self) -> Result<u64> {
        if self.dm4 {
            Ok(BigEndian::read_u64(self.take(8)?))
        } else {
            let n = BigEndian::read_i32(self.take(4)?);
            u64::try_from(n)
                .map_err(|_| ReaderError::InvalidFormat(format!("negative tag count {}", n)))
        }
    }

    fn read_tag_group(&mut self, tags: &mut MetaMap) -> Result<()> {
        let _sorted = self.take(1)?;
        let _open = self.take(1)?;
        let num_tags = self.read_count()?;
        for _ in 0..num_tags {
            let tag_type = self.take(1)?[0];
            let mut label = self.read_tag_name()?;
            if self.dm4 {
                let _data_len = self.take(8)?;
            }
            if label == "0" {
                label = next_numeric_label(tags);
            }
            if tag_type == TAG_DATA {
                let value = self.read_tag_data()?;
                tags.insert(label, value);
            } else {
                let mut group = MetaMap::new();
                self.read_tag_group(&mut group)?;
                tags.insert(label, MetaValue::Map(group));
            }
        }
        Ok(())
    }

    fn read_tag_name(&mut self) -> Result<String> {
        let len = BigEndian::read_u16(self.take(2)?) as usize;
        if len == 0 {
            return Ok("0".to_string());
        }
        Ok(String::from_utf8_lossy(self.take(len)?).into_owned())
    }

    fn read_tag_data(&mut self) -> Result<MetaValue> {
        let marker_at = self.pos;
        if self.take(4)? != DATA_MARKER {
            return Err(ReaderError::InvalidFormat(format!(
                "tag data marker missing at offset {}",
                marker_at
            )));
        }
        let types = self.read_definition()?;
        match types.first().copied() {
            Some(code) if code < 13 => self.read_native(code),
            Some(18) => {
                let len = types.get(1).copied().unwrap_or(0).max(0) as usize;
                self.read_utf16(len)
            }
            Some(15) => self.read_struct(&types),
            Some(20) => self.read_array(&types),
            Some(other) => Err(ReaderError::UnsupportedDataType(format!(
                "tag type {}",
                other
            ))),
            None => Err(ReaderError::InvalidFormat("empty tag type definition".to_string())),
        }
    }

    fn read_definition(&mut self) -> Result<Vec<i64>> {
        let n = self.read_count()? as usize;
        let width = if self.dm4 { 8 } else { 4 };
        if n.checked_mul(width)
            .and_then(|bytes| self.pos.checked_add(bytes))
            .map_or(true, |end| end > self.buf.len())
        {
            return Err(ReaderError::InvalidFormat(format!(
                "tag type definition of {} entries overruns the file",
                n
            )));
        }
        let mut types = Vec::with_capacity(n);
        for _ in 0..n {
            let entry = if self.dm4 {
                BigEndian::read_i64(self.take(8)?)
            } else {
                BigEndian::read_i32(self.take(4)?) as i64
            };
            types.push(entry);
        }
        Ok(types)
    }

    fn read_native(&mut self, code: i64) -> Result<MetaValue> {
        let width = native_size(code).ok_or_else(|| {
            ReaderError::UnsupportedDataType(format!("scalar type {}", code))
        })?;
        let bytes = self.take(width)?;
        let value = match code {
            2 => MetaValue::Int(self.order_i16(bytes) as i64),
            3 => MetaValue::Int(self.order_i32(bytes) as i64),
            4 => MetaValue::UInt(self.order_u16(bytes) as u64),
            5 => MetaValue::UInt(self.order_u32(bytes) as u64),
            6 => MetaValue::Float(self.order_f32(bytes) as f64),
            7 => MetaValue::Float(self.order_f64(bytes)),
            8 | 9 => MetaValue::UInt(bytes[0] as u64),
            10 => MetaValue::Int(bytes[0] as i8 as i64),
            11 => MetaValue::Int(self.order_i64(bytes)),
            _ => MetaValue::UInt(self.order_u64(bytes)),
        };
        Ok(value)
    }

    /// Struct field types sit at every second definition entry from index 4.
    fn read_struct(&mut self, types: &[i64]) -> Result<MetaValue> {
        let mut fields = Vec::new();
        for code in types.get(4..).unwrap_or(&[]).iter().step_by(2) {
            fields.push(self.read_native(*code)?);
        }
        Ok(MetaValue::List(fields))
    }

    fn read_array(&mut self, types: &[i64]) -> Result<MetaValue> {
        if types.len() < 3 {
            return Err(ReaderError::InvalidFormat("short array type definition".to_string()));
        }
        let count = usize::try_from(*types.last().unwrap_or(&0))
            .map_err(|_| ReaderError::InvalidFormat("negative array length".to_string()))?;
        match types[1] {
            15 => {
                let struct_types = &types[1..];
                let mut items = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    items.push(self.read_struct(struct_types)?);
                }
                Ok(MetaValue::List(items))
            }
            20 => Err(ReaderError::UnsupportedDataType("nested tag arrays".to_string())),
            elem => {
                if types.len() != 3 {
                    return Err(ReaderError::InvalidFormat(
                        "malformed array type definition".to_string(),
                    ));
                }
                let width = native_size(elem).ok_or_else(|| {
                    ReaderError::UnsupportedDataType(format!("array element type {}", elem))
                })?;
                let bytes = count.checked_mul(width).ok_or_else(|| {
                    ReaderError::InvalidFormat("array length overflows".to_string())
                })?;
                // Short u16 arrays are UTF-16 text; anything else stays raw.
                if elem == 4 && count < 256 {
                    self.read_utf16(bytes)
                } else {
                    Ok(MetaValue::Bytes(self.take(bytes)?.to_vec()))
                }
            }
        }
    }

    fn read_utf16(&mut self, byte_len: usize) -> Result<MetaValue> {
        if byte_len == 0 {
            return Ok(MetaValue::String(String::new()));
        }
        let bytes = self.take(byte_len)?;
        if bytes.len() % 2 != 0 {
            return Err(ReaderError::Utf16Decode("odd string byte length".to_string()));
        }
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        let text = String::from_utf16(&units)
            .map_err(|e| ReaderError::Utf16Decode(e.to_string()))?;
        Ok(MetaValue::String(text))
    }
}

fn native_size(code: i64) -> Option<usize> {
    match code {
        8 | 9 | 10 => Some(1),
        2 | 4 => Some(2),
        3 | 5 | 6 => Some(4),
        7 | 11 | 12 => Some(8),
        _ => None,
    }
}

/// Unnamed tags get the next free number in their group.
fn next_numeric_label(tags: &MetaMap) -> String {
    tags.keys()
        .filter_map(|key| key.parse::<u64>().ok())
        .max()
        .map(|last| (last + 1).to_string())
        .unwrap_or_else(|| "0".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag_name(name: &str) -> Vec<u8> {
        let mut out = (name.len() as u16).to_be_bytes().to_vec();
        out.extend_from_slice(name.as_bytes());
        out
    }

    fn definition(types: &[i32]) -> Vec<u8> {
        let mut out = (types.len() as i32).to_be_bytes().to_vec();
        for t in types {
            out.extend_from_slice(&t.to_be_bytes());
        }
        out
    }

    fn data_tag(name: &str, types: &[i32], payload: &[u8]) -> Vec<u8> {
        let mut out = vec![TAG_DATA];
        out.extend(tag_name(name));
        out.extend_from_slice(DATA_MARKER);
        out.extend(definition(types));
        out.extend_from_slice(payload);
        out
    }

    fn group_tag(name: &str, body: &[u8]) -> Vec<u8> {
        let mut out = vec![20];
        out.extend(tag_name(name));
        out.extend(group(body));
        out
    }

    fn group(entries: &[u8]) -> Vec<u8> {
        let mut out = vec![1, 0];
        let count = count_tags(entries);
        out.extend_from_slice(&(count as i32).to_be_bytes());
        out.extend_from_slice(entries);
        out
    }

    // Test entries are concatenated pre-encoded tags; count them by walking
    // the same structure the parser walks.
    fn count_tags(entries: &[u8]) -> usize {
        let mut cursor = TagCursor {
            buf: entries,
            pos: 0,
            little: true,
            dm4: false,
        };
        let mut count = 0;
        while cursor.pos < entries.len() {
            let tag_type = cursor.take(1).unwrap()[0];
            cursor.read_tag_name().unwrap();
            if tag_type == TAG_DATA {
                cursor.read_tag_data().unwrap();
            } else {
                let mut sub = MetaMap::new();
                cursor.read_tag_group(&mut sub).unwrap();
            }
            count += 1;
        }
        count
    }

    fn utf16_tag(name: &str, text: &str) -> Vec<u8> {
        let payload: Vec<u8> = text.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        data_tag(name, &[20, 4, text.encode_utf16().count() as i32], &payload)
    }

    fn u32_tag(name: &str, value: u32) -> Vec<u8> {
        data_tag(name, &[5], &value.to_le_bytes())
    }

    fn f32_tag(name: &str, value: f32) -> Vec<u8> {
        data_tag(name, &[6], &value.to_le_bytes())
    }

    fn calibration(origin: f32, scale: f32, units: &str) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend(f32_tag("Origin", origin));
        body.extend(f32_tag("Scale", scale));
        body.extend(utf16_tag("Units", units));
        group_tag("", &body)
    }

    fn dm3_file(image_list_body: &[u8]) -> Vec<u8> {
        let mut root = Vec::new();
        root.extend(group_tag("ImageList", image_list_body));
        root.extend(utf16_tag("InstrumentName", "test scope"));
        let tree = group(&root);

        let mut file = Vec::new();
        file.extend_from_slice(&3u32.to_be_bytes());
        file.extend_from_slice(&(tree.len() as u32).to_be_bytes());
        file.extend_from_slice(&1u32.to_be_bytes());
        file.extend(tree);
        file
    }

    fn image_entry(name: &str, shape: &[u32], units: &[&str], pixels: &[f32]) -> Vec<u8> {
        let payload: Vec<u8> = pixels.iter().flat_map(|v| v.to_le_bytes()).collect();

        let mut dims = Vec::new();
        for &len in shape {
            dims.extend(u32_tag("", len));
        }
        let mut cals = Vec::new();
        for &unit in units {
            cals.extend(calibration(0.0, 1.0, unit));
        }

        let mut image_data = Vec::new();
        image_data.extend(data_tag("Data", &[20, 6, pixels.len() as i32], &payload));
        image_data.extend(u32_tag("DataType", 2));
        image_data.extend(group_tag("Dimensions", &dims));
        image_data.extend(group_tag("Calibrations", &group_tag("Dimension", &cals)));

        let mut entry = Vec::new();
        entry.extend(group_tag("ImageData", &image_data));
        entry.extend(utf16_tag("Name", name));
        group_tag("", &entry)
    }

    fn write_temp(dir: &tempfile::TempDir, bytes: &[u8], name: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn image_pixels_are_first_index_fastest() {
        let entry = image_entry(
            "test image",
            &[2, 3],
            &["nm", "nm"],
            &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0],
        );
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, &dm3_file(&entry), "image.dm3");
        let mut reader = DmReader::open(&path).unwrap();
        let datasets = reader.read().unwrap();
        assert_eq!(datasets.len(), 1);

        let ds = &datasets[0];
        assert_eq!(ds.title, "test image");
        assert_eq!(ds.shape(), &[2, 3]);
        assert_eq!(ds.data_kind, DataKind::Image);
        assert_eq!(ds.quantity, "intensity");
        assert_eq!(ds.dims[0].name, "x");
        assert_eq!(ds.dims[1].name, "y");
        assert_eq!(ds.dims[0].kind, DimensionKind::Spatial);
        // Element (1, 2) sits at offset 1 + 2 * 2 in the stored buffer.
        assert_eq!(ds.data.get_f64(&[1, 2]), Some(5.0));
        // Residual root tags land on the first dataset.
        assert!(ds.original_metadata.contains_key("InstrumentName"));
        assert!(ds.original_metadata.contains_key("DM"));
    }

    #[test]
    fn spectral_axis_makes_a_spectrum() {
        let entry = image_entry("eels", &[4], &["eV"], &[1.0, 2.0, 3.0, 4.0]);
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, &dm3_file(&entry), "spectrum.dm3");
        let mut reader = DmReader::open(&path).unwrap();
        let datasets = reader.read().unwrap();
        assert_eq!(datasets[0].data_kind, DataKind::Spectrum);
        assert_eq!(datasets[0].dims[0].name, "energy_loss");
        assert_eq!(datasets[0].dims[0].kind, DimensionKind::Spectral);
    }

    #[test]
    fn thumbnail_is_skipped_when_a_second_image_exists() {
        let mut body = image_entry("thumb", &[2, 2], &["nm", "nm"], &[0.0; 4]);
        body.extend(image_entry("real", &[2, 2], &["nm", "nm"], &[1.0; 4]));
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, &dm3_file(&body), "two.dm3");
        let mut reader = DmReader::open(&path).unwrap();
        let datasets = reader.read().unwrap();
        assert_eq!(datasets.len(), 1);
        assert_eq!(datasets[0].title, "real");
    }

    #[test]
    fn bad_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, b"not a dm file at all", "garbage.dm3");
        assert!(DmReader::open(&path).is_err());
    }
}
