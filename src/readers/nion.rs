use std::io::Read;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use flate2::read::DeflateDecoder;
use ndarray::ArrayD;
use regex::Regex;

use crate::dataset::{DataBuffer, DataKind, Dataset, Dimension, DimensionKind, MetaMap, MetaValue};
use crate::error::{ReaderError, Result};
use crate::reader::{basename_of, fortran_array, has_extension, read_all, FormatReader};

const LOCAL_SIG: u32 = 0x0403_4b50;
const CENTRAL_SIG: u32 = 0x0201_4b50;
const EOCD_SIG: u32 = 0x0605_4b50;
const NPY_MAGIC: &[u8] = b"\x93NUMPY";

/// Nion Swift `.ndata` files: a ZIP archive holding exactly one `data.npy`
/// array and its `metadata.json` sidecar.
pub struct NionReader {
    path: PathBuf,
    bytes: Vec<u8>,
}

impl NionReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let bytes = read_all(&path)?;
        if bytes.len() < 4 || LittleEndian::read_u32(&bytes[0..4]) != LOCAL_SIG {
            return Err(ReaderError::InvalidMagic {
                expected: hex(&[0x50, 0x4b, 0x03, 0x04]),
                actual: hex(bytes.get(0..4).unwrap_or(&bytes)),
            });
        }
        Ok(Self { path, bytes })
    }
}

impl FormatReader for NionReader {
    fn can_read(&self) -> bool {
        has_extension(&self.path, &["ndata"])
    }

    fn read(&mut self) -> Result<Vec<Dataset>> {
        let entries = zip_entries(&self.bytes)?;
        let npy = zip_extract(&self.bytes, &entries, "data.npy")?;
        let json = zip_extract(&self.bytes, &entries, "metadata.json")?;

        let buffer = parse_npy(&npy)?;
        let shape: Vec<usize> = buffer.shape().to_vec();

        let parsed: serde_json::Value = serde_json::from_slice(&json)?;
        let metadata = match MetaValue::from_json(&parsed) {
            MetaValue::Map(map) => map,
            other => {
                let mut map = MetaMap::new();
                map.insert("metadata".to_string(), other);
                map
            }
        };

        let title = metadata
            .get("title")
            .and_then(MetaValue::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| basename_of(&self.path));
        let units = metadata
            .get("intensity_calibration")
            .and_then(MetaValue::as_map)
            .and_then(|cal| cal.get("units"))
            .and_then(MetaValue::as_str)
            .filter(|u| !u.trim().is_empty())
            .unwrap_or("counts")
            .to_string();

        let mut dims: Vec<Option<Dimension>> = vec![None; shape.len()];
        if let Some(calibrations) = metadata
            .get("dimensional_calibrations")
            .and_then(MetaValue::as_list)
        {
            let mut spatial_name = 'x';
            let mut reciprocal_name = 'u';
            for (axis, calibration) in calibrations.iter().enumerate().take(shape.len()) {
                let calibration = match calibration.as_map() {
                    Some(map) => map,
                    None => continue,
                };
                dims[axis] = Some(calibrated_dimension(
                    calibration,
                    shape[axis],
                    &mut spatial_name,
                    &mut reciprocal_name,
                ));
            }
        }

        let spectral = dims
            .iter()
            .flatten()
            .any(|d| d.kind == DimensionKind::Spectral);
        let kind = match shape.len() {
            1 => {
                if spectral {
                    DataKind::Spectrum
                } else {
                    DataKind::LinePlot
                }
            }
            2 => {
                if spectral {
                    DataKind::SpectralImage
                } else {
                    DataKind::Image
                }
            }
            3 => {
                if spectral {
                    DataKind::SpectralImage
                } else {
                    DataKind::ImageStack
                }
            }
            4 => DataKind::Image4d,
            _ => DataKind::Unknown,
        };

        let mut ds = Dataset::new(title, buffer);
        ds.data_kind = kind;
        ds.quantity = "intensity".to_string();
        ds.units = units;
        ds.modality = "generic".to_string();
        ds.source = "NionReader".to_string();
        for (axis, dim) in dims.into_iter().enumerate() {
            if let Some(dim) = dim {
                ds.set_dimension(axis, dim)?;
            }
        }
        ds.original_metadata = metadata;
        Ok(vec![ds])
    }
}

fn calibrated_dimension(
    calibration: &MetaMap,
    len: usize,
    spatial_name: &mut char,
    reciprocal_name: &mut char,
) -> Dimension {
    let offset = calibration
        .get("offset")
        .and_then(MetaValue::as_f64)
        .unwrap_or(0.0);
    let scale = calibration
        .get("scale")
        .and_then(MetaValue::as_f64)
        .unwrap_or(1.0);
    let units = calibration
        .get("units")
        .and_then(MetaValue::as_str)
        .unwrap_or("")
        .to_string();
    let values: Vec<f64> = (0..len).map(|i| offset + i as f64 * scale).collect();

    if units.contains("eV") {
        Dimension::new(values, "energy_loss", "energy-loss", units, DimensionKind::Spectral)
    } else if units.contains("1/") || units == "mrad" || units == "rad" {
        let name = reciprocal_name.to_string();
        *reciprocal_name = (*reciprocal_name as u8 + 1) as char;
        Dimension::new(values, name, "reciprocal distance", units, DimensionKind::Reciprocal)
    } else if units == "s" {
        Dimension::new(values, "time", "time", units, DimensionKind::Temporal)
    } else if units.trim().is_empty() {
        Dimension::new(values, "frame", "frame", "frame", DimensionKind::Frame)
    } else if units.ends_with('m') {
        let name = spatial_name.to_string();
        *spatial_name = (*spatial_name as u8 + 1) as char;
        Dimension::new(values, name, "distance", units, DimensionKind::Spatial)
    } else {
        let name = spatial_name.to_string();
        *spatial_name = (*spatial_name as u8 + 1) as char;
        Dimension::new(values, name, "number", units, DimensionKind::Unknown)
    }
}

struct ZipEntry {
    name: String,
    method: u16,
    comp_size: usize,
    local_offset: usize,
}

/// Walk the archive from the end-of-central-directory record at the tail.
fn zip_entries(bytes: &[u8]) -> Result<Vec<ZipEntry>> {
    let eocd = find_eocd(bytes)?;
    let total = LittleEndian::read_u16(slice(bytes, eocd + 10, 2)?) as usize;
    let mut pos = LittleEndian::read_u32(slice(bytes, eocd + 16, 4)?) as usize;

    let mut entries = Vec::with_capacity(total);
    for _ in 0..total {
        let header = slice(bytes, pos, 46)?;
        if LittleEndian::read_u32(&header[0..4]) != CENTRAL_SIG {
            return Err(ReaderError::InvalidFormat(
                "central directory entry out of place".to_string(),
            ));
        }
        let method = LittleEndian::read_u16(&header[10..12]);
        let comp_size = LittleEndian::read_u32(&header[20..24]) as usize;
        let name_len = LittleEndian::read_u16(&header[28..30]) as usize;
        let extra_len = LittleEndian::read_u16(&header[30..32]) as usize;
        let comment_len = LittleEndian::read_u16(&header[32..34]) as usize;
        let local_offset = LittleEndian::read_u32(&header[42..46]) as usize;
        let name = String::from_utf8_lossy(slice(bytes, pos + 46, name_len)?).into_owned();
        entries.push(ZipEntry {
            name,
            method,
            comp_size,
            local_offset,
        });
        pos += 46 + name_len + extra_len + comment_len;
    }
    Ok(entries)
}

fn find_eocd(bytes: &[u8]) -> Result<usize> {
    let last = bytes
        .len()
        .checked_sub(22)
        .ok_or_else(|| ReaderError::InvalidFormat("file too short for an archive".to_string()))?;
    let first = bytes.len().saturating_sub(22 + 65_535);
    let mut pos = last;
    loop {
        if LittleEndian::read_u32(&bytes[pos..pos + 4]) == EOCD_SIG {
            return Ok(pos);
        }
        if pos == first {
            return Err(ReaderError::InvalidFormat(
                "archive lacks an end-of-central-directory record".to_string(),
            ));
        }
        pos -= 1;
    }
}

fn zip_extract(bytes: &[u8], entries: &[ZipEntry], name: &str) -> Result<Vec<u8>> {
    let entry = entries.iter().find(|e| e.name == name).ok_or_else(|| {
        ReaderError::InvalidFormat(format!("not a Nion data archive: no {} member", name))
    })?;
    let header = slice(bytes, entry.local_offset, 30)?;
    if LittleEndian::read_u32(&header[0..4]) != LOCAL_SIG {
        return Err(ReaderError::InvalidFormat(format!(
            "archive member {} has a bad local header",
            name
        )));
    }
    let name_len = LittleEndian::read_u16(&header[26..28]) as usize;
    let extra_len = LittleEndian::read_u16(&header[28..30]) as usize;
    let data = slice(
        bytes,
        entry.local_offset + 30 + name_len + extra_len,
        entry.comp_size,
    )?;
    match entry.method {
        0 => Ok(data.to_vec()),
        8 => {
            let mut out = Vec::new();
            DeflateDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| ReaderError::Decompression(e.to_string()))?;
            Ok(out)
        }
        other => Err(ReaderError::Unsupported(format!(
            "zip compression method {}",
            other
        ))),
    }
}

fn slice(bytes: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    offset
        .checked_add(len)
        .filter(|&end| end <= bytes.len())
        .map(|end| &bytes[offset..end])
        .ok_or_else(|| {
            ReaderError::InvalidFormat(format!("archive record at offset {} overruns the file", offset))
        })
}

/// NumPy `.npy` payload: magic, version, python-dict header, raw data.
fn parse_npy(bytes: &[u8]) -> Result<DataBuffer> {
    if bytes.len() < 10 || &bytes[..6] != NPY_MAGIC {
        return Err(ReaderError::InvalidFormat("data member is not an npy array".to_string()));
    }
    let major = bytes[6];
    let (header_len, header_start) = if major >= 2 {
        if bytes.len() < 12 {
            return Err(ReaderError::InvalidFormat("truncated npy header".to_string()));
        }
        (LittleEndian::read_u32(&bytes[8..12]) as usize, 12)
    } else {
        (LittleEndian::read_u16(&bytes[8..10]) as usize, 10)
    };
    let header = String::from_utf8_lossy(slice(bytes, header_start, header_len)?);
    let data = &bytes[header_start + header_len..];

    let descr = Regex::new(r"'descr':\s*'([^']+)'")
        .ok()
        .and_then(|re| re.captures(&header).map(|c| c[1].to_string()))
        .ok_or_else(|| ReaderError::MetadataParse("npy header lacks a descr field".to_string()))?;
    let shape_text = Regex::new(r"'shape':\s*\(([^)]*)\)")
        .ok()
        .and_then(|re| re.captures(&header).map(|c| c[1].to_string()))
        .ok_or_else(|| ReaderError::MetadataParse("npy header lacks a shape field".to_string()))?;
    let fortran = header.contains("'fortran_order': True");

    let mut shape = Vec::new();
    for part in shape_text.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        shape.push(part.parse::<usize>().map_err(|_| {
            ReaderError::MetadataParse(format!("bad npy shape entry '{}'", part))
        })?);
    }
    if shape.is_empty() {
        return Err(ReaderError::InvalidFormat("zero-dimensional npy array".to_string()));
    }

    decode_npy(data, &descr, &shape, fortran)
}

fn decode_npy(data: &[u8], descr: &str, shape: &[usize], fortran: bool) -> Result<DataBuffer> {
    let mut chars = descr.chars();
    let (order, kind) = match chars.next() {
        Some(c @ ('<' | '>' | '|' | '=')) => (c, chars.next()),
        c => ('<', c),
    };
    let big = order == '>';
    let size: usize = chars.as_str().parse().unwrap_or(0);

    let count = shape
        .iter()
        .try_fold(1usize, |acc, &s| acc.checked_mul(s))
        .ok_or_else(|| ReaderError::InvalidFormat("npy shape overflows".to_string()))?;

    fn build<T: Clone + Default>(
        data: &[u8],
        count: usize,
        width: usize,
        shape: &[usize],
        fortran: bool,
        fill: impl Fn(&[u8], &mut [T]),
    ) -> Result<ArrayD<T>> {
        let needed = count
            .checked_mul(width)
            .ok_or_else(|| ReaderError::InvalidFormat("npy shape overflows".to_string()))?;
        if data.len() < needed {
            return Err(ReaderError::InvalidFormat(format!(
                "npy data holds {} bytes, {} needed",
                data.len(),
                needed
            )));
        }
        let mut out = vec![T::default(); count];
        fill(&data[..needed], &mut out);
        if fortran {
            fortran_array(out, shape)
        } else {
            ArrayD::from_shape_vec(ndarray::IxDyn(shape), out)
                .map_err(|e| ReaderError::ShapeMismatch(e.to_string()))
        }
    }

    let buffer: DataBuffer = match (kind, size) {
        (Some('u'), 1) | (Some('b'), 1) => {
            build(data, count, 1, shape, fortran, |s, d: &mut [u8]| {
                d.copy_from_slice(s)
            })?
            .into()
        }
        (Some('i'), 1) => build(data, count, 1, shape, fortran, |s, d: &mut [i8]| {
            for (o, &b) in d.iter_mut().zip(s) {
                *o = b as i8;
            }
        })?
        .into(),
        (Some('u'), 2) => build(data, count, 2, shape, fortran, |s, d: &mut [u16]| {
            if big {
                BigEndian::read_u16_into(s, d)
            } else {
                LittleEndian::read_u16_into(s, d)
            }
        })?
        .into(),
        (Some('i'), 2) => build(data, count, 2, shape, fortran, |s, d: &mut [i16]| {
            if big {
                BigEndian::read_i16_into(s, d)
            } else {
                LittleEndian::read_i16_into(s, d)
            }
        })?
        .into(),
        (Some('u'), 4) => build(data, count, 4, shape, fortran, |s, d: &mut [u32]| {
            if big {
                BigEndian::read_u32_into(s, d)
            } else {
                LittleEndian::read_u32_into(s, d)
            }
        })?
        .into(),
        (Some('i'), 4) => build(data, count, 4, shape, fortran, |s, d: &mut [i32]| {
            if big {
                BigEndian::read_i32_into(s, d)
            } else {
                LittleEndian::read_i32_into(s, d)
            }
        })?
        .into(),
        (Some('u'), 8) => build(data, count, 8, shape, fortran, |s, d: &mut [u64]| {
            if big {
                BigEndian::read_u64_into(s, d)
            } else {
                LittleEndian::read_u64_into(s, d)
            }
        })?
        .into(),
        (Some('i'), 8) => build(data, count, 8, shape, fortran, |s, d: &mut [i64]| {
            if big {
                BigEndian::read_i64_into(s, d)
            } else {
                LittleEndian::read_i64_into(s, d)
            }
        })?
        .into(),
        (Some('f'), 4) => build(data, count, 4, shape, fortran, |s, d: &mut [f32]| {
            if big {
                BigEndian::read_f32_into(s, d)
            } else {
                LittleEndian::read_f32_into(s, d)
            }
        })?
        .into(),
        (Some('f'), 8) => build(data, count, 8, shape, fortran, |s, d: &mut [f64]| {
            if big {
                BigEndian::read_f64_into(s, d)
            } else {
                LittleEndian::read_f64_into(s, d)
            }
        })?
        .into(),
        _ => {
            return Err(ReaderError::UnsupportedDataType(format!(
                "npy element type '{}'",
                descr
            )))
        }
    };
    Ok(buffer)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn npy_bytes(descr: &str, shape: &str, data: &[u8]) -> Vec<u8> {
        let header = format!(
            "{{'descr': '{}', 'fortran_order': False, 'shape': {}, }}",
            descr, shape
        );
        let mut out = NPY_MAGIC.to_vec();
        out.push(1);
        out.push(0);
        out.extend_from_slice(&(header.len() as u16).to_le_bytes());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(data);
        out
    }

    fn zip_file(members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut centrals = Vec::new();
        for (name, data) in members {
            let local_offset = out.len() as u32;
            out.extend_from_slice(&LOCAL_SIG.to_le_bytes());
            out.extend_from_slice(&[20, 0, 0, 0, 0, 0, 0, 0, 0, 0]); // version, flags, method, time, date
            out.extend_from_slice(&0u32.to_le_bytes()); // crc
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(&(name.len() as u16).to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(data);

            let mut central = CENTRAL_SIG.to_le_bytes().to_vec();
            central.extend_from_slice(&[20, 0, 20, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
            central.extend_from_slice(&0u32.to_le_bytes()); // crc
            central.extend_from_slice(&(data.len() as u32).to_le_bytes());
            central.extend_from_slice(&(data.len() as u32).to_le_bytes());
            central.extend_from_slice(&(name.len() as u16).to_le_bytes());
            central.extend_from_slice(&[0; 12]); // extra, comment, disk, attrs
            central.extend_from_slice(&local_offset.to_le_bytes());
            central.extend_from_slice(name.as_bytes());
            centrals.push(central);
        }
        let cd_offset = out.len() as u32;
        for central in &centrals {
            out.extend_from_slice(central);
        }
        let cd_size = out.len() as u32 - cd_offset;
        out.extend_from_slice(&EOCD_SIG.to_le_bytes());
        out.extend_from_slice(&[0, 0, 0, 0]);
        out.extend_from_slice(&(members.len() as u16).to_le_bytes());
        out.extend_from_slice(&(members.len() as u16).to_le_bytes());
        out.extend_from_slice(&cd_size.to_le_bytes());
        out.extend_from_slice(&cd_offset.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out
    }

    fn write_ndata(dir: &tempfile::TempDir, members: &[(&str, &[u8])]) -> std::path::PathBuf {
        let path = dir.path().join("scan.ndata");
        std::fs::write(&path, zip_file(members)).unwrap();
        path
    }

    #[test]
    fn ndata_image_reads_with_calibrations() {
        let pixels: Vec<u8> = [0.0f32, 1.0, 2.0, 3.0, 4.0, 5.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let npy = npy_bytes("<f4", "(2, 3)", &pixels);
        let json = br#"{
            "title": "19-SuperScan (HAADF)",
            "intensity_calibration": {"offset": 0.0, "scale": 1.0, "units": "counts"},
            "dimensional_calibrations": [
                {"offset": 0.0, "scale": 2.0, "units": "nm"},
                {"offset": 1.0, "scale": 2.0, "units": "nm"}
            ]
        }"#;

        let dir = tempfile::tempdir().unwrap();
        let path = write_ndata(&dir, &[("data.npy", &npy), ("metadata.json", json)]);
        let mut reader = NionReader::open(&path).unwrap();
        let datasets = reader.read().unwrap();
        assert_eq!(datasets.len(), 1);

        let ds = &datasets[0];
        assert_eq!(ds.title, "19-SuperScan (HAADF)");
        assert_eq!(ds.source, "NionReader");
        assert_eq!(ds.data_kind, DataKind::Image);
        assert_eq!(ds.units, "counts");
        assert_eq!(ds.shape(), &[2, 3]);
        assert_eq!(ds.data.get_f64(&[1, 2]), Some(5.0));
        assert_eq!(ds.dims[0].name, "x");
        assert_eq!(ds.dims[0].values, vec![0.0, 2.0]);
        assert_eq!(ds.dims[1].values, vec![1.0, 3.0, 5.0]);
        assert!(ds.original_metadata.contains_key("dimensional_calibrations"));
    }

    #[test]
    fn stack_of_frames_is_an_image_stack() {
        let pixels: Vec<u8> = (0..8).flat_map(|v| (v as f32).to_le_bytes()).collect();
        let npy = npy_bytes("<f4", "(2, 2, 2)", &pixels);
        let json = br#"{
            "title": "stack",
            "dimensional_calibrations": [
                {"offset": 0.0, "scale": 1.0, "units": ""},
                {"offset": 0.0, "scale": 0.1, "units": "nm"},
                {"offset": 0.0, "scale": 0.1, "units": "nm"}
            ]
        }"#;
        let dir = tempfile::tempdir().unwrap();
        let path = write_ndata(&dir, &[("data.npy", &npy), ("metadata.json", json)]);
        let datasets = NionReader::open(&path).unwrap().read().unwrap();
        assert_eq!(datasets[0].data_kind, DataKind::ImageStack);
        assert_eq!(datasets[0].dims[0].kind, DimensionKind::Frame);
        assert_eq!(datasets[0].dims[1].name, "x");
    }

    #[test]
    fn archive_without_metadata_is_rejected() {
        let npy = npy_bytes("<u1", "(2,)", &[1, 2]);
        let dir = tempfile::tempdir().unwrap();
        let path = write_ndata(&dir, &[("data.npy", &npy)]);
        assert!(NionReader::open(&path).unwrap().read().is_err());
    }

    #[test]
    fn non_zip_bytes_are_rejected_at_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.ndata");
        std::fs::write(&path, b"garbage that is long enough").unwrap();
        match NionReader::open(&path) {
            Err(ReaderError::InvalidMagic { .. }) => {}
            other => panic!("expected InvalidMagic, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn npy_supports_big_endian_and_fortran_order() {
        let data: Vec<u8> = [1u16, 2, 3, 4, 5, 6]
            .iter()
            .flat_map(|v| v.to_be_bytes())
            .collect();
        let header = "{'descr': '>u2', 'fortran_order': True, 'shape': (2, 3), }";
        let mut npy = NPY_MAGIC.to_vec();
        npy.extend_from_slice(&[1, 0]);
        npy.extend_from_slice(&(header.len() as u16).to_le_bytes());
        npy.extend_from_slice(header.as_bytes());
        npy.extend_from_slice(&data);

        let buffer = parse_npy(&npy).unwrap();
        assert_eq!(buffer.dtype(), "u16");
        assert_eq!(buffer.shape(), &[2, 3]);
        // Column-major stream: element (0, 1) is the third stored value.
        assert_eq!(buffer.get_f64(&[0, 1]), Some(3.0));
    }
}
