use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use ndarray::ArrayD;

use crate::dataset::{
    linspace, DataBuffer, DataKind, Dataset, Dimension, DimensionKind, MetaMap, MetaValue,
};
use crate::error::{ReaderError, Result};
use crate::reader::{coerce_number, fortran_array, has_extension, read_all, FormatReader};

const BIN_HEADER_LEN: usize = 64;
const WAVE_HEADER_LEN: usize = 320;
const DATA_START: usize = BIN_HEADER_LEN + WAVE_HEADER_LEN;

const NT_COMPLEX: i16 = 0x01;
const NT_UNSIGNED: i16 = 0x40;

/// Igor Binary Wave (`.ibw`) files from Asylum Research AFMs: version 5
/// waves holding either image stacks or force curves, with the acquisition
/// parameters in the wave note.
pub struct IgorIbwReader {
    path: PathBuf,
    bytes: Vec<u8>,
}

struct WaveInfo {
    formula_size: usize,
    note_size: usize,
    data_e_units_size: usize,
    dim_e_units_sizes: [usize; 4],
    dim_labels_sizes: [usize; 4],
    wave_type: i16,
    npnts: usize,
    shape: Vec<usize>,
    bname: String,
    creation_date: u32,
    mod_date: u32,
}

impl IgorIbwReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let bytes = read_all(&path)?;
        if bytes.len() < 2 {
            return Err(ReaderError::InvalidFormat("file too short for a wave header".to_string()));
        }
        let version = LittleEndian::read_i16(&bytes[0..2]);
        if version != 5 {
            if BigEndian::read_i16(&bytes[0..2]) == 5 {
                return Err(ReaderError::UnsupportedVersion(
                    "big-endian wave files".to_string(),
                ));
            }
            return Err(ReaderError::UnsupportedVersion(format!(
                "wave version {}",
                version
            )));
        }
        Ok(Self { path, bytes })
    }

    fn parse_headers(&self) -> Result<WaveInfo> {
        let bytes = &self.bytes;
        if bytes.len() < DATA_START {
            return Err(ReaderError::InvalidFormat("truncated wave headers".to_string()));
        }
        let int_at = |off: usize| LittleEndian::read_i32(&bytes[off..off + 4]);
        let usize_at = |off: usize| -> Result<usize> {
            usize::try_from(int_at(off))
                .map_err(|_| ReaderError::InvalidFormat(format!("negative size field at {}", off)))
        };

        let mut dim_e_units_sizes = [0usize; 4];
        let mut dim_labels_sizes = [0usize; 4];
        for d in 0..4 {
            dim_e_units_sizes[d] = usize_at(20 + 4 * d)?;
            dim_labels_sizes[d] = usize_at(36 + 4 * d)?;
        }

        let npnts = usize_at(BIN_HEADER_LEN + 12)?;
        let wave_type = LittleEndian::read_i16(&bytes[BIN_HEADER_LEN + 16..BIN_HEADER_LEN + 18]);
        let bname_bytes = &bytes[BIN_HEADER_LEN + 28..BIN_HEADER_LEN + 60];
        let bname = nul_terminated(bname_bytes);

        let mut shape = Vec::new();
        for d in 0..4 {
            let len = int_at(BIN_HEADER_LEN + 68 + 4 * d);
            if len > 0 {
                shape.push(len as usize);
            }
        }
        if shape.is_empty() {
            return Err(ReaderError::InvalidFormat("wave has no dimensions".to_string()));
        }
        let product: usize = shape.iter().product();
        if product != npnts {
            return Err(ReaderError::InvalidFormat(format!(
                "wave claims {} points but its dimensions hold {}",
                npnts, product
            )));
        }

        Ok(WaveInfo {
            formula_size: usize_at(8)?,
            note_size: usize_at(12)?,
            data_e_units_size: usize_at(16)?,
            dim_e_units_sizes,
            dim_labels_sizes,
            wave_type,
            npnts,
            shape,
            bname,
            creation_date: LittleEndian::read_u32(&bytes[BIN_HEADER_LEN + 4..BIN_HEADER_LEN + 8]),
            mod_date: LittleEndian::read_u32(&bytes[BIN_HEADER_LEN + 8..BIN_HEADER_LEN + 12]),
        })
    }

    fn decode_data(&self, info: &WaveInfo) -> Result<(Vec<DataBuffer>, usize)> {
        if info.wave_type & NT_COMPLEX != 0 {
            return Err(ReaderError::UnsupportedDataType("complex wave data".to_string()));
        }
        if info.wave_type == 0 {
            return Err(ReaderError::UnsupportedDataType("text wave".to_string()));
        }
        let unsigned = info.wave_type & NT_UNSIGNED != 0;
        let base = info.wave_type & !NT_UNSIGNED;

        let (frame_shape, channels) = match info.shape.len() {
            1 => (vec![info.shape[0]], 1),
            2 => (vec![info.shape[0]], info.shape[1]),
            3 => (vec![info.shape[0], info.shape[1]], info.shape[2]),
            n => {
                return Err(ReaderError::Unsupported(format!(
                    "{}-dimensional wave data",
                    n
                )))
            }
        };

        let count = info.npnts;
        let data = |width: usize| -> Result<&[u8]> {
            let end = DATA_START + count * width;
            if self.bytes.len() < end {
                return Err(ReaderError::InvalidFormat(format!(
                    "wave data needs {} bytes, file holds {}",
                    end,
                    self.bytes.len()
                )));
            }
            Ok(&self.bytes[DATA_START..end])
        };

        let buffers = match (base, unsigned) {
            (2, _) => {
                let src = data(4)?;
                let mut values = vec![0f32; count];
                LittleEndian::read_f32_into(src, &mut values);
                channel_buffers(values, &frame_shape, channels)?
            }
            (4, _) => {
                let src = data(8)?;
                let mut values = vec![0f64; count];
                LittleEndian::read_f64_into(src, &mut values);
                channel_buffers(values, &frame_shape, channels)?
            }
            (8, false) => {
                let src = data(1)?;
                let values: Vec<i8> = src.iter().map(|&b| b as i8).collect();
                channel_buffers(values, &frame_shape, channels)?
            }
            (8, true) => channel_buffers(data(1)?.to_vec(), &frame_shape, channels)?,
            (0x10, false) => {
                let src = data(2)?;
                let mut values = vec![0i16; count];
                LittleEndian::read_i16_into(src, &mut values);
                channel_buffers(values, &frame_shape, channels)?
            }
            (0x10, true) => {
                let src = data(2)?;
                let mut values = vec![0u16; count];
                LittleEndian::read_u16_into(src, &mut values);
                channel_buffers(values, &frame_shape, channels)?
            }
            (0x20, false) => {
                let src = data(4)?;
                let mut values = vec![0i32; count];
                LittleEndian::read_i32_into(src, &mut values);
                channel_buffers(values, &frame_shape, channels)?
            }
            (0x20, true) => {
                let src = data(4)?;
                let mut values = vec![0u32; count];
                LittleEndian::read_u32_into(src, &mut values);
                channel_buffers(values, &frame_shape, channels)?
            }
            _ => {
                return Err(ReaderError::UnsupportedDataType(format!(
                    "wave type {:#x}",
                    info.wave_type
                )))
            }
        };
        let width = match base {
            8 => 1,
            2 | 0x20 => 4,
            4 => 8,
            _ => 2,
        };
        Ok((buffers, DATA_START + count * width))
    }

    /// Wave note: `key:value` lines separated by carriage returns.
    fn parse_note(&self, info: &WaveInfo, note_start: usize) -> MetaMap {
        let mut parms = MetaMap::new();
        let end = (note_start + info.note_size).min(self.bytes.len());
        let raw = &self.bytes[note_start.min(end)..end];
        let text = match std::str::from_utf8(raw) {
            Ok(text) => text.to_string(),
            // Older AR software wrote Latin-1 notes.
            Err(_) => raw.iter().map(|&b| b as char).collect(),
        };
        for line in text.trim_end_matches('\r').split('\r') {
            let parts: Vec<&str> = line.split(':').collect();
            if parts.len() != 2 {
                continue;
            }
            parms.insert(parts[0].trim().to_string(), coerce_number(parts[1].trim()));
        }
        parms.insert("creationDate".to_string(), MetaValue::UInt(info.creation_date as u64));
        parms.insert("modDate".to_string(), MetaValue::UInt(info.mod_date as u64));
        parms.insert("bname".to_string(), MetaValue::String(info.bname.clone()));
        parms
    }

    /// Channel names come from the dimension label blocks, 32 bytes a slot.
    fn channel_labels(&self, info: &WaveInfo, note_start: usize, channels: usize) -> Vec<String> {
        let mut pos = note_start + info.note_size + info.data_e_units_size;
        for size in info.dim_e_units_sizes {
            pos += size;
        }
        let mut labels = Vec::new();
        for size in info.dim_labels_sizes {
            let end = (pos + size).min(self.bytes.len());
            if pos < end {
                for slot in self.bytes[pos..end].chunks(32) {
                    let label = nul_terminated(slot);
                    if !label.is_empty() {
                        labels.push(label);
                    }
                }
            }
            pos += size;
        }
        // Layer 0 of older AR files is a null set; its label is surplus.
        if labels.len() != channels && !labels.is_empty() {
            labels.remove(0);
        }
        for label in &mut labels {
            let lower = label.to_lowercase();
            if let Some(idx) = lower.rfind("trace") {
                if idx > 0 {
                    label.truncate(idx + 5);
                }
            }
        }
        labels
    }
}

impl FormatReader for IgorIbwReader {
    fn can_read(&self) -> bool {
        has_extension(&self.path, &["ibw"])
    }

    fn read(&mut self) -> Result<Vec<Dataset>> {
        let info = self.parse_headers()?;
        let (buffers, data_end) = self.decode_data(&info)?;
        let note_start = data_end + info.formula_size;
        let parms = self.parse_note(&info, note_start);
        let labels = self.channel_labels(&info, note_start, buffers.len());

        let label_of = |ch: usize| {
            labels
                .get(ch)
                .cloned()
                .unwrap_or_else(|| format!("Channel_{:03}", ch))
        };

        let mut datasets = Vec::new();
        if info.shape.len() == 3 {
            let fast = parms.get("FastScanSize").and_then(MetaValue::as_f64);
            let slow = parms.get("SlowScanSize").and_then(MetaValue::as_f64);
            for (ch, buffer) in buffers.into_iter().enumerate() {
                let label = label_of(ch);
                let units = default_unit(&label);
                let shape = buffer.shape().to_vec();
                let mut ds = Dataset::new(label.clone(), buffer);
                ds.data_kind = DataKind::Image;
                ds.quantity = label;
                ds.units = units.to_string();
                ds.source = "IgorIbwReader".to_string();
                if let Some(extent) = fast {
                    ds.set_dimension(
                        0,
                        Dimension::new(
                            linspace(0.0, extent, shape[0]),
                            "x",
                            "x",
                            "m",
                            DimensionKind::Spatial,
                        ),
                    )?;
                }
                if let Some(extent) = slow {
                    ds.set_dimension(
                        1,
                        Dimension::new(
                            linspace(0.0, extent, shape[1]),
                            "y",
                            "y",
                            "m",
                            DimensionKind::Spatial,
                        ),
                    )?;
                }
                ds.original_metadata = parms.clone();
                datasets.push(ds);
            }
        } else {
            // Force curves: the Z sensor channel (or Raw) carries the
            // spectroscopic axis for every channel.
            let spec_values: Option<Vec<f64>> = ["ZSnsr", "Raw"].iter().find_map(|name| {
                labels
                    .iter()
                    .position(|l| l.as_str() == *name)
                    .and_then(|idx| buffers.get(idx))
                    .map(|b| b.to_f64().iter().copied().collect())
            });
            for (ch, buffer) in buffers.into_iter().enumerate() {
                let label = label_of(ch);
                let units = default_unit(&label);
                let len = buffer.len();
                let values = spec_values
                    .clone()
                    .unwrap_or_else(|| (0..len).map(|i| i as f64).collect());
                let mut ds = Dataset::new(label.clone(), buffer);
                ds.data_kind = DataKind::Spectrum;
                ds.quantity = label.clone();
                ds.units = units.to_string();
                ds.source = "IgorIbwReader".to_string();
                ds.set_dimension(
                    0,
                    Dimension::new(values, label.clone(), label, units, DimensionKind::Spectral),
                )?;
                ds.original_metadata = parms.clone();
                datasets.push(ds);
            }
        }
        Ok(datasets)
    }
}

fn channel_buffers<T>(values: Vec<T>, frame_shape: &[usize], channels: usize) -> Result<Vec<DataBuffer>>
where
    T: Clone,
    DataBuffer: From<ArrayD<T>>,
{
    let frame: usize = frame_shape.iter().product();
    let mut out = Vec::with_capacity(channels);
    for ch in 0..channels {
        let chunk = values[ch * frame..(ch + 1) * frame].to_vec();
        let arr = if frame_shape.len() == 1 {
            ArrayD::from_shape_vec(ndarray::IxDyn(frame_shape), chunk)
                .map_err(|e| ReaderError::ShapeMismatch(e.to_string()))?
        } else {
            fortran_array(chunk, frame_shape)?
        };
        out.push(DataBuffer::from(arr));
    }
    Ok(out)
}

fn nul_terminated(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_string()
}

fn default_unit(label: &str) -> &'static str {
    if label.starts_with("Phase") {
        "deg"
    } else if label.starts_with("Current") {
        "A"
    } else {
        "m"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch_i32(buf: &mut [u8], off: usize, value: i32) {
        buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn ibw_bytes(
        wave_type: i16,
        n_dim: [i32; 4],
        data: &[u8],
        note: &str,
        label_dims: &[(usize, &[&str])],
    ) -> Vec<u8> {
        let mut out = vec![0u8; DATA_START];
        out[0..2].copy_from_slice(&5i16.to_le_bytes());
        patch_i32(&mut out, 12, note.len() as i32);

        let npnts: i32 = n_dim.iter().filter(|&&d| d > 0).product();
        patch_i32(&mut out, BIN_HEADER_LEN + 4, 3600);
        patch_i32(&mut out, BIN_HEADER_LEN + 8, 7200);
        patch_i32(&mut out, BIN_HEADER_LEN + 12, npnts);
        out[BIN_HEADER_LEN + 16..BIN_HEADER_LEN + 18].copy_from_slice(&wave_type.to_le_bytes());
        out[BIN_HEADER_LEN + 28..BIN_HEADER_LEN + 33].copy_from_slice(b"wave0");
        for (d, &len) in n_dim.iter().enumerate() {
            patch_i32(&mut out, BIN_HEADER_LEN + 68 + 4 * d, len);
        }

        let mut label_blocks = vec![Vec::new(), Vec::new(), Vec::new(), Vec::new()];
        for &(dim, labels) in label_dims {
            let mut block = Vec::new();
            for label in labels {
                let mut slot = vec![0u8; 32];
                slot[..label.len()].copy_from_slice(label.as_bytes());
                block.extend(slot);
            }
            patch_i32(&mut out, 36 + 4 * dim, block.len() as i32);
            label_blocks[dim] = block;
        }

        out.extend_from_slice(data);
        out.extend_from_slice(note.as_bytes());
        for block in label_blocks {
            out.extend(block);
        }
        out
    }

    fn write_temp(dir: &tempfile::TempDir, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join("scan.ibw");
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn image_stack_splits_into_channel_images() {
        let pixels: Vec<u8> = (0..12).flat_map(|v| (v as f32).to_le_bytes()).collect();
        let note = "ScanPoints:2\rScanLines:3\rFastScanSize:2e-06\rSlowScanSize:3e-06\rImagingMode:AC Mode\r";
        let bytes = ibw_bytes(
            2,
            [2, 3, 2, 0],
            &pixels,
            note,
            &[(2, &["", "HeightTrace", "PhaseRetrace"])],
        );
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, &bytes);

        let datasets = IgorIbwReader::open(&path).unwrap().read().unwrap();
        assert_eq!(datasets.len(), 2);
        assert_eq!(datasets[0].title, "HeightTrace");
        assert_eq!(datasets[0].units, "m");
        assert_eq!(datasets[1].title, "PhaseRetrace");
        assert_eq!(datasets[1].units, "deg");
        assert_eq!(datasets[0].shape(), &[2, 3]);
        assert_eq!(datasets[0].data_kind, DataKind::Image);
        // First channel block, column-major: element (1, 2) is value 5.
        assert_eq!(datasets[0].data.get_f64(&[1, 2]), Some(5.0));
        assert_eq!(datasets[1].data.get_f64(&[0, 0]), Some(6.0));
        assert_eq!(datasets[0].dims[0].name, "x");
        assert_eq!(datasets[0].dims[0].values, vec![0.0, 2e-6]);
        assert_eq!(datasets[0].dims[1].values.len(), 3);
        assert_eq!(
            datasets[0].original_metadata.get("ImagingMode"),
            Some(&MetaValue::String("AC Mode".to_string()))
        );
        assert_eq!(
            datasets[0].original_metadata.get("ScanLines"),
            Some(&MetaValue::Int(3))
        );
    }

    #[test]
    fn force_curves_use_the_z_sensor_axis() {
        let columns: Vec<f32> = vec![0.0, 0.5, 1.0, 1.5, 10.0, 11.0, 12.0, 13.0];
        let data: Vec<u8> = columns.iter().flat_map(|v| v.to_le_bytes()).collect();
        let bytes = ibw_bytes(
            2,
            [4, 2, 0, 0],
            &data,
            "TriggerPoint:1\r",
            &[(1, &["", "ZSnsr", "Current"])],
        );
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, &bytes);

        let datasets = IgorIbwReader::open(&path).unwrap().read().unwrap();
        assert_eq!(datasets.len(), 2);
        assert_eq!(datasets[0].data_kind, DataKind::Spectrum);
        assert_eq!(datasets[1].title, "Current");
        assert_eq!(datasets[1].units, "A");
        assert_eq!(datasets[1].dims[0].values, vec![0.0, 0.5, 1.0, 1.5]);
        assert_eq!(datasets[1].data.get_f64(&[2]), Some(12.0));
    }

    #[test]
    fn non_v5_waves_are_rejected() {
        let mut bytes = vec![0u8; DATA_START];
        bytes[0..2].copy_from_slice(&2i16.to_le_bytes());
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, &bytes);
        match IgorIbwReader::open(&path) {
            Err(ReaderError::UnsupportedVersion(_)) => {}
            other => panic!("expected UnsupportedVersion, got {:?}", other.map(|_| ())),
        }
    }
}
