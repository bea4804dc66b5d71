use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use ndarray::ArrayD;
use regex::bytes::Regex;
use tracing::warn;

use crate::dataset::{DataKind, Dataset, Dimension, DimensionKind, MetaMap, MetaValue};
use crate::error::{ReaderError, Result};
use crate::reader::{coerce_number, has_extension, read_all, FormatReader};

const HEADER_LEN: usize = 4100;

/// Princeton Instruments `.spe` CCD captures: a 4100-byte legacy binary
/// header, `f32` frame data, and an XML footer carrying the calibration.
pub struct RamanSpeReader {
    path: PathBuf,
    bytes: Vec<u8>,
}

impl RamanSpeReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let bytes = read_all(&path)?;
        Ok(Self { path, bytes })
    }
}

impl FormatReader for RamanSpeReader {
    fn can_read(&self) -> bool {
        has_extension(&self.path, &["spe"])
    }

    fn read(&mut self) -> Result<Vec<Dataset>> {
        if self.bytes.len() < HEADER_LEN {
            return Err(ReaderError::InvalidFormat(
                "file shorter than the 4100-byte header".to_string(),
            ));
        }
        let footer = &self.bytes[HEADER_LEN..];

        let date = capture_text(footer, r#"date="([^"]*)""#, "date")?;
        let width = capture_text(footer, r#"width="([^"]*)""#, "width")?
            .parse::<usize>()
            .map_err(|e| ReaderError::MetadataParse(format!("width: {}", e)))?;
        let height = capture_text(footer, r#"height="([^"]*)""#, "height")?
            .parse::<usize>()
            .map_err(|e| ReaderError::MetadataParse(format!("height: {}", e)))?;
        let exposure = capture_text(
            footer,
            r#"<ExposureTime type="Double">(.*?)</ExposureTime>"#,
            "ExposureTime",
        )?;
        let laser_line = capture_text(footer, r#"laserLine="([^"]*)""#, "laserLine")?
            .parse::<f64>()
            .map_err(|e| ReaderError::MetadataParse(format!("laserLine: {}", e)))?;
        let center = capture_text(
            footer,
            r#"<CenterWavelength type="Double">(.*?)</CenterWavelength>"#,
            "CenterWavelength",
        )?
        .parse::<f64>()
        .map_err(|e| ReaderError::MetadataParse(format!("CenterWavelength: {}", e)))?;
        let orientation = capture_text(footer, r#"orientation="([^"]*)""#, "orientation")?;
        let wavelength_csv = capture_text(
            footer,
            r#"<Wavelength xml:space="preserve">(.*?)</Wavelength>"#,
            "Wavelength",
        )?;

        let mut wavelengths = Vec::new();
        for tok in wavelength_csv.split(',') {
            let value = tok.trim().parse::<f64>().map_err(|e| {
                ReaderError::MetadataParse(format!("wavelength entry '{}': {}", tok.trim(), e))
            })?;
            wavelengths.push(value);
        }

        let size = width * height;
        let data_end = HEADER_LEN + size * 4;
        if self.bytes.len() < data_end {
            return Err(ReaderError::InvalidFormat(format!(
                "frame needs {} bytes, file holds {}",
                data_end,
                self.bytes.len()
            )));
        }
        let mut intensity = vec![0f32; size];
        LittleEndian::read_f32_into(&self.bytes[HEADER_LEN..data_end], &mut intensity);

        let mut metadata = MetaMap::new();
        metadata.insert("date_acquired".to_string(), MetaValue::String(date));
        metadata.insert("width".to_string(), MetaValue::UInt(width as u64));
        metadata.insert("height".to_string(), MetaValue::UInt(height as u64));
        metadata.insert("size".to_string(), MetaValue::UInt(size as u64));
        metadata.insert("exposure_time".to_string(), coerce_number(&exposure));
        metadata.insert("excitation_wavelength".to_string(), MetaValue::Float(laser_line));
        metadata.insert("center_wavelength".to_string(), MetaValue::Float(center));
        metadata.insert("orientation".to_string(), MetaValue::String(orientation));

        let raman_shift: Vec<f64> = wavelengths
            .iter()
            .map(|lambda| 1e7 * (1.0 / laser_line - 1.0 / lambda))
            .collect();

        let arr = ArrayD::from_shape_vec(ndarray::IxDyn(&[size]), intensity)
            .map_err(|e| ReaderError::ShapeMismatch(e.to_string()))?;
        let mut ds = Dataset::new("Raman Spectra", arr);
        ds.data_kind = DataKind::Spectrum;
        ds.units = "counts".to_string();
        ds.quantity = "Intensity".to_string();
        ds.source = "RamanSpeReader".to_string();
        if raman_shift.len() == size {
            ds.set_dimension(
                0,
                Dimension::new(
                    raman_shift,
                    "Raman Shift",
                    "Raman shift",
                    "cm-1",
                    DimensionKind::Spectral,
                ),
            )?;
        } else {
            warn!(
                calibration = raman_shift.len(),
                frame = size,
                "wavelength calibration does not cover the frame, keeping index axis"
            );
        }
        ds.metadata = metadata;
        Ok(vec![ds])
    }
}

fn capture_text(region: &[u8], pattern: &str, field: &str) -> Result<String> {
    Regex::new(pattern)
        .ok()
        .and_then(|re| {
            re.captures(region)
                .and_then(|c| c.get(1).map(|m| String::from_utf8_lossy(m.as_bytes()).to_string()))
        })
        .ok_or_else(|| ReaderError::MetadataParse(format!("spe footer lacks '{}'", field)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spe_bytes(width: usize, values: &[f32], wavelengths: &str) -> Vec<u8> {
        let mut bytes = vec![0u8; HEADER_LEN];
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let footer = format!(
            concat!(
                r#"<SpeFormat><DataFormat><DataBlock width="{}" height="1" "#,
                r#"date="2021-05-14T12:00:00" orientation="Normal"/></DataFormat>"#,
                r#"<ExposureTime type="Double">100</ExposureTime>"#,
                r#"<CenterWavelength type="Double">600</CenterWavelength>"#,
                r#"<LaserLine laserLine="532"/>"#,
                r#"<Wavelength xml:space="preserve">{}</Wavelength></SpeFormat>"#
            ),
            width, wavelengths
        );
        bytes.extend_from_slice(footer.as_bytes());
        bytes
    }

    fn write_temp(dir: &tempfile::TempDir, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join("raman.spe");
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn spectrum_gets_a_raman_shift_axis() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, &spe_bytes(3, &[5.0, 6.0, 7.0], "600,601,602"));
        let datasets = RamanSpeReader::open(&path).unwrap().read().unwrap();

        assert_eq!(datasets.len(), 1);
        let ds = &datasets[0];
        assert_eq!(ds.title, "Raman Spectra");
        assert_eq!(ds.data_kind, DataKind::Spectrum);
        assert_eq!(ds.shape(), &[3]);
        assert_eq!(ds.data.get_f64(&[1]), Some(6.0));
        assert_eq!(ds.dims[0].name, "Raman Shift");
        assert_eq!(ds.dims[0].units, "cm-1");
        let expected = 1e7 * (1.0 / 532.0 - 1.0 / 600.0);
        assert!((ds.dims[0].values[0] - expected).abs() < 1e-9);
        assert_eq!(ds.metadata.get("width"), Some(&MetaValue::UInt(3)));
        assert_eq!(ds.metadata.get("size"), Some(&MetaValue::UInt(3)));
        assert_eq!(ds.metadata.get("exposure_time"), Some(&MetaValue::Int(100)));
        assert_eq!(
            ds.metadata.get("excitation_wavelength"),
            Some(&MetaValue::Float(532.0))
        );
    }

    #[test]
    fn missing_calibration_field_is_reported() {
        let mut bytes = vec![0u8; HEADER_LEN];
        bytes.extend_from_slice(br#"<SpeFormat width="2" height="1"></SpeFormat>"#);
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, &bytes);
        match RamanSpeReader::open(&path).unwrap().read() {
            Err(ReaderError::MetadataParse(msg)) => assert!(msg.contains("date")),
            other => panic!("expected MetadataParse, got {:?}", other.map(|d| d.len())),
        }
    }
}
