use std::path::{Path, PathBuf};

use ndarray::ArrayD;
use regex::Regex;
use tracing::warn;

use crate::dataset::{DataKind, Dataset, Dimension, DimensionKind, MetaMap, MetaValue};
use crate::error::{ReaderError, Result};
use crate::reader::{has_extension, read_all, FormatReader};

/// Reduced neutron reflectivity curves from SNS/ORNL: `#`-prefixed header
/// lines, the last of which names the columns, then whitespace float rows.
pub struct NeutronReflectivityReader {
    path: PathBuf,
    text: String,
}

impl NeutronReflectivityReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let bytes = read_all(&path)?;
        Ok(Self {
            path,
            text: String::from_utf8_lossy(&bytes).to_string(),
        })
    }

    fn parse(&self) -> Result<(Vec<String>, Vec<(String, String)>, Vec<Vec<f64>>)> {
        let mut header: Vec<String> = Vec::new();
        let mut rows: Vec<Vec<f64>> = Vec::new();
        for line in self.text.lines() {
            if line.starts_with('#') {
                header.push(line.get(2..).unwrap_or("").to_string());
                continue;
            }
            if line.trim().is_empty() {
                continue;
            }
            let mut row = Vec::new();
            for tok in line.split_whitespace() {
                let value = tok.parse::<f64>().map_err(|_| {
                    ReaderError::InvalidFormat(format!("non-numeric data entry '{}'", tok))
                })?;
                row.push(value);
            }
            if let Some(first) = rows.first() {
                if row.len() != first.len() {
                    return Err(ReaderError::InvalidFormat(format!(
                        "data row with {} columns, expected {}",
                        row.len(),
                        first.len()
                    )));
                }
            }
            rows.push(row);
        }
        let heading_line = header
            .last()
            .ok_or_else(|| ReaderError::InvalidFormat("no header lines".to_string()))?;
        let headings = parse_headings(heading_line);
        Ok((header, headings, rows))
    }
}

/// Column headings are separated by runs of two or more spaces, each one
/// `Name` or `Name [unit]`.
fn parse_headings(line: &str) -> Vec<(String, String)> {
    let splitter = match Regex::new(r"\s{2,}") {
        Ok(re) => re,
        Err(_) => return Vec::new(),
    };
    splitter
        .split(line.trim())
        .filter(|col| !col.is_empty())
        .map(|col| match col.split_once('[') {
            Some((name, unit)) => (
                name.trim().to_string(),
                unit.trim_end().trim_end_matches(']').trim().to_string(),
            ),
            None => (col.trim().to_string(), String::new()),
        })
        .collect()
}

impl FormatReader for NeutronReflectivityReader {
    fn can_read(&self) -> bool {
        has_extension(&self.path, &["txt"]) && self.text.trim_start().starts_with('#')
    }

    fn read(&mut self) -> Result<Vec<Dataset>> {
        let (header, headings, rows) = self.parse()?;
        if rows.is_empty() {
            return Err(ReaderError::InvalidFormat("no data rows".to_string()));
        }
        if rows[0].len() < 2 {
            return Err(ReaderError::InvalidFormat(format!(
                "need at least two data columns, found {}",
                rows[0].len()
            )));
        }
        let axis: Vec<f64> = rows.iter().map(|r| r[0]).collect();
        let values: Vec<f64> = rows.iter().map(|r| r[1]).collect();

        let (axis_name, axis_units) = headings
            .first()
            .cloned()
            .unwrap_or_else(|| ("index".to_string(), String::new()));
        let (quantity, units) = headings.get(1).cloned().unwrap_or_else(|| {
            warn!("heading row names fewer than two columns");
            ("intensity".to_string(), String::new())
        });

        let arr = ArrayD::from_shape_vec(ndarray::IxDyn(&[values.len()]), values)
            .map_err(|e| ReaderError::ShapeMismatch(e.to_string()))?;
        let mut ds = Dataset::new("Neutron Reflectivity", arr);
        ds.data_kind = DataKind::Spectrum;
        ds.units = units;
        ds.quantity = quantity;
        ds.source = "NeutronReflectivityReader".to_string();
        ds.set_dimension(
            0,
            Dimension::new(
                axis,
                axis_name.clone(),
                axis_name,
                axis_units,
                DimensionKind::Spectral,
            ),
        )?;

        let mut metadata = MetaMap::new();
        for line in &header {
            if let Some((key, value)) = line.split_once(':') {
                metadata.insert(key.trim().to_string(), MetaValue::String(value.trim().to_string()));
            }
        }
        metadata.insert(
            "header".to_string(),
            MetaValue::List(header.iter().map(|l| MetaValue::String(l.clone())).collect()),
        );
        metadata.insert(
            "column_headings".to_string(),
            MetaValue::List(
                headings
                    .iter()
                    .map(|(name, unit)| {
                        MetaValue::List(vec![
                            MetaValue::String(name.clone()),
                            MetaValue::String(unit.clone()),
                        ])
                    })
                    .collect(),
            ),
        );
        ds.original_metadata = metadata;
        Ok(vec![ds])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# Reduction for REFL_203757\n\
# Reduction time: 2024-06-21 10:30:15\n\
# Q [1/Angstrom]  R  dR  dQ [1/Angstrom]\n\
0.008  0.98  0.01  0.0002\n\
0.009  0.95  0.01  0.0002\n\
0.010  0.90  0.01  0.0002\n";

    fn write_temp(dir: &tempfile::TempDir, text: &str) -> std::path::PathBuf {
        let path = dir.path().join("reduced.txt");
        std::fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn curve_reads_with_named_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, SAMPLE);
        let mut reader = NeutronReflectivityReader::open(&path).unwrap();
        assert!(reader.can_read());

        let datasets = reader.read().unwrap();
        assert_eq!(datasets.len(), 1);
        let ds = &datasets[0];
        assert_eq!(ds.title, "Neutron Reflectivity");
        assert_eq!(ds.shape(), &[3]);
        assert_eq!(ds.quantity, "R");
        assert_eq!(ds.data.get_f64(&[2]), Some(0.90));
        assert_eq!(ds.dims[0].name, "Q");
        assert_eq!(ds.dims[0].units, "1/Angstrom");
        assert_eq!(ds.dims[0].values, vec![0.008, 0.009, 0.010]);
        assert_eq!(
            ds.original_metadata.get("Reduction time"),
            Some(&MetaValue::String("2024-06-21 10:30:15".to_string()))
        );
        match ds.original_metadata.get("column_headings") {
            Some(MetaValue::List(cols)) => assert_eq!(cols.len(), 4),
            other => panic!("expected heading list, got {:?}", other),
        }
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "# Q  R\n0.1 0.9\n0.2 0.8 0.7\n");
        match NeutronReflectivityReader::open(&path).unwrap().read() {
            Err(ReaderError::InvalidFormat(msg)) => assert!(msg.contains("columns")),
            other => panic!("expected InvalidFormat, got {:?}", other.map(|d| d.len())),
        }
    }
}
