use std::path::{Path, PathBuf};

use ndarray::ArrayD;

use crate::dataset::{DataKind, Dataset, Dimension, DimensionKind, MetaMap, MetaValue};
use crate::error::{ReaderError, Result};
use crate::reader::{has_extension, read_all, FormatReader};

/// Nanonis controller point-spectroscopy exports (`.dat`).
///
/// Tab-separated header lines up to a `[DATA]` marker, then a channel-name
/// row and float columns. Column 0 is the sweep axis; every further column
/// becomes its own spectrum dataset.
pub struct NanonisDatReader {
    path: PathBuf,
    text: String,
}

impl NanonisDatReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let bytes = read_all(&path)?;
        Ok(Self {
            path,
            text: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }
}

impl FormatReader for NanonisDatReader {
    fn can_read(&self) -> bool {
        has_extension(&self.path, &["dat"])
    }

    fn read(&mut self) -> Result<Vec<Dataset>> {
        let lines: Vec<&str> = self.text.lines().map(|l| l.trim_end_matches('\r')).collect();
        let data_start = lines
            .iter()
            .position(|l| *l == "[DATA]")
            .ok_or_else(|| ReaderError::InvalidFormat("missing [DATA] marker".to_string()))?;

        // The line right before [DATA] is a separator and not a parameter.
        let header = &lines[..data_start.saturating_sub(1)];
        let parms = read_parms(header);

        let channel_line = lines
            .get(data_start + 1)
            .ok_or_else(|| ReaderError::InvalidFormat("missing channel name row".to_string()))?;
        let channels = parse_channels(channel_line);
        if channels.len() < 2 {
            return Err(ReaderError::InvalidFormat(format!(
                "expected a sweep column plus at least one channel, found {} column(s)",
                channels.len()
            )));
        }

        let rows = parse_rows(&lines[data_start + 2..], channels.len())?;
        let n = rows.len();
        if n == 0 {
            return Err(ReaderError::InvalidFormat("no data rows after [DATA]".to_string()));
        }

        let sweep: Vec<f64> = rows.iter().map(|r| r[0]).collect();
        let sweep_units = channels[0].1.clone();

        let mut datasets = Vec::new();
        for (col, (name, units)) in channels.iter().enumerate().skip(1) {
            let values: Vec<f64> = rows.iter().map(|r| r[col]).collect();
            let arr = ArrayD::from_shape_vec(ndarray::IxDyn(&[n]), values)
                .map_err(|e| ReaderError::ShapeMismatch(e.to_string()))?;

            let mut ds = Dataset::new(name.clone(), arr);
            ds.data_kind = DataKind::Spectrum;
            ds.quantity = name.clone();
            ds.units = units.clone();
            ds.source = "NanonisDatReader".to_string();
            ds.set_dimension(
                0,
                Dimension::new(
                    sweep.clone(),
                    name.clone(),
                    "Voltage",
                    sweep_units.clone(),
                    DimensionKind::Spectral,
                ),
            )?;
            ds.original_metadata = parms.clone();
            datasets.push(ds);
        }

        Ok(datasets)
    }
}

/// Header lines are `key\tvalue\t`; single values parse as floats when they
/// can, a key without values keeps an empty list.
fn read_parms(header: &[&str]) -> MetaMap {
    let mut parms = MetaMap::new();
    for line in header {
        let vals: Vec<&str> = line.split('\t').collect();
        let key = vals[0].to_string();
        if key.is_empty() {
            continue;
        }
        let middle = &vals[1..vals.len().saturating_sub(1).max(1)];
        let value = match middle.first() {
            None => MetaValue::List(Vec::new()),
            Some(first) => match first.parse::<f64>() {
                Ok(f) => MetaValue::Float(f),
                Err(_) => MetaValue::String((*first).to_string()),
            },
        };
        parms.insert(key, value);
    }
    parms
}

/// Split a `Name (unit)` channel row into (name, unit) pairs.
fn parse_channels(line: &str) -> Vec<(String, String)> {
    line.split('\t')
        .filter(|f| !f.trim().is_empty())
        .map(|field| {
            let name = field.split('(').next().unwrap_or(field).trim().to_string();
            let unit = field
                .find('(')
                .and_then(|start| field[start + 1..].find(')').map(|end| (start, end)))
                .map(|(start, end)| field[start + 1..start + 1 + end].to_string())
                .unwrap_or_default();
            (name, unit)
        })
        .collect()
}

fn parse_rows(lines: &[&str], n_cols: usize) -> Result<Vec<Vec<f64>>> {
    let mut rows = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let row: Vec<f64> = line
            .split_whitespace()
            .map(|tok| {
                tok.parse::<f64>().map_err(|_| {
                    ReaderError::InvalidFormat(format!("non-numeric data value '{}'", tok))
                })
            })
            .collect::<Result<_>>()?;
        if row.len() != n_cols {
            return Err(ReaderError::InvalidFormat(format!(
                "data row has {} columns, channel row has {}",
                row.len(),
                n_cols
            )));
        }
        rows.push(row);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_row_split() {
        let chans = parse_channels("Bias calc (V)\tCurrent (A)\tLIX 1 omega (A)");
        assert_eq!(chans.len(), 3);
        assert_eq!(chans[0], ("Bias calc".to_string(), "V".to_string()));
        assert_eq!(chans[2], ("LIX 1 omega".to_string(), "A".to_string()));
    }

    #[test]
    fn parms_coerce_floats_only_when_possible() {
        let parms = read_parms(&["Settling time (s)\t2E-4\t", "User\t\t", "Experiment\tbias spectroscopy\t"]);
        assert_eq!(parms["Settling time (s)"], MetaValue::Float(2e-4));
        assert_eq!(parms["User"], MetaValue::String(String::new()));
        assert_eq!(
            parms["Experiment"],
            MetaValue::String("bias spectroscopy".to_string())
        );
    }
}
