use std::path::{Path, PathBuf};

use ndarray::ArrayD;

use crate::dataset::linspace;
use crate::dataset::{DataKind, Dataset, Dimension, DimensionKind, MetaMap, MetaValue};
use crate::error::{ReaderError, Result};
use crate::reader::{coerce_number, has_extension, read_all, FormatReader};

/// Omicron STS grids exported by SPIP as `.asc`.
///
/// `# key = value` preamble, dotted parameter categories, then one
/// tab-separated spectrum per grid position after `# Start of Data:`.
pub struct AscReader {
    path: PathBuf,
    text: String,
}

impl AscReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let bytes = read_all(&path)?;
        Ok(Self {
            path,
            text: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }
}

impl FormatReader for AscReader {
    fn can_read(&self) -> bool {
        has_extension(&self.path, &["asc"])
    }

    fn read(&mut self) -> Result<Vec<Dataset>> {
        let lines: Vec<&str> = self.text.lines().map(|l| l.trim_end_matches('\r')).collect();
        let (parms, data_offset) = read_parms(&lines)?;

        let num_rows = get_usize(&parms, "Main-y_pixels")?;
        let num_cols = get_usize(&parms, "Main-x_pixels")?;
        let spectra_length = get_usize(&parms, "Main-z_points")?;
        let num_pos = num_rows * num_cols;
        if num_pos == 0 || spectra_length == 0 {
            return Err(ReaderError::InvalidFormat("empty spectroscopy grid".to_string()));
        }

        let mut values = Vec::with_capacity(num_pos * spectra_length);
        let data_lines: Vec<&&str> = lines[data_offset..]
            .iter()
            .filter(|l| !l.trim().is_empty())
            .collect();
        if data_lines.len() < num_pos {
            return Err(ReaderError::InvalidFormat(format!(
                "expected {} spectra, found {}",
                num_pos,
                data_lines.len()
            )));
        }
        for line in data_lines.iter().take(num_pos) {
            let row: Vec<f32> = line
                .split('\t')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(|t| {
                    t.parse::<f32>().map_err(|_| {
                        ReaderError::InvalidFormat(format!("non-numeric spectrum value '{}'", t))
                    })
                })
                .collect::<Result<_>>()?;
            if row.len() != spectra_length {
                return Err(ReaderError::InvalidFormat(format!(
                    "spectrum holds {} points, header says {}",
                    row.len(),
                    spectra_length
                )));
            }
            values.extend(row);
        }

        let arr =
            ArrayD::from_shape_vec(ndarray::IxDyn(&[num_rows, num_cols, spectra_length]), values)
                .map_err(|e| ReaderError::ShapeMismatch(e.to_string()))?;

        let volt_start = get_f64(&parms, "Spectroscopy-Device_1_Start [Volt]")?;
        let volt_end = get_f64(&parms, "Spectroscopy-Device_1_End [Volt]")?;
        let x_length = get_f64(&parms, "Main-x_length")?;
        let y_length = get_f64(&parms, "Main-y_length")?;
        let value_unit = parms
            .get("Main-value_unit")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let mut ds = Dataset::new("Omicron_STS", arr);
        ds.data_kind = DataKind::SpectralImage;
        ds.quantity = "Current".to_string();
        ds.units = value_unit;
        ds.source = "AscReader".to_string();
        ds.set_dimension(
            0,
            Dimension::new(
                linspace(0.0, y_length, num_rows),
                "y",
                "position",
                "nm",
                DimensionKind::Spatial,
            ),
        )?;
        ds.set_dimension(
            1,
            Dimension::new(
                linspace(0.0, x_length, num_cols),
                "x",
                "position",
                "nm",
                DimensionKind::Spatial,
            ),
        )?;
        ds.set_dimension(
            2,
            Dimension::new(
                linspace(volt_start, volt_end, spectra_length),
                "Bias",
                "Voltage",
                "Volt",
                DimensionKind::Spectral,
            ),
        )?;
        ds.original_metadata = parms;

        Ok(vec![ds])
    }
}

/// Header layout: optional `# Created by SPIP <version> <time>` line, `#`
/// key/value lines for the main section, then `.  Category:` blocks of
/// `.  .  key = value` parameters until `# Start of Data:`. Category and
/// key are joined with `-`; a two-token value moves its unit into the key
/// as `key [unit]`.
fn read_parms(lines: &[&str]) -> Result<(MetaMap, usize)> {
    let mut parms = MetaMap::new();

    if let Some(line) = lines.get(1) {
        if let Some(rest) = line.strip_prefix("# Created by SPIP ") {
            let mut split = rest.trim().splitn(2, ' ');
            if let Some(version) = split.next() {
                parms.insert("Main-SPIP_version".to_string(), MetaValue::from(version));
            }
            if let Some(time) = split.next() {
                parms.insert("Main-creation_time".to_string(), MetaValue::from(time.trim()));
            }
        }
    }

    let mut index = 3.min(lines.len());
    while index < lines.len() {
        let line = lines[index];
        if parse_category(line).is_some() {
            break;
        }
        let cleaned = line.replace("# ", "");
        if let Some((key, value)) = cleaned.split_once('=') {
            let key = format!("Main-{}", key.trim().replace('-', "_"));
            parms.insert(key, coerce_number(value.trim()));
        }
        index += 1;
    }

    let mut category: Option<String> = None;
    let mut found_data = false;
    while index < lines.len() {
        let line = lines[index];
        index += 1;
        if line.trim().starts_with("# Start of Data:") {
            found_data = true;
            break;
        }
        if let Some((key, value)) = parse_category_parm(line) {
            if let Some(cat) = &category {
                parms.insert(format!("{}-{}", cat, key), value);
            }
        } else if let Some(name) = parse_category(line) {
            category = Some(name);
        }
    }
    if !found_data {
        return Err(ReaderError::InvalidFormat("missing '# Start of Data:' marker".to_string()));
    }

    Ok((parms, index))
}

/// `.  Category:`
fn parse_category(line: &str) -> Option<String> {
    let rest = line.strip_prefix(".  ")?;
    if rest.starts_with(".  ") {
        return None;
    }
    let rest = rest.trim_end();
    rest.strip_suffix(':').map(|name| name.trim().to_string())
}

/// `.  .  key = value`; `--` values mean unset.
fn parse_category_parm(line: &str) -> Option<(String, MetaValue)> {
    let rest = line.strip_prefix(".  .  ")?;
    let (raw_key, raw_value) = rest.split_once(" = ")?;
    let mut key = raw_key.trim().replace('-', "_");
    let mut value = raw_value.trim().replace("--", "");

    let tokens: Vec<&str> = value.split(' ').collect();
    if tokens.len() == 2 {
        key = format!("{} [{}]", key, tokens[1]);
        value = tokens[0].to_string();
    }
    Some((key, coerce_number(value.trim())))
}

fn get_usize(parms: &MetaMap, key: &str) -> Result<usize> {
    parms
        .get(key)
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .ok_or_else(|| ReaderError::MetadataParse(format!("missing or non-numeric '{}'", key)))
}

fn get_f64(parms: &MetaMap, key: &str) -> Result<f64> {
    parms
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| ReaderError::MetadataParse(format!("missing or non-numeric '{}'", key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_and_parm_lines() {
        assert_eq!(parse_category(".  Spectroscopy:"), Some("Spectroscopy".to_string()));
        assert_eq!(parse_category(".  .  not a category:"), None);
        assert_eq!(parse_category("# comment"), None);

        let (key, value) = parse_category_parm(".  .  Device_1_Start = -2.0 Volt").unwrap();
        assert_eq!(key, "Device_1_Start [Volt]");
        assert_eq!(value, MetaValue::Int(-2));

        let (key, value) = parse_category_parm(".  .  Auto_Flush_Period = 0.1 Second").unwrap();
        assert_eq!(key, "Auto_Flush_Period [Second]");
        assert_eq!(value, MetaValue::Float(0.1));
    }

    #[test]
    fn whole_floats_become_integers() {
        assert_eq!(coerce_number("100"), MetaValue::Int(100));
        assert_eq!(coerce_number("100.0"), MetaValue::Int(100));
        assert_eq!(coerce_number("0.25"), MetaValue::Float(0.25));
        assert_eq!(coerce_number("nA"), MetaValue::String("nA".to_string()));
    }
}
