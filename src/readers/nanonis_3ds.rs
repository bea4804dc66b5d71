use std::collections::HashMap;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};
use ndarray::ArrayD;
use tracing::warn;

use crate::dataset::{DataKind, Dataset, Dimension, DimensionKind, MetaMap, MetaValue};
use crate::dataset::linspace;
use crate::error::{ReaderError, Result};
use crate::reader::{has_extension, read_all, FormatReader};

const HEADER_END: &[u8] = b":HEADER_END:";

/// Nanonis grid spectroscopy (`.3ds`).
///
/// ASCII `Key=value` header terminated by `:HEADER_END:`, then big-endian
/// f32 records per grid point: the fixed and experiment parameters followed
/// by each channel's sweep. One spectral-image dataset per channel and
/// sweep direction.
pub struct Nanonis3dsReader {
    path: PathBuf,
    bytes: Vec<u8>,
}

struct GridHeader {
    nx: usize,
    ny: usize,
    points: usize,
    num_parameters: usize,
    parameter_names: Vec<String>,
    channels: Vec<String>,
    sweep_signal: String,
    entries: HashMap<String, String>,
}

impl Nanonis3dsReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let bytes = read_all(&path)?;
        Ok(Self { path, bytes })
    }

    fn parse_header(&self) -> Result<(GridHeader, usize)> {
        let marker = find(&self.bytes, HEADER_END).ok_or_else(|| {
            ReaderError::InvalidFormat("missing :HEADER_END: marker".to_string())
        })?;
        let text = String::from_utf8_lossy(&self.bytes[..marker]);

        let mut entries = HashMap::new();
        for line in text.lines() {
            if let Some((key, value)) = line.split_once('=') {
                entries.insert(key.trim().to_string(), unquote(value).to_string());
            }
        }
        // Interrupted acquisitions can leave these out of the header.
        for (key, value) in [
            ("Delay before measuring (s)", "0.0"),
            ("Start time", "0.0"),
            ("End time", "1000.0"),
            (
                "Comment",
                "Default values for delay before measuring (s), Start time and End time fields were used! Beware!",
            ),
        ] {
            entries
                .entry(key.to_string())
                .or_insert_with(|| value.to_string());
        }

        let dim = entries
            .get("Grid dim")
            .ok_or_else(|| ReaderError::MetadataParse("missing 'Grid dim' entry".to_string()))?;
        let (nx, ny) = parse_grid_dim(dim)?;

        let points: usize = parse_entry(&entries, "Points")?;
        let num_parameters: usize = parse_entry(&entries, "# Parameters (4 byte)")?;

        let mut parameter_names: Vec<String> = split_list(entries.get("Fixed parameters"));
        parameter_names.extend(split_list(entries.get("Experiment parameters")));

        let channels = split_list(entries.get("Channels"));
        if channels.is_empty() {
            return Err(ReaderError::MetadataParse("missing 'Channels' entry".to_string()));
        }
        let sweep_signal = entries
            .get("Sweep Signal")
            .cloned()
            .unwrap_or_else(|| "Sweep".to_string());

        let mut data_start = marker + HEADER_END.len();
        while data_start < self.bytes.len()
            && (self.bytes[data_start] == b'\r' || self.bytes[data_start] == b'\n')
        {
            data_start += 1;
        }

        Ok((
            GridHeader {
                nx,
                ny,
                points,
                num_parameters,
                parameter_names,
                channels,
                sweep_signal,
                entries,
            },
            data_start,
        ))
    }
}

impl FormatReader for Nanonis3dsReader {
    fn can_read(&self) -> bool {
        has_extension(&self.path, &["3ds"])
    }

    fn read(&mut self) -> Result<Vec<Dataset>> {
        let (header, data_start) = self.parse_header()?;
        let GridHeader {
            nx,
            ny,
            points,
            num_parameters,
            ..
        } = header;

        if nx == 0 || ny == 0 || points == 0 {
            return Err(ReaderError::InvalidFormat("empty grid".to_string()));
        }

        let per_point = num_parameters + header.channels.len() * points;
        let expected = nx * ny * per_point;
        let mut floats: Vec<f32> = self.bytes[data_start..]
            .chunks_exact(4)
            .map(BigEndian::read_f32)
            .collect();
        if floats.len() < expected {
            warn!(
                "grid data is truncated: {} of {} values, padding with NaN",
                floats.len(),
                expected
            );
            floats.resize(expected, f32::NAN);
        }

        if num_parameters < 2 {
            return Err(ReaderError::InvalidFormat(
                "grid header lacks sweep start/end parameters".to_string(),
            ));
        }
        let sweep_start = floats[0] as f64;
        let sweep_end = floats[1] as f64;
        let sweep = linspace(sweep_start, sweep_end, points);

        let meas_parms = collect_meas_parms(&header, &floats, per_point);

        let (spec_name, spec_unit) = split_signal_label(&header.sweep_signal);
        let y_dim = Dimension::new(
            (0..ny).map(|i| i as f64).collect(),
            "Y",
            "Length",
            "nm",
            DimensionKind::Spatial,
        );
        let x_dim = Dimension::new(
            (0..nx).map(|i| i as f64).collect(),
            "X",
            "Length",
            "nm",
            DimensionKind::Spatial,
        );
        let spec_dim = Dimension::new(sweep, spec_name, "Bias", spec_unit, DimensionKind::Spectral);

        let mut datasets = Vec::new();
        for (chan_index, raw_name) in header.channels.iter().enumerate() {
            let (name, unit, direction) = split_channel_label(raw_name);
            let title = format!("{} {}", name, direction);

            let mut values = Vec::with_capacity(nx * ny * points);
            for iy in 0..ny {
                for ix in 0..nx {
                    let base = (iy * nx + ix) * per_point + num_parameters + chan_index * points;
                    values.extend_from_slice(&floats[base..base + points]);
                }
            }
            let arr = ArrayD::from_shape_vec(ndarray::IxDyn(&[ny, nx, points]), values)
                .map_err(|e| ReaderError::ShapeMismatch(e.to_string()))?;

            let mut ds = Dataset::new(title, arr);
            ds.data_kind = DataKind::SpectralImage;
            ds.quantity = name.clone();
            ds.units = unit.clone();
            ds.source = "Nanonis3dsReader".to_string();
            ds.set_dimension(0, y_dim.clone())?;
            ds.set_dimension(1, x_dim.clone())?;
            ds.set_dimension(2, spec_dim.clone())?;

            let mut meta = MetaMap::new();
            meta.insert("Name".to_string(), MetaValue::from(name));
            meta.insert("Direction".to_string(), MetaValue::from(direction));
            meta.insert("Unit".to_string(), MetaValue::from(unit));
            for (k, v) in &meas_parms {
                meta.insert(k.clone(), v.clone());
            }
            ds.original_metadata = meta;
            datasets.push(ds);
        }

        Ok(datasets)
    }
}

/// Measurement parameters: renamed header fields plus one entry per grid
/// parameter, collapsed along axes where the grid is constant.
fn collect_meas_parms(header: &GridHeader, floats: &[f32], per_point: usize) -> MetaMap {
    let mut parms = MetaMap::new();

    parms.insert(
        "dim_px".to_string(),
        MetaValue::List(vec![
            MetaValue::from(header.nx),
            MetaValue::from(header.ny),
        ]),
    );
    parms.insert("num_sweep_signal".to_string(), MetaValue::from(header.points));
    parms.insert(
        "num_parameters".to_string(),
        MetaValue::from(header.num_parameters),
    );
    parms.insert(
        "sweep_signal".to_string(),
        MetaValue::from(header.sweep_signal.clone()),
    );

    if let Some(settings) = header.entries.get("Grid settings") {
        let nums: Vec<f64> = settings
            .split(';')
            .filter_map(|t| t.trim().parse::<f64>().ok())
            .collect();
        if nums.len() >= 5 {
            parms.insert(
                "pos_xy".to_string(),
                MetaValue::List(vec![MetaValue::Float(nums[0]), MetaValue::Float(nums[1])]),
            );
            parms.insert(
                "size_xy".to_string(),
                MetaValue::List(vec![MetaValue::Float(nums[2]), MetaValue::Float(nums[3])]),
            );
            parms.insert("angle".to_string(), MetaValue::Float(nums[4]));
        }
    }

    let renames = [
        ("Experiment", "experiment_name"),
        ("Start time", "start_time"),
        ("End time", "end_time"),
        ("User", "user"),
        ("Comment", "comment"),
        ("Delay before measuring (s)", "delay_before_measuring"),
    ];
    for (raw, renamed) in renames {
        if let Some(value) = header.entries.get(raw) {
            parms.insert(renamed.to_string(), MetaValue::parse_scalar(value));
        }
    }

    // Name lists longer than the declared parameter block are not indexable.
    let names = header.parameter_names.iter().take(header.num_parameters);
    for (j, name) in names.enumerate() {
        let grid: Vec<Vec<f64>> = (0..header.nx)
            .map(|ix| {
                (0..header.ny)
                    .map(|iy| floats[(iy * header.nx + ix) * per_point + j] as f64)
                    .collect()
            })
            .collect();
        parms.insert(name.clone(), collapse_grid(grid));
    }

    parms
}

/// Drop grid axes whose values repeat; constancy is judged from the first
/// two slices along each axis.
fn collapse_grid(grid: Vec<Vec<f64>>) -> MetaValue {
    let nx = grid.len();
    let ny = grid.first().map_or(0, |row| row.len());

    let x_const = nx < 2 || grid[0] == grid[1];
    let y_const = ny < 2 || grid.iter().all(|row| row[0] == row[1]);

    let float_list = |values: Vec<f64>| MetaValue::List(values.into_iter().map(MetaValue::Float).collect());

    match (x_const, y_const) {
        (true, true) => MetaValue::Float(grid[0][0]),
        (true, false) => float_list(grid[0].clone()),
        (false, true) => float_list(grid.iter().map(|row| row[0]).collect()),
        (false, false) => MetaValue::List(grid.into_iter().map(float_list).collect()),
    }
}

/// `Current [bwd] (A)` style channel label into (name, unit, direction).
fn split_channel_label(raw: &str) -> (String, String, String) {
    let mut tokens: Vec<&str> = raw.split_whitespace().collect();
    let mut direction = "forward";
    if let Some(pos) = tokens.iter().position(|t| *t == "[bwd]") {
        direction = "backward";
        tokens.remove(pos);
    }
    let mut unit = String::new();
    if let Some(last) = tokens.last() {
        if last.starts_with('(') && last.ends_with(')') {
            unit = last.trim_matches(|c| c == '(' || c == ')').to_string();
            tokens.pop();
        }
    }
    (tokens.join(" "), unit, direction.to_string())
}

fn split_signal_label(raw: &str) -> (String, String) {
    let (name, unit, _) = split_channel_label(raw);
    (name, unit)
}

fn parse_grid_dim(value: &str) -> Result<(usize, usize)> {
    let parts: Vec<&str> = value.split('x').map(str::trim).collect();
    if parts.len() != 2 {
        return Err(ReaderError::MetadataParse(format!(
            "cannot parse grid dimensions from '{}'",
            value
        )));
    }
    let nx = parts[0]
        .parse()
        .map_err(|_| ReaderError::MetadataParse(format!("bad grid width '{}'", parts[0])))?;
    let ny = parts[1]
        .parse()
        .map_err(|_| ReaderError::MetadataParse(format!("bad grid height '{}'", parts[1])))?;
    Ok((nx, ny))
}

fn parse_entry(entries: &HashMap<String, String>, key: &str) -> Result<usize> {
    let value = entries
        .get(key)
        .ok_or_else(|| ReaderError::MetadataParse(format!("missing '{}' entry", key)))?;
    value
        .trim()
        .parse()
        .map_err(|_| ReaderError::MetadataParse(format!("bad '{}' value '{}'", key, value)))
}

fn split_list(value: Option<&String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(';')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn unquote(value: &str) -> &str {
    value.trim().trim_matches('"')
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
