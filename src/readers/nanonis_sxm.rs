use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};
use ndarray::ArrayD;

use crate::dataset::linspace;
use crate::dataset::{DataKind, Dataset, Dimension, DimensionKind, MetaMap, MetaValue};
use crate::error::{ReaderError, Result};
use crate::reader::{has_extension, read_all, FormatReader};

const SCAN_END: &[u8] = b":SCANIT_END:";
const DATA_MARK: &[u8] = &[0x1a, 0x04];

/// Nanonis scan files (`.sxm`).
///
/// ASCII header of `:TAG:` lines with indented value lines, terminated by
/// `:SCANIT_END:` and a 0x1a 0x04 marker, then per channel one big-endian
/// f32 frame per recorded direction. One image dataset per channel and
/// direction.
pub struct NanonisSxmReader {
    path: PathBuf,
    bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
struct ChannelInfo {
    channel: String,
    name: String,
    unit: String,
    directions: Vec<&'static str>,
    calibration: String,
    offset: String,
}

impl NanonisSxmReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let bytes = read_all(&path)?;
        Ok(Self { path, bytes })
    }
}

impl FormatReader for NanonisSxmReader {
    fn can_read(&self) -> bool {
        has_extension(&self.path, &["sxm"])
    }

    fn read(&mut self) -> Result<Vec<Dataset>> {
        let end = find(&self.bytes, SCAN_END).ok_or_else(|| {
            ReaderError::InvalidFormat("missing :SCANIT_END: marker".to_string())
        })?;
        let header_text = String::from_utf8_lossy(&self.bytes[..end]);
        let tags = parse_tags(&header_text);

        let scanit_type = tag_value(&tags, "SCANIT_TYPE").unwrap_or_default();
        let type_tokens: Vec<&str> = scanit_type.split_whitespace().collect();
        if !type_tokens.is_empty() && type_tokens != ["FLOAT", "MSBFIRST"] {
            return Err(ReaderError::UnsupportedDataType(format!(
                "scan data type '{}'",
                scanit_type.trim()
            )));
        }

        let (num_cols, num_rows) = parse_pixels(&tags)?;
        let (width, height) = parse_range(&tags)?;
        let scan_dir = tag_value(&tags, "SCAN_DIR").unwrap_or_default().trim().to_string();
        let channels = parse_data_info(&tags)?;

        let data_start = find(&self.bytes[end..], DATA_MARK)
            .map(|p| end + p + DATA_MARK.len())
            .ok_or_else(|| ReaderError::InvalidFormat("missing scan data marker".to_string()))?;
        let floats: Vec<f32> = self.bytes[data_start..]
            .chunks_exact(4)
            .map(BigEndian::read_f32)
            .collect();

        let frame_len = num_rows * num_cols;
        let total_frames: usize = channels.iter().map(|c| c.directions.len()).sum();
        if floats.len() < frame_len * total_frames {
            return Err(ReaderError::InvalidFormat(format!(
                "scan data holds {} values, {} frames of {} expected",
                floats.len(),
                total_frames,
                frame_len
            )));
        }

        let meas_parms = collect_meas_parms(&tags);

        let y_dim = Dimension::new(
            linspace(0.0, height * 1e9, num_rows),
            "Y",
            "Length",
            "nm",
            DimensionKind::Spatial,
        );
        let x_dim = Dimension::new(
            linspace(0.0, width * 1e9, num_cols),
            "X",
            "Length",
            "nm",
            DimensionKind::Spatial,
        );

        let mut datasets = Vec::new();
        let mut frame_index = 0usize;
        for info in &channels {
            for direction in &info.directions {
                let offset = frame_index * frame_len;
                frame_index += 1;

                let mut frame = floats[offset..offset + frame_len].to_vec();
                // Upward scans store the last line first; backward sweeps
                // store columns right to left.
                if scan_dir == "up" {
                    flip_rows(&mut frame, num_rows, num_cols);
                }
                if *direction == "backward" {
                    flip_cols(&mut frame, num_rows, num_cols);
                }

                let arr = ArrayD::from_shape_vec(ndarray::IxDyn(&[num_rows, num_cols]), frame)
                    .map_err(|e| ReaderError::ShapeMismatch(e.to_string()))?;
                let title = format!("{} {}", info.name, direction);

                let mut ds = Dataset::new(title, arr);
                ds.data_kind = DataKind::Image;
                ds.quantity = info.name.clone();
                ds.units = info.unit.clone();
                ds.source = "NanonisSxmReader".to_string();
                ds.set_dimension(0, y_dim.clone())?;
                ds.set_dimension(1, x_dim.clone())?;

                let mut meta = MetaMap::new();
                meta.insert("Channel".to_string(), MetaValue::from(info.channel.clone()));
                meta.insert("Name".to_string(), MetaValue::from(info.name.clone()));
                meta.insert("Unit".to_string(), MetaValue::from(info.unit.clone()));
                meta.insert("Direction".to_string(), MetaValue::from(*direction));
                meta.insert(
                    "Calibration".to_string(),
                    MetaValue::parse_scalar(&info.calibration),
                );
                meta.insert("Offset".to_string(), MetaValue::parse_scalar(&info.offset));
                for (k, v) in &meas_parms {
                    meta.insert(k.clone(), v.clone());
                }
                ds.original_metadata = meta;
                datasets.push(ds);
            }
        }

        Ok(datasets)
    }
}

/// `:TAG:` line starts an entry; following lines up to the next tag are its
/// value.
fn parse_tags(text: &str) -> Vec<(String, Vec<String>)> {
    let mut tags: Vec<(String, Vec<String>)> = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.len() >= 2 && trimmed.starts_with(':') && trimmed.ends_with(':') {
            let tag = trimmed[1..trimmed.len() - 1].to_string();
            tags.push((tag, Vec::new()));
        } else if let Some((_, values)) = tags.last_mut() {
            values.push(line.to_string());
        }
    }
    tags
}

fn tag_value(tags: &[(String, Vec<String>)], name: &str) -> Option<String> {
    tags.iter()
        .find(|(tag, _)| tag == name)
        .map(|(_, values)| values.join("\n"))
}

fn parse_pixels(tags: &[(String, Vec<String>)]) -> Result<(usize, usize)> {
    let raw = tag_value(tags, "SCAN_PIXELS")
        .ok_or_else(|| ReaderError::MetadataParse("missing :SCAN_PIXELS: tag".to_string()))?;
    let nums: Vec<usize> = raw
        .split_whitespace()
        .filter_map(|t| t.parse().ok())
        .collect();
    if nums.len() != 2 || nums[0] == 0 || nums[1] == 0 {
        return Err(ReaderError::MetadataParse(format!(
            "cannot parse scan pixels from '{}'",
            raw.trim()
        )));
    }
    Ok((nums[0], nums[1]))
}

fn parse_range(tags: &[(String, Vec<String>)]) -> Result<(f64, f64)> {
    let raw = tag_value(tags, "SCAN_RANGE")
        .ok_or_else(|| ReaderError::MetadataParse("missing :SCAN_RANGE: tag".to_string()))?;
    let nums: Vec<f64> = raw
        .split_whitespace()
        .filter_map(|t| t.parse().ok())
        .collect();
    if nums.len() != 2 {
        return Err(ReaderError::MetadataParse(format!(
            "cannot parse scan range from '{}'",
            raw.trim()
        )));
    }
    Ok((nums[0], nums[1]))
}

/// DATA_INFO table: `Channel Name Unit Direction Calibration Offset` rows,
/// one per recorded channel.
fn parse_data_info(tags: &[(String, Vec<String>)]) -> Result<Vec<ChannelInfo>> {
    let raw = tags
        .iter()
        .find(|(tag, _)| tag == "DATA_INFO")
        .map(|(_, values)| values.clone())
        .ok_or_else(|| ReaderError::MetadataParse("missing :DATA_INFO: tag".to_string()))?;

    let mut rows = raw
        .iter()
        .map(|line| line.split_whitespace().map(str::to_string).collect::<Vec<_>>())
        .filter(|fields| !fields.is_empty());

    let headings = rows
        .next()
        .ok_or_else(|| ReaderError::MetadataParse("empty DATA_INFO table".to_string()))?;
    let col = |name: &str| headings.iter().position(|h| h == name);
    let (name_col, unit_col, dir_col) = match (col("Name"), col("Unit"), col("Direction")) {
        (Some(n), Some(u), Some(d)) => (n, u, d),
        _ => {
            return Err(ReaderError::MetadataParse(
                "DATA_INFO table lacks Name/Unit/Direction columns".to_string(),
            ))
        }
    };
    let chan_col = col("Channel");
    let cal_col = col("Calibration");
    let off_col = col("Offset");

    let mut channels = Vec::new();
    for fields in rows {
        if fields.len() <= dir_col.max(unit_col).max(name_col) {
            continue;
        }
        let get = |idx: Option<usize>| {
            idx.and_then(|i| fields.get(i))
                .cloned()
                .unwrap_or_default()
        };
        let directions = match fields[dir_col].as_str() {
            "both" => vec!["forward", "backward"],
            "bwd" | "backward" => vec!["backward"],
            _ => vec!["forward"],
        };
        channels.push(ChannelInfo {
            channel: get(chan_col),
            name: fields[name_col].clone(),
            unit: fields[unit_col].clone(),
            directions,
            calibration: get(cal_col),
            offset: get(off_col),
        });
    }
    if channels.is_empty() {
        return Err(ReaderError::MetadataParse("DATA_INFO table has no channels".to_string()));
    }
    Ok(channels)
}

fn collect_meas_parms(tags: &[(String, Vec<String>)]) -> MetaMap {
    let mut parms = MetaMap::new();
    for (tag, values) in tags {
        if tag == "DATA_INFO" || tag == "SCANIT_END" {
            continue;
        }
        let key = tag.to_ascii_lowercase();
        let joined = values.join("\n").trim().to_string();
        let value = match key.as_str() {
            "scan_pixels" => int_list(&joined),
            "scan_range" | "scan_offset" | "scan_time" => float_list(&joined),
            _ => MetaValue::parse_scalar(&joined),
        };
        parms.insert(key, value);
    }
    parms
}

fn int_list(raw: &str) -> MetaValue {
    MetaValue::List(
        raw.split_whitespace()
            .filter_map(|t| t.parse::<i64>().ok())
            .map(MetaValue::Int)
            .collect(),
    )
}

fn float_list(raw: &str) -> MetaValue {
    MetaValue::List(
        raw.split_whitespace()
            .filter_map(|t| t.parse::<f64>().ok())
            .map(MetaValue::Float)
            .collect(),
    )
}

fn flip_rows(frame: &mut [f32], rows: usize, cols: usize) {
    for r in 0..rows / 2 {
        let (top, rest) = frame.split_at_mut((rows - 1 - r) * cols);
        top[r * cols..(r + 1) * cols].swap_with_slice(&mut rest[..cols]);
    }
}

fn flip_cols(frame: &mut [f32], rows: usize, cols: usize) {
    for r in 0..rows {
        frame[r * cols..(r + 1) * cols].reverse();
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_blocks_collect_value_lines() {
        let text = ":SCAN_PIXELS:\n  4  2\n:SCAN_DIR:\ndown\n:COMMENT:\nline one\nline two\n";
        let tags = parse_tags(text);
        assert_eq!(tag_value(&tags, "SCAN_DIR").unwrap().trim(), "down");
        assert_eq!(tag_value(&tags, "COMMENT").unwrap(), "line one\nline two");
        assert_eq!(parse_pixels(&tags).unwrap(), (4, 2));
    }

    #[test]
    fn data_info_directions() {
        let text = ":DATA_INFO:\n\tChannel\tName\tUnit\tDirection\tCalibration\tOffset\n\t14\tZ\tm\tboth\t9.0E-9\t0.0\n\t0\tCurrent\tA\tfwd\t1.0E-9\t0.0\n";
        let tags = parse_tags(text);
        let channels = parse_data_info(&tags).unwrap();
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].directions, vec!["forward", "backward"]);
        assert_eq!(channels[1].directions, vec!["forward"]);
        assert_eq!(channels[0].name, "Z");
        assert_eq!(channels[1].unit, "A");
    }

    #[test]
    fn frame_flips() {
        let mut frame = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        flip_rows(&mut frame, 3, 2);
        assert_eq!(frame, vec![5.0, 6.0, 3.0, 4.0, 1.0, 2.0]);
        flip_cols(&mut frame, 3, 2);
        assert_eq!(frame, vec![6.0, 5.0, 4.0, 3.0, 2.0, 1.0]);
    }
}
