use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt};
use ndarray::ArrayD;
use tracing::warn;

use crate::dataset::linspace;
use crate::dataset::{DataKind, Dataset, Dimension, DimensionKind, MetaMap, MetaValue};
use crate::error::{ReaderError, Result};
use crate::reader::{basename_of, extension_of, has_extension, read_all, FormatReader};

const GSF_MAGIC: &str = "Gwyddion Simple Field 1.0";
const GWY_MAGIC: &[u8] = b"GWYP";

/// Gwyddion files: simple fields (`.gsf`) and native containers (`.gwy`).
pub struct GwyddionReader {
    path: PathBuf,
    bytes: Vec<u8>,
}

impl GwyddionReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let bytes = read_all(&path)?;
        Ok(Self { path, bytes })
    }

    /// Simple field: magic line, `name = value` text fields, NUL padding to
    /// a 4-byte boundary, then XRes*YRes little-endian f32 values.
    fn read_gsf(&self) -> Result<Vec<Dataset>> {
        let header_line_end = self
            .bytes
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| ReaderError::InvalidFormat("truncated simple field header".to_string()))?;
        let first_line = String::from_utf8_lossy(&self.bytes[..header_line_end]);
        if first_line.trim_end() != GSF_MAGIC {
            return Err(ReaderError::InvalidMagic {
                expected: GSF_MAGIC.to_string(),
                actual: first_line.trim_end().chars().take(32).collect(),
            });
        }

        let mut pos = header_line_end + 1;
        let mut fields = BTreeMap::new();
        while pos < self.bytes.len() && self.bytes[pos] != 0 {
            let line_end = self.bytes[pos..]
                .iter()
                .position(|&b| b == b'\n')
                .map(|p| pos + p)
                .ok_or_else(|| ReaderError::InvalidFormat("unterminated header line".to_string()))?;
            let line = String::from_utf8_lossy(&self.bytes[pos..line_end]);
            if let Some((key, value)) = line.split_once('=') {
                fields.insert(key.trim().to_string(), value.trim().to_string());
            }
            pos = line_end + 1;
        }
        // NUL padding to the next 4-byte boundary, at least one byte.
        pos += 4 - pos % 4;
        if pos > self.bytes.len() {
            return Err(ReaderError::InvalidFormat("truncated simple field padding".to_string()));
        }

        let x_res: usize = parse_field(&fields, "XRes")?;
        let y_res: usize = parse_field(&fields, "YRes")?;
        if x_res == 0 || y_res == 0 {
            return Err(ReaderError::InvalidFormat("zero-sized simple field".to_string()));
        }
        let x_real: f64 = fields
            .get("XReal")
            .map(|v| v.parse())
            .transpose()
            .map_err(|_| ReaderError::MetadataParse("bad XReal value".to_string()))?
            .unwrap_or(1.0);
        let y_real: f64 = fields
            .get("YReal")
            .map(|v| v.parse())
            .transpose()
            .map_err(|_| ReaderError::MetadataParse("bad YReal value".to_string()))?
            .unwrap_or(1.0);

        let expected = x_res * y_res * 4;
        let payload = &self.bytes[pos..];
        if payload.len() < expected {
            return Err(ReaderError::InvalidFormat(format!(
                "simple field data holds {} bytes, {} expected",
                payload.len(),
                expected
            )));
        }
        let values: Vec<f32> = payload[..expected]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let arr = ArrayD::from_shape_vec(ndarray::IxDyn(&[y_res, x_res]), values)
            .map_err(|e| ReaderError::ShapeMismatch(e.to_string()))?;

        let title = fields
            .get("Title")
            .cloned()
            .unwrap_or_else(|| basename_of(&self.path));
        let xy_units = fields.get("XYUnits").cloned().unwrap_or_default();
        let z_units = fields.get("ZUnits").cloned().unwrap_or_default();

        let mut ds = Dataset::new(title.clone(), arr);
        ds.data_kind = DataKind::Image;
        ds.quantity = title;
        ds.units = z_units;
        ds.source = "GwyddionReader".to_string();
        ds.set_dimension(
            0,
            Dimension::new(
                linspace(0.0, y_real, y_res),
                "y",
                "y",
                xy_units.clone(),
                DimensionKind::Spatial,
            ),
        )?;
        ds.set_dimension(
            1,
            Dimension::new(
                linspace(0.0, x_real, x_res),
                "x",
                "x",
                xy_units,
                DimensionKind::Spatial,
            ),
        )?;

        let mut meta = MetaMap::new();
        for (key, value) in &fields {
            let coerced = match key.as_str() {
                "XRes" | "YRes" => MetaValue::Int(value.parse().unwrap_or_default()),
                "XReal" | "YReal" | "XOffset" | "YOffset" => {
                    MetaValue::Float(value.parse().unwrap_or_default())
                }
                _ => MetaValue::String(value.clone()),
            };
            meta.insert(key.clone(), coerced);
        }
        ds.original_metadata = meta;

        Ok(vec![ds])
    }

    /// Native container: `GWYP` magic plus a serialized GwyContainer whose
    /// `/<n>/data` components hold GwyDataField images.
    fn read_gwy(&self) -> Result<Vec<Dataset>> {
        if self.bytes.len() < 4 || &self.bytes[..4] != GWY_MAGIC {
            let actual: String = self.bytes.iter().take(4).map(|&b| b as char).collect();
            return Err(ReaderError::InvalidMagic {
                expected: "GWYP".to_string(),
                actual,
            });
        }
        let mut cursor = Cursor::new(&self.bytes[4..]);
        let container = read_object(&mut cursor)?;

        let mut datasets = Vec::new();
        for (key, value) in &container.components {
            let parts: Vec<&str> = key.split('/').collect();
            if parts.len() == 3 && parts[2] == "data" && parts[1].parse::<u32>().is_ok() {
                let field = match value {
                    GwyValue::Object(obj) if obj.name == "GwyDataField" => obj,
                    _ => continue,
                };
                let title = container
                    .components
                    .get(&format!("{}/title", key))
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("Channel {}", parts[1]));
                datasets.push(self.data_field_to_dataset(field, title)?);
            } else if parts.len() >= 2
                && (["sps", "brick", "xyz"].contains(&parts[1]) || parts.get(2) == Some(&"graph"))
            {
                warn!("skipping unsupported container tree '{}'", key);
            }
        }
        if datasets.is_empty() {
            return Err(ReaderError::InvalidFormat(
                "container holds no image channels".to_string(),
            ));
        }
        Ok(datasets)
    }

    fn data_field_to_dataset(&self, field: &GwyObject, title: String) -> Result<Dataset> {
        let x_res = field
            .get_i64("xres")
            .ok_or_else(|| ReaderError::MetadataParse("data field lacks xres".to_string()))?
            as usize;
        let y_res = field
            .get_i64("yres")
            .ok_or_else(|| ReaderError::MetadataParse("data field lacks yres".to_string()))?
            as usize;
        let x_real = field.get_f64("xreal").unwrap_or(1.0);
        let y_real = field.get_f64("yreal").unwrap_or(1.0);
        let xy_units = field.unit_string("si_unit_xy");
        let z_units = field.unit_string("si_unit_z");

        let data = match field.components.get("data") {
            Some(GwyValue::DoubleArray(values)) => values.clone(),
            _ => {
                return Err(ReaderError::MetadataParse(
                    "data field lacks a double array".to_string(),
                ))
            }
        };
        if data.len() != x_res * y_res {
            return Err(ReaderError::ShapeMismatch(format!(
                "data field holds {} values, {}x{} expected",
                data.len(),
                x_res,
                y_res
            )));
        }
        let arr = ArrayD::from_shape_vec(ndarray::IxDyn(&[y_res, x_res]), data)
            .map_err(|e| ReaderError::ShapeMismatch(e.to_string()))?;

        let mut ds = Dataset::new(title.clone(), arr);
        ds.data_kind = DataKind::Image;
        ds.quantity = title;
        ds.units = z_units;
        ds.source = "GwyddionReader".to_string();
        ds.set_dimension(
            0,
            Dimension::new(
                linspace(0.0, y_real, y_res),
                "y",
                "y",
                xy_units.clone(),
                DimensionKind::Spatial,
            ),
        )?;
        ds.set_dimension(
            1,
            Dimension::new(
                linspace(0.0, x_real, x_res),
                "x",
                "x",
                xy_units,
                DimensionKind::Spatial,
            ),
        )?;

        let mut meta = MetaMap::new();
        for (key, value) in &field.components {
            if key.contains("data") {
                continue;
            }
            meta.insert(key.clone(), value.to_meta());
        }
        ds.original_metadata = meta;
        Ok(ds)
    }
}

impl FormatReader for GwyddionReader {
    fn can_read(&self) -> bool {
        has_extension(&self.path, &["gsf", "gwy"])
    }

    fn read(&mut self) -> Result<Vec<Dataset>> {
        match extension_of(&self.path).as_str() {
            "gsf" => self.read_gsf(),
            "gwy" => self.read_gwy(),
            other => Err(ReaderError::InvalidFormat(format!(
                "expected a .gsf or .gwy file, got '.{}'",
                other
            ))),
        }
    }
}

/// Component value in a serialized Gwyddion container
#[derive(Debug, Clone, PartialEq)]
enum GwyValue {
    Bool(bool),
    Char(u8),
    Int(i32),
    Long(i64),
    Double(f64),
    Str(String),
    Object(GwyObject),
    CharArray(Vec<u8>),
    IntArray(Vec<i32>),
    LongArray(Vec<i64>),
    DoubleArray(Vec<f64>),
    StrArray(Vec<String>),
    ObjectArray(Vec<GwyObject>),
}

impl GwyValue {
    fn as_str(&self) -> Option<&str> {
        if let GwyValue::Str(s) = self {
            Some(s)
        } else {
            None
        }
    }

    fn to_meta(&self) -> MetaValue {
        match self {
            GwyValue::Bool(b) => MetaValue::Bool(*b),
            GwyValue::Char(c) => MetaValue::UInt(*c as u64),
            GwyValue::Int(i) => MetaValue::Int(*i as i64),
            GwyValue::Long(l) => MetaValue::Int(*l),
            GwyValue::Double(d) => MetaValue::Float(*d),
            GwyValue::Str(s) => MetaValue::String(s.clone()),
            GwyValue::Object(obj) => obj.to_meta(),
            GwyValue::CharArray(items) => MetaValue::Bytes(items.clone()),
            GwyValue::IntArray(items) => {
                MetaValue::List(items.iter().map(|v| MetaValue::Int(*v as i64)).collect())
            }
            GwyValue::LongArray(items) => {
                MetaValue::List(items.iter().map(|v| MetaValue::Int(*v)).collect())
            }
            GwyValue::DoubleArray(items) => {
                MetaValue::List(items.iter().map(|v| MetaValue::Float(*v)).collect())
            }
            GwyValue::StrArray(items) => MetaValue::List(
                items.iter().map(|v| MetaValue::String(v.clone())).collect(),
            ),
            GwyValue::ObjectArray(items) => {
                MetaValue::List(items.iter().map(GwyObject::to_meta).collect())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct GwyObject {
    name: String,
    components: BTreeMap<String, GwyValue>,
}

impl GwyObject {
    fn get_i64(&self, key: &str) -> Option<i64> {
        match self.components.get(key) {
            Some(GwyValue::Int(v)) => Some(*v as i64),
            Some(GwyValue::Long(v)) => Some(*v),
            _ => None,
        }
    }

    fn get_f64(&self, key: &str) -> Option<f64> {
        match self.components.get(key) {
            Some(GwyValue::Double(v)) => Some(*v),
            Some(GwyValue::Int(v)) => Some(*v as f64),
            _ => None,
        }
    }

    /// GwySIUnit objects carry the unit as their `unitstr` component.
    fn unit_string(&self, key: &str) -> String {
        match self.components.get(key) {
            Some(GwyValue::Object(unit)) => unit
                .components
                .get("unitstr")
                .and_then(GwyValue::as_str)
                .unwrap_or("")
                .to_string(),
            _ => String::new(),
        }
    }

    fn to_meta(&self) -> MetaValue {
        let map: MetaMap = self
            .components
            .iter()
            .map(|(k, v)| (k.clone(), v.to_meta()))
            .collect();
        MetaValue::Map(map)
    }
}

/// Serialized object: NUL-terminated type name, u32 byte size, components.
fn read_object(cursor: &mut Cursor<&[u8]>) -> Result<GwyObject> {
    let name = read_nul_string(cursor)?;
    let size = cursor.read_u32::<LittleEndian>()? as u64;
    let end = cursor.position() + size;
    if end > cursor.get_ref().len() as u64 {
        return Err(ReaderError::InvalidFormat(format!(
            "object '{}' overruns the file",
            name
        )));
    }

    let mut components = BTreeMap::new();
    while cursor.position() < end {
        let component = read_nul_string(cursor)?;
        let type_code = cursor.read_u8()?;
        let value = read_value(cursor, type_code)?;
        components.insert(component, value);
    }
    if cursor.position() != end {
        return Err(ReaderError::InvalidFormat(format!(
            "object '{}' components overrun its size",
            name
        )));
    }
    Ok(GwyObject { name, components })
}

fn read_value(cursor: &mut Cursor<&[u8]>, type_code: u8) -> Result<GwyValue> {
    let value = match type_code {
        b'b' => GwyValue::Bool(cursor.read_u8()? != 0),
        b'c' => GwyValue::Char(cursor.read_u8()?),
        b'i' => GwyValue::Int(cursor.read_i32::<LittleEndian>()?),
        b'q' => GwyValue::Long(cursor.read_i64::<LittleEndian>()?),
        b'd' => GwyValue::Double(cursor.read_f64::<LittleEndian>()?),
        b's' => GwyValue::Str(read_nul_string(cursor)?),
        b'o' => GwyValue::Object(read_object(cursor)?),
        b'C' => {
            let n = read_array_len(cursor, 1)?;
            let mut buf = vec![0u8; n];
            cursor.read_exact(&mut buf)?;
            GwyValue::CharArray(buf)
        }
        b'I' => {
            let n = read_array_len(cursor, 4)?;
            let mut items = Vec::with_capacity(n);
            for _ in 0..n {
                items.push(cursor.read_i32::<LittleEndian>()?);
            }
            GwyValue::IntArray(items)
        }
        b'Q' => {
            let n = read_array_len(cursor, 8)?;
            let mut items = Vec::with_capacity(n);
            for _ in 0..n {
                items.push(cursor.read_i64::<LittleEndian>()?);
            }
            GwyValue::LongArray(items)
        }
        b'D' => {
            let n = read_array_len(cursor, 8)?;
            let mut items = Vec::with_capacity(n);
            for _ in 0..n {
                items.push(cursor.read_f64::<LittleEndian>()?);
            }
            GwyValue::DoubleArray(items)
        }
        b'S' => {
            let n = read_array_len(cursor, 1)?;
            let mut items = Vec::with_capacity(n);
            for _ in 0..n {
                items.push(read_nul_string(cursor)?);
            }
            GwyValue::StrArray(items)
        }
        b'O' => {
            let n = read_array_len(cursor, 1)?;
            let mut items = Vec::with_capacity(n);
            for _ in 0..n {
                items.push(read_object(cursor)?);
            }
            GwyValue::ObjectArray(items)
        }
        other => {
            return Err(ReaderError::UnsupportedDataType(format!(
                "container component type 0x{:02x}",
                other
            )))
        }
    };
    Ok(value)
}

fn read_array_len(cursor: &mut Cursor<&[u8]>, item_size: u64) -> Result<usize> {
    let n = cursor.read_u32::<LittleEndian>()? as u64;
    let remaining = cursor.get_ref().len() as u64 - cursor.position();
    if n * item_size > remaining {
        return Err(ReaderError::InvalidFormat(format!(
            "array of {} items overruns the file",
            n
        )));
    }
    Ok(n as usize)
}

fn read_nul_string(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let b = cursor.read_u8()?;
        if b == 0 {
            break;
        }
        bytes.push(b);
    }
    String::from_utf8(bytes)
        .map_err(|e| ReaderError::MetadataParse(format!("bad container string: {}", e)))
}

fn parse_field(fields: &BTreeMap<String, String>, key: &str) -> Result<usize> {
    fields
        .get(key)
        .ok_or_else(|| ReaderError::MetadataParse(format!("missing mandatory '{}' field", key)))?
        .parse()
        .map_err(|_| ReaderError::MetadataParse(format!("bad '{}' value", key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nul(s: &str) -> Vec<u8> {
        let mut v = s.as_bytes().to_vec();
        v.push(0);
        v
    }

    fn component(name: &str, type_code: u8, payload: &[u8]) -> Vec<u8> {
        let mut v = nul(name);
        v.push(type_code);
        v.extend_from_slice(payload);
        v
    }

    fn object(name: &str, components: &[u8]) -> Vec<u8> {
        let mut v = nul(name);
        v.extend_from_slice(&(components.len() as u32).to_le_bytes());
        v.extend_from_slice(components);
        v
    }

    #[test]
    fn object_components_round_trip() {
        let mut body = Vec::new();
        body.extend(component("xres", b'i', &2i32.to_le_bytes()));
        body.extend(component("xreal", b'd', &1.5f64.to_le_bytes()));
        body.extend(component("name", b's', &nul("height")));
        let serialized = object("GwyDataField", &body);

        let mut cursor = Cursor::new(serialized.as_slice());
        let obj = read_object(&mut cursor).unwrap();
        assert_eq!(obj.name, "GwyDataField");
        assert_eq!(obj.get_i64("xres"), Some(2));
        assert_eq!(obj.get_f64("xreal"), Some(1.5));
        assert_eq!(obj.components["name"].as_str(), Some("height"));
    }

    #[test]
    fn double_array_len_is_validated() {
        let mut body = Vec::new();
        body.push(0); // empty component name
        body.push(b'D');
        body.extend_from_slice(&1000u32.to_le_bytes());
        let serialized = object("GwyContainer", &body);
        let mut cursor = Cursor::new(serialized.as_slice());
        assert!(read_object(&mut cursor).is_err());
    }
}
