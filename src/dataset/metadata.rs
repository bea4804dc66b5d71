use std::collections::BTreeMap;

/// Ordered metadata map; deterministic iteration keeps JSON output stable.
pub type MetaMap = BTreeMap<String, MetaValue>;

/// JSON-like metadata value attached to datasets
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<MetaValue>),
    Map(MetaMap),
}

impl MetaValue {
    pub fn as_map(&self) -> Option<&MetaMap> {
        if let MetaValue::Map(map) = self {
            Some(map)
        } else {
            None
        }
    }

    pub fn as_list(&self) -> Option<&[MetaValue]> {
        if let MetaValue::List(items) = self {
            Some(items)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        if let MetaValue::String(s) = self {
            Some(s)
        } else {
            None
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        if let MetaValue::Bool(b) = self {
            Some(*b)
        } else {
            None
        }
    }

    /// Integer view accepting both signed and unsigned storage.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetaValue::Int(i) => Some(*i),
            MetaValue::UInt(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            MetaValue::UInt(u) => Some(*u),
            MetaValue::Int(i) => u64::try_from(*i).ok(),
            _ => None,
        }
    }

    /// Numeric view; widens any stored number to f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetaValue::Float(f) => Some(*f),
            MetaValue::Int(i) => Some(*i as f64),
            MetaValue::UInt(u) => Some(*u as f64),
            _ => None,
        }
    }

    /// Parse a text field the way header readers coerce values: integer
    /// first, then float, otherwise the trimmed string as-is.
    pub fn parse_scalar(text: &str) -> MetaValue {
        let trimmed = text.trim();
        if let Ok(i) = trimmed.parse::<i64>() {
            return MetaValue::Int(i);
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            return MetaValue::Float(f);
        }
        MetaValue::String(trimmed.to_string())
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            MetaValue::Bool(b) => serde_json::Value::Bool(*b),
            MetaValue::Int(i) => serde_json::Value::from(*i),
            MetaValue::UInt(u) => serde_json::Value::from(*u),
            MetaValue::Float(f) => {
                serde_json::Number::from_f64(*f).map_or(serde_json::Value::Null, serde_json::Value::Number)
            }
            MetaValue::String(s) => serde_json::Value::String(s.clone()),
            MetaValue::Bytes(b) => serde_json::Value::String(format!("<{} bytes>", b.len())),
            MetaValue::List(items) => {
                serde_json::Value::Array(items.iter().map(MetaValue::to_json).collect())
            }
            MetaValue::Map(map) => map_to_json(map),
        }
    }

    pub fn from_json(value: &serde_json::Value) -> MetaValue {
        match value {
            serde_json::Value::Null => MetaValue::String(String::new()),
            serde_json::Value::Bool(b) => MetaValue::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    MetaValue::Int(i)
                } else if let Some(u) = n.as_u64() {
                    MetaValue::UInt(u)
                } else {
                    MetaValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => MetaValue::String(s.clone()),
            serde_json::Value::Array(items) => {
                MetaValue::List(items.iter().map(MetaValue::from_json).collect())
            }
            serde_json::Value::Object(obj) => {
                let map = obj
                    .iter()
                    .map(|(k, v)| (k.clone(), MetaValue::from_json(v)))
                    .collect();
                MetaValue::Map(map)
            }
        }
    }
}

pub fn map_to_json(map: &MetaMap) -> serde_json::Value {
    let obj: serde_json::Map<String, serde_json::Value> = map
        .iter()
        .map(|(k, v)| (k.clone(), v.to_json()))
        .collect();
    serde_json::Value::Object(obj)
}

impl From<bool> for MetaValue {
    fn from(v: bool) -> Self {
        MetaValue::Bool(v)
    }
}

impl From<i32> for MetaValue {
    fn from(v: i32) -> Self {
        MetaValue::Int(v as i64)
    }
}

impl From<i64> for MetaValue {
    fn from(v: i64) -> Self {
        MetaValue::Int(v)
    }
}

impl From<u32> for MetaValue {
    fn from(v: u32) -> Self {
        MetaValue::UInt(v as u64)
    }
}

impl From<u64> for MetaValue {
    fn from(v: u64) -> Self {
        MetaValue::UInt(v)
    }
}

impl From<usize> for MetaValue {
    fn from(v: usize) -> Self {
        MetaValue::UInt(v as u64)
    }
}

impl From<f32> for MetaValue {
    fn from(v: f32) -> Self {
        MetaValue::Float(v as f64)
    }
}

impl From<f64> for MetaValue {
    fn from(v: f64) -> Self {
        MetaValue::Float(v)
    }
}

impl From<&str> for MetaValue {
    fn from(v: &str) -> Self {
        MetaValue::String(v.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(v: String) -> Self {
        MetaValue::String(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_scalar_coercion() {
        assert_eq!(MetaValue::parse_scalar("42"), MetaValue::Int(42));
        assert_eq!(MetaValue::parse_scalar(" 2E-4 "), MetaValue::Float(2e-4));
        assert_eq!(
            MetaValue::parse_scalar("LI Demod 1 X"),
            MetaValue::String("LI Demod 1 X".to_string())
        );
        assert_eq!(MetaValue::parse_scalar(""), MetaValue::String(String::new()));
    }

    #[test]
    fn json_round_trip_keeps_structure() {
        let mut inner = MetaMap::new();
        inner.insert("scale".into(), MetaValue::Float(0.25));
        let mut map = MetaMap::new();
        map.insert("name".into(), MetaValue::from("HAADF"));
        map.insert("calib".into(), MetaValue::Map(inner));
        map.insert(
            "shape".into(),
            MetaValue::List(vec![MetaValue::Int(512), MetaValue::Int(512)]),
        );

        let json = map_to_json(&map);
        let back = MetaValue::from_json(&json);
        assert_eq!(back, MetaValue::Map(map));
    }

    #[test]
    fn bytes_render_as_placeholder() {
        let v = MetaValue::Bytes(vec![0u8; 16]);
        assert_eq!(v.to_json(), serde_json::Value::String("<16 bytes>".into()));
    }
}
