use serde::Serialize;

/// Physical role of a dataset axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionKind {
    Spatial,
    Reciprocal,
    Spectral,
    Temporal,
    Frame,
    Unknown,
}

impl DimensionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DimensionKind::Spatial => "spatial",
            DimensionKind::Reciprocal => "reciprocal",
            DimensionKind::Spectral => "spectral",
            DimensionKind::Temporal => "temporal",
            DimensionKind::Frame => "frame",
            DimensionKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for DimensionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Calibrated axis of a dataset: one value per index along the axis
#[derive(Debug, Clone, PartialEq)]
pub struct Dimension {
    pub name: String,
    pub quantity: String,
    pub units: String,
    pub kind: DimensionKind,
    pub values: Vec<f64>,
}

impl Dimension {
    pub fn new(
        values: Vec<f64>,
        name: impl Into<String>,
        quantity: impl Into<String>,
        units: impl Into<String>,
        kind: DimensionKind,
    ) -> Self {
        Self {
            name: name.into(),
            quantity: quantity.into(),
            units: units.into(),
            kind,
            values,
        }
    }

    /// Plain index axis (0, 1, 2, ...) used before calibration is known.
    pub fn indices(len: usize, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            quantity: "generic".to_string(),
            units: "generic".to_string(),
            kind: DimensionKind::Unknown,
            values: (0..len).map(|i| i as f64).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// `n` evenly spaced values from `start` to `stop`, endpoint included.
pub fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}
