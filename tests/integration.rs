//! Integration tests. Set SCIFI_TEST_FILE to run against a real data file.
//! Example: SCIFI_TEST_FILE=/data/scan.gwy cargo test

use scifi_readers::{ingest, Result};

fn test_path() -> Option<std::path::PathBuf> {
    std::env::var("SCIFI_TEST_FILE").ok().map(|s| s.into())
}

#[test]
fn test_ingest_produces_datasets() -> Result<()> {
    let path = match test_path() {
        Some(p) if p.exists() => p,
        _ => return Ok(()),
    };

    let datasets = ingest(&path)?;
    assert!(!datasets.is_empty(), "no datasets extracted");
    for ds in &datasets {
        assert!(!ds.title.is_empty(), "dataset has an empty title");
        assert!(!ds.source.is_empty(), "dataset does not name its reader");
        assert!(ds.data.len() > 0, "dataset '{}' holds no data", ds.title);
    }

    Ok(())
}

#[test]
fn test_dimensions_match_the_data_shape() -> Result<()> {
    let path = match test_path() {
        Some(p) if p.exists() => p,
        _ => return Ok(()),
    };

    for ds in ingest(&path)? {
        let shape = ds.shape().to_vec();
        for (axis, dim) in ds.dims.iter().enumerate() {
            assert!(axis < shape.len(), "axis {} outside the data rank", axis);
            assert_eq!(
                dim.values.len(),
                shape[axis],
                "axis {} of '{}' disagrees with the data shape",
                axis,
                ds.title
            );
        }
    }

    Ok(())
}
