//! Cross-format tests that run against synthetic files.

use scifi_readers::{ingest, DataKind, ReaderError, ReaderKind};

fn write_file(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

fn gsf_bytes() -> Vec<u8> {
    let mut out = b"Gwyddion Simple Field 1.0\n".to_vec();
    out.extend_from_slice(b"XRes = 3\nYRes = 2\nXReal = 6e-08\nYReal = 4e-08\n");
    out.extend_from_slice(b"Title = Topography\nZUnits = m\n");
    let pad = 4 - out.len() % 4;
    out.extend(std::iter::repeat(0u8).take(pad));
    for v in [0.0f32, 1.0, 2.0, 3.0, 4.0, 5.0] {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

#[test]
fn ingest_nonexistent_fails() {
    match ingest("nonexistent_file_xyz.gsf") {
        Err(ReaderError::FileNotFound { .. }) => {}
        other => panic!("expected FileNotFound, got {:?}", other.map(|d| d.len())),
    }
}

#[test]
fn ingest_garbage_with_a_known_extension_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(&dir, "garbage.dm3", &[0u8; 200]);
    match ingest(&path) {
        Err(ReaderError::NoSuitableReader { .. }) => {}
        other => panic!("expected NoSuitableReader, got {:?}", other.map(|d| d.len())),
    }
}

#[test]
fn gwyddion_simple_field_ingests_as_an_image() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(&dir, "topo.gsf", &gsf_bytes());
    let datasets = ingest(&path).unwrap();

    assert_eq!(datasets.len(), 1);
    let ds = &datasets[0];
    assert_eq!(ds.title, "Topography");
    assert_eq!(ds.data_kind, DataKind::Image);
    assert_eq!(ds.shape(), &[2, 3]);
    assert_eq!(ds.units, "m");
    assert_eq!(ds.data.get_f64(&[1, 2]), Some(5.0));
    assert_eq!(ds.dims.len(), 2);
    assert_eq!(ds.dims[1].values.len(), 3);
}

#[test]
fn forced_reader_bypasses_probing() {
    let text = "Experiment\tbias spectroscopy\t\n\n[DATA]\nBias calc (V)\tCurrent (A)\n0.0\t1e-12\n0.1\t2e-12\n";
    let dir = tempfile::tempdir().unwrap();
    // Wrong extension on purpose: probing would never pick this reader.
    let path = write_file(&dir, "spectrum.xyz", text.as_bytes());

    let kind = ReaderKind::from_name("nanonis-dat").unwrap();
    let datasets = kind.read(&path).unwrap();
    assert_eq!(datasets.len(), 1);
    assert_eq!(datasets[0].title, "Current");
    assert_eq!(datasets[0].data_kind, DataKind::Spectrum);
    assert_eq!(datasets[0].dims[0].values, vec![0.0, 0.1]);
}

#[test]
fn csv_grid_ingests_as_an_image() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(&dir, "frame.csv", b"1, 2\n3, 4\n");
    let datasets = ingest(&path).unwrap();
    assert_eq!(datasets.len(), 1);
    assert_eq!(datasets[0].source, "ImageReader");
    assert_eq!(datasets[0].shape(), &[2, 2]);
}
