//! Automatic reader selection: probe every registered reader against a
//! file and hand off to the one that claims it.

use std::path::Path;

use tracing::{debug, warn};

use crate::dataset::Dataset;
use crate::error::{ReaderError, Result};
use crate::reader::FormatReader;
use crate::readers::{
    AscReader, BrukerAfmReader, DmReader, GwyddionReader, IgorIbwReader, ImageReader,
    Nanonis3dsReader, NanonisDatReader, NanonisSxmReader, NeutronReflectivityReader, NionReader,
    RamanSpeReader,
};

/// Every built-in reader. Generic readers come first so that when more
/// than one matches, the last (most format-specific) candidate wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderKind {
    Image,
    Dm,
    Nion,
    Igor,
    Bruker,
    Gwyddion,
    OmicronAsc,
    NanonisDat,
    Nanonis3ds,
    NanonisSxm,
    Spe,
    Neutron,
}

impl ReaderKind {
    pub const ALL: [ReaderKind; 12] = [
        ReaderKind::Image,
        ReaderKind::Dm,
        ReaderKind::Nion,
        ReaderKind::Igor,
        ReaderKind::Bruker,
        ReaderKind::Gwyddion,
        ReaderKind::OmicronAsc,
        ReaderKind::NanonisDat,
        ReaderKind::Nanonis3ds,
        ReaderKind::NanonisSxm,
        ReaderKind::Spe,
        ReaderKind::Neutron,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ReaderKind::Image => "image",
            ReaderKind::Dm => "dm",
            ReaderKind::Nion => "nion",
            ReaderKind::Igor => "igor",
            ReaderKind::Bruker => "bruker",
            ReaderKind::Gwyddion => "gwyddion",
            ReaderKind::OmicronAsc => "asc",
            ReaderKind::NanonisDat => "nanonis-dat",
            ReaderKind::Nanonis3ds => "nanonis-3ds",
            ReaderKind::NanonisSxm => "nanonis-sxm",
            ReaderKind::Spe => "spe",
            ReaderKind::Neutron => "neutron",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ReaderKind::Image => "TIFF frames and numeric text grids",
            ReaderKind::Dm => "Gatan DigitalMicrograph DM3/DM4",
            ReaderKind::Nion => "Nion Swift .ndata archives",
            ReaderKind::Igor => "Igor binary waves from Asylum Research AFMs",
            ReaderKind::Bruker => "Bruker Nanoscope images and force curves",
            ReaderKind::Gwyddion => "Gwyddion .gsf and .gwy fields",
            ReaderKind::OmicronAsc => "Omicron Scala ASCII exports",
            ReaderKind::NanonisDat => "Nanonis spectroscopy .dat tables",
            ReaderKind::Nanonis3ds => "Nanonis grid spectroscopy .3ds binaries",
            ReaderKind::NanonisSxm => "Nanonis scan .sxm binaries",
            ReaderKind::Spe => "Princeton Instruments Raman .spe captures",
            ReaderKind::Neutron => "SNS reduced neutron reflectivity curves",
        }
    }

    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            ReaderKind::Image => &["tif", "tiff", "csv", "txt"],
            ReaderKind::Dm => &["dm3", "dm4"],
            ReaderKind::Nion => &["ndata"],
            ReaderKind::Igor => &["ibw"],
            ReaderKind::Bruker => &["spm", "001"],
            ReaderKind::Gwyddion => &["gsf", "gwy"],
            ReaderKind::OmicronAsc => &["asc"],
            ReaderKind::NanonisDat => &["dat"],
            ReaderKind::Nanonis3ds => &["3ds"],
            ReaderKind::NanonisSxm => &["sxm"],
            ReaderKind::Spe => &["spe"],
            ReaderKind::Neutron => &["txt"],
        }
    }

    pub fn from_name(name: &str) -> Option<ReaderKind> {
        let wanted = name.to_ascii_lowercase();
        ReaderKind::ALL.iter().copied().find(|k| k.name() == wanted)
    }

    pub fn open(&self, path: &Path) -> Result<Box<dyn FormatReader>> {
        let reader: Box<dyn FormatReader> = match self {
            ReaderKind::Image => Box::new(ImageReader::open(path)?),
            ReaderKind::Dm => Box::new(DmReader::open(path)?),
            ReaderKind::Nion => Box::new(NionReader::open(path)?),
            ReaderKind::Igor => Box::new(IgorIbwReader::open(path)?),
            ReaderKind::Bruker => Box::new(BrukerAfmReader::open(path)?),
            ReaderKind::Gwyddion => Box::new(GwyddionReader::open(path)?),
            ReaderKind::OmicronAsc => Box::new(AscReader::open(path)?),
            ReaderKind::NanonisDat => Box::new(NanonisDatReader::open(path)?),
            ReaderKind::Nanonis3ds => Box::new(Nanonis3dsReader::open(path)?),
            ReaderKind::NanonisSxm => Box::new(NanonisSxmReader::open(path)?),
            ReaderKind::Spe => Box::new(RamanSpeReader::open(path)?),
            ReaderKind::Neutron => Box::new(NeutronReflectivityReader::open(path)?),
        };
        Ok(reader)
    }

    /// True when this reader opens the file and claims it.
    pub fn probe(&self, path: &Path) -> bool {
        match self.open(path) {
            Ok(reader) => reader.can_read(),
            Err(_) => false,
        }
    }

    pub fn read(&self, path: &Path) -> Result<Vec<Dataset>> {
        let mut reader = self.open(path)?;
        reader.read()
    }
}

/// Extract datasets from a file by probing every registered reader.
pub fn ingest<P: AsRef<Path>>(path: P) -> Result<Vec<Dataset>> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(ReaderError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    let candidates: Vec<ReaderKind> = ReaderKind::ALL
        .iter()
        .copied()
        .filter(|kind| kind.probe(path))
        .collect();
    let Some(kind) = candidates.last().copied() else {
        return Err(ReaderError::NoSuitableReader {
            path: path.to_path_buf(),
        });
    };
    if candidates.len() > 1 {
        warn!(
            file = %path.display(),
            chosen = kind.name(),
            others = ?candidates[..candidates.len() - 1]
                .iter()
                .map(|k| k.name())
                .collect::<Vec<_>>(),
            "multiple readers claim this file"
        );
    }
    debug!(file = %path.display(), reader = kind.name(), "ingesting");
    kind.read(path)
}
