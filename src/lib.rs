//! scifi-readers: Pure Rust readers for scientific and microscopy file formats
//!
//! Each supported instrument format is parsed into one or more [`Dataset`]
//! objects carrying the raw data as an n-dimensional array together with
//! calibrated axes and the instrument metadata.
//!
//! # Example
//! ```no_run
//! fn main() -> scifi_readers::Result<()> {
//!     let datasets = scifi_readers::ingest("scan.sxm")?;
//!
//!     for ds in &datasets {
//!         println!("{}: {} {:?}", ds.title, ds.data_kind, ds.shape());
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod dataset;
pub mod error;
pub mod ingest;
pub mod reader;
pub mod readers;

pub use dataset::{
    DataBuffer, DataKind, Dataset, Dimension, DimensionKind, MetaMap, MetaValue,
};
pub use error::{ReaderError, Result};
pub use ingest::{ingest, ReaderKind};
pub use reader::FormatReader;
