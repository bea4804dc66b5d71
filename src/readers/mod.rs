//! One module per supported file format. Every reader parses one family
//! of instrument files into [`Dataset`](crate::dataset::Dataset) objects.

pub mod bruker;
pub mod dm;
pub mod gwyddion;
pub mod igor_ibw;
pub mod image;
pub mod nanonis_3ds;
pub mod nanonis_dat;
pub mod nanonis_sxm;
pub mod neutron_reflectivity;
pub mod nion;
pub mod omicron_asc;
pub mod spe;

pub use bruker::BrukerAfmReader;
pub use dm::DmReader;
pub use gwyddion::GwyddionReader;
pub use igor_ibw::IgorIbwReader;
pub use image::ImageReader;
pub use nanonis_3ds::Nanonis3dsReader;
pub use nanonis_dat::NanonisDatReader;
pub use nanonis_sxm::NanonisSxmReader;
pub use neutron_reflectivity::NeutronReflectivityReader;
pub use nion::NionReader;
pub use omicron_asc::AscReader;
pub use spe::RamanSpeReader;
