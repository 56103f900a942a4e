//! File loading and result writing collaborators.
//!
//! The registration core only depends on the call surfaces here: a loader
//! probes a file's shape and fills per-rank chunks with `[0, 1]`-normalised
//! samples, and a writer persists registered images and displacement maps.
//! Format support is entirely this module's concern.

mod loader;
mod writer;

pub use loader::{find_loader, ImageLoader, LoadError, RasterLoader, RawVolumeLoader};
pub use writer::VtkWriter;
