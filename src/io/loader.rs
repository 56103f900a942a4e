//! Image file loaders.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::geometry::IndexSpace;

/// Error while probing or reading an image file.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("no loader registered for {0}")]
    UnsupportedFormat(PathBuf),
    #[error("bad volume sidecar {path}: {reason}")]
    Sidecar { path: PathBuf, reason: String },
    #[error("image shape {found:?} does not match template shape {expected:?}")]
    ShapeMismatch {
        expected: [usize; 3],
        found: [usize; 3],
    },
    #[error(transparent)]
    Mesh(#[from] crate::mesh::MeshError),
}

/// Decoded image data ready to be distributed over a mesh.
///
/// Samples are normalised to `[0, 1]`; `copy_scaled_chunk` fills one rank's
/// owned sub-box in x-fastest order.
pub trait ImageLoader {
    /// Grid shape of the file's samples, normalised to three axes.
    fn shape(&self) -> [usize; 3];

    /// Copies the sub-box at `offset` of extent `size` into `dst`
    /// (`dst.len() == size` product, x-fastest).
    fn copy_scaled_chunk(&self, dst: &mut [f64], size: [usize; 3], offset: [usize; 3]);
}

/// Picks a loader for `path` by extension and probes the file.
///
/// Common 2-D raster formats decode through the `image` crate; `.raw`
/// volumes pair a little-endian `f64` sample file with a TOML sidecar
/// carrying the shape.
pub fn find_loader(path: &Path) -> Result<Box<dyn ImageLoader>, LoadError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("png" | "jpg" | "jpeg" | "bmp" | "tif" | "tiff" | "pgm") => {
            Ok(Box::new(RasterLoader::open(path)?))
        }
        Some("raw") => Ok(Box::new(RawVolumeLoader::open(path)?)),
        _ => Err(LoadError::UnsupportedFormat(path.to_path_buf())),
    }
}

fn chunk_from_full(
    shape: [usize; 3],
    data: &[f64],
    dst: &mut [f64],
    size: [usize; 3],
    offset: [usize; 3],
) {
    let space = IndexSpace::new(shape);
    let chunk = IndexSpace::new(size);
    assert_eq!(dst.len(), chunk.index_count());

    for local in chunk.iter() {
        let global = [
            offset[0] + local[0],
            offset[1] + local[1],
            offset[2] + local[2],
        ];
        dst[chunk.linear_from_cartesian(local)] = data[space.linear_from_cartesian(global)];
    }
}

/// Greyscale raster images (2-D), decoded via the `image` crate and scaled
/// by the 8-bit format maximum.
pub struct RasterLoader {
    shape: [usize; 3],
    data: Vec<f64>,
}

impl RasterLoader {
    pub fn open(path: &Path) -> Result<Self, LoadError> {
        let decoded = image::open(path).map_err(|source| LoadError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
        let grey = decoded.into_luma8();
        let (w, h) = grey.dimensions();

        let mut data = vec![0.0; (w * h) as usize];
        for y in 0..h {
            for x in 0..w {
                data[(y * w + x) as usize] = grey.get_pixel(x, y).0[0] as f64 / 255.0;
            }
        }

        Ok(Self {
            shape: [w as usize, h as usize, 1],
            data,
        })
    }
}

impl ImageLoader for RasterLoader {
    fn shape(&self) -> [usize; 3] {
        self.shape
    }

    fn copy_scaled_chunk(&self, dst: &mut [f64], size: [usize; 3], offset: [usize; 3]) {
        chunk_from_full(self.shape, &self.data, dst, size, offset);
    }
}

#[derive(Deserialize)]
struct VolumeSidecar {
    shape: Vec<usize>,
}

/// Raw volumes: little-endian `f64` samples plus a TOML sidecar
/// (`foo.raw` + `foo.toml` containing `shape = [nx, ny, nz]`). Samples are
/// rescaled by the volume maximum.
pub struct RawVolumeLoader {
    shape: [usize; 3],
    data: Vec<f64>,
}

impl RawVolumeLoader {
    pub fn open(path: &Path) -> Result<Self, LoadError> {
        let sidecar_path = path.with_extension("toml");
        let text =
            std::fs::read_to_string(&sidecar_path).map_err(|source| LoadError::Io {
                path: sidecar_path.clone(),
                source,
            })?;
        let sidecar: VolumeSidecar =
            toml::from_str(&text).map_err(|err| LoadError::Sidecar {
                path: sidecar_path.clone(),
                reason: err.to_string(),
            })?;

        let shape = match sidecar.shape.as_slice() {
            &[nx, ny] => [nx, ny, 1],
            &[nx, ny, nz] => [nx, ny, nz],
            other => {
                return Err(LoadError::Sidecar {
                    path: sidecar_path,
                    reason: format!("shape must have 2 or 3 axes, got {}", other.len()),
                })
            }
        };

        let bytes = std::fs::read(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let expected = shape.iter().product::<usize>() * 8;
        if bytes.len() != expected {
            return Err(LoadError::Sidecar {
                path: sidecar_path,
                reason: format!(
                    "raw file holds {} bytes but shape {:?} needs {}",
                    bytes.len(),
                    shape,
                    expected
                ),
            });
        }

        let mut data: Vec<f64> = bytes
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes(c.try_into().expect("chunks of 8")))
            .collect();

        let max = data.iter().cloned().fold(0.0f64, f64::max);
        if max > 0.0 {
            for v in &mut data {
                *v /= max;
            }
        }

        Ok(Self { shape, data })
    }
}

impl ImageLoader for RawVolumeLoader {
    fn shape(&self) -> [usize; 3] {
        self.shape
    }

    fn copy_scaled_chunk(&self, dst: &mut [f64], size: [usize; 3], offset: [usize; 3]) {
        chunk_from_full(self.shape, &self.data, dst, size, offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_extension_is_rejected() {
        let err = match find_loader(Path::new("volume.xyz")) {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, LoadError::UnsupportedFormat(_)));
    }

    #[test]
    fn chunk_extraction() {
        let shape = [4, 3, 1];
        let data: Vec<f64> = (0..12).map(|i| i as f64).collect();

        let mut dst = vec![0.0; 4];
        chunk_from_full(shape, &data, &mut dst, [2, 2, 1], [1, 1, 0]);

        assert_eq!(dst, vec![5.0, 6.0, 9.0, 10.0]);
    }

    #[test]
    fn raw_volume_roundtrip() {
        let dir = std::env::temp_dir().join("elastir_loader_test");
        std::fs::create_dir_all(&dir).unwrap();
        let raw = dir.join("vol.raw");
        let sidecar = dir.join("vol.toml");

        let samples: Vec<f64> = (0..8).map(|i| i as f64).collect();
        let bytes: Vec<u8> = samples.iter().flat_map(|v| v.to_le_bytes()).collect();
        std::fs::write(&raw, bytes).unwrap();
        std::fs::write(&sidecar, "shape = [2, 2, 2]\n").unwrap();

        let loader = RawVolumeLoader::open(&raw).unwrap();
        assert_eq!(loader.shape(), [2, 2, 2]);

        let mut dst = vec![0.0; 8];
        loader.copy_scaled_chunk(&mut dst, [2, 2, 2], [0, 0, 0]);
        // Rescaled by the maximum sample.
        assert!((dst[7] - 1.0).abs() < 1e-12);
        assert!((dst[1] - 1.0 / 7.0).abs() < 1e-12);
    }
}
