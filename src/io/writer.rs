//! VTK output for registered images and displacement maps.

use std::io;
use std::path::PathBuf;

use vtkio::{
    model::{
        Attribute, Attributes, ByteOrder, DataArrayBase, DataSet, ElementType, Extent,
        ImageDataPiece, Piece,
    },
    IOBuffer, Vtk,
};

use crate::image::Image;
use crate::map::DisplacementMap;

/// Writes registration results as VTK image-data files.
///
/// Images become unit-spacing grids carrying their intensities as point
/// scalars; maps become node grids at the map's spacing carrying the
/// displacement vectors and the intensity-correction channel.
pub struct VtkWriter {
    directory: PathBuf,
}

impl VtkWriter {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// Writes the sample intensities of `image` under `name` (extension
    /// defaults to `.vti`).
    pub fn write_image(&self, image: &Image, name: &str) -> io::Result<()> {
        let shape = image.shape();
        let extent = Extent::Dims([shape[0] as u32, shape[1] as u32, shape[2] as u32]);

        let point = vec![Attribute::DataArray(DataArrayBase {
            name: "intensity".to_string(),
            elem: ElementType::Scalars {
                num_comp: 1,
                lookup_table: None,
            },
            data: IOBuffer::new(image.global().to_vec()),
        })];

        self.export(
            name,
            grid_model(name, extent, [1.0; 3], point),
        )
    }

    /// Writes the node-grid displacement vectors and intensity corrections
    /// of `map` under `name`.
    pub fn write_map(&self, map: &DisplacementMap, name: &str) -> io::Result<()> {
        let nodes = map.node_count();
        let node_shape = map.node_shape();
        let extent = Extent::Dims([
            node_shape[0] as u32,
            node_shape[1] as u32,
            node_shape[2] as u32,
        ]);
        let spacing = map.spacing().map(|s| s as f32);

        let coeffs = map.coefficients();
        let mut vectors = Vec::with_capacity(3 * nodes);
        for n in 0..nodes {
            for d in 0..3 {
                vectors.push(if d < map.ndim() {
                    coeffs[d * nodes + n]
                } else {
                    0.0
                });
            }
        }
        let corrections = coeffs[map.ndim() * nodes..].to_vec();

        let point = vec![
            Attribute::DataArray(DataArrayBase {
                name: "displacement".to_string(),
                elem: ElementType::Vectors,
                data: IOBuffer::new(vectors),
            }),
            Attribute::DataArray(DataArrayBase {
                name: "intensity_correction".to_string(),
                elem: ElementType::Scalars {
                    num_comp: 1,
                    lookup_table: None,
                },
                data: IOBuffer::new(corrections),
            }),
        ];

        self.export(name, grid_model(name, extent, spacing, point))
    }

    fn export(&self, name: &str, model: Vtk) -> io::Result<()> {
        let mut path = self.directory.join(name);
        if path.extension().is_none() {
            path.set_extension("vti");
        }

        model.export(&path).map_err(|err| match err {
            vtkio::Error::IO(io) => io,
            other => io::Error::other(other.to_string()),
        })
    }
}

fn grid_model(
    title: &str,
    extent: Extent,
    spacing: [f32; 3],
    point: Vec<Attribute>,
) -> Vtk {
    Vtk {
        version: (1, 0).into(),
        title: title.to_string(),
        byte_order: ByteOrder::LittleEndian,
        file_path: None,
        data: DataSet::ImageData {
            extent: extent.clone(),
            origin: [0.0; 3],
            spacing,
            meta: None,
            pieces: vec![Piece::Inline(Box::new(ImageDataPiece {
                extent,
                data: Attributes {
                    point,
                    cell: Vec::new(),
                },
            }))],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::Partitioning;

    #[test]
    fn writes_image_and_map_files() {
        let dir = std::env::temp_dir().join("elastir_writer_test");
        std::fs::create_dir_all(&dir).unwrap();
        let writer = VtkWriter::new(&dir);

        let samples: Vec<f64> = (0..16).map(|i| i as f64 / 16.0).collect();
        let image = Image::from_samples([4, 4, 1], &samples, Partitioning::default()).unwrap();
        let map = DisplacementMap::new(&image, [2.0, 2.0, 1.0]).unwrap();

        writer.write_image(&image, "registered").unwrap();
        writer.write_map(&map, "map").unwrap();

        assert!(dir.join("registered.vti").exists());
        assert!(dir.join("map.vti").exists());
    }

    #[test]
    fn map_vectors_pad_to_three_components() {
        let image = Image::create([4, 4, 1], Partitioning::default()).unwrap();
        let map = DisplacementMap::new(&image, [4.0, 4.0, 1.0]).unwrap();

        // 2-D map: displacement vectors still carry a zero z component.
        assert_eq!(map.ndim(), 2);
        let nodes = map.node_count();
        assert_eq!(map.coefficient_count(), 3 * nodes);
    }
}
