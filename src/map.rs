//! Node-spaced displacement fields.

use nalgebra_sparse::CsrMatrix;
use thiserror::Error;

use crate::basis::{interpolation_matrix, tile_diagonal};
use crate::geometry::IndexSpace;
use crate::image::Image;
use crate::lac::spmv;
use crate::laplacian::node_laplacian;
use crate::workspace::WorkSpace;

/// Error while constructing a displacement map.
#[derive(Error, Debug)]
pub enum MapError {
    #[error("node spacing {0:?} must be positive on every active axis")]
    NonPositiveSpacing([f64; 3]),
}

/// A displacement field sampled on a coarse grid of control nodes spanning
/// an image's domain, together with its interpolation basis and Laplacian
/// regulariser.
///
/// Coefficients are laid out as D spatial blocks (x, then y, then z)
/// followed by one intensity-correction block, each of node-grid size; the
/// basis matrix is tiled conformally, so the same tent weights interpolate
/// displacements and intensity corrections alike.
#[derive(Debug, Clone)]
pub struct DisplacementMap {
    image_shape: [usize; 3],
    ndim: usize,
    spacing: [f64; 3],
    node_shape: [usize; 3],

    coeffs: Vec<f64>,
    basis: CsrMatrix<f64>,
    laplacian: CsrMatrix<f64>,
}

impl DisplacementMap {
    /// A zero displacement map over `image` with the given node spacing.
    pub fn new(image: &Image, spacing: [f64; 3]) -> Result<Self, MapError> {
        Self::build(image.shape(), spacing)
    }

    fn build(image_shape: [usize; 3], spacing: [f64; 3]) -> Result<Self, MapError> {
        let ndim = if image_shape[2] == 1 { 2 } else { 3 };

        for d in 0..ndim {
            if !(spacing[d] > 0.0) {
                return Err(MapError::NonPositiveSpacing(spacing));
            }
        }

        let mut node_shape = [1; 3];
        for d in 0..3 {
            if image_shape[d] > 1 {
                node_shape[d] = (image_shape[d] as f64 / spacing[d]).ceil() as usize + 1;
            }
        }

        let pixel_space = IndexSpace::new(image_shape);
        let npix = pixel_space.index_count();
        let block = interpolation_matrix(node_shape, spacing, npix, move |p| {
            let c = pixel_space.cartesian_from_linear(p);
            [c[0] as f64, c[1] as f64, c[2] as f64]
        });

        let basis = tile_diagonal(&block, ndim + 1);
        let laplacian = tile_diagonal(&node_laplacian(node_shape), ndim + 1);

        let nodes: usize = node_shape.iter().product();
        log::debug!(
            "displacement map: {}x{}x{} nodes at spacing {:?} over image {:?}",
            node_shape[0],
            node_shape[1],
            node_shape[2],
            spacing,
            image_shape
        );

        Ok(Self {
            image_shape,
            ndim,
            spacing,
            node_shape,
            coeffs: vec![0.0; (ndim + 1) * nodes],
            basis,
            laplacian,
        })
    }

    pub fn image_shape(&self) -> [usize; 3] {
        self.image_shape
    }

    pub fn ndim(&self) -> usize {
        self.ndim
    }

    pub fn spacing(&self) -> [f64; 3] {
        self.spacing
    }

    pub fn node_shape(&self) -> [usize; 3] {
        self.node_shape
    }

    /// Nodes per coefficient block.
    pub fn node_count(&self) -> usize {
        self.node_shape.iter().product()
    }

    /// Total coefficient count over all D+1 blocks.
    pub fn coefficient_count(&self) -> usize {
        self.coeffs.len()
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coeffs
    }

    /// The tiled interpolation basis, `(D+1)·Npix` by `(D+1)·Mnodes`.
    pub fn basis(&self) -> &CsrMatrix<f64> {
        &self.basis
    }

    /// The block-diagonal node-grid Laplacian regulariser.
    pub fn laplacian(&self) -> &CsrMatrix<f64> {
        &self.laplacian
    }

    /// Evaluates one channel of the field at a pixel through the basis
    /// (spatial displacement for `block < D`, intensity correction at
    /// `block = D`).
    pub fn evaluate(&self, block: usize, pixel: usize) -> f64 {
        let npix: usize = self.image_shape.iter().product();
        let row = self.basis.row(block * npix + pixel);
        row.col_indices()
            .iter()
            .zip(row.values())
            .map(|(&col, &w)| w * self.coeffs[col])
            .sum()
    }

    /// Adds a solved increment to the coefficient vector.
    pub fn update(&mut self, delta: &[f64]) {
        assert_eq!(delta.len(), self.coeffs.len(), "increment size mismatch");
        for (c, d) in self.coeffs.iter_mut().zip(delta) {
            *c += d;
        }
    }

    /// Warps `source` through this map.
    pub fn warp(&self, source: &Image, ws: &mut WorkSpace) -> Image {
        Image::warp(source, self, ws)
    }

    /// Re-expresses the current field on a finer node grid.
    ///
    /// The new coefficients are the tent evaluation of the current field at
    /// the new node positions, block by block, so the physical displacement
    /// (and intensity correction) carried into the next generation is
    /// unchanged up to the basis' own resolution.
    pub fn interpolate(&self, new_spacing: [f64; 3]) -> Result<Self, MapError> {
        let mut finer = Self::build(self.image_shape, new_spacing)?;

        let node_space = IndexSpace::new(finer.node_shape);
        let eval = interpolation_matrix(
            self.node_shape,
            self.spacing,
            finer.node_count(),
            move |n| {
                let c = node_space.cartesian_from_linear(n);
                [
                    c[0] as f64 * new_spacing[0],
                    c[1] as f64 * new_spacing[1],
                    c[2] as f64 * new_spacing[2],
                ]
            },
        );

        let old_nodes = self.node_count();
        let new_nodes = finer.node_count();
        for b in 0..=self.ndim {
            spmv(
                &eval,
                &self.coeffs[b * old_nodes..(b + 1) * old_nodes],
                &mut finer.coeffs[b * new_nodes..(b + 1) * new_nodes],
            );
        }

        Ok(finer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::Partitioning;

    fn image(shape: [usize; 3]) -> Image {
        Image::create(shape, Partitioning::default()).unwrap()
    }

    #[test]
    fn node_shape_from_spacing() {
        let map = DisplacementMap::new(&image([32, 32, 1]), [8.0, 8.0, 1.0]).unwrap();
        assert_eq!(map.node_shape(), [5, 5, 1]);
        assert_eq!(map.ndim(), 2);
        // Two spatial blocks plus intensity.
        assert_eq!(map.coefficient_count(), 3 * 25);
    }

    #[test]
    fn spacing_equal_to_extent_gives_two_nodes() {
        let map = DisplacementMap::new(&image([32, 32, 1]), [32.0, 32.0, 1.0]).unwrap();
        assert_eq!(map.node_shape(), [2, 2, 1]);
    }

    #[test]
    fn non_positive_spacing_is_rejected() {
        assert!(DisplacementMap::new(&image([8, 8, 1]), [0.0, 4.0, 1.0]).is_err());
        assert!(DisplacementMap::new(&image([8, 8, 8]), [4.0, 4.0, -2.0]).is_err());
    }

    #[test]
    fn update_accumulates() {
        let mut map = DisplacementMap::new(&image([8, 8, 1]), [4.0, 4.0, 1.0]).unwrap();
        let ones = vec![1.0; map.coefficient_count()];
        map.update(&ones);
        map.update(&ones);
        assert!(map.coefficients().iter().all(|&c| c == 2.0));
    }

    #[test]
    fn interpolation_preserves_linear_fields() {
        let img = image([16, 16, 1]);
        let mut coarse = DisplacementMap::new(&img, [8.0, 8.0, 1.0]).unwrap();

        // Fill the x-displacement block with a field linear in node
        // position; the tent basis represents it exactly, so refinement
        // must reproduce it at the finer nodes.
        let node_space = IndexSpace::new(coarse.node_shape());
        let nodes = coarse.node_count();
        let mut delta = vec![0.0; coarse.coefficient_count()];
        for n in 0..nodes {
            let c = node_space.cartesian_from_linear(n);
            delta[n] = 0.5 * (c[0] as f64 * 8.0) + 1.0;
        }
        coarse.update(&delta);

        let fine = coarse.interpolate([4.0, 4.0, 1.0]).unwrap();
        let fine_space = IndexSpace::new(fine.node_shape());
        for n in 0..fine.node_count() {
            let c = fine_space.cartesian_from_linear(n);
            let expected = 0.5 * (c[0] as f64 * 4.0) + 1.0;
            let got = fine.coefficients()[n];
            assert!((got - expected).abs() < 1e-12, "node {c:?}: {got} vs {expected}");
        }
    }
}
