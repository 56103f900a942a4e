//! Intensity images on distributed grids.

use std::path::Path;
use std::sync::Arc;

use rayon::prelude::*;

use crate::geometry::IndexSpace;
use crate::io::{find_loader, LoadError};
use crate::map::DisplacementMap;
use crate::mesh::{GridMesh, LocalField, MeshError, Partitioning};
use crate::workspace::WorkSpace;

/// An intensity field over a [`GridMesh`].
///
/// Two buffers track the samples: the *global* buffer holds each sample
/// once, the *local* buffer holds per-rank owned cells plus the ghost halo
/// and is only valid immediately after
/// [`Image::update_local_from_global`]. Several images may share one mesh.
#[derive(Debug, Clone)]
pub struct Image {
    mesh: Arc<GridMesh>,
    global: Vec<f64>,
    local: LocalField,
}

impl Image {
    /// A zeroed image over a fresh mesh.
    pub fn create(shape: [usize; 3], parts: Partitioning) -> Result<Self, MeshError> {
        Ok(Self::from_mesh(Arc::new(GridMesh::create(shape, parts)?)))
    }

    /// A zeroed image sharing an existing mesh.
    pub fn from_mesh(mesh: Arc<GridMesh>) -> Self {
        let global = mesh.create_global();
        let local = mesh.create_local();
        Self {
            mesh,
            global,
            local,
        }
    }

    /// An image filled from a flat x-fastest sample buffer.
    pub fn from_samples(
        shape: [usize; 3],
        samples: &[f64],
        parts: Partitioning,
    ) -> Result<Self, MeshError> {
        let mut image = Self::create(shape, parts)?;
        assert_eq!(samples.len(), image.size(), "sample buffer mismatch");
        image.global.copy_from_slice(samples);
        image.update_local_from_global();
        Ok(image)
    }

    /// Loads an image file.
    ///
    /// With a `template` the file's shape must match the template exactly
    /// and the template's mesh is shared; otherwise a new mesh is created
    /// from the probed shape. Each rank's owned chunk is filled separately,
    /// then halos are synchronised.
    pub fn load_file(
        path: &Path,
        template: Option<&Image>,
        parts: Partitioning,
    ) -> Result<Self, LoadError> {
        let loader = find_loader(path)?;
        let shape = loader.shape();

        let mesh = match template {
            Some(existing) => {
                if existing.shape() != shape {
                    return Err(LoadError::ShapeMismatch {
                        expected: existing.shape(),
                        found: shape,
                    });
                }
                existing.mesh.clone()
            }
            None => Arc::new(GridMesh::create(shape, parts)?),
        };

        let mut image = Self::from_mesh(mesh);
        let space = image.mesh.space();

        for rank in 0..image.mesh.rank_count() {
            let owned = *image.mesh.owned_box(rank);
            let mut chunk = vec![0.0; owned.cell_count()];
            loader.copy_scaled_chunk(&mut chunk, owned.size, owned.origin);

            let chunk_space = IndexSpace::new(owned.size);
            for local in chunk_space.iter() {
                let global = [
                    owned.origin[0] + local[0],
                    owned.origin[1] + local[1],
                    owned.origin[2] + local[2],
                ];
                image.global[space.linear_from_cartesian(global)] =
                    chunk[chunk_space.linear_from_cartesian(local)];
            }
        }

        image.update_local_from_global();
        Ok(image)
    }

    /// A zeroed image sharing this image's mesh.
    pub fn duplicate(&self) -> Self {
        Self::from_mesh(self.mesh.clone())
    }

    /// A deep copy of this image.
    pub fn copy(&self) -> Self {
        self.clone()
    }

    pub fn mesh(&self) -> &Arc<GridMesh> {
        &self.mesh
    }

    pub fn shape(&self) -> [usize; 3] {
        self.mesh.shape()
    }

    pub fn ndim(&self) -> usize {
        self.mesh.ndim()
    }

    /// Total sample count.
    pub fn size(&self) -> usize {
        self.mesh.cell_count()
    }

    pub fn global(&self) -> &[f64] {
        &self.global
    }

    pub fn global_mut(&mut self) -> &mut [f64] {
        &mut self.global
    }

    pub fn local(&self) -> &LocalField {
        &self.local
    }

    /// Refreshes owned cells and halos of the local buffer.
    pub fn update_local_from_global(&mut self) {
        let Self {
            mesh,
            global,
            local,
        } = self;
        mesh.global_to_local(global, local);
    }

    /// Rescales so the mean intensity is one; returns the scale factor.
    pub fn normalize(&mut self) -> f64 {
        let sum: f64 = self.global.iter().sum();
        if sum <= 0.0 {
            log::warn!("normalize on image with non-positive sum {sum}, leaving unscaled");
            return 1.0;
        }

        let scale = self.size() as f64 / sum;
        for v in &mut self.global {
            *v *= scale;
        }
        scale
    }

    /// Central-difference gradient along `dim`, refreshing the halo first.
    pub fn gradient(&mut self, dim: usize, grad: &mut [f64]) {
        self.update_local_from_global();
        crate::fd::gradient_to_global(&self.mesh, &self.local, dim, grad);
    }

    /// Warps `source` through `map`: the result's value at each grid node
    /// is the source sampled at the displaced position, with out-of-domain
    /// positions clamped to the nearest edge.
    ///
    /// The displacement at each pixel is evaluated through the map's basis
    /// matrix into the workspace's per-dimension temporaries, then the
    /// source is sampled with the clamped tent (trilinear) kernel.
    pub fn warp(source: &Image, map: &DisplacementMap, ws: &mut WorkSpace) -> Image {
        let mesh = source.mesh.clone();
        let shape = mesh.shape();
        let space = mesh.space();
        let npix = mesh.cell_count();
        let ndim = mesh.ndim();

        assert_eq!(map.image_shape(), shape, "map does not cover this image");

        // Displacement fields, one spatial dimension per temporary.
        let basis = map.basis();
        let coeffs = map.coefficients();
        for d in 0..ndim {
            let grad = ws.grad_mut(d);
            grad.par_iter_mut().enumerate().for_each(|(p, u)| {
                let row = basis.row(d * npix + p);
                let mut acc = 0.0;
                for (&col, &w) in row.col_indices().iter().zip(row.values()) {
                    acc += w * coeffs[col];
                }
                *u = acc;
            });
        }

        let mut warped = Image::from_mesh(mesh);
        let displacement = |p: usize, d: usize| if d < ndim { ws.grad(d)[p] } else { 0.0 };

        warped
            .global
            .par_iter_mut()
            .enumerate()
            .for_each(|(p, out)| {
                let cell = space.cartesian_from_linear(p);
                let pos = [
                    cell[0] as f64 + displacement(p, 0),
                    cell[1] as f64 + displacement(p, 1),
                    cell[2] as f64 + displacement(p, 2),
                ];
                *out = sample_clamped(&source.global, shape, pos);
            });

        warped.update_local_from_global();
        warped
    }
}

/// Samples `data` at a continuous position with the separable tent kernel,
/// clamping to the domain edge. Collapsed axes are ignored.
pub fn sample_clamped(data: &[f64], shape: [usize; 3], pos: [f64; 3]) -> f64 {
    let space = IndexSpace::new(shape);

    let mut corners: [[(usize, f64); 2]; 3] = [[(0, 1.0), (0, 0.0)]; 3];
    let mut counts = [1usize; 3];
    for d in 0..3 {
        if shape[d] == 1 {
            continue;
        }
        let t = pos[d].clamp(0.0, (shape[d] - 1) as f64);
        let lo = (t.floor() as usize).min(shape[d] - 2);
        let frac = t - lo as f64;
        corners[d] = [(lo, 1.0 - frac), (lo + 1, frac)];
        counts[d] = 2;
    }

    let mut acc = 0.0;
    for cz in 0..counts[2] {
        for cy in 0..counts[1] {
            for cx in 0..counts[0] {
                let (iz, wz) = corners[2][cz];
                let (iy, wy) = corners[1][cy];
                let (ix, wx) = corners[0][cx];
                let w = wx * wy * wz;
                if w != 0.0 {
                    acc += w * data[space.linear_from_cartesian([ix, iy, iz])];
                }
            }
        }
    }
    acc
}
