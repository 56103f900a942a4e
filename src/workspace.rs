//! Per-resolution scratch storage for the registration inner loop.

use nalgebra_sparse::CsrMatrix;

use crate::fd;
use crate::image::Image;
use crate::map::DisplacementMap;
use crate::mesh::{GridMesh, LocalField};

/// A pool of buffers sized to one (image, displacement map) pair.
///
/// The pool owns D+1 global image-sized temporaries (D gradient fields plus
/// one intensity field), one local temporary with halo, the stacked block
/// vector concatenating all D+1 temporaries, one scatter plan per stacked
/// slot, the right-hand side and increment vectors of coefficient size, and
/// the slot for the current linearised system matrix. Image-sized members
/// live for a whole generation; [`WorkSpace::reallocate_ephemeral`] resizes
/// the coefficient-sized members when the map changes resolution.
#[derive(Debug)]
pub struct WorkSpace {
    ndim: usize,
    npix: usize,

    grads: Vec<Vec<f64>>,
    local: LocalField,
    stacked: Vec<f64>,
    plans: Vec<ScatterPlan>,

    rhs: Vec<f64>,
    delta: Vec<f64>,
    tmat: Option<CsrMatrix<f64>>,
}

impl WorkSpace {
    /// Allocates a pool matching `image` and `map`.
    pub fn allocate(image: &Image, map: &DisplacementMap) -> Self {
        let ndim = image.ndim();
        let npix = image.size();

        let grads = (0..=ndim).map(|_| vec![0.0; npix]).collect();
        let plans = (0..=ndim)
            .map(|k| ScatterPlan {
                offset: k * npix,
                len: npix,
            })
            .collect();

        Self {
            ndim,
            npix,
            grads,
            local: image.mesh().create_local(),
            stacked: vec![0.0; (ndim + 1) * npix],
            plans,
            rhs: vec![0.0; map.coefficient_count()],
            delta: vec![0.0; map.coefficient_count()],
            tmat: None,
        }
    }

    /// Resizes the coefficient-sized vectors after a map resolution change
    /// and drops the stale system matrix.
    pub fn reallocate_ephemeral(&mut self, map: &DisplacementMap) {
        self.rhs.clear();
        self.rhs.resize(map.coefficient_count(), 0.0);
        self.delta.clear();
        self.delta.resize(map.coefficient_count(), 0.0);
        self.tmat = None;
    }

    pub fn ndim(&self) -> usize {
        self.ndim
    }

    /// Global temporary `k` (gradients in `0..D`, intensity field at `D`).
    pub fn grad(&self, k: usize) -> &[f64] {
        &self.grads[k]
    }

    pub fn grad_mut(&mut self, k: usize) -> &mut [f64] {
        &mut self.grads[k]
    }

    /// Refreshes the local temporary (with halo) from global temporary `k`.
    pub fn sync_local(&mut self, mesh: &GridMesh, k: usize) {
        let Self { grads, local, .. } = self;
        mesh.global_to_local(&grads[k], local);
    }

    /// Central-difference gradient of the local temporary along `dim`,
    /// written into global temporary `dim`. The local temporary must hold a
    /// fresh halo.
    pub fn gradient_into(&mut self, mesh: &GridMesh, dim: usize) {
        let Self { grads, local, .. } = self;
        fd::gradient_to_global(mesh, local, dim, &mut grads[dim]);
    }

    pub fn stacked(&self) -> &[f64] {
        &self.stacked
    }

    /// Copies every temporary into its slot of the stacked vector.
    ///
    /// Split-phase: all plans are begun before any is completed, so a
    /// message-based transport could overlap the per-slot traffic.
    pub fn scatter_grads_to_stacked(&mut self) {
        let pending: Vec<PendingScatter> = self
            .plans
            .iter()
            .enumerate()
            .map(|(k, plan)| plan.begin(self.grads[k].len()))
            .collect();

        for (k, op) in pending.into_iter().enumerate() {
            op.end(&self.grads[k], &mut self.stacked);
        }
    }

    /// Broadcasts global temporary `k` into every slot of the stacked
    /// vector.
    pub fn duplicate_single_grad_to_stacked(&mut self, k: usize) {
        let pending: Vec<PendingScatter> = self
            .plans
            .iter()
            .map(|plan| plan.begin(self.grads[k].len()))
            .collect();

        for op in pending {
            op.end(&self.grads[k], &mut self.stacked);
        }
    }

    pub fn rhs(&self) -> &[f64] {
        &self.rhs
    }

    pub fn delta(&self) -> &[f64] {
        &self.delta
    }

    /// Right-hand side assembly `rhs = tmat_t * stacked`.
    pub fn assemble_rhs(&mut self, tmat_t: &CsrMatrix<f64>) {
        let Self { stacked, rhs, .. } = self;
        crate::lac::spmv(tmat_t, stacked, rhs);
    }

    /// Simultaneous access to the right-hand side and the increment, for
    /// handing both to a solver.
    pub fn rhs_and_delta_mut(&mut self) -> (&[f64], &mut [f64]) {
        let Self { rhs, delta, .. } = self;
        (rhs, delta)
    }

    /// The current linearised system matrix, if one has been built this
    /// iteration.
    pub fn tmat(&self) -> Option<&CsrMatrix<f64>> {
        self.tmat.as_ref()
    }

    pub fn set_tmat(&mut self, tmat: CsrMatrix<f64>) {
        self.tmat = Some(tmat);
    }
}

/// Destination slot of one temporary within the stacked vector.
#[derive(Debug, Clone, Copy)]
struct ScatterPlan {
    offset: usize,
    len: usize,
}

impl ScatterPlan {
    fn begin(&self, src_len: usize) -> PendingScatter {
        assert_eq!(src_len, self.len, "scatter source does not fit its slot");
        PendingScatter {
            offset: self.offset,
            len: self.len,
        }
    }
}

#[must_use = "a begun scatter must be ended before the stacked vector is read"]
struct PendingScatter {
    offset: usize,
    len: usize,
}

impl PendingScatter {
    fn end(self, src: &[f64], stacked: &mut [f64]) {
        stacked[self.offset..self.offset + self.len].copy_from_slice(src);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Image;
    use crate::map::DisplacementMap;
    use crate::mesh::Partitioning;

    fn pool() -> (Image, WorkSpace) {
        let image = Image::create([6, 4, 1], Partitioning::default()).unwrap();
        let map = DisplacementMap::new(&image, [2.0, 2.0, 1.0]).unwrap();
        let ws = WorkSpace::allocate(&image, &map);
        (image, ws)
    }

    #[test]
    fn stacked_slots_follow_block_order() {
        let (image, mut ws) = pool();
        let npix = image.size();

        for k in 0..=image.ndim() {
            let fill = (k + 1) as f64;
            ws.grad_mut(k).fill(fill);
        }
        ws.scatter_grads_to_stacked();

        for k in 0..=image.ndim() {
            for p in 0..npix {
                assert_eq!(ws.stacked()[k * npix + p], (k + 1) as f64);
            }
        }
    }

    #[test]
    fn duplication_broadcasts_one_temporary() {
        let (image, mut ws) = pool();
        let ndim = image.ndim();

        ws.grad_mut(ndim).fill(7.0);
        ws.duplicate_single_grad_to_stacked(ndim);

        assert!(ws.stacked().iter().all(|&v| v == 7.0));
    }

    #[test]
    fn ephemeral_reallocation_tracks_map_size() {
        let (image, mut ws) = pool();

        let finer = DisplacementMap::new(&image, [1.0, 1.0, 1.0]).unwrap();
        ws.reallocate_ephemeral(&finer);

        assert_eq!(ws.rhs().len(), finer.coefficient_count());
        assert_eq!(ws.delta().len(), finer.coefficient_count());
        assert!(ws.tmat().is_none());
    }
}
