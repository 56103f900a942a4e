//! Domain-decomposed sample grids.
//!
//! A [`GridMesh`] splits a 3-D grid of scalar samples into contiguous
//! sub-boxes, one per processing rank. Samples live in two kinds of buffer:
//! a *global* field holding each sample exactly once in natural
//! (x-fastest) order, and a per-rank *local* field holding the rank's owned
//! sub-box plus a one-cell ghost halo on every face. Halos are refreshed
//! explicitly through the two-phase [`GridMesh::global_to_local_begin`] /
//! [`HaloExchange::end`] synchronisation; at the true domain edge the halo
//! replicates the owned edge sample, so difference stencils remain valid
//! without special-casing boundaries.
//!
//! The decomposition is deterministic and executed in-process, rank by
//! rank: every collective keeps the same begin/end structure a message-based
//! transport would need, and per-rank program order is identical no matter
//! how many ranks the mesh is split into.

use crate::geometry::IndexSpace;
use thiserror::Error;

/// How a mesh should be split across processing ranks.
#[derive(Debug, Clone, Copy)]
pub struct Partitioning {
    /// Number of ranks the grid is decomposed into.
    pub ranks: usize,
}

impl Default for Partitioning {
    fn default() -> Self {
        Self { ranks: 1 }
    }
}

/// Error while constructing a mesh.
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("mesh shape {0:?} has a zero-sized axis")]
    ZeroShape([usize; 3]),
    #[error("cannot split shape {shape:?} into {ranks} ranks with at least one owned cell per axis")]
    Unpartitionable { shape: [usize; 3], ranks: usize },
}

/// A contiguous sub-box of the grid owned by a single rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubBox {
    /// Global index of the box's lowest corner.
    pub origin: [usize; 3],
    /// Extent of the box along each axis.
    pub size: [usize; 3],
}

impl SubBox {
    /// Number of cells owned by this box.
    pub fn cell_count(&self) -> usize {
        self.size.iter().product()
    }
}

/// A distributed 3-D axis-aligned grid of scalar samples.
///
/// Two-dimensional images are stored with `Nz = 1`; `ndim` reports the
/// active dimensionality and kernels skip collapsed axes.
#[derive(Debug)]
pub struct GridMesh {
    shape: [usize; 3],
    ndim: usize,
    space: IndexSpace<3>,
    owned: Vec<SubBox>,
}

impl GridMesh {
    /// Builds a mesh over `shape` decomposed per `parts`.
    ///
    /// The auto-partitioner factorises the rank count over the active axes
    /// so that per-rank sub-boxes stay as close to cubical as possible, and
    /// refuses factorisations that would leave a rank without at least one
    /// owned cell per axis.
    pub fn create(shape: [usize; 3], parts: Partitioning) -> Result<Self, MeshError> {
        if shape.iter().any(|&n| n == 0) {
            return Err(MeshError::ZeroShape(shape));
        }

        let ndim = if shape[2] == 1 { 2 } else { 3 };
        let ranks = parts.ranks.max(1);

        let rank_grid = best_rank_grid(shape, ranks)
            .ok_or(MeshError::Unpartitionable { shape, ranks })?;

        let splits: [Vec<(usize, usize)>; 3] =
            [0, 1, 2].map(|d| split_axis(shape[d], rank_grid[d]));

        let rank_space = IndexSpace::new(rank_grid);
        let mut owned = Vec::with_capacity(ranks);
        for r in rank_space.iter() {
            let mut origin = [0; 3];
            let mut size = [0; 3];
            for d in 0..3 {
                let (start, len) = splits[d][r[d]];
                origin[d] = start;
                size[d] = len;
            }
            owned.push(SubBox { origin, size });
        }

        log::debug!(
            "mesh {}x{}x{} split {}x{}x{} over {} ranks",
            shape[0],
            shape[1],
            shape[2],
            rank_grid[0],
            rank_grid[1],
            rank_grid[2],
            ranks
        );

        Ok(Self {
            shape,
            ndim,
            space: IndexSpace::new(shape),
            owned,
        })
    }

    /// Global grid shape.
    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    /// Active dimensionality (2 when `Nz = 1`, else 3).
    pub fn ndim(&self) -> usize {
        self.ndim
    }

    /// Total number of samples in the grid.
    pub fn cell_count(&self) -> usize {
        self.space.index_count()
    }

    /// The global index space of the grid.
    pub fn space(&self) -> IndexSpace<3> {
        self.space
    }

    /// Number of ranks the grid is decomposed into.
    pub fn rank_count(&self) -> usize {
        self.owned.len()
    }

    /// The sub-box owned by `rank`.
    pub fn owned_box(&self, rank: usize) -> &SubBox {
        &self.owned[rank]
    }

    /// Index space of `rank`'s local block: owned cells plus a one-cell
    /// halo on every face.
    pub fn local_space(&self, rank: usize) -> IndexSpace<3> {
        let size = self.owned[rank].size;
        IndexSpace::new([size[0] + 2, size[1] + 2, size[2] + 2])
    }

    /// Allocates a zeroed global sample buffer.
    pub fn create_global(&self) -> Vec<f64> {
        vec![0.0; self.cell_count()]
    }

    /// Allocates a zeroed local (owned + halo) buffer set.
    pub fn create_local(&self) -> LocalField {
        let blocks = (0..self.rank_count())
            .map(|r| vec![0.0; self.local_space(r).index_count()])
            .collect();
        LocalField { blocks }
    }

    /// Begins a halo synchronisation copying `src` into `dst`.
    ///
    /// The exchange fills each rank's owned cells and ghost halo from the
    /// global buffer; halo cells beyond the true domain edge replicate the
    /// owned edge sample. Nothing is transferred until [`HaloExchange::end`]
    /// runs; exchanges on distinct buffer pairs may be in flight
    /// concurrently, and every one must be ended before its local buffer is
    /// read.
    pub fn global_to_local_begin<'a>(
        &'a self,
        src: &'a [f64],
        dst: &'a mut LocalField,
    ) -> HaloExchange<'a> {
        assert_eq!(
            src.len(),
            self.cell_count(),
            "global buffer does not match mesh"
        );
        assert_eq!(
            dst.blocks.len(),
            self.rank_count(),
            "local buffer does not match mesh"
        );

        HaloExchange {
            mesh: self,
            src,
            dst,
        }
    }

    /// Synchronises `dst` from `src` in one step.
    pub fn global_to_local(&self, src: &[f64], dst: &mut LocalField) {
        self.global_to_local_begin(src, dst).end();
    }

    /// Visits every owned cell of `field` as `(global index, value)`, rank
    /// by rank in a fixed order.
    pub fn for_each_owned(&self, field: &[f64], mut f: impl FnMut([usize; 3], f64)) {
        assert_eq!(field.len(), self.cell_count());

        for owned in &self.owned {
            for local in IndexSpace::new(owned.size).iter() {
                let mut global = [0; 3];
                for d in 0..3 {
                    global[d] = owned.origin[d] + local[d];
                }
                f(global, field[self.space.linear_from_cartesian(global)]);
            }
        }
    }

    /// As [`GridMesh::for_each_owned`], with mutable access to the value.
    pub fn for_each_owned_mut(&self, field: &mut [f64], mut f: impl FnMut([usize; 3], &mut f64)) {
        assert_eq!(field.len(), self.cell_count());

        for owned in &self.owned {
            for local in IndexSpace::new(owned.size).iter() {
                let mut global = [0; 3];
                for d in 0..3 {
                    global[d] = owned.origin[d] + local[d];
                }
                f(global, &mut field[self.space.linear_from_cartesian(global)]);
            }
        }
    }

    fn fill_rank_block(&self, rank: usize, src: &[f64], block: &mut [f64]) {
        let owned = self.owned[rank];
        let local_space = self.local_space(rank);

        for local in local_space.iter() {
            let mut global = [0isize; 3];
            for d in 0..3 {
                global[d] = owned.origin[d] as isize + local[d] as isize - 1;
            }
            // Clamping both replicates the domain edge into outermost halos
            // and is a no-op for interior ghost cells owned by a neighbour.
            let global = self.space.clamp(global);
            block[local_space.linear_from_cartesian(local)] =
                src[self.space.linear_from_cartesian(global)];
        }
    }
}

/// Per-rank owned + halo sample blocks for one [`GridMesh`].
#[derive(Debug, Clone)]
pub struct LocalField {
    blocks: Vec<Vec<f64>>,
}

impl LocalField {
    /// The local block of `rank`.
    pub fn block(&self, rank: usize) -> &[f64] {
        &self.blocks[rank]
    }

    /// Number of rank blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

/// An in-flight halo synchronisation. Dropping without calling
/// [`HaloExchange::end`] leaves the local buffer stale.
#[must_use = "halo contents are not transferred until end() runs"]
pub struct HaloExchange<'a> {
    mesh: &'a GridMesh,
    src: &'a [f64],
    dst: &'a mut LocalField,
}

impl HaloExchange<'_> {
    /// Completes the exchange, filling owned and ghost cells of every rank.
    pub fn end(self) {
        for rank in 0..self.mesh.rank_count() {
            self.mesh
                .fill_rank_block(rank, self.src, &mut self.dst.blocks[rank]);
        }
    }
}

/// Picks the rank-grid factorisation minimising the skew of per-rank
/// sub-box extents. Collapsed axes are never split.
fn best_rank_grid(shape: [usize; 3], ranks: usize) -> Option<[usize; 3]> {
    let mut best: Option<([usize; 3], f64)> = None;

    for px in 1..=ranks {
        if ranks % px != 0 || px > shape[0] {
            continue;
        }
        let rest = ranks / px;
        for py in 1..=rest {
            if rest % py != 0 || py > shape[1] {
                continue;
            }
            let pz = rest / py;
            if pz > shape[2] {
                continue;
            }

            let grid = [px, py, pz];
            let mut lo = f64::INFINITY;
            let mut hi = 0.0f64;
            for d in 0..3 {
                if shape[d] == 1 {
                    continue;
                }
                let extent = shape[d] as f64 / grid[d] as f64;
                lo = lo.min(extent);
                hi = hi.max(extent);
            }
            let skew = if lo.is_finite() { hi / lo } else { 1.0 };

            if best.map_or(true, |(_, s)| skew < s) {
                best = Some((grid, skew));
            }
        }
    }

    best.map(|(grid, _)| grid)
}

/// Splits an axis of length `n` into `parts` contiguous near-equal ranges.
fn split_axis(n: usize, parts: usize) -> Vec<(usize, usize)> {
    let base = n / parts;
    let rem = n % parts;

    let mut out = Vec::with_capacity(parts);
    let mut cursor = 0;
    for p in 0..parts {
        let len = base + usize::from(p < rem);
        out.push((cursor, len));
        cursor += len;
    }
    out
}
