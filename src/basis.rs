//! Separable tent (block-linear) interpolation bases.
//!
//! A displacement map stores coefficients on a coarse node grid; the basis
//! matrix carries them to arbitrary evaluation positions in pixel space.
//! Each evaluation row holds one weight per surrounding node corner, the
//! weights being products of the one-dimensional tent `1 - |u|` with `u`
//! the node-unit distance to the corner. Rows therefore sum to one, and a
//! position exactly on a node reproduces that node's coefficient.

use crate::geometry::IndexSpace;
use nalgebra_sparse::CsrMatrix;
use rayon::prelude::*;

/// Builds the interpolation matrix from a node grid to `npos` evaluation
/// positions (in pixel units; node `n` sits at `n * spacing`).
///
/// Collapsed node axes (`M = 1`) contribute a single corner of weight one,
/// so a 2-D grid gets 4 nonzeros per row instead of 8. Positions outside
/// the node grid's extent clamp to its edge cell.
pub fn interpolation_matrix(
    node_shape: [usize; 3],
    spacing: [f64; 3],
    npos: usize,
    position: impl Fn(usize) -> [f64; 3] + Sync,
) -> CsrMatrix<f64> {
    let node_space = IndexSpace::new(node_shape);
    let row_nnz: usize = node_shape
        .iter()
        .map(|&m| if m == 1 { 1 } else { 2 })
        .product();

    let row_offsets: Vec<usize> = (0..=npos).map(|r| r * row_nnz).collect();
    let mut col_indices = vec![0usize; npos * row_nnz];
    let mut values = vec![0.0f64; npos * row_nnz];

    col_indices
        .par_chunks_mut(row_nnz)
        .zip(values.par_chunks_mut(row_nnz))
        .enumerate()
        .for_each(|(row, (cols, vals))| {
            let pos = position(row);

            // Corner node index and tent weight per axis.
            let mut corners: [[(usize, f64); 2]; 3] = [[(0, 1.0), (0, 0.0)]; 3];
            let mut counts = [1usize; 3];
            for d in 0..3 {
                if node_shape[d] == 1 {
                    continue;
                }
                let t = (pos[d] / spacing[d]).clamp(0.0, (node_shape[d] - 1) as f64);
                let lo = (t.floor() as usize).min(node_shape[d] - 2);
                let frac = t - lo as f64;
                corners[d] = [(lo, 1.0 - frac), (lo + 1, frac)];
                counts[d] = 2;
            }

            // Emit corners z-major so column indices come out sorted.
            let mut slot = 0;
            for cz in 0..counts[2] {
                for cy in 0..counts[1] {
                    for cx in 0..counts[0] {
                        let (iz, wz) = corners[2][cz];
                        let (iy, wy) = corners[1][cy];
                        let (ix, wx) = corners[0][cx];
                        cols[slot] = node_space.linear_from_cartesian([ix, iy, iz]);
                        vals[slot] = wx * wy * wz;
                        slot += 1;
                    }
                }
            }
        });

    CsrMatrix::try_from_csr_data(
        npos,
        node_space.index_count(),
        row_offsets,
        col_indices,
        values,
    )
    .expect("tent interpolation rows form valid CSR")
}

/// Stacks `tiles` copies of `block` along the diagonal.
///
/// Used to extend the per-pixel interpolation block to the full
/// displacement basis: one tile per spatial dimension plus one for the
/// intensity-correction channel.
pub fn tile_diagonal(block: &CsrMatrix<f64>, tiles: usize) -> CsrMatrix<f64> {
    let nrows = block.nrows();
    let ncols = block.ncols();
    let nnz = block.nnz();
    let (offsets, indices, entries) = block.csr_data();

    let mut row_offsets = Vec::with_capacity(tiles * nrows + 1);
    let mut col_indices = Vec::with_capacity(tiles * nnz);
    let mut values = Vec::with_capacity(tiles * nnz);

    for tile in 0..tiles {
        for r in 0..nrows {
            row_offsets.push(tile * nnz + offsets[r]);
        }
        col_indices.extend(indices.iter().map(|&c| c + tile * ncols));
        values.extend_from_slice(entries);
    }
    row_offsets.push(tiles * nnz);

    CsrMatrix::try_from_csr_data(
        tiles * nrows,
        tiles * ncols,
        row_offsets,
        col_indices,
        values,
    )
    .expect("diagonal tiling preserves CSR validity")
}
