//! Graph Laplacian of the displacement node grid.

use crate::geometry::IndexSpace;
use nalgebra_sparse::{CooMatrix, CsrMatrix};

/// Builds the 7-point (5-point on 2-D grids) Laplacian over a node grid
/// with Neumann boundaries: each diagonal entry counts the node's existing
/// neighbours and every neighbour coupling is -1, so all row sums vanish
/// and the matrix is symmetric positive semi-definite. Collapsed axes
/// (`M = 1`) are skipped.
pub fn node_laplacian(node_shape: [usize; 3]) -> CsrMatrix<f64> {
    let space = IndexSpace::new(node_shape);
    let n = space.index_count();

    let mut coo = CooMatrix::new(n, n);

    for node in space.iter() {
        let row = space.linear_from_cartesian(node);
        let mut degree = 0.0;

        for d in 0..3 {
            if node_shape[d] == 1 {
                continue;
            }
            if node[d] > 0 {
                let mut nb = node;
                nb[d] -= 1;
                coo.push(row, space.linear_from_cartesian(nb), -1.0);
                degree += 1.0;
            }
            if node[d] + 1 < node_shape[d] {
                let mut nb = node;
                nb[d] += 1;
                coo.push(row, space.linear_from_cartesian(nb), -1.0);
                degree += 1.0;
            }
        }

        coo.push(row, row, degree);
    }

    CsrMatrix::from(&coo)
}
