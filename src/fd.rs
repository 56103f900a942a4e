//! Finite-difference kernels on distributed grids.

use crate::geometry::IndexSpace;
use crate::mesh::{GridMesh, LocalField};

/// Central-difference gradient of `local` along axis `dim`, written to the
/// owned cells of the global buffer `grad`.
///
/// `local` must hold a fresh halo: the stencil reads one ghost cell past the
/// owned box, and at the true domain edge the replicated ghost turns the
/// centred difference into a one-sided half difference. A collapsed axis
/// (`Ni = 1`) yields an all-zero gradient without touching ghost cells.
pub fn gradient_to_global(mesh: &GridMesh, local: &LocalField, dim: usize, grad: &mut [f64]) {
    assert!(dim < 3, "gradient axis out of range");
    assert_eq!(grad.len(), mesh.cell_count());

    if mesh.shape()[dim] == 1 {
        grad.fill(0.0);
        return;
    }

    let space = mesh.space();

    for rank in 0..mesh.rank_count() {
        let owned = mesh.owned_box(rank);
        let local_space = mesh.local_space(rank);
        let block = local.block(rank);

        let mut ofs = [0usize; 3];
        ofs[dim] = 1;

        for cell in IndexSpace::new(owned.size).iter() {
            // Owned cell (i,j,k) sits at (i+1,j+1,k+1) in the halo block.
            let hi = [
                cell[0] + 1 + ofs[0],
                cell[1] + 1 + ofs[1],
                cell[2] + 1 + ofs[2],
            ];
            let lo = [
                cell[0] + 1 - ofs[0],
                cell[1] + 1 - ofs[1],
                cell[2] + 1 - ofs[2],
            ];

            let value = 0.5
                * (block[local_space.linear_from_cartesian(hi)]
                    - block[local_space.linear_from_cartesian(lo)]);

            let global = [
                owned.origin[0] + cell[0],
                owned.origin[1] + cell[1],
                owned.origin[2] + cell[2],
            ];
            grad[space.linear_from_cartesian(global)] = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::Partitioning;

    fn ramp_mesh(ranks: usize) -> (GridMesh, Vec<f64>) {
        let mesh = GridMesh::create([6, 4, 1], Partitioning { ranks }).unwrap();
        let mut field = mesh.create_global();
        mesh.for_each_owned_mut(&mut field, |[i, _, _], v| *v = 3.0 * i as f64);
        (mesh, field)
    }

    #[test]
    fn linear_ramp_has_constant_gradient() {
        for ranks in [1, 2, 4] {
            let (mesh, field) = ramp_mesh(ranks);
            let mut local = mesh.create_local();
            mesh.global_to_local(&field, &mut local);

            let mut grad = mesh.create_global();
            gradient_to_global(&mesh, &local, 0, &mut grad);

            mesh.for_each_owned(&grad, |[i, _, _], g| {
                if i == 0 || i == 5 {
                    // One-sided half difference against the replicated edge.
                    assert!((g - 1.5).abs() < 1e-12, "edge gradient {g}");
                } else {
                    assert!((g - 3.0).abs() < 1e-12, "interior gradient {g}");
                }
            });
        }
    }

    #[test]
    fn collapsed_axis_gradient_is_zero() {
        let (mesh, field) = ramp_mesh(2);
        let mut local = mesh.create_local();
        mesh.global_to_local(&field, &mut local);

        let mut grad = vec![1.0; mesh.cell_count()];
        gradient_to_global(&mesh, &local, 2, &mut grad);

        assert!(grad.iter().all(|&g| g == 0.0));
    }
}
