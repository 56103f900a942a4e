//! Iterative linear solvers behind a matrix-free seam.

mod bicgstab;

use nalgebra_sparse::CsrMatrix;
use std::fmt::Debug;

pub use bicgstab::{BiCgStabSolver, SolveError};

/// A linear map between vectors of a given dimension.
pub trait LinearMap {
    /// Dimension of the linear map.
    fn dimension(&self) -> usize;

    /// Application of the linear map.
    fn apply(&self, src: &[f64], dest: &mut [f64]);

    /// An optional callback for observing residuals per iteration.
    fn callback(&self, iteration: usize, residual: f64) {
        _ = iteration;
        _ = residual;
    }
}

/// An iterative solver for linear problems posed through [`LinearMap`].
pub trait LinearSolver {
    type Error: Debug;

    /// Dimension of the linear solver.
    fn dimension(&self) -> usize;

    /// Solves `map * solution = rhs`, starting from the current contents of
    /// `solution`. On error the best-effort iterate is left in `solution`.
    fn solve<M: LinearMap>(
        &mut self,
        map: &M,
        rhs: &[f64],
        solution: &mut [f64],
    ) -> Result<(), Self::Error>;
}

/// Sparse matrix-vector product `dest = matrix * src`.
pub fn spmv(matrix: &CsrMatrix<f64>, src: &[f64], dest: &mut [f64]) {
    assert_eq!(src.len(), matrix.ncols());
    assert_eq!(dest.len(), matrix.nrows());

    for (i, row) in matrix.row_iter().enumerate() {
        let mut acc = 0.0;
        for (&j, &v) in row.col_indices().iter().zip(row.values()) {
            acc += v * src[j];
        }
        dest[i] = acc;
    }
}

/// A [`LinearMap`] backed by a square CSR matrix.
pub struct CsrMap<'a> {
    matrix: &'a CsrMatrix<f64>,
}

impl<'a> CsrMap<'a> {
    pub fn new(matrix: &'a CsrMatrix<f64>) -> Self {
        assert_eq!(
            matrix.nrows(),
            matrix.ncols(),
            "CsrMap requires a square matrix"
        );
        Self { matrix }
    }

    /// The matrix diagonal, used to seed a Jacobi preconditioner.
    pub fn diagonal(&self) -> Vec<f64> {
        let mut diag = vec![0.0; self.matrix.nrows()];
        for (i, j, v) in self.matrix.triplet_iter() {
            if i == j {
                diag[i] = *v;
            }
        }
        diag
    }
}

impl LinearMap for CsrMap<'_> {
    fn dimension(&self) -> usize {
        self.matrix.nrows()
    }

    fn apply(&self, src: &[f64], dest: &mut [f64]) {
        spmv(self.matrix, src, dest);
    }

    fn callback(&self, iteration: usize, residual: f64) {
        if iteration % 50 == 0 {
            log::debug!("krylov iteration {iteration}, residual {residual:.3e}");
        }
    }
}

/// An identity map, useful for exercising solvers.
pub struct IdentityMap {
    dimension: usize,
}

impl IdentityMap {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl LinearMap for IdentityMap {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn apply(&self, src: &[f64], dest: &mut [f64]) {
        dest.clone_from_slice(src);
    }
}
