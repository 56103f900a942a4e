use super::{LinearMap, LinearSolver};
use thiserror::Error;

/// Stabilised bi-conjugate gradient solver with an optional Jacobi left
/// preconditioner.
///
/// BiCGStab tolerates the mild nonsymmetry a one-sided diagonal scaling
/// introduces into an otherwise symmetric positive system. Scratch vectors
/// are owned by the solver and recycled across solves of the same
/// dimension.
pub struct BiCgStabSolver {
    max_iterations: usize,
    tolerance: f64,
    dimension: usize,

    /// Reciprocal diagonal of the preconditioner; `None` is the identity.
    inv_diag: Option<Vec<f64>>,

    r: Vec<f64>,
    r_shadow: Vec<f64>,
    p: Vec<f64>,
    p_hat: Vec<f64>,
    s: Vec<f64>,
    s_hat: Vec<f64>,
    t: Vec<f64>,
    v: Vec<f64>,
    scratch: Vec<f64>,
}

/// Why a solve stopped short. The iterate accumulated so far is still
/// available to the caller.
#[derive(Error, Debug)]
pub enum SolveError {
    #[error("krylov breakdown (rho = 0) at iteration {0}")]
    Breakdown(usize),
    #[error("no convergence in {iterations} iterations, residual {residual:.3e}")]
    FailedToConverge { iterations: usize, residual: f64 },
}

impl BiCgStabSolver {
    /// Builds a solver for systems of the given dimension. `tolerance` is
    /// relative to the right-hand-side norm.
    pub fn new(dimension: usize, max_iterations: usize, tolerance: f64) -> Self {
        Self {
            dimension,
            max_iterations,
            tolerance,
            inv_diag: None,

            r: vec![0.0; dimension],
            r_shadow: vec![0.0; dimension],
            p: vec![0.0; dimension],
            p_hat: vec![0.0; dimension],
            s: vec![0.0; dimension],
            s_hat: vec![0.0; dimension],
            t: vec![0.0; dimension],
            v: vec![0.0; dimension],
            scratch: vec![0.0; dimension],
        }
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    /// Installs a Jacobi preconditioner from a matrix diagonal. Entries too
    /// close to zero fall back to unit scaling.
    pub fn set_jacobi(&mut self, diagonal: &[f64]) {
        assert_eq!(diagonal.len(), self.dimension);

        self.inv_diag = Some(
            diagonal
                .iter()
                .map(|&d| if d.abs() > 1e-300 { 1.0 / d } else { 1.0 })
                .collect(),
        );
    }

    fn precondition(inv_diag: &Option<Vec<f64>>, src: &[f64], dest: &mut [f64]) {
        match inv_diag {
            Some(inv) => {
                for i in 0..src.len() {
                    dest[i] = inv[i] * src[i];
                }
            }
            None => dest.clone_from_slice(src),
        }
    }
}

impl LinearSolver for BiCgStabSolver {
    type Error = SolveError;

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn solve<M: LinearMap>(
        &mut self,
        map: &M,
        rhs: &[f64],
        solution: &mut [f64],
    ) -> Result<(), Self::Error> {
        assert_eq!(map.dimension(), self.dimension);
        assert_eq!(rhs.len(), self.dimension);
        assert_eq!(solution.len(), self.dimension);

        let rhs_norm = norm(rhs);
        if rhs_norm <= 1e-60 {
            solution.fill(0.0);
            return Ok(());
        }
        let target = self.tolerance * rhs_norm;

        map.apply(solution, &mut self.scratch);
        for i in 0..self.dimension {
            self.r[i] = rhs[i] - self.scratch[i];
        }
        self.r_shadow.clone_from_slice(&self.r);

        let mut residual = norm(&self.r);
        if residual <= target {
            return Ok(());
        }

        let mut rho_prev = 0.0;
        let mut alpha = 0.0;
        let mut omega = 0.0;

        for iter in 0..self.max_iterations {
            let rho = dot(&self.r_shadow, &self.r);
            if rho == 0.0 {
                return Err(SolveError::Breakdown(iter));
            }

            if iter == 0 {
                self.p.clone_from_slice(&self.r);
            } else {
                let beta = (rho / rho_prev) * (alpha / omega);
                for i in 0..self.dimension {
                    self.p[i] = self.r[i] + beta * (self.p[i] - omega * self.v[i]);
                }
            }
            rho_prev = rho;

            Self::precondition(&self.inv_diag, &self.p, &mut self.p_hat);
            map.apply(&self.p_hat, &mut self.v);
            alpha = rho / dot(&self.r_shadow, &self.v);

            for i in 0..self.dimension {
                self.s[i] = self.r[i] - alpha * self.v[i];
            }

            if norm(&self.s) <= target {
                for i in 0..self.dimension {
                    solution[i] += alpha * self.p_hat[i];
                }
                return Ok(());
            }

            Self::precondition(&self.inv_diag, &self.s, &mut self.s_hat);
            map.apply(&self.s_hat, &mut self.t);
            omega = dot(&self.t, &self.s) / dot(&self.t, &self.t);

            for i in 0..self.dimension {
                solution[i] += alpha * self.p_hat[i] + omega * self.s_hat[i];
                self.r[i] = self.s[i] - omega * self.t[i];
            }

            residual = norm(&self.r);
            map.callback(iter, residual);

            if residual <= target {
                return Ok(());
            }
        }

        Err(SolveError::FailedToConverge {
            iterations: self.max_iterations,
            residual,
        })
    }
}

fn dot(v: &[f64], w: &[f64]) -> f64 {
    v.iter().zip(w).map(|(&a, &b)| a * b).sum()
}

fn norm(v: &[f64]) -> f64 {
    dot(v, v).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lac::{CsrMap, IdentityMap};
    use nalgebra_sparse::{CooMatrix, CsrMatrix};

    #[test]
    fn identity_system() {
        let rhs: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let mut solution = vec![0.0; 100];

        let mut solver = BiCgStabSolver::new(100, 1000, 1e-10);
        solver
            .solve(&IdentityMap::new(100), &rhs, &mut solution)
            .unwrap();

        assert_eq!(solution, rhs);
    }

    #[test]
    fn tridiagonal_system() {
        // 1-D Poisson-like matrix with Dirichlet ends, well conditioned.
        let n = 32;
        let mut coo = CooMatrix::new(n, n);
        for i in 0..n {
            coo.push(i, i, 2.5);
            if i > 0 {
                coo.push(i, i - 1, -1.0);
            }
            if i + 1 < n {
                coo.push(i, i + 1, -1.0);
            }
        }
        let matrix = CsrMatrix::from(&coo);

        let expected: Vec<f64> = (0..n).map(|i| (i as f64 * 0.37).sin()).collect();
        let map = CsrMap::new(&matrix);
        let mut rhs = vec![0.0; n];
        map.apply(&expected, &mut rhs);

        let mut solver = BiCgStabSolver::new(n, 500, 1e-12);
        solver.set_jacobi(&map.diagonal());

        let mut solution = vec![0.0; n];
        solver.solve(&map, &rhs, &mut solution).unwrap();

        for (got, want) in solution.iter().zip(&expected) {
            assert!((got - want).abs() < 1e-8, "{got} vs {want}");
        }
    }
}
