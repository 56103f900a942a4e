//! The coarse-to-fine elastic registration driver.
//!
//! Registration proceeds through *generations*, one per node spacing in a
//! cascade that starts coarse and ends at the user-supplied spacing. Within
//! a generation the driver iterates a linearised fixed-point step: the
//! intensity mismatch between the fixed image `f` and the current
//! registered image `r` is expanded to first order in the displacement
//! coefficients,
//!
//! `T · Δa ≈ f − r`,   `T = diag(v) · B`,
//!
//! where `B` is the map's tent basis and `v` stacks the average-intensity
//! gradients `∂((f+r)/2)` per spatial dimension followed by the luminance
//! offset `1 − (f+r)/2`. Each iteration solves the Laplacian-regularised
//! normal equations `(TᵀT + λL) Δa = Tᵀρ` with `ρ` the residual broadcast
//! over all blocks, applies the increment and re-warps the moved image.

use nalgebra_sparse::CsrMatrix;
use thiserror::Error;

use crate::image::Image;
use crate::io::VtkWriter;
use crate::lac::{CsrMap, BiCgStabSolver, LinearSolver};
use crate::map::{DisplacementMap, MapError};
use crate::workspace::WorkSpace;

const KRYLOV_TOLERANCE: f64 = 1e-9;
const KRYLOV_MAX_ITERATIONS: usize = 1000;

/// Error constructing a registrar.
#[derive(Error, Debug)]
pub enum RegisterError {
    #[error("moved image shape {moved:?} does not match fixed image shape {fixed:?}")]
    ShapeMismatch {
        fixed: [usize; 3],
        moved: [usize; 3],
    },
    #[error(transparent)]
    Map(#[from] MapError),
}

/// Per-iteration debug frame output.
#[derive(Debug, Clone)]
pub struct DebugFrames {
    /// File name prefix; frames land at `<prefix>_<gen>_<iter>.vti`.
    pub prefix: String,
}

/// Tunables of the registration loop.
#[derive(Debug, Clone)]
pub struct ElasticSettings {
    /// Regularisation weight on the node-grid Laplacian, fixed within each
    /// generation.
    pub lambda: f64,
    /// Iteration cap per generation.
    pub max_iterations: usize,
    /// Convergence threshold on the increment infinity norm.
    pub threshold: f64,
    /// When set, every inner iteration writes the registered image.
    pub debug_frames: Option<DebugFrames>,
}

impl Default for ElasticSettings {
    fn default() -> Self {
        Self {
            lambda: 20.0,
            max_iterations: 50,
            threshold: 0.1,
            debug_frames: None,
        }
    }
}

/// Multi-resolution elastic registrar.
///
/// Owns the displacement map and workspace and replaces them in place at
/// generation boundaries; the fixed and moved images are read-only
/// throughout.
#[derive(Debug)]
pub struct Elastic<'a> {
    fixed: &'a Image,
    moved: &'a Image,
    settings: ElasticSettings,

    spacings: Vec<[f64; 3]>,
    map: DisplacementMap,
    workspace: WorkSpace,
    registered: Image,
    iteration_counts: Vec<usize>,
}

impl<'a> Elastic<'a> {
    /// Prepares a registrar for `fixed` and `moved`, which must share a
    /// shape. `final_spacing` is the node spacing of the last generation.
    pub fn new(
        fixed: &'a Image,
        moved: &'a Image,
        final_spacing: [f64; 3],
        settings: ElasticSettings,
    ) -> Result<Self, RegisterError> {
        if fixed.shape() != moved.shape() {
            return Err(RegisterError::ShapeMismatch {
                fixed: fixed.shape(),
                moved: moved.shape(),
            });
        }

        let spacings = calculate_node_spacings(fixed.shape(), fixed.ndim(), final_spacing);
        let map = DisplacementMap::new(fixed, spacings[0])?;
        let workspace = WorkSpace::allocate(fixed, &map);
        let registered = moved.copy();

        Ok(Self {
            fixed,
            moved,
            settings,
            spacings,
            map,
            workspace,
            registered,
            iteration_counts: Vec::new(),
        })
    }

    /// The registered image as of the latest completed iteration.
    pub fn registered(&self) -> &Image {
        &self.registered
    }

    /// The current displacement map.
    pub fn map(&self) -> &DisplacementMap {
        &self.map
    }

    /// The node-spacing cascade, coarsest first.
    pub fn node_spacings(&self) -> &[[f64; 3]] {
        &self.spacings
    }

    /// Inner iterations performed per completed generation.
    pub fn iteration_counts(&self) -> &[usize] {
        &self.iteration_counts
    }

    /// Runs every generation to completion.
    pub fn autoregister(&mut self) {
        log::info!(
            "elastic registration: {} generation(s), lambda {}",
            self.spacings.len(),
            self.settings.lambda
        );
        self.iteration_counts.clear();

        for generation in 0..self.spacings.len() {
            if generation > 0 {
                let spacing = self.spacings[generation];
                self.map = self
                    .map
                    .interpolate(spacing)
                    .expect("refined node spacing stays positive");
                self.workspace.reallocate_ephemeral(&self.map);
                self.registered = self.map.warp(self.moved, &mut self.workspace);
                self.registered.normalize();
            }

            self.innerloop(generation);
        }

        log::info!("registration complete");
    }

    fn innerloop(&mut self, generation: usize) {
        log::info!(
            "generation {generation}: spacing {:?}, node grid {:?}",
            self.spacings[generation],
            self.map.node_shape()
        );

        let mut solver = BiCgStabSolver::new(
            self.map.coefficient_count(),
            KRYLOV_MAX_ITERATIONS,
            KRYLOV_TOLERANCE,
        );

        let lambda = self.settings.lambda;
        let mut converged = false;
        let mut performed = 0;

        for iteration in 0..self.settings.max_iterations {
            let amax = self.innerstep(lambda, &mut solver);
            performed = iteration + 1;
            log::info!("generation {generation} iteration {iteration}: amax {amax:.4}");

            self.save_debug_frame(generation, iteration);

            if amax < self.settings.threshold {
                converged = true;
                break;
            }
        }

        self.iteration_counts.push(performed);

        if !converged {
            log::warn!(
                "generation {generation} hit the iteration cap ({}) before amax dropped below {}",
                self.settings.max_iterations,
                self.settings.threshold
            );
        }
    }

    /// One linearised update. Returns the increment infinity norm.
    fn innerstep(&mut self, lambda: f64, solver: &mut BiCgStabSolver) -> f64 {
        let mesh = self.fixed.mesh().clone();
        let ndim = self.fixed.ndim();
        let nodes = self.map.node_count();

        // Average intensity (f + r) / 2 feeds both the gradient fields and,
        // sign-flipped, the luminance offset slot.
        {
            let f = self.fixed.global();
            let r = self.registered.global();
            let avg = self.workspace.grad_mut(ndim);
            for i in 0..avg.len() {
                avg[i] = 0.5 * (f[i] + r[i]);
            }
        }

        self.workspace.sync_local(&mesh, ndim);
        for dim in 0..ndim {
            self.workspace.gradient_into(&mesh, dim);
        }

        for v in self.workspace.grad_mut(ndim) {
            *v = 1.0 - *v;
        }

        self.workspace.scatter_grads_to_stacked();

        // T = diag(stacked) · B, then N = TᵀT rebalanced and regularised.
        let tmat = self.calculate_tmat();
        let tmat_t = tmat.transpose();
        let mut normal = &tmat_t * &tmat;
        block_precondition(&mut normal, ndim, nodes);
        let normal = add_scaled(&normal, self.map.laplacian(), lambda);

        // RHS: duplicate the residual into every block slot, then Tᵀρ.
        {
            let f = self.fixed.global();
            let r = self.registered.global();
            let residual = self.workspace.grad_mut(ndim);
            for i in 0..residual.len() {
                residual[i] = f[i] - r[i];
            }
        }
        self.workspace.duplicate_single_grad_to_stacked(ndim);
        self.workspace.assemble_rhs(&tmat_t);

        let normal_map = CsrMap::new(&normal);
        solver.set_jacobi(&normal_map.diagonal());

        let (rhs, delta) = self.workspace.rhs_and_delta_mut();
        delta.fill(0.0);
        if let Err(err) = solver.solve(&normal_map, rhs, delta) {
            log::warn!("keeping best-effort increment: {err}");
        }

        let amax = self
            .workspace
            .delta()
            .iter()
            .fold(0.0f64, |m, &v| m.max(v.abs()));

        self.map.update(self.workspace.delta());
        self.registered = self.map.warp(self.moved, &mut self.workspace);
        self.registered.normalize();

        self.workspace.set_tmat(tmat);

        amax
    }

    /// Duplicates the basis and left-scales each row by its stacked-vector
    /// entry.
    fn calculate_tmat(&self) -> CsrMatrix<f64> {
        let mut tmat = self.map.basis().clone();
        let stacked = self.workspace.stacked();
        for (row, _, value) in tmat.triplet_iter_mut() {
            *value *= stacked[row];
        }
        tmat
    }

    fn save_debug_frame(&self, generation: usize, iteration: usize) {
        let Some(frames) = &self.settings.debug_frames else {
            return;
        };

        let name = format!("{}_{generation:02}_{iteration:03}", frames.prefix);
        if let Err(err) = VtkWriter::new(".").write_image(&self.registered, &name) {
            log::warn!("failed to write debug frame {name}: {err}");
        }
    }
}

/// Spacing cascade: starting from the user-supplied final spacing, keep
/// doubling while every active axis still spans more than two node
/// intervals, then consume coarsest to finest.
fn calculate_node_spacings(
    shape: [usize; 3],
    ndim: usize,
    final_spacing: [f64; 3],
) -> Vec<[f64; 3]> {
    let mut spacings = vec![final_spacing];
    let mut current = final_spacing;

    loop {
        let doubled = [2.0 * current[0], 2.0 * current[1], 2.0 * current[2]];
        if (0..ndim).all(|d| shape[d] as f64 / doubled[d] > 2.0) {
            spacings.push(doubled);
            current = doubled;
        } else {
            break;
        }
    }

    spacings.reverse();
    spacings
}

/// Rebalances the spatial and intensity blocks of the normal matrix.
///
/// Pixel displacements and intensity units live on different scales, so
/// the intensity rows are left-scaled until both blocks share the same mean
/// diagonal magnitude. Applied before the Laplacian is added.
fn block_precondition(normal: &mut CsrMatrix<f64>, ndim: usize, nodes: usize) {
    let split = ndim * nodes;

    let mut diag = vec![0.0; normal.nrows()];
    for (i, j, v) in normal.triplet_iter() {
        if i == j {
            diag[i] = *v;
        }
    }

    let avg_spatial = diag[..split].iter().sum::<f64>() / split as f64;
    let avg_lum = diag[split..].iter().sum::<f64>() / nodes as f64;
    if avg_lum.abs() < f64::MIN_POSITIVE {
        log::warn!("degenerate intensity block, skipping rebalancing");
        return;
    }

    let scale = avg_spatial / avg_lum;
    log::debug!("block preconditioner scale {scale:.4e}");

    for (i, _, v) in normal.triplet_iter_mut() {
        if i >= split {
            *v *= scale;
        }
    }
}

/// `a + factor * b`, tolerating different nonzero patterns.
fn add_scaled(a: &CsrMatrix<f64>, b: &CsrMatrix<f64>, factor: f64) -> CsrMatrix<f64> {
    let mut scaled = b.clone();
    for v in scaled.values_mut() {
        *v *= factor;
    }
    a + &scaled
}
