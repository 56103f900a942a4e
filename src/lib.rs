//! Parallel elastic image registration.
//!
//! `elastir` computes a dense displacement field that warps a *moved* image
//! onto a *fixed* reference. The field lives on a coarse grid of control
//! nodes and is refined through a coarse-to-fine cascade of node spacings;
//! at each resolution a Gauss-Newton-like inner loop linearises the
//! intensity-matching problem and solves a Laplacian-regularised
//! normal-equation system with a Krylov method. Alongside the spatial
//! displacement the solver carries a per-node intensity correction channel,
//! so brightness differences are absorbed instead of being chased with
//! spurious deformation.

pub mod basis;
pub mod elastic;
pub mod fd;
pub mod geometry;
pub mod image;
pub mod io;
pub mod lac;
pub mod laplacian;
pub mod map;
pub mod mesh;
pub mod workspace;

/// Common types used by most `elastir` applications.
pub mod prelude {
    pub use crate::elastic::{Elastic, ElasticSettings};
    pub use crate::geometry::IndexSpace;
    pub use crate::image::Image;
    pub use crate::io::{find_loader, VtkWriter};
    pub use crate::lac::{BiCgStabSolver, CsrMap, LinearMap, LinearSolver};
    pub use crate::map::DisplacementMap;
    pub use crate::mesh::{GridMesh, LocalField, Partitioning};
    pub use crate::workspace::WorkSpace;
}
