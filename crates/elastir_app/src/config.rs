//! Registration configuration files.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error while loading or validating a configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read configuration {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid configuration {path}: {source}")]
    Parse {
        path: PathBuf,
        source: Box<toml::de::Error>,
    },
    #[error("node spacing {0:?} must be positive")]
    NonPositiveSpacing(Vec<f64>),
    #[error("node spacing lists {got} axes but the image has {expected}")]
    SpacingDimension { expected: usize, got: usize },
}

/// Node spacing as written in the configuration: a single pitch applied to
/// every axis, or one pitch per image axis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeSpacing {
    Scalar(f64),
    PerAxis(Vec<f64>),
}

/// A registration run, as read from a TOML file.
///
/// `fixed`, `moved` and `nodespacing` are required; everything else has the
/// documented default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationConfig {
    /// Path of the fixed (reference) image.
    pub fixed: PathBuf,
    /// Path of the moved image.
    pub moved: PathBuf,
    /// Final-generation node spacing, scalar or per axis.
    pub nodespacing: NodeSpacing,

    /// Output name for the registered image.
    #[serde(default = "default_registered")]
    pub registered: String,
    /// Output name for the displacement map.
    #[serde(default = "default_map")]
    pub map: String,

    /// Write the registered image after every inner iteration.
    #[serde(default)]
    pub debug_frames: bool,
    #[serde(default = "default_debug_prefix")]
    pub debug_frames_prefix: String,

    /// Laplacian regularisation weight.
    #[serde(default = "default_lambda")]
    pub lambda: f64,
    /// Inner-iteration cap per generation.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Convergence threshold on the increment infinity norm.
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    /// Processing ranks the image grid is decomposed into.
    #[serde(default = "default_ranks")]
    pub ranks: usize,
}

fn default_registered() -> String {
    "registered.vti".to_string()
}

fn default_map() -> String {
    "map.vti".to_string()
}

fn default_debug_prefix() -> String {
    "debug".to_string()
}

fn default_lambda() -> f64 {
    20.0
}

fn default_max_iterations() -> usize {
    50
}

fn default_threshold() -> f64 {
    0.1
}

fn default_ranks() -> usize {
    1
}

impl RegistrationConfig {
    /// Deserialises a configuration from a TOML file. Missing required keys
    /// surface as parse errors naming the key.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source: Box::new(source),
        })
    }

    /// Resolves the configured spacing against an image dimensionality,
    /// checking positivity and axis count. Collapsed axes get unit spacing.
    pub fn node_spacing(&self, ndim: usize) -> Result<[f64; 3], ConfigError> {
        let axes: Vec<f64> = match &self.nodespacing {
            NodeSpacing::Scalar(s) => vec![*s; ndim],
            NodeSpacing::PerAxis(list) => list.clone(),
        };

        if axes.len() != ndim {
            return Err(ConfigError::SpacingDimension {
                expected: ndim,
                got: axes.len(),
            });
        }
        if axes.iter().any(|&s| !(s > 0.0)) {
            return Err(ConfigError::NonPositiveSpacing(axes));
        }

        let mut spacing = [1.0; 3];
        spacing[..ndim].copy_from_slice(&axes);
        Ok(spacing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<RegistrationConfig, toml::de::Error> {
        toml::from_str(text)
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse(
            r#"
            fixed = "fixed.png"
            moved = "moved.png"
            nodespacing = 8.0
            "#,
        )
        .unwrap();

        assert_eq!(config.lambda, 20.0);
        assert_eq!(config.max_iterations, 50);
        assert_eq!(config.threshold, 0.1);
        assert_eq!(config.registered, "registered.vti");
        assert!(!config.debug_frames);
        assert_eq!(config.ranks, 1);
    }

    #[test]
    fn missing_required_key_names_it() {
        let err = parse("fixed = \"fixed.png\"\nnodespacing = 8.0\n").unwrap_err();
        assert!(err.to_string().contains("moved"), "{err}");
    }

    #[test]
    fn spacing_resolution() {
        let config = parse(
            r#"
            fixed = "f.png"
            moved = "m.png"
            nodespacing = [4.0, 8.0]
            "#,
        )
        .unwrap();

        assert_eq!(config.node_spacing(2).unwrap(), [4.0, 8.0, 1.0]);
        assert!(matches!(
            config.node_spacing(3),
            Err(ConfigError::SpacingDimension { .. })
        ));
    }

    #[test]
    fn non_positive_spacing_is_rejected() {
        let config = parse(
            r#"
            fixed = "f.png"
            moved = "m.png"
            nodespacing = -2.0
            "#,
        )
        .unwrap();

        assert!(matches!(
            config.node_spacing(2),
            Err(ConfigError::NonPositiveSpacing(_))
        ));
    }
}
