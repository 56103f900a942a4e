//! Common utilities used by elastir-based applications.
//!
//! Covers loading and validating TOML registration configs and the shared
//! indicatif progress-bar styles, so every front-end looks the same.

pub mod config;
pub mod progress;
