//! Elastic image registration front-end.
//!
//! Takes a single TOML configuration file naming the fixed and moved images
//! and the final node spacing, runs the multi-resolution registration, and
//! writes the registered image and displacement map.

use clap::{arg, Command};
use elastir::elastic::DebugFrames;
use elastir::prelude::*;
use elastir_app::config::RegistrationConfig;
use elastir_app::progress;
use eyre::Context as _;
use indicatif::{HumanDuration, ProgressBar};
use std::path::PathBuf;
use std::time::{Duration, Instant};

fn main() -> eyre::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = Command::new("elastir")
        .about("Elastic image registration")
        .arg(arg!(<config> "Path to the configuration file"))
        .get_matches();

    let config_path: PathBuf = matches
        .get_one::<String>("config")
        .expect("config is a required argument")
        .into();

    let start = Instant::now();
    mainflow(&config_path)?;
    log::info!("elapsed time: {}", HumanDuration(start.elapsed()));

    Ok(())
}

fn mainflow(config_path: &std::path::Path) -> eyre::Result<()> {
    let config = RegistrationConfig::load(config_path).wrap_err("failed to load configuration")?;
    let parts = Partitioning {
        ranks: config.ranks,
    };

    let mut fixed = Image::load_file(&config.fixed, None, parts)
        .wrap_err("failed to load fixed image")?;
    log::info!(
        "loaded fixed image of shape {} x {} x {}",
        fixed.shape()[0],
        fixed.shape()[1],
        fixed.shape()[2]
    );

    let mut moved = Image::load_file(&config.moved, Some(&fixed), parts)
        .wrap_err("failed to load moved image")?;

    fixed.normalize();
    moved.normalize();

    let spacing = config.node_spacing(fixed.ndim())?;
    let settings = ElasticSettings {
        lambda: config.lambda,
        max_iterations: config.max_iterations,
        threshold: config.threshold,
        debug_frames: config.debug_frames.then(|| DebugFrames {
            prefix: config.debug_frames_prefix.clone(),
        }),
    };

    let mut registration = Elastic::new(&fixed, &moved, spacing, settings)?;

    let spinner = ProgressBar::new_spinner().with_style(progress::spinner_style());
    spinner.set_prefix("elastir");
    spinner.set_message(format!(
        "registering over {} generation(s)",
        registration.node_spacings().len()
    ));
    spinner.enable_steady_tick(Duration::from_millis(100));

    registration.autoregister();
    spinner.finish_and_clear();

    let writer = VtkWriter::new(".");
    writer
        .write_image(registration.registered(), &config.registered)
        .wrap_err("failed to write registered image")?;
    writer
        .write_map(registration.map(), &config.map)
        .wrap_err("failed to write displacement map")?;

    Ok(())
}
