//! Build a bundle
use anyhow::Result;
use pybundler_core::{Pipeline, TracingReporter};
use std::path::PathBuf;

use super::{absolute, load_config};

#[derive(Debug, Default)]
pub struct BuildArgs {
    pub config: Option<PathBuf>,
    pub alias: bool,
    pub semi_standalone: bool,
    pub dist_dir: Option<PathBuf>,
    pub interpreter: Option<PathBuf>,
    pub launcher: Option<PathBuf>,
    pub json: bool,
}

pub fn build(args: &BuildArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;

    // Command line flags win over the configuration file.
    if args.alias {
        config.alias = true;
        config.semi_standalone = false;
    }
    if args.semi_standalone {
        config.semi_standalone = true;
        config.alias = false;
    }
    if let Some(dir) = &args.dist_dir {
        config.dist_dir = absolute(dir)?;
    }
    if let Some(interp) = &args.interpreter {
        config.interpreter = Some(absolute(interp)?);
    }
    if let Some(launcher) = &args.launcher {
        config.launcher = Some(absolute(launcher)?);
    }

    let summary = Pipeline::new(&config, &TracingReporter).build()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", summary.bundle.display());
    }
    Ok(())
}
