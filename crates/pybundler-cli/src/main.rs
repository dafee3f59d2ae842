//! pybundler CLI

use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use pybundler_cli::cmd;
use pybundler_cli::{Cli, Commands};
use pybundler_core::BuildError;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Build {
            config,
            alias,
            semi_standalone,
            dist_dir,
            interpreter,
            launcher,
            json,
        } => cmd::build::build(&cmd::build::BuildArgs {
            config,
            alias,
            semi_standalone,
            dist_dir,
            interpreter,
            launcher,
            json,
        }),
        Commands::Graph {
            config,
            interpreter,
            format,
        } => cmd::graph::graph(config.as_deref(), interpreter.as_deref(), format),
        Commands::Audit {
            bundle,
            allow,
            format,
        } => cmd::audit::audit(&bundle, &allow, format),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            let code = e
                .downcast_ref::<BuildError>()
                .map_or(1, BuildError::exit_code);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}
