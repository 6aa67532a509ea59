use std::path::PathBuf;

use clap::Parser;
use multibuild::{composition::Composition, config::RunConfig, Orchestrator};
use stacked_errors::{Result, StackableErr};
use tracing_subscriber::EnvFilter;

/// Demultiplexes `archive` per `composition` and builds/pulls every
/// resulting service against the local Docker daemon.
#[derive(Parser, Debug)]
#[command(about)]
struct Args {
    /// Path to a docker-compose-flavored composition YAML file
    #[arg(long)]
    composition: PathBuf,
    /// Path to the combined source tar archive
    #[arg(long)]
    archive: PathBuf,
    /// Target CPU architecture, e.g. "armv7hf"
    #[arg(long)]
    arch: Option<String>,
    /// Target device type, e.g. "raspberrypi3"
    #[arg(long)]
    device_type: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let args = Args::parse();

    let composition_text = tokio::fs::read_to_string(&args.composition)
        .await
        .stack_err_locationless("reading composition file")?;
    let composition = Composition::from_yaml(&composition_text).stack_err_locationless("parsing composition")?;

    let archive = tokio::fs::File::open(&args.archive)
        .await
        .stack_err_locationless("opening archive")?;

    let config = RunConfig {
        arch: args.arch,
        device_type: args.device_type,
        ..Default::default()
    };

    let docker = config.connect().stack_err_locationless("connecting to the docker daemon")?;

    let results = Orchestrator::run(&composition, archive, &config, &docker, None, None)
        .await
        .stack_err_locationless("Orchestrator::run")?;

    for image in &results {
        if image.successful {
            println!("{}: built {}", image.service_name, image.name.as_deref().unwrap_or("<unnamed>"));
        } else {
            println!(
                "{}: FAILED ({})",
                image.service_name,
                image.error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    Ok(())
}
