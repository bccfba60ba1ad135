use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::{ArgGroup, Parser};
use extraction::{
    logging::{init_logging, LoggingSettings},
    overrides::{apply_overrides, OverrideArg},
    ExtractionConfig, ExtractionError, RunOutcome, Trainer,
};

const EXIT_FAILURE: i32 = 1;
const EXIT_REQUEUE: i32 = 3;

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("extraction failed: {}", err);
            std::process::exit(EXIT_FAILURE);
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Frozen-backbone feature extraction", long_about = None)]
#[command(group(ArgGroup::new("source").required(true).args(["config", "descriptor"])))]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to extraction config file (TOML or JSON)")]
    config: Option<PathBuf>,

    #[arg(
        long,
        value_name = "PATH",
        help = "Relaunch from a requeue descriptor written by a preempted run"
    )]
    descriptor: Option<PathBuf>,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, help = "Read rank and job id from SLURM_* environment variables")]
    cluster_env: bool,

    #[arg(long, help = "Keep the rendezvous endpoint when checkpointing on preemption")]
    no_requeue: bool,
}

fn run() -> Result<i32, ExtractionError> {
    let args = Args::parse();

    let mut config = match (&args.config, &args.descriptor) {
        (Some(path), _) => ExtractionConfig::load(path)?,
        (None, Some(path)) => Trainer::read_descriptor(path)?.into_config(),
        (None, None) => {
            return Err(ExtractionError::initialization(
                "either --config or --descriptor is required",
            ))
        }
    };
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
    }
    if args.cluster_env {
        config.apply_cluster_env(|name| std::env::var(name).ok())?;
    }
    config.validate()?;

    init_logging(&LoggingSettings::from_config(
        &config.logging,
        config.trainer.is_primary(),
    ))?;

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|err| {
        ExtractionError::initialization(format!("failed to install signal handler: {err}"))
    })?;

    let stop = || shutdown_flag.load(Ordering::Relaxed);
    let trainer = Trainer::from_config(config);
    let mut runtime = match trainer.clone().launch_with_shutdown(stop) {
        Ok(runtime) => runtime,
        Err(err) if stop() => {
            tracing::warn!(error = %err, "interrupted before the process group formed");
            let descriptor = trainer.write_requeue_descriptor()?;
            tracing::info!(descriptor = %descriptor.display(), "requeue without checkpoint");
            return Ok(EXIT_REQUEUE);
        }
        Err(err) => return Err(err),
    };

    match runtime.run(stop)? {
        RunOutcome::Completed(value) => {
            tracing::info!(value, "extraction complete");
            Ok(0)
        }
        RunOutcome::Interrupted => {
            runtime.requeue(!args.no_requeue)?;
            Ok(EXIT_REQUEUE)
        }
    }
}
