use std::error::Error;
use std::path::PathBuf;

use burn::config::Config;
use structopt::StructOpt;
use tracing::info;
use tracing_subscriber::EnvFilter;

use latent_diffusion::backend::Backend;
use latent_diffusion::load::{load_trained_betas, save_values};
use latent_diffusion::options::{PipelineKind, SchedulerKind};
use latent_diffusion::scheduler::build_scheduler;
use latent_diffusion::GenerationOptions;

/// Prints the timesteps and sigmas a scheduler walks for the given options.
#[derive(Debug, StructOpt)]
struct Opts {
    #[structopt(short = "s", long, default_value = "euler-ancestral")]
    scheduler: SchedulerKind,

    #[structopt(short = "p", long, default_value = "sd")]
    pipeline: PipelineKind,

    #[structopt(long, default_value = "30")]
    steps: usize,

    /// Comma separated explicit timesteps, descending
    #[structopt(long, use_delimiter = true)]
    timesteps: Vec<usize>,

    /// npy file holding one beta per training timestep
    #[structopt(parse(from_os_str), long)]
    trained_betas: Option<PathBuf>,

    /// JSON generation options, overridden by the flags above
    #[structopt(parse(from_os_str), long)]
    config: Option<PathBuf>,

    /// Writes timesteps.npy and sigmas.npy into this directory
    #[structopt(parse(from_os_str), long)]
    dump_dir: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let opts = Opts::from_args();

    let base = match &opts.config {
        Some(path) => GenerationOptions::load(path)?,
        None => GenerationOptions::new(),
    };
    let trained_betas = match &opts.trained_betas {
        Some(path) => Some(load_trained_betas(path, base.train_timesteps)?),
        None => base.trained_betas.clone(),
    };

    let options = base
        .with_scheduler(opts.scheduler)
        .with_inference_steps(opts.steps)
        .with_timesteps(opts.timesteps)
        .with_trained_betas(trained_betas);

    let scheduler = build_scheduler::<Backend>(&options, opts.pipeline)?;
    info!("Built {:?} for {:?}", scheduler.kind(), opts.pipeline);

    let timesteps = scheduler.timesteps();
    println!("timesteps ({}): {:?}", timesteps.len(), timesteps);
    if let Some(sigmas) = scheduler.sigmas() {
        println!("sigmas ({}): {:?}", sigmas.len(), sigmas);
    }
    println!("init noise sigma: {}", scheduler.init_noise_sigma());

    if let Some(dir) = &opts.dump_dir {
        std::fs::create_dir_all(dir)?;
        let timesteps: Vec<f64> = timesteps.iter().map(|&t| t as f64).collect();
        save_values(dir.join("timesteps.npy"), &timesteps)?;
        if let Some(sigmas) = scheduler.sigmas() {
            save_values(dir.join("sigmas.npy"), sigmas)?;
        }
        println!("Saved to {}", dir.display());
    }

    Ok(())
}
