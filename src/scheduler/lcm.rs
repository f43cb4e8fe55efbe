use burn::tensor::{backend::Backend, Tensor};

use super::{index_of, pred_original_from_alpha, Scheduler, StepResult};
use crate::error::{DiffusionError, Result};
use crate::options::{GenerationOptions, PredictionType, SchedulerKind};
use crate::schedule::{linspace, NoiseSchedule};
use crate::tensor::{from_vec, NoiseGenerator};

const SIGMA_DATA: f64 = 0.5;
const TIMESTEP_SCALING: f64 = 10.0;
const GUIDANCE_EMBEDDING_DIM: usize = 256;

/// Latent consistency sampler. Each step maps straight to a denoised estimate, then re-noises
/// it to the next timestep of a coarse schedule drawn from the distillation schedule.
#[derive(Debug, Clone)]
pub struct LcmScheduler {
    schedule: NoiseSchedule,
    timesteps: Vec<usize>,
    prediction: PredictionType,
    /// Frames sharing one noise pattern; `Some` for the motion-module variant.
    context_size: Option<usize>,
    noise: NoiseGenerator,
}

impl LcmScheduler {
    pub fn new(options: &GenerationOptions) -> Result<Self> {
        let schedule = NoiseSchedule::new(options)?;
        let timesteps = if options.timesteps.is_empty() {
            lcm_timesteps(options.train_timesteps, options.original_inference_steps, options.inference_steps)?
        } else {
            let mut timesteps = options.timesteps.clone();
            timesteps.sort_unstable_by(|a, b| b.cmp(a));
            timesteps
        };

        Ok(Self {
            schedule,
            timesteps,
            prediction: options.prediction_type,
            context_size: None,
            noise: NoiseGenerator::new(options.seed),
        })
    }

    /// Consistency sampling for video: random samples repeat one noise pattern every
    /// `context_size` frames along the leading axis.
    pub fn locomotion(options: &GenerationOptions) -> Result<Self> {
        if options.context_size == 0 {
            return Err(DiffusionError::config("context size must be positive"));
        }

        Ok(Self {
            context_size: Some(options.context_size),
            ..Self::new(options)?
        })
    }

    /// `(c_skip, c_out)` boundary scalings at `timestep`.
    pub fn boundary_scalings(timestep: usize) -> (f64, f64) {
        let scaled = TIMESTEP_SCALING * timestep as f64;
        let c = scaled * scaled + SIGMA_DATA * SIGMA_DATA;

        (SIGMA_DATA * SIGMA_DATA / c, scaled / c.sqrt())
    }
}

/// Evenly spaced picks from the `original_steps`-long distillation schedule, descending.
pub fn lcm_timesteps(train_timesteps: usize, original_steps: usize, steps: usize) -> Result<Vec<usize>> {
    if original_steps == 0 || original_steps > train_timesteps {
        return Err(DiffusionError::config(format!(
            "original inference steps must be in 1..={}, got {}",
            train_timesteps, original_steps
        )));
    }

    let increment = train_timesteps / original_steps;
    let origin: Vec<usize> = (1..=original_steps).map(|i| i * increment - 1).collect();

    let mut timesteps: Vec<usize> = linspace(0.0, (origin.len() - 1) as f64, steps)
        .into_iter()
        .map(|x| origin[(x.floor() as usize).min(origin.len() - 1)])
        .collect();
    timesteps.sort_unstable_by(|a, b| b.cmp(a));

    Ok(timesteps)
}

/// Sinusoidal embedding of the guidance scale for guidance-distilled denoisers, `[1, 256]`.
pub fn guidance_embedding<B: Backend>(guidance_scale: f64, device: &B::Device) -> Tensor<B, 2> {
    let half = GUIDANCE_EMBEDDING_DIM / 2;
    let w = (guidance_scale - 1.0) * 1000.0;
    let log = 10000f64.ln() / (half - 1) as f64;

    let emb: Vec<f64> = (0..half).map(|i| w * (-log * i as f64).exp()).collect();
    let values = emb
        .iter()
        .map(|v| v.sin())
        .chain(emb.iter().map(|v| v.cos()))
        .map(|v| v as f32)
        .collect();

    from_vec(values, [1, GUIDANCE_EMBEDDING_DIM], device)
}

impl<B: Backend> Scheduler<B> for LcmScheduler {
    fn kind(&self) -> SchedulerKind {
        if self.context_size.is_some() {
            SchedulerKind::Locomotion
        } else {
            SchedulerKind::Lcm
        }
    }

    fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn init_noise_sigma(&self) -> f64 {
        1.0
    }

    fn step(&mut self, model_output: Tensor<B, 4>, timestep: usize, sample: Tensor<B, 4>) -> Result<StepResult<B>> {
        let index = index_of(&self.timesteps, timestep);
        let prev_timestep = self.timesteps.get(index + 1).copied().unwrap_or(timestep);

        let alpha_prod = self.schedule.alpha_cumprod(timestep);
        let alpha_prod_prev = self.schedule.alpha_cumprod(prev_timestep);
        let (c_skip, c_out) = Self::boundary_scalings(timestep);

        let pred_original = pred_original_from_alpha(model_output, sample.clone(), alpha_prod, self.prediction);
        let denoised = sample.clone() * c_skip + pred_original * c_out;

        // no noise on the final step, which also covers single-step sampling
        let prev_sample = if index + 1 < self.timesteps.len() {
            let noise = self.noise.sample::<B, 4>(sample.dims(), 1.0, &sample.device());
            noise * (1.0 - alpha_prod_prev).sqrt() + denoised.clone() * alpha_prod_prev.sqrt()
        } else {
            denoised.clone()
        };

        Ok(StepResult {
            prev_sample,
            pred_original: denoised,
        })
    }

    fn add_noise(&self, original: Tensor<B, 4>, noise: Tensor<B, 4>, timestep: usize) -> Tensor<B, 4> {
        let alpha_prod = self.schedule.alpha_cumprod(timestep);
        original * alpha_prod.sqrt() + noise * (1.0 - alpha_prod).sqrt()
    }

    fn noise_generator(&mut self) -> &mut NoiseGenerator {
        &mut self.noise
    }

    fn create_random_sample(&mut self, dims: [usize; 4], sigma: f64, device: &B::Device) -> Tensor<B, 4> {
        let frames = dims[0];
        match self.context_size {
            Some(context) if frames > context => {
                let pattern: Tensor<B, 4> = self.noise.sample([context, dims[1], dims[2], dims[3]], sigma, device);
                let repeats = frames.div_ceil(context);
                let tiled = Tensor::cat(vec![pattern; repeats], 0);
                tiled.slice([0..frames, 0..dims[1], 0..dims[2], 0..dims[3]])
            }
            _ => self.noise.sample(dims, sigma, device),
        }
    }
}
