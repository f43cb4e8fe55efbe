use burn::tensor::{backend::Backend, Tensor};

use super::{index_of, Scheduler, StepIndex, StepResult};
use crate::error::Result;
use crate::options::{GenerationOptions, SchedulerKind};
use crate::schedule::linspace;
use crate::tensor::NoiseGenerator;

const BASE_IMAGE_SEQ_LEN: f64 = 256.0;
const MAX_IMAGE_SEQ_LEN: f64 = 4096.0;
const BASE_SHIFT: f64 = 0.5;
const MAX_SHIFT: f64 = 1.15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowMatchVariant {
    /// Deterministic Euler update along the velocity field.
    Discrete,
    /// Re-noises the predicted clean sample to the next sigma.
    Dynamic,
}

/// Resolution-dependent shift: `mu` interpolated linearly between the base and max
/// sequence lengths, returned as `exp(mu)`.
pub fn dynamic_shift(image_seq_len: usize) -> f64 {
    let slope = (MAX_SHIFT - BASE_SHIFT) / (MAX_IMAGE_SEQ_LEN - BASE_IMAGE_SEQ_LEN);
    let intercept = BASE_SHIFT - slope * BASE_IMAGE_SEQ_LEN;
    let mu = image_seq_len as f64 * slope + intercept;

    mu.exp()
}

fn shift_sigma(sigma: f64, shift: f64) -> f64 {
    shift * sigma / (1.0 + (shift - 1.0) * sigma)
}

/// Rectified-flow Euler sampler: sigma is the interpolation weight between data and noise.
#[derive(Debug, Clone)]
pub struct FlowMatchScheduler {
    variant: FlowMatchVariant,
    timesteps: Vec<usize>,
    sigmas: Vec<f64>,
    step_index: StepIndex,
    noise: NoiseGenerator,
}

impl FlowMatchScheduler {
    pub fn new(options: &GenerationOptions, variant: FlowMatchVariant) -> Self {
        let train = options.train_timesteps.max(1) as f64;
        let shift = options.shift;

        let sigma_min = shift_sigma(1.0 / train, shift);
        let sigma_max = shift_sigma(1.0, shift);

        let positions = if options.inference_steps == 1 {
            vec![train]
        } else {
            linspace(sigma_max * train, sigma_min * train, options.inference_steps)
        };

        let mut sigmas: Vec<f64> = positions.iter().map(|t| shift_sigma(t / train, shift)).collect();
        let timesteps = sigmas.iter().map(|s| (s * train).round() as usize).collect();
        sigmas.push(0.0);

        Self {
            variant,
            timesteps,
            sigmas,
            step_index: StepIndex::default(),
            noise: NoiseGenerator::new(options.seed),
        }
    }
}

impl<B: Backend> Scheduler<B> for FlowMatchScheduler {
    fn kind(&self) -> SchedulerKind {
        match self.variant {
            FlowMatchVariant::Discrete => SchedulerKind::FlowMatchEulerDiscrete,
            FlowMatchVariant::Dynamic => SchedulerKind::FlowMatchEulerDynamic,
        }
    }

    fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn init_noise_sigma(&self) -> f64 {
        1.0
    }

    fn sigmas(&self) -> Option<&[f64]> {
        Some(&self.sigmas)
    }

    fn step(&mut self, model_output: Tensor<B, 4>, timestep: usize, sample: Tensor<B, 4>) -> Result<StepResult<B>> {
        let index = self.step_index.resolve(&self.timesteps, timestep);
        let sigma = self.sigmas[index];
        let sigma_next = self.sigmas[index + 1];

        let pred_original = sample.clone() - model_output.clone() * sigma;
        let prev_sample = match self.variant {
            FlowMatchVariant::Discrete => sample + model_output * (sigma_next - sigma),
            FlowMatchVariant::Dynamic => {
                let noise = self.noise.sample::<B, 4>(sample.dims(), 1.0, &sample.device());
                noise * sigma_next + pred_original.clone() * (1.0 - sigma_next)
            }
        };

        self.step_index.advance(index);

        Ok(StepResult {
            prev_sample,
            pred_original,
        })
    }

    fn add_noise(&self, original: Tensor<B, 4>, noise: Tensor<B, 4>, timestep: usize) -> Tensor<B, 4> {
        let sigma = self.sigmas[index_of(&self.timesteps, timestep)];
        noise * sigma + original * (1.0 - sigma)
    }

    fn noise_generator(&mut self) -> &mut NoiseGenerator {
        &mut self.noise
    }
}
