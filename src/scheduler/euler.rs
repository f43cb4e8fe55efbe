use burn::tensor::{backend::Backend, Tensor};

use super::{pred_original_from_sigma, Scheduler, StepIndex, StepResult};
use crate::error::Result;
use crate::options::{GenerationOptions, PredictionType, SchedulerKind};
use crate::schedule::{NoiseSchedule, SigmaSchedule};
use crate::tensor::NoiseGenerator;

// Churn parameters held at their neutral values, so gamma is always zero.
const S_CHURN: f64 = 0.0;
const S_TMIN: f64 = 0.0;
const S_TMAX: f64 = f64::INFINITY;
const S_NOISE: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct EulerScheduler {
    timesteps: Vec<usize>,
    sigmas: Vec<f64>,
    init_noise_sigma: f64,
    prediction: PredictionType,
    step_index: StepIndex,
    noise: NoiseGenerator,
}

impl EulerScheduler {
    pub fn new(options: &GenerationOptions) -> Result<Self> {
        let schedule = NoiseSchedule::new(options)?;
        let SigmaSchedule {
            timesteps,
            sigmas,
            init_noise_sigma,
        } = SigmaSchedule::new(&schedule, options);

        Ok(Self {
            timesteps,
            sigmas,
            init_noise_sigma,
            prediction: options.prediction_type,
            step_index: StepIndex::default(),
            noise: NoiseGenerator::new(options.seed),
        })
    }

    fn gamma(&self, sigma: f64) -> f64 {
        if S_TMIN <= sigma && sigma <= S_TMAX {
            (S_CHURN / (self.sigmas.len() as f64 - 1.0)).min(2f64.sqrt() - 1.0)
        } else {
            0.0
        }
    }
}

impl<B: Backend> Scheduler<B> for EulerScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Euler
    }

    fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn init_noise_sigma(&self) -> f64 {
        self.init_noise_sigma
    }

    fn input_scale(&self, timestep: usize) -> f64 {
        let sigma = self.sigmas[self.step_index.resolve(&self.timesteps, timestep)];
        (sigma * sigma + 1.0).sqrt()
    }

    fn sigmas(&self) -> Option<&[f64]> {
        Some(&self.sigmas)
    }

    fn step(&mut self, model_output: Tensor<B, 4>, timestep: usize, sample: Tensor<B, 4>) -> Result<StepResult<B>> {
        let index = self.step_index.resolve(&self.timesteps, timestep);
        let sigma = self.sigmas[index];

        let gamma = self.gamma(sigma);
        let sigma_hat = sigma * (1.0 + gamma);

        let sample = if gamma > 0.0 {
            let eps = self.noise.sample(sample.dims(), S_NOISE, &sample.device());
            sample + eps * (sigma_hat * sigma_hat - sigma * sigma).sqrt()
        } else {
            sample
        };

        let pred_original = match self.prediction {
            PredictionType::Epsilon => sample.clone() - model_output * sigma_hat,
            other => pred_original_from_sigma(model_output, sample.clone(), sigma, other),
        };

        let derivative = (sample.clone() - pred_original.clone()).div_scalar(sigma_hat);
        let dt = self.sigmas[index + 1] - sigma_hat;
        let prev_sample = sample + derivative * dt;

        self.step_index.advance(index);

        Ok(StepResult {
            prev_sample,
            pred_original,
        })
    }

    fn add_noise(&self, original: Tensor<B, 4>, noise: Tensor<B, 4>, timestep: usize) -> Tensor<B, 4> {
        let sigma = self.sigmas[super::index_of(&self.timesteps, timestep)];
        original + noise * sigma
    }

    fn noise_generator(&mut self) -> &mut NoiseGenerator {
        &mut self.noise
    }
}
