use burn::tensor::{backend::Backend, Tensor};

use super::{pred_original_from_alpha, SampleClipping, Scheduler, StepResult};
use crate::error::{DiffusionError, Result};
use crate::options::{GenerationOptions, PredictionType, SchedulerKind, VarianceType};
use crate::schedule::{inference_timesteps, NoiseSchedule};
use crate::tensor::NoiseGenerator;

/// Ancestral DDPM sampler.
#[derive(Debug, Clone)]
pub struct DdpmScheduler {
    schedule: NoiseSchedule,
    timesteps: Vec<usize>,
    step_ratio: usize,
    prediction: PredictionType,
    variance_type: VarianceType,
    clipping: SampleClipping,
    noise: NoiseGenerator,
}

/// Cumulative constants for one reverse transition.
#[derive(Debug, Clone, Copy)]
struct Transition {
    alpha_prod: f64,
    alpha_prod_prev: f64,
    current_beta: f64,
}

impl Transition {
    fn beta_prod(&self) -> f64 {
        1.0 - self.alpha_prod
    }

    fn beta_prod_prev(&self) -> f64 {
        1.0 - self.alpha_prod_prev
    }

    fn current_alpha(&self) -> f64 {
        1.0 - self.current_beta
    }

    /// Posterior variance, kept away from zero.
    fn variance(&self) -> f64 {
        (self.beta_prod_prev() / self.beta_prod() * self.current_beta).max(1e-20)
    }
}

impl DdpmScheduler {
    pub fn new(options: &GenerationOptions) -> Result<Self> {
        let schedule = NoiseSchedule::new(options)?;
        let timesteps = inference_timesteps(options);

        Ok(Self {
            schedule,
            timesteps,
            step_ratio: options.train_timesteps / options.inference_steps.max(1),
            prediction: options.prediction_type,
            variance_type: options.variance_type,
            clipping: SampleClipping::new(options),
            noise: NoiseGenerator::new(options.seed),
        })
    }

    /// Previous timestep, or `None` once the walk passes the start of the schedule.
    fn previous_timestep(&self, timestep: usize) -> Option<usize> {
        timestep.checked_sub(self.step_ratio)
    }

    fn transition(&self, timestep: usize) -> Transition {
        let alpha_prod = self.schedule.alpha_cumprod(timestep);
        let alpha_prod_prev = self
            .previous_timestep(timestep)
            .map(|t| self.schedule.alpha_cumprod(t))
            .unwrap_or(1.0);

        Transition {
            alpha_prod,
            alpha_prod_prev,
            current_beta: 1.0 - alpha_prod / alpha_prod_prev,
        }
    }

    /// Standard deviation of the injected noise, per element when the variance is learned.
    fn noise_scale<B: Backend>(&self, transition: &Transition, predicted_variance: Option<Tensor<B, 4>>) -> Result<NoiseScale<B>> {
        let variance = transition.variance();

        let scale = match self.variance_type {
            VarianceType::FixedSmall => NoiseScale::Scalar(variance.sqrt()),
            VarianceType::FixedSmallLog => NoiseScale::Scalar((0.5 * variance.ln()).exp()),
            VarianceType::FixedLarge => NoiseScale::Scalar(transition.current_beta.sqrt()),
            VarianceType::FixedLargeLog => NoiseScale::Scalar((0.5 * transition.current_beta.ln()).exp()),
            VarianceType::Learned => {
                let predicted = predicted_variance.ok_or(DiffusionError::MissingInput("learned variance channels"))?;
                NoiseScale::Tensor(predicted.clamp_min(1e-20).sqrt())
            }
            VarianceType::LearnedRange => {
                let predicted = predicted_variance.ok_or(DiffusionError::MissingInput("learned variance channels"))?;
                let min_log = variance.ln();
                let max_log = transition.current_beta.ln();
                let frac = (predicted + 1.0) * 0.5;
                let log_variance = frac.clone() * max_log + (frac.neg() + 1.0) * min_log;
                NoiseScale::Tensor((log_variance * 0.5).exp())
            }
        };

        Ok(scale)
    }

    /// Separates the predicted variance channels from a channel-doubled output.
    fn split_output<B: Backend>(&self, model_output: Tensor<B, 4>, sample: &Tensor<B, 4>) -> Result<(Tensor<B, 4>, Option<Tensor<B, 4>>)> {
        let out_dims = model_output.dims();
        let sample_dims = sample.dims();

        if !self.variance_type.is_learned() {
            return Ok((model_output, None));
        }

        if out_dims[1] != sample_dims[1] * 2 {
            let mut expected = sample_dims;
            expected[1] *= 2;
            return Err(DiffusionError::shape_mismatch("learned variance output", &expected, &out_dims));
        }

        let [b, c, h, w] = sample_dims;
        let prediction = model_output.clone().slice([0..b, 0..c, 0..h, 0..w]);
        let variance = model_output.slice([0..b, c..2 * c, 0..h, 0..w]);

        Ok((prediction, Some(variance)))
    }
}

enum NoiseScale<B: Backend> {
    Scalar(f64),
    Tensor(Tensor<B, 4>),
}

impl<B: Backend> Scheduler<B> for DdpmScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Ddpm
    }

    fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn init_noise_sigma(&self) -> f64 {
        1.0
    }

    fn step(&mut self, model_output: Tensor<B, 4>, timestep: usize, sample: Tensor<B, 4>) -> Result<StepResult<B>> {
        let (model_output, predicted_variance) = self.split_output(model_output, &sample)?;
        let transition = self.transition(timestep);

        let pred_original = pred_original_from_alpha(model_output, sample.clone(), transition.alpha_prod, self.prediction);
        let pred_original = self.clipping.apply(pred_original);

        let original_coeff = transition.alpha_prod_prev.sqrt() * transition.current_beta / transition.beta_prod();
        let sample_coeff = transition.current_alpha().sqrt() * transition.beta_prod_prev() / transition.beta_prod();

        let mut prev_sample = pred_original.clone() * original_coeff + sample.clone() * sample_coeff;

        if timestep > 0 {
            let noise = self.noise.sample::<B, 4>(sample.dims(), 1.0, &sample.device());
            prev_sample = match self.noise_scale(&transition, predicted_variance)? {
                NoiseScale::Scalar(std) => prev_sample + noise * std,
                NoiseScale::Tensor(std) => prev_sample + noise * std,
            };
        }

        Ok(StepResult {
            prev_sample,
            pred_original,
        })
    }

    fn add_noise(&self, original: Tensor<B, 4>, noise: Tensor<B, 4>, timestep: usize) -> Tensor<B, 4> {
        let alpha_prod = self.schedule.alpha_cumprod(timestep);
        original * alpha_prod.sqrt() + noise * (1.0 - alpha_prod).sqrt()
    }

    fn noise_generator(&mut self) -> &mut NoiseGenerator {
        &mut self.noise
    }
}
