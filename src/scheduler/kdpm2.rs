use burn::tensor::{backend::Backend, Tensor};

use super::{index_of, pred_original_from_sigma, Scheduler, StepIndex, StepResult};
use crate::error::Result;
use crate::options::{GenerationOptions, PredictionType, SchedulerKind};
use crate::schedule::{sigma_to_timestep, NoiseSchedule, SigmaSchedule};
use crate::tensor::NoiseGenerator;

/// `[a0, a1, a1, a2, a2, ..., an, an, an]`: every entry after the first doubled, last repeated.
pub fn interleave(values: &[f64]) -> Vec<f64> {
    let Some((&first, rest)) = values.split_first() else {
        return vec![];
    };

    let mut out = Vec::with_capacity(values.len() * 2);
    out.push(first);
    for &value in rest {
        out.push(value);
        out.push(value);
    }
    out.push(*values.last().unwrap_or(&first));
    out
}

/// Second-order DPM sampler in the style of k-diffusion: a first-order move to a midpoint
/// sigma, then a correction evaluated at that midpoint.
#[derive(Debug)]
pub struct Kdpm2Scheduler<B: Backend> {
    timesteps: Vec<usize>,
    sigmas: Vec<f64>,
    sigmas_interpol: Vec<f64>,
    init_noise_sigma: f64,
    prediction: PredictionType,
    stored_sample: Option<Tensor<B, 4>>,
    step_index: StepIndex,
    noise: NoiseGenerator,
}

impl<B: Backend> Kdpm2Scheduler<B> {
    pub fn new(options: &GenerationOptions) -> Result<Self> {
        let schedule = NoiseSchedule::new(options)?;
        let base = SigmaSchedule::new(&schedule, options);
        let log_sigmas = schedule.log_sigmas();
        let count = base.timesteps.len();

        // geometric midpoint between each sigma and its predecessor
        let mut interpol = Vec::with_capacity(base.sigmas.len());
        interpol.push(base.sigmas[0]);
        for i in 1..base.sigmas.len() {
            interpol.push((base.sigmas[i] * base.sigmas[i - 1]).sqrt());
        }

        let mut timesteps = Vec::with_capacity(count * 2);
        timesteps.push(base.timesteps[0]);
        for i in 1..count {
            timesteps.push(sigma_to_timestep(interpol[i], &log_sigmas).round() as usize);
            timesteps.push(base.timesteps[i]);
        }

        Ok(Self {
            timesteps,
            sigmas: interleave(&base.sigmas),
            sigmas_interpol: interleave(&interpol),
            init_noise_sigma: base.init_noise_sigma,
            prediction: options.prediction_type,
            stored_sample: None,
            step_index: StepIndex::default(),
            noise: NoiseGenerator::new(options.seed),
        })
    }

    fn in_first_order(&self) -> bool {
        self.stored_sample.is_none()
    }
}

impl<B: Backend> Scheduler<B> for Kdpm2Scheduler<B> {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Kdpm2
    }

    fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn init_noise_sigma(&self) -> f64 {
        self.init_noise_sigma
    }

    fn input_scale(&self, timestep: usize) -> f64 {
        let index = self.step_index.resolve(&self.timesteps, timestep);
        let sigma = if self.in_first_order() {
            self.sigmas[index]
        } else {
            self.sigmas_interpol[index]
        };

        (sigma * sigma + 1.0).sqrt()
    }

    fn sigmas(&self) -> Option<&[f64]> {
        Some(&self.sigmas)
    }

    fn step(&mut self, model_output: Tensor<B, 4>, timestep: usize, sample: Tensor<B, 4>) -> Result<StepResult<B>> {
        let index = self.step_index.resolve(&self.timesteps, timestep);

        let (sigma, sigma_interpol, sigma_next) = if self.in_first_order() {
            (self.sigmas[index], self.sigmas_interpol[index + 1], self.sigmas[index + 1])
        } else {
            (self.sigmas[index - 1], self.sigmas_interpol[index], self.sigmas[index])
        };

        let sigma_hat = sigma;
        let sigma_input = if self.in_first_order() { sigma_hat } else { sigma_interpol };
        let pred_original = pred_original_from_sigma(model_output, sample.clone(), sigma_input, self.prediction);

        let prev_sample = match self.stored_sample.take() {
            None => {
                let derivative = (sample.clone() - pred_original.clone()).div_scalar(sigma_hat);
                self.stored_sample = Some(sample.clone());
                sample + derivative * (sigma_interpol - sigma_hat)
            }
            Some(stored) => {
                let derivative = (sample - pred_original.clone()).div_scalar(sigma_interpol);
                stored + derivative * (sigma_next - sigma_hat)
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
        original + noise * sigma
    }

    fn noise_generator(&mut self) -> &mut NoiseGenerator {
        &mut self.noise
    }
}
