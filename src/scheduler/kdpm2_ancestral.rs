use burn::tensor::{backend::Backend, Tensor};

use super::euler_ancestral::ancestral_sigmas;
use super::kdpm2::interleave;
use super::{index_of, pred_original_from_sigma, Scheduler, StepIndex, StepResult};
use crate::error::Result;
use crate::options::{GenerationOptions, PredictionType, SchedulerKind, TimestepSpacing};
use crate::schedule::{sigma_to_timestep, NoiseSchedule, SigmaSchedule};
use crate::tensor::NoiseGenerator;

/// Ancestral variant of [`Kdpm2Scheduler`](super::Kdpm2Scheduler). Always spaces timesteps from the end
/// of the schedule so the final step lands on a zero sigma.
#[derive(Debug)]
pub struct Kdpm2AncestralScheduler<B: Backend> {
    timesteps: Vec<usize>,
    sigmas: Vec<f64>,
    sigmas_interpol: Vec<f64>,
    sigmas_up: Vec<f64>,
    sigmas_down: Vec<f64>,
    init_noise_sigma: f64,
    prediction: PredictionType,
    stored_sample: Option<Tensor<B, 4>>,
    step_index: StepIndex,
    noise: NoiseGenerator,
}

impl<B: Backend> Kdpm2AncestralScheduler<B> {
    pub fn new(options: &GenerationOptions) -> Result<Self> {
        let schedule = NoiseSchedule::new(options)?;
        let base = SigmaSchedule::with_spacing(&schedule, options, TimestepSpacing::Trailing);
        let log_sigmas = schedule.log_sigmas();
        let sigmas = &base.sigmas;
        let count = base.timesteps.len();

        let mut sigmas_up = Vec::with_capacity(sigmas.len());
        let mut sigmas_down = Vec::with_capacity(sigmas.len());
        for (i, &sigma) in sigmas.iter().enumerate() {
            let next = sigmas.get(i + 1).copied().unwrap_or(0.0);
            let (down, up) = ancestral_sigmas(sigma, next);
            sigmas_down.push(down);
            sigmas_up.push(up);
        }

        let mut interpol: Vec<f64> = sigmas.iter().zip(&sigmas_down).map(|(s, d)| (s * d).max(0.0).sqrt()).collect();
        let len = interpol.len();
        for value in interpol.iter_mut().skip(len.saturating_sub(2)) {
            *value = 0.0;
        }

        let mut timesteps = Vec::with_capacity(count * 2);
        for (i, &t) in base.timesteps.iter().enumerate() {
            timesteps.push(t);
            if i + 1 < count {
                timesteps.push(sigma_to_timestep(interpol[i], &log_sigmas).round() as usize);
            }
        }

        Ok(Self {
            timesteps,
            sigmas: interleave(sigmas),
            sigmas_interpol: interleave(&interpol),
            sigmas_up: interleave(&sigmas_up),
            sigmas_down: interleave(&sigmas_down),
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

impl<B: Backend> Scheduler<B> for Kdpm2AncestralScheduler<B> {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Kdpm2Ancestral
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
            self.sigmas_interpol[index.saturating_sub(1)]
        };

        (sigma * sigma + 1.0).sqrt()
    }

    fn sigmas(&self) -> Option<&[f64]> {
        Some(&self.sigmas)
    }

    fn step(&mut self, model_output: Tensor<B, 4>, timestep: usize, sample: Tensor<B, 4>) -> Result<StepResult<B>> {
        let index = self.step_index.resolve(&self.timesteps, timestep);

        let (prev_sample, pred_original) = match self.stored_sample.take() {
            None => {
                let sigma = self.sigmas[index];
                let sigma_interpol = self.sigmas_interpol[index];
                let pred_original = pred_original_from_sigma(model_output, sample.clone(), sigma, self.prediction);

                let derivative = (sample.clone() - pred_original.clone()).div_scalar(sigma);
                self.stored_sample = Some(sample.clone());
                (sample + derivative * (sigma_interpol - sigma), pred_original)
            }
            Some(stored) => {
                let previous = index.saturating_sub(1);
                let sigma = self.sigmas[previous];
                let sigma_interpol = self.sigmas_interpol[previous];
                let sigma_up = self.sigmas_up[previous];
                let sigma_down = self.sigmas_down[previous];
                let pred_original = pred_original_from_sigma(model_output, sample.clone(), sigma_interpol, self.prediction);

                let derivative = (sample.clone() - pred_original.clone()).div_scalar(sigma_interpol);
                let noise = self.noise.sample::<B, 4>(sample.dims(), 1.0, &sample.device());
                (stored + derivative * (sigma_down - sigma) + noise * sigma_up, pred_original)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{from_vec, to_vec};
    use crate::testing::{assert_approx_eq, TestBackend, DEVICE};

    fn scheduler(steps: usize) -> Kdpm2AncestralScheduler<TestBackend> {
        Kdpm2AncestralScheduler::new(&GenerationOptions::new().with_inference_steps(steps).with_seed(Some(9))).unwrap()
    }

    #[test]
    fn uses_trailing_spacing_with_midpoints() {
        let scheduler = scheduler(4);

        // three midpoints between four base timesteps
        assert_eq!(scheduler.timesteps.len(), 7);
        assert_eq!(scheduler.timesteps[0], 999);
        assert!(scheduler.timesteps.windows(2).all(|w| w[0] >= w[1]));
        assert_eq!(scheduler.sigmas_up.last().copied(), Some(0.0));
    }

    #[test]
    fn up_and_down_split_the_next_sigma() {
        let scheduler = scheduler(6);

        for i in (1..scheduler.sigmas.len() - 2).step_by(2) {
            // odd positions start a doubled pair, so the following sigma sits two places on
            let next = scheduler.sigmas[i + 2];
            let (up, down) = (scheduler.sigmas_up[i], scheduler.sigmas_down[i]);
            assert!((up * up + down * down - next * next).abs() < 1e-9, "index {}", i);
        }
    }

    #[test]
    fn oracle_walk_recovers_the_clean_sample() {
        let mut scheduler = scheduler(8);
        let x0 = from_vec::<TestBackend, 4>(vec![0.2, -0.7, 0.4, 0.9], [1, 1, 2, 2], &DEVICE);
        let noise = from_vec::<TestBackend, 4>(vec![0.5, 1.0, -1.5, 0.0], [1, 1, 2, 2], &DEVICE);

        let timesteps = scheduler.timesteps.clone();
        let mut latent = Scheduler::<TestBackend>::add_noise(&scheduler, x0.clone(), noise, timesteps[0]);

        for t in timesteps {
            let index = scheduler.step_index.resolve(&scheduler.timesteps, t);
            let sigma = if scheduler.in_first_order() {
                scheduler.sigmas[index]
            } else {
                scheduler.sigmas_interpol[index - 1]
            };
            let eps = (latent.clone() - x0.clone()).div_scalar(sigma);
            latent = scheduler.step(eps, t, latent).unwrap().prev_sample;
        }

        // the last first-order pass moves straight to a zero midpoint sigma
        assert_approx_eq(&to_vec(latent), &to_vec(x0), 1e-3);
    }
}
