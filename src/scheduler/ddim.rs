use burn::tensor::{backend::Backend, Tensor};

use super::{pred_original_from_alpha, SampleClipping, Scheduler, StepResult};
use crate::error::Result;
use crate::options::{GenerationOptions, PredictionType, SchedulerKind};
use crate::schedule::{inference_timesteps, NoiseSchedule};
use crate::tensor::NoiseGenerator;

#[derive(Debug, Clone)]
pub struct DdimScheduler {
    schedule: NoiseSchedule,
    timesteps: Vec<usize>,
    step_ratio: usize,
    final_alpha_cumprod: f64,
    eta: f64,
    prediction: PredictionType,
    clipping: SampleClipping,
    noise: NoiseGenerator,
}

impl DdimScheduler {
    pub fn new(options: &GenerationOptions) -> Result<Self> {
        let schedule = NoiseSchedule::new(options)?;
        let timesteps = inference_timesteps(options);

        Ok(Self {
            schedule,
            timesteps,
            step_ratio: options.train_timesteps / options.inference_steps.max(1),
            final_alpha_cumprod: 1.0,
            eta: options.eta,
            prediction: options.prediction_type,
            clipping: SampleClipping::new(options),
            noise: NoiseGenerator::new(options.seed),
        })
    }

    fn alpha_prod_prev(&self, timestep: usize) -> f64 {
        timestep
            .checked_sub(self.step_ratio)
            .map(|t| self.schedule.alpha_cumprod(t))
            .unwrap_or(self.final_alpha_cumprod)
    }

    /// `sigma_t(eta)` before scaling by eta.
    fn variance(&self, alpha_prod: f64, alpha_prod_prev: f64) -> f64 {
        (1.0 - alpha_prod_prev) / (1.0 - alpha_prod) * (1.0 - alpha_prod / alpha_prod_prev)
    }
}

impl<B: Backend> Scheduler<B> for DdimScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Ddim
    }

    fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn init_noise_sigma(&self) -> f64 {
        1.0
    }

    fn step(&mut self, model_output: Tensor<B, 4>, timestep: usize, sample: Tensor<B, 4>) -> Result<StepResult<B>> {
        let alpha_prod = self.schedule.alpha_cumprod(timestep);
        let alpha_prod_prev = self.alpha_prod_prev(timestep);
        let beta_prod = 1.0 - alpha_prod;

        let pred_original = pred_original_from_alpha(model_output.clone(), sample.clone(), alpha_prod, self.prediction);
        let pred_epsilon = match self.prediction {
            PredictionType::Epsilon => model_output,
            PredictionType::Sample => (sample.clone() - pred_original.clone() * alpha_prod.sqrt()).div_scalar(beta_prod.sqrt()),
            PredictionType::VariablePrediction => model_output * alpha_prod.sqrt() + sample.clone() * beta_prod.sqrt(),
        };

        let pred_original = self.clipping.apply(pred_original);

        let std_dev = self.eta * self.variance(alpha_prod, alpha_prod_prev).max(0.0).sqrt();
        let direction = pred_epsilon * (1.0 - alpha_prod_prev - std_dev * std_dev).max(0.0).sqrt();
        let mut prev_sample = pred_original.clone() * alpha_prod_prev.sqrt() + direction;

        if self.eta > 0.0 {
            let noise = self.noise.sample::<B, 4>(sample.dims(), 1.0, &sample.device());
            prev_sample = prev_sample + noise * std_dev;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{from_vec, to_vec};
    use crate::testing::{assert_approx_eq, TestBackend, DEVICE};

    fn oracle_run(prediction: PredictionType) -> Vec<f32> {
        let options = GenerationOptions::new()
            .with_inference_steps(10)
            .with_prediction_type(prediction)
            .with_seed(Some(1));
        let mut scheduler = DdimScheduler::new(&options).unwrap();

        let x0 = from_vec::<TestBackend, 4>(vec![0.3, -0.6, 0.9, 0.0], [1, 1, 2, 2], &DEVICE);
        let noise = from_vec::<TestBackend, 4>(vec![0.5, 1.5, -1.0, 0.25], [1, 1, 2, 2], &DEVICE);
        let timesteps = scheduler.timesteps.clone();
        let mut latent = Scheduler::<TestBackend>::add_noise(&scheduler, x0.clone(), noise.clone(), timesteps[0]);

        for t in timesteps {
            let alpha = scheduler.schedule.alpha_cumprod(t);
            let eps = (latent.clone() - x0.clone() * alpha.sqrt()).div_scalar((1.0 - alpha).sqrt());
            let output = match prediction {
                PredictionType::Epsilon => eps,
                PredictionType::Sample => x0.clone(),
                PredictionType::VariablePrediction => eps * alpha.sqrt() - x0.clone() * (1.0 - alpha).sqrt(),
            };
            latent = scheduler.step(output, t, latent).unwrap().prev_sample;
        }

        to_vec(latent)
    }

    #[test]
    fn deterministic_walk_recovers_the_clean_sample() {
        let expected = [0.3, -0.6, 0.9, 0.0];

        assert_approx_eq(&oracle_run(PredictionType::Epsilon), &expected, 1e-3);
        assert_approx_eq(&oracle_run(PredictionType::Sample), &expected, 1e-3);
        assert_approx_eq(&oracle_run(PredictionType::VariablePrediction), &expected, 1e-3);
    }

    #[test]
    fn zero_eta_is_deterministic() {
        assert_eq!(oracle_run(PredictionType::Epsilon), oracle_run(PredictionType::Epsilon));
    }
}
