use std::collections::VecDeque;

use burn::tensor::{backend::Backend, Tensor};

use super::{index_of, pred_original_from_sigma, Scheduler, StepIndex, StepResult};
use crate::error::Result;
use crate::options::{GenerationOptions, PredictionType, SchedulerKind};
use crate::schedule::{NoiseSchedule, SigmaSchedule};
use crate::tensor::NoiseGenerator;

const MAX_DEPTH: usize = 48;

/// Adaptive Simpson quadrature of `f` over `[a, b]`.
pub fn integrate<F: Fn(f64) -> f64>(f: F, a: f64, b: f64, epsilon: f64) -> f64 {
    let c = (a + b) / 2.0;
    let (fa, fb, fc) = (f(a), f(b), f(c));
    let whole = (b - a) / 6.0 * (fa + 4.0 * fc + fb);

    simpson_aux(&f, a, b, epsilon, whole, fa, fb, fc, MAX_DEPTH)
}

#[allow(clippy::too_many_arguments)]
fn simpson_aux<F: Fn(f64) -> f64>(
    f: &F,
    a: f64,
    b: f64,
    epsilon: f64,
    whole: f64,
    fa: f64,
    fb: f64,
    fc: f64,
    depth: usize,
) -> f64 {
    let c = (a + b) / 2.0;
    let h = b - a;
    let d = (a + c) / 2.0;
    let e = (c + b) / 2.0;
    let (fd, fe) = (f(d), f(e));

    let left = h / 12.0 * (fa + 4.0 * fd + fc);
    let right = h / 12.0 * (fc + 4.0 * fe + fb);
    let refined = left + right;

    if depth == 0 || (refined - whole).abs() <= 15.0 * epsilon {
        return refined + (refined - whole) / 15.0;
    }

    simpson_aux(f, a, c, epsilon / 2.0, left, fa, fc, fd, depth - 1)
        + simpson_aux(f, c, b, epsilon / 2.0, right, fc, fb, fe, depth - 1)
}

/// Linear multistep coefficient for the derivative `current_order` steps back.
pub fn lms_coefficient(sigmas: &[f64], order: usize, index: usize, current_order: usize) -> f64 {
    let basis = |tau: f64| {
        (0..order)
            .filter(|&k| k != current_order)
            .map(|k| (tau - sigmas[index - k]) / (sigmas[index - current_order] - sigmas[index - k]))
            .product::<f64>()
    };

    integrate(basis, sigmas[index], sigmas[index + 1], 1e-4)
}

/// Bounded history of ODE derivatives, newest last.
#[derive(Debug, Clone)]
pub struct DerivativeHistory<B: Backend> {
    capacity: usize,
    entries: VecDeque<Tensor<B, 4>>,
}

impl<B: Backend> DerivativeHistory<B> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity + 1),
        }
    }

    pub fn push(&mut self, derivative: Tensor<B, 4>) {
        self.entries.push_back(derivative);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Newest first.
    pub fn newest(&self) -> impl Iterator<Item = &Tensor<B, 4>> {
        self.entries.iter().rev()
    }
}

#[derive(Debug)]
pub struct LmsScheduler<B: Backend> {
    timesteps: Vec<usize>,
    sigmas: Vec<f64>,
    init_noise_sigma: f64,
    prediction: PredictionType,
    order: usize,
    derivatives: DerivativeHistory<B>,
    step_index: StepIndex,
    noise: NoiseGenerator,
}

impl<B: Backend> LmsScheduler<B> {
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
            order: options.lms_order,
            derivatives: DerivativeHistory::new(options.lms_order),
            step_index: StepIndex::default(),
            noise: NoiseGenerator::new(options.seed),
        })
    }

    /// Coefficients used at `index`, newest derivative first.
    pub fn coefficients(&self, index: usize) -> Vec<f64> {
        let order = (index + 1).min(self.order);
        (0..order)
            .map(|current| lms_coefficient(&self.sigmas, order, index, current))
            .collect()
    }
}

impl<B: Backend> Scheduler<B> for LmsScheduler<B> {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Lms
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

        let pred_original = pred_original_from_sigma(model_output, sample.clone(), sigma, self.prediction);
        let derivative = (sample.clone() - pred_original.clone()).div_scalar(sigma);
        self.derivatives.push(derivative);

        let coefficients = self.coefficients(index);
        let prev_sample = coefficients
            .iter()
            .zip(self.derivatives.newest())
            .fold(sample, |acc, (coeff, derivative)| acc + derivative.clone() * *coeff);

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
