pub mod ddim;
pub mod ddpm;
pub mod euler;
pub mod euler_ancestral;
pub mod flow_match;
pub mod instaflow;
pub mod kdpm2;
pub mod kdpm2_ancestral;
pub mod lcm;
pub mod lms;
pub mod wuerstchen;

pub use ddim::DdimScheduler;
pub use ddpm::DdpmScheduler;
pub use euler::EulerScheduler;
pub use euler_ancestral::EulerAncestralScheduler;
pub use flow_match::{dynamic_shift, FlowMatchScheduler, FlowMatchVariant};
pub use instaflow::InstaFlowScheduler;
pub use kdpm2::Kdpm2Scheduler;
pub use kdpm2_ancestral::Kdpm2AncestralScheduler;
pub use lcm::{guidance_embedding, LcmScheduler};
pub use lms::LmsScheduler;
pub use wuerstchen::WuerstchenScheduler;

use burn::tensor::{backend::Backend, Tensor};

use crate::error::Result;
use crate::options::{GenerationOptions, PipelineKind, PredictionType, SchedulerKind};
use crate::tensor::{from_vec, to_vec, NoiseGenerator};

/// Output of a single reverse-diffusion step.
#[derive(Debug, Clone)]
pub struct StepResult<B: Backend> {
    pub prev_sample: Tensor<B, 4>,
    /// The model's current estimate of the fully denoised sample.
    pub pred_original: Tensor<B, 4>,
}

/// A sampler family: ordered timesteps, schedule constants and a reverse update rule.
pub trait Scheduler<B: Backend>: Send {
    fn kind(&self) -> SchedulerKind;

    fn timesteps(&self) -> &[usize];

    fn init_noise_sigma(&self) -> f64;

    /// Divisor applied by `scale_input` at this timestep.
    fn input_scale(&self, _timestep: usize) -> f64 {
        1.0
    }

    fn scale_input(&self, sample: Tensor<B, 4>, timestep: usize) -> Tensor<B, 4> {
        let scale = self.input_scale(timestep);
        if scale == 1.0 {
            sample
        } else {
            sample.div_scalar(scale)
        }
    }

    /// Timestep value handed to the denoiser.
    fn model_timestep(&self, timestep: usize) -> f64 {
        timestep as f64
    }

    /// Per-step sigmas, terminal zero included, for sigma-parameterized families.
    fn sigmas(&self) -> Option<&[f64]> {
        None
    }

    fn step(&mut self, model_output: Tensor<B, 4>, timestep: usize, sample: Tensor<B, 4>) -> Result<StepResult<B>>;

    /// Forward-process noising of a clean sample to the noise level of `timestep`.
    fn add_noise(&self, original: Tensor<B, 4>, noise: Tensor<B, 4>, timestep: usize) -> Tensor<B, 4>;

    fn noise_generator(&mut self) -> &mut NoiseGenerator;

    fn create_random_sample(&mut self, dims: [usize; 4], sigma: f64, device: &B::Device) -> Tensor<B, 4> {
        self.noise_generator().sample(dims, sigma, device)
    }
}

pub fn build_scheduler<B: Backend>(options: &GenerationOptions, pipeline: PipelineKind) -> Result<Box<dyn Scheduler<B>>> {
    pipeline.ensure_scheduler(options.scheduler)?;

    let scheduler: Box<dyn Scheduler<B>> = match options.scheduler {
        SchedulerKind::Lms => Box::new(LmsScheduler::new(options)?),
        SchedulerKind::Euler => Box::new(EulerScheduler::new(options)?),
        SchedulerKind::EulerAncestral => Box::new(EulerAncestralScheduler::new(options)?),
        SchedulerKind::Ddpm => Box::new(DdpmScheduler::new(options)?),
        SchedulerKind::Ddim => Box::new(DdimScheduler::new(options)?),
        SchedulerKind::Kdpm2 => Box::new(Kdpm2Scheduler::new(options)?),
        SchedulerKind::Kdpm2Ancestral => Box::new(Kdpm2AncestralScheduler::new(options)?),
        SchedulerKind::Lcm => Box::new(LcmScheduler::new(options)?),
        SchedulerKind::Locomotion => Box::new(LcmScheduler::locomotion(options)?),
        SchedulerKind::FlowMatchEulerDiscrete => Box::new(FlowMatchScheduler::new(options, FlowMatchVariant::Discrete)),
        SchedulerKind::FlowMatchEulerDynamic => Box::new(FlowMatchScheduler::new(options, FlowMatchVariant::Dynamic)),
        SchedulerKind::DdpmWuerstchen => Box::new(WuerstchenScheduler::new(options)),
        SchedulerKind::InstaFlow => Box::new(InstaFlowScheduler::new(options)),
    };

    Ok(scheduler)
}

/// Position of `timestep` in the schedule, or the nearest entry when absent.
pub fn index_of(timesteps: &[usize], timestep: usize) -> usize {
    if let Some(index) = timesteps.iter().position(|&t| t == timestep) {
        return index;
    }

    timesteps
        .iter()
        .enumerate()
        .min_by_key(|&(_, &t)| t.abs_diff(timestep))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Tracks the step index so schedules with repeated timesteps stay in order.
#[derive(Debug, Clone, Default)]
pub struct StepIndex {
    current: Option<usize>,
}

impl StepIndex {
    pub fn resolve(&self, timesteps: &[usize], timestep: usize) -> usize {
        match self.current {
            Some(index) if timesteps.get(index) == Some(&timestep) => index,
            _ => index_of(timesteps, timestep),
        }
    }

    pub fn advance(&mut self, from: usize) {
        self.current = Some(from + 1);
    }
}

/// `x0` for alpha-parameterized families.
pub fn pred_original_from_alpha<B: Backend>(
    model_output: Tensor<B, 4>,
    sample: Tensor<B, 4>,
    alpha_prod: f64,
    prediction: PredictionType,
) -> Tensor<B, 4> {
    let beta_prod = 1.0 - alpha_prod;

    match prediction {
        PredictionType::Epsilon => (sample - model_output * beta_prod.sqrt()).div_scalar(alpha_prod.sqrt()),
        PredictionType::Sample => model_output,
        PredictionType::VariablePrediction => sample * alpha_prod.sqrt() - model_output * beta_prod.sqrt(),
    }
}

/// `x0` for sigma-parameterized families.
pub fn pred_original_from_sigma<B: Backend>(
    model_output: Tensor<B, 4>,
    sample: Tensor<B, 4>,
    sigma: f64,
    prediction: PredictionType,
) -> Tensor<B, 4> {
    match prediction {
        PredictionType::Epsilon => sample - model_output * sigma,
        PredictionType::Sample => model_output,
        PredictionType::VariablePrediction => {
            let s2 = sigma * sigma + 1.0;
            model_output * (-sigma / s2.sqrt()) + sample.div_scalar(s2)
        }
    }
}

/// Clip or dynamically threshold a predicted original sample.
#[derive(Debug, Clone, Copy)]
pub struct SampleClipping {
    pub clip: bool,
    pub clip_range: f64,
    pub thresholding: bool,
    pub ratio: f64,
    pub max_value: f64,
}

impl SampleClipping {
    pub fn new(options: &GenerationOptions) -> Self {
        Self {
            clip: options.clip_sample,
            clip_range: options.clip_sample_range,
            thresholding: options.thresholding,
            ratio: options.dynamic_thresholding_ratio,
            max_value: options.sample_max_value,
        }
    }

    pub fn apply<B: Backend>(&self, sample: Tensor<B, 4>) -> Tensor<B, 4> {
        if self.thresholding {
            dynamic_threshold(sample, self.ratio, self.max_value)
        } else if self.clip {
            sample.clamp(-self.clip_range, self.clip_range)
        } else {
            sample
        }
    }
}

/// Linear-interpolated quantile of sorted values.
fn quantile(sorted: &[f32], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }

    let position = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let frac = position - lower as f64;

    sorted[lower] as f64 + (sorted[upper] as f64 - sorted[lower] as f64) * frac
}

/// Per-sample threshold at the `ratio` quantile of `|x|`, clamped to `[1, max_value]`.
pub fn dynamic_threshold<B: Backend>(sample: Tensor<B, 4>, ratio: f64, max_value: f64) -> Tensor<B, 4> {
    let dims = sample.dims();
    let device = sample.device();
    let per_sample = dims[1] * dims[2] * dims[3];

    let mut values = to_vec(sample);
    for chunk in values.chunks_mut(per_sample.max(1)) {
        let mut sorted: Vec<f32> = chunk.iter().map(|v| v.abs()).collect();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let s = quantile(&sorted, ratio).clamp(1.0, max_value.max(1.0)) as f32;
        for v in chunk.iter_mut() {
            *v = v.clamp(-s, s) / s;
        }
    }

    from_vec(values, dims, &device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{ModelConfig, TimestepSpacing};
    use crate::tensor::from_vec;
    use crate::testing::{assert_approx_eq, TestBackend, DEVICE};

    #[test]
    fn builds_every_supported_pair_and_rejects_others() {
        let pipelines = [
            PipelineKind::StableDiffusion,
            PipelineKind::StableDiffusionXL,
            PipelineKind::StableDiffusion3,
            PipelineKind::LatentConsistency,
            PipelineKind::StableCascade,
            PipelineKind::InstaFlow,
            PipelineKind::Locomotion,
            PipelineKind::LatentConsistencyXL,
            PipelineKind::Flux,
        ];

        for pipeline in pipelines {
            for kind in SchedulerKind::ALL {
                let options = GenerationOptions::new().with_scheduler(kind).with_inference_steps(8).with_seed(Some(1));
                let built = build_scheduler::<TestBackend>(&options, pipeline);

                if pipeline.supported_schedulers().contains(&kind) {
                    let scheduler = built.unwrap();
                    assert_eq!(scheduler.kind(), kind);
                    assert!(!scheduler.timesteps().is_empty(), "{:?}", kind);
                    assert!(scheduler.init_noise_sigma() > 0.0, "{:?}", kind);
                } else {
                    assert!(built.is_err(), "{:?} {:?}", pipeline, kind);
                }
            }
        }
    }

    #[test]
    fn scale_input_inverts_through_input_scale() {
        let options = GenerationOptions::new().with_inference_steps(10).with_seed(Some(3));
        let sample = from_vec::<TestBackend, 4>(vec![0.5, -1.5, 2.0, 4.0], [1, 1, 2, 2], &DEVICE);

        for kind in [
            SchedulerKind::Lms,
            SchedulerKind::Euler,
            SchedulerKind::EulerAncestral,
            SchedulerKind::Ddpm,
            SchedulerKind::Ddim,
            SchedulerKind::Kdpm2,
            SchedulerKind::Kdpm2Ancestral,
        ] {
            let options = options.clone().with_scheduler(kind);
            let scheduler = build_scheduler::<TestBackend>(&options, PipelineKind::StableDiffusion).unwrap();
            let t = scheduler.timesteps()[3];

            let scaled = scheduler.scale_input(sample.clone(), t);
            let restored = scaled * scheduler.input_scale(t);

            assert_approx_eq(&to_vec(restored), &to_vec(sample.clone()), 1e-5);
        }
    }

    #[test]
    fn index_falls_back_to_nearest() {
        let timesteps = [999, 500, 1];
        assert_eq!(index_of(&timesteps, 500), 1);
        assert_eq!(index_of(&timesteps, 480), 1);
        assert_eq!(index_of(&timesteps, 0), 2);
    }

    #[test]
    fn step_index_follows_repeated_timesteps() {
        let timesteps = [900, 900, 500, 500];
        let mut index = StepIndex::default();

        let first = index.resolve(&timesteps, 900);
        index.advance(first);
        assert_eq!(index.resolve(&timesteps, 900), 1);
        index.advance(1);
        assert_eq!(index.resolve(&timesteps, 500), 2);
    }

    #[test]
    fn sigma_predictions_agree_on_an_oracle() {
        let x0 = from_vec::<TestBackend, 4>(vec![0.3, -0.2, 0.1, 0.4], [1, 1, 2, 2], &DEVICE);
        let noise = from_vec::<TestBackend, 4>(vec![1.0, -0.5, 0.25, 2.0], [1, 1, 2, 2], &DEVICE);
        let sigma = 3.0;
        let sample = x0.clone() + noise.clone() * sigma;

        let eps = pred_original_from_sigma(noise.clone(), sample.clone(), sigma, PredictionType::Epsilon);
        assert_approx_eq(&to_vec(eps), &to_vec(x0.clone()), 1e-5);

        // v = (eps - sigma * x0) / sqrt(sigma^2 + 1)
        let v = (noise - x0.clone() * sigma).div_scalar((sigma * sigma + 1.0f64).sqrt());
        let from_v = pred_original_from_sigma(v, sample, sigma, PredictionType::VariablePrediction);
        assert_approx_eq(&to_vec(from_v), &to_vec(x0), 1e-5);
    }

    #[test]
    fn dynamic_threshold_scales_large_samples() {
        let x = from_vec::<TestBackend, 4>(vec![4.0, -4.0, 2.0, 0.5], [1, 1, 2, 2], &DEVICE);
        let out = dynamic_threshold(x, 1.0, 2.0);

        // quantile 1.0 of |x| is 4, clamped to the max of 2
        assert_approx_eq(&to_vec(out), &[1.0, -1.0, 1.0, 0.25], 1e-6);

        let small = from_vec::<TestBackend, 4>(vec![0.5, -0.25, 0.1, 0.0], [1, 1, 2, 2], &DEVICE);
        let out = dynamic_threshold(small, 0.995, 1.0);
        assert_approx_eq(&to_vec(out), &[0.5, -0.25, 0.1, 0.0], 1e-6);
    }

    #[test]
    fn clipping_respects_range() {
        let options = GenerationOptions::new().with_clip_sample(true).with_clip_sample_range(1.5);
        let clipping = SampleClipping::new(&options);
        let x = from_vec::<TestBackend, 4>(vec![3.0, -3.0, 1.0, 0.0], [1, 1, 2, 2], &DEVICE);

        assert_approx_eq(&to_vec(clipping.apply(x)), &[1.5, -1.5, 1.0, 0.0], 1e-6);
    }

    #[test]
    fn model_defaults_are_consistent_with_spacing() {
        let options = GenerationOptions::new()
            .with_scheduler(SchedulerKind::Euler)
            .with_timestep_spacing(TimestepSpacing::Leading)
            .with_inference_steps(10);
        let scheduler = build_scheduler::<TestBackend>(&options, ModelConfig::stable_diffusion().pipeline).unwrap();
        let sigma_max = scheduler.sigmas().unwrap()[0];

        assert!((scheduler.init_noise_sigma() - (sigma_max * sigma_max + 1.0).sqrt()).abs() < 1e-9);
    }
}
