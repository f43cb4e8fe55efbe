use std::str::FromStr;

use burn::config::Config;
use serde::{Deserialize, Serialize};

use crate::error::{self, DiffusionError};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SchedulerKind {
    Lms,
    Euler,
    EulerAncestral,
    Ddpm,
    Ddim,
    Kdpm2,
    Kdpm2Ancestral,
    Lcm,
    FlowMatchEulerDiscrete,
    FlowMatchEulerDynamic,
    DdpmWuerstchen,
    InstaFlow,
    Locomotion,
}

impl SchedulerKind {
    pub const ALL: [SchedulerKind; 13] = [
        SchedulerKind::Lms,
        SchedulerKind::Euler,
        SchedulerKind::EulerAncestral,
        SchedulerKind::Ddpm,
        SchedulerKind::Ddim,
        SchedulerKind::Kdpm2,
        SchedulerKind::Kdpm2Ancestral,
        SchedulerKind::Lcm,
        SchedulerKind::FlowMatchEulerDiscrete,
        SchedulerKind::FlowMatchEulerDynamic,
        SchedulerKind::DdpmWuerstchen,
        SchedulerKind::InstaFlow,
        SchedulerKind::Locomotion,
    ];
}

impl FromStr for SchedulerKind {
    type Err = DiffusionError;

    fn from_str(s: &str) -> error::Result<Self> {
        let kind = match s.to_ascii_lowercase().replace(['-', '_', ' '], "").as_str() {
            "lms" => SchedulerKind::Lms,
            "euler" => SchedulerKind::Euler,
            "eulerancestral" | "eulera" => SchedulerKind::EulerAncestral,
            "ddpm" => SchedulerKind::Ddpm,
            "ddim" => SchedulerKind::Ddim,
            "kdpm2" => SchedulerKind::Kdpm2,
            "kdpm2ancestral" | "kdpm2a" => SchedulerKind::Kdpm2Ancestral,
            "lcm" => SchedulerKind::Lcm,
            "flowmatcheulerdiscrete" | "flowmatch" => SchedulerKind::FlowMatchEulerDiscrete,
            "flowmatcheulerdynamic" => SchedulerKind::FlowMatchEulerDynamic,
            "ddpmwuerstchen" | "wuerstchen" => SchedulerKind::DdpmWuerstchen,
            "instaflow" => SchedulerKind::InstaFlow,
            "locomotion" => SchedulerKind::Locomotion,
            _ => return Err(DiffusionError::config(format!("unknown scheduler '{}'", s))),
        };

        Ok(kind)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    StableDiffusion,
    StableDiffusionXL,
    StableDiffusion3,
    LatentConsistency,
    StableCascade,
    InstaFlow,
    Locomotion,
    LatentConsistencyXL,
    Flux,
}

impl PipelineKind {
    pub fn supported_schedulers(&self) -> &'static [SchedulerKind] {
        use SchedulerKind::*;

        match self {
            PipelineKind::StableDiffusion | PipelineKind::StableDiffusionXL => {
                &[Lms, Euler, EulerAncestral, Ddpm, Ddim, Kdpm2, Kdpm2Ancestral]
            }
            PipelineKind::StableDiffusion3 => &[FlowMatchEulerDiscrete, FlowMatchEulerDynamic],
            PipelineKind::LatentConsistency => &[Lcm, Euler, EulerAncestral, Ddim],
            PipelineKind::StableCascade => &[DdpmWuerstchen],
            PipelineKind::InstaFlow => &[InstaFlow],
            PipelineKind::Locomotion => &[Locomotion, Lcm],
            PipelineKind::LatentConsistencyXL => &[Lcm],
            PipelineKind::Flux => &[FlowMatchEulerDiscrete, FlowMatchEulerDynamic],
        }
    }

    pub fn supported_diffusers(&self) -> &'static [DiffuserKind] {
        use DiffuserKind::*;

        match self {
            PipelineKind::StableDiffusion => &[
                TextToImage,
                ImageToImage,
                ImageInpaint,
                ImageInpaintLegacy,
                ControlNet,
                ControlNetImage,
            ],
            PipelineKind::StableDiffusionXL => &[
                TextToImage,
                ImageToImage,
                ImageInpaintLegacy,
                ControlNet,
                ControlNetImage,
            ],
            PipelineKind::StableDiffusion3 => &[TextToImage, ImageToImage, ControlNet, ControlNetImage],
            PipelineKind::LatentConsistency => &[
                TextToImage,
                ImageToImage,
                ImageInpaintLegacy,
                ControlNet,
                ControlNetImage,
                VideoToVideo,
            ],
            PipelineKind::StableCascade => &[TextToImage, ImageToImage],
            PipelineKind::InstaFlow => &[TextToImage],
            PipelineKind::Locomotion => &[TextToVideo, VideoToVideo],
            PipelineKind::LatentConsistencyXL => &[
                TextToImage,
                ImageToImage,
                ImageInpaintLegacy,
                ControlNet,
                ControlNetImage,
            ],
            PipelineKind::Flux => &[TextToImage, ImageToImage],
        }
    }

    /// Denoisers conditioned on SDXL size and crop ids.
    pub fn uses_time_ids(&self) -> bool {
        matches!(self, PipelineKind::StableDiffusionXL | PipelineKind::LatentConsistencyXL)
    }

    pub fn ensure_scheduler(&self, scheduler: SchedulerKind) -> error::Result<()> {
        if self.supported_schedulers().contains(&scheduler) {
            Ok(())
        } else {
            Err(DiffusionError::UnsupportedScheduler {
                pipeline: *self,
                scheduler,
            })
        }
    }

    pub fn ensure_diffuser(&self, diffuser: DiffuserKind) -> error::Result<()> {
        if self.supported_diffusers().contains(&diffuser) {
            Ok(())
        } else {
            Err(DiffusionError::UnsupportedDiffuser {
                pipeline: *self,
                diffuser,
            })
        }
    }
}

impl FromStr for PipelineKind {
    type Err = DiffusionError;

    fn from_str(s: &str) -> error::Result<Self> {
        let kind = match s.to_ascii_lowercase().replace(['-', '_', ' '], "").as_str() {
            "stablediffusion" | "sd" => PipelineKind::StableDiffusion,
            "stablediffusionxl" | "sdxl" => PipelineKind::StableDiffusionXL,
            "stablediffusion3" | "sd3" => PipelineKind::StableDiffusion3,
            "latentconsistency" | "lcm" => PipelineKind::LatentConsistency,
            "stablecascade" | "cascade" => PipelineKind::StableCascade,
            "instaflow" => PipelineKind::InstaFlow,
            "locomotion" => PipelineKind::Locomotion,
            "latentconsistencyxl" | "lcmxl" => PipelineKind::LatentConsistencyXL,
            "flux" => PipelineKind::Flux,
            _ => return Err(DiffusionError::config(format!("unknown pipeline '{}'", s))),
        };

        Ok(kind)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DiffuserKind {
    TextToImage,
    ImageToImage,
    ImageInpaint,
    ImageInpaintLegacy,
    ControlNet,
    ControlNetImage,
    TextToVideo,
    VideoToVideo,
}

impl FromStr for DiffuserKind {
    type Err = DiffusionError;

    fn from_str(s: &str) -> error::Result<Self> {
        let kind = match s.to_ascii_lowercase().replace(['-', '_', ' '], "").as_str() {
            "texttoimage" | "txt2img" => DiffuserKind::TextToImage,
            "imagetoimage" | "img2img" => DiffuserKind::ImageToImage,
            "imageinpaint" | "inpaint" => DiffuserKind::ImageInpaint,
            "imageinpaintlegacy" | "inpaintlegacy" => DiffuserKind::ImageInpaintLegacy,
            "controlnet" => DiffuserKind::ControlNet,
            "controlnetimage" => DiffuserKind::ControlNetImage,
            "texttovideo" | "txt2vid" => DiffuserKind::TextToVideo,
            "videotovideo" | "vid2vid" => DiffuserKind::VideoToVideo,
            _ => return Err(DiffusionError::config(format!("unknown diffuser '{}'", s))),
        };

        Ok(kind)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum BetaSchedule {
    Linear,
    ScaledLinear,
    SquaredCosCapV2,
    Sigmoid,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlphaTransform {
    Cosine,
    Exponential,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimestepSpacing {
    Linspace,
    Leading,
    Trailing,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PredictionType {
    Epsilon,
    VariablePrediction,
    Sample,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum VarianceType {
    FixedSmall,
    FixedSmallLog,
    FixedLarge,
    FixedLargeLog,
    Learned,
    LearnedRange,
}

impl VarianceType {
    pub fn is_learned(&self) -> bool {
        matches!(self, VarianceType::Learned | VarianceType::LearnedRange)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryMode {
    /// Keep every sub-model resident for the lifetime of the pipeline.
    Maximum,
    /// Unload each sub-model as soon as the run no longer needs it.
    Minimum,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TileMode {
    /// Split both axes into four quadrants.
    Full,
    /// Split along the width only.
    Horizontal,
    /// Split along the height only.
    Vertical,
}

impl TileMode {
    pub fn splits_width(&self) -> bool {
        matches!(self, TileMode::Full | TileMode::Horizontal)
    }

    pub fn splits_height(&self) -> bool {
        matches!(self, TileMode::Full | TileMode::Vertical)
    }
}

#[derive(Config, Debug)]
pub struct TileOptions {
    #[config(default = false)]
    pub enabled: bool,
    #[config(default = "TileMode::Full")]
    pub mode: TileMode,
    /// Tile edge length in latent pixels.
    #[config(default = 64)]
    pub size: usize,
    /// Shared border width in latent pixels.
    #[config(default = 8)]
    pub overlap: usize,
}

#[derive(Config, Debug)]
pub struct GenerationOptions {
    #[config(default = 512)]
    pub width: usize,
    #[config(default = 512)]
    pub height: usize,
    #[config(default = 30)]
    pub inference_steps: usize,
    /// Steps of the second stage of two-stage pipelines.
    #[config(default = 10)]
    pub inference_steps2: usize,
    #[config(default = 7.5)]
    pub guidance_scale: f64,
    /// Guidance for the second stage of two-stage pipelines.
    #[config(default = 0.0)]
    pub guidance_scale2: f64,
    #[config(default = 0.6)]
    pub strength: f64,
    pub seed: Option<u64>,
    #[config(default = 0.7)]
    pub conditioning_scale: f64,
    #[config(default = "SchedulerKind::EulerAncestral")]
    pub scheduler: SchedulerKind,

    #[config(default = 1000)]
    pub train_timesteps: usize,
    #[config(default = 0.00085)]
    pub beta_start: f64,
    #[config(default = 0.012)]
    pub beta_end: f64,
    pub trained_betas: Option<Vec<f64>>,
    #[config(default = "BetaSchedule::ScaledLinear")]
    pub beta_schedule: BetaSchedule,
    #[config(default = "AlphaTransform::Cosine")]
    pub alpha_transform: AlphaTransform,
    #[config(default = 0.999)]
    pub maximum_beta: f64,
    #[config(default = "TimestepSpacing::Linspace")]
    pub timestep_spacing: TimestepSpacing,
    #[config(default = 0)]
    pub steps_offset: usize,
    #[config(default = "PredictionType::Epsilon")]
    pub prediction_type: PredictionType,
    #[config(default = "VarianceType::FixedSmall")]
    pub variance_type: VarianceType,
    #[config(default = false)]
    pub clip_sample: bool,
    #[config(default = 1.0)]
    pub clip_sample_range: f64,
    #[config(default = false)]
    pub thresholding: bool,
    #[config(default = 0.995)]
    pub dynamic_thresholding_ratio: f64,
    #[config(default = 1.0)]
    pub sample_max_value: f64,
    #[config(default = false)]
    pub use_karras_sigmas: bool,
    /// Flow-matching sigma shift.
    #[config(default = 1.0)]
    pub shift: f64,
    #[config(default = 50)]
    pub original_inference_steps: usize,
    #[config(default = 4)]
    pub lms_order: usize,
    #[config(default = 0.0)]
    pub eta: f64,
    /// Explicit timesteps, bypassing the computed schedule when non-empty.
    #[config(default = "Vec::new()")]
    pub timesteps: Vec<usize>,

    #[config(default = 1)]
    pub batch_count: usize,
    #[config(default = 0.0)]
    pub initial_noise_level: f64,
    /// Frames generated by text-to-video.
    #[config(default = 16)]
    pub frame_count: usize,
    /// Frames sharing one noise draw in video latents.
    #[config(default = 16)]
    pub context_size: usize,
    #[config(default = 6.0)]
    pub aesthetic_score: f64,
    /// Run conditional and unconditional passes as one batch-doubled call.
    #[config(default = true)]
    pub batch_guidance: bool,
    /// Attach the current latent to every progress report.
    #[config(default = false)]
    pub preview: bool,

    #[config(default = "MemoryMode::Maximum")]
    pub memory_mode: MemoryMode,
    #[config(default = "TileOptions::new()")]
    pub tile: TileOptions,
}

impl GenerationOptions {
    pub fn validate(&self, model: &ModelConfig) -> error::Result<()> {
        if self.inference_steps == 0 || self.inference_steps2 == 0 {
            return Err(DiffusionError::config("inference steps must be at least 1"));
        }
        if !(self.strength > 0.0 && self.strength <= 1.0) {
            return Err(DiffusionError::config(format!(
                "strength must lie in (0, 1], got {}",
                self.strength
            )));
        }
        if self.batch_count == 0 || self.frame_count == 0 {
            return Err(DiffusionError::config("batch_count and frame_count must be at least 1"));
        }
        if self.train_timesteps < 2 {
            return Err(DiffusionError::config("train_timesteps must be at least 2"));
        }
        let factor = model.size_multiple();
        if self.width == 0 || self.height == 0 || self.width % factor != 0 || self.height % factor != 0 {
            return Err(DiffusionError::config(format!(
                "width and height must be non-zero multiples of {}, got {}x{}",
                factor, self.width, self.height
            )));
        }
        if !self.guidance_scale.is_finite() || !self.guidance_scale2.is_finite() {
            return Err(DiffusionError::config("guidance scales must be finite"));
        }
        if self.lms_order == 0 {
            return Err(DiffusionError::config("lms_order must be at least 1"));
        }
        if let Some(betas) = &self.trained_betas {
            if betas.len() != self.train_timesteps {
                return Err(DiffusionError::config(format!(
                    "trained_betas has {} entries, expected {}",
                    betas.len(),
                    self.train_timesteps
                )));
            }
        }
        if self.inference_steps2 > self.train_timesteps {
            return Err(DiffusionError::config(format!(
                "inference_steps2 must not exceed train_timesteps ({}), got {}",
                self.train_timesteps, self.inference_steps2
            )));
        }
        if self.timesteps.is_empty() {
            self.validate_step_count()?;
        } else {
            if self.timesteps.iter().any(|&t| t >= self.train_timesteps) {
                return Err(DiffusionError::config("explicit timesteps must lie below train_timesteps"));
            }
            if self.timesteps.windows(2).any(|w| w[0] <= w[1]) {
                return Err(DiffusionError::config("explicit timesteps must be strictly descending"));
            }
        }
        if self.tile.enabled && self.tile.size == 0 {
            return Err(DiffusionError::config("tile size must be non-zero"));
        }

        Ok(())
    }

    /// Computed schedules only stay strictly descending while every step lands on its own
    /// training timestep.
    fn validate_step_count(&self) -> error::Result<()> {
        let steps = self.inference_steps;
        if steps > self.train_timesteps {
            return Err(DiffusionError::config(format!(
                "inference_steps must not exceed train_timesteps ({}), got {}",
                self.train_timesteps, steps
            )));
        }
        if matches!(self.scheduler, SchedulerKind::Lcm | SchedulerKind::Locomotion) && steps > self.original_inference_steps {
            return Err(DiffusionError::config(format!(
                "inference_steps must not exceed original_inference_steps ({}), got {}",
                self.original_inference_steps, steps
            )));
        }
        if self.timestep_spacing == TimestepSpacing::Leading {
            let last = (steps - 1) * (self.train_timesteps / steps) + self.steps_offset;
            if last >= self.train_timesteps {
                return Err(DiffusionError::config(format!(
                    "steps_offset {} pushes the leading schedule past train_timesteps",
                    self.steps_offset
                )));
            }
        }

        Ok(())
    }

    pub fn latent_height(&self, model: &ModelConfig) -> usize {
        self.height / model.downscale_factor
    }

    pub fn latent_width(&self, model: &ModelConfig) -> usize {
        self.width / model.downscale_factor
    }

    /// Latent shape for a single image.
    pub fn latent_dims(&self, model: &ModelConfig) -> [usize; 4] {
        [1, model.latent_channels, self.latent_height(model), self.latent_width(model)]
    }
}

#[derive(Config, Debug)]
pub struct ModelConfig {
    pub pipeline: PipelineKind,
    #[config(default = 4)]
    pub latent_channels: usize,
    #[config(default = 8)]
    pub downscale_factor: usize,
    #[config(default = 0.18215)]
    pub scale_factor: f64,
    #[config(default = 0.0)]
    pub shift_factor: f64,
    /// Denoiser takes the sinusoidal guidance embedding instead of explicit guidance.
    #[config(default = false)]
    pub guidance_embedding: bool,
    /// SDXL refiner style time ids carrying an aesthetic score.
    #[config(default = false)]
    pub aesthetic_time_ids: bool,
    /// Divisor applied to scheduler timesteps before the denoiser sees them.
    #[config(default = 1.0)]
    pub timestep_scale: f64,
    /// Denoiser consumes 2x2 latent patches as tokens, with positional ids and a scalar
    /// guidance input.
    #[config(default = false)]
    pub packed_latents: bool,
}

impl ModelConfig {
    pub fn stable_diffusion() -> Self {
        ModelConfig::new(PipelineKind::StableDiffusion)
    }

    pub fn stable_diffusion_xl() -> Self {
        ModelConfig::new(PipelineKind::StableDiffusionXL).with_scale_factor(0.13025)
    }

    pub fn stable_diffusion_3() -> Self {
        ModelConfig::new(PipelineKind::StableDiffusion3)
            .with_latent_channels(16)
            .with_scale_factor(1.5305)
            .with_shift_factor(0.0609)
    }

    pub fn latent_consistency() -> Self {
        ModelConfig::new(PipelineKind::LatentConsistency).with_guidance_embedding(true)
    }

    pub fn stable_cascade() -> Self {
        ModelConfig::new(PipelineKind::StableCascade).with_scale_factor(0.3764)
    }

    pub fn instaflow() -> Self {
        ModelConfig::new(PipelineKind::InstaFlow)
    }

    pub fn locomotion() -> Self {
        ModelConfig::new(PipelineKind::Locomotion).with_guidance_embedding(true)
    }

    pub fn latent_consistency_xl() -> Self {
        ModelConfig::new(PipelineKind::LatentConsistencyXL).with_scale_factor(0.13025)
    }

    pub fn flux() -> Self {
        ModelConfig::new(PipelineKind::Flux)
            .with_latent_channels(16)
            .with_scale_factor(0.3611)
            .with_shift_factor(0.1159)
            .with_timestep_scale(1000.0)
            .with_packed_latents(true)
    }

    /// Output sizes must divide by this; packed latents pair up latent pixels.
    pub fn size_multiple(&self) -> usize {
        if self.packed_latents {
            self.downscale_factor * 2
        } else {
            self.downscale_factor
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let options = GenerationOptions::new();
        assert!(options.validate(&ModelConfig::stable_diffusion()).is_ok());
        assert_eq!(options.latent_dims(&ModelConfig::stable_diffusion()), [1, 4, 64, 64]);
    }

    #[test]
    fn rejects_invalid_strength_and_steps() {
        let model = ModelConfig::stable_diffusion();

        assert!(GenerationOptions::new().with_strength(0.0).validate(&model).is_err());
        assert!(GenerationOptions::new().with_strength(1.5).validate(&model).is_err());
        assert!(GenerationOptions::new().with_inference_steps(0).validate(&model).is_err());
        assert!(GenerationOptions::new().with_strength(1.0).validate(&model).is_ok());
    }

    #[test]
    fn rejects_unaligned_dimensions() {
        let model = ModelConfig::stable_diffusion();
        let err = GenerationOptions::new().with_width(500).validate(&model).unwrap_err();

        assert!(matches!(err, DiffusionError::Configuration(_)));
    }

    #[test]
    fn rejects_malformed_timestep_override() {
        let model = ModelConfig::stable_diffusion();

        let ascending = GenerationOptions::new().with_timesteps(vec![1, 500, 999]);
        assert!(ascending.validate(&model).is_err());

        let out_of_range = GenerationOptions::new().with_timesteps(vec![1000, 500]);
        assert!(out_of_range.validate(&model).is_err());

        let valid = GenerationOptions::new().with_timesteps(vec![999, 500, 1]);
        assert!(valid.validate(&model).is_ok());
    }

    #[test]
    fn rejects_step_counts_that_repeat_timesteps() {
        let model = ModelConfig::stable_diffusion();

        let ddpm = GenerationOptions::new().with_scheduler(SchedulerKind::Ddpm);
        assert!(ddpm.clone().with_inference_steps(1000).validate(&model).is_ok());
        assert!(matches!(
            ddpm.clone().with_inference_steps(1500).validate(&model),
            Err(DiffusionError::Configuration(_))
        ));
        assert!(ddpm.with_inference_steps2(1001).validate(&model).is_err());

        let lcm = GenerationOptions::new().with_scheduler(SchedulerKind::Lcm);
        assert!(lcm.clone().with_inference_steps(50).validate(&model).is_ok());
        assert!(matches!(
            lcm.clone().with_inference_steps(60).validate(&model),
            Err(DiffusionError::Configuration(_))
        ));
        assert!(lcm
            .with_scheduler(SchedulerKind::Locomotion)
            .with_inference_steps(51)
            .validate(&model)
            .is_err());

        let leading = GenerationOptions::new()
            .with_timestep_spacing(TimestepSpacing::Leading)
            .with_inference_steps(1000);
        assert!(leading.clone().validate(&model).is_ok());
        assert!(leading.with_steps_offset(1).validate(&model).is_err());
    }

    #[test]
    fn explicit_timesteps_skip_the_step_bound() {
        let model = ModelConfig::stable_diffusion();
        let options = GenerationOptions::new()
            .with_scheduler(SchedulerKind::Lcm)
            .with_inference_steps(80)
            .with_timesteps(vec![999, 759, 499, 259]);

        assert!(options.validate(&model).is_ok());
    }

    #[test]
    fn support_matrix_fails_fast() {
        assert!(PipelineKind::StableDiffusion.ensure_scheduler(SchedulerKind::Lms).is_ok());
        assert!(matches!(
            PipelineKind::StableCascade.ensure_scheduler(SchedulerKind::Euler),
            Err(DiffusionError::UnsupportedScheduler { .. })
        ));
        assert!(matches!(
            PipelineKind::InstaFlow.ensure_diffuser(DiffuserKind::ImageInpaint),
            Err(DiffusionError::UnsupportedDiffuser { .. })
        ));
        assert!(PipelineKind::StableCascade.ensure_diffuser(DiffuserKind::ImageToImage).is_ok());
        assert!(PipelineKind::LatentConsistencyXL.ensure_scheduler(SchedulerKind::Euler).is_err());
        assert!(PipelineKind::Flux.ensure_diffuser(DiffuserKind::ControlNet).is_err());
    }

    #[test]
    fn packed_latents_need_even_latent_sizes() {
        let flux = ModelConfig::flux();
        let options = GenerationOptions::new().with_scheduler(SchedulerKind::FlowMatchEulerDiscrete);

        assert_eq!(flux.size_multiple(), 16);
        assert!(options.clone().with_width(1024).with_height(512).validate(&flux).is_ok());
        assert!(matches!(
            options.with_width(520).validate(&flux),
            Err(DiffusionError::Configuration(_))
        ));
    }

    #[test]
    fn parses_kinds_from_cli_names() {
        assert_eq!("euler-ancestral".parse::<SchedulerKind>().unwrap(), SchedulerKind::EulerAncestral);
        assert_eq!("sdxl".parse::<PipelineKind>().unwrap(), PipelineKind::StableDiffusionXL);
        assert_eq!("img2img".parse::<DiffuserKind>().unwrap(), DiffuserKind::ImageToImage);
        assert_eq!("lcm-xl".parse::<PipelineKind>().unwrap(), PipelineKind::LatentConsistencyXL);
        assert_eq!("Flux".parse::<PipelineKind>().unwrap(), PipelineKind::Flux);
        assert!("bogus".parse::<SchedulerKind>().is_err());
    }

    #[test]
    fn options_round_trip_through_json() {
        let options = GenerationOptions::new()
            .with_scheduler(SchedulerKind::Lms)
            .with_seed(Some(42))
            .with_timesteps(vec![900, 400]);

        let path = std::env::temp_dir().join(format!("generation-options-{}.json", std::process::id()));
        options.save(&path).unwrap();
        let restored = GenerationOptions::load(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(restored.scheduler, SchedulerKind::Lms);
        assert_eq!(restored.seed, Some(42));
        assert_eq!(restored.timesteps, vec![900, 400]);
    }
}
