pub mod cascade;
pub mod controlnet;
pub mod denoise;
pub mod flux;
pub mod image;
pub mod inpaint;
pub mod inpaint_legacy;
pub mod text;
pub mod video;

pub use cascade::CascadeDiffuser;
pub use controlnet::ControlNetDiffuser;
pub use denoise::DenoiseLoop;
pub use image::ImageDiffuser;
pub use inpaint::InpaintDiffuser;
pub use inpaint_legacy::InpaintLegacyDiffuser;
pub use text::TextDiffuser;
pub use video::VideoDiffuser;

use std::time::Instant;

use burn::tensor::{backend::Backend, Tensor};
use tracing::{info, warn};

use crate::cancel::CancellationToken;
use crate::error::{DiffusionError, Result};
use crate::model::{ControlNet, Denoiser, ImageEncoder, LatentDecoder, LatentEncoder, ProgressSink, PromptEmbeddings};
use crate::options::{DiffuserKind, GenerationOptions, MemoryMode, ModelConfig, PipelineKind, SchedulerKind};
use crate::scheduler::{build_scheduler, dynamic_shift, Scheduler};
use crate::tensor::{ensure_dims, split_batch};
use crate::tiles::process_tiled;

/// Images and masks a task conditions on, all at pixel resolution.
#[derive(Debug, Clone)]
pub struct ConditioningInputs<B: Backend> {
    /// `[1, 3, H, W]` in `[-1, 1]`.
    pub image: Option<Tensor<B, 4>>,
    /// `[1, 1, H, W]` in `[0, 1]`, 1 marking pixels to regenerate. Inpainting denoisers see it
    /// thresholded at 0.5; legacy blending weighs by the value itself.
    pub mask: Option<Tensor<B, 4>>,
    pub control_image: Option<Tensor<B, 4>>,
    /// `[frames, 3, H, W]` in `[-1, 1]`.
    pub video: Option<Tensor<B, 4>>,
}

impl<B: Backend> Default for ConditioningInputs<B> {
    fn default() -> Self {
        Self {
            image: None,
            mask: None,
            control_image: None,
            video: None,
        }
    }
}

impl<B: Backend> ConditioningInputs<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(self, image: Tensor<B, 4>) -> Self {
        Self {
            image: Some(image),
            ..self
        }
    }

    pub fn with_mask(self, mask: Tensor<B, 4>) -> Self {
        Self { mask: Some(mask), ..self }
    }

    pub fn with_control_image(self, control_image: Tensor<B, 4>) -> Self {
        Self {
            control_image: Some(control_image),
            ..self
        }
    }

    pub fn with_video(self, video: Tensor<B, 4>) -> Self {
        Self {
            video: Some(video),
            ..self
        }
    }

    /// Source image checked against the requested output size.
    pub fn image(&self, options: &GenerationOptions) -> Result<Tensor<B, 4>> {
        let image = self.image.clone().ok_or(DiffusionError::MissingInput("input image"))?;
        ensure_dims(&image, [1, 3, options.height, options.width], "input image")?;
        Ok(image)
    }

    pub fn mask(&self, options: &GenerationOptions) -> Result<Tensor<B, 4>> {
        let mask = self.mask.clone().ok_or(DiffusionError::MissingInput("input mask"))?;
        ensure_dims(&mask, [1, 1, options.height, options.width], "input mask")?;
        Ok(mask)
    }

    pub fn control_image(&self, options: &GenerationOptions) -> Result<Tensor<B, 4>> {
        let image = self.control_image.clone().ok_or(DiffusionError::MissingInput("control image"))?;
        ensure_dims(&image, [1, 3, options.height, options.width], "control image")?;
        Ok(image)
    }

    pub fn video(&self, options: &GenerationOptions) -> Result<Tensor<B, 4>> {
        let video = self.video.clone().ok_or(DiffusionError::MissingInput("input video"))?;
        let frames = video.dims()[0];
        ensure_dims(&video, [frames, 3, options.height, options.width], "input video")?;
        Ok(video)
    }
}

/// Sub-models a run may call. Only the denoiser is always required.
pub struct ModelSet<'a, B: Backend> {
    pub config: &'a ModelConfig,
    pub denoiser: &'a dyn Denoiser<B>,
    /// Second-stage denoiser of prior/decoder pipelines.
    pub decoder_denoiser: Option<&'a dyn Denoiser<B>>,
    pub controlnet: Option<&'a dyn ControlNet<B>>,
    pub encoder: Option<&'a dyn LatentEncoder<B>>,
    pub decoder: Option<&'a dyn LatentDecoder<B>>,
    /// Image embedder of image-variation priors.
    pub image_encoder: Option<&'a dyn ImageEncoder<B>>,
}

impl<'a, B: Backend> ModelSet<'a, B> {
    pub fn new(config: &'a ModelConfig, denoiser: &'a dyn Denoiser<B>) -> Self {
        Self {
            config,
            denoiser,
            decoder_denoiser: None,
            controlnet: None,
            encoder: None,
            decoder: None,
            image_encoder: None,
        }
    }

    pub fn with_decoder_denoiser(self, denoiser: &'a dyn Denoiser<B>) -> Self {
        Self {
            decoder_denoiser: Some(denoiser),
            ..self
        }
    }

    pub fn with_controlnet(self, controlnet: &'a dyn ControlNet<B>) -> Self {
        Self {
            controlnet: Some(controlnet),
            ..self
        }
    }

    pub fn with_encoder(self, encoder: &'a dyn LatentEncoder<B>) -> Self {
        Self {
            encoder: Some(encoder),
            ..self
        }
    }

    pub fn with_decoder(self, decoder: &'a dyn LatentDecoder<B>) -> Self {
        Self {
            decoder: Some(decoder),
            ..self
        }
    }

    pub fn with_image_encoder(self, image_encoder: &'a dyn ImageEncoder<B>) -> Self {
        Self {
            image_encoder: Some(image_encoder),
            ..self
        }
    }

    pub fn encoder(&self) -> Result<&'a dyn LatentEncoder<B>> {
        self.encoder.ok_or(DiffusionError::MissingInput("latent encoder"))
    }

    pub fn decoder(&self) -> Result<&'a dyn LatentDecoder<B>> {
        self.decoder.ok_or(DiffusionError::MissingInput("latent decoder"))
    }

    pub fn controlnet(&self) -> Result<&'a dyn ControlNet<B>> {
        self.controlnet.ok_or(DiffusionError::MissingInput("control network"))
    }

    pub fn image_encoder(&self) -> Result<&'a dyn ImageEncoder<B>> {
        self.image_encoder.ok_or(DiffusionError::MissingInput("image encoder"))
    }

    /// Guard that calls [`ModelSet::release_denoisers`] when dropped, whichever way the run ends.
    pub fn release_on_exit(&self, memory_mode: MemoryMode) -> ReleaseOnExit<'_, 'a, B> {
        ReleaseOnExit {
            models: self,
            memory_mode,
        }
    }

    /// Drops the denoisers and control network when the run asks for minimal residency.
    pub fn release_denoisers(&self, memory_mode: MemoryMode) {
        if memory_mode != MemoryMode::Minimum {
            return;
        }

        self.denoiser.unload();
        if let Some(denoiser) = self.decoder_denoiser {
            denoiser.unload();
        }
        if let Some(controlnet) = self.controlnet {
            controlnet.unload();
        }
    }
}

pub struct ReleaseOnExit<'m, 'a, B: Backend> {
    models: &'m ModelSet<'a, B>,
    memory_mode: MemoryMode,
}

impl<B: Backend> Drop for ReleaseOnExit<'_, '_, B> {
    fn drop(&mut self) {
        self.models.release_denoisers(self.memory_mode);
    }
}

/// One task of one pipeline: prepares the initial latent, walks the timesteps and returns
/// the final latent.
pub trait Diffuser<B: Backend> {
    fn kind(&self) -> DiffuserKind;

    fn diffuse(
        &self,
        models: &ModelSet<'_, B>,
        options: &GenerationOptions,
        embeddings: &PromptEmbeddings<B>,
        inputs: &ConditioningInputs<B>,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink<B>,
    ) -> Result<Tensor<B, 4>>;

    /// `diffuse` followed by decoding to images in `[-1, 1]`.
    fn generate(
        &self,
        models: &ModelSet<'_, B>,
        options: &GenerationOptions,
        embeddings: &PromptEmbeddings<B>,
        inputs: &ConditioningInputs<B>,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink<B>,
    ) -> Result<Tensor<B, 4>> {
        let latent = self.diffuse(models, options, embeddings, inputs, cancel, progress)?;
        cancel.check()?;
        decode_latents(models, options, latent)
    }
}

pub fn create_diffuser<B: Backend>(kind: DiffuserKind, pipeline: PipelineKind) -> Result<Box<dyn Diffuser<B>>> {
    pipeline.ensure_diffuser(kind)?;

    let diffuser: Box<dyn Diffuser<B>> = match kind {
        DiffuserKind::TextToImage if pipeline == PipelineKind::StableCascade => Box::new(CascadeDiffuser::text()),
        DiffuserKind::ImageToImage if pipeline == PipelineKind::StableCascade => Box::new(CascadeDiffuser::image()),
        DiffuserKind::TextToImage => Box::new(TextDiffuser),
        DiffuserKind::ImageToImage => Box::new(ImageDiffuser),
        DiffuserKind::ImageInpaint => Box::new(InpaintDiffuser),
        DiffuserKind::ImageInpaintLegacy => Box::new(InpaintLegacyDiffuser),
        DiffuserKind::ControlNet => Box::new(ControlNetDiffuser::text()),
        DiffuserKind::ControlNetImage => Box::new(ControlNetDiffuser::image()),
        DiffuserKind::TextToVideo => Box::new(VideoDiffuser::text()),
        DiffuserKind::VideoToVideo => Box::new(VideoDiffuser::video()),
    };

    Ok(diffuser)
}

/// Validated per-run state: effective options, a fresh scheduler and batch-sized embeddings.
pub struct RunSetup<B: Backend> {
    pub options: GenerationOptions,
    pub scheduler: Box<dyn Scheduler<B>>,
    pub embeddings: PromptEmbeddings<B>,
    pub device: B::Device,
    pub batch: usize,
    started: Instant,
}

impl<B: Backend> RunSetup<B> {
    /// Fails before any inference call on invalid options, unsupported combinations or
    /// malformed embeddings.
    pub fn begin(
        kind: DiffuserKind,
        models: &ModelSet<'_, B>,
        options: &GenerationOptions,
        embeddings: &PromptEmbeddings<B>,
        batch: usize,
    ) -> Result<Self> {
        let model = models.config;
        options.validate(model)?;
        model.pipeline.ensure_diffuser(kind)?;
        embeddings.validate()?;

        let options = effective_options(options, model);
        let mut scheduler = build_scheduler(&options, model.pipeline)?;
        let seed = scheduler.noise_generator().seed();
        if options.seed.is_none() {
            warn!("No seed given, using random seed {}", seed);
        }

        info!(
            "Starting {:?} {:?} with {:?}: {} steps, batch {}, seed {}",
            model.pipeline, kind, options.scheduler, options.inference_steps, batch, seed
        );

        Ok(Self {
            embeddings: batch_embeddings(embeddings, batch)?,
            device: embeddings.cond.device(),
            scheduler,
            options,
            batch,
            started: Instant::now(),
        })
    }

    /// Latent shape for the whole batch at the requested output size.
    pub fn latent_dims(&self, model: &ModelConfig) -> [usize; 4] {
        let [_, c, h, w] = self.options.latent_dims(model);
        [self.batch, c, h, w]
    }

    /// Pure noise scaled to the scheduler's initial sigma.
    pub fn random_latent(&mut self, dims: [usize; 4]) -> Tensor<B, 4> {
        let sigma = self.scheduler.init_noise_sigma();
        self.scheduler.create_random_sample(dims, sigma, &self.device)
    }

    /// Unit noise from the run's generator.
    pub fn noise(&mut self, dims: [usize; 4]) -> Tensor<B, 4> {
        self.scheduler.create_random_sample(dims, 1.0, &self.device)
    }

    /// Encodes source images, adding `initial_noise_level` noise before scaling.
    pub fn encode_noised(&mut self, models: &ModelSet<'_, B>, image: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        let latent = encode_unscaled(models, &self.options, image)?;
        let level = self.options.initial_noise_level;
        let latent = if level > 0.0 {
            let noise = self.scheduler.create_random_sample(latent.dims(), level, &self.device);
            latent + noise
        } else {
            latent
        };

        Ok(scale_latent(latent, models.config))
    }

    /// Starting point of image-seeded tasks: `latent` noised to the first active timestep.
    pub fn noised_start(&mut self, latent: Tensor<B, 4>, timesteps: &[usize]) -> Result<(Tensor<B, 4>, Tensor<B, 4>)> {
        let first = *timesteps
            .first()
            .ok_or_else(|| DiffusionError::config("empty timestep schedule"))?;
        let noise = self.noise(latent.dims());
        let noised = self.scheduler.add_noise(latent, noise.clone(), first);

        Ok((noised, noise))
    }

    pub fn finish(&self, kind: DiffuserKind) {
        info!("Finished {:?} in {:?}", kind, self.started.elapsed());
    }
}

/// Options as the scheduler sees them; the dynamic flow-matching variant derives its
/// shift from the latent token count.
pub fn effective_options(options: &GenerationOptions, model: &ModelConfig) -> GenerationOptions {
    if options.scheduler != SchedulerKind::FlowMatchEulerDynamic {
        return options.clone();
    }

    let tokens = (options.latent_height(model) / 2) * (options.latent_width(model) / 2);
    options.clone().with_shift(dynamic_shift(tokens))
}

/// Embeddings repeated to `batch`, or an error when they carry a different batch.
pub fn batch_embeddings<B: Backend>(embeddings: &PromptEmbeddings<B>, batch: usize) -> Result<PromptEmbeddings<B>> {
    let found = embeddings.cond.dims()[0];

    if found == batch {
        Ok(embeddings.clone())
    } else if found == 1 {
        Ok(embeddings.repeat(batch))
    } else {
        Err(DiffusionError::shape_mismatch("prompt embeddings batch", &[batch], &[found]))
    }
}

/// Index where an image-seeded run enters the schedule: the tail keeps `round(len * strength)`
/// entries, at least one.
pub fn strength_start(len: usize, strength: f64) -> usize {
    let kept = ((len as f64 * strength).round() as usize).max(1);
    len.saturating_sub(kept)
}

/// Timesteps a run walks. Image-seeded runs skip the head of the schedule unless explicit
/// timesteps were given; two-pass schedulers always enter on a first pass.
pub fn active_timesteps<B: Backend>(scheduler: &dyn Scheduler<B>, options: &GenerationOptions, from_image: bool) -> Vec<usize> {
    let timesteps = scheduler.timesteps();
    if !from_image || !options.timesteps.is_empty() {
        return timesteps.to_vec();
    }

    let mut start = strength_start(timesteps.len(), options.strength);
    let two_pass = matches!(scheduler.kind(), SchedulerKind::Kdpm2 | SchedulerKind::Kdpm2Ancestral);
    if two_pass && start % 2 == 1 {
        start -= 1;
    }

    timesteps[start..].to_vec()
}

/// Model latent from a VAE latent.
pub fn scale_latent<B: Backend>(latent: Tensor<B, 4>, model: &ModelConfig) -> Tensor<B, 4> {
    if model.shift_factor == 0.0 {
        latent * model.scale_factor
    } else {
        latent.sub_scalar(model.shift_factor) * model.scale_factor
    }
}

/// VAE latent from a model latent.
pub fn unscale_latent<B: Backend>(latent: Tensor<B, 4>, model: &ModelConfig) -> Tensor<B, 4> {
    let latent = latent.div_scalar(model.scale_factor);
    if model.shift_factor == 0.0 {
        latent
    } else {
        latent.add_scalar(model.shift_factor)
    }
}

fn encode_unscaled<B: Backend>(models: &ModelSet<'_, B>, options: &GenerationOptions, images: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
    let encoder = models.encoder()?;
    let model = models.config;
    let factor = model.downscale_factor;

    // tile sizes are in latent pixels
    let tile = options
        .tile
        .clone()
        .with_size(options.tile.size * factor)
        .with_overlap(options.tile.overlap * factor);

    let latents = split_batch(images)
        .into_iter()
        .map(|image| process_tiled(image, &tile, factor, &mut |tile: Tensor<B, 4>| encoder.encode(tile)))
        .collect::<Result<Vec<_>>>()?;

    if options.memory_mode == MemoryMode::Minimum {
        encoder.unload();
    }

    let latent = Tensor::cat(latents, 0);
    let [n, _, _, _] = latent.dims();
    let [_, c, h, w] = options.latent_dims(model);
    ensure_dims(&latent, [n, c, h, w], "encoded latent")?;

    Ok(latent)
}

/// Encodes `[n, 3, H, W]` images to scaled model latents, tile by tile when enabled.
pub fn encode_image<B: Backend>(models: &ModelSet<'_, B>, options: &GenerationOptions, images: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
    encode_unscaled(models, options, images).map(|latent| scale_latent(latent, models.config))
}

/// Decodes every latent of the batch separately, tile by tile when enabled, and joins the
/// images along the batch axis.
pub fn decode_latents<B: Backend>(models: &ModelSet<'_, B>, options: &GenerationOptions, latent: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
    let decoder = models.decoder()?;
    let start = Instant::now();

    let latent = unscale_latent(latent, models.config);
    let images = split_batch(latent)
        .into_iter()
        .map(|latent| process_tiled(latent, &options.tile, 1, &mut |tile: Tensor<B, 4>| decoder.decode(tile)))
        .collect::<Result<Vec<_>>>()?;

    if options.memory_mode == MemoryMode::Minimum {
        decoder.unload();
    }

    info!("Decoded {} latents in {:?}", images.len(), start.elapsed());
    Ok(Tensor::cat(images, 0))
}
