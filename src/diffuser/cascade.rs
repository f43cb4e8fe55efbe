use burn::tensor::{backend::Backend, Tensor};
use tracing::info;

use super::{ConditioningInputs, DenoiseLoop, Diffuser, ModelSet, RunSetup};
use crate::cancel::CancellationToken;
use crate::error::{DiffusionError, Result};
use crate::model::{DiffusionStage, ProgressSink, PromptEmbeddings};
use crate::options::{DiffuserKind, GenerationOptions, MemoryMode};
use crate::tensor::{channel_projection, repeat_batch, resize_nearest, to_unit_range};

const PRIOR_CHANNELS: usize = 16;
const PRIOR_COMPRESSION: f64 = 42.67;
const DECODER_UPSCALE: f64 = 10.67;

pub const CLIP_IMAGE_CHANNELS: usize = 768;
const CLIP_IMAGE_SIZE: usize = 224;
const CLIP_MEAN: [f64; 3] = [0.48145466, 0.4578275, 0.40821073];
const CLIP_STD: [f64; 3] = [0.26862954, 0.26130258, 0.27577711];

/// Image in `[-1, 1]` resized to the CLIP input size and normalized per channel.
pub fn clip_image_features<B: Backend>(image: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
    let resized = resize_nearest(to_unit_range(image), CLIP_IMAGE_SIZE, CLIP_IMAGE_SIZE);
    let weights: Vec<Vec<f64>> = (0..3)
        .map(|i| (0..3).map(|j| if i == j { 1.0 / CLIP_STD[i] } else { 0.0 }).collect())
        .collect();
    let bias: Vec<f64> = CLIP_MEAN.iter().zip(CLIP_STD).map(|(m, s)| -m / s).collect();

    channel_projection(resized, &weights, &bias)
}

/// Prior latent shape for a `width` x `height` output.
pub fn prior_dims(options: &GenerationOptions, batch: usize) -> [usize; 4] {
    [
        batch,
        PRIOR_CHANNELS,
        (options.height as f64 / PRIOR_COMPRESSION).ceil() as usize,
        (options.width as f64 / PRIOR_COMPRESSION).ceil() as usize,
    ]
}

/// Decoder latent shape derived from the prior latent.
pub fn decoder_dims(prior: [usize; 4], channels: usize) -> [usize; 4] {
    let [batch, _, h, w] = prior;
    [
        batch,
        channels,
        (h as f64 * DECODER_UPSCALE) as usize,
        (w as f64 * DECODER_UPSCALE) as usize,
    ]
}

/// Two-stage generation: a compact prior latent is diffused first and conditions a second
/// diffusion at decoder resolution, each stage with its own scheduler and guidance scale.
/// Image variations condition the prior on the embedded source image.
#[derive(Debug, Clone, Copy)]
pub struct CascadeDiffuser {
    from_image: bool,
}

impl CascadeDiffuser {
    pub fn text() -> Self {
        Self { from_image: false }
    }

    pub fn image() -> Self {
        Self { from_image: true }
    }

    fn task(&self) -> DiffuserKind {
        if self.from_image {
            DiffuserKind::ImageToImage
        } else {
            DiffuserKind::TextToImage
        }
    }

    /// `(conditional, unconditional)` image embeddings `[batch, 1, d]`; zeros without a source.
    fn image_embeds<B: Backend>(
        &self,
        models: &ModelSet<'_, B>,
        options: &GenerationOptions,
        inputs: &ConditioningInputs<B>,
        batch: usize,
        device: &B::Device,
    ) -> Result<(Tensor<B, 3>, Tensor<B, 3>)> {
        if !self.from_image {
            let zeros = Tensor::zeros([batch, 1, CLIP_IMAGE_CHANNELS], device);
            return Ok((zeros.clone(), zeros));
        }

        let encoder = models.image_encoder()?;
        let features = clip_image_features(inputs.image(options)?)?;
        let embeds = encoder.encode(features)?;
        if options.memory_mode == MemoryMode::Minimum {
            encoder.unload();
        }

        let [n, d] = embeds.dims();
        if n != 1 {
            return Err(DiffusionError::shape_mismatch("image embeddings", &[1, d], &[n, d]));
        }

        let conditional = repeat_batch(embeds.reshape([1, 1, d]), batch);
        Ok((conditional, Tensor::zeros([batch, 1, d], device)))
    }
}

impl<B: Backend> Diffuser<B> for CascadeDiffuser {
    fn kind(&self) -> DiffuserKind {
        self.task()
    }

    fn diffuse(
        &self,
        models: &ModelSet<'_, B>,
        options: &GenerationOptions,
        embeddings: &PromptEmbeddings<B>,
        inputs: &ConditioningInputs<B>,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink<B>,
    ) -> Result<Tensor<B, 4>> {
        let _release = models.release_on_exit(options.memory_mode);
        let decoder_denoiser = models
            .decoder_denoiser
            .ok_or(DiffusionError::MissingInput("decoder denoiser"))?;

        let kind = self.task();
        let mut prior_run = RunSetup::begin(kind, models, options, embeddings, options.batch_count)?;
        let (image_embeds, unconditional_embeds) =
            self.image_embeds(models, &prior_run.options, inputs, prior_run.batch, &prior_run.device)?;
        let dims = prior_dims(&prior_run.options, prior_run.batch);
        let timesteps = prior_run.scheduler.timesteps().to_vec();
        let latent = prior_run.random_latent(dims);

        let prior = DenoiseLoop::new(
            models.denoiser,
            prior_run.embeddings.clone(),
            &prior_run.options,
            models.config,
            prior_run.options.guidance_scale,
        )
        .with_image_embeds(image_embeds, unconditional_embeds)
        .with_stage(DiffusionStage::Prior);
        let prior_latent = prior.run(prior_run.scheduler.as_mut(), &timesteps, latent, cancel, progress, |_, l| Ok(l))?;

        if options.memory_mode == MemoryMode::Minimum {
            models.denoiser.unload();
        }
        info!("Prior stage produced {:?}", prior_latent.dims());
        cancel.check()?;

        let decoder_options = options.clone().with_inference_steps(options.inference_steps2);
        let mut run = RunSetup::begin(kind, models, &decoder_options, embeddings, options.batch_count)?;
        let dims = decoder_dims(prior_latent.dims(), models.config.latent_channels);
        let timesteps = run.scheduler.timesteps().to_vec();
        let latent = run.random_latent(dims);

        let unconditional_prior = Tensor::zeros(prior_latent.dims(), &run.device);
        let decoder = DenoiseLoop::new(
            decoder_denoiser,
            run.embeddings.clone(),
            &run.options,
            models.config,
            run.options.guidance_scale2,
        )
        .with_image_conditioning(prior_latent, unconditional_prior)
        .with_stage(DiffusionStage::Decoder);
        let latent = decoder.run(run.scheduler.as_mut(), &timesteps, latent, cancel, progress, |_, l| Ok(l))?;

        run.finish(kind);
        Ok(latent)
    }
}
