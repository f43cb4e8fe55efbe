pub mod oracle;
pub mod preview;

use std::time::Duration;

use burn::tensor::{backend::Backend, Tensor};

use crate::error::{DiffusionError, Result};
use crate::tensor::repeat_batch;

/// Inputs of one denoiser forward pass. Optional fields are only set for pipelines whose
/// denoiser consumes them.
#[derive(Debug, Clone)]
pub struct DenoiserInput<B: Backend> {
    /// Scaled latent, batch-doubled `[uncond; cond]` when guidance is batched. Packed-latent
    /// models receive `[n, 1, tokens, 4 * channels]`.
    pub latent: Tensor<B, 4>,
    pub timestep: f64,
    pub encoder_hidden_states: Tensor<B, 3>,
    pub pooled: Option<Tensor<B, 2>>,
    /// SDXL size/crop conditioning.
    pub time_ids: Option<Tensor<B, 2>>,
    pub guidance_embedding: Option<Tensor<B, 2>>,
    /// Residuals from a side-conditioning network, added inside the denoiser.
    pub control_residuals: Vec<Tensor<B, 4>>,
    /// Spatial conditioning concatenated or injected by the denoiser: the prior latent
    /// for cascade decoders, mask and masked image for inpainting denoisers.
    pub image_conditioning: Option<Tensor<B, 4>>,
    /// Image embeddings `[n, 1, d]` of image-variation priors.
    pub image_embeds: Option<Tensor<B, 3>>,
    /// Distilled guidance strength, shape `[1]`.
    pub guidance: Option<Tensor<B, 1>>,
    /// Positional ids `[tokens, 3]` of packed latent patches.
    pub image_ids: Option<Tensor<B, 2>>,
    /// Positional ids `[sequence, 3]` of the prompt tokens.
    pub text_ids: Option<Tensor<B, 2>>,
}

impl<B: Backend> DenoiserInput<B> {
    pub fn new(latent: Tensor<B, 4>, timestep: f64, encoder_hidden_states: Tensor<B, 3>) -> Self {
        Self {
            latent,
            timestep,
            encoder_hidden_states,
            pooled: None,
            time_ids: None,
            guidance_embedding: None,
            control_residuals: vec![],
            image_conditioning: None,
            image_embeds: None,
            guidance: None,
            image_ids: None,
            text_ids: None,
        }
    }
}

/// Noise (or velocity) predicting network.
pub trait Denoiser<B: Backend> {
    fn infer(&self, input: DenoiserInput<B>) -> Result<Tensor<B, 4>>;

    /// Releases device memory. Idempotent.
    fn unload(&self) {}
}

#[derive(Debug, Clone)]
pub struct ControlNetInput<B: Backend> {
    pub latent: Tensor<B, 4>,
    pub timestep: f64,
    pub encoder_hidden_states: Tensor<B, 3>,
    pub pooled: Option<Tensor<B, 2>>,
    pub control_image: Tensor<B, 4>,
    pub conditioning_scale: f64,
}

/// Side-conditioning network producing residuals for the denoiser.
pub trait ControlNet<B: Backend> {
    fn infer(&self, input: ControlNetInput<B>) -> Result<Vec<Tensor<B, 4>>>;

    fn unload(&self) {}
}

/// Image `[n, 3, H, W]` in `[-1, 1]` to an unscaled latent.
pub trait LatentEncoder<B: Backend> {
    fn encode(&self, image: Tensor<B, 4>) -> Result<Tensor<B, 4>>;

    fn unload(&self) {}
}

/// Image `[n, 3, 224, 224]` in CLIP-normalized space to pooled image embeddings `[n, d]`.
pub trait ImageEncoder<B: Backend> {
    fn encode(&self, image: Tensor<B, 4>) -> Result<Tensor<B, 2>>;

    fn unload(&self) {}
}

/// Unscaled latent to an image in `[-1, 1]`.
pub trait LatentDecoder<B: Backend> {
    fn decode(&self, latent: Tensor<B, 4>) -> Result<Tensor<B, 4>>;

    fn unload(&self) {}
}

/// Prompt embeddings produced outside the crate.
#[derive(Debug, Clone)]
pub struct PromptEmbeddings<B: Backend> {
    pub cond: Tensor<B, 3>,
    pub pooled: Option<Tensor<B, 2>>,
    pub uncond: Tensor<B, 3>,
    pub uncond_pooled: Option<Tensor<B, 2>>,
}

impl<B: Backend> PromptEmbeddings<B> {
    pub fn new(cond: Tensor<B, 3>, uncond: Tensor<B, 3>) -> Self {
        Self {
            cond,
            pooled: None,
            uncond,
            uncond_pooled: None,
        }
    }

    pub fn with_pooled(self, pooled: Tensor<B, 2>, uncond_pooled: Tensor<B, 2>) -> Self {
        Self {
            pooled: Some(pooled),
            uncond_pooled: Some(uncond_pooled),
            ..self
        }
    }

    /// Conditional and unconditional halves must agree in shape.
    pub fn validate(&self) -> Result<()> {
        let (cond, uncond) = (self.cond.dims(), self.uncond.dims());
        if cond != uncond {
            return Err(DiffusionError::shape_mismatch("unconditional embeddings", &cond, &uncond));
        }

        match (&self.pooled, &self.uncond_pooled) {
            (None, None) => Ok(()),
            (Some(pooled), Some(uncond_pooled)) => {
                let (pooled, uncond_pooled) = (pooled.dims(), uncond_pooled.dims());
                if pooled == uncond_pooled {
                    Ok(())
                } else {
                    Err(DiffusionError::shape_mismatch("unconditional pooled embeddings", &pooled, &uncond_pooled))
                }
            }
            (Some(_), None) => Err(DiffusionError::MissingInput("unconditional pooled embeddings")),
            (None, Some(_)) => Err(DiffusionError::MissingInput("pooled embeddings")),
        }
    }

    /// Repeats every tensor `times` along the batch axis.
    pub fn repeat(&self, times: usize) -> Self {
        Self {
            cond: repeat_batch(self.cond.clone(), times),
            pooled: self.pooled.clone().map(|p| repeat_batch(p, times)),
            uncond: repeat_batch(self.uncond.clone(), times),
            uncond_pooled: self.uncond_pooled.clone().map(|p| repeat_batch(p, times)),
        }
    }

    /// `[uncond; cond]` along the batch axis, the layout batched guidance expects.
    pub fn batched(&self) -> (Tensor<B, 3>, Option<Tensor<B, 2>>) {
        let hidden = Tensor::cat(vec![self.uncond.clone(), self.cond.clone()], 0);
        let pooled = match (&self.uncond_pooled, &self.pooled) {
            (Some(u), Some(c)) => Some(Tensor::cat(vec![u.clone(), c.clone()], 0)),
            _ => None,
        };

        (hidden, pooled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffusionStage {
    Denoise,
    Prior,
    Decoder,
}

/// Reported once per timestep.
#[derive(Debug, Clone)]
pub struct DiffusionProgress<B: Backend> {
    pub step: usize,
    pub total: usize,
    pub elapsed: Duration,
    pub stage: DiffusionStage,
    pub preview: Option<Tensor<B, 4>>,
}

pub trait ProgressSink<B: Backend> {
    fn on_progress(&self, progress: DiffusionProgress<B>);
}

impl<B: Backend, F: Fn(DiffusionProgress<B>)> ProgressSink<B> for F {
    fn on_progress(&self, progress: DiffusionProgress<B>) {
        self(progress)
    }
}

/// Sink that drops every report.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl<B: Backend> ProgressSink<B> for NoProgress {
    fn on_progress(&self, _progress: DiffusionProgress<B>) {}
}
