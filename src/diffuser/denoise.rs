use std::time::Instant;

use burn::tensor::{backend::Backend, Tensor};
use tracing::debug;

use super::flux::{image_ids, pack_latents, unpack_latents, PatchConditioning};
use crate::cancel::CancellationToken;
use crate::error::{DiffusionError, Result};
use crate::guidance::{apply_batched, combine, guidance_enabled};
use crate::model::{
    ControlNet, ControlNetInput, Denoiser, DenoiserInput, DiffusionProgress, DiffusionStage, ProgressSink,
    PromptEmbeddings,
};
use crate::options::{GenerationOptions, ModelConfig};
use crate::scheduler::{guidance_embedding, Scheduler};
use crate::tensor::{ensure_dims, ensure_finite, from_f64, repeat_batch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Branch {
    Conditional,
    Unconditional,
    /// `[unconditional; conditional]` in one call.
    Batched,
}

impl Branch {
    fn batch_factor(&self) -> usize {
        match self {
            Branch::Batched => 2,
            _ => 1,
        }
    }

    /// This branch's half of a `(conditional, unconditional)` pair.
    fn select<B: Backend, const D: usize>(&self, pair: &(Tensor<B, D>, Tensor<B, D>)) -> Tensor<B, D> {
        let (conditional, unconditional) = pair;
        match self {
            Branch::Conditional => conditional.clone(),
            Branch::Unconditional => unconditional.clone(),
            Branch::Batched => Tensor::cat(vec![unconditional.clone(), conditional.clone()], 0),
        }
    }
}

struct Control<'a, B: Backend> {
    net: &'a dyn ControlNet<B>,
    image: Tensor<B, 4>,
    scale: f64,
}

/// SDXL size conditioning, `[h, w, 0, 0, h, w]` per image, or `[h, w, 0, 0, score]` for
/// refiner-style models.
pub fn sdxl_time_ids<B: Backend>(options: &GenerationOptions, model: &ModelConfig, batch: usize, device: &B::Device) -> Tensor<B, 2> {
    let (h, w) = (options.height as f64, options.width as f64);
    let row = if model.aesthetic_time_ids {
        vec![h, w, 0.0, 0.0, options.aesthetic_score]
    } else {
        vec![h, w, 0.0, 0.0, h, w]
    };

    from_f64(&row.repeat(batch), [batch, row.len()], device)
}

/// One denoising stage: everything the per-timestep loop feeds the denoiser.
pub struct DenoiseLoop<'a, B: Backend> {
    denoiser: &'a dyn Denoiser<B>,
    embeddings: PromptEmbeddings<B>,
    guidance_scale: f64,
    guidance: bool,
    batch_guidance: bool,
    learned_variance: bool,
    time_ids: Option<Tensor<B, 2>>,
    guidance_embedding: Option<Tensor<B, 2>>,
    image_conditioning: Option<(Tensor<B, 4>, Tensor<B, 4>)>,
    image_embeds: Option<(Tensor<B, 3>, Tensor<B, 3>)>,
    patches: Option<PatchConditioning<B>>,
    timestep_scale: f64,
    channel_concat: Option<Tensor<B, 4>>,
    control: Option<Control<'a, B>>,
    stage: DiffusionStage,
    preview: bool,
}

impl<'a, B: Backend> DenoiseLoop<'a, B> {
    /// `embeddings` must already match the latent batch.
    pub fn new(
        denoiser: &'a dyn Denoiser<B>,
        embeddings: PromptEmbeddings<B>,
        options: &GenerationOptions,
        model: &ModelConfig,
        guidance_scale: f64,
    ) -> Self {
        let batch = embeddings.cond.dims()[0];
        let device = embeddings.cond.device();

        let guidance_embedding = model
            .guidance_embedding
            .then(|| repeat_batch(guidance_embedding(guidance_scale, &device), batch));
        let time_ids = model
            .pipeline
            .uses_time_ids()
            .then(|| sdxl_time_ids(options, model, batch, &device));
        let sequence = embeddings.cond.dims()[1];
        let patches = model
            .packed_latents
            .then(|| PatchConditioning::new(options.guidance_scale2, sequence, &device));

        // packed-latent models guide above unit scale, one branch per call
        let guidance = if model.packed_latents {
            guidance_scale > 1.0
        } else {
            guidance_enabled(guidance_scale) && !model.guidance_embedding
        };

        Self {
            denoiser,
            embeddings,
            guidance_scale,
            guidance,
            batch_guidance: options.batch_guidance && !model.packed_latents,
            learned_variance: options.variance_type.is_learned(),
            time_ids,
            guidance_embedding,
            image_conditioning: None,
            image_embeds: None,
            patches,
            timestep_scale: model.timestep_scale,
            channel_concat: None,
            control: None,
            stage: DiffusionStage::Denoise,
            preview: options.preview,
        }
    }

    /// Spatial conditioning for each guidance branch.
    pub fn with_image_conditioning(self, conditional: Tensor<B, 4>, unconditional: Tensor<B, 4>) -> Self {
        Self {
            image_conditioning: Some((conditional, unconditional)),
            ..self
        }
    }

    /// Pooled image embeddings `[n, 1, d]` for each guidance branch.
    pub fn with_image_embeds(self, conditional: Tensor<B, 3>, unconditional: Tensor<B, 3>) -> Self {
        Self {
            image_embeds: Some((conditional, unconditional)),
            ..self
        }
    }

    /// Channels appended to the scaled latent before every denoiser call.
    pub fn with_channel_concat(self, extra: Tensor<B, 4>) -> Self {
        Self {
            channel_concat: Some(extra),
            ..self
        }
    }

    pub fn with_control(self, net: &'a dyn ControlNet<B>, image: Tensor<B, 4>, scale: f64) -> Self {
        Self {
            control: Some(Control { net, image, scale }),
            ..self
        }
    }

    pub fn with_stage(self, stage: DiffusionStage) -> Self {
        Self { stage, ..self }
    }

    pub fn performs_guidance(&self) -> bool {
        self.guidance
    }

    fn infer(&self, latent: Tensor<B, 4>, timestep: f64, branch: Branch) -> Result<Tensor<B, 4>> {
        let times = branch.batch_factor();
        let (hidden, pooled) = match branch {
            Branch::Conditional => (self.embeddings.cond.clone(), self.embeddings.pooled.clone()),
            Branch::Unconditional => (self.embeddings.uncond.clone(), self.embeddings.uncond_pooled.clone()),
            Branch::Batched => self.embeddings.batched(),
        };

        let control_residuals = match &self.control {
            Some(control) => control.net.infer(ControlNetInput {
                latent: latent.clone(),
                timestep,
                encoder_hidden_states: hidden.clone(),
                pooled: pooled.clone(),
                control_image: repeat_batch(control.image.clone(), times),
                conditioning_scale: control.scale,
            })?,
            None => vec![],
        };

        let expected = latent.dims();
        let model_latent = match &self.channel_concat {
            Some(extra) => Tensor::cat(vec![latent, repeat_batch(extra.clone(), times)], 1),
            None => latent,
        };

        let image_conditioning = self.image_conditioning.as_ref().map(|pair| branch.select(pair));
        let image_embeds = self.image_embeds.as_ref().map(|pair| branch.select(pair));

        let [n, _, h, w] = model_latent.dims();
        let (model_latent, patch_ids) = match &self.patches {
            Some(_) => {
                let tokens = pack_latents(model_latent)?;
                let [_, count, features] = tokens.dims();
                let ids = image_ids(h / 2, w / 2, &tokens.device());
                (tokens.reshape([n, 1, count, features]), Some(ids))
            }
            None => (model_latent, None),
        };
        let model_dims = model_latent.dims();

        let output = self.denoiser.infer(DenoiserInput {
            latent: model_latent,
            timestep,
            encoder_hidden_states: hidden,
            pooled,
            time_ids: self.time_ids.clone().map(|ids| repeat_batch(ids, times)),
            guidance_embedding: self.guidance_embedding.clone().map(|g| repeat_batch(g, times)),
            control_residuals,
            image_conditioning,
            image_embeds,
            guidance: self.patches.as_ref().map(|p| p.guidance.clone()),
            image_ids: patch_ids,
            text_ids: self.patches.as_ref().map(|p| p.text_ids.clone()),
        })?;

        let output = match &self.patches {
            Some(_) => {
                ensure_dims(&output, model_dims, "denoiser output")?;
                let [_, _, count, features] = model_dims;
                unpack_latents(output.reshape([n, count, features]), h, w)?
            }
            None => output,
        };

        // learned variance doubles the channel axis
        let found = output.dims();
        let channels_match = found[1] == expected[1] || (self.learned_variance && found[1] == 2 * expected[1]);
        if [found[0], found[2], found[3]] != [expected[0], expected[2], expected[3]] || !channels_match {
            return Err(DiffusionError::shape_mismatch("denoiser output", &expected, &found));
        }

        Ok(output)
    }

    /// Guided noise prediction for a scaled latent.
    pub fn predict(&self, latent: Tensor<B, 4>, timestep: f64) -> Result<Tensor<B, 4>> {
        if !self.guidance {
            return self.infer(latent, timestep, Branch::Conditional);
        }

        if self.batch_guidance {
            let doubled = Tensor::cat(vec![latent.clone(), latent], 0);
            let prediction = self.infer(doubled, timestep, Branch::Batched)?;
            return apply_batched(prediction, self.guidance_scale);
        }

        let unconditional = self.infer(latent.clone(), timestep, Branch::Unconditional)?;
        let conditional = self.infer(latent, timestep, Branch::Conditional)?;
        Ok(combine(conditional, unconditional, self.guidance_scale))
    }

    /// Walks `timesteps`, checking `cancel` before each one. `after_step` sees the step index
    /// and the scheduler's output and returns the latent carried into the next step.
    pub fn run<F>(
        &self,
        scheduler: &mut dyn Scheduler<B>,
        timesteps: &[usize],
        mut latent: Tensor<B, 4>,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink<B>,
        mut after_step: F,
    ) -> Result<Tensor<B, 4>>
    where
        F: FnMut(usize, Tensor<B, 4>) -> Result<Tensor<B, 4>>,
    {
        let total = timesteps.len();

        for (index, &timestep) in timesteps.iter().enumerate() {
            cancel.check()?;
            let start = Instant::now();

            let input = scheduler.scale_input(latent.clone(), timestep);
            let prediction = self.predict(input, scheduler.model_timestep(timestep) / self.timestep_scale)?;
            ensure_finite(&prediction, "denoiser output")?;

            let step = scheduler.step(prediction, timestep, latent)?;
            latent = after_step(index, step.prev_sample)?;
            ensure_finite(&latent, "latent")?;

            let elapsed = start.elapsed();
            debug!("{:?} step {}/{} (t = {}) took {:?}", self.stage, index + 1, total, timestep, elapsed);

            progress.on_progress(DiffusionProgress {
                step: index + 1,
                total,
                elapsed,
                stage: self.stage,
                preview: self.preview.then(|| latent.clone()),
            });
        }

        Ok(latent)
    }
}
