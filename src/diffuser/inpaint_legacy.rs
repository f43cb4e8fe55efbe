use burn::tensor::{backend::Backend, Tensor};

use super::{active_timesteps, ConditioningInputs, DenoiseLoop, Diffuser, ModelSet, RunSetup};
use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::model::{ProgressSink, PromptEmbeddings};
use crate::options::{DiffuserKind, GenerationOptions};
use crate::tensor::{repeat_batch, resize_nearest};

/// Mask at latent resolution as a keep weight `1 - mask`: 1 where the source is preserved,
/// 0 where it is regenerated, fractional along soft edges. Repeated over `channels`.
pub fn keep_mask<B: Backend>(mask: Tensor<B, 4>, height: usize, width: usize, channels: usize) -> Tensor<B, 4> {
    let keep = resize_nearest(mask, height, width).clamp(0.0, 1.0).neg().add_scalar(1.0);

    Tensor::cat(vec![keep; channels], 1)
}

/// Inpainting with a plain denoiser: after every step the preserved region is overwritten with
/// the source latent renoised to the next timestep, and with the clean source after the last.
#[derive(Debug, Clone, Copy, Default)]
pub struct InpaintLegacyDiffuser;

impl<B: Backend> Diffuser<B> for InpaintLegacyDiffuser {
    fn kind(&self) -> DiffuserKind {
        DiffuserKind::ImageInpaintLegacy
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
        let mut run = RunSetup::begin(DiffuserKind::ImageInpaintLegacy, models, options, embeddings, options.batch_count)?;
        let image = inputs.image(&run.options)?;
        let mask = inputs.mask(&run.options)?;

        let [batch, channels, height, width] = run.latent_dims(models.config);
        let keep = repeat_batch(keep_mask(mask, height, width, channels), batch);
        let regenerate = keep.clone().neg().add_scalar(1.0);

        let timesteps = active_timesteps(run.scheduler.as_ref(), &run.options, true);
        let source = repeat_batch(run.encode_noised(models, image)?, batch);
        let (latent, noise) = run.noised_start(source.clone(), &timesteps)?;

        let denoise = DenoiseLoop::new(
            models.denoiser,
            run.embeddings.clone(),
            &run.options,
            models.config,
            run.options.guidance_scale,
        );

        let scheduler = run.scheduler.as_mut();
        let mut renoised = Vec::with_capacity(timesteps.len());
        for &t in timesteps.iter().skip(1) {
            renoised.push(scheduler.add_noise(source.clone(), noise.clone(), t));
        }
        renoised.push(source);

        let latent = denoise.run(scheduler, &timesteps, latent, cancel, progress, |index, stepped| {
            let preserved = renoised[index].clone();
            Ok(preserved * keep.clone() + stepped * regenerate.clone())
        })?;

        run.finish(DiffuserKind::ImageInpaintLegacy);
        Ok(latent)
    }
}
