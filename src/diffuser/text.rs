use burn::tensor::{backend::Backend, Tensor};

use super::{ConditioningInputs, DenoiseLoop, Diffuser, ModelSet, RunSetup};
use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::model::{ProgressSink, PromptEmbeddings};
use crate::options::{DiffuserKind, GenerationOptions};

/// Text-to-image from pure noise over the full schedule.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextDiffuser;

impl<B: Backend> Diffuser<B> for TextDiffuser {
    fn kind(&self) -> DiffuserKind {
        DiffuserKind::TextToImage
    }

    fn diffuse(
        &self,
        models: &ModelSet<'_, B>,
        options: &GenerationOptions,
        embeddings: &PromptEmbeddings<B>,
        _inputs: &ConditioningInputs<B>,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink<B>,
    ) -> Result<Tensor<B, 4>> {
        let _release = models.release_on_exit(options.memory_mode);
        let mut run = RunSetup::begin(DiffuserKind::TextToImage, models, options, embeddings, options.batch_count)?;

        let timesteps = run.scheduler.timesteps().to_vec();
        let latent = run.random_latent(run.latent_dims(models.config));

        let denoise = DenoiseLoop::new(
            models.denoiser,
            run.embeddings.clone(),
            &run.options,
            models.config,
            run.options.guidance_scale,
        );
        let latent = denoise.run(run.scheduler.as_mut(), &timesteps, latent, cancel, progress, |_, l| Ok(l))?;

        run.finish(DiffuserKind::TextToImage);
        Ok(latent)
    }
}
