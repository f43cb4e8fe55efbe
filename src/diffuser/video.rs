use burn::tensor::{backend::Backend, Tensor};

use super::{active_timesteps, ConditioningInputs, DenoiseLoop, Diffuser, ModelSet, RunSetup};
use crate::cancel::CancellationToken;
use crate::error::{DiffusionError, Result};
use crate::model::{ProgressSink, PromptEmbeddings};
use crate::options::{DiffuserKind, GenerationOptions};

/// Video generation with frames laid out along the batch axis. Text-to-video starts every
/// frame from noise; video-to-video encodes the source frames and enters at `strength`.
#[derive(Debug, Clone, Copy)]
pub struct VideoDiffuser {
    from_video: bool,
}

impl VideoDiffuser {
    pub fn text() -> Self {
        Self { from_video: false }
    }

    pub fn video() -> Self {
        Self { from_video: true }
    }

    fn task(&self) -> DiffuserKind {
        if self.from_video {
            DiffuserKind::VideoToVideo
        } else {
            DiffuserKind::TextToVideo
        }
    }
}

impl<B: Backend> Diffuser<B> for VideoDiffuser {
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
        if options.batch_count > 1 {
            return Err(DiffusionError::config("video generation produces one clip per run, batch_count must be 1"));
        }

        let kind = self.task();
        let source = if self.from_video { Some(inputs.video(options)?) } else { None };
        let frames = source.as_ref().map(|video| video.dims()[0]).unwrap_or(options.frame_count);

        let mut run = RunSetup::begin(kind, models, options, embeddings, frames)?;
        let timesteps = active_timesteps(run.scheduler.as_ref(), &run.options, self.from_video);
        let latent = match source {
            Some(video) => {
                let encoded = run.encode_noised(models, video)?;
                run.noised_start(encoded, &timesteps)?.0
            }
            None => run.random_latent(run.latent_dims(models.config)),
        };

        let denoise = DenoiseLoop::new(
            models.denoiser,
            run.embeddings.clone(),
            &run.options,
            models.config,
            run.options.guidance_scale,
        );
        let latent = denoise.run(run.scheduler.as_mut(), &timesteps, latent, cancel, progress, |_, l| Ok(l))?;

        run.finish(kind);
        Ok(latent)
    }
}
