use burn::tensor::{backend::Backend, Tensor};

use super::{active_timesteps, ConditioningInputs, DenoiseLoop, Diffuser, ModelSet, RunSetup};
use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::model::{ProgressSink, PromptEmbeddings};
use crate::options::{DiffuserKind, GenerationOptions};
use crate::tensor::repeat_batch;

/// Text- or image-seeded generation steered by a control network and its control image.
#[derive(Debug, Clone, Copy)]
pub struct ControlNetDiffuser {
    from_image: bool,
}

impl ControlNetDiffuser {
    pub fn text() -> Self {
        Self { from_image: false }
    }

    pub fn image() -> Self {
        Self { from_image: true }
    }

    fn task(&self) -> DiffuserKind {
        if self.from_image {
            DiffuserKind::ControlNetImage
        } else {
            DiffuserKind::ControlNet
        }
    }
}

impl<B: Backend> Diffuser<B> for ControlNetDiffuser {
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
        let kind = self.task();
        let mut run = RunSetup::begin(kind, models, options, embeddings, options.batch_count)?;
        let controlnet = models.controlnet()?;
        let control_image = repeat_batch(inputs.control_image(&run.options)?, run.batch);

        let timesteps = active_timesteps(run.scheduler.as_ref(), &run.options, self.from_image);
        let latent = if self.from_image {
            let source = run.encode_noised(models, inputs.image(&run.options)?)?;
            run.noised_start(repeat_batch(source, run.batch), &timesteps)?.0
        } else {
            run.random_latent(run.latent_dims(models.config))
        };

        let denoise = DenoiseLoop::new(
            models.denoiser,
            run.embeddings.clone(),
            &run.options,
            models.config,
            run.options.guidance_scale,
        )
        .with_control(controlnet, control_image, run.options.conditioning_scale);
        let latent = denoise.run(run.scheduler.as_mut(), &timesteps, latent, cancel, progress, |_, l| Ok(l))?;

        run.finish(kind);
        Ok(latent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::preview::LinearLatentDecoder;
    use crate::model::NoProgress;
    use crate::options::{MemoryMode, ModelConfig};
    use crate::testing::{CountingDenoiser, MockControlNet, TestBackend, DEVICE};

    fn embeddings() -> PromptEmbeddings<TestBackend> {
        PromptEmbeddings::new(Tensor::ones([1, 4, 8], &DEVICE), Tensor::zeros([1, 4, 8], &DEVICE))
    }

    fn inputs() -> ConditioningInputs<TestBackend> {
        ConditioningInputs::new()
            .with_image(Tensor::zeros([1, 3, 32, 32], &DEVICE))
            .with_control_image(Tensor::ones([1, 3, 32, 32], &DEVICE))
    }

    fn options() -> GenerationOptions {
        GenerationOptions::new()
            .with_width(32)
            .with_height(32)
            .with_inference_steps(6)
            .with_conditioning_scale(0.45)
            .with_seed(Some(5))
    }

    #[test]
    fn control_network_runs_every_step() {
        let config = ModelConfig::stable_diffusion();
        let denoiser = CountingDenoiser::new(0.0);
        let controlnet = MockControlNet::default();
        let models = ModelSet::new(&config, &denoiser).with_controlnet(&controlnet);

        let latent = ControlNetDiffuser::text()
            .diffuse(&models, &options(), &embeddings(), &inputs(), &CancellationToken::new(), &NoProgress)
            .unwrap();

        assert_eq!(latent.dims(), [1, 4, 4, 4]);
        assert_eq!(controlnet.scales(), vec![0.45; 6]);
        assert!(denoiser.records().iter().all(|r| r.control_residuals == 1));
    }

    #[test]
    fn image_variant_enters_at_strength() {
        let config = ModelConfig::stable_diffusion();
        let denoiser = CountingDenoiser::new(0.0);
        let controlnet = MockControlNet::default();
        let encoder = LinearLatentDecoder::stable_diffusion(8).inverse().unwrap();
        let models = ModelSet::new(&config, &denoiser)
            .with_controlnet(&controlnet)
            .with_encoder(&encoder);
        let options = options().with_strength(0.5).with_memory_mode(MemoryMode::Minimum);

        ControlNetDiffuser::image()
            .diffuse(&models, &options, &embeddings(), &inputs(), &CancellationToken::new(), &NoProgress)
            .unwrap();

        assert_eq!(controlnet.calls(), 3);
        assert_eq!(denoiser.calls(), 3);
        assert_eq!(controlnet.unloads(), 1);
    }

    #[test]
    fn missing_control_inputs_fail_fast() {
        let config = ModelConfig::stable_diffusion();
        let denoiser = CountingDenoiser::new(0.0);
        let controlnet = MockControlNet::default();

        let no_net = ControlNetDiffuser::text().diffuse(
            &ModelSet::new(&config, &denoiser),
            &options(),
            &embeddings(),
            &inputs(),
            &CancellationToken::new(),
            &NoProgress,
        );
        assert!(matches!(no_net, Err(crate::DiffusionError::MissingInput("control network"))));

        let no_image = ControlNetDiffuser::text().diffuse(
            &ModelSet::new(&config, &denoiser).with_controlnet(&controlnet),
            &options(),
            &embeddings(),
            &ConditioningInputs::new(),
            &CancellationToken::new(),
            &NoProgress,
        );
        assert!(matches!(no_image, Err(crate::DiffusionError::MissingInput("control image"))));
        assert_eq!(denoiser.calls(), 0);
    }

    #[test]
    fn variants_report_their_task() {
        assert_eq!(Diffuser::<TestBackend>::kind(&ControlNetDiffuser::text()), DiffuserKind::ControlNet);
        assert_eq!(Diffuser::<TestBackend>::kind(&ControlNetDiffuser::image()), DiffuserKind::ControlNetImage);
    }
}
