use burn::tensor::{backend::Backend, Tensor};

use super::{active_timesteps, ConditioningInputs, DenoiseLoop, Diffuser, ModelSet, RunSetup};
use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::model::{ProgressSink, PromptEmbeddings};
use crate::options::{DiffuserKind, GenerationOptions};
use crate::tensor::repeat_batch;

/// Image-to-image: the encoded source image noised to the strength-selected timestep.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageDiffuser;

impl<B: Backend> Diffuser<B> for ImageDiffuser {
    fn kind(&self) -> DiffuserKind {
        DiffuserKind::ImageToImage
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
        let mut run = RunSetup::begin(DiffuserKind::ImageToImage, models, options, embeddings, options.batch_count)?;
        let image = inputs.image(&run.options)?;

        let timesteps = active_timesteps(run.scheduler.as_ref(), &run.options, true);
        let source = run.encode_noised(models, image)?;
        let (latent, _) = run.noised_start(repeat_batch(source, run.batch), &timesteps)?;

        let denoise = DenoiseLoop::new(
            models.denoiser,
            run.embeddings.clone(),
            &run.options,
            models.config,
            run.options.guidance_scale,
        );
        let latent = denoise.run(run.scheduler.as_mut(), &timesteps, latent, cancel, progress, |_, l| Ok(l))?;

        run.finish(DiffuserKind::ImageToImage);
        Ok(latent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::preview::LinearLatentDecoder;
    use crate::model::NoProgress;
    use crate::options::{MemoryMode, ModelConfig, SchedulerKind, TileOptions};
    use crate::scheduler::build_scheduler;
    use crate::tensor::{from_vec, to_vec};
    use crate::testing::{assert_approx_eq, CountingDenoiser, RecordingSink, TestBackend, Tracked, DEVICE};

    fn embeddings() -> PromptEmbeddings<TestBackend> {
        PromptEmbeddings::new(Tensor::ones([1, 4, 8], &DEVICE), Tensor::zeros([1, 4, 8], &DEVICE))
    }

    fn image() -> Tensor<TestBackend, 4> {
        Tensor::zeros([1, 3, 32, 32], &DEVICE).add_scalar(0.25)
    }

    #[test]
    fn half_strength_walks_the_tail_half() {
        let config = ModelConfig::stable_diffusion();
        let denoiser = CountingDenoiser::new(0.0);
        let encoder = Tracked::new(LinearLatentDecoder::stable_diffusion(8).inverse().unwrap());
        let models = ModelSet::new(&config, &denoiser).with_encoder(&encoder);
        let options = GenerationOptions::new()
            .with_width(32)
            .with_height(32)
            .with_scheduler(SchedulerKind::Ddpm)
            .with_inference_steps(20)
            .with_strength(0.5)
            .with_seed(Some(7));
        let sink = RecordingSink::default();

        let latent = ImageDiffuser
            .diffuse(
                &models,
                &options,
                &embeddings(),
                &ConditioningInputs::new().with_image(image()),
                &CancellationToken::new(),
                &sink,
            )
            .unwrap();

        assert_eq!(latent.dims(), [1, 4, 4, 4]);
        assert_eq!(denoiser.calls(), 10);
        assert_eq!(sink.records().last().map(|r| r.total), Some(10));

        let schedule = build_scheduler::<TestBackend>(&options, config.pipeline).unwrap();
        assert_eq!(denoiser.records()[0].timestep, schedule.timesteps()[10] as f64);
        assert_eq!(schedule.timesteps()[10], 473);
        assert_eq!(encoder.calls(), 1);
    }

    #[test]
    fn wrong_image_size_is_a_shape_mismatch() {
        let config = ModelConfig::stable_diffusion();
        let denoiser = CountingDenoiser::new(0.0);
        let encoder = LinearLatentDecoder::stable_diffusion(8).inverse().unwrap();
        let models = ModelSet::new(&config, &denoiser).with_encoder(&encoder);
        let options = GenerationOptions::new().with_width(64).with_height(64);

        let result = ImageDiffuser.diffuse(
            &models,
            &options,
            &embeddings(),
            &ConditioningInputs::new().with_image(image()),
            &CancellationToken::new(),
            &NoProgress,
        );

        assert!(matches!(result, Err(crate::DiffusionError::ShapeMismatch { .. })));
        assert_eq!(denoiser.calls(), 0);
    }

    #[test]
    fn minimum_memory_unloads_encoder_and_denoiser() {
        let config = ModelConfig::stable_diffusion();
        let denoiser = CountingDenoiser::new(0.0);
        let encoder = Tracked::new(LinearLatentDecoder::stable_diffusion(8).inverse().unwrap());
        let models = ModelSet::new(&config, &denoiser).with_encoder(&encoder);
        let options = GenerationOptions::new()
            .with_width(32)
            .with_height(32)
            .with_inference_steps(4)
            .with_strength(1.0)
            .with_batch_count(2)
            .with_initial_noise_level(0.1)
            .with_memory_mode(MemoryMode::Minimum);

        let latent = ImageDiffuser
            .diffuse(
                &models,
                &options,
                &embeddings(),
                &ConditioningInputs::new().with_image(image()),
                &CancellationToken::new(),
                &NoProgress,
            )
            .unwrap();

        assert_eq!(latent.dims(), [2, 4, 4, 4]);
        assert_eq!(denoiser.calls(), 4);
        assert_eq!(encoder.unloads(), 1);
        assert_eq!(denoiser.unloads(), 1);
    }

    #[test]
    fn tiled_run_matches_the_untiled_run() {
        let config = ModelConfig::stable_diffusion();
        let values = (0..3 * 128 * 128).map(|i| (i as f32 * 0.011).sin() * 0.8).collect();
        let source = from_vec::<TestBackend, 4>(values, [1, 3, 128, 128], &DEVICE);
        let options = GenerationOptions::new()
            .with_width(128)
            .with_height(128)
            .with_scheduler(SchedulerKind::Euler)
            .with_inference_steps(6)
            .with_strength(0.5)
            .with_seed(Some(13));

        let generate = |options: &GenerationOptions| {
            let denoiser = CountingDenoiser::new(0.05);
            let encoder = Tracked::new(LinearLatentDecoder::stable_diffusion(8).inverse().unwrap());
            let decoder = Tracked::new(LinearLatentDecoder::stable_diffusion(8));
            let models = ModelSet::new(&config, &denoiser).with_encoder(&encoder).with_decoder(&decoder);
            let images = ImageDiffuser
                .generate(
                    &models,
                    options,
                    &embeddings(),
                    &ConditioningInputs::new().with_image(source.clone()),
                    &CancellationToken::new(),
                    &NoProgress,
                )
                .unwrap();

            (images, encoder.calls(), decoder.calls())
        };

        let (whole, encodes, decodes) = generate(&options);
        assert_eq!((encodes, decodes), (1, 1));

        let tiled_options = options.clone().with_tile(TileOptions::new().with_enabled(true).with_size(8).with_overlap(2));
        let (tiled, encodes, decodes) = generate(&tiled_options);

        assert_eq!(tiled.dims(), [1, 3, 128, 128]);
        assert_eq!((encodes, decodes), (4, 4));
        assert_approx_eq(&to_vec(tiled), &to_vec(whole), 1e-3);
    }
}
