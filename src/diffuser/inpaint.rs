use burn::tensor::{backend::Backend, Tensor};

use super::{encode_image, ConditioningInputs, DenoiseLoop, Diffuser, ModelSet, RunSetup};
use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::model::{ProgressSink, PromptEmbeddings};
use crate::options::{DiffuserKind, GenerationOptions};
use crate::tensor::{from_vec, repeat_batch, resize_nearest, to_vec};

/// Keep weight at `height` x `width`, thresholded: mask values of 0.5 and above are
/// regenerated. Repeated over `channels`.
fn binary_keep_mask<B: Backend>(mask: Tensor<B, 4>, height: usize, width: usize, channels: usize) -> Tensor<B, 4> {
    let device = mask.device();
    let keep = to_vec(resize_nearest(mask, height, width))
        .into_iter()
        .map(|v| if v >= 0.5 { 0.0 } else { 1.0 })
        .collect();
    let keep: Tensor<B, 4> = from_vec(keep, [1, 1, height, width], &device);

    Tensor::cat(vec![keep; channels], 1)
}

/// Mask channel and masked-image latent an inpainting denoiser takes alongside the latent.
pub fn inpaint_conditioning<B: Backend>(
    models: &ModelSet<'_, B>,
    options: &GenerationOptions,
    image: Tensor<B, 4>,
    mask: Tensor<B, 4>,
) -> Result<Tensor<B, 4>> {
    let [_, _, height, width] = options.latent_dims(models.config);

    let masked = image * binary_keep_mask(mask.clone(), options.height, options.width, 3);
    let masked_latent = encode_image(models, options, masked)?;
    let latent_mask = binary_keep_mask(mask, height, width, 1).neg().add_scalar(1.0);

    Ok(Tensor::cat(vec![latent_mask, masked_latent], 1))
}

/// Inpainting with a denoiser trained on the extra mask and masked-image channels. Starts
/// from pure noise over the full schedule.
#[derive(Debug, Clone, Copy, Default)]
pub struct InpaintDiffuser;

impl<B: Backend> Diffuser<B> for InpaintDiffuser {
    fn kind(&self) -> DiffuserKind {
        DiffuserKind::ImageInpaint
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
        let mut run = RunSetup::begin(DiffuserKind::ImageInpaint, models, options, embeddings, options.batch_count)?;
        let image = inputs.image(&run.options)?;
        let mask = inputs.mask(&run.options)?;

        let conditioning = inpaint_conditioning(models, &run.options, image, mask)?;
        let conditioning = repeat_batch(conditioning, run.batch);

        let timesteps = run.scheduler.timesteps().to_vec();
        let latent = run.random_latent(run.latent_dims(models.config));

        let denoise = DenoiseLoop::new(
            models.denoiser,
            run.embeddings.clone(),
            &run.options,
            models.config,
            run.options.guidance_scale,
        )
        .with_channel_concat(conditioning);
        let latent = denoise.run(run.scheduler.as_mut(), &timesteps, latent, cancel, progress, |_, l| Ok(l))?;

        run.finish(DiffuserKind::ImageInpaint);
        Ok(latent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::preview::LinearLatentDecoder;
    use crate::model::NoProgress;
    use crate::options::ModelConfig;
    use crate::tensor::{from_vec, to_vec};
    use crate::testing::{CountingDenoiser, TestBackend, DEVICE};

    fn embeddings() -> PromptEmbeddings<TestBackend> {
        PromptEmbeddings::new(Tensor::ones([1, 4, 8], &DEVICE), Tensor::zeros([1, 4, 8], &DEVICE))
    }

    fn top_half_mask() -> Tensor<TestBackend, 4> {
        let values = (0..32 * 32).map(|i| if i < 16 * 32 { 0.9 } else { 0.1 }).collect();
        from_vec(values, [1, 1, 32, 32], &DEVICE)
    }

    fn options() -> GenerationOptions {
        GenerationOptions::new()
            .with_width(32)
            .with_height(32)
            .with_inference_steps(5)
            .with_batch_count(2)
            .with_seed(Some(3))
    }

    #[test]
    fn conditioning_is_binary_mask_and_masked_latent() {
        let config = ModelConfig::stable_diffusion();
        let denoiser = CountingDenoiser::new(0.0);
        let encoder = LinearLatentDecoder::stable_diffusion(8).inverse().unwrap();
        let models = ModelSet::new(&config, &denoiser).with_encoder(&encoder);
        let image = Tensor::<TestBackend, 4>::ones([1, 3, 32, 32], &DEVICE);

        let conditioning = inpaint_conditioning(&models, &options(), image, top_half_mask()).unwrap();
        assert_eq!(conditioning.dims(), [1, 5, 4, 4]);

        let values = to_vec(conditioning);
        assert_eq!(&values[..16], &[1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);

        // regenerated pixels are blanked before encoding, so their latent is the encoder bias
        let blank = encode_image(&models, &options(), Tensor::zeros([1, 3, 32, 32], &DEVICE)).unwrap();
        let blank = to_vec(blank);
        for channel in 0..4 {
            let first = values[16 + channel * 16];
            assert!((first - blank[channel * 16]).abs() < 1e-5);
        }
    }

    #[test]
    fn denoiser_sees_nine_channels() {
        let config = ModelConfig::stable_diffusion();
        let denoiser = CountingDenoiser::new(0.2).with_output_channels(4);
        let encoder = LinearLatentDecoder::stable_diffusion(8).inverse().unwrap();
        let models = ModelSet::new(&config, &denoiser).with_encoder(&encoder);
        let image = Tensor::zeros([1, 3, 32, 32], &DEVICE).add_scalar(0.4);

        let latent = InpaintDiffuser
            .diffuse(
                &models,
                &options(),
                &embeddings(),
                &ConditioningInputs::new().with_image(image).with_mask(top_half_mask()),
                &CancellationToken::new(),
                &NoProgress,
            )
            .unwrap();

        assert_eq!(latent.dims(), [2, 4, 4, 4]);
        let records = denoiser.records();
        assert_eq!(records.len(), 5);
        assert!(records.iter().all(|r| r.channels == 9 && r.batch == 4));
    }

    #[test]
    fn missing_mask_is_reported() {
        let config = ModelConfig::stable_diffusion();
        let denoiser = CountingDenoiser::new(0.0);
        let encoder = LinearLatentDecoder::stable_diffusion(8).inverse().unwrap();
        let models = ModelSet::new(&config, &denoiser).with_encoder(&encoder);

        let result = InpaintDiffuser.diffuse(
            &models,
            &options(),
            &embeddings(),
            &ConditioningInputs::new().with_image(Tensor::zeros([1, 3, 32, 32], &DEVICE)),
            &CancellationToken::new(),
            &NoProgress,
        );

        assert!(matches!(result, Err(crate::DiffusionError::MissingInput("input mask"))));
        assert_eq!(denoiser.calls(), 0);
    }
}
