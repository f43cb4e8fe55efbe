use burn::tensor::{backend::Backend, Tensor};

use crate::error::{DiffusionError, Result};
use crate::tensor::from_f64;

/// `[n, c, h, w]` latent to `[n, (h / 2) * (w / 2), 4c]` tokens, one per 2x2 patch, row-major
/// over patches with the channel-major patch contents as features.
pub fn pack_latents<B: Backend>(latent: Tensor<B, 4>) -> Result<Tensor<B, 3>> {
    let [n, c, h, w] = latent.dims();
    if h % 2 != 0 || w % 2 != 0 {
        return Err(DiffusionError::shape_mismatch("packed latent", &[n, c, h / 2 * 2, w / 2 * 2], &[n, c, h, w]));
    }

    let (rows, cols) = (h / 2, w / 2);
    // [n, c, rows, 2, cols, 2] -> [n, rows, cols, c, 2, 2]
    let patches = latent
        .reshape([n, c, rows, 2, cols, 2])
        .swap_dims(1, 2)
        .swap_dims(2, 4)
        .swap_dims(3, 4);

    Ok(patches.reshape([n, rows * cols, c * 4]))
}

/// Inverse of [`pack_latents`] for a latent of `height` x `width`.
pub fn unpack_latents<B: Backend>(tokens: Tensor<B, 3>, height: usize, width: usize) -> Result<Tensor<B, 4>> {
    let [n, count, features] = tokens.dims();
    let (rows, cols) = (height / 2, width / 2);
    if height % 2 != 0 || width % 2 != 0 || count != rows * cols || features % 4 != 0 {
        return Err(DiffusionError::shape_mismatch(
            "latent tokens",
            &[n, rows * cols, features / 4 * 4],
            &[n, count, features],
        ));
    }

    let c = features / 4;
    // [n, rows, cols, c, 2, 2] -> [n, c, rows, 2, cols, 2]
    let latent = tokens
        .reshape([n, rows, cols, c, 2, 2])
        .swap_dims(1, 3)
        .swap_dims(2, 3)
        .swap_dims(3, 4);

    Ok(latent.reshape([n, c, height, width]))
}

/// `[rows * cols, 3]` ids `(0, row, col)` locating each packed patch.
pub fn image_ids<B: Backend>(rows: usize, cols: usize, device: &B::Device) -> Tensor<B, 2> {
    let values: Vec<f64> = (0..rows)
        .flat_map(|i| (0..cols).flat_map(move |j| [0.0, i as f64, j as f64]))
        .collect();

    from_f64(&values, [rows * cols, 3], device)
}

/// Extra inputs of packed-latent denoisers that stay fixed for a whole stage.
#[derive(Debug, Clone)]
pub struct PatchConditioning<B: Backend> {
    pub guidance: Tensor<B, 1>,
    pub text_ids: Tensor<B, 2>,
}

impl<B: Backend> PatchConditioning<B> {
    /// `sequence` is the prompt token count; prompt tokens share the zero position.
    pub fn new(guidance_scale: f64, sequence: usize, device: &B::Device) -> Self {
        Self {
            guidance: from_f64(&[guidance_scale], [1], device),
            text_ids: Tensor::zeros([sequence, 3], device),
        }
    }
}
