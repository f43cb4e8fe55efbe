use burn::tensor::{backend::Backend, Tensor};

use super::{LatentDecoder, LatentEncoder};
use crate::error::{DiffusionError, Result};
use crate::tensor::{channel_projection, resize_nearest};

const SD_LATENT_RGB: [[f64; 3]; 4] = [
    [0.3512, 0.2297, 0.3227],
    [0.3250, 0.4974, 0.2350],
    [-0.2829, 0.1762, 0.2721],
    [-0.2120, -0.2616, -0.7177],
];

const SDXL_LATENT_RGB: [[f64; 3]; 4] = [
    [0.3651, 0.4232, 0.4341],
    [-0.2533, -0.0042, 0.1068],
    [0.1076, 0.1111, -0.0362],
    [-0.3165, -0.2492, -0.2188],
];

const SDXL_LATENT_RGB_BIAS: [f64; 3] = [0.1084, -0.0175, -0.0011];

/// Per-pixel linear approximation of a VAE decoder, for cheap previews. Works on unscaled
/// latents and upsamples by nearest neighbour.
#[derive(Debug, Clone)]
pub struct LinearLatentDecoder {
    weights: Vec<Vec<f64>>,
    bias: Vec<f64>,
    upscale: usize,
}

impl LinearLatentDecoder {
    pub fn new(weights: Vec<Vec<f64>>, bias: Vec<f64>, upscale: usize) -> Self {
        Self {
            weights,
            bias,
            upscale: upscale.max(1),
        }
    }

    pub fn stable_diffusion(upscale: usize) -> Self {
        Self::new(SD_LATENT_RGB.iter().map(|r| r.to_vec()).collect(), vec![0.0; 3], upscale)
    }

    pub fn stable_diffusion_xl(upscale: usize) -> Self {
        Self::new(
            SDXL_LATENT_RGB.iter().map(|r| r.to_vec()).collect(),
            SDXL_LATENT_RGB_BIAS.to_vec(),
            upscale,
        )
    }

    pub fn latent_channels(&self) -> usize {
        self.weights.len()
    }

    /// Least-squares inverse: average-pools the image and maps RGB back to latent channels.
    pub fn inverse(&self) -> Result<LinearLatentEncoder> {
        // P = (W^T W)^-1 W^T, so that P W = I
        let channels = self.weights.len();
        let mut gram = [[0.0; 3]; 3];
        for row in &self.weights {
            if row.len() != 3 {
                return Err(DiffusionError::shape_mismatch("latent rgb factors", &[channels, 3], &[channels, row.len()]));
            }
            for i in 0..3 {
                for j in 0..3 {
                    gram[i][j] += row[i] * row[j];
                }
            }
        }

        let inverse = invert3(gram).ok_or(DiffusionError::NumericalFault {
            context: "singular latent rgb factors".into(),
        })?;

        let projection = (0..3)
            .map(|i| {
                (0..channels)
                    .map(|c| (0..3).map(|k| inverse[i][k] * self.weights[c][k]).sum())
                    .collect()
            })
            .collect();

        Ok(LinearLatentEncoder {
            projection,
            bias: self.bias.clone(),
            downscale: self.upscale,
        })
    }
}

fn invert3(m: [[f64; 3]; 3]) -> Option<[[f64; 3]; 3]> {
    let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1]) - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
    if det.abs() < 1e-12 {
        return None;
    }

    let mut out = [[0.0; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, value) in row.iter_mut().enumerate() {
            // cofactor of m[j][i]
            let (r0, r1) = ((j + 1) % 3, (j + 2) % 3);
            let (c0, c1) = ((i + 1) % 3, (i + 2) % 3);
            *value = (m[r0][c0] * m[r1][c1] - m[r0][c1] * m[r1][c0]) / det;
        }
    }

    Some(out)
}

impl<B: Backend> LatentDecoder<B> for LinearLatentDecoder {
    fn decode(&self, latent: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        let [_, _, h, w] = latent.dims();
        let rgb = channel_projection(latent, &self.weights, &self.bias)?;

        Ok(resize_nearest(rgb, h * self.upscale, w * self.upscale))
    }
}

/// Inverse of [`LinearLatentDecoder`].
#[derive(Debug, Clone)]
pub struct LinearLatentEncoder {
    projection: Vec<Vec<f64>>,
    bias: Vec<f64>,
    downscale: usize,
}

impl<B: Backend> LatentEncoder<B> for LinearLatentEncoder {
    fn encode(&self, image: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        let [n, c, h, w] = image.dims();
        let f = self.downscale;
        if h % f != 0 || w % f != 0 {
            return Err(DiffusionError::shape_mismatch("image size", &[n, c, h / f * f, w / f * f], &[n, c, h, w]));
        }

        let pooled = image
            .reshape([n, c, h / f, f, w / f, f])
            .mean_dim(5)
            .mean_dim(3)
            .reshape([n, c, h / f, w / f]);
        let bias: Vec<f64> = self.bias.iter().map(|b| -b).collect();
        let zero = vec![0.0; self.projection.first().map(|r| r.len()).unwrap_or(0)];

        let centred = channel_projection(pooled, &identity(c), &bias)?;
        channel_projection(centred, &self.projection, &zero)
    }
}

fn identity(n: usize) -> Vec<Vec<f64>> {
    (0..n).map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect()).collect()
}
