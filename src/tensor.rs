use std::f64::consts::PI;

use burn::tensor::{backend::Backend, Data, Shape, Tensor};
use num_traits::ToPrimitive;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::error::{DiffusionError, Result};

pub fn to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor.into_data().convert::<f32>().value
}

pub fn from_vec<B: Backend, const D: usize>(values: Vec<f32>, dims: [usize; D], device: &B::Device) -> Tensor<B, D> {
    Tensor::from_floats(Data::new(values, Shape::new(dims)), device)
}

pub fn from_f64<B: Backend, const D: usize>(values: &[f64], dims: [usize; D], device: &B::Device) -> Tensor<B, D> {
    from_vec(values.iter().map(|&v| v as f32).collect(), dims, device)
}

/// Fails with `NumericalFault` when any element is NaN or infinite.
pub fn ensure_finite<B: Backend, const D: usize>(tensor: &Tensor<B, D>, context: &str) -> Result<()> {
    if to_vec(tensor.clone()).iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(DiffusionError::NumericalFault {
            context: context.to_string(),
        })
    }
}

pub fn ensure_dims<B: Backend, const D: usize>(tensor: &Tensor<B, D>, expected: [usize; D], context: &str) -> Result<()> {
    let found = tensor.dims();
    if found == expected {
        Ok(())
    } else {
        Err(DiffusionError::shape_mismatch(context, &expected, &found))
    }
}

/// Seeded gaussian source used for every stochastic draw of a run.
#[derive(Debug, Clone)]
pub struct NoiseGenerator {
    seed: u64,
    rng: StdRng,
}

impl NoiseGenerator {
    pub fn new(seed: Option<u64>) -> Self {
        let seed = seed.unwrap_or_else(rand::random);
        Self {
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Standard normal draw using the Box-Muller transform.
    pub fn next_gaussian(&mut self) -> f64 {
        let u1: f64 = 1.0 - self.rng.gen::<f64>();
        let u2: f64 = self.rng.gen::<f64>();
        let value = (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos();

        if value.is_finite() {
            value
        } else {
            0.0
        }
    }

    pub fn next_uniform(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    pub fn gaussian_values(&mut self, count: usize, sigma: f64) -> Vec<f32> {
        (0..count).map(|_| (self.next_gaussian() * sigma) as f32).collect()
    }

    pub fn sample<B: Backend, const D: usize>(&mut self, dims: [usize; D], sigma: f64, device: &B::Device) -> Tensor<B, D> {
        let count = dims.iter().product();
        from_vec(self.gaussian_values(count, sigma), dims, device)
    }
}

/// Rescales so that the tensor spans [0, 1]. Constant tensors map to zero.
pub fn normalize_min_max<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Tensor<B, D> {
    let min = tensor.clone().min().into_scalar();
    let max = tensor.clone().max().into_scalar();
    let min = min.to_f64().unwrap_or(0.0);
    let max = max.to_f64().unwrap_or(0.0);

    let range = max - min;
    if range <= f64::EPSILON {
        return Tensor::zeros(tensor.dims(), &tensor.device());
    }

    tensor.sub_scalar(min).div_scalar(range)
}

/// [-1, 1] to [0, 1], clamped.
pub fn to_unit_range<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Tensor<B, D> {
    (tensor * 0.5 + 0.5).clamp(0.0, 1.0)
}

/// [0, 1] to [-1, 1].
pub fn to_signed_range<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Tensor<B, D> {
    tensor * 2.0 - 1.0
}

pub fn split_batch<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<Tensor<B, D>> {
    let dims = tensor.dims();
    (0..dims[0])
        .map(|i| {
            let mut ranges = dims.map(|d| 0..d);
            ranges[0] = i..i + 1;
            tensor.clone().slice(ranges)
        })
        .collect()
}

/// Concatenates `times` copies along the batch axis.
pub fn repeat_batch<B: Backend, const D: usize>(tensor: Tensor<B, D>, times: usize) -> Tensor<B, D> {
    if times <= 1 {
        return tensor;
    }
    Tensor::cat(vec![tensor; times], 0)
}

/// Nearest-neighbour resize of an NCHW tensor.
pub fn resize_nearest<B: Backend>(tensor: Tensor<B, 4>, height: usize, width: usize) -> Tensor<B, 4> {
    let [n, c, h, w] = tensor.dims();
    if h == height && w == width {
        return tensor;
    }

    let device = tensor.device();
    let values = to_vec(tensor);
    let mut resized = Vec::with_capacity(n * c * height * width);

    for plane in values.chunks(h * w) {
        for y in 0..height {
            let sy = (y * h / height).min(h - 1);
            for x in 0..width {
                let sx = (x * w / width).min(w - 1);
                resized.push(plane[sy * w + sx]);
            }
        }
    }

    from_vec(resized, [n, c, height, width], &device)
}

/// Applies a per-pixel linear map across channels: `out[o] = sum_c in[c] * weights[c][o] + bias[o]`.
pub fn channel_projection<B: Backend>(tensor: Tensor<B, 4>, weights: &[Vec<f64>], bias: &[f64]) -> Result<Tensor<B, 4>> {
    let [n, c, h, w] = tensor.dims();
    let out = bias.len();

    if weights.len() != c || weights.iter().any(|row| row.len() != out) {
        return Err(DiffusionError::shape_mismatch(
            "channel projection weights",
            &[c, out],
            &[weights.len(), weights.first().map(|r| r.len()).unwrap_or(0)],
        ));
    }

    let device = tensor.device();
    let flat: Vec<f64> = weights.iter().flatten().copied().collect();
    let weights = from_f64::<B, 3>(&flat, [1, c, out], &device);
    let weights = repeat_batch(weights, n);
    let bias = from_f64::<B, 4>(bias, [1, out, 1, 1], &device);

    let projected = tensor
        .reshape([n, c, h * w])
        .swap_dims(1, 2)
        .matmul(weights)
        .swap_dims(1, 2)
        .reshape([n, out, h, w]);

    Ok(projected + bias)
}
