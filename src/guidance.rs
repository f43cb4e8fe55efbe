use burn::tensor::{backend::Backend, Tensor};

use crate::error::{DiffusionError, Result};

/// Classifier-free guidance: `uncond + scale * (cond - uncond)`.
pub fn combine<B: Backend, const D: usize>(conditional: Tensor<B, D>, unconditional: Tensor<B, D>, scale: f64) -> Tensor<B, D> {
    if scale == 0.0 {
        return unconditional;
    }
    if scale == 1.0 {
        return conditional;
    }

    unconditional.clone() + (conditional - unconditional) * scale
}

/// A zero or negative scale turns guidance off.
pub fn guidance_enabled(scale: f64) -> bool {
    scale > 0.0
}

/// Splits a batch-doubled prediction laid out `[unconditional; conditional]`.
pub fn split_guidance<B: Backend, const D: usize>(prediction: Tensor<B, D>) -> Result<(Tensor<B, D>, Tensor<B, D>)> {
    let dims = prediction.dims();
    let batch = dims[0];

    if batch % 2 != 0 {
        let mut expected = dims;
        expected[0] = batch + 1;
        return Err(DiffusionError::shape_mismatch("guidance batch", &expected, &dims));
    }

    let half = batch / 2;
    let unconditional = prediction.clone().slice([0..half]);
    let conditional = prediction.slice([half..batch]);

    Ok((conditional, unconditional))
}

/// Runs guidance on a batch-doubled prediction.
pub fn apply_batched<B: Backend, const D: usize>(prediction: Tensor<B, D>, scale: f64) -> Result<Tensor<B, D>> {
    let (conditional, unconditional) = split_guidance(prediction)?;
    Ok(combine(conditional, unconditional, scale))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{from_vec, to_vec};
    use crate::testing::{assert_approx_eq, TestBackend, DEVICE};

    fn pair() -> (Tensor<TestBackend, 4>, Tensor<TestBackend, 4>) {
        let cond = from_vec(vec![1.0, 2.0, 3.0, 4.0], [1, 1, 2, 2], &DEVICE);
        let uncond = from_vec(vec![0.5, -1.0, 3.0, 0.0], [1, 1, 2, 2], &DEVICE);
        (cond, uncond)
    }

    #[test]
    fn unit_and_zero_scales_are_exact() {
        let (cond, uncond) = pair();

        assert_eq!(to_vec(combine(cond.clone(), uncond.clone(), 0.0)), to_vec(uncond.clone()));
        assert_eq!(to_vec(combine(cond.clone(), uncond, 1.0)), to_vec(cond));
    }

    #[test]
    fn scale_extrapolates_away_from_unconditional() {
        let (cond, uncond) = pair();
        let guided = combine(cond, uncond, 7.5);

        assert_approx_eq(&to_vec(guided), &[4.25, 21.5, 3.0, 30.0], 1e-5);
    }

    #[test]
    fn batched_split_puts_unconditional_first() {
        let (cond, uncond) = pair();
        let batched = Tensor::cat(vec![uncond.clone(), cond.clone()], 0);

        let (c, u) = split_guidance(batched.clone()).unwrap();
        assert_eq!(to_vec(c), to_vec(cond.clone()));
        assert_eq!(to_vec(u), to_vec(uncond.clone()));

        let guided = apply_batched(batched, 2.0).unwrap();
        assert_approx_eq(&to_vec(guided), &to_vec(combine(cond, uncond, 2.0)), 1e-6);
    }

    #[test]
    fn odd_batches_are_rejected() {
        let (cond, _) = pair();
        assert!(matches!(split_guidance(cond), Err(DiffusionError::ShapeMismatch { .. })));
        assert!(!guidance_enabled(0.0));
        assert!(!guidance_enabled(-1.0));
        assert!(guidance_enabled(1.5));
    }
}
