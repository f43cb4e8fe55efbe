use std::sync::atomic::{AtomicUsize, Ordering};

use burn::tensor::{backend::Backend, Tensor};

use super::{Denoiser, DenoiserInput};
use crate::error::{DiffusionError, Result};
use crate::schedule::NoiseSchedule;
use crate::tensor::repeat_batch;

/// What the oracle's output stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OracleTarget {
    /// Epsilon under an alpha-cumprod schedule; also exact for sigma samplers fed scaled inputs.
    Noise,
    /// Rectified-flow velocity `noise - x0` with `sigma = t / train_timesteps`.
    Velocity,
    /// Velocity pointing from the input toward the data, `(x0 - x) / sigma`.
    Drift,
}

/// Analytic denoiser that knows the clean latent and returns the prediction that steers any
/// noisy input straight toward it.
#[derive(Debug)]
pub struct OracleDenoiser<B: Backend> {
    target: Tensor<B, 4>,
    schedule: NoiseSchedule,
    kind: OracleTarget,
    calls: AtomicUsize,
}

impl<B: Backend> OracleDenoiser<B> {
    pub fn new(target: Tensor<B, 4>, schedule: NoiseSchedule, kind: OracleTarget) -> Self {
        Self {
            target,
            schedule,
            kind,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl<B: Backend> Denoiser<B> for OracleDenoiser<B> {
    fn infer(&self, input: DenoiserInput<B>) -> Result<Tensor<B, 4>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let [batch, channels, height, width] = input.latent.dims();
        let [_, target_channels, target_height, target_width] = self.target.dims();
        if [channels, height, width] != [target_channels, target_height, target_width] {
            return Err(DiffusionError::shape_mismatch(
                "oracle latent",
                &[batch, target_channels, target_height, target_width],
                &[batch, channels, height, width],
            ));
        }

        let target = repeat_batch(self.target.clone(), batch);
        let train = self.schedule.train_timesteps() as f64;

        match self.kind {
            OracleTarget::Noise => {
                let t = (input.timestep.round().max(0.0) as usize).min(self.schedule.train_timesteps() - 1);
                let alpha = self.schedule.alpha_cumprod(t);
                Ok((input.latent - target * alpha.sqrt()).div_scalar((1.0 - alpha).sqrt()))
            }
            OracleTarget::Velocity => {
                let sigma = (input.timestep / train).clamp(1e-4, 1.0);
                Ok((input.latent - target).div_scalar(sigma))
            }
            OracleTarget::Drift => {
                let sigma = (input.timestep / train).clamp(1e-4, 1.0);
                Ok((target - input.latent).div_scalar(sigma))
            }
        }
    }
}
